//! Per-source refclock filter: turns a stream of raw offset samples (either
//! plain timestamped samples, or PPS pulse edges) into a single estimated
//! offset/dispersion pair at each poll (spec §4.4).
//!
//! Sample acquisition is behind the [`RefclockDriver`] trait; this module
//! owns only the [`MedianFilter`]-fed selection and estimation pipeline,
//! generalized from the teacher's single UDP-polled `NtpClient` in
//! `ntp.rs` to an arbitrary number of driver-backed sources.

use std::collections::VecDeque;

use crate::regress::{robust_regression, runs_test_passes, weighted_regression};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RefclockError {
    #[error("sample timestamp does not advance monotonically")]
    NotMonotonic,
    #[error("sample is too old for its poll interval")]
    TooOld,
    #[error("pulse rejected: {0}")]
    PulseRejected(&'static str),
    #[error("not enough samples to estimate an offset")]
    NotEnoughSamples,
}

#[derive(Debug, Clone, Copy)]
pub struct FilterSample {
    pub t: f64,
    pub offset: f64,
    pub dispersion: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Estimate {
    pub offset: f64,
    pub dispersion: f64,
    pub variance: f64,
    pub dof: usize,
}

/// A raw sample as handed to a source by its driver, before filtering.
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    pub t: f64,
    pub offset: f64,
    pub dispersion: f64,
}

/// Abstraction over a hardware/software refclock's sample source (spec's
/// framing of SHM/SOCK/PPS/PHC drivers as external collaborators; only a
/// deterministic test driver and a software-PPS-style driver are shipped).
pub trait RefclockDriver {
    fn poll(&mut self) -> Option<RawSample>;
}

/// Fixed queue of pre-recorded samples, for deterministic tests.
#[derive(Debug, Default)]
pub struct TestDriver {
    queue: VecDeque<RawSample>,
}

impl TestDriver {
    pub fn new(samples: impl IntoIterator<Item = RawSample>) -> Self {
        Self {
            queue: samples.into_iter().collect(),
        }
    }
}

impl RefclockDriver for TestDriver {
    fn poll(&mut self) -> Option<RawSample> {
        self.queue.pop_front()
    }
}

/// A software PPS-style source: yields pulses at a fixed rate with a
/// deterministic jitter sequence (no real GPIO/kernel PPS API involved).
#[derive(Debug)]
pub struct SoftwarePpsDriver {
    rate_hz: f64,
    next_t: f64,
    jitter: VecDeque<f64>,
}

impl SoftwarePpsDriver {
    pub fn new(rate_hz: f64, start_t: f64, jitter: impl IntoIterator<Item = f64>) -> Self {
        Self {
            rate_hz,
            next_t: start_t,
            jitter: jitter.into_iter().collect(),
        }
    }
}

impl RefclockDriver for SoftwarePpsDriver {
    fn poll(&mut self) -> Option<RawSample> {
        let jitter = self.jitter.pop_front()?;
        let t = self.next_t;
        self.next_t += 1.0 / self.rate_hz;
        Some(RawSample {
            t,
            offset: jitter,
            dispersion: 1.0 / self.rate_hz / 1000.0,
        })
    }
}

/// The per-source median filter and estimation state (spec's
/// `MedianFilter`/`SourceStats` pairing).
pub struct RefclockSource {
    capacity: usize,
    samples: VecDeque<FilterSample>,
    last_t: Option<f64>,
    avg_var: f64,
    avg_var_n: u32,
    max_var: f64,
}

impl RefclockSource {
    pub fn new(capacity: usize, max_var: f64) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            last_t: None,
            avg_var: 0.0,
            avg_var_n: 0,
            max_var,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn push(&mut self, sample: FilterSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.last_t = Some(sample.t);
    }

    /// Validate and record a plain timestamped sample. `cooked_age` is how
    /// old the sample already was when it reached us; `poll` is the
    /// source's poll exponent, bounding the maximum allowed age at
    /// `2^(poll+1)`.
    pub fn add_sample(
        &mut self,
        t: f64,
        cooked_age: f64,
        offset: f64,
        dispersion: f64,
        poll: i8,
    ) -> Result<(), RefclockError> {
        if let Some(last) = self.last_t {
            if t <= last {
                return Err(RefclockError::NotMonotonic);
            }
        }
        if cooked_age > 2f64.powi(poll as i32 + 1) {
            return Err(RefclockError::TooOld);
        }
        self.push(FilterSample { t, offset, dispersion });
        Ok(())
    }

    /// Validate and record a PPS pulse edge. `locked_ref` is `Some((offset,
    /// dispersion))` when this source is locked to another reference
    /// refclock; otherwise the system clock must already be synchronised.
    #[allow(clippy::too_many_arguments)]
    pub fn add_pulse(
        &mut self,
        t: f64,
        raw_offset: f64,
        rate_hz: f64,
        pulse_width: f64,
        dispersion: f64,
        locked_ref: Option<(f64, f64)>,
        system_synchronised: bool,
        distance: f64,
    ) -> Result<(), RefclockError> {
        if let Some(last) = self.last_t {
            if t <= last {
                return Err(RefclockError::NotMonotonic);
            }
        }

        let period = 1.0 / rate_hz;
        // Round into [-period/2, period/2).
        let mut offset = raw_offset - (raw_offset / period).round() * period;
        if offset >= period / 2.0 {
            offset -= period;
        }

        if let Some((ref_offset, ref_disp)) = locked_ref {
            // Adjust by a whole number of pulse periods toward the
            // reference's offset.
            let periods = ((offset - ref_offset) / period).round();
            let adjusted = offset - periods * period;
            let d_offset = (adjusted - ref_offset).abs();
            if d_offset + ref_disp + dispersion >= 0.2 * period {
                return Err(RefclockError::PulseRejected("locked-reference offset diverges"));
            }
            offset = adjusted;
        } else {
            if !system_synchronised {
                return Err(RefclockError::PulseRejected("system clock not synchronised"));
            }
            if distance >= 0.5 * period {
                return Err(RefclockError::PulseRejected("distance exceeds half the pulse period"));
            }
        }

        let max_err = pulse_width.min(period - pulse_width) / 2.0;
        if offset.abs() > max_err || distance > max_err {
            return Err(RefclockError::PulseRejected("pulse edge outside sanity window"));
        }

        self.push(FilterSample { t, offset, dispersion });
        Ok(())
    }

    /// Sample-selection algorithm (spec §4.4 "Sample selection").
    fn select_samples(&self) -> Result<Vec<FilterSample>, RefclockError> {
        let n = self.samples.len();
        if n < 4 {
            return Err(RefclockError::NotEnoughSamples);
        }

        let mut indexed: Vec<FilterSample> = self.samples.iter().copied().collect();
        if n > 4 {
            let min_disp = indexed.iter().map(|s| s.dispersion).fold(f64::INFINITY, f64::min);
            let survivors: Vec<FilterSample> = indexed
                .iter()
                .copied()
                .filter(|s| s.dispersion <= 1.5 * min_disp)
                .collect();
            if survivors.len() >= 4 {
                indexed = survivors;
            }
        }

        indexed.sort_by(|a, b| a.offset.partial_cmp(&b.offset).unwrap());
        let total = indexed.len();
        let trim = if total > 2 { (total / 5).max(1) } else { 0 };
        let kept: Vec<FilterSample> = indexed
            .into_iter()
            .skip(trim)
            .take(total.saturating_sub(2 * trim))
            .collect();

        let mut kept = kept;
        kept.sort_by(|a, b| a.t.partial_cmp(&b.t).unwrap());
        if kept.is_empty() {
            return Err(RefclockError::NotEnoughSamples);
        }
        Ok(kept)
    }

    /// Mean value of degrees-of-freedom's chi-squared distribution,
    /// approximated as its expectation (`dof`). Used only to decide whether
    /// the current poll's variance estimate should shrink the reported
    /// dispersion toward the long-run average.
    fn chi2_coef(dof: usize) -> f64 {
        dof.max(1) as f64
    }

    /// Estimate the offset/dispersion for the samples currently held,
    /// running the runs-of-sign test and dropping the oldest sample on
    /// failure (spec §4.4 "Runs-of-sign test").
    pub fn estimate(&mut self) -> Result<Estimate, RefclockError> {
        if self.samples.len() == 1 {
            let s = self.samples[0];
            return Ok(Estimate {
                offset: s.offset,
                dispersion: self.avg_var.sqrt().max(s.dispersion),
                variance: self.avg_var.max(1e-20),
                dof: 0,
            });
        }
        if self.samples.len() < 4 {
            let n = self.samples.len();
            let mean: f64 = self.samples.iter().map(|s| s.offset).sum::<f64>() / n as f64;
            let var: f64 = if n > 1 {
                self.samples.iter().map(|s| (s.offset - mean).powi(2)).sum::<f64>() / (n - 1) as f64
            } else {
                self.avg_var
            };
            let dof = n - 1;
            let var = var.max(1e-20);
            let mean_disp = self.samples.iter().map(|s| s.dispersion).sum::<f64>() / n as f64;
            self.update_avg_var(var, dof as u32);
            return Ok(Estimate {
                offset: mean,
                dispersion: var.sqrt().max(mean_disp),
                variance: var,
                dof,
            });
        }

        loop {
            let selected = self.select_samples()?;
            let n = selected.len();
            if n < 3 {
                // Dropped below regressable size during retries; fall back
                // to a mean estimate over what remains.
                let mean: f64 = selected.iter().map(|s| s.offset).sum::<f64>() / n as f64;
                return Ok(Estimate {
                    offset: mean,
                    dispersion: self.avg_var.sqrt(),
                    variance: self.avg_var.max(1e-20),
                    dof: n.saturating_sub(1),
                });
            }

            let t0 = selected[0].t;
            let x: Vec<f64> = selected.iter().map(|s| s.t - t0).collect();
            let y: Vec<f64> = selected.iter().map(|s| s.offset).collect();
            let w: Vec<f64> = selected.iter().map(|s| s.dispersion.max(1e-12).powi(2)).collect();

            let fit = weighted_regression(&x, &y, &w).map_err(|_| RefclockError::NotEnoughSamples)?;
            let (a, b) = robust_regression(&x, &y, fit);
            let residuals: Vec<f64> = x.iter().zip(&y).map(|(xi, yi)| yi - a - b * xi).collect();

            if !runs_test_passes(&residuals) && self.samples.len() > 4 {
                self.samples.pop_front();
                continue;
            }

            let dof = n - 2;
            let var = fit.s2.max(1e-20);
            let mean_disp = selected.iter().map(|s| s.dispersion).sum::<f64>() / n as f64;
            let prev_avg_var = self.avg_var;
            self.update_avg_var(var, dof as u32);

            let mut dispersion = fit.sb0;
            if prev_avg_var > 0.0 && var * dof as f64 / Self::chi2_coef(dof) < prev_avg_var {
                dispersion = self.avg_var.sqrt() * dispersion / var.sqrt();
            }
            dispersion = dispersion.max(mean_disp);

            return Ok(Estimate {
                offset: fit.b0,
                dispersion,
                variance: var,
                dof,
            });
        }
    }

    fn update_avg_var(&mut self, var: f64, dof: u32) {
        let var = var.min(self.max_var);
        let dof = dof.max(1);
        if self.avg_var_n == 0 {
            self.avg_var = var;
            self.avg_var_n = dof;
            return;
        }
        if self.avg_var_n > 50 {
            let alpha = dof as f64 / (dof as f64 + 50.0);
            self.avg_var = self.avg_var * (1.0 - alpha) + var * alpha;
        } else {
            let total = self.avg_var_n + dof;
            self.avg_var = (self.avg_var * self.avg_var_n as f64 + var * dof as f64) / total as f64;
            self.avg_var_n = total;
        }
    }
}

/// Pull samples from a driver into a source until the driver is exhausted.
pub fn drain_driver(source: &mut RefclockSource, driver: &mut dyn RefclockDriver, poll: i8) {
    while let Some(raw) = driver.poll() {
        let _ = source.add_sample(raw.t, 0.0, raw.offset, raw.dispersion, poll);
    }
}
