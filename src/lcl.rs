//! Local clock discipline (LCL): absolute frequency bookkeeping, slewing vs.
//! stepping, temperature compensation, and the observer chain that other
//! modules use to learn about steps and frequency changes (spec §4.1).
//!
//! The actual syscalls that read/steer the hardware clock are behind the
//! [`crate::clockback::ClockBackend`] trait; this module only holds the
//! daemon's notion of "what frequency do we think the clock is running at".

use crate::clockback::{ClockBackend, LeapStatus};
use crate::time::Timestamp;

/// Number of calibration samples taken to estimate the backend's reporting
/// precision (spec §4.1 "Precision calibration").
const PRECISION_NITERS: usize = 100;

/// Floor on the precision quantum's log2 exponent: the calibration loop
/// never reports a precision finer than `2^-30` seconds.
const MIN_PRECISION_LOG2: i32 = -30;

/// What kind of clock change a [`ClockObserver`] is being told about
/// (spec §4.1 `ChangeAdjust`/`ChangeStep`/`ChangeUnknownStep`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// A frequency/offset correction was accumulated through the normal
    /// discipline loop.
    Adjust,
    /// This module stepped the clock itself.
    Step,
    /// An outside actor (operator, another process) stepped the clock
    /// without going through this module.
    UnknownStep,
}

/// Observers are notified whenever the disciplined clock steps or its
/// frequency estimate changes, so that other modules (the reference engine,
/// refclock filters) can invalidate data collected before the step.
pub trait ClockObserver: std::fmt::Debug {
    fn on_step(&mut self, before: Timestamp, after: Timestamp, change: ChangeType);
    fn on_frequency_change(&mut self, raw_now: Timestamp, cooked_now: Timestamp, dfreq_achieved: f64, doffset: f64);
}

#[derive(Debug, thiserror::Error)]
pub enum LclError {
    #[error("observer already registered")]
    AlreadyRegistered,
    #[error("observer not registered")]
    NotRegistered,
    #[error("clock backend error: {0}")]
    Backend(#[from] crate::clockback::ClockBackendError),
}

/// The daemon's model of the local clock: an absolute frequency estimate
/// (ppm, positive means the clock runs fast), the backend used to apply
/// corrections, an optional temperature compensation table, and a chain of
/// observers.
pub struct Lcl<B: ClockBackend> {
    backend: B,
    /// Absolute frequency error in parts-per-million, maintained independent
    /// of the backend's own (possibly stale) frequency register. This is
    /// always the *uncompensated* value; observers and the drift file only
    /// ever see this one.
    abs_freq_ppm: f64,
    /// Current temperature-compensation term (`T` in spec §4.1's
    /// `comp = uncomp * (1 - 10^-6*T) - T`), set via [`Lcl::set_temp_comp`].
    temp_comp_ppm: f64,
    observers: Vec<Box<dyn ClockObserver + Send + Sync>>,
    precision_seconds: f64,
    precision_log2: i32,
}

impl<B: ClockBackend> Lcl<B> {
    pub fn new(backend: B) -> Self {
        let abs_freq_ppm = backend.read_frequency_ppm();
        Self {
            backend,
            abs_freq_ppm,
            temp_comp_ppm: 0.0,
            observers: Vec::new(),
            precision_seconds: 0.0,
            precision_log2: MIN_PRECISION_LOG2,
        }
    }

    pub fn abs_freq_ppm(&self) -> f64 {
        self.abs_freq_ppm
    }

    pub fn temp_comp_ppm(&self) -> f64 {
        self.temp_comp_ppm
    }

    /// Temperature-compensated frequency the back-end actually receives for
    /// a given uncompensated value (spec §4.1 conversion).
    fn compensate(&self, uncomp: f64) -> f64 {
        uncomp * (1.0 - 1.0e-6 * self.temp_comp_ppm) - self.temp_comp_ppm
    }

    /// Inverse of [`Lcl::compensate`]: recover the uncompensated frequency
    /// from a value the back-end reports it actually installed.
    fn uncompensate(&self, comp: f64) -> f64 {
        (comp + self.temp_comp_ppm) / (1.0 - 1.0e-6 * self.temp_comp_ppm)
    }

    /// Set-temp-comp: update the compensation term and immediately re-push
    /// the (re-)compensated current frequency to the back-end.
    pub fn set_temp_comp(&mut self, temp_comp_ppm: f64) -> Result<(), LclError> {
        self.temp_comp_ppm = temp_comp_ppm;
        let compensated = self.compensate(self.abs_freq_ppm);
        let rounded = self.backend.set_frequency_ppm(compensated)?;
        self.abs_freq_ppm = self.uncompensate(rounded);
        Ok(())
    }

    /// Set-absolute-frequency: override the absolute frequency directly
    /// (used at startup, or to apply a value loaded from the drift file)
    /// rather than accumulating a delta.
    pub fn set_absolute_frequency(&mut self, freq_ppm: f64) -> Result<(), LclError> {
        let compensated = self.compensate(freq_ppm);
        let rounded = self.backend.set_frequency_ppm(compensated)?;
        self.abs_freq_ppm = self.uncompensate(rounded);
        Ok(())
    }

    /// Set-sync-status: tell the back-end whether we currently consider
    /// ourselves synchronised.
    pub fn set_sync_status(&mut self, synced: bool) -> Result<(), LclError> {
        self.backend.set_sync_status(synced).map_err(Into::into)
    }

    /// Set-leap: announce a pending leap second to the back-end.
    pub fn set_leap(&mut self, status: LeapStatus) -> Result<(), LclError> {
        self.backend.set_leap(status).map_err(Into::into)
    }

    /// Read-cooked-time: the raw timestamp adjusted by whatever correction
    /// the back-end has not yet walked in.
    pub fn read_cooked_time(&self, raw_now: Timestamp) -> Timestamp {
        let (correction, _error_bound) = self.backend.offset_correction(raw_now);
        raw_now.add_seconds(correction)
    }

    pub fn register_observer(&mut self, observer: Box<dyn ClockObserver + Send + Sync>) {
        self.observers.push(observer);
    }

    /// Remove an observer chosen by predicate; panics (in test/debug builds)
    /// if none match, mirroring the upstream invariant that observer
    /// registration is always balanced.
    pub fn remove_observer(&mut self, mut matches: impl FnMut(&(dyn ClockObserver + Send + Sync)) -> bool) {
        if let Some(pos) = self.observers.iter().position(|o| matches(o.as_ref())) {
            self.observers.remove(pos);
        } else {
            debug_assert!(false, "remove_observer: no matching observer registered");
        }
    }

    /// AccumulateFrequencyAndOffset(dfreq, doffset): fold a gradient `dfreq`
    /// of the offset-versus-local-time function into the absolute frequency
    /// (`f' = f + dfreq*(10^6 - f)`, spec §4.1), push the temperature-
    /// compensated result to the back-end, then notify observers with the
    /// achieved dfreq (derived from the back-end's rounded return value)
    /// and the one-shot offset.
    pub fn accumulate_frequency_and_offset(
        &mut self,
        dfreq: f64,
        offset_seconds: f64,
        raw_now: Timestamp,
    ) -> Result<(), LclError> {
        let prev_abs = self.abs_freq_ppm;
        let new_abs = prev_abs + dfreq * (1.0e6 - prev_abs);
        let compensated = self.compensate(new_abs);
        let rounded = self.backend.set_frequency_ppm(compensated)?;
        let achieved_abs = self.uncompensate(rounded);
        self.abs_freq_ppm = achieved_abs;

        let denom = 1.0e6 - prev_abs;
        let dfreq_achieved = if denom.abs() > f64::EPSILON {
            (achieved_abs - prev_abs) / denom
        } else {
            0.0
        };

        self.backend.accrue_offset(offset_seconds)?;

        let cooked_now = self.read_cooked_time(raw_now);
        for obs in &mut self.observers {
            obs.on_frequency_change(raw_now, cooked_now, dfreq_achieved, offset_seconds);
        }
        Ok(())
    }

    /// Step the clock by `offset_seconds` (positive = clock is behind, move
    /// forward). `before` must be the "cooked" time immediately prior to the
    /// step so observers can be told the exact before/after pair.
    pub fn apply_step_offset(&mut self, before: Timestamp, offset_seconds: f64) -> Result<(), LclError> {
        self.backend.apply_step_offset(offset_seconds)?;
        let after = before.add_seconds(offset_seconds);
        for obs in &mut self.observers {
            obs.on_step(before, after, ChangeType::Step);
        }
        Ok(())
    }

    /// Tell observers a time step happened externally (e.g. NTP step from
    /// another process, or a settimeofday by an operator) without this
    /// module having driven it.
    pub fn notify_external_time_step(&mut self, before: Timestamp, after: Timestamp) {
        for obs in &mut self.observers {
            obs.on_step(before, after, ChangeType::UnknownStep);
        }
    }

    pub fn precision_seconds(&self) -> f64 {
        self.precision_seconds
    }

    pub fn precision_log2(&self) -> i32 {
        self.precision_log2
    }

    /// Estimate the backend's clock-reading precision: sample back-to-back
    /// reads until `PRECISION_NITERS` strictly-positive increments are
    /// seen, record the minimum, then round down to the largest power of
    /// two not exceeding it (floored at `2^MIN_PRECISION_LOG2`), storing
    /// both the log2 exponent and the quantum (spec §4.1 precision
    /// calibration).
    pub fn calibrate_precision(&mut self, mut now: impl FnMut() -> Timestamp) -> f64 {
        let mut min_delta = f64::INFINITY;
        for _ in 0..PRECISION_NITERS {
            let a = now();
            let mut b = now();
            while b == a {
                b = now();
            }
            let delta = b.diff_seconds(a);
            if delta < min_delta {
                min_delta = delta;
            }
        }
        let log2 = (min_delta.log2().floor() as i32).max(MIN_PRECISION_LOG2);
        let quantum = 2f64.powi(log2);
        self.precision_log2 = log2;
        self.precision_seconds = quantum;
        quantum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clockback::MiniClockBackend;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct RecordingObserver {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ClockObserver for RecordingObserver {
        fn on_step(&mut self, before: Timestamp, after: Timestamp, change: ChangeType) {
            self.log
                .lock()
                .unwrap()
                .push(format!("step {:?} -> {:?} ({:?})", before, after, change));
        }

        fn on_frequency_change(&mut self, raw_now: Timestamp, cooked_now: Timestamp, dfreq_achieved: f64, doffset: f64) {
            self.log.lock().unwrap().push(format!(
                "freq raw={:?} cooked={:?} dfreq={dfreq_achieved} doffset={doffset}",
                raw_now, cooked_now
            ));
        }
    }

    #[test]
    fn temp_comp_matches_documented_conversion() {
        let mut lcl = Lcl::new(MiniClockBackend::default());
        lcl.set_temp_comp(1000.0).unwrap(); // T = 1000 ppm
        lcl.set_absolute_frequency(2.0).unwrap();

        // comp = uncomp*(1 - 1e-6*T) - T
        let expected_comp = 2.0 * (1.0 - 1.0e-6 * 1000.0) - 1000.0;
        assert_eq!(lcl.backend.read_frequency_ppm(), expected_comp);
        // round-tripping through compensate/uncompensate recovers the input.
        assert!((lcl.abs_freq_ppm() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn accumulate_frequency_applies_quadratic_coupling() {
        let mut lcl = Lcl::new(MiniClockBackend::default());
        // dfreq = 1.5e-6 against f = 0 => f' = 0 + 1.5e-6*(1e6 - 0) = 1.5
        lcl.accumulate_frequency_and_offset(1.5e-6, 0.0, Timestamp::new(1000, 0)).unwrap();
        assert!((lcl.abs_freq_ppm() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn accumulate_frequency_notifies_observers_with_achieved_dfreq() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lcl = Lcl::new(MiniClockBackend::default());
        lcl.register_observer(Box::new(RecordingObserver { log: log.clone() }));

        lcl.accumulate_frequency_and_offset(1.5e-6, 0.25, Timestamp::new(1000, 0)).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
        let entry = log.lock().unwrap()[0].clone();
        assert!(entry.contains("doffset=0.25"));
        assert!(entry.contains("dfreq=0.0000015") || entry.contains("dfreq=1.5"));
    }

    #[test]
    fn apply_step_offset_notifies_with_before_after() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lcl = Lcl::new(MiniClockBackend::default());
        lcl.register_observer(Box::new(RecordingObserver { log: log.clone() }));

        let before = Timestamp::new(1000, 0);
        lcl.apply_step_offset(before, 0.25).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(log.lock().unwrap()[0].contains("Step"));
    }

    #[test]
    fn notify_external_time_step_uses_unknown_step_change_type() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lcl = Lcl::new(MiniClockBackend::default());
        lcl.register_observer(Box::new(RecordingObserver { log: log.clone() }));

        lcl.notify_external_time_step(Timestamp::new(1000, 0), Timestamp::new(1001, 0));
        assert!(log.lock().unwrap()[0].contains("UnknownStep"));
    }

    #[test]
    #[should_panic]
    fn remove_observer_panics_when_absent() {
        let mut lcl = Lcl::new(MiniClockBackend::default());
        lcl.remove_observer(|_| true);
    }

    #[test]
    fn calibrate_precision_rounds_down_to_a_power_of_two() {
        let mut lcl = Lcl::new(MiniClockBackend::default());
        let mut counter = 0i64;
        let precision = lcl.calibrate_precision(|| {
            counter += 1;
            Timestamp::new(0, (counter as u32) * 1000)
        });
        assert!(precision > 0.0);
        assert_eq!(lcl.precision_seconds(), precision);
        assert_eq!(2f64.powi(lcl.precision_log2()), precision);
        // power of two: log2 is an exact integer
        assert_eq!(precision.log2().fract(), 0.0);
    }

    #[test]
    fn read_cooked_time_applies_pending_offset_correction() {
        let lcl = Lcl::new(MiniClockBackend::default());
        let raw = Timestamp::new(1000, 0);
        // MiniClockBackend never reports a pending correction.
        assert_eq!(lcl.read_cooked_time(raw), raw);
    }
}
