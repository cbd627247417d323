//! Wires a [`Reference`] + [`Lcl`] pair to a set of refclock-driver-backed
//! sources, polling each one and feeding the best current estimate into
//! `Reference::set_reference` (spec §5 "single-threaded cooperative"
//! scheduling model, simplified to a plain poll loop: the outer NTP packet
//! exchange and the cross-source Marzullo-style selection algorithm are
//! external collaborators this crate does not implement).

use crate::clockback::ClockBackend;
use crate::reference::{Reference, ReferenceError};
use crate::refclock::{drain_driver, RefclockDriver, RefclockError, RefclockSource};
use crate::regress::SourceStats;
use crate::time::{IpAddr, Timestamp};

/// One configured source: its driver, the per-poll refclock filter, and the
/// cross-poll statistics regression that turns a run of filtered offsets
/// into a frequency/skew estimate.
pub struct Source {
    pub name: String,
    pub ref_id: u32,
    pub stratum: u8,
    pub poll: i8,
    driver: Box<dyn RefclockDriver + Send + Sync>,
    filter: RefclockSource,
    stats: SourceStats,
    reach: u8,
    last_offset: f64,
    last_dispersion: f64,
}

impl Source {
    pub fn new(
        name: impl Into<String>,
        ref_id: u32,
        stratum: u8,
        poll: i8,
        driver: Box<dyn RefclockDriver + Send + Sync>,
    ) -> Self {
        Self {
            name: name.into(),
            ref_id,
            stratum,
            poll,
            driver,
            filter: RefclockSource::new(64, 16.0),
            stats: SourceStats::new(),
            reach: 0,
            last_offset: 0.0,
            last_dispersion: 0.0,
        }
    }

    pub fn reach(&self) -> u8 {
        self.reach
    }

    pub fn last_offset(&self) -> f64 {
        self.last_offset
    }

    pub fn last_dispersion(&self) -> f64 {
        self.last_dispersion
    }

    /// Drain whatever samples the driver has ready, re-estimate the filter,
    /// and if that succeeds push the result into this source's long-run
    /// statistics. Returns the filter's per-poll estimate, if any.
    fn poll_once(&mut self, now: f64) -> Option<crate::refclock::Estimate> {
        drain_driver(&mut self.filter, self.driver.as_mut(), self.poll);
        match self.filter.estimate() {
            Ok(est) => {
                self.reach = (self.reach << 1) | 1;
                self.last_offset = est.offset;
                self.last_dispersion = est.dispersion;
                self.stats.add_sample(now, est.offset, est.dispersion);
                Some(est)
            }
            Err(RefclockError::NotEnoughSamples) => {
                self.reach <<= 1;
                None
            }
            Err(_) => {
                self.reach <<= 1;
                None
            }
        }
    }
}

/// Owns the disciplined clock plus every configured source, and drives one
/// poll cycle across all of them (spec's "reference update" path: filter ->
/// source stats -> `Reference::set_reference`).
pub struct Scheduler<B: ClockBackend> {
    reference: Reference<B>,
    sources: Vec<Source>,
}

impl<B: ClockBackend> Scheduler<B> {
    pub fn new(reference: Reference<B>) -> Self {
        Self {
            reference,
            sources: Vec::new(),
        }
    }

    pub fn reference(&self) -> &Reference<B> {
        &self.reference
    }

    pub fn reference_mut(&mut self) -> &mut Reference<B> {
        &mut self.reference
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn add_source(&mut self, source: Source) {
        self.sources.push(source);
    }

    /// Poll every source, then feed the lowest-dispersion source with a full
    /// (>= 3 point) statistics regression into the reference. Sources that
    /// only ever produce a bare offset (fewer than 3 polls so far) are
    /// tracked but never selected, matching the spec's requirement that a
    /// frequency/skew estimate come from regression, not a single sample.
    pub fn poll_all(&mut self, now: Timestamp) -> Result<bool, ReferenceError> {
        let now_f = now.to_secs_f64();
        let mut best: Option<(usize, f64, crate::regress::SourceEstimate)> = None;

        for (idx, source) in self.sources.iter_mut().enumerate() {
            let Some(filter_est) = source.poll_once(now_f) else {
                continue;
            };
            let Some(stats_est) = source.stats.estimate() else {
                continue;
            };
            let dispersion = filter_est.dispersion;
            if best.as_ref().map(|(_, d, _)| dispersion < *d).unwrap_or(true) {
                best = Some((idx, dispersion, stats_est));
            }
        }

        let Some((idx, dispersion, est)) = best else {
            return Ok(false);
        };
        let source = &self.sources[idx];
        self.reference.set_reference(
            source.stratum,
            0,
            source.ref_id,
            now,
            est.offset,
            est.frequency_ppm,
            est.skew_ppm.max(1e-9),
            0.0,
            dispersion,
        )?;
        Ok(true)
    }
}

/// Derive a four-byte reference id for a configured source: remote
/// addresses use the standard IPv4/IPv6 derivation; anything else (a
/// refclock driver name) is hashed the same way IPv6 addresses are, so
/// distinct driver names still produce distinct, stable ids.
pub fn ref_id_for_name(name: &str) -> u32 {
    if let Ok(addr) = name.parse::<std::net::Ipv4Addr>() {
        u32::from_be_bytes(IpAddr::Inet4(u32::from_be_bytes(addr.octets())).refid())
    } else if let Ok(addr) = name.parse::<std::net::Ipv6Addr>() {
        u32::from_be_bytes(IpAddr::Inet6(addr.octets()).refid())
    } else {
        let digest = md5::compute(name.as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clockback::MiniClockBackend;
    use crate::lcl::Lcl;
    use crate::refclock::{RawSample, SoftwarePpsDriver};

    fn driver(rate_hz: f64, n: usize) -> SoftwarePpsDriver {
        SoftwarePpsDriver::new(rate_hz, 0.0, std::iter::repeat_n(0.0005, n))
    }

    #[test]
    fn poll_all_ignores_sources_below_three_points() {
        let lcl = Lcl::new(MiniClockBackend::default());
        let reference = Reference::new(lcl, 1000.0);
        let mut sched = Scheduler::new(reference);
        sched.add_source(Source::new(
            "pps0",
            ref_id_for_name("pps0"),
            0,
            4,
            Box::new(driver(1.0, 1)),
        ));
        let ok = sched.poll_all(Timestamp::new(100, 0)).unwrap();
        assert!(!ok);
    }

    #[test]
    fn poll_all_selects_best_source_and_updates_reference() {
        let lcl = Lcl::new(MiniClockBackend::default());
        let reference = Reference::new(lcl, 1000.0);
        let mut sched = Scheduler::new(reference);
        sched.add_source(Source::new(
            "test",
            ref_id_for_name("test"),
            1,
            6,
            Box::new(crate::refclock::TestDriver::new((0..8).map(|i| RawSample {
                t: i as f64,
                offset: 0.001 + 0.0001 * i as f64,
                dispersion: 5e-5,
            }))),
        ));

        let mut now = Timestamp::new(0, 0);
        let mut updated = false;
        for _ in 0..8 {
            if sched.poll_all(now).unwrap() {
                updated = true;
            }
            now = now.add_seconds(1.0);
        }
        assert!(updated);
        let params = sched.reference().get_reference_params(now);
        assert!(params.is_synchronised);
        assert_eq!(params.stratum, 2);
    }

    #[test]
    fn ref_id_for_ipv4_matches_address_bytes() {
        assert_eq!(ref_id_for_name("1.2.3.4"), 0x01020304);
    }
}
