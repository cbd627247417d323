//! The reference/tracking engine (REF, spec §4.3): turns a selected
//! source's `(offset, frequency, skew, root_delay, root_dispersion)` update
//! into LCL calls, persists the frequency/skew drift file, and answers
//! "what do we currently believe the time is" queries.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;

use crate::clockback::ClockBackend;
use crate::lcl::Lcl;
use crate::time::Timestamp;

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("skew is not finite")]
    NonFiniteSkew,
    #[error("drift file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lcl error: {0}")]
    Lcl(#[from] crate::lcl::LclError),
}

/// Four-byte reference identifier plus the local "we are running
/// unsynchronised / as a local stratum source" markers (spec §4.3).
pub const LOCAL_REF_ID: u32 = 0x7f7f_0101;

/// Precision quantum used as the local-stratum root dispersion, seconds.
const PRECISION_QUANTUM: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncState {
    Unsynchronised,
    /// We are acting as our own (local) reference at the given stratum.
    Local { stratum: u8 },
    Synchronised,
}

/// Everything the outer NTP/monitor layer needs to answer "what time is it
/// according to us" (spec §3 "Reference state").
#[derive(Debug, Clone, Copy)]
pub struct ReferenceParams {
    pub is_synchronised: bool,
    pub leap: u8,
    pub stratum: u8,
    pub ref_id: u32,
    pub ref_time: Timestamp,
    pub root_delay: f64,
    pub root_dispersion: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackingState {
    stratum: u8,
    leap: u8,
    ref_id: u32,
    ref_time: Timestamp,
    offset: f64,
    skew_ppm: f64,
    residual_freq_ppm: f64,
    root_delay: f64,
    root_dispersion: f64,
}

pub struct Reference<B: ClockBackend> {
    lcl: Lcl<B>,
    state: SyncState,
    tracking: TrackingState,
    max_update_skew_ppm: f64,
    log_change_threshold: f64,
    mail_change_threshold: f64,
    drift_file: Option<PathBuf>,
    tracking_log: Option<TrackingLog>,
}

impl<B: ClockBackend> Reference<B> {
    pub fn new(lcl: Lcl<B>, max_update_skew_ppm: f64) -> Self {
        Self {
            lcl,
            state: SyncState::Unsynchronised,
            tracking: TrackingState::default(),
            max_update_skew_ppm,
            log_change_threshold: 1.0,
            mail_change_threshold: f64::INFINITY,
            drift_file: None,
            tracking_log: None,
        }
    }

    pub fn with_drift_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.drift_file = Some(path.into());
        self
    }

    pub fn with_tracking_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.tracking_log = Some(TrackingLog::new(path.into()));
        self
    }

    pub fn set_thresholds(&mut self, log_change_threshold: f64, mail_change_threshold: f64) {
        self.log_change_threshold = log_change_threshold;
        self.mail_change_threshold = mail_change_threshold;
    }

    pub fn lcl(&self) -> &Lcl<B> {
        &self.lcl
    }

    pub fn lcl_mut(&mut self) -> &mut Lcl<B> {
        &mut self.lcl
    }

    /// Load the previous `freq_ppm skew_ppm` pair from the drift file, if
    /// one is configured and exists. Malformed contents are ignored and the
    /// defaults (0, 0) kept, per spec ("parse two doubles or warn").
    pub fn load_drift(&mut self) {
        let Some(path) = &self.drift_file else { return };
        let Ok(contents) = fs::read_to_string(path) else {
            return;
        };
        let mut fields = contents.split_whitespace();
        if let (Some(freq), Some(skew)) = (fields.next(), fields.next()) {
            if let (Ok(freq), Ok(skew)) = (freq.parse::<f64>(), skew.parse::<f64>()) {
                self.tracking.residual_freq_ppm = freq;
                self.tracking.skew_ppm = skew;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_reference(
        &mut self,
        stratum_in: u8,
        leap: u8,
        ref_id: u32,
        ref_time: Timestamp,
        offset: f64,
        frequency_ppm: f64,
        skew_ppm: f64,
        root_delay: f64,
        root_dispersion: f64,
    ) -> Result<(), ReferenceError> {
        // skew finiteness check exactly as spec describes: (skew+skew)/skew == 2
        let finite_check = (skew_ppm + skew_ppm) / skew_ppm;
        if !finite_check.is_finite() || (finite_check - 2.0).abs() >= 1e-9 {
            return Err(ReferenceError::NonFiniteSkew);
        }

        self.tracking.stratum = stratum_in.saturating_add(1);
        self.tracking.leap = leap;
        self.tracking.ref_id = ref_id;
        self.tracking.ref_time = ref_time;
        self.tracking.root_delay = root_delay;
        self.tracking.root_dispersion = root_dispersion;
        self.state = SyncState::Synchronised;

        let residual_freq_ppm;
        if skew_ppm.abs() < self.max_update_skew_ppm {
            // Weighted average of the previous (delta-)frequency, taken as
            // 0, and the new one; weights 1/skew_prev^2 and 3/skew_new^2.
            let prev_freq = 0.0_f64;
            let skew_prev = self.tracking.skew_ppm.max(1e-12);
            let w1 = 1.0 / skew_prev.powi(2);
            let w2 = 3.0 / skew_ppm.powi(2);
            let combined_freq = (prev_freq * w1 + frequency_ppm * w2) / (w1 + w2);
            let new_skew = ((prev_freq.powi(2) * w1 + frequency_ppm.powi(2) * w2) / (w1 + w2)).sqrt()
                + (skew_prev * w1 + skew_ppm * w2) / (w1 + w2);

            residual_freq_ppm = frequency_ppm - combined_freq;
            self.tracking.skew_ppm = new_skew;
            self.lcl.accumulate_frequency_and_offset(combined_freq, offset, ref_time)?;
        } else {
            residual_freq_ppm = frequency_ppm;
            self.lcl.accumulate_frequency_and_offset(0.0, offset, ref_time)?;
        }
        self.tracking.residual_freq_ppm = residual_freq_ppm;
        self.tracking.offset = offset;

        self.maybe_log_offset(offset);

        self.tracking.offset = 0.0;

        self.persist_drift()?;
        if let Some(log) = &mut self.tracking_log {
            log.write(&self.tracking)?;
        }

        Ok(())
    }

    fn maybe_log_offset(&self, offset: f64) {
        if offset.abs() > self.log_change_threshold {
            tracing::warn!(offset, "large clock offset applied");
        }
        if offset.abs() > self.mail_change_threshold {
            tracing::warn!(offset, "offset exceeds mail-change threshold (mailer not invoked: out of scope)");
        }
    }

    fn persist_drift(&self) -> Result<(), ReferenceError> {
        let Some(path) = &self.drift_file else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
            writeln!(
                file,
                "{:20.4} {:20.4}",
                self.tracking.residual_freq_ppm, self.tracking.skew_ppm
            )?;
        }
        if let Ok(meta) = fs::metadata(path) {
            let _ = std::os::unix::fs::chown(&tmp, Some(meta.uid()), Some(meta.gid()));
            let mut perms = fs::metadata(&tmp)?.permissions();
            perms.set_mode(meta.mode());
            fs::set_permissions(&tmp, perms)?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn set_unsynchronised(&mut self) {
        self.state = SyncState::Unsynchronised;
    }

    pub fn disable_local(&mut self) {
        if matches!(self.state, SyncState::Local { .. }) {
            self.state = SyncState::Unsynchronised;
        }
    }

    pub fn enable_local(&mut self, stratum: u8) {
        self.state = SyncState::Local { stratum };
        self.tracking.ref_id = LOCAL_REF_ID;
        self.tracking.root_delay = 0.0;
        self.tracking.root_dispersion = PRECISION_QUANTUM;
    }

    pub fn get_reference_params(&self, local_time: Timestamp) -> ReferenceParams {
        match self.state {
            SyncState::Unsynchronised => ReferenceParams {
                is_synchronised: false,
                leap: 3, // LEAP_NOTINSYNC
                stratum: 16,
                ref_id: 0,
                ref_time: Timestamp::ZERO,
                root_delay: 0.0,
                root_dispersion: 0.0,
            },
            SyncState::Local { stratum } => ReferenceParams {
                is_synchronised: true,
                leap: 0,
                stratum,
                ref_id: LOCAL_REF_ID,
                ref_time: local_time.add_seconds(-1.0),
                root_delay: 0.0,
                root_dispersion: PRECISION_QUANTUM,
            },
            SyncState::Synchronised => {
                let elapsed = local_time.diff_seconds(self.tracking.ref_time).max(0.0);
                let disp = self.tracking.root_dispersion
                    + (self.tracking.skew_ppm.abs() + self.tracking.residual_freq_ppm.abs()) * elapsed;
                ReferenceParams {
                    is_synchronised: true,
                    leap: self.tracking.leap,
                    stratum: self.tracking.stratum,
                    ref_id: self.tracking.ref_id,
                    ref_time: self.tracking.ref_time,
                    root_delay: self.tracking.root_delay,
                    root_dispersion: disp,
                }
            }
        }
    }
}

/// Append-only tracking log, re-printing its column header every 32
/// records (spec §4.6 "tracking log" / grounded on the teacher's
/// append-mode log file handling).
struct TrackingLog {
    path: PathBuf,
    writes_since_header: u32,
}

impl TrackingLog {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            writes_since_header: 0,
        }
    }

    fn write(&mut self, state: &TrackingState) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if self.writes_since_header.is_multiple_of(32) {
            writeln!(
                file,
                "{:>20} {:>8} {:>4} {:>10} {:>14} {:>14} {:>14}",
                "date/time", "stratum", "leap", "ref_id", "offset", "freq_ppm", "skew_ppm"
            )?;
        }
        writeln!(
            file,
            "{} {:>8} {:>4} {:08x} {:14.6} {:14.6} {:14.6}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
            state.stratum,
            state.leap,
            state.ref_id,
            state.offset,
            state.residual_freq_ppm,
            state.skew_ppm
        )?;
        self.writes_since_header = self.writes_since_header.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clockback::MiniClockBackend;

    fn new_reference() -> Reference<MiniClockBackend> {
        Reference::new(Lcl::new(MiniClockBackend::default()), 1.0)
    }

    #[test]
    fn set_unsynchronised_is_idempotent_from_any_state() {
        let mut r = new_reference();
        r.enable_local(10);
        r.set_unsynchronised();
        let params = r.get_reference_params(Timestamp::ZERO);
        assert!(!params.is_synchronised);

        r.set_unsynchronised();
        let params = r.get_reference_params(Timestamp::ZERO);
        assert!(!params.is_synchronised);
    }

    #[test]
    fn enable_local_reports_local_ref_id_and_quantum_dispersion() {
        let mut r = new_reference();
        r.enable_local(10);
        let params = r.get_reference_params(Timestamp::new(1000, 0));
        assert!(params.is_synchronised);
        assert_eq!(params.ref_id, LOCAL_REF_ID);
        assert_eq!(params.root_delay, 0.0);
        assert_eq!(params.root_dispersion, PRECISION_QUANTUM);
        assert_eq!(params.ref_time, Timestamp::new(999, 0));
    }

    #[test]
    fn set_reference_rejects_non_finite_skew() {
        let mut r = new_reference();
        let err = r
            .set_reference(1, 0, 0x01020304, Timestamp::ZERO, 0.001, 0.0, f64::NAN, 0.01, 0.01)
            .unwrap_err();
        assert!(matches!(err, ReferenceError::NonFiniteSkew));
    }

    #[test]
    fn set_reference_increments_stratum() {
        let mut r = new_reference();
        r.set_reference(1, 0, 0x01020304, Timestamp::new(1000, 0), 0.0005, 0.1, 0.05, 0.01, 0.01)
            .unwrap();
        let params = r.get_reference_params(Timestamp::new(1000, 0));
        assert_eq!(params.stratum, 2);
        assert!(params.is_synchronised);
    }

    #[test]
    fn set_reference_beyond_max_skew_keeps_residual_as_input_frequency() {
        let mut r = new_reference();
        r.set_reference(1, 0, 0x01020304, Timestamp::new(1000, 0), 0.0005, 0.42, 5.0, 0.01, 0.01)
            .unwrap();
        // 5.0 > max_update_skew_ppm (1.0): residual_freq equals input frequency.
        assert_eq!(r.tracking.residual_freq_ppm, 0.42);
    }

    #[test]
    fn persist_drift_writes_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let drift_path = dir.path().join("drift");
        std::fs::write(&drift_path, "1.2500 0.0300\n").unwrap();

        let mut r = new_reference().with_drift_file(&drift_path);
        r.load_drift();
        assert_eq!(r.tracking.residual_freq_ppm, 1.25);
        assert_eq!(r.tracking.skew_ppm, 0.03);

        r.set_reference(1, 0, 0x01020304, Timestamp::new(1000, 0), 0.0005, 0.1, 0.05, 0.01, 0.01)
            .unwrap();

        let contents = std::fs::read_to_string(&drift_path).unwrap();
        assert_eq!(contents.split_whitespace().count(), 2);
    }

    #[test]
    fn tracking_log_reprints_header_every_32_writes() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("tracking.log");
        let mut r = new_reference().with_tracking_log(&log_path);

        for _ in 0..33 {
            r.set_reference(1, 0, 0x01020304, Timestamp::new(1000, 0), 0.0001, 0.01, 0.02, 0.01, 0.01)
                .unwrap();
        }

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let header_count = contents.matches("date/time").count();
        assert_eq!(header_count, 2);
    }
}
