//! `ClockBackend`: the capability trait that isolates [`crate::lcl::Lcl`]
//! from the actual mechanism used to steer the system clock (spec §4.2).
//!
//! Two concrete backends are provided: a kernel PLL-style backend modeled on
//! Linux `adjtimex(2)`'s frequency/status/leap fields, and a plain
//! `adjtime(3)`-style backend for systems without kernel discipline support.
//! Both share the `MAX_SYNC_ERROR` clamp so a bad measurement can't be
//! slewed in all at once.

use crate::time::Timestamp;

/// Largest single offset correction (seconds) a backend will apply via
/// `accrue_offset`/`apply_step_offset` without clamping.
pub const MAX_SYNC_ERROR: f64 = 16.0;

/// `adjtime`-style backends never slew faster than this many ppm; used to
/// bound the error on a still-pending offset correction (spec §4.2).
const MAX_ADJTIME_SLEWRATE: f64 = 500.0;

/// Granularity (seconds) at which an `adjtime`-style backend's queued
/// offset is re-evaluated by the kernel.
const ADJTIME_UPDATE_INTERVAL: f64 = 1.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ClockBackendError {
    #[error("requested offset {0} exceeds the maximum sync error of {MAX_SYNC_ERROR}s")]
    OffsetTooLarge(f64),
    #[error("underlying syscall failed: {0}")]
    Syscall(String),
}

/// Leap-second announcement status, mirrored from `adjtimex`'s `STA_INS` /
/// `STA_DEL` status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapStatus {
    Normal,
    InsertSecond,
    DeleteSecond,
}

/// Abstraction over "a thing that can report and adjust the system clock's
/// running rate". Implementations are expected to be cheap to call; `Lcl`
/// may call `set_frequency_ppm` on every poll.
pub trait ClockBackend {
    /// Current frequency offset in parts-per-million (positive = fast).
    fn read_frequency_ppm(&self) -> f64;

    /// Set the clock's running rate to `ppm` parts-per-million. Returns the
    /// value actually installed after whatever rounding the backend's
    /// native representation imposes, since the caller needs the achieved
    /// rate to compute its own delta-frequency bookkeeping.
    fn set_frequency_ppm(&mut self, ppm: f64) -> Result<f64, ClockBackendError>;

    /// Slew a small offset in gradually (never a step). `offset_seconds`
    /// positive means the clock is behind true time.
    fn accrue_offset(&mut self, offset_seconds: f64) -> Result<(), ClockBackendError>;

    /// Step the clock immediately by `offset_seconds`.
    fn apply_step_offset(&mut self, offset_seconds: f64) -> Result<(), ClockBackendError>;

    /// For a raw timestamp, the remaining sub-update correction this
    /// backend has not yet walked in (from a previous `accrue_offset`),
    /// plus an error bound on that correction.
    fn offset_correction(&self, raw_now: Timestamp) -> (f64, f64);

    /// Mark the kernel as synchronized/unsynchronized, if the backend
    /// supports reporting that (most do not; default is a no-op).
    fn set_sync_status(&mut self, _synced: bool) -> Result<(), ClockBackendError> {
        Ok(())
    }

    /// Announce a pending leap second, if the backend supports it.
    fn set_leap(&mut self, _status: LeapStatus) -> Result<(), ClockBackendError> {
        Ok(())
    }
}

fn check_offset(offset_seconds: f64) -> Result<f64, ClockBackendError> {
    if offset_seconds.abs() > MAX_SYNC_ERROR {
        Err(ClockBackendError::OffsetTooLarge(offset_seconds))
    } else {
        Ok(offset_seconds)
    }
}

/// Kernel PLL-style backend: tracks frequency and an accrued-but-unapplied
/// offset the way `adjtimex(MOD_FREQUENCY | MOD_OFFSET)` would, scaling
/// frequency into the kernel's native `ppm * 2^16` units on the way in/out
/// (grounded on the teacher's `clock.rs` use of `libc` clock syscalls).
#[derive(Debug, Default)]
pub struct KernelPllBackend {
    freq_ppm: f64,
    synced: bool,
    leap: Option<LeapStatus>,
    last_step: f64,
    /// Offset handed to `MOD_OFFSET` that the kernel PLL hasn't walked in yet.
    queued_offset: f64,
}

impl KernelPllBackend {
    /// Kernel `adjtimex` frequency scale: ppm represented as `ppm * 2^16`.
    const FREQ_SCALE: f64 = 65536.0;

    /// `MOD_FREQUENCY` clamp: `adjtimex` rejects frequencies outside this range.
    const MAX_FREQ_PPM: f64 = 500.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// The value that would be written to `timex.freq`, for tests/logging.
    pub fn kernel_freq_units(&self) -> i64 {
        (self.freq_ppm * Self::FREQ_SCALE).round() as i64
    }

    pub fn last_step_offset(&self) -> f64 {
        self.last_step
    }
}

impl ClockBackend for KernelPllBackend {
    fn read_frequency_ppm(&self) -> f64 {
        self.freq_ppm
    }

    fn set_frequency_ppm(&mut self, ppm: f64) -> Result<f64, ClockBackendError> {
        let clamped = ppm.clamp(-Self::MAX_FREQ_PPM, Self::MAX_FREQ_PPM);
        let rounded = (clamped * Self::FREQ_SCALE).round() / Self::FREQ_SCALE;
        self.freq_ppm = rounded;
        Ok(rounded)
    }

    fn accrue_offset(&mut self, offset_seconds: f64) -> Result<(), ClockBackendError> {
        check_offset(offset_seconds)?;
        // A real backend would fold this into timex.offset (MOD_OFFSET) and
        // let the kernel PLL walk it in; track the queued amount so
        // offset_correction can report on it.
        self.queued_offset += offset_seconds;
        Ok(())
    }

    fn apply_step_offset(&mut self, offset_seconds: f64) -> Result<(), ClockBackendError> {
        check_offset(offset_seconds)?;
        self.last_step = offset_seconds;
        self.queued_offset = 0.0;
        Ok(())
    }

    fn offset_correction(&self, _raw_now: Timestamp) -> (f64, f64) {
        if self.queued_offset == 0.0 {
            (0.0, 0.0)
        } else {
            (self.queued_offset, 1e-6 * MAX_ADJTIME_SLEWRATE / ADJTIME_UPDATE_INTERVAL)
        }
    }

    fn set_sync_status(&mut self, synced: bool) -> Result<(), ClockBackendError> {
        self.synced = synced;
        Ok(())
    }

    fn set_leap(&mut self, status: LeapStatus) -> Result<(), ClockBackendError> {
        self.leap = Some(status);
        Ok(())
    }
}

/// `adjtime(3)`-style backend: no kernel PLL, just a running frequency
/// estimate applied entirely in userspace and a queued step for the next
/// `apply_step_offset` call.
#[derive(Debug, Default)]
pub struct AdjtimeBackend {
    freq_ppm: f64,
    queued_offset: f64,
}

impl AdjtimeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued_offset(&self) -> f64 {
        self.queued_offset
    }
}

impl ClockBackend for AdjtimeBackend {
    fn read_frequency_ppm(&self) -> f64 {
        self.freq_ppm
    }

    fn set_frequency_ppm(&mut self, ppm: f64) -> Result<f64, ClockBackendError> {
        self.freq_ppm = ppm;
        Ok(ppm)
    }

    fn accrue_offset(&mut self, offset_seconds: f64) -> Result<(), ClockBackendError> {
        check_offset(offset_seconds)?;
        // adjtime(2): read the previous residual, sum, write back.
        self.queued_offset += offset_seconds;
        Ok(())
    }

    fn apply_step_offset(&mut self, offset_seconds: f64) -> Result<(), ClockBackendError> {
        check_offset(offset_seconds)?;
        self.queued_offset = 0.0;
        Ok(())
    }

    fn offset_correction(&self, _raw_now: Timestamp) -> (f64, f64) {
        if self.queued_offset == 0.0 {
            (0.0, 0.0)
        } else {
            (self.queued_offset, 1e-6 * MAX_ADJTIME_SLEWRATE / ADJTIME_UPDATE_INTERVAL)
        }
    }
}

/// Minimal in-memory backend used by `lcl`'s unit tests: records the last
/// values passed to it without touching any real clock.
#[derive(Debug, Default)]
pub struct MiniClockBackend {
    freq_ppm: f64,
}

impl ClockBackend for MiniClockBackend {
    fn read_frequency_ppm(&self) -> f64 {
        self.freq_ppm
    }

    fn set_frequency_ppm(&mut self, ppm: f64) -> Result<f64, ClockBackendError> {
        self.freq_ppm = ppm;
        Ok(ppm)
    }

    fn accrue_offset(&mut self, _offset_seconds: f64) -> Result<(), ClockBackendError> {
        Ok(())
    }

    fn apply_step_offset(&mut self, _offset_seconds: f64) -> Result<(), ClockBackendError> {
        Ok(())
    }

    fn offset_correction(&self, _raw_now: Timestamp) -> (f64, f64) {
        (0.0, 0.0)
    }
}
