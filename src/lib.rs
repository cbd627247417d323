//! Core NTPv4 clock-discipline and NTS-KE logic for the Chronos daemon.
//!
//! The daemon binary (`chronosd`) wires these modules to a Tokio scheduler,
//! a TOML configuration file, and a JSON-line Unix-socket command surface;
//! everything in this library is independent of that shell and is exercised
//! directly by unit tests.

pub mod clockback;
pub mod config;
pub mod ipc;
pub mod lcl;
pub mod ntske;
pub mod reference;
pub mod refclock;
pub mod regress;
pub mod scheduler;
pub mod time;
