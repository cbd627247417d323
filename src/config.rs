//! Chronos configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChronosConfig {
    /// NTP/reference configuration
    #[serde(default)]
    pub ntp: NtpConfig,

    /// NTS-KE configuration
    #[serde(default)]
    pub nts: NtsConfig,

    /// Tracking log configuration
    #[serde(default)]
    pub tracking_log: TrackingLogConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// One configured time source: a remote NTP server or a local refclock
/// driver, with its polling bounds and selection flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Remote address ("pool.ntp.org") or refclock driver name ("PPS", "SHM").
    pub address: String,

    /// Driver parameter string (device path, SHM segment id, ...); empty
    /// for ordinary remote NTP sources.
    #[serde(default)]
    pub driver_param: String,

    #[serde(default = "default_minpoll")]
    pub minpoll: i8,

    #[serde(default = "default_maxpoll")]
    pub maxpoll: i8,

    #[serde(default)]
    pub prefer: bool,

    #[serde(default)]
    pub trust: bool,

    #[serde(default)]
    pub noselect: bool,
}

/// NTP client / reference configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtpConfig {
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,

    #[serde(default = "default_drift_file")]
    pub drift_file: String,

    /// Log a warning when an applied offset exceeds this many seconds.
    #[serde(default = "default_log_change_threshold")]
    pub log_change_threshold: f64,

    /// Notify (out of scope to actually mail) when an applied offset
    /// exceeds this many seconds.
    #[serde(default = "default_mail_change_threshold")]
    pub mail_change_threshold: f64,

    /// Reject a source's frequency update into the weighted average above
    /// this skew (ppm); the offset is still applied.
    #[serde(default = "default_max_update_skew_ppm")]
    pub max_update_skew_ppm: f64,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            drift_file: default_drift_file(),
            log_change_threshold: default_log_change_threshold(),
            mail_change_threshold: default_mail_change_threshold(),
            max_update_skew_ppm: default_max_update_skew_ppm(),
        }
    }
}

/// NTS-KE configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// NTS-KE server addresses to query before falling back to plain NTP.
    #[serde(default)]
    pub ke_servers: Vec<String>,

    #[serde(default = "default_nts_timeout")]
    pub timeout_seconds: u32,
}

impl Default for NtsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ke_servers: Vec::new(),
            timeout_seconds: default_nts_timeout(),
        }
    }
}

/// Tracking log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingLogConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_tracking_log_path")]
    pub path: String,
}

impl Default for TrackingLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_tracking_log_path(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Socket path for IPC
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// State file path
    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            state_path: default_state_path(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_sources() -> Vec<SourceConfig> {
    ["0.pool.ntp.org", "1.pool.ntp.org", "2.pool.ntp.org", "3.pool.ntp.org"]
        .into_iter()
        .map(|addr| SourceConfig {
            address: addr.to_string(),
            driver_param: String::new(),
            minpoll: default_minpoll(),
            maxpoll: default_maxpoll(),
            prefer: false,
            trust: false,
            noselect: false,
        })
        .collect()
}

fn default_minpoll() -> i8 {
    6 // 64s
}

fn default_maxpoll() -> i8 {
    10 // 1024s
}

fn default_drift_file() -> String {
    "/var/lib/chronos/drift".to_string()
}

fn default_log_change_threshold() -> f64 {
    1.0
}

fn default_mail_change_threshold() -> f64 {
    f64::INFINITY
}

fn default_max_update_skew_ppm() -> f64 {
    1000.0
}

fn default_nts_timeout() -> u32 {
    15
}

fn default_tracking_log_path() -> String {
    "/var/log/chronos/tracking.log".to_string()
}

fn default_socket_path() -> String {
    "/run/chronos/chronos.sock".to_string()
}

fn default_state_path() -> String {
    "/var/lib/chronos/state".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ChronosConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_four_pool_sources() {
        let config = ChronosConfig::default();
        assert_eq!(config.ntp.sources.len(), 4);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chronos.toml");

        let mut config = ChronosConfig::default();
        config.ntp.max_update_skew_ppm = 42.0;
        config.nts.enabled = true;
        config.nts.ke_servers.push("nts.example.com".to_string());
        config.save(&path).unwrap();

        let loaded = ChronosConfig::load(&path).unwrap();
        assert_eq!(loaded.ntp.max_update_skew_ppm, 42.0);
        assert!(loaded.nts.enabled);
        assert_eq!(loaded.nts.ke_servers, vec!["nts.example.com".to_string()]);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let config = ChronosConfig::load(&path).unwrap();
        assert_eq!(config.daemon.socket_path, default_socket_path());
    }
}
