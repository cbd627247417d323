//! Chronos - NTPv4 clock discipline and NTS-KE daemon.
//!
//! Wires the library's [`chronos::lcl`]/[`chronos::reference`]/
//! [`chronos::refclock`] core to a Tokio scheduler, a TOML config file, and
//! a JSON-line Unix-socket command surface. The outer NTP wire protocol
//! (querying remote servers over UDP) is an external collaborator this
//! crate does not implement (spec §1 Non-goals); only refclock-driver-backed
//! sources configured with a `driver_param` are actually polled here.

mod config;
mod ipc;

use chronos::clockback::MiniClockBackend;
use chronos::lcl::Lcl;
use chronos::refclock::SoftwarePpsDriver;
use chronos::reference::Reference;
use chronos::scheduler::{ref_id_for_name, Scheduler};
use chronos::time::Timestamp;

use crate::config::{ChronosConfig, SourceConfig};
use crate::ipc::{DaemonStatus, IpcHandler, IpcRequest, IpcResponse, IpcServer, SourceStatus, TrackingStatus};

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "chronosd", version, about = "Chronos NTP clock-discipline daemon")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/chronos/chronos.toml")]
    config: PathBuf,

    /// Run in foreground (don't daemonize)
    #[arg(short, long)]
    foreground: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn wall_clock_now() -> Timestamp {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    Timestamp::new(now.as_secs() as i64, now.subsec_nanos())
}

/// Build a driver for a configured source. Only refclock-style driver
/// parameters are actually pollable here; a bare remote address is logged
/// and skipped, since sending/parsing NTP requests is out of scope.
fn build_source(cfg: &SourceConfig) -> Option<chronos::scheduler::Source> {
    let driver: Box<dyn chronos::refclock::RefclockDriver + Send + Sync> = match cfg.driver_param.split(':').next() {
        Some("PPS") => {
            let rate_hz: f64 = cfg
                .driver_param
                .split(':')
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0);
            Box::new(SoftwarePpsDriver::new(rate_hz, 0.0, std::iter::empty()))
        }
        _ => {
            warn!(
                source = %cfg.address,
                "outer NTP network polling is not implemented by this core; \
                 configure a refclock driver_param (e.g. \"PPS:1\") to exercise this source"
            );
            return None;
        }
    };
    Some(chronos::scheduler::Source::new(
        cfg.address.clone(),
        ref_id_for_name(&cfg.address),
        0,
        cfg.minpoll,
        driver,
    ))
}

struct ChronosState {
    scheduler: Scheduler<MiniClockBackend>,
}

impl ChronosState {
    fn new(config: &ChronosConfig) -> Self {
        let lcl = Lcl::new(MiniClockBackend::default());
        let mut reference = Reference::new(lcl, config.ntp.max_update_skew_ppm);
        reference.set_thresholds(config.ntp.log_change_threshold, config.ntp.mail_change_threshold);
        if !config.ntp.drift_file.is_empty() {
            reference = reference.with_drift_file(config.ntp.drift_file.clone());
        }
        if config.tracking_log.enabled {
            reference = reference.with_tracking_log(config.tracking_log.path.clone());
        }
        reference.load_drift();

        let mut scheduler = Scheduler::new(reference);
        for source_cfg in &config.ntp.sources {
            if let Some(source) = build_source(source_cfg) {
                scheduler.add_source(source);
            }
        }

        Self { scheduler }
    }

    fn poll(&mut self) {
        match self.scheduler.poll_all(wall_clock_now()) {
            Ok(true) => info!("reference updated"),
            Ok(false) => {}
            Err(e) => warn!("reference update rejected: {e}"),
        }
    }

    fn tracking_status(&self) -> TrackingStatus {
        let params = self.scheduler.reference().get_reference_params(wall_clock_now());
        TrackingStatus {
            is_synchronised: params.is_synchronised,
            leap: params.leap,
            stratum: params.stratum,
            ref_id: params.ref_id,
            ref_time_unix: params.ref_time.to_secs_f64(),
            root_delay: params.root_delay,
            root_dispersion: params.root_dispersion,
        }
    }

    fn source_statuses(&self) -> Vec<SourceStatus> {
        self.scheduler
            .sources()
            .iter()
            .map(|s| SourceStatus {
                address: s.name.clone(),
                stratum: s.stratum,
                reach: s.reach(),
                offset: s.last_offset(),
                dispersion: s.last_dispersion(),
                selected: false,
            })
            .collect()
    }

    fn daemon_status(&self) -> DaemonStatus {
        DaemonStatus {
            version: VERSION.to_string(),
            tracking: self.tracking_status(),
            sources: self.source_statuses(),
        }
    }
}

struct ChronosHandler {
    state: Arc<RwLock<ChronosState>>,
}

impl IpcHandler for ChronosHandler {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::GetTrackingStatus => {
                let state = self.state.read().await;
                IpcResponse::success(state.tracking_status())
            }
            IpcRequest::GetSources => {
                let state = self.state.read().await;
                IpcResponse::success(state.source_statuses())
            }
            IpcRequest::ForceSync => {
                let mut state = self.state.write().await;
                state.poll();
                IpcResponse::success(state.tracking_status())
            }
            IpcRequest::MakeStep { threshold } => {
                let state = self.state.read().await;
                let offset = state.tracking_status();
                if offset.is_synchronised {
                    IpcResponse::success(serde_json::json!({"stepped": false}))
                } else {
                    IpcResponse::error(format!(
                        "not synchronised; cannot evaluate step threshold {threshold}"
                    ))
                }
            }
            IpcRequest::GetDaemonStatus => {
                let state = self.state.read().await;
                IpcResponse::success(state.daemon_status())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    info!("Chronos v{} starting", VERSION);

    let config = ChronosConfig::load(&args.config)?;
    info!("Configuration loaded from {:?}", args.config);

    let state = Arc::new(RwLock::new(ChronosState::new(&config)));

    {
        let mut state = state.write().await;
        state.poll();
    }

    let poll_state = state.clone();
    let minpoll = config
        .ntp
        .sources
        .iter()
        .map(|s| s.minpoll)
        .min()
        .unwrap_or(6)
        .max(1) as u64;
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(1u64 << minpoll.min(16)));
        loop {
            tick.tick().await;
            let mut state = poll_state.write().await;
            state.poll();
        }
    });

    let handler = ChronosHandler { state: state.clone() };
    let server = IpcServer::new(&config.daemon.socket_path, handler);

    if !args.foreground {
        info!("daemonizing is left to the service manager (systemd/init); running in foreground");
    }
    info!("Chronos ready");
    server.run().await
}
