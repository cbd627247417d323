//! IPC interface for Chronos daemon

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

/// IPC request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcRequest {
    /// Get the daemon's current tracking state (REF's `ReferenceParams`).
    GetTrackingStatus,

    /// Get per-source statistics.
    GetSources,

    /// Force the next poll cycle to run immediately on every source.
    ForceSync,

    /// Request an immediate time step (bypassing the normal slew path) if
    /// the current offset is at least the given number of seconds.
    MakeStep { threshold: f64 },

    /// Get full daemon status.
    GetDaemonStatus,
}

/// IPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IpcResponse {
    /// Successful response with data
    Success { data: serde_json::Value },

    /// Error response
    Error { message: String },
}

impl IpcResponse {
    /// Create success response
    pub fn success<T: Serialize>(data: T) -> Self {
        Self::Success {
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Create error response
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Tracking status, mirroring `Reference::get_reference_params`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingStatus {
    pub is_synchronised: bool,
    pub leap: u8,
    pub stratum: u8,
    pub ref_id: u32,
    pub ref_time_unix: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
}

/// A single source's current estimate, for `chronosctl sources`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceStatus {
    pub address: String,
    pub stratum: u8,
    pub reach: u8,
    pub offset: f64,
    pub dispersion: f64,
    pub selected: bool,
}

/// Full daemon status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonStatus {
    pub version: String,
    pub tracking: TrackingStatus,
    pub sources: Vec<SourceStatus>,
}

/// Handler for processing IPC requests
pub trait IpcHandler: Send + Sync {
    /// Handle an IPC request
    fn handle(&self, request: IpcRequest) -> impl std::future::Future<Output = IpcResponse> + Send;
}

/// IPC server
pub struct IpcServer<H: IpcHandler> {
    socket_path: String,
    handler: Arc<H>,
}

impl<H: IpcHandler + 'static> IpcServer<H> {
    /// Create new IPC server
    pub fn new(socket_path: impl Into<String>, handler: H) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler: Arc::new(handler),
        }
    }

    /// Start the IPC server
    pub async fn run(&self) -> Result<()> {
        let path = Path::new(&self.socket_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let _ = std::fs::remove_file(path);

        let listener = UnixListener::bind(path)?;
        info!("Chronos IPC listening on {}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler).await {
                            error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_client<H: IpcHandler>(stream: UnixStream, handler: Arc<H>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                debug!("IPC request: {:?}", request);
                handler.handle(request).await
            }
            Err(e) => IpcResponse::error(format!("Invalid request: {}", e)),
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

/// IPC client for connecting to chronosd
pub struct IpcClient {
    socket_path: String,
}

impl IpcClient {
    /// Create new IPC client
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Send request and receive response
    pub async fn send(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let request_json = serde_json::to_string(&request)?;
        stream.write_all(request_json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        Ok(serde_json::from_str(&line)?)
    }

    /// Get tracking status
    pub async fn get_tracking_status(&self) -> Result<TrackingStatus> {
        match self.send(IpcRequest::GetTrackingStatus).await? {
            IpcResponse::Success { data } => Ok(serde_json::from_value(data)?),
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        }
    }

    /// Get per-source status
    pub async fn get_sources(&self) -> Result<Vec<SourceStatus>> {
        match self.send(IpcRequest::GetSources).await? {
            IpcResponse::Success { data } => Ok(serde_json::from_value(data)?),
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        }
    }

    /// Force an immediate sync cycle
    pub async fn force_sync(&self) -> Result<()> {
        match self.send(IpcRequest::ForceSync).await? {
            IpcResponse::Success { .. } => Ok(()),
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        }
    }

    /// Request an immediate step if the offset is at least `threshold` seconds
    pub async fn make_step(&self, threshold: f64) -> Result<()> {
        match self.send(IpcRequest::MakeStep { threshold }).await? {
            IpcResponse::Success { .. } => Ok(()),
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        }
    }

    /// Get full daemon status
    pub async fn get_daemon_status(&self) -> Result<DaemonStatus> {
        match self.send(IpcRequest::GetDaemonStatus).await? {
            IpcResponse::Success { data } => Ok(serde_json::from_value(data)?),
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        }
    }
}
