//! CLI to daemon requests over a Unix socket.
//!
//! One request per connection: the client writes a bincode frame and shuts
//! down its write half, the daemon answers with one frame.

use anyhow::{Context, Result};
use classguard_storage::{Partition, PartitionStats};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::runtime::SystemStatus;
use crate::session_controller::SessionStatus;
use crate::sync_engine::SyncStatus;

/// IPC request from CLI to daemon
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IpcRequest {
    Status,
    RaiseHelp { reason: String },
    Shutdown,
}

/// Everything `classguard status` shows
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DaemonStatus {
    pub pid: u32,
    pub system: SystemStatus,
    pub session: SessionStatus,
    /// `None` while no backend is configured
    pub sync: Option<SyncStatus>,
    pub outbox: BTreeMap<Partition, PartitionStats>,
    pub dropped: u64,
    pub pending_help: usize,
}

/// IPC response from daemon to CLI
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum IpcResponse {
    Status(Box<DaemonStatus>),
    HelpRaised { request_id: Uuid },
    HelpDenied { request_id: Uuid, retry_after_secs: u64 },
    Error(String),
    Shutdown,
}

/// A decoded request waiting for the daemon's answer
#[derive(Debug)]
pub struct IpcCall {
    pub request: IpcRequest,
    pub reply: oneshot::Sender<IpcResponse>,
}

#[must_use]
pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("classguard.sock")
}

#[derive(Debug)]
pub struct IpcClient {
    sock_path: PathBuf,
}

impl IpcClient {
    #[must_use]
    pub fn new(sock_path: &Path) -> Self {
        Self {
            sock_path: sock_path.to_path_buf(),
        }
    }

    /// Send one request and wait for the answer
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or the reply cannot be decoded
    pub async fn send_command(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.sock_path)
            .await
            .with_context(|| format!("Failed to connect to {}", self.sock_path.display()))?;

        let encoded = bincode::serialize(&request)?;
        stream.write_all(&encoded).await?;
        stream.shutdown().await?;

        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        let response: IpcResponse = bincode::deserialize(&buffer)?;

        Ok(response)
    }
}

async fn serve(mut stream: UnixStream, calls: mpsc::Sender<IpcCall>) -> Result<()> {
    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer).await?;
    if buffer.is_empty() {
        return Ok(());
    }

    let response = match bincode::deserialize::<IpcRequest>(&buffer) {
        Ok(request) => {
            let (reply, answer) = oneshot::channel();
            calls
                .send(IpcCall { request, reply })
                .await
                .map_err(|_| anyhow::anyhow!("daemon loop stopped"))?;
            answer
                .await
                .unwrap_or_else(|_| IpcResponse::Error("daemon dropped the request".to_string()))
        }
        Err(e) => IpcResponse::Error(format!("undecodable request: {e}")),
    };

    let encoded = bincode::serialize(&response)?;
    stream.write_all(&encoded).await?;
    Ok(())
}

/// Bind the daemon socket, removing a stale file first
///
/// # Errors
///
/// Returns an error if the socket cannot be bound
pub fn bind(sock_path: &Path) -> std::io::Result<UnixListener> {
    if sock_path.exists() {
        std::fs::remove_file(sock_path)?;
    }
    UnixListener::bind(sock_path)
}

/// Accept connections and hand decoded requests to the daemon loop
pub async fn listen(listener: UnixListener, calls: mpsc::Sender<IpcCall>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let calls = calls.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, calls).await {
                        log::error!("IPC request failed: {e}");
                    }
                });
            }
            Err(e) => {
                log::error!("IPC accept error: {e}");
            }
        }
    }
}
