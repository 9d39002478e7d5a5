//! Unix-socket IPC between the daemon and the CLI
//!
//! One JSON line per command, one JSON line per response. The `Watch`
//! command leaves the connection open and turns it into a stream of
//! [`crate::events::Event`] lines.

pub mod client;
pub mod server;

pub use client::{EventStream, IpcClient};
pub use server::IpcServer;

use crate::app::StatusReport;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// IPC commands
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Command {
    Status,
    Download { model: String },
    CancelDownload { model: String },
    DeleteModel { model: String },
    Run { model: String, context: Option<u32> },
    StopServer,
    /// Hold the connection open and stream daemon events as JSON lines.
    Watch,
}

/// IPC responses
#[derive(Serialize, Deserialize, Debug)]
pub enum Response {
    Ok,
    Status(StatusReport),
    Error(String),
}

/// Socket path under `XDG_RUNTIME_DIR`, falling back to the system temp
/// directory where that is not set (macOS).
#[must_use]
pub fn socket_path() -> PathBuf {
    let dir = std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    dir.join("llamabar.sock")
}
