//! State-change events published by the download coordinator and the
//! process supervisor
//!
//! One broadcast channel fans out to every observer: IPC subscribers
//! streaming progress to a CLI, and tests. Senders never block; a slow
//! observer only lags itself.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Buffer enough progress ticks that a briefly-busy observer loses nothing.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// Tasks created, aggregate registered. Emitted before any byte moves.
    Started {
        model: String,
        total_bytes: u64,
    },
    /// Byte counters moved. `total_bytes` can change between ticks as the
    /// network reports authoritative sizes.
    Progress {
        model: String,
        completed_bytes: u64,
        total_bytes: u64,
    },
    /// Every required file is on disk.
    Completed {
        model: String,
    },
    /// All transfers failed; the model is available again.
    Failed {
        model: String,
        reason: String,
    },
    Canceled {
        model: String,
    },
    /// Local files removed.
    Deleted {
        model: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Process spawned, health not yet confirmed.
    Loading { model: String },
    /// Health check passed.
    Running { model: String, context: u32 },
    /// Clean stop, back to idle.
    Stopped,
    /// Launch validation, spawn, health or crash failure.
    Failed { reason: String },
    /// Resident-memory sample of the running engine.
    Memory { used_mb: u64 },
}

/// Everything the daemon publishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Download(DownloadEvent),
    Server(ServerEvent),
}

pub type EventSender = broadcast::Sender<Event>;
pub type EventReceiver = broadcast::Receiver<Event>;

/// Create the daemon-wide event channel.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    broadcast::channel(CHANNEL_CAPACITY)
}
