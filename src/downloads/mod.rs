//! Multi-file model downloads
//!
//! One aggregate per model id fans out to one transfer per required file.
//! Completed files land in a flat [`ModelStore`] keyed by URL basename;
//! whether a model is "downloaded" is always recomputed from disk, never
//! persisted.

mod coordinator;
mod progress;
mod store;

pub use coordinator::{DownloadCoordinator, ModelStatus};
pub use progress::DownloadProgress;
pub use store::{basename, ModelStore};

/// Format bytes as a human-readable string. Download counts use decimal
/// units to match what model hosts publish; memory budgets elsewhere stay
/// binary.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1000;
    const MB: u64 = KB * 1000;
    const GB: u64 = MB * 1000;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
