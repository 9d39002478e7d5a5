//! Byte accounting for one model's multi-file download
//!
//! Totals start as catalog estimates and are corrected as each transfer
//! reports an authoritative content length, so the displayed percentage can
//! jump mid-download. Completed tasks stay in the set so the aggregate
//! converges on real on-disk sizes.

/// One file transfer.
#[derive(Debug, Clone)]
struct TaskProgress {
    url: String,
    /// Bytes written so far.
    written: u64,
    /// Authoritative size from the network, 0 until reported.
    expected: u64,
    /// Catalog estimate used while `expected` is unknown.
    estimate: u64,
    done: bool,
}

impl TaskProgress {
    fn effective_total(&self) -> u64 {
        if self.expected > 0 {
            self.expected
        } else {
            self.estimate
        }
    }
}

/// Aggregate progress across every file one model needs.
#[derive(Debug, Clone, Default)]
pub struct DownloadProgress {
    tasks: Vec<TaskProgress>,
}

impl DownloadProgress {
    /// Zero-initialized task per `(url, estimated size)` pair.
    #[must_use]
    pub fn new(files: &[(String, u64)]) -> Self {
        Self {
            tasks: files
                .iter()
                .map(|(url, estimate)| TaskProgress {
                    url: url.clone(),
                    written: 0,
                    expected: 0,
                    estimate: *estimate,
                    done: false,
                })
                .collect(),
        }
    }

    fn task_mut(&mut self, url: &str) -> Option<&mut TaskProgress> {
        self.tasks.iter_mut().find(|t| t.url == url)
    }

    /// Record the authoritative size the network reported for one file.
    pub fn record_expected(&mut self, url: &str, expected: u64) {
        if let Some(task) = self.task_mut(url) {
            task.expected = expected;
        }
    }

    /// Record cumulative bytes written for one file.
    pub fn record_written(&mut self, url: &str, written: u64) {
        if let Some(task) = self.task_mut(url) {
            task.written = written;
        }
    }

    /// Mark one file finished at its actual on-disk size.
    pub fn record_done(&mut self, url: &str, actual_size: u64) {
        if let Some(task) = self.task_mut(url) {
            task.written = actual_size;
            task.expected = actual_size;
            task.done = true;
        }
    }

    /// Drop a failed file from the accounting. Sibling tasks continue.
    pub fn record_failed(&mut self, url: &str) {
        self.tasks.retain(|t| t.url != url);
    }

    /// Sum of bytes written across tasks.
    #[must_use]
    pub fn completed_bytes(&self) -> u64 {
        self.tasks.iter().map(|t| t.written).sum()
    }

    /// Sum of per-task totals, authoritative where known, estimated where
    /// not.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.tasks.iter().map(TaskProgress::effective_total).sum()
    }

    /// Completion ratio in `0.0..=1.0`, never over 1 even if an estimate
    /// undershot.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        (self.completed_bytes() as f64 / total as f64).min(1.0)
    }

    /// Tasks still transferring.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks.iter().filter(|t| !t.done).count()
    }

    /// True once every remaining task finished. Empty means every task
    /// failed, which is not completion.
    #[must_use]
    pub fn all_done(&self) -> bool {
        !self.tasks.is_empty() && self.pending() == 0
    }

    /// True when every task was dropped by failure.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
