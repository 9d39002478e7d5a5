use crate::catalog::CatalogEntry;
use crate::downloads::progress::DownloadProgress;
use crate::downloads::store::ModelStore;
use crate::error::{LlamabarError, Result};
use crate::events::{DownloadEvent, Event, EventSender};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Emit progress at most this often per model, to avoid flooding observers.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Where a model stands, derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelStatus {
    Available,
    Downloading {
        completed_bytes: u64,
        total_bytes: u64,
    },
    Downloaded,
}

struct ActiveDownload {
    progress: DownloadProgress,
    token: CancellationToken,
    last_emit: Instant,
}

/// Tracks one aggregate download per model id, fanning out one transfer per
/// required file.
///
/// Cheap to clone; clones share the same aggregate map.
#[derive(Clone)]
pub struct DownloadCoordinator {
    store: ModelStore,
    client: reqwest::Client,
    events: EventSender,
    active: Arc<Mutex<HashMap<String, ActiveDownload>>>,
    /// Models mid-deletion report as available even while files linger.
    deleting: Arc<Mutex<HashSet<String>>>,
}

impl DownloadCoordinator {
    #[must_use]
    pub fn new(store: ModelStore, events: EventSender) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            events,
            active: Arc::new(Mutex::new(HashMap::new())),
            deleting: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    #[must_use]
    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Catalog-derived size estimate for one file, used until the network
    /// reports a real content length.
    fn estimated_size(entry: &CatalogEntry, url: &str) -> u64 {
        if entry.mmproj_url.as_deref() == Some(url) {
            return entry.mmproj_size;
        }
        let weight_files = entry.weight_urls().len() as u64;
        if weight_files == 0 {
            0
        } else {
            entry.file_size / weight_files
        }
    }

    /// Filesystem ground truth first, then in-flight state.
    pub async fn status(&self, entry: &CatalogEntry) -> ModelStatus {
        if self.deleting.lock().await.contains(&entry.id) {
            return ModelStatus::Available;
        }
        if self.store.is_downloaded(entry) {
            return ModelStatus::Downloaded;
        }
        if let Some(active) = self.active.lock().await.get(&entry.id) {
            return ModelStatus::Downloading {
                completed_bytes: active.progress.completed_bytes(),
                total_bytes: active.progress.total_bytes(),
            };
        }
        ModelStatus::Available
    }

    pub async fn is_downloading(&self, id: &str) -> bool {
        self.active.lock().await.contains_key(id)
    }

    /// Start downloading every missing file for the entry. Returns as soon
    /// as the transfers are registered; progress arrives over the event
    /// channel. A fully-present model is a no-op.
    pub async fn download(&self, entry: &CatalogEntry) -> Result<()> {
        let required = self.store.files_required(entry);
        if required.is_empty() {
            info!("Model {} already downloaded", entry.id);
            return Ok(());
        }

        {
            let active = self.active.lock().await;
            if active.contains_key(&entry.id) {
                warn!("Model {} is already downloading", entry.id);
                return Err(LlamabarError::Download(format!(
                    "{} is already downloading",
                    entry.id
                )));
            }
        }

        let files: Vec<(String, u64)> = required
            .iter()
            .map(|url| (url.clone(), Self::estimated_size(entry, url)))
            .collect();
        let estimated_total: u64 = files.iter().map(|(_, size)| size).sum();
        self.store.check_disk_space(estimated_total)?;

        let token = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            active.insert(
                entry.id.clone(),
                ActiveDownload {
                    progress: DownloadProgress::new(&files),
                    token: token.clone(),
                    last_emit: Instant::now(),
                },
            );
        }

        // Registered before any byte moves, so a status query between task
        // creation and the first callback already sees "downloading".
        self.emit(DownloadEvent::Started {
            model: entry.id.clone(),
            total_bytes: estimated_total,
        });

        info!("Downloading {} ({} files)", entry.id, files.len());

        let shared = Arc::new(entry.clone());
        for (url, _) in files {
            let this = self.clone();
            let entry = Arc::clone(&shared);
            let token = token.clone();
            tokio::spawn(async move {
                this.transfer(entry, url, token).await;
            });
        }

        Ok(())
    }

    /// Cancel every in-flight transfer for the model and discard the
    /// aggregate immediately.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        match self.active.lock().await.remove(id) {
            Some(download) => {
                download.token.cancel();
                info!("Canceled download of {id}");
                self.emit(DownloadEvent::Canceled {
                    model: id.to_string(),
                });
                Ok(())
            }
            None => Err(LlamabarError::Download(format!(
                "No active download for {id}"
            ))),
        }
    }

    /// Cancel without erroring when nothing is in flight. Deletion uses
    /// this so a racing download cannot recreate files mid-removal.
    pub async fn cancel_if_active(&self, id: &str) {
        if let Some(download) = self.active.lock().await.remove(id) {
            download.token.cancel();
            info!("Canceled download of {id} ahead of deletion");
            self.emit(DownloadEvent::Canceled {
                model: id.to_string(),
            });
        }
    }

    /// Force the model to report available while its files are removed.
    pub async fn begin_delete(&self, id: &str) {
        self.deleting.lock().await.insert(id.to_string());
    }

    pub async fn finish_delete(&self, id: &str) {
        self.deleting.lock().await.remove(id);
    }

    async fn transfer(&self, entry: Arc<CatalogEntry>, url: String, token: CancellationToken) {
        // Staged path is owned by this task alone. Transfers of a file two
        // builds share must never write through or remove each other's temp.
        let tmp = self.store.stage_path(&url);
        match self.stream_one(&entry.id, &url, &tmp, &token).await {
            Ok(true) => match self.store.commit(&tmp, &url) {
                Ok(actual_size) => self.settle_success(&entry, &url, actual_size).await,
                Err(e) => {
                    warn!("Failed to finalize {url}: {e}");
                    self.settle_failure(&entry, &url, &format!("Failed to finalize: {e}"))
                        .await;
                }
            },
            Ok(false) => {
                debug!("Transfer of {url} canceled");
                let _ = tokio::fs::remove_file(&tmp).await;
            }
            Err(e) => {
                warn!("Transfer of {url} failed: {e}");
                let _ = tokio::fs::remove_file(&tmp).await;
                self.settle_failure(&entry, &url, &e.to_string()).await;
            }
        }
    }

    /// Stream one file into its staged temp path. `Ok(false)` means canceled
    /// or the aggregate disappeared; the caller discards the temp file.
    async fn stream_one(
        &self,
        model_id: &str,
        url: &str,
        tmp: &Path,
        token: &CancellationToken,
    ) -> Result<bool> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LlamabarError::Download(format!("Failed to start download: {e}")))?
            .error_for_status()
            .map_err(|e| LlamabarError::Download(format!("Download failed: {e}")))?;

        if let Some(len) = response.content_length() {
            let mut active = self.active.lock().await;
            if let Some(download) = active.get_mut(model_id) {
                download.progress.record_expected(url, len);
            }
        }

        let file = tokio::fs::File::create(tmp).await?;
        let mut file = tokio::io::BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        loop {
            // A transfer parked on a quiet connection still observes
            // cancellation.
            let next = tokio::select! {
                next = stream.next() => next,
                () = token.cancelled() => return Ok(false),
            };
            let Some(chunk) = next else {
                break;
            };

            let chunk =
                chunk.map_err(|e| LlamabarError::Download(format!("Download error: {e}")))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if !self.note_progress(model_id, url, written).await {
                return Ok(false);
            }
        }

        file.flush().await?;
        Ok(true)
    }

    /// Update the aggregate with this file's byte count, emitting a
    /// throttled progress event. Returns false when the aggregate is gone.
    async fn note_progress(&self, model_id: &str, url: &str, written: u64) -> bool {
        let mut active = self.active.lock().await;
        let Some(download) = active.get_mut(model_id) else {
            return false;
        };

        download.progress.record_written(url, written);

        if download.last_emit.elapsed() >= PROGRESS_EMIT_INTERVAL {
            download.last_emit = Instant::now();
            let completed_bytes = download.progress.completed_bytes();
            let total_bytes = download.progress.total_bytes();
            drop(active);

            self.emit(DownloadEvent::Progress {
                model: model_id.to_string(),
                completed_bytes,
                total_bytes,
            });
        }

        true
    }

    async fn settle_success(&self, entry: &CatalogEntry, url: &str, actual_size: u64) {
        let mut active = self.active.lock().await;
        let Some(download) = active.get_mut(&entry.id) else {
            return;
        };

        download.progress.record_done(url, actual_size);
        let completed_bytes = download.progress.completed_bytes();
        let total_bytes = download.progress.total_bytes();
        let finished = download.progress.all_done();
        if finished {
            active.remove(&entry.id);
        }
        drop(active);

        self.emit(DownloadEvent::Progress {
            model: entry.id.clone(),
            completed_bytes,
            total_bytes,
        });

        if finished {
            if self.store.is_downloaded(entry) {
                info!("Download complete: {}", entry.id);
                self.emit(DownloadEvent::Completed {
                    model: entry.id.clone(),
                });
            } else {
                error!("Download of {} ended with missing files", entry.id);
                self.emit(DownloadEvent::Failed {
                    model: entry.id.clone(),
                    reason: "Some files failed to download".to_string(),
                });
            }
        }
    }

    async fn settle_failure(&self, entry: &CatalogEntry, url: &str, reason: &str) {
        let mut active = self.active.lock().await;
        let Some(download) = active.get_mut(&entry.id) else {
            return;
        };

        download.progress.record_failed(url);
        let all_failed = download.progress.is_empty();
        let finished = download.progress.all_done();
        if all_failed || finished {
            active.remove(&entry.id);
        }
        drop(active);

        if all_failed || finished {
            error!("Download failed: {}", entry.id);
            self.emit(DownloadEvent::Failed {
                model: entry.id.clone(),
                reason: reason.to_string(),
            });
        }
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(Event::Download(event));
    }
}
