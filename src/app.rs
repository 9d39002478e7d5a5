//! Application core: catalog, download coordinator and server supervisor
//! wired together, plus the rules that cut across them (a model being
//! deleted must not be running, a model being run must be downloaded).
//!
//! The daemon owns one [`App`]; IPC handlers call into it.

use crate::catalog::{self, Catalog, CatalogEntry};
use crate::config::{self, Config};
use crate::downloads::{DownloadCoordinator, ModelStatus, ModelStore};
use crate::error::{LlamabarError, Result};
use crate::events::{self, DownloadEvent, Event, EventReceiver, EventSender};
use crate::server::{ServerSnapshot, ServerSupervisor};
use crate::system;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// One model's line in the status overview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOverview {
    pub id: String,
    pub name: String,
    pub status: ModelStatus,
    /// The server process is running this model's weights right now.
    pub active: bool,
    /// Fits this machine's memory at the minimum context.
    pub compatible: bool,
    /// Set when incompatible: a short displayable reason.
    pub incompatible_reason: Option<String>,
    /// Context length this machine would run the model at.
    pub fit_context: Option<u32>,
    pub download_size: u64,
}

/// Everything the status command reports in one shot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub server: ServerSnapshot,
    pub models: Vec<ModelOverview>,
}

/// Shared application state. Cheap to clone; clones share the coordinator,
/// supervisor and event channel.
#[derive(Clone)]
pub struct App {
    config: Config,
    catalog: Catalog,
    store: ModelStore,
    downloads: DownloadCoordinator,
    server: ServerSupervisor,
    events: EventSender,
    /// Serializes server-affecting commands so a run and a delete cannot
    /// interleave their stop/start/remove steps.
    command_lock: Arc<Mutex<()>>,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let (events, _) = events::channel();
        Self::with_events(config, events)
    }

    pub fn with_events(config: Config, events: EventSender) -> Result<Self> {
        let store = ModelStore::new(config::models_dir(&config)?)?;
        let downloads = DownloadCoordinator::new(store.clone(), events.clone());
        let server = ServerSupervisor::new(config.clone(), store.clone(), events.clone());

        Ok(Self {
            config,
            catalog: Catalog::curated(),
            store,
            downloads,
            server,
            events,
            command_lock: Arc::new(Mutex::new(())),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Subscribe to download and server events.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    fn entry(&self, model: &str) -> Result<&CatalogEntry> {
        self.catalog.find(model).ok_or_else(|| {
            let message = match self.catalog.suggest(model) {
                Some(hint) => format!("{model}. Did you mean '{hint}'?"),
                None => model.to_string(),
            };
            LlamabarError::UnknownModel(message)
        })
    }

    /// Status rows for every visible catalog entry, in catalog order.
    pub async fn overview(&self) -> Vec<ModelOverview> {
        let total_memory_mb = system::total_memory_mb();
        let show_all = self.config.catalog.show_incompatible;
        let mut rows = Vec::new();

        for entry in self.catalog.visible(show_all, total_memory_mb) {
            let status = self.downloads.status(entry).await;
            let active = self
                .server
                .is_active(&self.store.weights_path(entry))
                .await;
            let compatible = catalog::is_compatible(entry, catalog::MIN_CONTEXT, total_memory_mb);
            let incompatible_reason = if compatible {
                None
            } else {
                catalog::incompatibility_summary(entry, catalog::MIN_CONTEXT, total_memory_mb)
            };

            rows.push(ModelOverview {
                id: entry.id.clone(),
                name: entry.display_name(),
                status,
                active,
                compatible,
                incompatible_reason,
                fit_context: catalog::safe_context_length(entry, None, total_memory_mb),
                download_size: entry.download_size(),
            });
        }
        rows
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            server: self.server.snapshot().await,
            models: self.overview().await,
        }
    }

    /// Begin downloading a model. Returns once the transfers are registered;
    /// completion arrives as events.
    pub async fn download(&self, model: &str) -> Result<()> {
        let entry = self.entry(model)?.clone();
        self.downloads.download(&entry).await
    }

    pub async fn cancel_download(&self, model: &str) -> Result<()> {
        let entry = self.entry(model)?;
        self.downloads.cancel(&entry.id).await
    }

    /// Remove a model's files. Stops the server first when this model is the
    /// one running, and cancels any in-flight download of it.
    pub async fn delete(&self, model: &str) -> Result<()> {
        let entry = self.entry(model)?.clone();
        let _guard = self.command_lock.lock().await;

        // The engine holds the weights mmapped while serving.
        if self
            .server
            .is_active(&self.store.weights_path(&entry))
            .await
        {
            info!("Stopping server before deleting {}", entry.id);
            self.server.stop().await;
        }

        // A transfer finishing mid-removal would recreate files.
        self.downloads.cancel_if_active(&entry.id).await;

        self.downloads.begin_delete(&entry.id).await;
        let result = self.store.delete(&entry, &self.catalog);
        self.downloads.finish_delete(&entry.id).await;
        result?;

        info!("Deleted {}", entry.id);
        let _ = self.events.send(Event::Download(DownloadEvent::Deleted {
            model: entry.id.clone(),
        }));
        Ok(())
    }

    /// Launch the server on a model, replacing whatever is running.
    pub async fn run(&self, model: &str, context: Option<u32>) -> Result<()> {
        let entry = self.entry(model)?.clone();
        let _guard = self.command_lock.lock().await;
        self.server.start(&entry, context).await
    }

    pub async fn stop_server(&self) {
        let _guard = self.command_lock.lock().await;
        self.server.stop().await;
    }

    pub async fn server_snapshot(&self) -> ServerSnapshot {
        self.server.snapshot().await
    }

    /// Daemon teardown: the child process must not outlive us.
    pub async fn shutdown(&self) {
        self.stop_server().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerState;
    use serial_test::serial;
    use tempfile::TempDir;

    fn test_app(tmp: &TempDir) -> App {
        let mut config = Config::default();
        config.models.dir = Some(tmp.path().join("models"));
        App::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_model_gets_suggestion() {
        let tmp = TempDir::new().unwrap();
        let app = test_app(&tmp);

        let err = app.download("gpt-oss-20").await.unwrap_err();
        assert!(err.to_string().contains("gpt-oss-20b"), "{err}");

        let err = app.run("zzzzzz", None).await.unwrap_err();
        assert!(!err.to_string().contains("Did you mean"), "{err}");
    }

    #[tokio::test]
    async fn test_run_requires_full_download() {
        let tmp = TempDir::new().unwrap();
        let app = test_app(&tmp);

        let err = app.run("qwen3-2507-4b-q8", None).await.unwrap_err();
        assert!(err.to_string().contains("not fully downloaded"), "{err}");
        assert!(matches!(
            app.server_snapshot().await.state,
            ServerState::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_files_is_ok() {
        let tmp = TempDir::new().unwrap();
        let app = test_app(&tmp);

        // Nothing downloaded: deletion has nothing to do and succeeds.
        app.delete("gemma-3-4b-q8").await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_overview_reports_download_state() {
        std::env::set_var(system::TOTAL_MEMORY_ENV, "65536");
        let tmp = TempDir::new().unwrap();
        let app = test_app(&tmp);

        let entry = app.catalog().find("gemma-3-4b-q8").unwrap().clone();
        for url in entry.remote_urls() {
            std::fs::write(app.store().local_path(url), b"x").unwrap();
        }

        let rows = app.overview().await;
        let row = rows.iter().find(|r| r.id == "gemma-3-4b-q8").unwrap();
        assert_eq!(row.status, ModelStatus::Downloaded);
        assert!(!row.active);
        assert!(row.compatible);
        assert!(row.fit_context.is_some());

        let other = rows.iter().find(|r| r.id == "qwen3-2507-4b").unwrap();
        assert_eq!(other.status, ModelStatus::Available);
        std::env::remove_var(system::TOTAL_MEMORY_ENV);
    }
}
