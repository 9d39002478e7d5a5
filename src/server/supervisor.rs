use crate::catalog::{self, CatalogEntry};
use crate::config::{self, Config};
use crate::downloads::ModelStore;
use crate::error::{LlamabarError, Result, ServerError};
use crate::events::{Event, EventSender, ServerEvent};
use crate::server::{footprint, launch};
use crate::system;
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const HEALTH_ATTEMPTS: u32 = 15;
const HEALTH_INTERVAL: Duration = Duration::from_secs(2);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const MEMORY_INTERVAL: Duration = Duration::from_secs(2);
/// Grace between SIGTERM and SIGKILL; also the bound on how long `stop`
/// can block.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of the single engine process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    #[default]
    Idle,
    /// Spawned, health not yet confirmed.
    Loading,
    /// Health check passed.
    Running,
    /// Terminal for this launch attempt; the reason is displayable.
    Error(String),
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Idle => write!(f, "idle"),
            ServerState::Loading => write!(f, "loading"),
            ServerState::Running => write!(f, "running"),
            ServerState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Point-in-time view for status displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub state: ServerState,
    pub model: Option<String>,
    pub context: Option<u32>,
    pub memory_mb: Option<u64>,
    /// Base URL of the chat endpoint, present while running.
    pub url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    state: ServerState,
    /// Identity key for "is this model active": the weights path captured
    /// at launch.
    active_path: Option<PathBuf>,
    model_id: Option<String>,
    context: Option<u32>,
    memory_mb: Option<u64>,
    child_pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    /// Bumped per launch attempt; loops from superseded launches compare
    /// and bail.
    generation: u64,
}

/// Owns the one external inference-server process.
///
/// Cheap to clone; clones share the same process slot and state. Lock order
/// is always `inner` before `child`.
#[derive(Clone)]
pub struct ServerSupervisor {
    config: Config,
    store: ModelStore,
    client: reqwest::Client,
    events: EventSender,
    inner: Arc<Mutex<Inner>>,
    child: Arc<Mutex<Option<Child>>>,
}

impl ServerSupervisor {
    #[must_use]
    pub fn new(config: Config, store: ModelStore, events: EventSender) -> Self {
        Self {
            config,
            store,
            client: reqwest::Client::new(),
            events,
            inner: Arc::new(Mutex::new(Inner::default())),
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// Launch the engine for a catalog entry, replacing any process already
    /// running. `desired_context` caps the computed context when given.
    ///
    /// Returns once the process is spawned and health polling has begun;
    /// the outcome arrives as state transitions and events.
    pub async fn start(&self, entry: &CatalogEntry, desired_context: Option<u32>) -> Result<()> {
        // At most one engine process exists; it binds a fixed port.
        self.stop().await;

        // Validate every file, shards and projector included; the engine
        // mmaps them all at load.
        let missing = self.store.files_required(entry);
        if !missing.is_empty() {
            let err = ServerError::InvalidPath(format!(
                "Model {} is not fully downloaded ({} file(s) missing)",
                entry.id,
                missing.len()
            ));
            return Err(self.fail(err).await);
        }
        let weights = self.store.weights_path(entry);
        let mmproj = self.store.mmproj_path(entry);

        let engine = match launch::find_engine(&self.config) {
            Ok(engine) => engine,
            Err(err) => return Err(self.fail(err).await),
        };

        let generation = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.state = ServerState::Loading;
            inner.active_path = Some(weights.clone());
            inner.model_id = Some(entry.id.clone());
            // Requested context; replaced by the applied one after the fit.
            inner.context = desired_context;
            inner.memory_mb = None;
            inner.child_pid = None;
            inner.started_at = None;
            inner.generation
        };
        self.emit(ServerEvent::Loading {
            model: entry.id.clone(),
        });

        let total_memory_mb = system::total_memory_mb();
        let Some(context) = catalog::safe_context_length(entry, desired_context, total_memory_mb)
        else {
            let reason =
                catalog::incompatibility_summary(entry, catalog::MIN_CONTEXT, total_memory_mb)
                    .unwrap_or_else(|| {
                        "Requested context is below the 4096-token minimum".to_string()
                    });
            return Err(self.fail(ServerError::Launch(reason)).await);
        };

        let log_file = match config::server_log_path(&self.config) {
            Ok(path) => path,
            Err(e) => {
                let err = ServerError::Launch(format!("Log path unavailable: {e}"));
                return Err(self.fail(err).await);
            }
        };
        if let Some(parent) = log_file.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                let err = ServerError::Launch(format!("Cannot create log directory: {e}"));
                return Err(self.fail(err).await);
            }
        }

        let port = self.config.server.port;
        let args = launch::build_args(
            entry,
            &weights,
            mmproj.as_deref(),
            context,
            port,
            &log_file,
            total_memory_mb,
        );

        info!(
            "Launching {} for {} with context {context}",
            engine.display(),
            entry.id
        );
        debug!("Engine args: {args:?}");

        let engine_dir = engine
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut command = Command::new(&engine);
        command
            .args(&args)
            .current_dir(&engine_dir)
            .env(launch::ENGINE_ENV.0, launch::ENGINE_ENV.1)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = ServerError::Launch(format!("Failed to spawn engine: {e}"));
                return Err(self.fail(err).await);
            }
        };

        let pid = child.id();
        Self::drain_pipes(&mut child);

        {
            let mut inner = self.inner.lock().await;
            inner.context = Some(context);
            inner.child_pid = pid;
            inner.started_at = Some(Utc::now());
        }
        *self.child.lock().await = Some(child);

        self.spawn_health_loop(generation, entry.id.clone(), context, port);
        Ok(())
    }

    /// Graceful terminate with a forced kill after [`KILL_GRACE`]. Safe to
    /// call when nothing is running.
    pub async fn stop(&self) {
        // Active state clears before any signal: the loops and the crash
        // path must observe an explicit stop, never report it as a crash.
        {
            let mut inner = self.inner.lock().await;
            inner.state = ServerState::Idle;
            inner.active_path = None;
            inner.model_id = None;
            inner.context = None;
            inner.memory_mb = None;
            inner.child_pid = None;
            inner.started_at = None;
        }

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };

        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to engine pid {pid}");
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        tokio::select! {
            _ = child.wait() => {}
            () = tokio::time::sleep(KILL_GRACE) => {
                warn!("Engine ignored SIGTERM, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        info!("Server stopped");
        self.emit(ServerEvent::Stopped);
    }

    pub async fn state(&self) -> ServerState {
        self.inner.lock().await.state.clone()
    }

    pub async fn snapshot(&self) -> ServerSnapshot {
        let inner = self.inner.lock().await;
        let url = matches!(inner.state, ServerState::Running)
            .then(|| format!("http://127.0.0.1:{}", self.config.server.port));
        ServerSnapshot {
            state: inner.state.clone(),
            model: inner.model_id.clone(),
            context: inner.context,
            memory_mb: inner.memory_mb,
            url,
            started_at: inner.started_at,
        }
    }

    /// Is this weights path the one the active process was launched with?
    pub async fn is_active(&self, weights: &Path) -> bool {
        self.inner.lock().await.active_path.as_deref() == Some(weights)
    }

    pub async fn active_model(&self) -> Option<String> {
        self.inner.lock().await.model_id.clone()
    }

    /// Mark the launch failed and surface the reason. Used for every
    /// pre-health failure: validation, fit rejection, spawn.
    async fn fail(&self, err: ServerError) -> LlamabarError {
        let reason = err.to_string();
        {
            let mut inner = self.inner.lock().await;
            inner.state = ServerState::Error(reason.clone());
            inner.active_path = None;
            inner.model_id = None;
            inner.context = None;
            inner.memory_mb = None;
            inner.child_pid = None;
            inner.started_at = None;
        }
        warn!("Launch failed: {reason}");
        self.emit(ServerEvent::Failed { reason });
        LlamabarError::Server(err)
    }

    /// Diagnostic readers for the child's pipes. Each detaches itself at
    /// end-of-stream.
    fn drain_pipes(child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "engine", "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "engine", "{line}");
                }
            });
        }
    }

    fn spawn_health_loop(&self, generation: u64, model: String, context: u32, port: u16) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_health_loop(generation, model, context, port).await;
        });
    }

    /// Poll the health endpoint until the first 200, a crash, or
    /// exhaustion.
    async fn run_health_loop(&self, generation: u64, model: String, context: u32, port: u16) {
        let url = format!("http://127.0.0.1:{port}/health");

        for attempt in 1..=HEALTH_ATTEMPTS {
            tokio::time::sleep(HEALTH_INTERVAL).await;

            {
                let inner = self.inner.lock().await;
                if inner.generation != generation || inner.state != ServerState::Loading {
                    return;
                }
            }

            if self.reap_if_exited(generation).await {
                return;
            }

            match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    let mut inner = self.inner.lock().await;
                    // A health success racing a stop must not resurrect a
                    // dead state.
                    if inner.generation == generation && inner.state == ServerState::Loading {
                        inner.state = ServerState::Running;
                        drop(inner);
                        info!("Server healthy after {attempt} attempt(s)");
                        self.emit(ServerEvent::Running {
                            model: model.clone(),
                            context,
                        });
                        self.spawn_memory_loop(generation);
                    }
                    return;
                }
                Ok(resp) => {
                    debug!(
                        "Health attempt {attempt}/{HEALTH_ATTEMPTS}: HTTP {}",
                        resp.status()
                    );
                }
                Err(e) => {
                    debug!("Health attempt {attempt}/{HEALTH_ATTEMPTS}: {e}");
                }
            }
        }

        // Exhausted. The process never became ready; reclaim it so nothing
        // stays referenced as active.
        let reclaim = {
            let inner = self.inner.lock().await;
            if inner.generation != generation || inner.state == ServerState::Idle {
                return;
            }
            self.child.lock().await.take()
        };
        if let Some(mut child) = reclaim {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        let mut inner = self.inner.lock().await;
        if inner.generation == generation && inner.state != ServerState::Idle {
            let reason = ServerError::HealthCheckFailed.to_string();
            inner.state = ServerState::Error(reason.clone());
            inner.active_path = None;
            inner.model_id = None;
            inner.context = None;
            inner.memory_mb = None;
            inner.child_pid = None;
            inner.started_at = None;
            drop(inner);
            warn!("Health polling exhausted after {HEALTH_ATTEMPTS} attempts");
            self.emit(ServerEvent::Failed { reason });
        }
    }

    fn spawn_memory_loop(&self, generation: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_memory_loop(generation).await;
        });
    }

    /// Publish resident-memory samples while running. The state is
    /// re-checked at the top of every tick so a stale loop from a fast
    /// stop/restart cycle dies on its next wakeup.
    async fn run_memory_loop(&self, generation: u64) {
        loop {
            tokio::time::sleep(MEMORY_INTERVAL).await;

            let pid = {
                let inner = self.inner.lock().await;
                if inner.generation != generation || inner.state != ServerState::Running {
                    return;
                }
                inner.child_pid
            };

            if self.reap_if_exited(generation).await {
                return;
            }

            let Some(pid) = pid else {
                return;
            };
            if let Some(used_mb) = footprint::sample_memory_mb(pid).await {
                let mut inner = self.inner.lock().await;
                if inner.generation == generation && inner.state == ServerState::Running {
                    inner.memory_mb = Some(used_mb);
                    drop(inner);
                    self.emit(ServerEvent::Memory { used_mb });
                }
            }
        }
    }

    /// Non-blocking exit check. On an exit the supervisor did not initiate,
    /// status 0 goes idle and anything else becomes a crash error. Returns
    /// true when the caller's launch is over and its loop must end.
    async fn reap_if_exited(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation
            || !matches!(inner.state, ServerState::Loading | ServerState::Running)
        {
            return true;
        }

        let status = {
            let mut slot = self.child.lock().await;
            match slot.as_mut() {
                // stop() already reclaimed the process.
                None => return true,
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        slot.take();
                        Some(status)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!("Exit check failed: {e}");
                        None
                    }
                },
            }
        };
        let Some(status) = status else {
            return false;
        };

        let clean = status.success();
        inner.state = if clean {
            ServerState::Idle
        } else {
            ServerState::Error("Process crashed".to_string())
        };
        inner.active_path = None;
        inner.model_id = None;
        inner.context = None;
        inner.memory_mb = None;
        inner.child_pid = None;
        inner.started_at = None;
        drop(inner);

        if clean {
            info!("Engine exited cleanly");
            self.emit(ServerEvent::Stopped);
        } else {
            warn!("Engine exited with {status}");
            self.emit(ServerEvent::Failed {
                reason: "Process crashed".to_string(),
            });
        }
        true
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(Event::Server(event));
    }
}
