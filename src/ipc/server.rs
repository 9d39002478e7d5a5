use crate::app::App;
use crate::error::{LlamabarError, Result};
use crate::ipc::{self, Command, Response};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Unix socket IPC server. Each connection carries one command; `Watch`
/// connections stay open for event streaming.
pub struct IpcServer {
    socket_path: PathBuf,
    app: App,
}

impl IpcServer {
    #[must_use]
    pub fn new(app: App) -> Self {
        Self {
            socket_path: ipc::socket_path(),
            app,
        }
    }

    /// Override socket path (for testing)
    #[must_use]
    pub fn with_socket_path(mut self, socket_path: PathBuf) -> Self {
        self.socket_path = socket_path;
        self
    }

    /// Bind the socket and serve until the future is dropped.
    pub async fn start(self) -> Result<()> {
        // A stale socket from a crashed daemon blocks the bind.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| LlamabarError::Ipc(format!("Failed to remove old socket: {e}")))?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            LlamabarError::Ipc(format!(
                "Failed to bind socket at {}: {e}",
                self.socket_path.display()
            ))
        })?;

        info!("IPC server listening on {}", self.socket_path.display());

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let app = self.app.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, app).await {
                            error!("Client handler error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {e}");
                }
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

async fn handle_client(stream: UnixStream, app: App) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let line = lines
        .next_line()
        .await
        .map_err(|e| LlamabarError::Ipc(format!("Failed to read from client: {e}")))?;
    let Some(line) = line else {
        return Ok(());
    };

    let command: Command = serde_json::from_str(&line)
        .map_err(|e| LlamabarError::Ipc(format!("Invalid command: {e}")))?;

    debug!("Received command: {command:?}");

    let response = match command {
        Command::Watch => return stream_events(writer, app).await,
        Command::Status => Response::Status(app.status().await),
        Command::Download { model } => reply(app.download(&model).await),
        Command::CancelDownload { model } => reply(app.cancel_download(&model).await),
        Command::DeleteModel { model } => reply(app.delete(&model).await),
        Command::Run { model, context } => reply(app.run(&model, context).await),
        Command::StopServer => {
            app.stop_server().await;
            Response::Ok
        }
    };

    write_line(&mut writer, &response).await
}

fn reply(result: Result<()>) -> Response {
    match result {
        Ok(()) => Response::Ok,
        Err(e) => Response::Error(e.to_string()),
    }
}

async fn write_line<T: serde::Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> Result<()> {
    let mut payload = serde_json::to_vec(value)
        .map_err(|e| LlamabarError::Ipc(format!("Failed to serialize response: {e}")))?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|e| LlamabarError::Ipc(format!("Failed to write response: {e}")))?;
    Ok(())
}

/// Forward daemon events to the client until either side goes away.
async fn stream_events(mut writer: OwnedWriteHalf, app: App) -> Result<()> {
    let mut events = app.subscribe();
    // Ack after subscribing, so a client that acts on the ack cannot race
    // past its own event feed.
    write_line(&mut writer, &Response::Ok).await?;
    loop {
        match events.recv().await {
            Ok(event) => {
                let mut payload = serde_json::to_vec(&event)
                    .map_err(|e| LlamabarError::Ipc(format!("Failed to serialize event: {e}")))?;
                payload.push(b'\n');
                if writer.write_all(&payload).await.is_err() {
                    // Client disconnected; nothing to report.
                    return Ok(());
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event subscriber lagged by {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
