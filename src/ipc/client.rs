use crate::error::{LlamabarError, Result};
use crate::events::Event;
use crate::ipc::{self, Command, Response};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;

/// IPC client for sending commands to the daemon
pub struct IpcClient {
    socket_path: PathBuf,
}

/// Open event feed from a `Watch` command. Ends when the daemon goes away.
pub struct EventStream {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

impl EventStream {
    /// Next event, `None` once the daemon closes the stream.
    pub async fn next(&mut self) -> Result<Option<Event>> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|e| LlamabarError::Ipc(format!("Event stream error: {e}")))?;
        let Some(line) = line else {
            return Ok(None);
        };
        let event = serde_json::from_str(&line)
            .map_err(|e| LlamabarError::Ipc(format!("Invalid event: {e}")))?;
        Ok(Some(event))
    }
}

impl IpcClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            socket_path: ipc::socket_path(),
        }
    }

    /// Create client with custom socket path (for testing)
    #[must_use]
    pub const fn with_socket_path(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send one command and wait for the daemon's response.
    pub async fn send(&self, command: &Command) -> Result<Response> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();

        Self::write_command(&mut writer, command).await?;

        let mut lines = BufReader::new(reader).lines();
        Self::read_response(&mut lines).await
    }

    /// Subscribe to daemon events. The returned stream yields every download
    /// and server event from the moment the daemon acknowledges.
    pub async fn watch(&self) -> Result<EventStream> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();

        Self::write_command(&mut writer, &Command::Watch).await?;

        let mut lines = BufReader::new(reader).lines();
        match Self::read_response(&mut lines).await? {
            Response::Ok => Ok(EventStream { lines }),
            Response::Error(message) => Err(LlamabarError::Ipc(message)),
            Response::Status(_) => Err(LlamabarError::Ipc(
                "Unexpected response to watch".to_string(),
            )),
        }
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            LlamabarError::Ipc(format!(
                "Could not connect to daemon at {}: {e}",
                self.socket_path.display()
            ))
        })
    }

    async fn write_command(
        writer: &mut tokio::net::unix::OwnedWriteHalf,
        command: &Command,
    ) -> Result<()> {
        let mut payload = serde_json::to_vec(command)
            .map_err(|e| LlamabarError::Ipc(format!("Failed to serialize command: {e}")))?;
        payload.push(b'\n');
        writer
            .write_all(&payload)
            .await
            .map_err(|e| LlamabarError::Ipc(format!("Failed to send command: {e}")))?;
        Ok(())
    }

    async fn read_response(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Response> {
        let line = lines
            .next_line()
            .await
            .map_err(|e| LlamabarError::Ipc(format!("Failed to read response: {e}")))?;
        let Some(line) = line else {
            return Err(LlamabarError::Ipc(
                "Connection closed before response".to_string(),
            ));
        };
        serde_json::from_str(&line)
            .map_err(|e| LlamabarError::Ipc(format!("Invalid response: {e}")))
    }
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}
