use thiserror::Error;

/// Main error type for llamabar
#[derive(Error, Debug)]
pub enum LlamabarError {
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/llamabar/config.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IPC error: {0}\n\nTroubleshooting:\n- Is the daemon running? Start with: llamabar daemon\n- Check socket path under XDG_RUNTIME_DIR\n- Try restarting the daemon")]
    Ipc(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Server-supervision errors. Reason strings are short and displayable;
/// each is terminal for the launch attempt it occurred in.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Model weights or engine binary missing on disk.
    #[error("{0}")]
    InvalidPath(String),

    /// Process spawn failed, or the catalog rejected the model for memory.
    #[error("{0}")]
    Launch(String),

    /// Process started but never answered the health endpoint in time.
    #[error("Server did not become healthy in time")]
    HealthCheckFailed,
}

pub type Result<T> = std::result::Result<T, LlamabarError>;
