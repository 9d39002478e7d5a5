pub mod app;
pub mod catalog;
pub mod config;
pub mod downloads;
pub mod error;
pub mod events;
pub mod ipc;
pub mod server;
pub mod system;

pub use error::{LlamabarError, Result};
