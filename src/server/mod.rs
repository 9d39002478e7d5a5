//! Supervision of the external `llama-server` process: argument assembly,
//! launch, health confirmation, memory sampling, and shutdown.

mod footprint;
mod launch;
mod supervisor;

pub use footprint::sample_memory_mb;
pub use launch::{build_args, find_engine, ENGINE_ENV};
pub use supervisor::{ServerSnapshot, ServerState, ServerSupervisor};
