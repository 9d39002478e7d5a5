//! Host introspection
//!
//! Memory sizing feeds the catalog compatibility rules, so everything here
//! reports in MiB and stays overridable through the environment.

mod memory;

pub use memory::{total_memory_mb, TOTAL_MEMORY_ENV};
