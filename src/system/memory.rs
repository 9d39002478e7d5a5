use std::sync::OnceLock;
use sysinfo::System;
use tracing::debug;

/// Overrides the detected physical memory, value in MiB.
pub const TOTAL_MEMORY_ENV: &str = "LLAMABAR_TOTAL_MEMORY_MB";

static DETECTED_MB: OnceLock<u64> = OnceLock::new();

/// Total physical memory in MiB.
///
/// The probe runs once per process; the env override is consulted on every
/// call so tests can vary the reported size.
pub fn total_memory_mb() -> u64 {
    if let Ok(value) = std::env::var(TOTAL_MEMORY_ENV) {
        if let Ok(mb) = value.parse::<u64>() {
            return mb;
        }
    }

    *DETECTED_MB.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        let mb = sys.total_memory() / (1024 * 1024);
        debug!("Detected {mb} MiB physical memory");
        mb
    })
}
