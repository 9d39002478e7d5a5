use crate::catalog::CatalogEntry;
use crate::config::Config;
use crate::error::ServerError;
use std::path::{Path, PathBuf};

/// Hosts with at least this much memory get a larger batch size.
const HIGH_MEMORY_MB: u64 = 32 * 1024;

/// Residency workaround passed to every engine child. Known stability
/// issue with Metal residency sets under memory pressure; do not remove.
pub const ENGINE_ENV: (&str, &str) = ("GGML_METAL_NO_RESIDENCY", "1");

/// Locate the llama-server binary: config override, then a copy bundled
/// next to our own executable, then $PATH.
pub fn find_engine(config: &Config) -> Result<PathBuf, ServerError> {
    if let Some(path) = &config.server.engine_path {
        if path.exists() {
            return Ok(path.clone());
        }
        return Err(ServerError::InvalidPath(format!(
            "Engine not found at configured path: {}",
            path.display()
        )));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let bundled = dir.join("llama-server");
            if bundled.exists() {
                return Ok(bundled);
            }
        }
    }

    which::which("llama-server").map_err(|_| {
        ServerError::InvalidPath(
            "llama-server not found; install it or set server.engine_path in config".to_string(),
        )
    })
}

/// Build the full engine command line for one launch.
///
/// Fixed flags first, then the catalog's per-model flags so they can
/// override positionally. Any context flag in the catalog args is stripped:
/// the computed safe context always wins over a stale default.
#[must_use]
pub fn build_args(
    entry: &CatalogEntry,
    weights: &Path,
    mmproj: Option<&Path>,
    context: u32,
    port: u16,
    log_file: &Path,
    total_memory_mb: u64,
) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        weights.display().to_string(),
        "--port".to_string(),
        port.to_string(),
        "--alias".to_string(),
        entry.display_name(),
        "--log-file".to_string(),
        log_file.display().to_string(),
        "--no-mmap".to_string(),
        "--jinja".to_string(),
        "-c".to_string(),
        context.to_string(),
    ];

    if total_memory_mb >= HIGH_MEMORY_MB {
        args.push("-ub".to_string());
        args.push("2048".to_string());
    }

    if let Some(mmproj) = mmproj {
        args.push("--mmproj".to_string());
        args.push(mmproj.display().to_string());
    }

    args.extend(strip_context_flags(&entry.server_args));
    args
}

/// Drop `-c`/`--ctx-size` and their values from catalog-supplied args.
fn strip_context_flags(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg == "-c" || arg == "--ctx-size" {
            skip_value = true;
            continue;
        }
        out.push(arg.clone());
    }
    out
}
