//! Memory-aware compatibility and context sizing
//!
//! All budget arithmetic uses binary units to match OS-reported physical
//! memory. Decimal units belong to download progress display only.

use crate::catalog::CatalogEntry;

/// Models below this architectural context floor are never offered.
pub const MIN_CONTEXT: u32 = 4096;
/// Chosen contexts are floored to this granularity.
pub const CONTEXT_STEP: u32 = 1024;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Hosts at or above 128 GiB keep 25% headroom for the OS; smaller hosts
/// keep half.
const LARGE_HOST_MB: u64 = 128 * 1024;
const LARGE_HOST_FRACTION: f64 = 0.75;
const SMALL_HOST_FRACTION: f64 = 0.50;

/// Fraction of physical memory considered spendable on model weights and
/// KV cache.
#[must_use]
pub fn model_memory_fraction(total_memory_mb: u64) -> f64 {
    if total_memory_mb >= LARGE_HOST_MB {
        LARGE_HOST_FRACTION
    } else {
        SMALL_HOST_FRACTION
    }
}

/// Bytes available for a model on a host with the given physical memory.
#[must_use]
pub fn available_model_bytes(total_memory_mb: u64) -> u64 {
    let total_bytes = total_memory_mb.saturating_mul(MIB);
    (total_bytes as f64 * model_memory_fraction(total_memory_mb)) as u64
}

/// Estimated resident bytes for the entry at the given context length:
/// weight file plus KV cache.
#[must_use]
pub fn estimated_runtime_bytes(entry: &CatalogEntry, context: u32) -> u64 {
    let kv = entry
        .kv_cache_per_1k
        .saturating_mul(u64::from(context))
        / u64::from(CONTEXT_STEP);
    entry.file_size.saturating_add(kv)
}

/// Largest context that fits the memory budget, or `None` when the entry
/// cannot run on this host at all.
///
/// `desired` caps the result when positive; otherwise the architectural max
/// is the target. The result is always a multiple of [`CONTEXT_STEP`], never
/// below [`MIN_CONTEXT`] and never above the architectural max.
#[must_use]
pub fn safe_context_length(
    entry: &CatalogEntry,
    desired: Option<u32>,
    total_memory_mb: u64,
) -> Option<u32> {
    if entry.max_context < MIN_CONTEXT {
        return None;
    }
    if total_memory_mb == 0 {
        return None;
    }

    let available = available_model_bytes(total_memory_mb);
    if entry.file_size > available {
        return None;
    }

    let desired = desired.filter(|&d| d > 0).unwrap_or(entry.max_context);

    let remaining = available - entry.file_size;
    let affordable = if entry.kv_cache_per_1k == 0 {
        // Context cost negligible or baked into the file size.
        entry.max_context
    } else {
        let tokens = remaining.saturating_mul(u64::from(CONTEXT_STEP)) / entry.kv_cache_per_1k;
        u32::try_from(tokens).unwrap_or(u32::MAX)
    };

    let fit = entry.max_context.min(desired).min(affordable);
    if fit < MIN_CONTEXT {
        return None;
    }

    // Floor, never round up: the result must stay under the affordable
    // ceiling.
    let mut fit = (fit / CONTEXT_STEP) * CONTEXT_STEP;
    if fit < MIN_CONTEXT {
        fit = MIN_CONTEXT;
    }
    if fit > entry.max_context {
        fit = entry.max_context;
    }

    Some(fit)
}

/// Badge check used by catalog listings: does the entry fit at the given
/// context length?
#[must_use]
pub fn is_compatible(entry: &CatalogEntry, context: u32, total_memory_mb: u64) -> bool {
    if entry.max_context < MIN_CONTEXT {
        return false;
    }
    estimated_runtime_bytes(entry, context) <= available_model_bytes(total_memory_mb)
}

/// User-facing reason an entry does not fit, `None` when it does.
///
/// The memory figure is the minimum total RAM the host would need, not the
/// shortfall.
#[must_use]
pub fn incompatibility_summary(
    entry: &CatalogEntry,
    context: u32,
    total_memory_mb: u64,
) -> Option<String> {
    if entry.max_context < MIN_CONTEXT {
        return Some("Requires models with 4k+ context".to_string());
    }

    let needed = estimated_runtime_bytes(entry, context);
    if needed <= available_model_bytes(total_memory_mb) {
        return None;
    }

    let fraction = model_memory_fraction(total_memory_mb);
    let needed_total_gb = ((needed as f64 / fraction) / GIB as f64).ceil() as u64;
    Some(format!("Requires {needed_total_gb} GB+ of memory"))
}
