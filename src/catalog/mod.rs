//! Curated model catalog
//!
//! Families nest size variants, variants nest quantized builds. The rest of
//! the app works on the flattened [`CatalogEntry`] view; the fit functions
//! decide what this machine can actually run and at what context length.

mod entry;
mod fit;
mod registry;

pub use entry::{flatten, CatalogEntry, ModelBuild, ModelFamily, ModelVariant, Quant};
pub use fit::{
    available_model_bytes, estimated_runtime_bytes, incompatibility_summary, is_compatible,
    model_memory_fraction, safe_context_length, CONTEXT_STEP, MIN_CONTEXT,
};
pub use registry::{Catalog, FAMILIES};
