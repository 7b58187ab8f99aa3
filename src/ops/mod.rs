pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod params;
pub mod traits;
pub mod validate;

pub use params::AttentionParams;
pub use traits::{AttentionOptions, FusedAttentionOps, SparseAttentionOps, default_scale};
pub use validate::{DenseDims, SpmmDims};
