pub mod attention;
pub mod sparse;

pub use attention::{AttentionOptions, FusedAttentionOps, default_scale};
pub use sparse::SparseAttentionOps;
