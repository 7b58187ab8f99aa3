//! # memattn
//!
//! **Fused memory-efficient attention kernels: dense and block-sparse, CPU and CUDA.**
//!
//! memattn computes `softmax(scale * Q Kᵀ + bias) V`, with optional seeded
//! dropout on the probabilities, without ever materializing the
//! `[M, N]` score matrix. Keys are streamed in tiles and folded into per-row
//! running statistics (online softmax); the forward also emits the per-row
//! log-sum-exp so the backward can recompute probabilities exactly.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  dispatch::KernelRegistry   (one provider per DeviceKind) │
//! └──────────────┬──────────────────────────────┬────────────┘
//!                │                              │
//! ┌──────────────▼─────────────┐  ┌─────────────▼────────────┐
//! │ ops::cpu   (rayon, SIMD)   │  │ ops::cuda  (PTX kernels) │
//! │  attention fwd / bwd       │  │  attention fwd / bwd     │
//! │  sparse spmm / softmax     │  │  sparse spmm / softmax   │
//! └──────────────┬─────────────┘  └─────────────┬────────────┘
//!                │                              │
//! ┌──────────────▼──────────────────────────────▼────────────┐
//! │  kernels (online softmax, tiles, row reductions, atomics) │
//! │  config (capability → tiling)   sparse (CSR structure)    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Extension traits**: [`FusedAttentionOps`] and [`SparseAttentionOps`] are
//!   implemented on each backend client
//! - **Explicit tiling**: [`TilingConfig::for_capability`] picks tile sizes from
//!   a fixed per-device table
//! - **Slice kernels**: every op is also available over raw host buffers for
//!   callers that own their memory

pub mod config;
pub mod dispatch;
pub mod error;
pub mod kernels;
pub mod ops;
pub mod runtime;
pub mod sparse;
pub mod tensor;

pub use config::{Capability, KernelConfig, TilingConfig};
pub use dispatch::{KernelProvider, KernelRegistry};
pub use error::{Error, Result};
pub use kernels::Dropout;
pub use ops::{
    AttentionOptions, AttentionParams, DenseDims, FusedAttentionOps, SparseAttentionOps,
    SpmmDims, default_scale,
};
pub use runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
pub use runtime::{DType, DeviceKind, Runtime};
pub use sparse::CsrPattern;
pub use tensor::Tensor;

#[cfg(feature = "cuda")]
pub use runtime::cuda::{CudaClient, CudaDevice, CudaRuntime};
