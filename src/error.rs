//! memattn error types

use crate::runtime::{DType, DeviceKind};

/// memattn result type
pub type Result<T> = std::result::Result<T, Error>;

/// memattn errors
///
/// Validation failures and device failures share this single channel. Every
/// precondition is checked before a kernel is launched or an output buffer is
/// allocated, so an `Err` means no partial computation happened.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Tensor shape does not match what the operation requires
    #[error("shape mismatch for '{arg}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Argument name
        arg: &'static str,
        /// Required shape
        expected: Vec<usize>,
        /// Actual shape
        got: Vec<usize>,
    },

    /// Element type not supported by the kernel
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },

    /// Kernels only read dense row-major buffers
    #[error("'{arg}' must be contiguous (row-major)")]
    NotContiguous {
        /// Argument name
        arg: &'static str,
    },

    /// Operands live on different devices
    #[error("device mismatch for '{arg}': {reason}")]
    DeviceMismatch {
        /// Argument name
        arg: &'static str,
        /// Description of the mismatch
        reason: String,
    },

    /// Feature dimension exceeds the per-row accumulator capacity of the tiling
    #[error("head_dim {head_dim} exceeds the per-row accumulator capacity ({max})")]
    UnsupportedHeadDim {
        /// Requested feature dimension
        head_dim: usize,
        /// Largest supported feature dimension
        max: usize,
    },

    /// Malformed CSR row structure
    #[error("invalid sparse pattern: {reason}")]
    InvalidSparsePattern {
        /// Description of what went wrong
        reason: String,
    },

    /// Device launch, synchronization or module loading failure
    #[error("kernel error: {reason}")]
    KernelError {
        /// Description of what went wrong
        reason: String,
    },

    /// No provider registered for the requested device kind
    #[error("backend unavailable: {kind}")]
    BackendUnavailable {
        /// Requested device kind
        kind: DeviceKind,
    },

    /// Configuration loading or validation error
    #[error("config error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },
}
