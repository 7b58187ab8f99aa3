//! Execution backends.
//!
//! A [`Runtime`] names where tensor storage lives and which client launches
//! work on it. Buffers are owned by the caller; the kernels only read inputs
//! and populate freshly allocated outputs.

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device family an operation table entry serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda => write!(f, "cuda"),
        }
    }
}

/// Element type of a tensor's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
        }
    }
}

/// A physical device a tensor can reside on.
pub trait Device: Clone + fmt::Debug + PartialEq + Send + Sync {
    fn id(&self) -> usize;
}

/// Typed element storage owned by a tensor.
pub trait Storage: Send + Sync {
    fn dtype(&self) -> DType;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backend marker tying a device type to its storage type.
pub trait Runtime: Clone + fmt::Debug + Send + Sync + 'static {
    type Device: Device;
    type Storage: Storage;

    const KIND: DeviceKind;
}
