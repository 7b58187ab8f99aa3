//! Kernel configuration.
//!
//! Tiling is chosen by an explicit capability lookup: the device family, the
//! compute capability (CUDA) and the feature dimension select one row of a
//! fixed table. Each row is a plain [`TilingConfig`]; nothing is derived at
//! compile time.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runtime::{DType, DeviceKind};

/// Register accumulator buckets of the CUDA kernels, in floats per query row.
/// 32 is the reference tiling.
pub const CUDA_HEAD_DIM_BUCKETS: [usize; 3] = [32, 64, 128];

/// Per-row feature capacity of the host kernels.
pub const CPU_MAX_HEAD_DIM: usize = 512;

/// What the dispatcher knows about the target when picking a tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub kind: DeviceKind,
    /// (major, minor) for CUDA devices.
    pub compute_capability: Option<(u32, u32)>,
    pub dtype: DType,
}

impl Capability {
    pub fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            compute_capability: None,
            dtype: DType::F32,
        }
    }

    pub fn cuda(major: u32, minor: u32) -> Self {
        Self {
            kind: DeviceKind::Cuda,
            compute_capability: Some((major, minor)),
            dtype: DType::F32,
        }
    }
}

/// Tile sizes for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingConfig {
    /// Query rows processed together (one thread per row on CUDA).
    pub queries_per_block: usize,
    /// Key/value rows staged per step of the streaming scan.
    pub keys_per_block: usize,
    /// Largest feature dimension whose per-row accumulator fits the tile.
    pub max_head_dim: usize,
}

impl TilingConfig {
    pub const CPU: TilingConfig = TilingConfig {
        queries_per_block: 16,
        keys_per_block: 64,
        max_head_dim: CPU_MAX_HEAD_DIM,
    };

    /// Turing (sm_75): 64 KB of shared memory per SM, smaller query blocks.
    pub const CUDA_SM75: TilingConfig = TilingConfig {
        queries_per_block: 64,
        keys_per_block: 32,
        max_head_dim: 128,
    };

    /// Ampere and newer (sm_80+).
    pub const CUDA_SM80: TilingConfig = TilingConfig {
        queries_per_block: 128,
        keys_per_block: 32,
        max_head_dim: 128,
    };

    /// Pick the tiling for `cap` and check that `head_dim` fits it.
    pub fn for_capability(cap: &Capability, head_dim: usize) -> Result<Self> {
        if cap.dtype != DType::F32 {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: cap.dtype,
            });
        }
        let tiling = match (cap.kind, cap.compute_capability) {
            (DeviceKind::Cpu, _) => Self::CPU,
            (DeviceKind::Cuda, Some((major, _))) if major >= 8 => Self::CUDA_SM80,
            (DeviceKind::Cuda, Some((7, minor))) if minor >= 5 => Self::CUDA_SM75,
            (DeviceKind::Cuda, cc) => {
                return Err(Error::InvalidArgument {
                    arg: "compute_capability",
                    reason: format!("unsupported CUDA compute capability {cc:?}, need sm_75+"),
                });
            }
        };
        tiling.check_head_dim(head_dim)?;
        log::debug!(
            "memattn: tiling for {:?} head_dim={}: {}x{} (max {})",
            cap,
            head_dim,
            tiling.queries_per_block,
            tiling.keys_per_block,
            tiling.max_head_dim
        );
        Ok(tiling)
    }

    pub fn check_head_dim(&self, head_dim: usize) -> Result<()> {
        if head_dim > self.max_head_dim {
            return Err(Error::UnsupportedHeadDim {
                head_dim,
                max: self.max_head_dim,
            });
        }
        Ok(())
    }

    pub fn validate(&self, kind: DeviceKind) -> Result<()> {
        if self.queries_per_block == 0 || self.keys_per_block == 0 || self.max_head_dim == 0 {
            return Err(Error::Config {
                reason: format!("tile sizes must be non-zero: {self:?}"),
            });
        }
        if kind == DeviceKind::Cuda
            && (self.queries_per_block % 32 != 0 || self.keys_per_block % 32 != 0)
        {
            return Err(Error::Config {
                reason: format!("CUDA tile sizes must be multiples of 32: {self:?}"),
            });
        }
        Ok(())
    }
}

/// Smallest CUDA accumulator bucket holding `head_dim` floats.
pub fn cuda_head_dim_bucket(head_dim: usize) -> Result<usize> {
    CUDA_HEAD_DIM_BUCKETS
        .iter()
        .copied()
        .find(|&b| head_dim <= b)
        .ok_or(Error::UnsupportedHeadDim {
            head_dim,
            max: CUDA_HEAD_DIM_BUCKETS[CUDA_HEAD_DIM_BUCKETS.len() - 1],
        })
}

/// Runtime configuration, loadable from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Size of a dedicated host thread pool. `None` uses rayon's global pool.
    #[serde(default)]
    pub num_threads: Option<usize>,

    /// Overrides [`TilingConfig::CPU`].
    #[serde(default)]
    pub cpu_tiling: Option<TilingConfig>,

    /// Ordinal of the CUDA device the registry binds to.
    #[serde(default)]
    pub cuda_device: usize,
}

impl KernelConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
            reason: format!("IO error reading {}: {e}", path.as_ref().display()),
        })?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == Some(0) {
            return Err(Error::Config {
                reason: "num_threads must be > 0".into(),
            });
        }
        if let Some(tiling) = &self.cpu_tiling {
            tiling.validate(DeviceKind::Cpu)?;
        }
        Ok(())
    }

    /// Host tiling after applying the override, checked against `head_dim`.
    pub fn cpu_tiling(&self, head_dim: usize) -> Result<TilingConfig> {
        let tiling = match self.cpu_tiling {
            Some(t) => t,
            None => TilingConfig::for_capability(&Capability::cpu(), head_dim)?,
        };
        tiling.check_head_dim(head_dim)?;
        Ok(tiling)
    }
}
