//! Host runtime: tensors in system memory, work scheduled on rayon.

use std::sync::Arc;

use half::{bf16, f16};
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{DType, Device, DeviceKind, Runtime, Storage};
use crate::config::KernelConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct CpuRuntime;

impl Runtime for CpuRuntime {
    type Device = CpuDevice;
    type Storage = HostStorage;

    const KIND: DeviceKind = DeviceKind::Cpu;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl CpuDevice {
    pub fn new() -> Self {
        Self
    }
}

impl Device for CpuDevice {
    fn id(&self) -> usize {
        0
    }
}

/// Host element storage.
#[derive(Debug, Clone)]
pub enum HostStorage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
}

impl Storage for HostStorage {
    fn dtype(&self) -> DType {
        match self {
            HostStorage::F32(_) => DType::F32,
            HostStorage::F16(_) => DType::F16,
            HostStorage::BF16(_) => DType::BF16,
        }
    }

    fn len(&self) -> usize {
        match self {
            HostStorage::F32(v) => v.len(),
            HostStorage::F16(v) => v.len(),
            HostStorage::BF16(v) => v.len(),
        }
    }
}

impl HostStorage {
    pub fn zeros(len: usize, dtype: DType) -> Self {
        match dtype {
            DType::F32 => HostStorage::F32(vec![0.0; len]),
            DType::F16 => HostStorage::F16(vec![f16::ZERO; len]),
            DType::BF16 => HostStorage::BF16(vec![bf16::ZERO; len]),
        }
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match self {
            HostStorage::F32(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }

    /// Widen to f32 regardless of the stored precision.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            HostStorage::F32(v) => v.clone(),
            HostStorage::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            HostStorage::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }
}

/// Launches host kernels.
///
/// With `num_threads` set in the config the client owns a dedicated rayon
/// pool; otherwise work runs on the global pool.
#[derive(Clone)]
pub struct CpuClient {
    device: CpuDevice,
    config: KernelConfig,
    pool: Option<Arc<ThreadPool>>,
}

impl std::fmt::Debug for CpuClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuClient")
            .field("device", &self.device)
            .field("config", &self.config)
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

impl CpuClient {
    pub fn new(device: CpuDevice) -> Self {
        Self {
            device,
            config: KernelConfig::default(),
            pool: None,
        }
    }

    pub fn with_config(device: CpuDevice, config: KernelConfig) -> Result<Self> {
        config.validate()?;
        let pool = match config.num_threads {
            Some(n) => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("memattn-cpu-{i}"))
                    .build()
                    .map_err(|e| Error::Config {
                        reason: format!("failed to build thread pool with {n} threads: {e}"),
                    })?;
                log::debug!("memattn: dedicated cpu pool with {n} threads");
                Some(Arc::new(pool))
            }
            None => None,
        };
        Ok(Self {
            device,
            config,
            pool,
        })
    }

    pub fn device(&self) -> &CpuDevice {
        &self.device
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Run `f` inside this client's pool so rayon iterators use it.
    pub(crate) fn install<T: Send>(&self, f: impl FnOnce() -> T + Send) -> T {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}
