//! PTX modules compiled by `build.rs`, loaded lazily per device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use cudarc::driver::safe::{CudaFunction, CudaModule};
use cudarc::nvrtc::Ptx;

use crate::error::{Error, Result};
use crate::runtime::Device;
use crate::runtime::cuda::CudaClient;

/// Output directory of the PTX build step.
const KERNEL_DIR: &str = env!("CUDA_KERNEL_DIR");

/// One compiled `.cu` translation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelModule {
    /// `mem_eff_attention_fwd_{32,64,128}`
    AttentionFwd,
    /// `mem_eff_attention_bwd_phase{1,2}_{32,64,128}`
    AttentionBwd,
    /// `sparse_dense_matmul`, `sparse_softmax_fwd`, `sparse_softmax_bwd`
    Sparse,
}

impl KernelModule {
    pub const ALL: [KernelModule; 3] = [Self::AttentionFwd, Self::AttentionBwd, Self::Sparse];

    /// File stem of the PTX produced for this module.
    pub fn stem(self) -> &'static str {
        match self {
            Self::AttentionFwd => "mem_eff_attention",
            Self::AttentionBwd => "mem_eff_attention_bwd",
            Self::Sparse => "sparse_ops",
        }
    }
}

type ModuleMap = HashMap<(usize, KernelModule), Arc<CudaModule>>;

static LOADED: OnceLock<Mutex<ModuleMap>> = OnceLock::new();

/// Module for `client`'s device, loading the PTX on first request.
pub fn module(client: &CudaClient, which: KernelModule) -> Result<Arc<CudaModule>> {
    let device = client.device().id();
    let mut loaded = LOADED
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .map_err(|e| Error::KernelError {
            reason: format!("module table lock poisoned: {e}"),
        })?;

    if let Some(m) = loaded.get(&(device, which)) {
        return Ok(Arc::clone(m));
    }

    let path = format!("{}/{}.ptx", KERNEL_DIR, which.stem());
    let m = client
        .context()
        .load_module(Ptx::from_file(&path))
        .map_err(|e| Error::KernelError {
            reason: format!("loading {path} on device {device}: {:?}", e),
        })?;
    log::debug!("memattn: loaded {} on device {device}", which.stem());
    loaded.insert((device, which), Arc::clone(&m));
    Ok(m)
}

/// Entry point `name` inside `which`.
pub fn function(client: &CudaClient, which: KernelModule, name: &str) -> Result<CudaFunction> {
    module(client, which)?
        .load_function(name)
        .map_err(|e| Error::KernelError {
            reason: format!("no kernel '{name}' in {}: {:?}", which.stem(), e),
        })
}

/// Load every module up front so the first call does not pay the JIT cost.
pub fn preload(client: &CudaClient) -> Result<()> {
    KernelModule::ALL
        .iter()
        .try_for_each(|&which| module(client, which).map(drop))
}
