//! Operation table keyed by device kind.
//!
//! A [`KernelRegistry`] holds one [`KernelProvider`] per available device
//! family, ordered by preference (CUDA first when present, CPU always). The
//! process-wide table is built once on first use and only read afterwards.
//!
//! Providers work on host slices with explicit dimensions, which is the
//! surface a host framework binds its namespaced operations to.

use std::sync::OnceLock;

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::ops::cpu::{attention, sparse};
use crate::ops::params::AttentionParams;
use crate::ops::validate::{DenseDims, SpmmDims};
use crate::runtime::DeviceKind;
use crate::runtime::cpu::{CpuClient, CpuDevice};
use crate::sparse::CsrPattern;

/// The five fused operations over host buffers.
///
/// Buffers are row-major and sized from the dimensions. Forward outputs are
/// fully overwritten; `attention_bwd` ACCUMULATES into `dq`, `dk` and `dv`.
/// An attention bias in `params` is a host `[B, M, N]` slice.
#[allow(clippy::too_many_arguments)]
pub trait KernelProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> DeviceKind;

    fn attention_fwd(
        &self,
        dims: &DenseDims,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        params: &AttentionParams<'_>,
        output: &mut [f32],
        lse: &mut [f32],
    ) -> Result<()>;

    fn attention_bwd(
        &self,
        dims: &DenseDims,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        grad_output: &[f32],
        lse: &[f32],
        params: &AttentionParams<'_>,
        dq: &mut [f32],
        dk: &mut [f32],
        dv: &mut [f32],
    ) -> Result<()>;

    fn sparse_dense_matmul(
        &self,
        pattern: &CsrPattern,
        dims: &SpmmDims,
        values: &[f32],
        dense: &[f32],
        output: &mut [f32],
    ) -> Result<()>;

    fn sparse_softmax_fwd(
        &self,
        pattern: &CsrPattern,
        batch: usize,
        values: &[f32],
        output: &mut [f32],
    ) -> Result<()>;

    fn sparse_softmax_bwd(
        &self,
        pattern: &CsrPattern,
        batch: usize,
        output: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
    ) -> Result<()>;
}

/// Host kernels on the client's rayon pool.
pub struct CpuProvider {
    client: CpuClient,
}

impl CpuProvider {
    pub fn new(client: CpuClient) -> Self {
        Self { client }
    }
}

impl KernelProvider for CpuProvider {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn attention_fwd(
        &self,
        dims: &DenseDims,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        params: &AttentionParams<'_>,
        output: &mut [f32],
        lse: &mut [f32],
    ) -> Result<()> {
        dims.check_feature_dims()?;
        let tiling = self.client.config().cpu_tiling(dims.max_feature_dim())?;
        self.client.install(|| {
            attention::attention_forward(dims, q, k, v, params, &tiling, output, lse)
        })
    }

    fn attention_bwd(
        &self,
        dims: &DenseDims,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        grad_output: &[f32],
        lse: &[f32],
        params: &AttentionParams<'_>,
        dq: &mut [f32],
        dk: &mut [f32],
        dv: &mut [f32],
    ) -> Result<()> {
        dims.check_feature_dims()?;
        let tiling = self.client.config().cpu_tiling(dims.max_feature_dim())?;
        self.client.install(|| {
            attention::attention_backward(
                dims,
                q,
                k,
                v,
                grad_output,
                lse,
                params,
                &tiling,
                dq,
                dk,
                dv,
            )
        })
    }

    fn sparse_dense_matmul(
        &self,
        pattern: &CsrPattern,
        dims: &SpmmDims,
        values: &[f32],
        dense: &[f32],
        output: &mut [f32],
    ) -> Result<()> {
        self.client
            .install(|| sparse::sparse_dense_matmul(pattern, dims, values, dense, output))
    }

    fn sparse_softmax_fwd(
        &self,
        pattern: &CsrPattern,
        batch: usize,
        values: &[f32],
        output: &mut [f32],
    ) -> Result<()> {
        pattern.check_batch(batch)?;
        self.client
            .install(|| sparse::sparse_softmax_forward(pattern, batch, values, output))
    }

    fn sparse_softmax_bwd(
        &self,
        pattern: &CsrPattern,
        batch: usize,
        output: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
    ) -> Result<()> {
        pattern.check_batch(batch)?;
        self.client.install(|| {
            sparse::sparse_softmax_backward(pattern, batch, output, grad_output, grad_input)
        })
    }
}

#[cfg(feature = "cuda")]
pub use cuda_provider::CudaProvider;

#[cfg(feature = "cuda")]
mod cuda_provider {
    use super::*;
    use crate::ops::cuda::{self, DeviceParams, DevicePattern, kernels};
    use crate::runtime::cuda::{CudaClient, CudaDevice};

    /// Stages host buffers on one device, launches, synchronizes and copies
    /// results back.
    pub struct CudaProvider {
        client: CudaClient,
    }

    impl CudaProvider {
        pub fn new(device: CudaDevice, config: KernelConfig) -> Result<Self> {
            let client = CudaClient::with_config(device, config)?;
            kernels::preload(&client)?;
            Ok(Self { client })
        }

        pub fn client(&self) -> &CudaClient {
            &self.client
        }
    }

    fn check_len(arg: &'static str, len: usize, expected: usize) -> Result<()> {
        if len != expected {
            return Err(Error::InvalidArgument {
                arg,
                reason: format!("buffer has {len} elements, expected {expected}"),
            });
        }
        Ok(())
    }

    impl KernelProvider for CudaProvider {
        fn name(&self) -> &'static str {
            "cuda"
        }

        fn kind(&self) -> DeviceKind {
            DeviceKind::Cuda
        }

        fn attention_fwd(
            &self,
            dims: &DenseDims,
            q: &[f32],
            k: &[f32],
            v: &[f32],
            params: &AttentionParams<'_>,
            output: &mut [f32],
            lse: &mut [f32],
        ) -> Result<()> {
            dims.check_slice("q", q.len(), dims.q_len())?;
            dims.check_slice("k", k.len(), dims.k_len())?;
            dims.check_slice("v", v.len(), dims.v_len())?;
            dims.check_slice("output", output.len(), dims.out_len())?;
            dims.check_slice("lse", lse.len(), dims.lse_len())?;
            params.check(dims)?;

            let c = &self.client;
            let (q_d, k_d, v_d) = (c.stage(q)?, c.stage(k)?, c.stage(v)?);
            let bias_d = params.bias.map(|b| c.stage(b)).transpose()?;
            let device_params = DeviceParams::from_host(params, bias_d.as_ref());
            let mut out_d = c.alloc_zeros(output.len())?;
            let mut lse_d = c.alloc_zeros(lse.len())?;
            cuda::launch_attention_fwd(
                c, dims, &q_d, &k_d, &v_d, &device_params, &mut out_d, &mut lse_d,
            )?;
            c.synchronize("attention fwd")?;
            c.copy_back(&out_d, output)?;
            c.copy_back(&lse_d, lse)
        }

        fn attention_bwd(
            &self,
            dims: &DenseDims,
            q: &[f32],
            k: &[f32],
            v: &[f32],
            grad_output: &[f32],
            lse: &[f32],
            params: &AttentionParams<'_>,
            dq: &mut [f32],
            dk: &mut [f32],
            dv: &mut [f32],
        ) -> Result<()> {
            dims.check_slice("q", q.len(), dims.q_len())?;
            dims.check_slice("k", k.len(), dims.k_len())?;
            dims.check_slice("v", v.len(), dims.v_len())?;
            dims.check_slice("grad_output", grad_output.len(), dims.out_len())?;
            dims.check_slice("lse", lse.len(), dims.lse_len())?;
            dims.check_slice("dq", dq.len(), dims.q_len())?;
            dims.check_slice("dk", dk.len(), dims.k_len())?;
            dims.check_slice("dv", dv.len(), dims.v_len())?;
            params.check(dims)?;

            let c = &self.client;
            let (q_d, k_d, v_d) = (c.stage(q)?, c.stage(k)?, c.stage(v)?);
            let (do_d, lse_d) = (c.stage(grad_output)?, c.stage(lse)?);
            let bias_d = params.bias.map(|b| c.stage(b)).transpose()?;
            let device_params = DeviceParams::from_host(params, bias_d.as_ref());
            // staged from the caller's buffers so the launch accumulates onto them
            let (mut dq_d, mut dk_d, mut dv_d) = (c.stage(dq)?, c.stage(dk)?, c.stage(dv)?);
            cuda::launch_attention_bwd(
                c,
                dims,
                &q_d,
                &k_d,
                &v_d,
                &do_d,
                &lse_d,
                &device_params,
                &mut dq_d,
                &mut dk_d,
                &mut dv_d,
            )?;
            c.synchronize("attention bwd")?;
            c.copy_back(&dq_d, dq)?;
            c.copy_back(&dk_d, dk)?;
            c.copy_back(&dv_d, dv)
        }

        fn sparse_dense_matmul(
            &self,
            pattern: &CsrPattern,
            dims: &SpmmDims,
            values: &[f32],
            dense: &[f32],
            output: &mut [f32],
        ) -> Result<()> {
            dims.check_pattern(pattern)?;
            check_len("values", values.len(), dims.value_batch * pattern.nnz())?;
            check_len("dense", dense.len(), dims.batch * dims.cols * dims.n)?;
            check_len("output", output.len(), dims.batch * dims.rows * dims.n)?;

            let c = &self.client;
            let device_pattern = DevicePattern::upload(c, pattern)?;
            let (values_d, dense_d) = (c.stage(values)?, c.stage(dense)?);
            let mut out_d = c.alloc_zeros(output.len())?;
            cuda::launch_sparse_dense_matmul(
                c,
                pattern,
                &device_pattern,
                dims,
                &values_d,
                &dense_d,
                &mut out_d,
            )?;
            c.synchronize("sparse_dense_matmul")?;
            c.copy_back(&out_d, output)
        }

        fn sparse_softmax_fwd(
            &self,
            pattern: &CsrPattern,
            batch: usize,
            values: &[f32],
            output: &mut [f32],
        ) -> Result<()> {
            pattern.check_batch(batch)?;
            check_len("values", values.len(), batch * pattern.nnz())?;
            check_len("output", output.len(), batch * pattern.nnz())?;

            let c = &self.client;
            let device_pattern = DevicePattern::upload(c, pattern)?;
            let values_d = c.stage(values)?;
            let mut out_d = c.alloc_zeros(output.len())?;
            cuda::launch_sparse_softmax_fwd(c, pattern, &device_pattern, batch, &values_d, &mut out_d)?;
            c.synchronize("sparse_softmax_fwd")?;
            c.copy_back(&out_d, output)
        }

        fn sparse_softmax_bwd(
            &self,
            pattern: &CsrPattern,
            batch: usize,
            output: &[f32],
            grad_output: &[f32],
            grad_input: &mut [f32],
        ) -> Result<()> {
            pattern.check_batch(batch)?;
            check_len("output", output.len(), batch * pattern.nnz())?;
            check_len("grad_output", grad_output.len(), batch * pattern.nnz())?;
            check_len("grad_input", grad_input.len(), batch * pattern.nnz())?;

            let c = &self.client;
            let device_pattern = DevicePattern::upload(c, pattern)?;
            let (y_d, dy_d) = (c.stage(output)?, c.stage(grad_output)?);
            let mut dx_d = c.alloc_zeros(grad_input.len())?;
            cuda::launch_sparse_softmax_bwd(
                c,
                pattern,
                &device_pattern,
                batch,
                &y_d,
                &dy_d,
                &mut dx_d,
            )?;
            c.synchronize("sparse_softmax_bwd")?;
            c.copy_back(&dx_d, grad_input)
        }
    }
}

/// Providers ordered by preference.
pub struct KernelRegistry {
    providers: Vec<Box<dyn KernelProvider>>,
}

static GLOBAL_REGISTRY: OnceLock<KernelRegistry> = OnceLock::new();

impl KernelRegistry {
    /// Registry with default configuration.
    pub fn new() -> Self {
        Self::from_cpu(CpuClient::new(CpuDevice::new()), &KernelConfig::default())
    }

    /// Registry built from `config` (thread pool size, tiling override, CUDA
    /// device ordinal).
    pub fn with_config(config: KernelConfig) -> Result<Self> {
        let cpu = CpuClient::with_config(CpuDevice::new(), config.clone())?;
        Ok(Self::from_cpu(cpu, &config))
    }

    /// Registry over an explicit provider list, most preferred first.
    pub fn with_providers(providers: Vec<Box<dyn KernelProvider>>) -> Self {
        Self { providers }
    }

    #[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
    fn from_cpu(cpu: CpuClient, config: &KernelConfig) -> Self {
        let mut providers: Vec<Box<dyn KernelProvider>> = vec![Box::new(CpuProvider::new(cpu))];
        log::info!("memattn: registered cpu provider");

        #[cfg(feature = "cuda")]
        {
            use crate::runtime::cuda::{CudaDevice, is_cuda_available};
            if is_cuda_available() {
                match CudaProvider::new(CudaDevice::new(config.cuda_device), config.clone()) {
                    Ok(provider) => {
                        log::info!(
                            "memattn: registered cuda provider on device {}",
                            config.cuda_device
                        );
                        providers.insert(0, Box::new(provider));
                    }
                    Err(e) => log::warn!("memattn: CUDA provider unavailable: {e}"),
                }
            } else {
                log::debug!("memattn: no CUDA device detected");
            }
        }

        Self { providers }
    }

    /// The process-wide registry, built on first use.
    pub fn global() -> &'static KernelRegistry {
        GLOBAL_REGISTRY.get_or_init(|| {
            let registry = Self::new();
            if let Ok(best) = registry.best() {
                log::info!("memattn: selected kernel provider: {}", best.name());
            }
            registry
        })
    }

    /// Provider serving `kind`.
    pub fn get(&self, kind: DeviceKind) -> Result<&dyn KernelProvider> {
        self.providers
            .iter()
            .find(|p| p.kind() == kind)
            .map(|p| p.as_ref())
            .ok_or(Error::BackendUnavailable { kind })
    }

    /// Most preferred provider.
    pub fn best(&self) -> Result<&dyn KernelProvider> {
        self.providers
            .first()
            .map(|p| p.as_ref())
            .ok_or(Error::BackendUnavailable {
                kind: DeviceKind::Cpu,
            })
    }

    /// Device kinds with a registered provider, most preferred first.
    pub fn available(&self) -> Vec<DeviceKind> {
        self.providers.iter().map(|p| p.kind()).collect()
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
