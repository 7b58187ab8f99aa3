//! CUDA memory-efficient attention: forward and two-phase backward
//!
//! Fused kernel, this is a PRIMITIVE op (kernel IS the algorithm).
//! F32 only. Feature dims up to 128, served by register buckets 32/64/128.
//! The dropout mask is the same hash the host kernels use, so a seed gives
//! the same output on both backends.

use cudarc::driver::PushKernelArg;
use cudarc::driver::safe::{CudaSlice, LaunchConfig};

use crate::config::{TilingConfig, cuda_head_dim_bucket};
use crate::error::{Error, Result};
use crate::kernels::Dropout;
use crate::ops::cuda::check_device_len;
use crate::ops::cuda::kernels::{self, KernelModule};
use crate::ops::params::AttentionParams;
use crate::ops::traits::{AttentionOptions, FusedAttentionOps};
use crate::ops::validate::{DenseDims, validate_bwd, validate_options, validate_qkv};
use crate::runtime::cuda::{CudaClient, CudaRuntime};
use crate::tensor::Tensor;

/// Dynamic shared memory available without opting in per function.
const DEFAULT_SMEM_LIMIT: usize = 48 * 1024;

/// Tiling, register bucket and grid for one dense problem.
struct LaunchPlan {
    tiling: TilingConfig,
    bucket: usize,
}

impl LaunchPlan {
    fn new(client: &CudaClient, dims: &DenseDims) -> Result<Self> {
        let tiling = TilingConfig::for_capability(&client.capability(), dims.max_feature_dim())?;
        let bucket = cuda_head_dim_bucket(dims.max_feature_dim())?;
        Ok(Self { tiling, bucket })
    }

    fn config(&self, dims: &DenseDims, smem_floats: usize) -> Result<LaunchConfig> {
        let qb = self.tiling.queries_per_block;
        let smem_size = smem_floats * std::mem::size_of::<f32>();
        if smem_size > DEFAULT_SMEM_LIMIT {
            return Err(Error::KernelError {
                reason: format!(
                    "shared memory {}B exceeds launch limit {}B",
                    smem_size, DEFAULT_SMEM_LIMIT
                ),
            });
        }
        let cfg = LaunchConfig {
            grid_dim: (dims.seq_q.div_ceil(qb) as u32, dims.batch as u32, 1),
            block_dim: (qb as u32, 1, 1),
            shared_mem_bytes: smem_size as u32,
        };
        log::debug!(
            "memattn: launch grid={:?} block={:?} smem={}B bucket={}",
            cfg.grid_dim,
            cfg.block_dim,
            cfg.shared_mem_bytes,
            self.bucket
        );
        Ok(cfg)
    }

    fn tile_floats(&self, dims: &DenseDims) -> usize {
        self.tiling.keys_per_block * (dims.head_dim + dims.value_dim)
    }
}

/// Integer geometry in kernel argument order: M, N, D, Dv.
fn dims_i32(dims: &DenseDims) -> [i32; 4] {
    [
        dims.seq_q as i32,
        dims.seq_k as i32,
        dims.head_dim as i32,
        dims.value_dim as i32,
    ]
}

/// Score modifiers with the bias resident on the device.
#[derive(Clone, Copy)]
pub struct DeviceParams<'a> {
    pub scale: f32,
    pub causal: bool,
    /// `[B, M, N]`
    pub bias: Option<&'a CudaSlice<f32>>,
    pub dropout: Option<Dropout>,
}

impl<'a> DeviceParams<'a> {
    pub fn new(scale: f32, causal: bool) -> Self {
        Self {
            scale,
            causal,
            bias: None,
            dropout: None,
        }
    }

    /// Same scalars as `params`, bias taken from `bias`.
    pub fn from_host(params: &AttentionParams<'_>, bias: Option<&'a CudaSlice<f32>>) -> Self {
        Self {
            scale: params.scale,
            causal: params.causal,
            bias,
            dropout: params.dropout,
        }
    }

    fn check(&self, dims: &DenseDims) -> Result<()> {
        if let Some(bias) = self.bias {
            check_device_len("bias", bias.len(), dims.bias_len())?;
        }
        if let Some(dropout) = &self.dropout {
            dropout.validate()?;
        }
        Ok(())
    }
}

/// Scalar kernel arguments after the geometry, in kernel order:
/// scale, causal, has_bias, drop_p, seed, keys_per_block.
struct ScalarArgs {
    scale: f32,
    causal: i32,
    has_bias: i32,
    drop_p: f32,
    seed: u64,
    keys_per_block: i32,
}

impl ScalarArgs {
    fn new(params: &DeviceParams<'_>, tiling: &TilingConfig) -> Self {
        Self {
            scale: params.scale,
            causal: params.causal as i32,
            has_bias: params.bias.is_some() as i32,
            drop_p: params.dropout.map_or(0.0, |d| d.p),
            seed: params.dropout.map_or(0, |d| d.seed),
            keys_per_block: tiling.keys_per_block as i32,
        }
    }
}

/// Launch the forward kernel on device buffers. `output` is `[B, M, Dv]`,
/// `lse` is `[B, M]`; both are fully written.
#[allow(clippy::too_many_arguments)]
pub fn launch_attention_fwd(
    client: &CudaClient,
    dims: &DenseDims,
    q: &CudaSlice<f32>,
    k: &CudaSlice<f32>,
    v: &CudaSlice<f32>,
    params: &DeviceParams<'_>,
    output: &mut CudaSlice<f32>,
    lse: &mut CudaSlice<f32>,
) -> Result<()> {
    dims.check_feature_dims()?;
    check_device_len("q", q.len(), dims.q_len())?;
    check_device_len("k", k.len(), dims.k_len())?;
    check_device_len("v", v.len(), dims.v_len())?;
    check_device_len("output", output.len(), dims.out_len())?;
    check_device_len("lse", lse.len(), dims.lse_len())?;
    params.check(dims)?;
    if dims.lse_len() == 0 {
        return Ok(());
    }
    let plan = LaunchPlan::new(client, dims)?;
    let smem = plan.tile_floats(dims) + plan.tiling.queries_per_block * plan.tiling.keys_per_block;
    let cfg = plan.config(dims, smem)?;
    let func = kernels::function(
        client,
        KernelModule::AttentionFwd,
        &format!("mem_eff_attention_fwd_{}", plan.bucket),
    )?;

    let [m, n, d, dv] = dims_i32(dims);
    let scalars = ScalarArgs::new(params, &plan.tiling);
    // any valid pointer stands in when there is no bias
    let bias = params.bias.unwrap_or(q);

    unsafe {
        let mut builder = client.stream().launch_builder(&func);
        builder.arg(q);
        builder.arg(k);
        builder.arg(v);
        builder.arg(bias);
        builder.arg(output);
        builder.arg(lse);
        builder.arg(&m);
        builder.arg(&n);
        builder.arg(&d);
        builder.arg(&dv);
        builder.arg(&scalars.scale);
        builder.arg(&scalars.causal);
        builder.arg(&scalars.has_bias);
        builder.arg(&scalars.drop_p);
        builder.arg(&scalars.seed);
        builder.arg(&scalars.keys_per_block);
        builder.launch(cfg).map_err(|e| Error::KernelError {
            reason: format!("attention fwd kernel launch failed: {:?}", e),
        })?;
    }
    Ok(())
}

/// Launch both backward phases on device buffers.
///
/// ACCUMULATES into `dq`, `dk` and `dv`, which the caller zeroes.
#[allow(clippy::too_many_arguments)]
pub fn launch_attention_bwd(
    client: &CudaClient,
    dims: &DenseDims,
    q: &CudaSlice<f32>,
    k: &CudaSlice<f32>,
    v: &CudaSlice<f32>,
    grad_output: &CudaSlice<f32>,
    lse: &CudaSlice<f32>,
    params: &DeviceParams<'_>,
    dq: &mut CudaSlice<f32>,
    dk: &mut CudaSlice<f32>,
    dv: &mut CudaSlice<f32>,
) -> Result<()> {
    dims.check_feature_dims()?;
    check_device_len("q", q.len(), dims.q_len())?;
    check_device_len("k", k.len(), dims.k_len())?;
    check_device_len("v", v.len(), dims.v_len())?;
    check_device_len("grad_output", grad_output.len(), dims.out_len())?;
    check_device_len("lse", lse.len(), dims.lse_len())?;
    check_device_len("dq", dq.len(), dims.q_len())?;
    check_device_len("dk", dk.len(), dims.k_len())?;
    check_device_len("dv", dv.len(), dims.v_len())?;
    params.check(dims)?;
    if dims.lse_len() == 0 || dims.seq_k == 0 {
        return Ok(());
    }
    let plan = LaunchPlan::new(client, dims)?;
    let cfg = plan.config(dims, plan.tile_floats(dims))?;
    let phase1 = kernels::function(
        client,
        KernelModule::AttentionBwd,
        &format!("mem_eff_attention_bwd_phase1_{}", plan.bucket),
    )?;
    let phase2 = kernels::function(
        client,
        KernelModule::AttentionBwd,
        &format!("mem_eff_attention_bwd_phase2_{}", plan.bucket),
    )?;

    let mut delta = client.alloc_zeros(dims.lse_len())?;
    let [m, n, d, dvw] = dims_i32(dims);
    let scalars = ScalarArgs::new(params, &plan.tiling);
    let bias = params.bias.unwrap_or(q);

    unsafe {
        let mut builder = client.stream().launch_builder(&phase1);
        builder.arg(q);
        builder.arg(k);
        builder.arg(v);
        builder.arg(bias);
        builder.arg(grad_output);
        builder.arg(lse);
        builder.arg(&mut delta);
        builder.arg(dv);
        builder.arg(&m);
        builder.arg(&n);
        builder.arg(&d);
        builder.arg(&dvw);
        builder.arg(&scalars.scale);
        builder.arg(&scalars.causal);
        builder.arg(&scalars.has_bias);
        builder.arg(&scalars.drop_p);
        builder.arg(&scalars.seed);
        builder.arg(&scalars.keys_per_block);
        builder.launch(cfg).map_err(|e| Error::KernelError {
            reason: format!("attention bwd phase 1 launch failed: {:?}", e),
        })?;
    }

    // same stream: phase 2 observes every delta written by phase 1
    unsafe {
        let mut builder = client.stream().launch_builder(&phase2);
        builder.arg(q);
        builder.arg(k);
        builder.arg(v);
        builder.arg(bias);
        builder.arg(grad_output);
        builder.arg(lse);
        builder.arg(&delta);
        builder.arg(dq);
        builder.arg(dk);
        builder.arg(&m);
        builder.arg(&n);
        builder.arg(&d);
        builder.arg(&dvw);
        builder.arg(&scalars.scale);
        builder.arg(&scalars.causal);
        builder.arg(&scalars.has_bias);
        builder.arg(&scalars.drop_p);
        builder.arg(&scalars.seed);
        builder.arg(&scalars.keys_per_block);
        builder.launch(cfg).map_err(|e| Error::KernelError {
            reason: format!("attention bwd phase 2 launch failed: {:?}", e),
        })?;
    }
    Ok(())
}

impl FusedAttentionOps<CudaRuntime> for CudaClient {
    fn attention_fwd_with(
        &self,
        q: &Tensor<CudaRuntime>,
        k: &Tensor<CudaRuntime>,
        v: &Tensor<CudaRuntime>,
        options: &AttentionOptions<'_, CudaRuntime>,
        compute_lse: bool,
    ) -> Result<(Tensor<CudaRuntime>, Option<Tensor<CudaRuntime>>)> {
        let dims = validate_qkv(q, k, v, options.scale)?;
        validate_options(options, q, &dims)?;
        // reject oversized feature dims before allocating
        LaunchPlan::new(self, &dims)?;
        let params = device_params(options)?;

        let mut output = self.alloc_zeros(dims.out_len())?;
        let mut lse = self.alloc_zeros(dims.lse_len())?;
        launch_attention_fwd(
            self,
            &dims,
            q.storage().as_f32()?,
            k.storage().as_f32()?,
            v.storage().as_f32()?,
            &params,
            &mut output,
            &mut lse,
        )?;
        self.synchronize("attention fwd")?;

        let output = self.wrap(
            output,
            dims.out_len(),
            &[dims.batch, dims.seq_q, dims.value_dim],
        )?;
        let lse = if compute_lse {
            Some(self.wrap(lse, dims.lse_len(), &[dims.batch, dims.seq_q])?)
        } else {
            None
        };
        Ok((output, lse))
    }

    fn attention_bwd_with(
        &self,
        grad_output: &Tensor<CudaRuntime>,
        q: &Tensor<CudaRuntime>,
        k: &Tensor<CudaRuntime>,
        v: &Tensor<CudaRuntime>,
        lse: &Tensor<CudaRuntime>,
        options: &AttentionOptions<'_, CudaRuntime>,
    ) -> Result<(Tensor<CudaRuntime>, Tensor<CudaRuntime>, Tensor<CudaRuntime>)> {
        let dims = validate_bwd(grad_output, q, k, v, lse, options.scale)?;
        validate_options(options, q, &dims)?;
        LaunchPlan::new(self, &dims)?;
        let params = device_params(options)?;

        let mut dq = self.alloc_zeros(dims.q_len())?;
        let mut dk = self.alloc_zeros(dims.k_len())?;
        let mut dv = self.alloc_zeros(dims.v_len())?;
        launch_attention_bwd(
            self,
            &dims,
            q.storage().as_f32()?,
            k.storage().as_f32()?,
            v.storage().as_f32()?,
            grad_output.storage().as_f32()?,
            lse.storage().as_f32()?,
            &params,
            &mut dq,
            &mut dk,
            &mut dv,
        )?;
        self.synchronize("attention bwd")?;

        Ok((
            self.wrap(dq, dims.q_len(), q.shape())?,
            self.wrap(dk, dims.k_len(), k.shape())?,
            self.wrap(dv, dims.v_len(), v.shape())?,
        ))
    }
}

fn device_params<'a>(options: &AttentionOptions<'a, CudaRuntime>) -> Result<DeviceParams<'a>> {
    let bias = match options.bias {
        Some(bias) => Some(bias.storage().as_f32()?),
        None => None,
    };
    Ok(DeviceParams {
        scale: options.scale,
        causal: options.causal,
        bias,
        dropout: options.dropout,
    })
}
