//! CPU implementation of FusedAttentionOps

pub mod backward;
pub mod forward;

use crate::error::Result;
use crate::ops::params::AttentionParams;
use crate::ops::traits::{AttentionOptions, FusedAttentionOps};
use crate::ops::validate::{validate_bwd, validate_options, validate_qkv};
use crate::runtime::cpu::{CpuClient, CpuRuntime, HostStorage};
use crate::tensor::Tensor;

pub use backward::attention_backward;
pub use forward::attention_forward;

/// Borrow the options' bias as a host slice.
fn host_params<'a>(options: &AttentionOptions<'a, CpuRuntime>) -> Result<AttentionParams<'a>> {
    let mut params = AttentionParams::new(options.scale).with_causal(options.causal);
    if let Some(bias) = options.bias {
        params = params.with_bias(bias.as_f32_slice()?);
    }
    params.dropout = options.dropout;
    Ok(params)
}

impl FusedAttentionOps<CpuRuntime> for CpuClient {
    fn attention_fwd_with(
        &self,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        options: &AttentionOptions<'_, CpuRuntime>,
        compute_lse: bool,
    ) -> Result<(Tensor<CpuRuntime>, Option<Tensor<CpuRuntime>>)> {
        let dims = validate_qkv(q, k, v, options.scale)?;
        validate_options(options, q, &dims)?;
        let tiling = self.config().cpu_tiling(dims.max_feature_dim())?;
        let params = host_params(options)?;
        let (q, k, v) = (q.as_f32_slice()?, k.as_f32_slice()?, v.as_f32_slice()?);

        let mut output = vec![0.0f32; dims.out_len()];
        let mut lse = vec![0.0f32; dims.lse_len()];
        self.install(|| attention_forward(&dims, q, k, v, &params, &tiling, &mut output, &mut lse))?;
        log::debug!(
            "memattn: cpu attention_fwd B={} M={} N={} D={} Dv={} causal={} bias={} dropout={:?}",
            dims.batch,
            dims.seq_q,
            dims.seq_k,
            dims.head_dim,
            dims.value_dim,
            params.causal,
            params.bias.is_some(),
            params.dropout.map(|d| d.p)
        );

        let device = self.device().clone();
        let output = Tensor::from_storage(
            HostStorage::F32(output),
            &[dims.batch, dims.seq_q, dims.value_dim],
            device.clone(),
        )?;
        let lse = if compute_lse {
            Some(Tensor::from_storage(
                HostStorage::F32(lse),
                &[dims.batch, dims.seq_q],
                device,
            )?)
        } else {
            None
        };
        Ok((output, lse))
    }

    fn attention_bwd_with(
        &self,
        grad_output: &Tensor<CpuRuntime>,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        lse: &Tensor<CpuRuntime>,
        options: &AttentionOptions<'_, CpuRuntime>,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let dims = validate_bwd(grad_output, q, k, v, lse, options.scale)?;
        validate_options(options, q, &dims)?;
        let tiling = self.config().cpu_tiling(dims.max_feature_dim())?;
        let params = host_params(options)?;
        let grad_output = grad_output.as_f32_slice()?;
        let lse = lse.as_f32_slice()?;
        let (q_data, k_data, v_data) = (q.as_f32_slice()?, k.as_f32_slice()?, v.as_f32_slice()?);

        let mut dq = vec![0.0f32; dims.q_len()];
        let mut dk = vec![0.0f32; dims.k_len()];
        let mut dv = vec![0.0f32; dims.v_len()];
        self.install(|| {
            attention_backward(
                &dims,
                q_data,
                k_data,
                v_data,
                grad_output,
                lse,
                &params,
                &tiling,
                &mut dq,
                &mut dk,
                &mut dv,
            )
        })?;
        log::debug!(
            "memattn: cpu attention_bwd B={} M={} N={} D={} Dv={} causal={} bias={} dropout={:?}",
            dims.batch,
            dims.seq_q,
            dims.seq_k,
            dims.head_dim,
            dims.value_dim,
            params.causal,
            params.bias.is_some(),
            params.dropout.map(|d| d.p)
        );

        let device = self.device().clone();
        Ok((
            Tensor::from_storage(HostStorage::F32(dq), q.shape(), device.clone())?,
            Tensor::from_storage(HostStorage::F32(dk), k.shape(), device.clone())?,
            Tensor::from_storage(HostStorage::F32(dv), v.shape(), device)?,
        ))
    }
}
