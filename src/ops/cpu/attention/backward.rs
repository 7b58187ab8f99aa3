//! Attention backward on host slices.
//!
//! Probabilities are never stored: both phases recompute
//! `p = exp(logit - lse)` from the forward's saved log-sum-exp, so the
//! gradient sees exactly the softmax the forward produced. The dropout
//! factor `z` of each score is regenerated from its seed.
//!
//! - Phase 1, per query row: `dV[j] += p * z * dO` (scatter-add) and
//!   `delta = Σ_j p * z * (dO·v_j)`, which equals `dO·O`.
//! - Phase 2, per query row: `ds = p * (z * dO·v_j - delta)`,
//!   `dQ += scale * ds * k_j` (row-owned), `dK[j] += scale * ds * q` (scatter-add).
//!
//! Units are (batch, query block) pairs. Key/value gradients are shared
//! between units and updated through [`AtomicF32Slice`].

use rayon::prelude::*;

use crate::config::TilingConfig;
use crate::error::Result;
use crate::kernels::AtomicF32Slice;
use crate::kernels::tile::{axpy, dot};
use crate::ops::params::AttentionParams;
use crate::ops::validate::DenseDims;
use crate::runtime::DeviceKind;

/// Fused attention backward.
///
/// ACCUMULATES into `dq` (`[B, M, D]`), `dk` (`[B, N, D]`) and `dv`
/// (`[B, N, Dv]`); the caller zero-initializes them for a plain gradient.
/// `params` must be the ones the forward ran with.
#[allow(clippy::too_many_arguments)]
pub fn attention_backward(
    dims: &DenseDims,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    grad_output: &[f32],
    lse: &[f32],
    params: &AttentionParams<'_>,
    tiling: &TilingConfig,
    dq: &mut [f32],
    dk: &mut [f32],
    dv: &mut [f32],
) -> Result<()> {
    dims.check_feature_dims()?;
    dims.check_slice("q", q.len(), dims.q_len())?;
    dims.check_slice("k", k.len(), dims.k_len())?;
    dims.check_slice("v", v.len(), dims.v_len())?;
    dims.check_slice("grad_output", grad_output.len(), dims.out_len())?;
    dims.check_slice("lse", lse.len(), dims.lse_len())?;
    dims.check_slice("dq", dq.len(), dims.q_len())?;
    dims.check_slice("dk", dk.len(), dims.k_len())?;
    dims.check_slice("dv", dv.len(), dims.v_len())?;
    params.check(dims)?;
    tiling.validate(DeviceKind::Cpu)?;
    tiling.check_head_dim(dims.max_feature_dim())?;

    if dims.lse_len() == 0 || dims.seq_k == 0 {
        return Ok(());
    }

    let ctx = BackwardContext {
        dims: *dims,
        q,
        k,
        v,
        grad_output,
        lse,
        params,
        keys_per_block: tiling.keys_per_block,
    };
    let qb = tiling.queries_per_block;
    let m = dims.seq_q;

    let mut delta = vec![0.0f32; dims.lse_len()];
    {
        let dv = AtomicF32Slice::new(dv);
        delta
            .par_chunks_mut(m)
            .enumerate()
            .for_each(|(b, delta_b)| {
                delta_b
                    .par_chunks_mut(qb)
                    .enumerate()
                    .for_each(|(blk, delta_blk)| ctx.phase1(b, blk * qb, delta_blk, &dv));
            });
    }

    let d = dims.head_dim;
    let dk = AtomicF32Slice::new(dk);
    let delta = &delta;
    dq.par_chunks_mut(m * d)
        .enumerate()
        .for_each(|(b, dq_b)| {
            dq_b.par_chunks_mut(qb * d)
                .enumerate()
                .for_each(|(blk, dq_blk)| {
                    let row0 = blk * qb;
                    let rows = dq_blk.len() / d;
                    let delta_blk = &delta[b * m + row0..b * m + row0 + rows];
                    ctx.phase2(b, row0, delta_blk, dq_blk, &dk);
                });
        });

    Ok(())
}

struct BackwardContext<'a> {
    dims: DenseDims,
    q: &'a [f32],
    k: &'a [f32],
    v: &'a [f32],
    grad_output: &'a [f32],
    lse: &'a [f32],
    params: &'a AttentionParams<'a>,
    keys_per_block: usize,
}

impl BackwardContext<'_> {
    fn q_row(&self, b: usize, i: usize) -> &[f32] {
        let d = self.dims.head_dim;
        let off = (b * self.dims.seq_q + i) * d;
        &self.q[off..off + d]
    }

    fn k_row(&self, b: usize, j: usize) -> &[f32] {
        let d = self.dims.head_dim;
        let off = (b * self.dims.seq_k + j) * d;
        &self.k[off..off + d]
    }

    fn v_row(&self, b: usize, j: usize) -> &[f32] {
        let dv = self.dims.value_dim;
        let off = (b * self.dims.seq_k + j) * dv;
        &self.v[off..off + dv]
    }

    fn do_row(&self, b: usize, i: usize) -> &[f32] {
        let dv = self.dims.value_dim;
        let off = (b * self.dims.seq_q + i) * dv;
        &self.grad_output[off..off + dv]
    }

    /// Keys visible to query row `i`.
    fn key_limit(&self, i: usize) -> usize {
        if self.params.causal {
            (i + 1).min(self.dims.seq_k)
        } else {
            self.dims.seq_k
        }
    }

    /// Key tile ranges `[key0, key_end)` covering keys visible to any row of
    /// a block whose last row is `last_row`.
    fn key_tiles(&self, last_row: usize) -> impl Iterator<Item = (usize, usize)> {
        let limit = self.key_limit(last_row);
        let kb = self.keys_per_block;
        (0..limit)
            .step_by(kb)
            .map(move |key0| (key0, (key0 + kb).min(limit)))
    }

    #[inline]
    fn prob(&self, q_row: &[f32], b: usize, i: usize, j: usize, lse: f32) -> f32 {
        let logit = self.params.logit(&self.dims, b, i, j, dot(q_row, self.k_row(b, j)));
        (logit - lse).exp()
    }

    fn phase1(&self, b: usize, row0: usize, delta: &mut [f32], dv: &AtomicF32Slice<'_>) {
        let rows = delta.len();
        let dv_width = self.dims.value_dim;
        for (key0, key_end) in self.key_tiles(row0 + rows - 1) {
            for (r, delta_r) in delta.iter_mut().enumerate() {
                let i = row0 + r;
                let lse = self.lse[b * self.dims.seq_q + i];
                if lse == f32::NEG_INFINITY {
                    continue;
                }
                let q_row = self.q_row(b, i);
                let do_row = self.do_row(b, i);
                for j in key0..key_end.min(self.key_limit(i)) {
                    let pz = self.prob(q_row, b, i, j, lse) * self.params.keep_factor(&self.dims, b, i, j);
                    if pz == 0.0 {
                        continue;
                    }
                    dv.axpy((b * self.dims.seq_k + j) * dv_width, do_row, pz);
                    *delta_r += pz * dot(do_row, self.v_row(b, j));
                }
            }
        }
    }

    fn phase2(
        &self,
        b: usize,
        row0: usize,
        delta: &[f32],
        dq: &mut [f32],
        dk: &AtomicF32Slice<'_>,
    ) {
        let rows = delta.len();
        let d = self.dims.head_dim;
        for (key0, key_end) in self.key_tiles(row0 + rows - 1) {
            for (r, &delta_r) in delta.iter().enumerate() {
                let i = row0 + r;
                let lse = self.lse[b * self.dims.seq_q + i];
                if lse == f32::NEG_INFINITY {
                    continue;
                }
                let q_row = self.q_row(b, i);
                let do_row = self.do_row(b, i);
                let dq_row = &mut dq[r * d..(r + 1) * d];
                for j in key0..key_end.min(self.key_limit(i)) {
                    let p = self.prob(q_row, b, i, j, lse);
                    let z = self.params.keep_factor(&self.dims, b, i, j);
                    let ds = p * (z * dot(do_row, self.v_row(b, j)) - delta_r);
                    let factor = self.params.scale * ds;
                    axpy(dq_row, self.k_row(b, j), factor);
                    dk.axpy((b * self.dims.seq_k + j) * d, q_row, factor);
                }
            }
        }
    }
}
