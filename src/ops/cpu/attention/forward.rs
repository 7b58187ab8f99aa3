//! Streaming attention forward on host slices.
//!
//! Work is split into (batch, query block) units that run independently on
//! the rayon pool. Inside a unit the keys are scanned in tiles of
//! `keys_per_block`; each tile is folded into the per-row running statistics
//! with [`RunningStats::merge`], so only a `queries_per_block x Dv`
//! accumulator and one tile of scores are ever live.
//!
//! Dropout only touches the value accumulation: the running sum is of the
//! undropped weights, so the normalizer and the log-sum-exp are unaffected.

use rayon::prelude::*;

use crate::config::TilingConfig;
use crate::error::Result;
use crate::kernels::RunningStats;
use crate::kernels::tile::{axpy, dot, scale, scale_axpy};
use crate::ops::params::AttentionParams;
use crate::ops::validate::DenseDims;
use crate::runtime::DeviceKind;

/// Fused attention forward.
///
/// Writes `output` (`[B, M, Dv]`) and `lse` (`[B, M]`). Both are fully
/// overwritten. Logits follow [`AttentionParams::logit`].
#[allow(clippy::too_many_arguments)]
pub fn attention_forward(
    dims: &DenseDims,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    params: &AttentionParams<'_>,
    tiling: &TilingConfig,
    output: &mut [f32],
    lse: &mut [f32],
) -> Result<()> {
    dims.check_feature_dims()?;
    dims.check_slice("q", q.len(), dims.q_len())?;
    dims.check_slice("k", k.len(), dims.k_len())?;
    dims.check_slice("v", v.len(), dims.v_len())?;
    dims.check_slice("output", output.len(), dims.out_len())?;
    dims.check_slice("lse", lse.len(), dims.lse_len())?;
    params.check(dims)?;
    tiling.validate(DeviceKind::Cpu)?;
    tiling.check_head_dim(dims.max_feature_dim())?;

    if dims.out_len() == 0 {
        return Ok(());
    }

    let (m, n, d, dv) = (dims.seq_q, dims.seq_k, dims.head_dim, dims.value_dim);
    let qb = tiling.queries_per_block;

    output
        .par_chunks_mut(m * dv)
        .zip(lse.par_chunks_mut(m))
        .enumerate()
        .for_each(|(b, (out_b, lse_b))| {
            let q_b = &q[b * m * d..(b + 1) * m * d];
            let k_b = &k[b * n * d..(b + 1) * n * d];
            let v_b = &v[b * n * dv..(b + 1) * n * dv];

            out_b
                .par_chunks_mut(qb * dv)
                .zip(lse_b.par_chunks_mut(qb))
                .enumerate()
                .for_each(|(blk, (out_blk, lse_blk))| {
                    let row0 = blk * qb;
                    let rows = lse_blk.len();
                    let block = QueryBlock {
                        dims,
                        params,
                        batch: b,
                        q: &q_b[row0 * d..(row0 + rows) * d],
                        row0,
                    };
                    block.scan(k_b, v_b, tiling.keys_per_block, out_blk, lse_blk);
                });
        });

    Ok(())
}

/// One block of query rows and the geometry needed to scan keys for it.
struct QueryBlock<'a> {
    dims: &'a DenseDims,
    params: &'a AttentionParams<'a>,
    batch: usize,
    q: &'a [f32],
    /// Index of the block's first row within its batch.
    row0: usize,
}

impl QueryBlock<'_> {
    fn scan(&self, k: &[f32], v: &[f32], keys_per_block: usize, acc: &mut [f32], lse: &mut [f32]) {
        let (d, dv, n) = (self.dims.head_dim, self.dims.value_dim, self.dims.seq_k);
        let (b, params) = (self.batch, self.params);
        let rows = lse.len();
        let last_row = self.row0 + rows - 1;

        let mut stats = vec![RunningStats::EMPTY; rows];
        let mut scores = vec![0.0f32; keys_per_block];
        let mut weights = vec![0.0f32; keys_per_block];
        let mut tile_acc = vec![0.0f32; dv];
        acc.fill(0.0);

        let mut key0 = 0;
        while key0 < n {
            // later tiles are masked for every row of the block
            if params.causal && key0 > last_row {
                break;
            }
            let tile = keys_per_block.min(n - key0);

            for r in 0..rows {
                let qi = self.row0 + r;
                let q_row = &self.q[r * d..(r + 1) * d];

                for (t, s) in scores[..tile].iter_mut().enumerate() {
                    let j = key0 + t;
                    *s = if params.is_masked(qi, j) {
                        f32::NEG_INFINITY
                    } else {
                        params.logit(self.dims, b, qi, j, dot(q_row, &k[j * d..(j + 1) * d]))
                    };
                }

                let local = RunningStats::from_tile(&scores[..tile], &mut weights[..tile]);
                if local.sum == 0.0 {
                    continue;
                }

                tile_acc.fill(0.0);
                for (t, &w) in weights[..tile].iter().enumerate() {
                    if w != 0.0 {
                        let j = key0 + t;
                        let w = w * params.keep_factor(self.dims, b, qi, j);
                        axpy(&mut tile_acc, &v[j * dv..(j + 1) * dv], w);
                    }
                }

                let (alpha, beta) = stats[r].merge(local);
                scale_axpy(&mut acc[r * dv..(r + 1) * dv], alpha, &tile_acc, beta);
            }

            key0 += tile;
        }

        for (r, st) in stats.iter().enumerate() {
            scale(&mut acc[r * dv..(r + 1) * dv], st.inv_sum());
            lse[r] = st.log_sum_exp();
        }
    }
}
