//! Row-restricted softmax on host slices.
//!
//! Each CSR row is reduced as one group (see [`crate::kernels::reduce`]);
//! rows of every batch slice run in parallel.

use rayon::prelude::*;

use super::spmm::check_len;
use crate::error::Result;
use crate::kernels::reduce::{row_dot, row_max, row_sum};
use crate::sparse::{CsrPattern, split_rows};

/// Softmax over the present entries of each row.
///
/// `values` and `output` are `[batch, nnz]`. A row with no finite score
/// (empty, or all `-inf`) produces zeros.
pub fn sparse_softmax_forward(
    pattern: &CsrPattern,
    batch: usize,
    values: &[f32],
    output: &mut [f32],
) -> Result<()> {
    let nnz = pattern.nnz();
    check_len("values", values.len(), batch * nnz)?;
    check_len("output", output.len(), batch * nnz)?;
    if nnz == 0 {
        return Ok(());
    }

    output
        .par_chunks_mut(nnz)
        .zip(values.par_chunks(nnz))
        .for_each(|(out_b, vals_b)| {
            split_rows(pattern, out_b)
                .into_par_iter()
                .for_each(|(row, out_row)| {
                    let x = &vals_b[pattern.row_range(row)];
                    let max = row_max(x);
                    if max == f32::NEG_INFINITY {
                        out_row.fill(0.0);
                        return;
                    }
                    for (o, &xi) in out_row.iter_mut().zip(x) {
                        *o = (xi - max).exp();
                    }
                    let inv = row_sum(out_row).recip();
                    for o in out_row.iter_mut() {
                        *o *= inv;
                    }
                });
        });
    Ok(())
}

/// `grad_input = y * (dy - Σ_row y * dy)`, all `[batch, nnz]`.
pub fn sparse_softmax_backward(
    pattern: &CsrPattern,
    batch: usize,
    output: &[f32],
    grad_output: &[f32],
    grad_input: &mut [f32],
) -> Result<()> {
    let nnz = pattern.nnz();
    check_len("output", output.len(), batch * nnz)?;
    check_len("grad_output", grad_output.len(), batch * nnz)?;
    check_len("grad_input", grad_input.len(), batch * nnz)?;
    if nnz == 0 {
        return Ok(());
    }

    grad_input
        .par_chunks_mut(nnz)
        .zip(output.par_chunks(nnz).zip(grad_output.par_chunks(nnz)))
        .for_each(|(dx_b, (y_b, dy_b))| {
            split_rows(pattern, dx_b)
                .into_par_iter()
                .for_each(|(row, dx_row)| {
                    let range = pattern.row_range(row);
                    let (y, dy) = (&y_b[range.clone()], &dy_b[range]);
                    let dot = row_dot(y, dy);
                    for ((dx, &yi), &dyi) in dx_row.iter_mut().zip(y).zip(dy) {
                        *dx = yi * (dyi - dot);
                    }
                });
        });
    Ok(())
}
