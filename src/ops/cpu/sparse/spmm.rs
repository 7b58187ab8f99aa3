//! Sparse x dense product on host slices.

use rayon::prelude::*;

use crate::error::Result;
use crate::kernels::tile::axpy;
use crate::ops::validate::SpmmDims;
use crate::sparse::CsrPattern;

/// `output[b, i, :] = Σ_{l in row i} values[vb, l] * dense[b, col[l], :]`
/// where `vb` is `b`, or `0` when one value array is shared by the batch.
///
/// - `values`: `[value_batch, nnz]`
/// - `dense`: `[batch, cols, n]`
/// - `output`: `[batch, rows, n]`, fully overwritten
pub fn sparse_dense_matmul(
    pattern: &CsrPattern,
    dims: &SpmmDims,
    values: &[f32],
    dense: &[f32],
    output: &mut [f32],
) -> Result<()> {
    dims.check_pattern(pattern)?;
    let nnz = pattern.nnz();
    let (rows, cols, n) = (dims.rows, dims.cols, dims.n);
    check_len("values", values.len(), dims.value_batch * nnz)?;
    check_len("dense", dense.len(), dims.batch * cols * n)?;
    check_len("output", output.len(), dims.batch * rows * n)?;

    if output.is_empty() {
        return Ok(());
    }

    let col_idx = pattern.column_indices();
    output
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(unit, out_row)| {
            let (b, row) = (unit / rows, unit % rows);
            let vb = if dims.value_batch == 1 { 0 } else { b };
            let vals = &values[vb * nnz..(vb + 1) * nnz];
            let dense_b = &dense[b * cols * n..(b + 1) * cols * n];

            out_row.fill(0.0);
            for l in pattern.row_range(row) {
                let c = col_idx[l] as usize;
                axpy(out_row, &dense_b[c * n..(c + 1) * n], vals[l]);
            }
        });
    Ok(())
}

pub(super) fn check_len(arg: &'static str, len: usize, expected: usize) -> Result<()> {
    if len != expected {
        return Err(crate::error::Error::InvalidArgument {
            arg,
            reason: format!("buffer has {len} elements, expected {expected}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_by_three() {
        // [[1, 0, 2],
        //  [0, 0, 0],
        //  [0, 3, 0]]
        let pattern = CsrPattern::from_csr(3, 3, vec![0, 2, 2, 3], vec![0, 2, 1]).unwrap();
        let dims = SpmmDims { batch: 1, value_batch: 1, rows: 3, cols: 3, n: 2 };
        let dense = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = vec![f32::NAN; 6];
        sparse_dense_matmul(&pattern, &dims, &[1.0, 2.0, 3.0], &dense, &mut out).unwrap();
        assert_eq!(out, vec![11.0, 14.0, 0.0, 0.0, 9.0, 12.0]);
    }

    #[test]
    fn test_shared_values_across_batch() {
        let pattern = CsrPattern::dense(2, 2).unwrap();
        let dims = SpmmDims { batch: 2, value_batch: 1, rows: 2, cols: 2, n: 1 };
        let dense = [1.0, 2.0, 10.0, 20.0];
        let mut out = vec![0.0; 4];
        sparse_dense_matmul(&pattern, &dims, &[1.0, 1.0, 0.5, 0.5], &dense, &mut out).unwrap();
        assert_eq!(out, vec![3.0, 1.5, 30.0, 15.0]);
    }

    #[test]
    fn test_zero_width_dense() {
        let pattern = CsrPattern::dense(2, 2).unwrap();
        let dims = SpmmDims { batch: 1, value_batch: 1, rows: 2, cols: 2, n: 0 };
        let mut out = vec![];
        sparse_dense_matmul(&pattern, &dims, &[1.0; 4], &[], &mut out).unwrap();
    }
}
