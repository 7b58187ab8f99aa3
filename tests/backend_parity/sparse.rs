//! Backend parity tests for SparseAttentionOps.

use super::helpers::*;
use memattn::CsrPattern;
use memattn::ops::traits::SparseAttentionOps;

/// Banded pattern with ragged rows; every fourth row is empty.
fn ragged_pattern(rows: usize, cols: usize) -> CsrPattern {
    let mask: Vec<bool> = (0..rows * cols)
        .map(|idx| {
            let (i, j) = (idx / cols, idx % cols);
            i % 4 != 3 && (j + 2 * i) % 7 < 4
        })
        .collect();
    CsrPattern::from_mask(rows, cols, &mask).unwrap()
}

/// Trim the tail of the mask until nnz is a multiple of 4.
fn aligned_pattern(rows: usize, cols: usize) -> CsrPattern {
    let p = ragged_pattern(rows, cols);
    let keep = p.nnz() - p.nnz() % 4;
    let mut offsets: Vec<u32> = p.row_offsets().to_vec();
    for o in offsets.iter_mut() {
        *o = (*o).min(keep as u32);
    }
    CsrPattern::from_csr(rows, cols, offsets, p.column_indices()[..keep].to_vec()).unwrap()
}

#[test]
fn test_sparse_dense_matmul_parity() {
    let (cpu_client, cpu_device) = setup_cpu();
    let (batch, rows, cols, n) = (2, 37, 50, 72);
    let pattern = aligned_pattern(rows, cols);
    let values = det_tensor(&[batch, pattern.nnz()], 0.0, &cpu_device);
    let dense = det_tensor(&[batch, cols, n], 1.0, &cpu_device);

    let cpu_out = cpu_client
        .sparse_dense_matmul(&pattern, &values, &dense)
        .unwrap()
        .to_vec();

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, _cuda_device| {
        let v_c = cuda_client.upload(&values.to_vec(), values.shape()).unwrap();
        let d_c = cuda_client.upload(&dense.to_vec(), dense.shape()).unwrap();
        let out = cuda_client.sparse_dense_matmul(&pattern, &v_c, &d_c).unwrap();
        assert_parity_f32(
            &cuda_client.download(&out).unwrap(),
            &cpu_out,
            "sparse_dense_matmul CUDA vs CPU",
        );
    });
    let _ = cpu_out;
}

#[test]
fn test_sparse_dense_matmul_shared_values_parity() {
    let (cpu_client, cpu_device) = setup_cpu();
    let (batch, rows, cols, n) = (3, 20, 31, 17);
    let pattern = aligned_pattern(rows, cols);
    let values = det_tensor(&[1, pattern.nnz()], 0.5, &cpu_device);
    let dense = det_tensor(&[batch, cols, n], 1.5, &cpu_device);

    let cpu_out = cpu_client
        .sparse_dense_matmul(&pattern, &values, &dense)
        .unwrap()
        .to_vec();

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, _cuda_device| {
        let v_c = cuda_client.upload(&values.to_vec(), values.shape()).unwrap();
        let d_c = cuda_client.upload(&dense.to_vec(), dense.shape()).unwrap();
        let out = cuda_client.sparse_dense_matmul(&pattern, &v_c, &d_c).unwrap();
        assert_parity_f32(
            &cuda_client.download(&out).unwrap(),
            &cpu_out,
            "sparse_dense_matmul shared values CUDA vs CPU",
        );
    });
    let _ = cpu_out;
}

#[test]
fn test_sparse_softmax_fwd_bwd_parity() {
    let (cpu_client, cpu_device) = setup_cpu();
    let (batch, rows, cols) = (2, 45, 90);
    let pattern = aligned_pattern(rows, cols);
    let values = det_tensor(&[batch, pattern.nnz()], 0.2, &cpu_device);
    let grad = det_tensor(&[batch, pattern.nnz()], 2.2, &cpu_device);

    let cpu_y = cpu_client.sparse_softmax_fwd(&pattern, &values).unwrap();
    let cpu_dx = cpu_client
        .sparse_softmax_bwd(&pattern, &cpu_y, &grad)
        .unwrap()
        .to_vec();
    let cpu_y = cpu_y.to_vec();

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, _cuda_device| {
        let v_c = cuda_client.upload(&values.to_vec(), values.shape()).unwrap();
        let g_c = cuda_client.upload(&grad.to_vec(), grad.shape()).unwrap();
        let y = cuda_client.sparse_softmax_fwd(&pattern, &v_c).unwrap();
        assert_parity_f32(
            &cuda_client.download(&y).unwrap(),
            &cpu_y,
            "sparse_softmax_fwd CUDA vs CPU",
        );
        let dx = cuda_client.sparse_softmax_bwd(&pattern, &y, &g_c).unwrap();
        assert_parity_f32_relaxed(
            &cuda_client.download(&dx).unwrap(),
            &cpu_dx,
            "sparse_softmax_bwd CUDA vs CPU",
        );
    });
    let _ = (cpu_y, cpu_dx);
}
