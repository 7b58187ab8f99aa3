//! Integration tests for block-sparse SpMM and row-restricted softmax.

use memattn::ops::traits::SparseAttentionOps;
use memattn::{CpuClient, CpuDevice, CpuRuntime, CsrPattern, Error, Tensor};
use proptest::prelude::*;

fn setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

fn det_data(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * 0.23 + phase).sin() * 2.0).collect()
}

/// Expand CSR values to a dense row-major matrix, absent entries = `fill`.
fn densify(pattern: &CsrPattern, values: &[f32], fill: f32) -> Vec<f32> {
    let mut dense = vec![fill; pattern.rows() * pattern.cols()];
    for row in 0..pattern.rows() {
        for l in pattern.row_range(row) {
            dense[row * pattern.cols() + pattern.column_indices()[l] as usize] = values[l];
        }
    }
    dense
}

#[test]
fn test_spmm_three_by_three() {
    let (client, device) = setup();
    // [[1, 0, 2],
    //  [0, 3, 0],
    //  [4, 0, 5]]
    let pattern = CsrPattern::from_csr(3, 3, vec![0, 2, 3, 5], vec![0, 2, 1, 0, 2]).unwrap();
    let values = Tensor::<CpuRuntime>::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0], &[1, 5], &device);
    let dense = Tensor::<CpuRuntime>::from_slice(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[1, 3, 2], &device);

    let out = client.sparse_dense_matmul(&pattern, &values, &dense).unwrap();
    assert_eq!(out.shape(), &[1, 3, 2]);
    assert_eq!(out.to_vec(), vec![3.0, 2.0, 0.0, 3.0, 9.0, 5.0]);
}

#[test]
fn test_spmm_matches_dense_product() {
    let (client, device) = setup();
    let (rows, cols, n, batch) = (6, 9, 5, 2);
    let mask: Vec<bool> = (0..rows * cols).map(|i| (i * 7) % 3 != 0).collect();
    let pattern = CsrPattern::from_mask(rows, cols, &mask).unwrap();
    assert_eq!(pattern.nnz() % 4, 0);

    let values = det_data(batch * pattern.nnz(), 0.0);
    let dense = det_data(batch * cols * n, 1.0);
    let out = client
        .sparse_dense_matmul(
            &pattern,
            &Tensor::<CpuRuntime>::from_slice(&values, &[batch, pattern.nnz()], &device),
            &Tensor::<CpuRuntime>::from_slice(&dense, &[batch, cols, n], &device),
        )
        .unwrap()
        .to_vec();

    for b in 0..batch {
        let a = densify(&pattern, &values[b * pattern.nnz()..(b + 1) * pattern.nnz()], 0.0);
        for i in 0..rows {
            for c in 0..n {
                let mut expected = 0.0;
                for j in 0..cols {
                    expected += a[i * cols + j] * dense[(b * cols + j) * n + c];
                }
                let got = out[(b * rows + i) * n + c];
                assert!((got - expected).abs() < 1e-4, "b={b} i={i} c={c}: {got} vs {expected}");
            }
        }
    }
}

#[test]
fn test_spmm_shared_values_match_repeated_values() {
    let (client, device) = setup();
    let pattern = CsrPattern::from_csr(2, 3, vec![0, 1, 4], vec![2, 0, 1, 2]).unwrap();
    let batch = 3;
    let values = det_data(pattern.nnz(), 0.5);
    let dense = Tensor::<CpuRuntime>::from_slice(&det_data(batch * 3 * 4, 0.1), &[batch, 3, 4], &device);

    let shared = Tensor::<CpuRuntime>::from_slice(&values, &[1, pattern.nnz()], &device);
    let repeated: Vec<f32> = values.iter().cycle().take(batch * pattern.nnz()).cloned().collect();
    let repeated = Tensor::<CpuRuntime>::from_slice(&repeated, &[batch, pattern.nnz()], &device);

    let a = client.sparse_dense_matmul(&pattern, &shared, &dense).unwrap();
    let b = client.sparse_dense_matmul(&pattern, &repeated, &dense).unwrap();
    assert_eq!(a.to_vec(), b.to_vec());
}

#[test]
fn test_batched_ops_match_per_slice_runs() {
    let (client, device) = setup();
    let (rows, cols, n, batch) = (6, 9, 5, 3);
    let mask: Vec<bool> = (0..rows * cols).map(|i| (i * 7) % 3 != 0).collect();
    let pattern = CsrPattern::from_mask(rows, cols, &mask).unwrap();
    let nnz = pattern.nnz();
    assert_eq!(nnz % 4, 0);

    let values = det_data(batch * nnz, 0.3);
    let dense = det_data(batch * cols * n, 1.7);
    let grad = det_data(batch * nnz, 2.9);
    let tensor = |data: &[f32], shape: &[usize]| Tensor::<CpuRuntime>::from_slice(data, shape, &device);

    let spmm = client
        .sparse_dense_matmul(&pattern, &tensor(&values, &[batch, nnz]), &tensor(&dense, &[batch, cols, n]))
        .unwrap()
        .to_vec();
    let probs = client
        .sparse_softmax_fwd(&pattern, &tensor(&values, &[batch, nnz]))
        .unwrap();
    let dx = client
        .sparse_softmax_bwd(&pattern, &probs, &tensor(&grad, &[batch, nnz]))
        .unwrap()
        .to_vec();
    let probs = probs.to_vec();

    let close = |a: &[f32], b: &[f32], what: &str, slice: usize| {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() <= 1e-6, "{what} slice {slice} index {i}: {x} vs {y}");
        }
    };

    for s in 0..batch {
        let v_s = &values[s * nnz..(s + 1) * nnz];
        let d_s = &dense[s * cols * n..(s + 1) * cols * n];
        let g_s = &grad[s * nnz..(s + 1) * nnz];

        let one = client
            .sparse_dense_matmul(&pattern, &tensor(v_s, &[1, nnz]), &tensor(d_s, &[1, cols, n]))
            .unwrap()
            .to_vec();
        close(&spmm[s * rows * n..(s + 1) * rows * n], &one, "spmm", s);

        let p_s = client.sparse_softmax_fwd(&pattern, &tensor(v_s, &[1, nnz])).unwrap();
        close(&probs[s * nnz..(s + 1) * nnz], &p_s.to_vec(), "softmax fwd", s);

        let dx_s = client
            .sparse_softmax_bwd(&pattern, &p_s, &tensor(g_s, &[1, nnz]))
            .unwrap()
            .to_vec();
        close(&dx[s * nnz..(s + 1) * nnz], &dx_s, "softmax bwd", s);
    }
}

#[test]
fn test_spmm_rejects_bad_operands() {
    let (client, device) = setup();
    // nnz = 3: batched value arrays are not allowed
    let pattern = CsrPattern::from_csr(2, 2, vec![0, 1, 3], vec![0, 0, 1]).unwrap();
    let values = Tensor::<CpuRuntime>::from_slice(&[1.0; 6], &[2, 3], &device);
    let dense = Tensor::<CpuRuntime>::from_slice(&[1.0; 8], &[2, 2, 2], &device);
    let err = client.sparse_dense_matmul(&pattern, &values, &dense).unwrap_err();
    assert!(err.to_string().contains("multiple of 4"), "{err}");

    let dense = Tensor::<CpuRuntime>::from_slice(&[1.0; 6], &[1, 3, 2], &device);
    let values = Tensor::<CpuRuntime>::from_slice(&[1.0; 3], &[1, 3], &device);
    let err = client.sparse_dense_matmul(&pattern, &values, &dense).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { arg: "dense", .. }), "{err}");

    let dense = Tensor::<CpuRuntime>::from_slice(&[1.0; 4], &[1, 2, 2], &device);
    let values = Tensor::<CpuRuntime>::from_slice(&[1.0; 2], &[1, 2], &device);
    let err = client.sparse_dense_matmul(&pattern, &values, &dense).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { arg: "values", .. }), "{err}");
}

#[test]
fn test_invalid_patterns_are_rejected() {
    assert!(matches!(
        CsrPattern::from_csr(2, 2, vec![0, 2], vec![0, 1]),
        Err(Error::InvalidSparsePattern { .. })
    ));
    assert!(CsrPattern::from_csr(1, 2, vec![0, 1], vec![2]).is_err());
    assert!(CsrPattern::new(2, 2, vec![0, 1, 2], vec![0, 1], vec![0, 0]).is_err());
}

#[test]
fn test_softmax_backward_matches_dense_jacobian() {
    let (client, device) = setup();
    let pattern = CsrPattern::from_mask(
        3,
        4,
        &[
            true, false, true, true, //
            false, false, false, false, //
            true, true, true, true,
        ],
    )
    .unwrap();
    let nnz = pattern.nnz();
    let values = Tensor::<CpuRuntime>::from_slice(&det_data(nnz, 0.4), &[1, nnz], &device);
    let dy_data = det_data(nnz, 1.9);
    let dy = Tensor::<CpuRuntime>::from_slice(&dy_data, &[1, nnz], &device);

    let y = client.sparse_softmax_fwd(&pattern, &values).unwrap();
    let dx = client.sparse_softmax_bwd(&pattern, &y, &dy).unwrap().to_vec();
    let y = y.to_vec();

    for row in 0..pattern.rows() {
        let range = pattern.row_range(row);
        for i in range.clone() {
            let expected: f32 = range
                .clone()
                .map(|j| {
                    let jac = if i == j { y[i] * (1.0 - y[i]) } else { -y[i] * y[j] };
                    jac * dy_data[j]
                })
                .sum();
            assert!((dx[i] - expected).abs() < 1e-5, "entry {i}: {} vs {expected}", dx[i]);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_softmax_matches_dense_masked_softmax(
        rows in 1usize..6,
        cols in 1usize..40,
        seed in 0u64..10_000,
    ) {
        let mask: Vec<bool> = (0..rows * cols)
            .map(|i| (i as u64 * 2654435761 + seed) % 5 < 3)
            .collect();
        let pattern = CsrPattern::from_mask(rows, cols, &mask).unwrap();
        let nnz = pattern.nnz();
        let values = det_data(nnz, seed as f32 * 0.01);

        let (client, device) = setup();
        let y = client
            .sparse_softmax_fwd(&pattern, &Tensor::<CpuRuntime>::from_slice(&values, &[1, nnz], &device))
            .unwrap()
            .to_vec();

        let dense = densify(&pattern, &values, f32::NEG_INFINITY);
        let y_dense = densify(&pattern, &y, 0.0);
        for row in 0..rows {
            let r = &dense[row * cols..(row + 1) * cols];
            let mx = r.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let total: f32 = r.iter().map(|x| (x - mx).exp()).sum();
            for c in 0..cols {
                let expected = if mx == f32::NEG_INFINITY { 0.0 } else { (r[c] - mx).exp() / total };
                prop_assert!((y_dense[row * cols + c] - expected).abs() < 1e-5);
            }
            if pattern.row_len(row) > 0 {
                let s: f32 = y[pattern.row_range(row)].iter().sum();
                prop_assert!((s - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn prop_balanced_order_is_permutation_by_length(
        lens in proptest::collection::vec(0usize..8, 1..12),
    ) {
        let cols = 8;
        let mut offsets = vec![0u32];
        let mut columns = Vec::new();
        for &len in &lens {
            columns.extend((0..len as u32).collect::<Vec<_>>());
            offsets.push(columns.len() as u32);
        }
        let pattern = CsrPattern::from_csr(lens.len(), cols, offsets, columns).unwrap();
        let order = pattern.row_indices();
        let mut seen: Vec<u32> = order.to_vec();
        seen.sort_unstable();
        prop_assert_eq!(seen, (0..lens.len() as u32).collect::<Vec<_>>());
        for w in order.windows(2) {
            prop_assert!(pattern.row_len(w[0] as usize) >= pattern.row_len(w[1] as usize));
        }
    }
}
