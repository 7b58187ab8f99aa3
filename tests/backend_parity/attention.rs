//! Backend parity tests for FusedAttentionOps (fwd + bwd).

use super::helpers::*;
use memattn::ops::traits::FusedAttentionOps;
use memattn::{AttentionOptions, Dropout, default_scale};

struct Case {
    b: usize,
    m: usize,
    n: usize,
    d: usize,
    dv: usize,
    causal: bool,
}

fn fwd_parity(case: Case, label: &str) {
    let (cpu_client, cpu_device) = setup_cpu();
    let Case { b, m, n, d, dv, causal } = case;
    let q = det_tensor(&[b, m, d], 0.0, &cpu_device);
    let k = det_tensor(&[b, n, d], 1.0, &cpu_device);
    let v = det_tensor(&[b, n, dv], 2.0, &cpu_device);
    let scale = default_scale(d);

    let (cpu_out, cpu_lse) = cpu_client
        .attention_fwd(&q, &k, &v, scale, causal, true)
        .unwrap();
    let cpu_out_vec = cpu_out.to_vec();
    let cpu_lse_vec = cpu_lse.unwrap().to_vec();
    assert_eq!(cpu_out_vec.len(), b * m * dv);

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, _cuda_device| {
        let q_c = cuda_client.upload(&q.to_vec(), &[b, m, d]).unwrap();
        let k_c = cuda_client.upload(&k.to_vec(), &[b, n, d]).unwrap();
        let v_c = cuda_client.upload(&v.to_vec(), &[b, n, dv]).unwrap();
        let (cuda_out, cuda_lse) = cuda_client
            .attention_fwd(&q_c, &k_c, &v_c, scale, causal, true)
            .unwrap();
        assert_parity_f32(
            &cuda_client.download(&cuda_out).unwrap(),
            &cpu_out_vec,
            &format!("attention_fwd {label} CUDA vs CPU"),
        );
        assert_parity_f32(
            &cuda_client.download(&cuda_lse.unwrap()).unwrap(),
            &cpu_lse_vec,
            &format!("attention_fwd lse {label} CUDA vs CPU"),
        );
    });
    let _ = (cpu_lse_vec, label);
}

fn bwd_parity(case: Case, label: &str) {
    let (cpu_client, cpu_device) = setup_cpu();
    let Case { b, m, n, d, dv, causal } = case;
    let q = det_tensor(&[b, m, d], 0.3, &cpu_device);
    let k = det_tensor(&[b, n, d], 1.3, &cpu_device);
    let v = det_tensor(&[b, n, dv], 2.3, &cpu_device);
    let grad = det_tensor(&[b, m, dv], 3.3, &cpu_device);
    let scale = default_scale(d);

    let (_, lse) = cpu_client
        .attention_fwd(&q, &k, &v, scale, causal, true)
        .unwrap();
    let lse = lse.unwrap();
    let (dq, dk, dv_cpu) = cpu_client
        .attention_bwd(&grad, &q, &k, &v, &lse, scale, causal)
        .unwrap();
    let (dq, dk, dv_cpu) = (dq.to_vec(), dk.to_vec(), dv_cpu.to_vec());

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, _cuda_device| {
        let up = |t: &memattn::Tensor<memattn::CpuRuntime>| {
            cuda_client.upload(&t.to_vec(), t.shape()).unwrap()
        };
        let (q_c, k_c, v_c, g_c, lse_c) = (up(&q), up(&k), up(&v), up(&grad), up(&lse));
        let (cdq, cdk, cdv) = cuda_client
            .attention_bwd(&g_c, &q_c, &k_c, &v_c, &lse_c, scale, causal)
            .unwrap();
        for (name, got, want) in [("dq", &cdq, &dq), ("dk", &cdk, &dk), ("dv", &cdv, &dv_cpu)] {
            assert_parity_f32_relaxed(
                &cuda_client.download(got).unwrap(),
                want,
                &format!("attention_bwd {name} {label} CUDA vs CPU"),
            );
        }
    });
    let _ = (dq, dk, dv_cpu, label);
}

#[test]
fn test_attention_fwd_non_causal_parity() {
    fwd_parity(Case { b: 2, m: 16, n: 40, d: 32, dv: 32, causal: false }, "non-causal");
}

#[test]
fn test_attention_fwd_causal_parity() {
    fwd_parity(Case { b: 1, m: 70, n: 70, d: 64, dv: 64, causal: true }, "causal");
}

#[test]
fn test_attention_fwd_mixed_dims_parity() {
    fwd_parity(Case { b: 3, m: 9, n: 130, d: 20, dv: 48, causal: false }, "d=20 dv=48");
}

#[test]
fn test_attention_fwd_head_dim_128_parity() {
    fwd_parity(Case { b: 1, m: 33, n: 65, d: 128, dv: 128, causal: false }, "d=128");
}

#[test]
fn test_attention_fwd_empty_keys_parity() {
    fwd_parity(Case { b: 2, m: 3, n: 0, d: 16, dv: 16, causal: false }, "n=0");
}

#[test]
fn test_attention_bwd_non_causal_parity() {
    bwd_parity(Case { b: 2, m: 12, n: 20, d: 32, dv: 32, causal: false }, "non-causal");
}

#[test]
fn test_attention_bwd_causal_parity() {
    bwd_parity(Case { b: 1, m: 66, n: 66, d: 64, dv: 32, causal: true }, "causal");
}

/// Bias plus dropout through fwd and bwd; both backends draw the same mask.
fn options_parity(case: Case, p: f32, label: &str) {
    let (cpu_client, cpu_device) = setup_cpu();
    let Case { b, m, n, d, dv, causal } = case;
    let q = det_tensor(&[b, m, d], 0.2, &cpu_device);
    let k = det_tensor(&[b, n, d], 1.2, &cpu_device);
    let v = det_tensor(&[b, n, dv], 2.2, &cpu_device);
    let bias = det_tensor(&[b, m, n], 0.6, &cpu_device);
    let grad = det_tensor(&[b, m, dv], 3.2, &cpu_device);
    let dropout = Dropout::new(p, 0x5eed).unwrap();
    let scale = default_scale(d);

    let options = AttentionOptions::new(scale)
        .with_causal(causal)
        .with_bias(&bias)
        .with_dropout(dropout);
    let (out, lse) = cpu_client.attention_fwd_with(&q, &k, &v, &options, true).unwrap();
    let lse = lse.unwrap();
    let (dq, dk, dv_cpu) = cpu_client
        .attention_bwd_with(&grad, &q, &k, &v, &lse, &options)
        .unwrap();
    let cpu = [out.to_vec(), lse.to_vec(), dq.to_vec(), dk.to_vec(), dv_cpu.to_vec()];

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, _cuda_device| {
        let up = |t: &memattn::Tensor<memattn::CpuRuntime>| {
            cuda_client.upload(&t.to_vec(), t.shape()).unwrap()
        };
        let (q_c, k_c, v_c, bias_c, g_c) = (up(&q), up(&k), up(&v), up(&bias), up(&grad));
        let options = AttentionOptions::new(scale)
            .with_causal(causal)
            .with_bias(&bias_c)
            .with_dropout(dropout);
        let (out_c, lse_c) = cuda_client
            .attention_fwd_with(&q_c, &k_c, &v_c, &options, true)
            .unwrap();
        let lse_c = lse_c.unwrap();
        let (cdq, cdk, cdv) = cuda_client
            .attention_bwd_with(&g_c, &q_c, &k_c, &v_c, &lse_c, &options)
            .unwrap();
        assert_parity_f32(
            &cuda_client.download(&out_c).unwrap(),
            &cpu[0],
            &format!("attention_fwd_with {label} CUDA vs CPU"),
        );
        assert_parity_f32(
            &cuda_client.download(&lse_c).unwrap(),
            &cpu[1],
            &format!("attention_fwd_with lse {label} CUDA vs CPU"),
        );
        for (name, got, want) in [("dq", &cdq, &cpu[2]), ("dk", &cdk, &cpu[3]), ("dv", &cdv, &cpu[4])] {
            assert_parity_f32_relaxed(
                &cuda_client.download(got).unwrap(),
                want,
                &format!("attention_bwd_with {name} {label} CUDA vs CPU"),
            );
        }
    });
    let _ = (cpu, label);
}

#[test]
fn test_attention_bias_dropout_parity() {
    options_parity(Case { b: 2, m: 20, n: 45, d: 32, dv: 16, causal: false }, 0.2, "non-causal");
}

#[test]
fn test_attention_bias_dropout_causal_parity() {
    options_parity(Case { b: 1, m: 40, n: 40, d: 64, dv: 64, causal: true }, 0.5, "causal");
}

#[cfg(feature = "cuda")]
#[test]
fn test_attention_launchers_reject_short_device_buffers() {
    use memattn::DenseDims;
    use memattn::ops::cuda::{DeviceParams, launch_attention_bwd, launch_attention_fwd};

    with_cuda_backend(|client, _device| {
        let dims = DenseDims { batch: 1, seq_q: 4, seq_k: 8, head_dim: 16, value_dim: 16 };
        let full = |len: usize| client.upload(&det_data(len, 0.0), &[len]).unwrap();
        let q = full(dims.q_len());
        let short_k = full(dims.k_len() - 1);
        let v = full(dims.v_len());
        let params = DeviceParams::new(1.0, false);
        let zeros = |len: usize| client.stream().alloc_zeros::<f32>(len).unwrap();

        let (mut out, mut lse) = (zeros(dims.out_len()), zeros(dims.lse_len()));
        let err = launch_attention_fwd(
            &client,
            &dims,
            q.storage().as_f32().unwrap(),
            short_k.storage().as_f32().unwrap(),
            v.storage().as_f32().unwrap(),
            &params,
            &mut out,
            &mut lse,
        )
        .unwrap_err();
        assert!(matches!(err, memattn::Error::InvalidArgument { arg: "k", .. }), "{err}");

        let k = full(dims.k_len());
        let grad = full(dims.out_len());
        let lse_in = full(dims.lse_len());
        let (mut dq, mut dk, mut dv) = (zeros(dims.q_len()), zeros(dims.k_len()), zeros(dims.v_len() - 1));
        let err = launch_attention_bwd(
            &client,
            &dims,
            q.storage().as_f32().unwrap(),
            k.storage().as_f32().unwrap(),
            v.storage().as_f32().unwrap(),
            grad.storage().as_f32().unwrap(),
            lse_in.storage().as_f32().unwrap(),
            &params,
            &mut dq,
            &mut dk,
            &mut dv,
        )
        .unwrap_err();
        assert!(matches!(err, memattn::Error::InvalidArgument { arg: "dv", .. }), "{err}");

        let short_bias = full(dims.bias_len() - 1);
        let biased = DeviceParams {
            bias: Some(short_bias.storage().as_f32().unwrap()),
            ..params
        };
        let err = launch_attention_fwd(
            &client,
            &dims,
            q.storage().as_f32().unwrap(),
            k.storage().as_f32().unwrap(),
            v.storage().as_f32().unwrap(),
            &biased,
            &mut out,
            &mut lse,
        )
        .unwrap_err();
        assert!(matches!(err, memattn::Error::InvalidArgument { arg: "bias", .. }), "{err}");
    });
}
