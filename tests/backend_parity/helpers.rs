//! Shared helpers for memattn backend parity tests.

use memattn::{CpuClient, CpuDevice, CpuRuntime, Tensor};
#[cfg(feature = "cuda")]
use std::sync::{Mutex, OnceLock};

#[cfg(feature = "cuda")]
static CUDA_BACKEND_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn setup_cpu() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

/// Deterministic pseudo-random data using a sin-based pattern.
pub fn det_data(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * 0.1 + phase).sin() * 0.5).collect()
}

pub fn det_tensor(shape: &[usize], phase: f32, device: &CpuDevice) -> Tensor<CpuRuntime> {
    let n: usize = shape.iter().product();
    Tensor::<CpuRuntime>::from_slice(&det_data(n, phase), shape, device)
}

/// Relaxed parity check for backward passes (atomicAdd causes FP non-determinism).
pub fn assert_parity_f32_relaxed(a: &[f32], b: &[f32], op: &str) {
    assert_parity_f32_tol(a, b, op, 1e-3, 1e-5);
}

/// Forward parity; device kernels are built with fast-math intrinsics.
pub fn assert_parity_f32(a: &[f32], b: &[f32], op: &str) {
    assert_parity_f32_tol(a, b, op, 1e-4, 1e-6);
}

pub fn assert_parity_f32_tol(a: &[f32], b: &[f32], op: &str, rtol: f32, atol: f32) {
    assert_eq!(a.len(), b.len(), "{op}: length {} vs {}", a.len(), b.len());
    let worst = a
        .iter()
        .zip(b)
        .enumerate()
        .filter(|&(_, (x, y))| {
            // -inf LSE rows must agree exactly
            if x.is_infinite() || y.is_infinite() {
                x != y
            } else {
                (x - y).abs() > atol + rtol * y.abs()
            }
        })
        .max_by(|(_, (x0, y0)), (_, (x1, y1))| (*x0 - *y0).abs().total_cmp(&(*x1 - *y1).abs()));
    if let Some((i, (x, y))) = worst {
        panic!("{op}: index {i}: {x} vs {y} (diff={})", (x - y).abs());
    }
}

#[cfg(feature = "cuda")]
pub fn with_cuda_backend<F>(mut f: F)
where
    F: FnMut(memattn::CudaClient, memattn::CudaDevice),
{
    let _guard = CUDA_BACKEND_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if !memattn::runtime::cuda::is_cuda_available() {
        eprintln!("CUDA feature enabled but runtime unavailable, skipping");
        return;
    }
    let device = memattn::CudaDevice::new(0);
    let client = match memattn::CudaClient::new(device.clone()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to create CudaClient: {:?}, skipping", e);
            return;
        }
    };
    f(client, device);
}
