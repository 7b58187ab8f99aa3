//! Tile-level dot product and accumulate primitives.
//!
//! Every loop is a main body over full `LANES`-wide chunks followed by a
//! scalar remainder tail. On x86_64 with AVX2+FMA the body runs on 256-bit
//! registers; elsewhere the same chunking runs on scalars.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

const LANES: usize = 8;

/// `Σ a[i] * b[i]`
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let len = a.len().min(b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { dot_avx2_fma(a.as_ptr(), b.as_ptr(), len) };
        }
    }

    dot_scalar(&a[..len], &b[..len])
}

#[inline]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    let chunks = a.len() / LANES;
    let mut acc = [0.0f32; LANES];
    for c in 0..chunks {
        let base = c * LANES;
        for l in 0..LANES {
            acc[l] += a[base + l] * b[base + l];
        }
    }
    let mut result: f32 = acc.iter().sum();
    for i in chunks * LANES..a.len() {
        result += a[i] * b[i];
    }
    result
}

/// `out[i] += weight * x[i]`
#[inline]
pub fn axpy(out: &mut [f32], x: &[f32], weight: f32) {
    debug_assert_eq!(out.len(), x.len());
    let len = out.len().min(x.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            unsafe { axpy_avx2_fma(out.as_mut_ptr(), x.as_ptr(), weight, len) };
            return;
        }
    }

    for (o, &xi) in out[..len].iter_mut().zip(&x[..len]) {
        *o += weight * xi;
    }
}

/// `out[i] = out[i] * alpha + weight * x[i]`: rescale an accumulator and add
/// one weighted row in a single pass.
#[inline]
pub fn scale_axpy(out: &mut [f32], alpha: f32, x: &[f32], weight: f32) {
    debug_assert_eq!(out.len(), x.len());
    for (o, &xi) in out.iter_mut().zip(x) {
        *o = *o * alpha + weight * xi;
    }
}

/// `out[i] *= alpha`
#[inline]
pub fn scale(out: &mut [f32], alpha: f32) {
    for o in out.iter_mut() {
        *o *= alpha;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_avx2_fma(a: *const f32, b: *const f32, len: usize) -> f32 {
    unsafe {
        let chunks = len / LANES;
        let remainder = len % LANES;

        let mut acc = _mm256_setzero_ps();
        for i in 0..chunks {
            let offset = i * LANES;
            let va = _mm256_loadu_ps(a.add(offset));
            let vb = _mm256_loadu_ps(b.add(offset));
            acc = _mm256_fmadd_ps(va, vb, acc);
        }

        let mut result = hsum_avx2(acc);
        for i in 0..remainder {
            let offset = chunks * LANES + i;
            result += *a.add(offset) * *b.add(offset);
        }
        result
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn axpy_avx2_fma(out: *mut f32, x: *const f32, weight: f32, len: usize) {
    unsafe {
        let chunks = len / LANES;
        let remainder = len % LANES;
        let vw = _mm256_set1_ps(weight);

        for i in 0..chunks {
            let offset = i * LANES;
            let vo = _mm256_loadu_ps(out.add(offset));
            let vx = _mm256_loadu_ps(x.add(offset));
            _mm256_storeu_ps(out.add(offset), _mm256_fmadd_ps(vw, vx, vo));
        }

        for i in 0..remainder {
            let offset = chunks * LANES + i;
            *out.add(offset) += weight * *x.add(offset);
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn hsum_avx2(v: __m256) -> f32 {
    unsafe {
        let hi128 = _mm256_extractf128_ps(v, 1);
        let lo128 = _mm256_castps256_ps128(v);
        let sum128 = _mm_add_ps(lo128, hi128);
        let hi64 = _mm_movehl_ps(sum128, sum128);
        let sum64 = _mm_add_ps(sum128, hi64);
        let hi32 = _mm_shuffle_ps(sum64, sum64, 0b_00_00_00_01);
        let sum32 = _mm_add_ss(sum64, hi32);
        _mm_cvtss_f32(sum32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(n: usize, phase: f32) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.37 + phase).sin()).collect()
    }

    #[test]
    fn test_dot_matches_naive_for_all_tails() {
        for len in 0..40 {
            let a = pattern(len, 0.0);
            let b = pattern(len, 1.3);
            let naive: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
            let got = dot(&a, &b);
            assert!(
                (got - naive).abs() < 1e-5,
                "len={len}: dot={got}, naive={naive}"
            );
            assert!((dot_scalar(&a, &b) - naive).abs() < 1e-5);
        }
    }

    #[test]
    fn test_axpy_matches_naive_for_all_tails() {
        for len in 0..40 {
            let x = pattern(len, 0.5);
            let mut out = pattern(len, 2.0);
            let expected: Vec<f32> = out.iter().zip(&x).map(|(o, xi)| o + 0.75 * xi).collect();
            axpy(&mut out, &x, 0.75);
            for (i, (g, e)) in out.iter().zip(&expected).enumerate() {
                assert!((g - e).abs() < 1e-6, "len={len} i={i}: {g} vs {e}");
            }
        }
    }

    #[test]
    fn test_scale_axpy() {
        let mut out = vec![1.0, 2.0, 3.0];
        scale_axpy(&mut out, 0.5, &[2.0, 2.0, 2.0], 3.0);
        assert_eq!(out, vec![6.5, 7.0, 7.5]);
        scale(&mut out, 2.0);
        assert_eq!(out, vec![13.0, 14.0, 15.0]);
    }
}
