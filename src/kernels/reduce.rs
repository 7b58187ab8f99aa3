//! Cooperative row reductions.
//!
//! A reduction group of `GROUP` lanes owns one row: lane `l` folds elements
//! `l, l + GROUP, l + 2*GROUP, ...` into a private partial, then partials are
//! combined pairwise at halving strides (16, 8, 4, 2, 1) until lane 0 holds the
//! result. The device kernels reduce in the same order with warp shuffles.

/// Lanes per reduction group (one warp).
pub const GROUP: usize = 32;

#[inline]
fn tree_reduce(values: &[f32], identity: f32, op: impl Fn(f32, f32) -> f32) -> f32 {
    let mut partials = [identity; GROUP];
    for (i, &v) in values.iter().enumerate() {
        let lane = i % GROUP;
        partials[lane] = op(partials[lane], v);
    }
    let mut stride = GROUP / 2;
    while stride > 0 {
        for lane in 0..stride {
            partials[lane] = op(partials[lane], partials[lane + stride]);
        }
        stride /= 2;
    }
    partials[0]
}

/// Maximum of `values`, `-inf` when empty.
#[inline]
pub fn row_max(values: &[f32]) -> f32 {
    tree_reduce(values, f32::NEG_INFINITY, f32::max)
}

/// Sum of `values`.
#[inline]
pub fn row_sum(values: &[f32]) -> f32 {
    tree_reduce(values, 0.0, |a, b| a + b)
}

/// `Σ a[i] * b[i]` in the group reduction order.
#[inline]
pub fn row_dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut partials = [0.0f32; GROUP];
    for (i, (&x, &y)) in a.iter().zip(b).enumerate() {
        partials[i % GROUP] += x * y;
    }
    row_sum(&partials)
}
