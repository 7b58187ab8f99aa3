//! Counter-based attention dropout.
//!
//! The keep decision for score `(b, i, j)` is a pure function of the seed
//! and the flat score index `(b * M + i) * N + j`. The forward and both
//! backward phases regenerate the same mask without storing it, and the
//! device kernels evaluate the identical hash (`dropout.cuh`).

use crate::error::{Error, Result};

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// Dropout on the attention probabilities: each probability is zeroed with
/// chance `p` and the survivors are scaled by `1 / (1 - p)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    /// Drop probability in `[0, 1)`.
    pub p: f32,
    pub seed: u64,
}

impl Dropout {
    pub fn new(p: f32, seed: u64) -> Result<Self> {
        let dropout = Self { p, seed };
        dropout.validate()?;
        Ok(dropout)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.p) {
            return Err(Error::InvalidArgument {
                arg: "dropout",
                reason: format!("drop probability must be in [0, 1), got {}", self.p),
            });
        }
        Ok(())
    }

    /// Multiplier for the probability at flat score index `offset`:
    /// `0` when dropped, `1 / (1 - p)` when kept.
    #[inline]
    pub fn factor(&self, offset: u64) -> f32 {
        if uniform(self.seed, offset) < self.p {
            0.0
        } else {
            (1.0 - self.p).recip()
        }
    }
}

/// splitmix64 finalizer.
#[inline]
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Uniform sample in `[0, 1)` with 24 bits of resolution.
#[inline]
pub fn uniform(seed: u64, offset: u64) -> f32 {
    let bits = mix64(seed ^ mix64(offset.wrapping_add(GOLDEN_GAMMA)));
    (bits >> 40) as f32 * (1.0 / (1u64 << 24) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_range_and_determinism() {
        for offset in 0..10_000u64 {
            let u = uniform(7, offset);
            assert!((0.0..1.0).contains(&u), "offset {offset}: {u}");
            assert_eq!(u, uniform(7, offset));
        }
        assert_ne!(
            (0..64).map(|o| uniform(1, o)).collect::<Vec<_>>(),
            (0..64).map(|o| uniform(2, o)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_keep_rate_tracks_probability() {
        for p in [0.1f32, 0.3, 0.7] {
            let dropout = Dropout::new(p, 42).unwrap();
            let n = 100_000;
            let kept = (0..n).filter(|&o| dropout.factor(o) != 0.0).count();
            let rate = kept as f32 / n as f32;
            assert!((rate - (1.0 - p)).abs() < 0.01, "p={p}: keep rate {rate}");
        }
    }

    #[test]
    fn test_kept_values_are_rescaled() {
        let dropout = Dropout::new(0.25, 3).unwrap();
        for o in 0..1000 {
            let f = dropout.factor(o);
            assert!(f == 0.0 || (f - 1.0 / 0.75).abs() < 1e-6);
        }
        let none = Dropout::new(0.0, 3).unwrap();
        assert!((0..1000).all(|o| none.factor(o) == 1.0));
    }

    #[test]
    fn test_rejects_out_of_range_probability() {
        assert!(Dropout::new(1.0, 0).is_err());
        assert!(Dropout::new(-0.1, 0).is_err());
        assert!(Dropout::new(f32::NAN, 0).is_err());
    }
}
