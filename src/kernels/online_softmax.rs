//! Running softmax statistics for the streaming scan.
//!
//! For one query row the scan keeps `max` (largest score seen so far) and
//! `sum` (Σ exp(score - max) over the same scores). The output accumulator is
//! kept in the same frame as `sum`, so at every point `acc / sum` is the exact
//! softmax-weighted average of the values scanned so far.

/// Factor that moves a quantity from the `old` max frame into the `new` one.
///
/// `exp(-inf - (-inf))` would be NaN; an empty frame (old max `-inf`) holds no
/// mass, so its factor is 0.
#[inline]
pub fn rescale_factor(old_max: f32, new_max: f32) -> f32 {
    if old_max == f32::NEG_INFINITY {
        0.0
    } else {
        (old_max - new_max).exp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStats {
    pub max: f32,
    pub sum: f32,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl RunningStats {
    pub const EMPTY: RunningStats = RunningStats {
        max: f32::NEG_INFINITY,
        sum: 0.0,
    };

    /// Statistics of a single tile of scores, in the tile's own max frame.
    ///
    /// Writes `exp(score - tile_max)` for each score into `weights`. A score
    /// of `-inf` (masked key) gets weight 0; a fully masked tile comes back
    /// as [`RunningStats::EMPTY`].
    pub fn from_tile(scores: &[f32], weights: &mut [f32]) -> Self {
        debug_assert_eq!(scores.len(), weights.len());
        let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            weights.iter_mut().for_each(|w| *w = 0.0);
            return Self::EMPTY;
        }
        let mut sum = 0.0;
        for (w, &s) in weights.iter_mut().zip(scores) {
            *w = (s - max).exp();
            sum += *w;
        }
        Self { max, sum }
    }

    /// Combine two partial scans over disjoint key ranges.
    ///
    /// Returns the factors to apply to `self`'s and `other`'s accumulators
    /// before adding them.
    pub fn merge(&mut self, other: RunningStats) -> (f32, f32) {
        let new_max = self.max.max(other.max);
        if new_max == f32::NEG_INFINITY {
            return (0.0, 0.0);
        }
        let a = rescale_factor(self.max, new_max);
        let b = rescale_factor(other.max, new_max);
        self.sum = self.sum * a + other.sum * b;
        self.max = new_max;
        (a, b)
    }

    /// `max + ln(sum)`; `-inf` for a row that saw no keys.
    #[inline]
    pub fn log_sum_exp(&self) -> f32 {
        if self.sum == 0.0 {
            f32::NEG_INFINITY
        } else {
            self.max + self.sum.ln()
        }
    }

    /// `1 / sum`, or 0 for an empty row so its output stays zero.
    #[inline]
    pub fn inv_sum(&self) -> f32 {
        if self.sum == 0.0 { 0.0 } else { self.sum.recip() }
    }
}
