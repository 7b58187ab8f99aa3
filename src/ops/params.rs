//! Score modifiers for the slice-level attention kernels.

use crate::error::Result;
use crate::kernels::Dropout;
use crate::ops::validate::{DenseDims, check_scale};

/// How raw `q·k` products become logits, and what happens to the resulting
/// probabilities before they weight the values.
///
/// The logit for `(b, i, j)` is `scale * q_i·k_j + bias[b, i, j]`, or `-inf`
/// when `causal` and `j > i`. Dropout multiplies each probability by its
/// keep factor; the log-sum-exp is always of the undropped softmax.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionParams<'a> {
    pub scale: f32,
    pub causal: bool,
    /// Additive logit bias, `[B, M, N]`.
    pub bias: Option<&'a [f32]>,
    pub dropout: Option<Dropout>,
}

impl<'a> AttentionParams<'a> {
    pub fn new(scale: f32) -> Self {
        Self {
            scale,
            causal: false,
            bias: None,
            dropout: None,
        }
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_bias(mut self, bias: &'a [f32]) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_dropout(mut self, dropout: Dropout) -> Self {
        self.dropout = Some(dropout);
        self
    }

    /// Check the scale, dropout probability and bias length against `dims`.
    pub fn check(&self, dims: &DenseDims) -> Result<()> {
        check_scale(self.scale)?;
        if let Some(bias) = self.bias {
            dims.check_slice("bias", bias.len(), dims.bias_len())?;
        }
        if let Some(dropout) = &self.dropout {
            dropout.validate()?;
        }
        Ok(())
    }

    #[inline]
    pub fn is_masked(&self, i: usize, j: usize) -> bool {
        self.causal && j > i
    }

    /// Logit of `(b, i, j)` given the raw dot product.
    #[inline]
    pub fn logit(&self, dims: &DenseDims, b: usize, i: usize, j: usize, dot: f32) -> f32 {
        if self.is_masked(i, j) {
            return f32::NEG_INFINITY;
        }
        let s = self.scale * dot;
        match self.bias {
            Some(bias) => s + bias[dims.score_index(b, i, j)],
            None => s,
        }
    }

    /// Dropout multiplier of `(b, i, j)`; `1` without dropout.
    #[inline]
    pub fn keep_factor(&self, dims: &DenseDims, b: usize, i: usize, j: usize) -> f32 {
        match &self.dropout {
            Some(dropout) => dropout.factor(dims.score_index(b, i, j) as u64),
            None => 1.0,
        }
    }
}
