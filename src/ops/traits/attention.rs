//! Fused attention operation traits

use crate::error::Result;
use crate::kernels::Dropout;
use crate::runtime::Runtime;
use crate::tensor::Tensor;

/// The conventional similarity scale `1 / sqrt(head_dim)`.
///
/// Pass `1.0` instead to get raw, unscaled dot-product scores.
pub fn default_scale(head_dim: usize) -> f32 {
    (head_dim as f32).sqrt().recip()
}

/// Score options for [`FusedAttentionOps::attention_fwd_with`] and
/// [`FusedAttentionOps::attention_bwd_with`].
///
/// The backward pass must be given the same options as the forward that
/// produced its log-sum-exp.
pub struct AttentionOptions<'a, R: Runtime> {
    pub scale: f32,
    pub causal: bool,
    /// Additive logit bias `[B, M, N]`, on the same device as `q`. A bias
    /// shared across rows or batches is expanded by the caller. It is a
    /// constant input: the backward pass produces no gradient for it.
    pub bias: Option<&'a Tensor<R>>,
    pub dropout: Option<Dropout>,
}

impl<'a, R: Runtime> AttentionOptions<'a, R> {
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

    pub fn with_bias(mut self, bias: &'a Tensor<R>) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_dropout(mut self, dropout: Dropout) -> Self {
        self.dropout = Some(dropout);
        self
    }
}

impl<R: Runtime> Clone for AttentionOptions<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: Runtime> Copy for AttentionOptions<'_, R> {}

/// Memory-efficient attention: `softmax(scale * Q Kᵀ) V` computed with an
/// online softmax over key tiles, never materializing the `[M, N]` score
/// matrix.
///
/// This is a PRIMITIVE op (the fused kernel IS the algorithm). Each backend
/// provides its own implementation; all of them produce the same log-sum-exp
/// so a forward on one backend can be paired with a backward on another.
///
/// # Layout contract
///
/// - `q`: `[B, M, D]` queries (contiguous, F32)
/// - `k`: `[B, N, D]` keys (contiguous, F32)
/// - `v`: `[B, N, Dv]` values (contiguous, F32)
/// - Output: `[B, M, Dv]`
/// - Logsumexp: `[B, M]`, `ln Σ_n exp(scale * q·k_n + bias_n)` per query row
///
/// # Scale
///
/// `scale` multiplies every raw score before the softmax. It is always
/// explicit: use [`default_scale`] for `1/sqrt(D)` or `1.0` for unscaled
/// scores. The backward pass must be given the same value.
///
/// # Causal
///
/// With `causal`, query row `i` only attends to key rows `j <= i`
/// (top-left aligned). Key tiles that are fully masked for a query block are
/// skipped without touching memory.
///
/// # Bias and dropout
///
/// The `_with` entry points take [`AttentionOptions`]. A bias is added to
/// the scaled scores before the softmax (and before the causal mask, which
/// still wins). Dropout zeroes each probability with chance `p` and scales
/// the survivors by `1 / (1 - p)`; the mask is a pure function of the seed
/// and the score index, so the same seed reproduces the same output on
/// every backend. The logsumexp never includes dropout.
///
/// # Empty keys
///
/// With `N == 0` every output row is zero and its logsumexp is `-inf`.
#[allow(clippy::too_many_arguments)]
pub trait FusedAttentionOps<R: Runtime> {
    /// Forward pass.
    ///
    /// Returns `(output, logsumexp)`; the logsumexp tensor is only produced
    /// when `compute_lse` is set (it is required for the backward pass).
    fn attention_fwd(
        &self,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        scale: f32,
        causal: bool,
        compute_lse: bool,
    ) -> Result<(Tensor<R>, Option<Tensor<R>>)> {
        let options = AttentionOptions::new(scale).with_causal(causal);
        self.attention_fwd_with(q, k, v, &options, compute_lse)
    }

    /// Forward pass with an optional bias and dropout.
    fn attention_fwd_with(
        &self,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        options: &AttentionOptions<'_, R>,
        compute_lse: bool,
    ) -> Result<(Tensor<R>, Option<Tensor<R>>)>;

    /// Backward pass.
    ///
    /// Recomputes softmax probabilities from the saved `lse` (`[B, M]`) as
    /// `p = exp(logit - lse)`, then in two phases:
    ///
    /// 1. per query row: `dV += p * dO` and `delta = Σ_n p * (dO·v_n)`
    /// 2. per (query, key) pair: `ds = p * (dO·v - delta)`,
    ///    `dQ += scale * ds * k`, `dK += scale * ds * q`
    ///
    /// Returns `(dq, dk, dv)` with the shapes of `q`, `k`, `v`.
    /// `grad_output` must have the output's shape `[B, M, Dv]`.
    fn attention_bwd(
        &self,
        grad_output: &Tensor<R>,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        lse: &Tensor<R>,
        scale: f32,
        causal: bool,
    ) -> Result<(Tensor<R>, Tensor<R>, Tensor<R>)> {
        let options = AttentionOptions::new(scale).with_causal(causal);
        self.attention_bwd_with(grad_output, q, k, v, lse, &options)
    }

    /// Backward pass matching [`Self::attention_fwd_with`].
    ///
    /// With dropout factor `z` the recomputed terms become `dV += p z dO`,
    /// `delta = Σ_n p z (dO·v_n)` and `ds = p (z dO·v - delta)`.
    fn attention_bwd_with(
        &self,
        grad_output: &Tensor<R>,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        lse: &Tensor<R>,
        options: &AttentionOptions<'_, R>,
    ) -> Result<(Tensor<R>, Tensor<R>, Tensor<R>)>;
}
