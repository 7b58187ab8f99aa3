//! Backend-independent argument checks.
//!
//! Every operation validates its operands here before any output is allocated
//! or any work is launched.

use crate::error::{Error, Result};
use crate::ops::traits::AttentionOptions;
use crate::runtime::{DType, Runtime};
use crate::sparse::CsrPattern;
use crate::tensor::Tensor;

/// Dimensions of a dense attention problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenseDims {
    pub batch: usize,
    /// Query rows (M)
    pub seq_q: usize,
    /// Key/value rows (N)
    pub seq_k: usize,
    /// Query/key feature dim (D)
    pub head_dim: usize,
    /// Value/output feature dim (Dv)
    pub value_dim: usize,
}

impl DenseDims {
    pub fn q_len(&self) -> usize {
        self.batch * self.seq_q * self.head_dim
    }

    pub fn k_len(&self) -> usize {
        self.batch * self.seq_k * self.head_dim
    }

    pub fn v_len(&self) -> usize {
        self.batch * self.seq_k * self.value_dim
    }

    pub fn out_len(&self) -> usize {
        self.batch * self.seq_q * self.value_dim
    }

    pub fn lse_len(&self) -> usize {
        self.batch * self.seq_q
    }

    /// Length of a full `[B, M, N]` score-shaped buffer (the additive bias).
    pub fn bias_len(&self) -> usize {
        self.batch * self.seq_q * self.seq_k
    }

    /// Flat index of score `(b, i, j)` in a `[B, M, N]` buffer.
    #[inline]
    pub fn score_index(&self, b: usize, i: usize, j: usize) -> usize {
        (b * self.seq_q + i) * self.seq_k + j
    }

    /// Largest per-row feature width the kernel has to hold.
    pub fn max_feature_dim(&self) -> usize {
        self.head_dim.max(self.value_dim)
    }

    /// Feature dims of zero leave nothing to attend over.
    pub fn check_feature_dims(&self) -> Result<()> {
        if self.head_dim == 0 || self.value_dim == 0 {
            return Err(Error::InvalidArgument {
                arg: "head_dim",
                reason: format!(
                    "feature dims must be non-zero (q.D={}, v.D={})",
                    self.head_dim, self.value_dim
                ),
            });
        }
        Ok(())
    }

    /// Check raw buffer lengths against these dimensions.
    pub fn check_slice(&self, arg: &'static str, len: usize, expected: usize) -> Result<()> {
        if len != expected {
            return Err(Error::InvalidArgument {
                arg,
                reason: format!("buffer has {len} elements, expected {expected} for {self:?}"),
            });
        }
        Ok(())
    }
}

/// Dimensions of a sparse x dense product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpmmDims {
    pub batch: usize,
    /// Batch of the value array: 1 (shared) or `batch`.
    pub value_batch: usize,
    pub rows: usize,
    pub cols: usize,
    /// Dense columns (N)
    pub n: usize,
}

impl SpmmDims {
    /// Check these dimensions against the structure they will be used with.
    pub fn check_pattern(&self, pattern: &CsrPattern) -> Result<()> {
        if self.rows != pattern.rows() || self.cols != pattern.cols() {
            return Err(Error::InvalidArgument {
                arg: "pattern",
                reason: format!(
                    "pattern is {}x{}, dims say {}x{}",
                    pattern.rows(),
                    pattern.cols(),
                    self.rows,
                    self.cols
                ),
            });
        }
        if self.value_batch != 1 && self.value_batch != self.batch {
            return Err(Error::InvalidArgument {
                arg: "values",
                reason: format!(
                    "value batch {} must be 1 or the dense batch {}",
                    self.value_batch, self.batch
                ),
            });
        }
        pattern.check_batch(self.batch)
    }
}

pub(crate) fn check_f32<R: Runtime>(t: &Tensor<R>) -> Result<()> {
    if t.dtype() != DType::F32 {
        return Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: t.dtype(),
        });
    }
    Ok(())
}

pub(crate) fn check_operand<R: Runtime>(
    t: &Tensor<R>,
    arg: &'static str,
    ndim: usize,
) -> Result<()> {
    if t.ndim() != ndim {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("expected {}D tensor, got {}D {:?}", ndim, t.ndim(), t.shape()),
        });
    }
    check_f32(t)?;
    if !t.is_contiguous() {
        return Err(Error::NotContiguous { arg });
    }
    Ok(())
}

pub(crate) fn check_same_device<R: Runtime>(
    reference: &Tensor<R>,
    t: &Tensor<R>,
    arg: &'static str,
) -> Result<()> {
    if reference.device() != t.device() {
        return Err(Error::DeviceMismatch {
            arg,
            reason: format!("{:?} vs {:?}", t.device(), reference.device()),
        });
    }
    Ok(())
}

pub(crate) fn check_scale(scale: f32) -> Result<()> {
    if !scale.is_finite() {
        return Err(Error::InvalidArgument {
            arg: "scale",
            reason: format!("scale must be finite, got {scale}"),
        });
    }
    Ok(())
}

/// Validate forward operands and extract the problem dimensions.
pub fn validate_qkv<R: Runtime>(
    q: &Tensor<R>,
    k: &Tensor<R>,
    v: &Tensor<R>,
    scale: f32,
) -> Result<DenseDims> {
    check_operand(q, "q", 3)?;
    check_operand(k, "k", 3)?;
    check_operand(v, "v", 3)?;
    check_same_device(q, k, "k")?;
    check_same_device(q, v, "v")?;
    check_scale(scale)?;

    let (qs, ks, vs) = (q.shape(), k.shape(), v.shape());
    if ks[0] != qs[0] || vs[0] != qs[0] {
        return Err(Error::InvalidArgument {
            arg: "batch_size",
            reason: format!(
                "batch mismatch: q.B={}, k.B={}, v.B={}",
                qs[0], ks[0], vs[0]
            ),
        });
    }
    if ks[2] != qs[2] {
        return Err(Error::ShapeMismatch {
            arg: "k",
            expected: vec![ks[0], ks[1], qs[2]],
            got: ks.to_vec(),
        });
    }
    if vs[1] != ks[1] {
        return Err(Error::InvalidArgument {
            arg: "v",
            reason: format!("k seq_len={} != v seq_len={}", ks[1], vs[1]),
        });
    }
    let dims = DenseDims {
        batch: qs[0],
        seq_q: qs[1],
        seq_k: ks[1],
        head_dim: qs[2],
        value_dim: vs[2],
    };
    dims.check_feature_dims()?;
    Ok(dims)
}

/// Validate the optional bias (`[B, M, N]`, same device as `q`) and dropout.
pub fn validate_options<R: Runtime>(
    options: &AttentionOptions<'_, R>,
    q: &Tensor<R>,
    dims: &DenseDims,
) -> Result<()> {
    if let Some(bias) = options.bias {
        check_operand(bias, "bias", 3)?;
        check_same_device(q, bias, "bias")?;
        let expected = [dims.batch, dims.seq_q, dims.seq_k];
        if bias.shape() != expected {
            return Err(Error::ShapeMismatch {
                arg: "bias",
                expected: expected.to_vec(),
                got: bias.shape().to_vec(),
            });
        }
    }
    if let Some(dropout) = &options.dropout {
        dropout.validate()?;
    }
    Ok(())
}

/// Validate backward operands; `grad_output` must match the forward output
/// shape exactly and `lse` must be `[B, M]`.
pub fn validate_bwd<R: Runtime>(
    grad_output: &Tensor<R>,
    q: &Tensor<R>,
    k: &Tensor<R>,
    v: &Tensor<R>,
    lse: &Tensor<R>,
    scale: f32,
) -> Result<DenseDims> {
    let dims = validate_qkv(q, k, v, scale)?;

    check_operand(grad_output, "grad_output", 3)?;
    check_same_device(q, grad_output, "grad_output")?;
    let expected = [dims.batch, dims.seq_q, dims.value_dim];
    if grad_output.shape() != expected {
        return Err(Error::ShapeMismatch {
            arg: "grad_output",
            expected: expected.to_vec(),
            got: grad_output.shape().to_vec(),
        });
    }

    check_operand(lse, "lse", 2)?;
    check_same_device(q, lse, "lse")?;
    let expected = [dims.batch, dims.seq_q];
    if lse.shape() != expected {
        return Err(Error::ShapeMismatch {
            arg: "lse",
            expected: expected.to_vec(),
            got: lse.shape().to_vec(),
        });
    }
    Ok(dims)
}

/// Validate a `[B, nnz]` value array against `pattern`; returns `B`.
pub fn validate_sparse_values<R: Runtime>(
    pattern: &CsrPattern,
    values: &Tensor<R>,
    arg: &'static str,
) -> Result<usize> {
    check_operand(values, arg, 2)?;
    let shape = values.shape();
    if shape[1] != pattern.nnz() {
        return Err(Error::ShapeMismatch {
            arg,
            expected: vec![shape[0], pattern.nnz()],
            got: shape.to_vec(),
        });
    }
    pattern.check_batch(shape[0])?;
    Ok(shape[0])
}

/// Validate a sparse softmax backward pair; returns `B`.
pub fn validate_sparse_pair<R: Runtime>(
    pattern: &CsrPattern,
    output: &Tensor<R>,
    grad_output: &Tensor<R>,
) -> Result<usize> {
    let batch = validate_sparse_values(pattern, output, "output")?;
    validate_sparse_values(pattern, grad_output, "grad_output")?;
    check_same_device(output, grad_output, "grad_output")?;
    if grad_output.shape() != output.shape() {
        return Err(Error::ShapeMismatch {
            arg: "grad_output",
            expected: output.shape().to_vec(),
            got: grad_output.shape().to_vec(),
        });
    }
    Ok(batch)
}

/// Validate sparse x dense operands.
pub fn validate_spmm<R: Runtime>(
    pattern: &CsrPattern,
    values: &Tensor<R>,
    dense: &Tensor<R>,
) -> Result<SpmmDims> {
    check_operand(dense, "dense", 3)?;
    check_operand(values, "values", 2)?;
    check_same_device(dense, values, "values")?;

    let ds = dense.shape();
    let batch = ds[0];
    if ds[1] != pattern.cols() {
        return Err(Error::ShapeMismatch {
            arg: "dense",
            expected: vec![batch, pattern.cols(), ds[2]],
            got: ds.to_vec(),
        });
    }
    let vs = values.shape();
    if vs[1] != pattern.nnz() || (vs[0] != 1 && vs[0] != batch) {
        return Err(Error::ShapeMismatch {
            arg: "values",
            expected: vec![batch, pattern.nnz()],
            got: vs.to_vec(),
        });
    }
    pattern.check_batch(batch)?;

    Ok(SpmmDims {
        batch,
        value_batch: vs[0],
        rows: pattern.rows(),
        cols: pattern.cols(),
        n: ds[2],
    })
}
