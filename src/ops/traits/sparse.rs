//! Block-sparse score/aggregate operation traits

use crate::error::Result;
use crate::runtime::Runtime;
use crate::sparse::CsrPattern;
use crate::tensor::Tensor;

/// Sparse attention primitives over a shared CSR row structure.
///
/// # Layout contract
///
/// - `pattern`: `rows x cols` structure, `nnz` entries
/// - `values`: `[Bv, nnz]` per-entry values in CSR order (contiguous, F32)
///
/// Every batch slice uses the same structure. When the batch is larger than
/// one, `nnz` must be a multiple of 4.
pub trait SparseAttentionOps<R: Runtime> {
    /// Sparse x dense product, batched.
    ///
    /// - `dense`: `[B, cols, N]`
    /// - `values`: `[B, nnz]`, or `[1, nnz]` to share one value array across
    ///   the batch
    /// - Output: `[B, rows, N]`, `out[b, i, :] = Σ_{l in row i} values[b, l] * dense[b, col[l], :]`
    fn sparse_dense_matmul(
        &self,
        pattern: &CsrPattern,
        values: &Tensor<R>,
        dense: &Tensor<R>,
    ) -> Result<Tensor<R>>;

    /// Softmax within each row's present entries. Absent entries do not take
    /// part in the normalization at all.
    ///
    /// - `values`: `[B, nnz]` scores
    /// - Output: `[B, nnz]` probabilities
    fn sparse_softmax_fwd(&self, pattern: &CsrPattern, values: &Tensor<R>) -> Result<Tensor<R>>;

    /// Softmax Jacobian-vector product restricted to each row's entries:
    /// `dx_i = y_i * (dy_i - Σ_j y_j * dy_j)`.
    ///
    /// - `output`: `[B, nnz]` forward probabilities `y`
    /// - `grad_output`: `[B, nnz]` upstream gradient `dy`
    /// - Output: `[B, nnz]`
    fn sparse_softmax_bwd(
        &self,
        pattern: &CsrPattern,
        output: &Tensor<R>,
        grad_output: &Tensor<R>,
    ) -> Result<Tensor<R>>;
}
