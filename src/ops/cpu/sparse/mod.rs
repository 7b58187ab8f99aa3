//! CPU implementation of SparseAttentionOps

pub mod softmax;
pub mod spmm;

use crate::error::Result;
use crate::ops::traits::SparseAttentionOps;
use crate::ops::validate::{validate_sparse_pair, validate_sparse_values, validate_spmm};
use crate::runtime::cpu::{CpuClient, CpuRuntime, HostStorage};
use crate::sparse::CsrPattern;
use crate::tensor::Tensor;

pub use softmax::{sparse_softmax_backward, sparse_softmax_forward};
pub use spmm::sparse_dense_matmul;

impl SparseAttentionOps<CpuRuntime> for CpuClient {
    fn sparse_dense_matmul(
        &self,
        pattern: &CsrPattern,
        values: &Tensor<CpuRuntime>,
        dense: &Tensor<CpuRuntime>,
    ) -> Result<Tensor<CpuRuntime>> {
        let dims = validate_spmm(pattern, values, dense)?;
        let (values, dense) = (values.as_f32_slice()?, dense.as_f32_slice()?);

        let mut output = vec![0.0f32; dims.batch * dims.rows * dims.n];
        self.install(|| sparse_dense_matmul(pattern, &dims, values, dense, &mut output))?;
        log::debug!(
            "memattn: cpu spmm B={} rows={} cols={} nnz={} N={}",
            dims.batch,
            dims.rows,
            dims.cols,
            pattern.nnz(),
            dims.n
        );

        Tensor::from_storage(
            HostStorage::F32(output),
            &[dims.batch, dims.rows, dims.n],
            self.device().clone(),
        )
    }

    fn sparse_softmax_fwd(
        &self,
        pattern: &CsrPattern,
        values: &Tensor<CpuRuntime>,
    ) -> Result<Tensor<CpuRuntime>> {
        let batch = validate_sparse_values(pattern, values, "values")?;
        let values = values.as_f32_slice()?;

        let mut output = vec![0.0f32; values.len()];
        self.install(|| sparse_softmax_forward(pattern, batch, values, &mut output))?;

        Tensor::from_storage(
            HostStorage::F32(output),
            &[batch, pattern.nnz()],
            self.device().clone(),
        )
    }

    fn sparse_softmax_bwd(
        &self,
        pattern: &CsrPattern,
        output: &Tensor<CpuRuntime>,
        grad_output: &Tensor<CpuRuntime>,
    ) -> Result<Tensor<CpuRuntime>> {
        let batch = validate_sparse_pair(pattern, output, grad_output)?;
        let (y, dy) = (output.as_f32_slice()?, grad_output.as_f32_slice()?);

        let mut grad_input = vec![0.0f32; y.len()];
        self.install(|| sparse_softmax_backward(pattern, batch, y, dy, &mut grad_input))?;

        Tensor::from_storage(
            HostStorage::F32(grad_input),
            &[batch, pattern.nnz()],
            self.device().clone(),
        )
    }
}
