//! CUDA block-sparse primitives: SpMM and row-restricted softmax

use cudarc::driver::PushKernelArg;
use cudarc::driver::safe::{CudaSlice, LaunchConfig};

use crate::error::{Error, Result};
use crate::ops::cuda::check_device_len;
use crate::ops::cuda::kernels::{self, KernelModule};
use crate::ops::traits::SparseAttentionOps;
use crate::ops::validate::{SpmmDims, validate_sparse_pair, validate_sparse_values, validate_spmm};
use crate::runtime::cuda::{CudaClient, CudaRuntime};
use crate::sparse::CsrPattern;
use crate::tensor::Tensor;

/// Threads per row (one warp).
const WARP: u32 = 32;

/// CSR arrays staged on the device for one call.
pub struct DevicePattern {
    row_offsets: CudaSlice<u32>,
    column_indices: CudaSlice<u32>,
    row_indices: CudaSlice<u32>,
}

impl DevicePattern {
    pub fn upload(client: &CudaClient, pattern: &CsrPattern) -> Result<Self> {
        let copy = |data: &[u32], what: &str| -> Result<CudaSlice<u32>> {
            // the driver rejects empty copies
            let data = if data.is_empty() { &[0u32][..] } else { data };
            client.stream().memcpy_stod(data).map_err(|e| Error::KernelError {
                reason: format!("upload of CSR {what} failed: {:?}", e),
            })
        };
        Ok(Self {
            row_offsets: copy(pattern.row_offsets(), "row_offsets")?,
            column_indices: copy(pattern.column_indices(), "column_indices")?,
            row_indices: copy(pattern.row_indices(), "row_indices")?,
        })
    }

    /// Check that these arrays are large enough for `pattern`.
    fn check(&self, pattern: &CsrPattern) -> Result<()> {
        check_device_len("row_offsets", self.row_offsets.len(), pattern.rows() + 1)?;
        check_device_len("column_indices", self.column_indices.len(), pattern.nnz())?;
        check_device_len("row_indices", self.row_indices.len(), pattern.rows())
    }
}

/// `output[b, i, :] = Σ_{l in row i} values[vb, l] * dense[b, col[l], :]`.
pub fn launch_sparse_dense_matmul(
    client: &CudaClient,
    pattern: &CsrPattern,
    device_pattern: &DevicePattern,
    dims: &SpmmDims,
    values: &CudaSlice<f32>,
    dense: &CudaSlice<f32>,
    output: &mut CudaSlice<f32>,
) -> Result<()> {
    dims.check_pattern(pattern)?;
    device_pattern.check(pattern)?;
    check_device_len("values", values.len(), dims.value_batch * pattern.nnz())?;
    check_device_len("dense", dense.len(), dims.batch * dims.cols * dims.n)?;
    check_device_len("output", output.len(), dims.batch * dims.rows * dims.n)?;
    if dims.batch == 0 || dims.rows == 0 || dims.n == 0 {
        return Ok(());
    }
    let func = kernels::function(client, KernelModule::Sparse, "sparse_dense_matmul")?;
    let cfg = LaunchConfig {
        grid_dim: (dims.rows as u32, (dims.n as u32).div_ceil(WARP), dims.batch as u32),
        block_dim: (WARP, 1, 1),
        shared_mem_bytes: 0,
    };
    log::debug!("memattn: spmm grid={:?} block={:?}", cfg.grid_dim, cfg.block_dim);

    let rows = dims.rows as i32;
    let cols = dims.cols as i32;
    let nnz = pattern.nnz() as i32;
    let n = dims.n as i32;
    let shared_values = (dims.value_batch == 1) as i32;

    unsafe {
        let mut builder = client.stream().launch_builder(&func);
        builder.arg(values);
        builder.arg(&device_pattern.row_offsets);
        builder.arg(&device_pattern.column_indices);
        builder.arg(&device_pattern.row_indices);
        builder.arg(dense);
        builder.arg(output);
        builder.arg(&rows);
        builder.arg(&cols);
        builder.arg(&nnz);
        builder.arg(&n);
        builder.arg(&shared_values);
        builder.launch(cfg).map_err(|e| Error::KernelError {
            reason: format!("sparse_dense_matmul launch failed: {:?}", e),
        })?;
    }
    Ok(())
}

fn row_config(pattern: &CsrPattern, batch: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (pattern.rows() as u32, batch as u32, 1),
        block_dim: (WARP, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Softmax over each row's entries of a `[batch, nnz]` value array.
pub fn launch_sparse_softmax_fwd(
    client: &CudaClient,
    pattern: &CsrPattern,
    device_pattern: &DevicePattern,
    batch: usize,
    values: &CudaSlice<f32>,
    output: &mut CudaSlice<f32>,
) -> Result<()> {
    pattern.check_batch(batch)?;
    device_pattern.check(pattern)?;
    check_device_len("values", values.len(), batch * pattern.nnz())?;
    check_device_len("output", output.len(), batch * pattern.nnz())?;
    if batch == 0 || pattern.rows() == 0 || pattern.nnz() == 0 {
        return Ok(());
    }
    let func = kernels::function(client, KernelModule::Sparse, "sparse_softmax_fwd")?;
    let cfg = row_config(pattern, batch);
    let nnz = pattern.nnz() as i32;

    unsafe {
        let mut builder = client.stream().launch_builder(&func);
        builder.arg(values);
        builder.arg(&device_pattern.row_offsets);
        builder.arg(&device_pattern.row_indices);
        builder.arg(output);
        builder.arg(&nnz);
        builder.launch(cfg).map_err(|e| Error::KernelError {
            reason: format!("sparse_softmax_fwd launch failed: {:?}", e),
        })?;
    }
    Ok(())
}

/// `grad_input = y * (dy - Σ_row y * dy)`.
pub fn launch_sparse_softmax_bwd(
    client: &CudaClient,
    pattern: &CsrPattern,
    device_pattern: &DevicePattern,
    batch: usize,
    output: &CudaSlice<f32>,
    grad_output: &CudaSlice<f32>,
    grad_input: &mut CudaSlice<f32>,
) -> Result<()> {
    pattern.check_batch(batch)?;
    device_pattern.check(pattern)?;
    check_device_len("output", output.len(), batch * pattern.nnz())?;
    check_device_len("grad_output", grad_output.len(), batch * pattern.nnz())?;
    check_device_len("grad_input", grad_input.len(), batch * pattern.nnz())?;
    if batch == 0 || pattern.rows() == 0 || pattern.nnz() == 0 {
        return Ok(());
    }
    let func = kernels::function(client, KernelModule::Sparse, "sparse_softmax_bwd")?;
    let cfg = row_config(pattern, batch);
    let nnz = pattern.nnz() as i32;

    unsafe {
        let mut builder = client.stream().launch_builder(&func);
        builder.arg(output);
        builder.arg(grad_output);
        builder.arg(&device_pattern.row_offsets);
        builder.arg(&device_pattern.row_indices);
        builder.arg(grad_input);
        builder.arg(&nnz);
        builder.launch(cfg).map_err(|e| Error::KernelError {
            reason: format!("sparse_softmax_bwd launch failed: {:?}", e),
        })?;
    }
    Ok(())
}

impl SparseAttentionOps<CudaRuntime> for CudaClient {
    fn sparse_dense_matmul(
        &self,
        pattern: &CsrPattern,
        values: &Tensor<CudaRuntime>,
        dense: &Tensor<CudaRuntime>,
    ) -> Result<Tensor<CudaRuntime>> {
        let dims = validate_spmm(pattern, values, dense)?;
        let device_pattern = DevicePattern::upload(self, pattern)?;
        let len = dims.batch * dims.rows * dims.n;
        let mut output = self.alloc_zeros(len)?;
        launch_sparse_dense_matmul(
            self,
            pattern,
            &device_pattern,
            &dims,
            values.storage().as_f32()?,
            dense.storage().as_f32()?,
            &mut output,
        )?;
        self.synchronize("sparse_dense_matmul")?;
        self.wrap(output, len, &[dims.batch, dims.rows, dims.n])
    }

    fn sparse_softmax_fwd(
        &self,
        pattern: &CsrPattern,
        values: &Tensor<CudaRuntime>,
    ) -> Result<Tensor<CudaRuntime>> {
        let batch = validate_sparse_values(pattern, values, "values")?;
        let device_pattern = DevicePattern::upload(self, pattern)?;
        let len = batch * pattern.nnz();
        let mut output = self.alloc_zeros(len)?;
        launch_sparse_softmax_fwd(
            self,
            pattern,
            &device_pattern,
            batch,
            values.storage().as_f32()?,
            &mut output,
        )?;
        self.synchronize("sparse_softmax_fwd")?;
        self.wrap(output, len, &[batch, pattern.nnz()])
    }

    fn sparse_softmax_bwd(
        &self,
        pattern: &CsrPattern,
        output: &Tensor<CudaRuntime>,
        grad_output: &Tensor<CudaRuntime>,
    ) -> Result<Tensor<CudaRuntime>> {
        let batch = validate_sparse_pair(pattern, output, grad_output)?;
        let device_pattern = DevicePattern::upload(self, pattern)?;
        let len = batch * pattern.nnz();
        let mut grad_input = self.alloc_zeros(len)?;
        launch_sparse_softmax_bwd(
            self,
            pattern,
            &device_pattern,
            batch,
            output.storage().as_f32()?,
            grad_output.storage().as_f32()?,
            &mut grad_input,
        )?;
        self.synchronize("sparse_softmax_bwd")?;
        self.wrap(grad_input, len, &[batch, pattern.nnz()])
    }
}
