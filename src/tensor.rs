//! Strided tensor view over backend storage.

use half::{bf16, f16};

use crate::error::{Error, Result};
use crate::runtime::cpu::{CpuDevice, CpuRuntime, HostStorage};
use crate::runtime::{DType, Runtime, Storage};

/// Row-major element strides for `shape`.
pub(crate) fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// N-dimensional tensor: storage plus shape and element strides.
#[derive(Debug, Clone)]
pub struct Tensor<R: Runtime> {
    storage: R::Storage,
    shape: Vec<usize>,
    strides: Vec<usize>,
    device: R::Device,
}

impl<R: Runtime> Tensor<R> {
    /// Wrap existing storage as a contiguous tensor.
    pub fn from_storage(storage: R::Storage, shape: &[usize], device: R::Device) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if storage.len() != numel {
            return Err(Error::InvalidArgument {
                arg: "shape",
                reason: format!(
                    "shape {:?} needs {} elements, storage has {}",
                    shape,
                    numel,
                    storage.len()
                ),
            });
        }
        Ok(Self {
            storage,
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            device,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> &R::Device {
        &self.device
    }

    pub fn storage(&self) -> &R::Storage {
        &self.storage
    }

    pub fn into_storage(self) -> R::Storage {
        self.storage
    }

    /// True when strides match the row-major layout of the shape.
    /// Size-1 dimensions do not constrain their stride.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for d in (0..self.shape.len()).rev() {
            if self.shape[d] != 1 && self.strides[d] != expected {
                return false;
            }
            expected *= self.shape[d];
        }
        true
    }

    /// Swap two dimensions without moving data.
    pub fn transpose(mut self, d0: usize, d1: usize) -> Result<Self> {
        let ndim = self.shape.len();
        if d0 >= ndim || d1 >= ndim {
            return Err(Error::InvalidArgument {
                arg: "dim",
                reason: format!("transpose({d0}, {d1}) out of range for {ndim}D tensor"),
            });
        }
        self.shape.swap(d0, d1);
        self.strides.swap(d0, d1);
        Ok(self)
    }
}

impl Tensor<CpuRuntime> {
    pub fn from_slice(data: &[f32], shape: &[usize], device: &CpuDevice) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "from_slice: {} elements for shape {:?}",
            data.len(),
            shape
        );
        Self {
            storage: HostStorage::F32(data.to_vec()),
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            device: device.clone(),
        }
    }

    /// Build a half-precision host tensor. Kernels reject it; it exists so
    /// callers can hand over framework storage as-is and get a dtype error.
    pub fn from_f16_slice(data: &[f16], shape: &[usize], device: &CpuDevice) -> Result<Self> {
        Self::from_storage(HostStorage::F16(data.to_vec()), shape, device.clone())
    }

    pub fn from_bf16_slice(data: &[bf16], shape: &[usize], device: &CpuDevice) -> Result<Self> {
        Self::from_storage(HostStorage::BF16(data.to_vec()), shape, device.clone())
    }

    pub fn zeros(shape: &[usize], dtype: DType, device: &CpuDevice) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            storage: HostStorage::zeros(numel, dtype),
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            device: device.clone(),
        }
    }

    /// F32 view of the storage, in storage order.
    pub fn as_f32_slice(&self) -> Result<&[f32]> {
        self.storage.as_f32()
    }

    /// Storage contents widened to f32, in storage order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.storage.to_f32_vec()
    }
}
