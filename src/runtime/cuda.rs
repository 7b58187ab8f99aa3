//! CUDA runtime: tensors in device memory, work queued on one stream.

use std::fmt;
use std::sync::Arc;

use cudarc::driver::safe::{CudaContext, CudaSlice, CudaStream};
use cudarc::driver::sys::CUdevice_attribute;
use half::{bf16, f16};

use super::{DType, Device, DeviceKind, Runtime, Storage};
use crate::config::{Capability, KernelConfig};
use crate::error::{Error, Result};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy)]
pub struct CudaRuntime;

impl Runtime for CudaRuntime {
    type Device = CudaDevice;
    type Storage = DeviceStorage;

    const KIND: DeviceKind = DeviceKind::Cuda;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CudaDevice {
    index: usize,
}

impl CudaDevice {
    pub fn new(index: usize) -> Self {
        Self { index }
    }
}

impl Device for CudaDevice {
    fn id(&self) -> usize {
        self.index
    }
}

/// Device buffer of one element type. Shared, never copied on clone.
#[derive(Clone)]
pub enum DeviceBuffer {
    F32(Arc<CudaSlice<f32>>),
    F16(Arc<CudaSlice<f16>>),
    BF16(Arc<CudaSlice<bf16>>),
}

/// Device element storage.
///
/// The driver rejects zero-byte allocations, so an empty tensor is backed by
/// a one-element buffer; `len` is the logical element count.
#[derive(Clone)]
pub struct DeviceStorage {
    buffer: DeviceBuffer,
    len: usize,
}

impl fmt::Debug for DeviceStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceStorage({}, len={})", self.dtype(), self.len)
    }
}

impl Storage for DeviceStorage {
    fn dtype(&self) -> DType {
        match self.buffer {
            DeviceBuffer::F32(_) => DType::F32,
            DeviceBuffer::F16(_) => DType::F16,
            DeviceBuffer::BF16(_) => DType::BF16,
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl DeviceStorage {
    pub(crate) fn new(buffer: DeviceBuffer, len: usize) -> Self {
        Self { buffer, len }
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn as_f32(&self) -> Result<&CudaSlice<f32>> {
        match &self.buffer {
            DeviceBuffer::F32(s) => Ok(s),
            _ => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: self.dtype(),
            }),
        }
    }
}

/// True when the driver loads and reports at least one device.
pub fn is_cuda_available() -> bool {
    // the dynamically loaded driver panics when libcuda is missing
    std::panic::catch_unwind(CudaContext::device_count)
        .ok()
        .and_then(|r| r.ok())
        .is_some_and(|n| n > 0)
}

/// Owns a context and stream on one device.
#[derive(Clone)]
pub struct CudaClient {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    device: CudaDevice,
    compute_capability: (u32, u32),
    config: KernelConfig,
}

impl fmt::Debug for CudaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaClient")
            .field("device", &self.device)
            .field("compute_capability", &self.compute_capability)
            .field("config", &self.config)
            .finish()
    }
}

impl CudaClient {
    pub fn new(device: CudaDevice) -> Result<Self> {
        Self::with_config(device, KernelConfig::default())
    }

    pub fn with_config(device: CudaDevice, config: KernelConfig) -> Result<Self> {
        config.validate()?;
        let context = CudaContext::new(device.index).map_err(|e| Error::KernelError {
            reason: format!("failed to create CUDA context for device {}: {:?}", device.index, e),
        })?;
        let stream = context.default_stream();

        let attr = |a: CUdevice_attribute, what: &str| -> Result<u32> {
            context.attribute(a).map(|v| v as u32).map_err(|e| Error::KernelError {
                reason: format!("failed to query {what}: {:?}", e),
            })
        };
        let major = attr(
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
            "compute capability major",
        )?;
        let minor = attr(
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
            "compute capability minor",
        )?;
        log::info!(
            "memattn: CUDA device {} ready (sm_{}{})",
            device.index,
            major,
            minor
        );

        Ok(Self {
            context,
            stream,
            device,
            compute_capability: (major, minor),
            config,
        })
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    pub fn device(&self) -> &CudaDevice {
        &self.device
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn compute_capability(&self) -> (u32, u32) {
        self.compute_capability
    }

    pub fn capability(&self) -> Capability {
        let (major, minor) = self.compute_capability;
        Capability::cuda(major, minor)
    }

    /// Copy host data into a new contiguous device tensor.
    pub fn upload(&self, data: &[f32], shape: &[usize]) -> Result<Tensor<CudaRuntime>> {
        let slice = self.stage(data)?;
        self.wrap(slice, data.len(), shape)
    }

    /// Copy a device tensor back to the host, in storage order.
    pub fn download(&self, tensor: &Tensor<CudaRuntime>) -> Result<Vec<f32>> {
        let slice = tensor.storage().as_f32()?;
        let mut host = self.stream.memcpy_dtov(slice).map_err(|e| Error::KernelError {
            reason: format!("device to host copy of {} floats failed: {:?}", slice.len(), e),
        })?;
        host.truncate(tensor.storage().len());
        Ok(host)
    }

    /// Stage a host slice in a new device buffer.
    pub(crate) fn stage(&self, data: &[f32]) -> Result<CudaSlice<f32>> {
        if data.is_empty() {
            return self.alloc_zeros(0);
        }
        self.stream.memcpy_stod(data).map_err(|e| Error::KernelError {
            reason: format!("host to device copy of {} floats failed: {:?}", data.len(), e),
        })
    }

    /// Copy the first `dst.len()` floats of `src` into `dst`.
    pub(crate) fn copy_back(&self, src: &CudaSlice<f32>, dst: &mut [f32]) -> Result<()> {
        let host = self.stream.memcpy_dtov(src).map_err(|e| Error::KernelError {
            reason: format!("device to host copy of {} floats failed: {:?}", src.len(), e),
        })?;
        dst.copy_from_slice(&host[..dst.len()]);
        Ok(())
    }

    /// Zeroed device buffer holding at least `len` floats.
    pub(crate) fn alloc_zeros(&self, len: usize) -> Result<CudaSlice<f32>> {
        self.stream
            .alloc_zeros::<f32>(len.max(1))
            .map_err(|e| Error::KernelError {
                reason: format!("device allocation of {len} floats failed: {:?}", e),
            })
    }

    /// Wrap a buffer holding `len` logical floats as a contiguous tensor.
    pub(crate) fn wrap(
        &self,
        slice: CudaSlice<f32>,
        len: usize,
        shape: &[usize],
    ) -> Result<Tensor<CudaRuntime>> {
        let storage = DeviceStorage::new(DeviceBuffer::F32(Arc::new(slice)), len);
        Tensor::from_storage(storage, shape, self.device.clone())
    }

    pub(crate) fn synchronize(&self, what: &str) -> Result<()> {
        self.stream.synchronize().map_err(|e| Error::KernelError {
            reason: format!("{what} sync failed: {:?}", e),
        })
    }
}
