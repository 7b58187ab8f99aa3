pub mod attention;
pub mod kernels;
pub mod sparse;

use crate::error::{Error, Result};

pub use attention::{DeviceParams, launch_attention_bwd, launch_attention_fwd};
pub use sparse::{
    DevicePattern, launch_sparse_dense_matmul, launch_sparse_softmax_bwd,
    launch_sparse_softmax_fwd,
};

/// Device buffers may be padded past their logical length; only a buffer
/// shorter than `expected` is rejected.
pub(crate) fn check_device_len(arg: &'static str, len: usize, expected: usize) -> Result<()> {
    if len < expected {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("device buffer has {len} elements, kernel reads {expected}"),
        });
    }
    Ok(())
}
