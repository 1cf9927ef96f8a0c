use candle_core::{DType, Device};
use tracing::info;
use tracing::warn;

use crate::error::CoreResult;

/// Selects the device a training run is placed on.
///
/// The returned device is threaded explicitly through every constructor;
/// nothing in the workspace moves itself onto an accelerator. With the
/// `cuda` feature and `prefer_gpu`, CUDA device `cuda_device_id` is tried
/// first, then Metal, then CPU.
pub fn select_device(prefer_gpu: bool, #[allow(unused_variables)] cuda_device_id: usize) -> CoreResult<Device> {
    #[cfg(feature = "cuda")]
    if prefer_gpu {
        match Device::new_cuda(cuda_device_id) {
            Ok(dev) => {
                info!(cuda_device_id, "Training on CUDA device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "CUDA unavailable, training on CPU");
            }
        }
    }

    #[cfg(feature = "metal")]
    if prefer_gpu {
        match Device::new_metal(0) {
            Ok(dev) => {
                info!("Training on Metal device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "Metal unavailable, training on CPU");
            }
        }
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    if prefer_gpu {
        warn!(
            "--gpu has no effect: promptkd was built without GPU support. \
             Rebuild with `cargo install --path crates/promptkd-cli --features cuda`."
        );
    }
    info!("Training on CPU");
    Ok(Device::Cpu)
}

/// Reduced-precision storage dtype for frozen weights on `device`.
///
/// | Device | dtype |
/// |--------|-------|
/// | CUDA   | BF16  |
/// | Metal  | F16   |
/// | CPU    | F32 (BF16 matmuls are not supported on CPU) |
pub fn mixed_precision_dtype(device: &Device) -> DType {
    match device {
        Device::Cuda(_) => DType::BF16,
        Device::Metal(_) => DType::F16,
        Device::Cpu => DType::F32,
    }
}

/// Returns a human-readable description of a device.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}
