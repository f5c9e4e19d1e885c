//! Compute device selection.

use candle_core::Device;

use crate::error::ConfigError;

/// Pick the compute device for a run.
///
/// Asking for CUDA on a build or host without it is a fatal configuration
/// error; there is no silent fallback to the CPU.
pub fn select_device(use_cuda: bool) -> Result<Device, ConfigError> {
    if !use_cuda {
        return Ok(Device::Cpu);
    }
    if !candle_core::utils::cuda_is_available() {
        return Err(ConfigError::AcceleratorUnavailable);
    }
    Device::new_cuda(0).map_err(|e| {
        tracing::error!(error = %e, "CUDA reported available but device 0 failed to open");
        ConfigError::AcceleratorUnavailable
    })
}
