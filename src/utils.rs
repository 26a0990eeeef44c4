/// Utility functions for the MLP-Mixer
use candle_core::{Device, Tensor};
use candle_nn::VarMap;

/// Calculate the number of parameters in a tensor
pub fn count_parameters(tensor: &Tensor) -> usize {
    tensor.dims().iter().product()
}

/// Total number of trainable parameters held by a VarMap
pub fn count_varmap_parameters(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|v| count_parameters(v.as_tensor()))
        .sum()
}

/// Accelerator if one is available, otherwise the CPU
///
/// `force_cpu` skips the accelerator lookup.
pub fn select_device(force_cpu: bool) -> candle_core::Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Device::new_cuda(0);
    }
    Ok(Device::Cpu)
}
