/// Weight loading from safetensors snapshots
use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use super::MixerModel;
use crate::MixerConfig;

/// Load model from safetensors file
///
/// # Arguments
/// * `config` - Model configuration the snapshot was trained with
/// * `weights_path` - Path to safetensors file
/// * `device` - Device to load model on
///
/// # Returns
/// Loaded MixerModel
pub fn load_model<P: AsRef<Path>>(
    config: MixerConfig,
    weights_path: P,
    device: &Device,
) -> crate::Result<MixerModel> {
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[weights_path.as_ref()], DType::F32, device)?
    };

    MixerModel::new(config, vb)
}
