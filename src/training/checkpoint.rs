/// Model snapshots with safetensors
///
/// The snapshot file is overwritten every epoch, so only the most recent
/// weights survive. A JSON sidecar next to it records where they came from.
use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

/// Snapshot metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Completed epochs
    pub epoch: usize,
    /// Learning rate used during the epoch
    pub lr: f64,
    pub train_loss: Option<f64>,
    pub valid_loss: Option<f64>,
}

/// Sidecar path for a snapshot: `model.safetensors` -> `model.json`
pub fn metadata_path<P: AsRef<Path>>(weights_path: P) -> PathBuf {
    weights_path.as_ref().with_extension("json")
}

/// Save all variables of `varmap` and the metadata sidecar
pub fn save_checkpoint<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    metadata: &CheckpointMetadata,
) -> crate::Result<()> {
    let path = path.as_ref();
    varmap.save(path)?;

    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(metadata_path(path), json)?;

    log::debug!("Saved snapshot for epoch {} to {:?}", metadata.epoch, path);
    Ok(())
}

/// Read the metadata sidecar of a snapshot
pub fn load_metadata<P: AsRef<Path>>(weights_path: P) -> crate::Result<CheckpointMetadata> {
    let data = std::fs::read(metadata_path(weights_path))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Restore variables of `varmap` from a snapshot
///
/// Every variable in `varmap` must be present in the file.
pub fn load_checkpoint<P: AsRef<Path>>(varmap: &mut VarMap, path: P) -> crate::Result<()> {
    varmap.load(path)?;
    Ok(())
}

/// Sorted tensor names stored in a snapshot
pub fn tensor_names<P: AsRef<Path>>(path: P) -> crate::Result<Vec<String>> {
    let data = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&data)?;
    let mut names: Vec<String> = tensors.names().into_iter().cloned().collect();
    names.sort();
    Ok(names)
}
