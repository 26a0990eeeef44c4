/// NumPy image dataset loader (.npy format)
///
/// A prepared split lives in one directory:
/// - `{split}_images.npy`: u8 [N, H, W, C]
/// - `{split}_labels.npy`: integer [N]
/// - `dataset.json`: class count and per-channel normalization
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use ndarray::{Array1, Array4};
use ndarray_npy::ReadNpyExt;
use serde::{Deserialize, Serialize};

use super::TensorDataLoader;
use crate::MixerError;

/// Metadata from dataset.json
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetMetadata {
    pub num_classes: usize,
    /// Per-channel mean of pixel values scaled to [0, 1]
    pub mean: Vec<f32>,
    /// Per-channel standard deviation of pixel values scaled to [0, 1]
    pub std: Vec<f32>,
    #[serde(default)]
    pub description: String,
}

/// Image split loaded from NumPy .npy files
pub struct NpyImageDataset {
    images: Array4<u8>, // [N, H, W, C]
    labels: Array1<i64>, // [N]
    metadata: DatasetMetadata,
}

impl NpyImageDataset {
    /// Load `split` from a directory containing .npy files and dataset.json
    pub fn from_directory<P: AsRef<Path>>(path: P, split: &str) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading {} split from: {:?}", split, dir);

        let images_path = dir.join(format!("{}_images.npy", split));
        let images = Array4::<u8>::read_npy(File::open(&images_path)?)
            .map_err(|e| MixerError::Data(format!("Failed to read {:?}: {}", images_path, e)))?;

        let labels_path = dir.join(format!("{}_labels.npy", split));
        let labels = Array1::<i64>::read_npy(File::open(&labels_path)?)
            .map_err(|e| MixerError::Data(format!("Failed to read {:?}: {}", labels_path, e)))?;

        let channels = images.shape()[3];
        let metadata_path = dir.join("dataset.json");
        let metadata: DatasetMetadata = if metadata_path.exists() {
            serde_json::from_reader(BufReader::new(File::open(&metadata_path)?))?
        } else {
            log::warn!("dataset.json not found, using identity normalization");
            DatasetMetadata {
                num_classes: labels.iter().copied().max().map_or(0, |m| m as usize + 1),
                mean: vec![0.0; channels],
                std: vec![1.0; channels],
                description: "Unknown".to_string(),
            }
        };

        let dataset = Self {
            images,
            labels,
            metadata,
        };
        dataset.validate()?;

        let (c, h, w) = dataset.image_shape();
        log::info!(
            "Dataset loaded: {} examples of {}x{}x{}, {} classes",
            dataset.len(),
            c,
            h,
            w,
            dataset.num_classes()
        );

        Ok(dataset)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.images.shape()[0] != self.labels.len() {
            return Err(MixerError::Data(format!(
                "Shape mismatch: {} images != {} labels",
                self.images.shape()[0],
                self.labels.len()
            )));
        }

        let channels = self.images.shape()[3];
        if self.metadata.mean.len() != channels || self.metadata.std.len() != channels {
            return Err(MixerError::Data(format!(
                "normalization has {}/{} entries for {} channels",
                self.metadata.mean.len(),
                self.metadata.std.len(),
                channels
            )));
        }
        if self.metadata.std.iter().any(|&s| s <= 0.0) {
            return Err(MixerError::Data("std entries must be > 0".to_string()));
        }

        let num_classes = self.metadata.num_classes as i64;
        if let Some(bad) = self.labels.iter().find(|&&l| l < 0 || l >= num_classes) {
            return Err(MixerError::Data(format!(
                "label {} out of range for {} classes",
                bad, num_classes
            )));
        }

        Ok(())
    }

    /// Get number of examples
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.metadata.num_classes
    }

    /// (channels, height, width)
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let s = self.images.shape();
        (s[3], s[1], s[2])
    }

    /// Get metadata
    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    /// Normalized images [N, C, H, W] f32 and labels [N] u32 on the CPU
    pub fn to_tensors(&self) -> crate::Result<(Tensor, Tensor)> {
        let device = Device::Cpu;
        let (n, h, w, c) = self.images.dim();

        let pixels: Vec<u8> = self.images.iter().copied().collect();
        let images = Tensor::from_vec(pixels, (n, h, w, c), &device)?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .permute((0, 3, 1, 2))?
            .contiguous()?;

        let mean = Tensor::from_slice(&self.metadata.mean, (1, c, 1, 1), &device)?;
        let std = Tensor::from_slice(&self.metadata.std, (1, c, 1, 1), &device)?;
        let images = images.broadcast_sub(&mean)?.broadcast_div(&std)?;

        let labels: Vec<u32> = self.labels.iter().map(|&l| l as u32).collect();
        let labels = Tensor::from_vec(labels, n, &device)?;

        Ok((images, labels))
    }

    /// Batch this split
    pub fn into_loader(self, batch_size: usize, shuffle: bool, seed: u64) -> crate::Result<TensorDataLoader> {
        let (images, labels) = self.to_tensors()?;
        TensorDataLoader::new(images, labels, batch_size, shuffle, seed)
    }
}
