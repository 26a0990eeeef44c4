/// Data loading for image classification
///
/// Download, splitting and augmentation happen outside this crate; loaders
/// here only batch and shuffle already prepared splits.
pub mod numpy_dataset;

pub use numpy_dataset::{DatasetMetadata, NpyImageDataset};

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::MixerError;

/// Generic data loader trait
pub trait BatchDataLoader {
    /// Get next batch of (images [B, C, H, W] f32, labels [B] u32)
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;

    /// Get total number of samples
    fn num_samples(&self) -> usize;
}

/// In-memory loader over an image tensor and its labels
pub struct TensorDataLoader {
    images: Tensor,
    labels: Tensor,
    batch_size: usize,
    current_idx: usize,
    indices: Vec<u32>,
    shuffle: bool,
    rng: StdRng,
}

impl TensorDataLoader {
    /// Create new data loader
    ///
    /// `images` is [N, C, H, W], `labels` holds N class indices. With
    /// `shuffle` the order is reshuffled from `seed` on every reset.
    pub fn new(
        images: Tensor,
        labels: Tensor,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> crate::Result<Self> {
        let (n, _, _, _) = images.dims4()?;
        let labels = labels.flatten_all()?.to_dtype(DType::U32)?;
        if labels.dim(0)? != n {
            return Err(MixerError::Data(format!(
                "{} images but {} labels",
                n,
                labels.dim(0)?
            )));
        }
        if batch_size == 0 {
            return Err(MixerError::Data("batch_size must be > 0".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut indices: Vec<u32> = (0..n as u32).collect();
        if shuffle {
            indices.shuffle(&mut rng);
        }

        Ok(Self {
            images,
            labels,
            batch_size,
            current_idx: 0,
            indices,
            shuffle,
            rng,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl BatchDataLoader for TensorDataLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        if self.current_idx >= self.indices.len() {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.current_idx..end_idx];
        let idx = Tensor::from_slice(batch_indices, batch_indices.len(), self.images.device())?;
        self.current_idx = end_idx;

        let images = self.images.index_select(&idx, 0)?.to_device(device)?;
        let labels = self.labels.index_select(&idx, 0)?.to_device(device)?;
        Ok(Some((images, labels)))
    }

    fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    fn num_samples(&self) -> usize {
        self.indices.len()
    }
}
