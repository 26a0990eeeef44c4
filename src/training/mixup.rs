/// Batch mixing augmentation (Mixup / CutMix, one λ per batch)
///
/// Each image is paired with its mirror in the batch (`i <-> B-1-i`). Labels
/// become soft targets `λ·smooth(y) + (1-λ)·smooth(y_flipped)` whose rows sum
/// to 1. `smooth` puts `1 - ε + ε/K` on the label and `ε/K` elsewhere, and is
/// applied whether or not the batch gets mixed.
use candle_core::{DType, Device, Result, Tensor};
use rand::Rng;
use rand_distr::{Beta, Distribution};

use crate::MixerError;

/// Mixing configuration
#[derive(Debug, Clone)]
pub struct MixConfig {
    /// Beta(α, α) parameter for Mixup, 0 disables Mixup
    pub mixup_alpha: f64,
    /// Beta(α, α) parameter for CutMix, 0 disables CutMix
    pub cutmix_alpha: f64,
    /// Probability of mixing a given batch
    pub prob: f64,
    /// Probability of CutMix over Mixup when both are enabled
    pub switch_prob: f64,
    /// Label smoothing ε folded into the targets, 0 gives exact one-hot rows
    pub label_smoothing: f64,
    pub num_classes: usize,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            mixup_alpha: 1.0,
            cutmix_alpha: 1.0,
            prob: 0.0,
            switch_prob: 0.5,
            label_smoothing: 0.0,
            num_classes: 10,
        }
    }
}

/// Which augmentation was applied to a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixMode {
    None,
    Mixup,
    CutMix,
}

/// Augmented batch
#[derive(Debug, Clone)]
pub struct MixedBatch {
    pub images: Tensor,
    /// Soft targets [batch, num_classes], f32
    pub targets: Tensor,
    /// Weight of the original sample
    pub lam: f64,
    pub mode: MixMode,
}

/// Mixup / CutMix batch augmenter
pub struct BatchMixer {
    config: MixConfig,
    mixup: Option<Beta<f64>>,
    cutmix: Option<Beta<f64>>,
}

impl BatchMixer {
    pub fn new(config: MixConfig) -> crate::Result<Self> {
        if !(0.0..=1.0).contains(&config.prob) || !(0.0..=1.0).contains(&config.switch_prob) {
            return Err(MixerError::Config(format!(
                "mixing probabilities must be in [0, 1], got prob={} switch_prob={}",
                config.prob, config.switch_prob
            )));
        }
        if !(0.0..1.0).contains(&config.label_smoothing) {
            return Err(MixerError::Config(format!(
                "label_smoothing must be in [0, 1), got {}",
                config.label_smoothing
            )));
        }
        if config.num_classes == 0 {
            return Err(MixerError::Config("num_classes must be > 0".to_string()));
        }

        let beta = |alpha: f64| -> crate::Result<Option<Beta<f64>>> {
            if alpha < 0.0 {
                return Err(MixerError::Config(format!("mixing alpha must be >= 0, got {}", alpha)));
            }
            if alpha == 0.0 {
                return Ok(None);
            }
            Beta::new(alpha, alpha)
                .map(Some)
                .map_err(|e| MixerError::Config(format!("invalid mixing alpha {}: {}", alpha, e)))
        };

        let mixup = beta(config.mixup_alpha)?;
        let cutmix = beta(config.cutmix_alpha)?;

        Ok(Self {
            config,
            mixup,
            cutmix,
        })
    }

    pub fn config(&self) -> &MixConfig {
        &self.config
    }

    /// Draw λ and the augmentation for one batch
    fn sample_params<R: Rng>(&self, rng: &mut R) -> (f64, MixMode) {
        if self.config.prob <= 0.0 || rng.gen::<f64>() >= self.config.prob {
            return (1.0, MixMode::None);
        }

        match (&self.mixup, &self.cutmix) {
            (Some(mixup), Some(cutmix)) => {
                if rng.gen::<f64>() < self.config.switch_prob {
                    (cutmix.sample(rng), MixMode::CutMix)
                } else {
                    (mixup.sample(rng), MixMode::Mixup)
                }
            }
            (Some(mixup), None) => (mixup.sample(rng), MixMode::Mixup),
            (None, Some(cutmix)) => (cutmix.sample(rng), MixMode::CutMix),
            (None, None) => (1.0, MixMode::None),
        }
    }

    /// Mix a batch of images `[B, C, H, W]` and integer labels `[B]`
    pub fn apply<R: Rng>(&self, images: &Tensor, labels: &Tensor, rng: &mut R) -> Result<MixedBatch> {
        let (b, _, h, w) = images.dims4()?;
        let labels = labels.flatten_all()?.to_dtype(DType::U32)?;
        if labels.dim(0)? != b {
            candle_core::bail!("batch has {} images but {} labels", b, labels.dim(0)?);
        }

        let (mut lam, mode) = self.sample_params(rng);
        let targets_a = smoothed_one_hot(&labels, self.config.num_classes, self.config.label_smoothing)?;

        let images = match mode {
            MixMode::None => images.clone(),
            MixMode::Mixup => {
                let flipped = flip_batch(images)?;
                ((images * lam)? + (flipped * (1.0 - lam))?)?
            }
            MixMode::CutMix => {
                let (y0, y1, x0, x1) = rand_bbox(h, w, lam, rng);
                lam = 1.0 - ((y1 - y0) * (x1 - x0)) as f64 / (h * w) as f64;
                let mask = box_mask(h, w, (y0, y1, x0, x1), images.device())?.to_dtype(images.dtype())?;
                let keep = mask.affine(-1.0, 1.0)?;
                let flipped = flip_batch(images)?;
                (images.broadcast_mul(&keep)? + flipped.broadcast_mul(&mask)?)?
            }
        };

        let targets = if lam == 1.0 {
            targets_a
        } else {
            let targets_b = flip_batch(&targets_a)?;
            ((targets_a * lam)? + (targets_b * (1.0 - lam))?)?
        };

        Ok(MixedBatch {
            images,
            targets,
            lam,
            mode,
        })
    }
}

/// One-hot encode `[B]` integer labels into `[B, num_classes]` f32 rows
pub fn one_hot(labels: &Tensor, num_classes: usize) -> Result<Tensor> {
    smoothed_one_hot(labels, num_classes, 0.0)
}

/// One-hot rows with `smoothing` spread evenly over all classes
pub fn smoothed_one_hot(labels: &Tensor, num_classes: usize, smoothing: f64) -> Result<Tensor> {
    let device = labels.device().clone();
    let labels = labels.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    let off = (smoothing / num_classes as f64) as f32;
    let on = (1.0 - smoothing) as f32 + off;
    let mut data = vec![off; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        let label = label as usize;
        if label >= num_classes {
            candle_core::bail!("label {} out of range for {} classes", label, num_classes);
        }
        data[row * num_classes + label] = on;
    }
    Tensor::from_vec(data, (labels.len(), num_classes), &device)
}

/// Reverse the batch order along dim 0
fn flip_batch(x: &Tensor) -> Result<Tensor> {
    let b = x.dim(0)?;
    let idx: Vec<u32> = (0..b as u32).rev().collect();
    let idx = Tensor::from_vec(idx, b, x.device())?;
    x.index_select(&idx, 0)
}

/// Random box covering roughly `1 - lam` of an `h x w` image
///
/// Returns `(y0, y1, x0, x1)`, clipped to the image.
pub fn rand_bbox<R: Rng>(h: usize, w: usize, lam: f64, rng: &mut R) -> (usize, usize, usize, usize) {
    let ratio = (1.0 - lam).max(0.0).sqrt();
    let cut_h = (h as f64 * ratio) as i64;
    let cut_w = (w as f64 * ratio) as i64;

    let cy = rng.gen_range(0..h as i64);
    let cx = rng.gen_range(0..w as i64);

    let y0 = (cy - cut_h / 2).clamp(0, h as i64) as usize;
    let y1 = (cy + cut_h / 2).clamp(0, h as i64) as usize;
    let x0 = (cx - cut_w / 2).clamp(0, w as i64) as usize;
    let x1 = (cx + cut_w / 2).clamp(0, w as i64) as usize;
    (y0, y1, x0, x1)
}

/// `[1, 1, h, w]` mask with ones inside the box
fn box_mask(
    h: usize,
    w: usize,
    (y0, y1, x0, x1): (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let mut data = vec![0f32; h * w];
    for y in y0..y1 {
        data[y * w + x0..y * w + x1].fill(1.0);
    }
    Tensor::from_vec(data, (1, 1, h, w), device)
}
