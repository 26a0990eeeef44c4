/// Patch embedding: image -> token sequence
use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::config::MixerConfig;

/// Splits an image into non-overlapping patches and projects each patch to
/// `hidden_size`.
///
/// The weight is stored in convolution layout `(hidden, C, p, p)`; the
/// projection is the same as a convolution with kernel = stride = p,
/// followed by flattening `(B, D, H/p, W/p) -> (B, H/p * W/p, D)` in
/// row-major patch order.
pub struct PatchEmbedder {
    weight: Tensor,
    bias: Tensor,
    in_channels: usize,
    img_height: usize,
    img_width: usize,
    patch_size: usize,
    hidden_size: usize,
}

impl PatchEmbedder {
    pub fn new(config: &MixerConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;

        let p = config.patch_size;
        let bound = 1. / (config.patch_dim() as f64).sqrt();
        let init = Init::Uniform { lo: -bound, up: bound };
        let weight = vb.get_with_hints(
            (config.hidden_size, config.in_channels, p, p),
            "weight",
            init,
        )?;
        let bias = vb.get_with_hints(config.hidden_size, "bias", init)?;

        Ok(Self {
            weight,
            bias,
            in_channels: config.in_channels,
            img_height: config.img_height,
            img_width: config.img_width,
            patch_size: p,
            hidden_size: config.hidden_size,
        })
    }

    /// Number of patches produced per image
    pub fn num_patches(&self) -> usize {
        (self.img_height / self.patch_size) * (self.img_width / self.patch_size)
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Image batch [batch, channels, height, width]
    ///
    /// # Returns
    /// Patch sequence [batch, num_patches, hidden_size] in the input dtype
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        if c != self.in_channels || h != self.img_height || w != self.img_width {
            candle_core::bail!(
                "patch embedder expects images of shape (_, {}, {}, {}), got {:?}",
                self.in_channels,
                self.img_height,
                self.img_width,
                x.dims()
            );
        }

        let p = self.patch_size;
        let (gh, gw) = (h / p, w / p);

        // (B, C, gh, p, gw, p) -> (B, gh, gw, C, p, p) -> (B, gh*gw, C*p*p)
        let patches = x
            .reshape((b, c, gh, p, gw, p))?
            .permute((0, 2, 4, 1, 3, 5))?
            .contiguous()?
            .reshape((b, gh * gw, c * p * p))?;

        let dtype = x.dtype();
        let weight = self
            .weight
            .to_dtype(dtype)?
            .reshape((self.hidden_size, c * p * p))?;
        let bias = self.bias.to_dtype(dtype)?;

        patches.broadcast_matmul(&weight.t()?)?.broadcast_add(&bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> MixerConfig {
        MixerConfig {
            in_channels: 3,
            img_height: 8,
            img_width: 12,
            patch_size: 4,
            hidden_size: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_patch_sequence_length() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let embed = PatchEmbedder::new(&small_config(), vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8, 12), &device)?;
        let out = embed.forward(&x)?;

        assert_eq!(embed.num_patches(), 6);
        assert_eq!(out.dims(), &[2, 6, 16]);

        Ok(())
    }

    #[test]
    fn test_cifar_shape() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = MixerConfig {
            hidden_size: 32,
            ..Default::default()
        };
        let embed = PatchEmbedder::new(&config, vb)?;
        let x = Tensor::randn(0f32, 1.0, (4, 3, 32, 32), &device)?;

        assert_eq!(embed.forward(&x)?.dims(), &[4, 64, 32]);

        Ok(())
    }

    #[test]
    fn test_rejects_non_divisible_image() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = MixerConfig {
            img_height: 30,
            ..small_config()
        };
        assert!(matches!(
            PatchEmbedder::new(&config, vb),
            Err(crate::MixerError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_input_shape() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let embed = PatchEmbedder::new(&small_config(), vb)?;
        let x = Tensor::zeros((2, 3, 12, 8), DType::F32, &device)?;
        assert!(embed.forward(&x).is_err());

        Ok(())
    }

    #[test]
    fn test_matches_per_patch_projection() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = MixerConfig {
            in_channels: 1,
            img_height: 4,
            img_width: 4,
            patch_size: 2,
            hidden_size: 1,
            ..Default::default()
        };
        let embed = PatchEmbedder::new(&config, vb)?;

        // Sum-pooling projection: every patch maps to the sum of its pixels
        for var in varmap.all_vars() {
            let ones = var.ones_like()?;
            if var.dims().len() == 4 {
                var.set(&ones)?;
            } else {
                var.set(&ones.zeros_like()?)?;
            }
        }

        let x = Tensor::arange(0f32, 16.0, &device)?.reshape((1, 1, 4, 4))?;
        let out = embed.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;

        // Patches in row-major order: top-left, top-right, bottom-left, bottom-right
        assert_eq!(out, vec![10.0, 18.0, 42.0, 50.0]);

        Ok(())
    }
}
