/// MLP-Mixer model implementation
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::config::MixerConfig;
use crate::layers::normalization::LAYER_NORM_EPS;
use crate::layers::{Activation, CastedLinear, ChannelMixing, LayerNorm, PatchEmbedder, TokenMixing};

pub mod loader;

pub use loader::load_model;

/// One mixer layer: token mixing followed by channel mixing
pub struct MixerLayer {
    mlp1: TokenMixing,
    mlp2: ChannelMixing,
}

impl MixerLayer {
    pub fn new(config: &MixerConfig, vb: VarBuilder) -> Result<Self> {
        let act = Activation::from_off_act(config.off_act);

        let mlp1 = TokenMixing::new(
            config.seq_len(),
            config.hidden_s,
            config.hidden_size,
            config.drop_p,
            act,
            vb.pp("mlp1"),
        )?;
        let mlp2 = ChannelMixing::new(
            config.hidden_size,
            config.hidden_c,
            config.drop_p,
            act,
            vb.pp("mlp2"),
        )?;

        Ok(Self { mlp1, mlp2 })
    }

    pub fn token_mixing(&self) -> &TokenMixing {
        &self.mlp1
    }

    pub fn channel_mixing(&self) -> &ChannelMixing {
        &self.mlp2
    }

    /// Token fc1, token fc2, channel fc1, channel fc2 weights
    pub fn weights(&self) -> [&Tensor; 4] {
        let [t1, t2] = self.mlp1.weights();
        let [c1, c2] = self.mlp2.weights();
        [t1, t2, c1, c2]
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.mlp1.forward_t(x, train)?;
        self.mlp2.forward_t(&out, train)
    }
}

/// Final norm, pooling and linear classifier
pub struct ClassifierHead {
    ln: LayerNorm,
    clf: CastedLinear,
    use_cls_token: bool,
}

impl ClassifierHead {
    pub fn new(config: &MixerConfig, ln: VarBuilder, clf: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln: LayerNorm::new(config.hidden_size, LAYER_NORM_EPS, ln)?,
            clf: CastedLinear::new(config.hidden_size, config.num_classes, true, clf)?,
            use_cls_token: config.is_cls_token,
        })
    }

    pub fn weight(&self) -> &Tensor {
        self.clf.weight()
    }

    /// `[batch, seq_len, hidden]` -> raw logits `[batch, num_classes]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.ln.forward(x)?;
        let pooled = if self.use_cls_token {
            out.narrow(1, 0, 1)?.squeeze(1)?
        } else {
            out.mean(1)?
        };
        self.clf.forward(&pooled)
    }
}

/// Main MLP-Mixer model
///
/// PatchEmbedder -> (optional class token) -> N mixer layers -> ClassifierHead
pub struct MixerModel {
    config: MixerConfig,
    patch_emb: PatchEmbedder,
    cls_token: Option<Tensor>,
    mixer_layers: Vec<MixerLayer>,
    head: ClassifierHead,
    device: Device,
}

impl MixerModel {
    /// Create new MixerModel
    ///
    /// Parameter names follow `patch_emb.*`, `cls_token`,
    /// `mixer_layers.{i}.mlp{1,2}.{ln,fc1,fc2}.*`, `ln.*`, `clf.*`.
    pub fn new(config: MixerConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;

        let device = vb.device().clone();

        let patch_emb = PatchEmbedder::new(&config, vb.pp("patch_emb"))?;

        let cls_token = if config.is_cls_token {
            Some(vb.get_with_hints(
                (1, 1, config.hidden_size),
                "cls_token",
                Init::Randn { mean: 0.0, stdev: 1.0 },
            )?)
        } else {
            None
        };

        let mut mixer_layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            mixer_layers.push(MixerLayer::new(&config, vb.pp(format!("mixer_layers.{}", i)))?);
        }

        let head = ClassifierHead::new(&config, vb.pp("ln"), vb.pp("clf"))?;

        log::debug!(
            "Built MLP-Mixer: {} layers, seq_len={}, hidden={}, hidden_s={}, hidden_c={}",
            config.num_layers,
            config.seq_len(),
            config.hidden_size,
            config.hidden_s,
            config.hidden_c
        );

        Ok(Self {
            config,
            patch_emb,
            cls_token,
            mixer_layers,
            head,
            device,
        })
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_patches(&self) -> usize {
        self.patch_emb.num_patches()
    }

    /// Number of patches plus the class token, if any
    pub fn seq_len(&self) -> usize {
        self.num_patches() + usize::from(self.cls_token.is_some())
    }

    pub fn layers(&self) -> &[MixerLayer] {
        &self.mixer_layers
    }

    /// Patch embedding plus the class token, `[batch, seq_len, hidden]`
    pub fn embed(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.patch_emb.forward(x)?;
        match &self.cls_token {
            Some(cls) => {
                let (b, _, d) = out.dims3()?;
                let cls = cls.to_dtype(out.dtype())?.broadcast_as((b, 1, d))?.contiguous()?;
                Tensor::cat(&[&cls, &out], 1)
            }
            None => Ok(out),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Image batch [batch, channels, height, width]; its dtype is
    ///   the compute dtype
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Logits [batch, num_classes] in the compute dtype
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = self.embed(x)?;
        for layer in &self.mixer_layers {
            out = layer.forward_t(&out, train)?;
        }
        self.head.forward(&out)
    }

    /// Structured L1/L2 penalty
    ///
    /// L2 norm of every row of every mixing weight and the classifier
    /// weight, concatenated, then the L1 norm of that vector.
    pub fn l1l2_reg(&self) -> Result<Tensor> {
        let mut row_norms = Vec::with_capacity(4 * self.mixer_layers.len() + 1);
        for layer in &self.mixer_layers {
            for w in layer.weights() {
                row_norms.push(w.to_dtype(DType::F32)?.sqr()?.sum(D::Minus1)?.sqrt()?);
            }
        }
        row_norms.push(self.head.weight().to_dtype(DType::F32)?.sqr()?.sum(D::Minus1)?.sqrt()?);

        Tensor::cat(&row_norms, 0)?.abs()?.sum_all()
    }

    /// Sum of the hidden widths of every token and channel MLP
    pub fn friction(&self) -> f64 {
        self.mixer_layers
            .iter()
            .map(|l| (l.token_mixing().width() + l.channel_mixing().width()) as f64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> MixerConfig {
        MixerConfig {
            img_height: 8,
            img_width: 8,
            patch_size: 4,
            hidden_size: 16,
            hidden_s: 8,
            hidden_c: 32,
            num_layers: 2,
            num_classes: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_model_logits_shape() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let model = MixerModel::new(tiny_config(), vb)?;
        let x = Tensor::randn(0f32, 1.0, (3, 3, 8, 8), &device)?;

        assert_eq!(model.embed(&x)?.dims(), &[3, 4, 16]);
        assert_eq!(model.forward_t(&x, true)?.dims(), &[3, 5]);

        Ok(())
    }

    #[test]
    fn test_class_token_extends_sequence() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = MixerConfig {
            is_cls_token: true,
            ..tiny_config()
        };
        let model = MixerModel::new(config, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device)?;

        let seq = model.embed(&x)?;
        assert_eq!(seq.dims(), &[2, 5, 16]);
        assert_eq!(model.num_patches(), 4);
        assert_eq!(model.forward_t(&x, false)?.dims(), &[2, 5]);

        // Token 0 is the same learned vector for every image
        let diff = (seq.get(0)?.get(0)? - seq.get(1)?.get(0)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        Ok(())
    }

    #[test]
    fn test_parameter_names() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = MixerConfig {
            is_cls_token: true,
            ..tiny_config()
        };
        let _model = MixerModel::new(config, vb)?;

        let data = varmap.data().lock().unwrap();
        for name in [
            "patch_emb.weight",
            "cls_token",
            "mixer_layers.0.mlp1.fc1.weight",
            "mixer_layers.1.mlp2.ln.bias",
            "ln.weight",
            "clf.bias",
        ] {
            assert!(data.contains_key(name), "missing parameter {}", name);
        }
        // patch_emb 2 + cls 1 + 12 per layer + ln 2 + clf 2
        assert_eq!(data.len(), 2 + 1 + 2 * 12 + 2 + 2);

        Ok(())
    }

    #[test]
    fn test_friction_counts_hidden_widths() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let model = MixerModel::new(tiny_config(), vb)?;
        assert_eq!(model.friction(), 2.0 * (8.0 + 32.0));
        assert_eq!(model.friction(), model.friction());

        Ok(())
    }

    #[test]
    fn test_l1l2_reg_matches_manual_sum() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = MixerConfig {
            num_layers: 1,
            ..tiny_config()
        };
        let model = MixerModel::new(config, vb)?;

        // Set every weight to ones so each row norm is sqrt(in_features)
        for var in varmap.all_vars() {
            var.set(&var.ones_like()?)?;
        }

        // token fc1: 8 rows of 4, token fc2: 4 rows of 8,
        // channel fc1: 32 rows of 16, channel fc2: 16 rows of 32, clf: 5 rows of 16
        let expected = 8.0 * 2.0
            + 4.0 * 8f64.sqrt()
            + 32.0 * 4.0
            + 16.0 * 32f64.sqrt()
            + 5.0 * 4.0;
        let reg = model.l1l2_reg()?.to_scalar::<f32>()? as f64;
        assert!((reg - expected).abs() < 1e-3, "reg {} != {}", reg, expected);

        Ok(())
    }

    #[test]
    fn test_zeroed_model_is_bias_only() -> crate::Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);

        let model = MixerModel::new(tiny_config(), vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device)?;
        let logits = model.forward_t(&x, false)?;

        let max = logits.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(max, 0.0);

        Ok(())
    }
}
