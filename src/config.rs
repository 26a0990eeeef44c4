/// Configuration for the MLP-Mixer model and experiment
///
/// Defaults follow the CIFAR-10 recipe (patch 4, hidden 128, 8 layers).
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::training::TrainingConfig;
use crate::{MixerError, Result};

/// Supported datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    C10,
    C100,
    Svhn,
}

impl Dataset {
    pub fn num_classes(&self) -> usize {
        match self {
            Dataset::C10 | Dataset::Svhn => 10,
            Dataset::C100 => 100,
        }
    }

    pub fn in_channels(&self) -> usize {
        3
    }

    pub fn img_size(&self) -> usize {
        32
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dataset::C10 => "c10",
            Dataset::C100 => "c100",
            Dataset::Svhn => "svhn",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dataset {
    type Err = MixerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "c10" => Ok(Dataset::C10),
            "c100" => Ok(Dataset::C100),
            "svhn" => Ok(Dataset::Svhn),
            other => Err(MixerError::Config(format!(
                "No such dataset: {}. Must be 'c10', 'c100' or 'svhn'",
                other
            ))),
        }
    }
}

/// Model hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixerConfig {
    /// Image channels
    pub in_channels: usize,

    /// Image height in pixels
    pub img_height: usize,

    /// Image width in pixels
    pub img_width: usize,

    /// Side of the square, non-overlapping patches
    pub patch_size: usize,

    /// Per-token embedding dimension
    pub hidden_size: usize,

    /// Width of the token-mixing MLP
    pub hidden_s: usize,

    /// Width of the channel-mixing MLP
    pub hidden_c: usize,

    /// Number of (token, channel) mixing pairs
    pub num_layers: usize,

    /// Number of output classes
    pub num_classes: usize,

    /// Dropout probability after each mixing linear
    pub drop_p: f32,

    /// Replace GELU with identity
    pub off_act: bool,

    /// Prepend a learned class token and classify from it
    pub is_cls_token: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            img_height: 32,
            img_width: 32,
            patch_size: 4,
            hidden_size: 128,
            hidden_s: 64,
            hidden_c: 512,
            num_layers: 8,
            num_classes: 10,
            drop_p: 0.0,
            off_act: false,
            is_cls_token: false,
        }
    }
}

impl MixerConfig {
    /// Default model shaped for a dataset's images and classes
    pub fn for_dataset(dataset: Dataset) -> Self {
        Self {
            in_channels: dataset.in_channels(),
            img_height: dataset.img_size(),
            img_width: dataset.img_size(),
            num_classes: dataset.num_classes(),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 {
            return Err(MixerError::Config("patch_size must be > 0".to_string()));
        }

        if self.img_height % self.patch_size != 0 || self.img_width % self.patch_size != 0 {
            return Err(MixerError::Config(format!(
                "image size {}x{} is not divisible by patch_size {}",
                self.img_height, self.img_width, self.patch_size
            )));
        }

        if self.img_height == 0 || self.img_width == 0 || self.in_channels == 0 {
            return Err(MixerError::Config(
                "image dimensions and in_channels must be > 0".to_string(),
            ));
        }

        if self.hidden_size == 0 || self.hidden_s == 0 || self.hidden_c == 0 {
            return Err(MixerError::Config(
                "hidden_size, hidden_s and hidden_c must be > 0".to_string(),
            ));
        }

        if self.num_classes == 0 {
            return Err(MixerError::Config("num_classes must be > 0".to_string()));
        }

        if !(0.0..1.0).contains(&self.drop_p) {
            return Err(MixerError::Config(format!(
                "drop_p must be in [0, 1), got {}",
                self.drop_p
            )));
        }

        Ok(())
    }

    /// Number of image patches
    pub fn num_patches(&self) -> usize {
        (self.img_height / self.patch_size) * (self.img_width / self.patch_size)
    }

    /// Sequence length seen by the mixing blocks
    pub fn seq_len(&self) -> usize {
        self.num_patches() + usize::from(self.is_cls_token)
    }

    /// Flattened length of one patch
    pub fn patch_dim(&self) -> usize {
        self.in_channels * self.patch_size * self.patch_size
    }
}

/// Full set of options recorded for one experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Telemetry project name
    pub project: String,
    /// Experiment (run) name, also the artifact directory
    pub experiment: String,
    pub dataset: Dataset,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    /// Loader worker count for external data pipelines; the in-memory
    /// loaders here are single-threaded, so only `params.json` records it
    pub num_workers: usize,
    pub seed: u64,
    /// Force CPU even when an accelerator is present
    pub cpu: bool,
    pub model: MixerConfig,
    pub training: TrainingConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            project: "mlp_mixer".to_string(),
            experiment: "experiment".to_string(),
            dataset: Dataset::C10,
            batch_size: 128,
            eval_batch_size: 1024,
            num_workers: 4,
            seed: 42,
            cpu: false,
            model: MixerConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Default experiment for a dataset
    pub fn for_dataset(dataset: Dataset) -> Self {
        Self {
            dataset,
            model: MixerConfig::for_dataset(dataset),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.num_classes != self.dataset.num_classes() {
            return Err(MixerError::Config(format!(
                "model has {} classes but dataset {} has {}",
                self.model.num_classes,
                self.dataset,
                self.dataset.num_classes()
            )));
        }

        if self.batch_size == 0 || self.eval_batch_size == 0 {
            return Err(MixerError::Config("batch sizes must be > 0".to_string()));
        }

        self.model.validate()?;
        self.training.validate()
    }

    /// Parameter dump: pretty JSON with sorted keys
    pub fn to_params_json(&self) -> Result<String> {
        // serde_json::Map is a BTreeMap, so going through Value sorts the keys
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MixerConfig::default().validate().is_ok());
        assert!(ExperimentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_non_divisible_patch_rejected() {
        let config = MixerConfig {
            patch_size: 5,
            ..Default::default()
        };

        match config.validate() {
            Err(MixerError::Config(msg)) => assert!(msg.contains("not divisible")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_length() {
        let mut config = MixerConfig::default();
        assert_eq!(config.num_patches(), 64);
        assert_eq!(config.seq_len(), 64);

        config.is_cls_token = true;
        assert_eq!(config.seq_len(), 65);

        config.img_width = 16;
        assert_eq!(config.num_patches(), 32);
    }

    #[test]
    fn test_dataset_parsing() {
        assert_eq!("c100".parse::<Dataset>().unwrap(), Dataset::C100);
        assert_eq!(Dataset::Svhn.num_classes(), 10);
        assert!("imagenet".parse::<Dataset>().is_err());
    }

    #[test]
    fn test_experiment_class_mismatch() {
        let mut config = ExperimentConfig::for_dataset(Dataset::C100);
        assert_eq!(config.model.num_classes, 100);
        assert!(config.validate().is_ok());

        config.model.num_classes = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_params_json_sorted() {
        let json = ExperimentConfig::default().to_params_json().unwrap();
        let batch = json.find("\"batch_size\"").unwrap();
        let seed = json.find("\"seed\"").unwrap();
        let dataset = json.find("\"dataset\"").unwrap();
        assert!(batch < dataset && dataset < seed);
        assert!(json.contains("\"c10\""));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["num_workers"], 4);
    }
}
