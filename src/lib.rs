//! MLP-Mixer - Rust implementation
//!
//! An all-MLP image classifier for small natural-image datasets (CIFAR-10,
//! CIFAR-100, SVHN) together with its training loop.
//!
//! # Architecture
//!
//! The model alternates two kinds of mixing blocks over a patch sequence:
//! - **Token mixing**: an MLP applied across patches, shared over channels
//! - **Channel mixing**: an MLP applied across channels, shared over patches
//! - **Head**: layer norm, mean pooling (or class token), linear classifier
//!
//! # Example
//!
//! ```ignore
//! use mlp_mixer::{MixerConfig, MixerModel};
//!
//! let config = MixerConfig::default();
//! let model = MixerModel::new(config, vb)?;
//! let logits = model.forward_t(&images, false)?;
//! ```

pub mod config;
pub mod data;
pub mod layers;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{Dataset, ExperimentConfig, MixerConfig};
pub use models::MixerModel;

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum MixerError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, MixerError>;
