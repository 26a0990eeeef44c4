/// Neural network layer primitives
///
/// This module contains the building blocks for the Mixer model:
/// - Patch embedding (image to token sequence)
/// - Token and channel mixing MLP blocks
/// - Activations and dtype-casting linear layers
/// - Layer normalization

pub mod activations;
pub mod embeddings;
pub mod mixing;
pub mod normalization;

pub use activations::{Activation, CastedLinear};
pub use embeddings::PatchEmbedder;
pub use mixing::{ChannelMixing, TokenMixing};
pub use normalization::LayerNorm;
