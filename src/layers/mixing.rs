/// Token-mixing and channel-mixing MLP blocks
///
/// Both blocks are pre-norm residual MLPs on a `[batch, seq_len, hidden]`
/// sequence; they differ only in which axis the MLP runs over.
use candle_core::{Result, Tensor};
use candle_nn::{Dropout, VarBuilder};

use super::activations::{Activation, CastedLinear};
use super::normalization::{LayerNorm, LAYER_NORM_EPS};

/// MLP across the token (patch) axis, shared over channels
pub struct TokenMixing {
    ln: LayerNorm,
    fc1: CastedLinear,
    fc2: CastedLinear,
    act: Activation,
    dropout: Dropout,
}

impl TokenMixing {
    /// # Arguments
    /// * `seq_len` - Number of tokens (patches, plus the class token if any)
    /// * `hidden_s` - Width of the token MLP
    /// * `hidden_size` - Channel dimension normalized by the layer norm
    pub fn new(
        seq_len: usize,
        hidden_s: usize,
        hidden_size: usize,
        drop_p: f32,
        act: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            ln: LayerNorm::new(hidden_size, LAYER_NORM_EPS, vb.pp("ln"))?,
            fc1: CastedLinear::new(seq_len, hidden_s, true, vb.pp("fc1"))?,
            fc2: CastedLinear::new(hidden_s, seq_len, true, vb.pp("fc2"))?,
            act,
            dropout: Dropout::new(drop_p),
        })
    }

    /// First and second linear weight matrices
    pub fn weights(&self) -> [&Tensor; 2] {
        [self.fc1.weight(), self.fc2.weight()]
    }

    /// Output width of the first linear (`hidden_s`)
    pub fn width(&self) -> usize {
        self.fc1.out_features()
    }

    /// `x + T(do2(fc2(do1(act(fc1(T(ln(x))))))))` with `T` swapping tokens and channels
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.ln.forward(x)?.transpose(1, 2)?.contiguous()?;
        let out = self.act.forward(&self.fc1.forward(&out)?)?;
        let out = self.dropout.forward(&out, train)?;
        let out = self.dropout.forward(&self.fc2.forward(&out)?, train)?;
        let out = out.transpose(1, 2)?.contiguous()?;
        out + x
    }
}

/// MLP across the channel axis, shared over tokens
pub struct ChannelMixing {
    ln: LayerNorm,
    fc1: CastedLinear,
    fc2: CastedLinear,
    act: Activation,
    dropout: Dropout,
}

impl ChannelMixing {
    pub fn new(
        hidden_size: usize,
        hidden_c: usize,
        drop_p: f32,
        act: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            ln: LayerNorm::new(hidden_size, LAYER_NORM_EPS, vb.pp("ln"))?,
            fc1: CastedLinear::new(hidden_size, hidden_c, true, vb.pp("fc1"))?,
            fc2: CastedLinear::new(hidden_c, hidden_size, true, vb.pp("fc2"))?,
            act,
            dropout: Dropout::new(drop_p),
        })
    }

    /// First and second linear weight matrices
    pub fn weights(&self) -> [&Tensor; 2] {
        [self.fc1.weight(), self.fc2.weight()]
    }

    /// Output width of the first linear (`hidden_c`)
    pub fn width(&self) -> usize {
        self.fc1.out_features()
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.act.forward(&self.fc1.forward(&self.ln.forward(x)?)?)?;
        let out = self.dropout.forward(&out, train)?;
        let out = self.dropout.forward(&self.fc2.forward(&out)?, train)?;
        out + x
    }
}
