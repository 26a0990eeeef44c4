/// Layer normalization over the last (channel) dimension
use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Default epsilon, matching the usual LayerNorm default
pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Layer normalization function
///
/// Centers and scales by the standard deviation over the last dimension.
/// The computation is done in f32 for precision, then cast back to the
/// original dtype.
///
/// # Arguments
/// * `x` - Input tensor
/// * `eps` - Small constant added to the variance
///
/// # Returns
/// Normalized tensor with same shape and dtype as input
pub fn layer_norm(x: &Tensor, eps: f64) -> Result<Tensor> {
    let input_dtype = x.dtype();

    let x = if input_dtype != DType::F32 {
        x.to_dtype(DType::F32)?
    } else {
        x.clone()
    };

    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let normalized = centered.broadcast_div(&(variance + eps)?.sqrt()?)?;

    if input_dtype != DType::F32 {
        normalized.to_dtype(input_dtype)
    } else {
        Ok(normalized)
    }
}

/// Layer normalization with learnable scale and shift
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden_size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_dtype = x.dtype();
        let normalized = layer_norm(x, self.eps)?;
        normalized
            .broadcast_mul(&self.weight.to_dtype(input_dtype)?)?
            .broadcast_add(&self.bias.to_dtype(input_dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_layer_norm_basic() -> Result<()> {
        let device = Device::Cpu;

        let x = Tensor::new(&[1.0f32, 2.0, 3.0, 4.0], &device)?.reshape((1, 4))?;
        let normalized = layer_norm(&x, LAYER_NORM_EPS)?;

        let mean = normalized.mean_all()?.to_scalar::<f32>()?;
        let var = normalized.sqr()?.mean_all()?.to_scalar::<f32>()?;
        assert!(mean.abs() < 1e-5, "mean should be 0, got {}", mean);
        assert!((var - 1.0).abs() < 1e-3, "variance should be 1, got {}", var);

        Ok(())
    }

    #[test]
    fn test_layer_norm_preserves_shape_and_dtype() -> Result<()> {
        let device = Device::Cpu;

        let x = Tensor::randn(0f32, 1.0, (2, 8, 64), &device)?.to_dtype(DType::BF16)?;
        let normalized = layer_norm(&x, LAYER_NORM_EPS)?;

        assert_eq!(x.dims(), normalized.dims());
        assert_eq!(normalized.dtype(), DType::BF16);

        Ok(())
    }

    #[test]
    fn test_layer_norm_module_identity_affine() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let ln = LayerNorm::new(6, LAYER_NORM_EPS, vb)?;
        let x = Tensor::randn(0f32, 3.0, (4, 6), &device)?;

        let diff = (ln.forward(&x)? - layer_norm(&x, LAYER_NORM_EPS)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6);

        Ok(())
    }
}
