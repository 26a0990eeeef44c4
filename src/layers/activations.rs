/// Linear projection and activation functions for the mixing MLPs
use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Linear layer with automatic dtype casting
///
/// Master weights stay in the VarBuilder dtype; they are cast to the input
/// dtype before the matmul so that a reduced-precision forward pass still
/// accumulates gradients into full-precision parameters.
pub struct CastedLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl CastedLinear {
    /// Create new CastedLinear layer
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `bias` - Whether to include bias
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        // U(-1/sqrt(fan_in), 1/sqrt(fan_in)) for both weight and bias
        let bound = 1. / (in_features as f64).sqrt();
        let init = Init::Uniform { lo: -bound, up: bound };
        let weight = vb.get_with_hints((out_features, in_features), "weight", init)?;

        let bias = if bias {
            Some(vb.get_with_hints(out_features, "bias", init)?)
        } else {
            None
        };

        Ok(Self { weight, bias })
    }

    /// Weight matrix, shape (out_features, in_features)
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Forward pass with automatic dtype casting
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let input_dtype = input.dtype();

        let weight = if self.weight.dtype() != input_dtype {
            self.weight.to_dtype(input_dtype)?
        } else {
            self.weight.clone()
        };

        // input @ weight^T, weight is [out_features, in_features]
        let output = input.broadcast_matmul(&weight.t()?)?;

        if let Some(ref b) = self.bias {
            let bias = if b.dtype() != input_dtype {
                b.to_dtype(input_dtype)?
            } else {
                b.clone()
            };
            output.broadcast_add(&bias)
        } else {
            Ok(output)
        }
    }
}

/// Nonlinearity between the two linears of a mixing MLP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Exact (erf) GELU
    Gelu,
    /// Pass-through, used for ablations
    Identity,
}

impl Activation {
    /// GELU unless `off_act` is set
    pub fn from_off_act(off_act: bool) -> Self {
        if off_act {
            Activation::Identity
        } else {
            Activation::Gelu
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Gelu => x.gelu_erf(),
            Activation::Identity => Ok(x.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_casted_linear_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let linear = CastedLinear::new(64, 128, true, vb)?;

        let x = Tensor::randn(0f32, 1.0, (2, 16, 64), &device)?;
        let out = linear.forward(&x)?;

        assert_eq!(out.dims(), &[2, 16, 128]);
        assert_eq!(linear.in_features(), 64);
        assert_eq!(linear.out_features(), 128);

        Ok(())
    }

    #[test]
    fn test_casted_linear_init_bound() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let linear = CastedLinear::new(16, 32, true, vb)?;
        let bound = 1.0 / 4.0;
        let max = linear.weight().abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max <= bound + 1e-6);

        Ok(())
    }

    #[test]
    fn test_casted_linear_half_input() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let linear = CastedLinear::new(8, 4, true, vb)?;
        let x = Tensor::randn(0f32, 1.0, (3, 8), &device)?.to_dtype(DType::F16)?;
        let out = linear.forward(&x)?;

        assert_eq!(out.dtype(), DType::F16);
        assert_eq!(linear.weight().dtype(), DType::F32);

        Ok(())
    }

    #[test]
    fn test_identity_activation() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[-1.0f32, 0.0, 2.0], &device)?;

        let out = Activation::from_off_act(true).forward(&x)?;
        assert_eq!(out.to_vec1::<f32>()?, vec![-1.0, 0.0, 2.0]);

        let gelu = Activation::from_off_act(false).forward(&x)?.to_vec1::<f32>()?;
        assert!(gelu[0] < 0.0 && gelu[0] > -0.2);
        assert_eq!(gelu[1], 0.0);
        assert!((gelu[2] - 1.9545).abs() < 1e-3);

        Ok(())
    }
}
