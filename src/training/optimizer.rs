/// Adam and SGD optimizers
///
/// Both use coupled (L2) weight decay: the decay term is added to the
/// gradient before the moment updates, not applied to the weights directly.
use std::fmt;
use std::str::FromStr;

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

use crate::MixerError;

/// Optimizer choice with its algorithm-specific hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam { beta1: f64, beta2: f64 },
    Sgd { momentum: f64, nesterov: bool },
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Adam {
            beta1: 0.9,
            beta2: 0.99,
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adam { .. } => f.write_str("adam"),
            OptimizerKind::Sgd { .. } => f.write_str("sgd"),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = MixerError;

    /// Resolve a name to the optimizer with its default hyperparameters
    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "adam" => Ok(OptimizerKind::default()),
            "sgd" => Ok(OptimizerKind::Sgd {
                momentum: 0.9,
                nesterov: true,
            }),
            other => Err(MixerError::Config(format!("No such optimizer: {}", other))),
        }
    }
}

/// Adam configuration
#[derive(Debug, Clone)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Per-parameter Adam state
struct AdamState {
    var: Var,
    /// First moment estimate
    m: Tensor,
    /// Second moment estimate
    v: Tensor,
}

/// Adam optimizer
pub struct Adam {
    config: AdamConfig,
    states: Vec<AdamState>,
    step: usize,
}

impl Optimizer for Adam {
    type Config = AdamConfig;

    fn new(vars: Vec<Var>, config: AdamConfig) -> Result<Self> {
        let states = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let m = var.zeros_like()?;
                let v = var.zeros_like()?;
                Ok(AdamState { var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            states,
            step: 0,
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);
        let step_size = lr / bias_correction1;

        for state in self.states.iter_mut() {
            let Some(grad) = grads.get(state.var.as_tensor()) else {
                continue;
            };
            let param = state.var.as_tensor();

            let grad = if weight_decay != 0.0 {
                (grad + (param * weight_decay)?)?
            } else {
                grad.clone()
            };

            // m = beta1 * m + (1 - beta1) * g
            state.m = ((&state.m * beta1)? + (&grad * (1.0 - beta1))?)?;
            // v = beta2 * v + (1 - beta2) * g^2
            state.v = ((&state.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            // denom = sqrt(v) / sqrt(bc2) + eps
            let denom = ((state.v.sqrt()? / bias_correction2.sqrt())? + eps)?;
            let update = ((&state.m / denom)? * step_size)?;

            state.var.set(&(param - update)?)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

/// SGD configuration
#[derive(Debug, Clone)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            momentum: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

/// SGD with optional (Nesterov) momentum
pub struct Sgd {
    config: SgdConfig,
    vars: Vec<Var>,
    /// Momentum buffers, created on the first step that sees a gradient
    buffers: Vec<Option<Tensor>>,
}

impl Optimizer for Sgd {
    type Config = SgdConfig;

    fn new(vars: Vec<Var>, config: SgdConfig) -> Result<Self> {
        if config.nesterov && config.momentum <= 0.0 {
            candle_core::bail!("Nesterov momentum requires momentum > 0");
        }

        let vars: Vec<Var> = vars.into_iter().filter(|v| v.dtype().is_float()).collect();
        let buffers = vec![None; vars.len()];
        Ok(Self {
            config,
            vars,
            buffers,
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let SgdConfig {
            lr,
            momentum,
            weight_decay,
            nesterov,
        } = self.config;

        for (var, buffer) in self.vars.iter().zip(self.buffers.iter_mut()) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let param = var.as_tensor();

            let mut d_p = if weight_decay != 0.0 {
                (grad + (param * weight_decay)?)?
            } else {
                grad.clone()
            };

            if momentum != 0.0 {
                let buf = match buffer.take() {
                    Some(buf) => ((buf * momentum)? + &d_p)?,
                    None => d_p.clone(),
                };
                d_p = if nesterov {
                    (&d_p + (&buf * momentum)?)?
                } else {
                    buf.clone()
                };
                *buffer = Some(buf);
            }

            var.set(&(param - (d_p * lr)?)?)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

/// Optimizer selected once from [`OptimizerKind`]
pub enum MixerOptimizer {
    Adam(Adam),
    Sgd(Sgd),
}

impl MixerOptimizer {
    /// Build the configured optimizer over `vars`
    pub fn new(kind: &OptimizerKind, vars: Vec<Var>, lr: f64, weight_decay: f64) -> Result<Self> {
        match *kind {
            OptimizerKind::Adam { beta1, beta2 } => Ok(MixerOptimizer::Adam(Adam::new(
                vars,
                AdamConfig {
                    lr,
                    beta1,
                    beta2,
                    eps: 1e-8,
                    weight_decay,
                },
            )?)),
            OptimizerKind::Sgd { momentum, nesterov } => Ok(MixerOptimizer::Sgd(Sgd::new(
                vars,
                SgdConfig {
                    lr,
                    momentum,
                    weight_decay,
                    nesterov,
                },
            )?)),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            MixerOptimizer::Adam(opt) => opt.step(grads),
            MixerOptimizer::Sgd(opt) => opt.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            MixerOptimizer::Adam(opt) => opt.learning_rate(),
            MixerOptimizer::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            MixerOptimizer::Adam(opt) => opt.set_learning_rate(lr),
            MixerOptimizer::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn scalar(var: &Var) -> Result<f32> {
        var.as_tensor().to_vec1::<f32>().map(|v| v[0])
    }

    #[test]
    fn test_optimizer_kind_parsing() {
        assert_eq!("adam".parse::<OptimizerKind>().unwrap().to_string(), "adam");
        assert!(matches!(
            "sgd".parse::<OptimizerKind>().unwrap(),
            OptimizerKind::Sgd { nesterov: true, .. }
        ));
        assert!(matches!(
            "rmsprop".parse::<OptimizerKind>(),
            Err(MixerError::Config(_))
        ));
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::new(&[1.0f32], &device)?;

        let mut opt = Adam::new(
            vec![var.clone()],
            AdamConfig {
                lr: 0.1,
                ..Default::default()
            },
        )?;

        // loss = 3 * w, gradient 3; first bias-corrected Adam step is lr * sign(g)
        let loss = (var.as_tensor() * 3.0)?.sum_all()?;
        opt.backward_step(&loss)?;

        assert!((scalar(&var)? - 0.9).abs() < 1e-5);

        Ok(())
    }

    #[test]
    fn test_adam_minimizes_quadratic() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::new(&[4.0f32, -3.0], &device)?;

        let mut opt = Adam::new(
            vec![var.clone()],
            AdamConfig {
                lr: 0.1,
                ..Default::default()
            },
        )?;

        for _ in 0..300 {
            let loss = var.as_tensor().sqr()?.sum_all()?;
            opt.backward_step(&loss)?;
        }

        let max = var.as_tensor().abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max < 0.1, "did not converge: {}", max);

        Ok(())
    }

    #[test]
    fn test_sgd_plain_step() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::new(&[2.0f32], &device)?;

        let mut opt = Sgd::new(
            vec![var.clone()],
            SgdConfig {
                lr: 0.5,
                ..Default::default()
            },
        )?;

        // d/dw w^2 = 4 at w = 2
        let loss = var.as_tensor().sqr()?.sum_all()?;
        opt.backward_step(&loss)?;

        assert!((scalar(&var)? - 0.0).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_sgd_nesterov_momentum() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::new(&[0.0f32], &device)?;

        let mut opt = Sgd::new(
            vec![var.clone()],
            SgdConfig {
                lr: 0.1,
                momentum: 0.9,
                weight_decay: 0.0,
                nesterov: true,
            },
        )?;

        // Constant gradient 1: buf1 = 1, step1 = 1 + 0.9 = 1.9
        // buf2 = 0.9 + 1 = 1.9, step2 = 1 + 1.71 = 2.71
        for _ in 0..2 {
            let loss = var.as_tensor().sum_all()?;
            opt.backward_step(&loss)?;
        }

        assert!((scalar(&var)? + 0.1 * (1.9 + 2.71)).abs() < 1e-5);

        Ok(())
    }

    #[test]
    fn test_sgd_weight_decay_is_coupled() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::new(&[1.0f32], &device)?;

        let mut opt = Sgd::new(
            vec![var.clone()],
            SgdConfig {
                lr: 0.1,
                weight_decay: 0.5,
                ..Default::default()
            },
        )?;

        // Loss gradient 1, decay folded in: w -= lr * (1 + wd * w)
        let loss = var.as_tensor().sum_all()?;
        opt.backward_step(&loss)?;

        assert!((scalar(&var)? - 0.85).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_nesterov_without_momentum_rejected() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::zeros(1, DType::F32, &device)?;

        let result = Sgd::new(
            vec![var],
            SgdConfig {
                nesterov: true,
                ..Default::default()
            },
        );
        assert!(result.is_err());

        Ok(())
    }

    #[test]
    fn test_mixer_optimizer_learning_rate() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::zeros(3, DType::F32, &device)?;

        let mut opt = MixerOptimizer::new(&OptimizerKind::default(), vec![var], 1e-3, 5e-5)?;
        assert_eq!(opt.learning_rate(), 1e-3);

        opt.set_learning_rate(5e-4);
        assert_eq!(opt.learning_rate(), 5e-4);

        Ok(())
    }
}
