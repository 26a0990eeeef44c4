/// Dynamic loss scaling for reduced-precision training
///
/// The loss is multiplied by a scale factor before backpropagation so that
/// small half-precision gradients do not underflow. Gradients are unscaled
/// before the optimizer step; if any of them overflowed the step is skipped
/// and the scale shrinks, otherwise the scale grows after a run of clean steps.
use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};

use super::optimizer::MixerOptimizer;

/// Loss scaler configuration
#[derive(Debug, Clone)]
pub struct GradScalerConfig {
    pub init_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    /// Clean steps required before the scale grows
    pub growth_interval: usize,
}

impl Default for GradScalerConfig {
    fn default() -> Self {
        Self {
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

/// Dynamic loss scaler
///
/// A disabled scaler is a pass-through: scale 1, no overflow checks, every
/// step is applied.
#[derive(Debug, Clone)]
pub struct GradScaler {
    config: GradScalerConfig,
    scale: f64,
    growth_tracker: usize,
    enabled: bool,
}

impl GradScaler {
    pub fn new(config: GradScalerConfig, enabled: bool) -> Self {
        let scale = config.init_scale;
        Self {
            config,
            scale,
            growth_tracker: 0,
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(GradScalerConfig::default(), false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current scale factor (1 when disabled)
    pub fn scale_factor(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Multiply the loss by the current scale
    pub fn scale(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        loss * self.scale
    }

    /// Divide every gradient of `vars` by the scale and report whether any
    /// of them holds a NaN or infinity.
    pub fn unscale_and_check(&self, grads: &mut GradStore, vars: &[Var]) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }

        let inv_scale = 1.0 / self.scale;
        let mut found_inf = false;
        for var in vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let dtype = grad.dtype();
            let unscaled = (grad.to_dtype(DType::F32)? * inv_scale)?;
            if !found_inf {
                let total = unscaled.sum_all()?.to_scalar::<f32>()?;
                found_inf = !total.is_finite();
            }
            grads.insert(var.as_tensor(), unscaled.to_dtype(dtype)?);
        }

        Ok(found_inf)
    }

    /// Unscale, then step the optimizer unless an overflow was found.
    ///
    /// Returns `true` when the optimizer step was applied.
    pub fn step(
        &mut self,
        optimizer: &mut MixerOptimizer,
        grads: &mut GradStore,
        vars: &[Var],
    ) -> Result<bool> {
        let found_inf = self.unscale_and_check(grads, vars)?;
        if found_inf {
            log::debug!("Non-finite gradients at scale {}, skipping step", self.scale);
        } else {
            optimizer.step(grads)?;
        }
        self.update(found_inf);
        Ok(!found_inf)
    }

    /// Back off on overflow, grow after `growth_interval` clean steps
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }

        if found_inf {
            self.scale *= self.config.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.config.growth_interval {
                self.scale *= self.config.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }
}
