/// Loss, accuracy and gradient-norm helpers
use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var, D};
use candle_nn::ops::log_softmax;

/// Cross entropy against soft targets
///
/// `logits` [batch, classes], `targets` [batch, classes] with rows summing
/// to 1. Returns the batch mean of `-sum(targets * log_softmax(logits))`.
pub fn soft_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let targets = targets.to_dtype(DType::F32)?;
    (targets * log_probs)?.sum(D::Minus1)?.neg()?.mean_all()
}

/// Cross entropy against integer class labels
pub fn hard_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let labels = labels.flatten_all()?.to_dtype(DType::U32)?;
    candle_nn::loss::cross_entropy(&logits.to_dtype(DType::F32)?, &labels)
}

/// Number of rows whose logit argmax equals `labels`
pub fn count_correct(logits: &Tensor, labels: &Tensor) -> Result<usize> {
    let preds = logits.argmax(D::Minus1)?;
    let labels = labels.flatten_all()?.to_dtype(DType::U32)?;
    let correct = preds.eq(&labels)?.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()?;
    Ok(correct as usize)
}

/// Number of rows whose logit argmax equals the argmax of the soft target
///
/// With mixed targets this only credits the dominant label.
pub fn count_correct_soft(logits: &Tensor, targets: &Tensor) -> Result<usize> {
    count_correct(logits, &targets.argmax(D::Minus1)?)
}

/// Global L2 norm of the gradients of `vars`
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(sum_sq.sqrt())
}

/// Rescale gradients so their global norm is at most `max_norm`
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let total_norm = grad_norm(grads, vars)?;
    let clip_coef = (max_norm / (total_norm + 1e-6)).min(1.0);
    if clip_coef < 1.0 {
        for var in vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let clipped = (grad * clip_coef)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_soft_matches_hard_on_one_hot() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2.0f32, 0.5, -1.0], [0.1, 0.2, 3.0]], &device)?;
        let labels = Tensor::new(&[0u32, 2], &device)?;
        let one_hot = Tensor::new(&[[1.0f32, 0.0, 0.0], [0.0, 0.0, 1.0]], &device)?;

        let soft = soft_cross_entropy(&logits, &one_hot)?.to_scalar::<f32>()?;
        let hard = hard_cross_entropy(&logits, &labels)?.to_scalar::<f32>()?;
        assert!((soft - hard).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_soft_cross_entropy_uniform_logits() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 4), DType::F32, &device)?;
        let targets = Tensor::new(&[[0.5f32, 0.5, 0.0, 0.0], [0.25, 0.25, 0.25, 0.25]], &device)?;

        let loss = soft_cross_entropy(&logits, &targets)?.to_scalar::<f32>()?;
        assert!((loss - 4f32.ln()).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_count_correct() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2.0f32, 0.5], [0.1, 0.2], [3.0, -1.0]], &device)?;
        let labels = Tensor::new(&[0u32, 1, 1], &device)?;
        assert_eq!(count_correct(&logits, &labels)?, 2);

        // Dominant label of a 0.6/0.4 mix
        let targets = Tensor::new(&[[0.6f32, 0.4], [0.4, 0.6], [0.4, 0.6]], &device)?;
        assert_eq!(count_correct_soft(&logits, &targets)?, 2);

        Ok(())
    }

    #[test]
    fn test_clip_caps_global_norm() -> Result<()> {
        let device = Device::Cpu;
        let a = Var::new(&[1.0f32, 2.0], &device)?;
        let b = Var::new(&[3.0f32], &device)?;
        let vars = vec![a.clone(), b.clone()];

        // d/dx of 3x^2/2 is 3x: grads [3, 6] and [9]
        let loss = ((a.as_tensor().sqr()?.sum_all()? + b.as_tensor().sqr()?.sum_all()?)? * 1.5)?;
        let mut grads = loss.backward()?;

        let before = clip_grad_norm(&mut grads, &vars, 1.0)?;
        assert!((before - 126f64.sqrt()).abs() < 1e-4);

        let after = grad_norm(&grads, &vars)?;
        assert!(after <= 1.0 + 1e-5);

        Ok(())
    }

    #[test]
    fn test_clip_leaves_small_gradients() -> Result<()> {
        let device = Device::Cpu;
        let a = Var::new(&[0.1f32, 0.2], &device)?;
        let vars = vec![a.clone()];

        let mut grads = a.as_tensor().sum_all()?.backward()?;
        let before = clip_grad_norm(&mut grads, &vars, 10.0)?;
        let after = grad_norm(&grads, &vars)?;
        assert!((before - after).abs() < 1e-9);

        Ok(())
    }
}
