/// Training loop for the MLP-Mixer
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::checkpoint::{save_checkpoint, CheckpointMetadata};
use super::context::ExperimentContext;
use super::loss::{clip_grad_norm, count_correct, count_correct_soft, hard_cross_entropy, soft_cross_entropy};
use super::metrics::{EpochAccumulator, EpochRecord, MetricsLog};
use super::mixup::{BatchMixer, MixConfig, MixedBatch};
use super::optimizer::{MixerOptimizer, OptimizerKind};
use super::scaler::{GradScaler, GradScalerConfig};
use super::scheduler::{LrSchedule, LrScheduleConfig, SchedulerKind};
use crate::data::BatchDataLoader;
use crate::{MixerConfig, MixerError, MixerModel};

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub epochs: usize,
    /// Peak learning rate
    pub lr: f64,
    pub weight_decay: f64,
    pub optimizer: OptimizerKind,
    pub scheduler: SchedulerKind,
    /// Linear warmup length in epochs, 0 disables warmup
    pub warmup_epoch: usize,
    /// Gradient global-norm ceiling, 0 disables clipping
    pub clip_grad: f64,
    /// Beta(α, α) parameter for CutMix
    pub cutmix_beta: f64,
    /// Probability of mixing a batch
    pub cutmix_prob: f64,
    /// Beta(α, α) parameter for Mixup
    pub mixup_alpha: f64,
    /// Smoothing ε folded into the mixing targets; the loss adds none of its own
    pub label_smoothing: f64,
    /// Reduced-precision forward with loss scaling (accelerator only)
    pub amp: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 300,
            lr: 1e-3,
            weight_decay: 5e-5,
            optimizer: OptimizerKind::default(),
            scheduler: SchedulerKind::default(),
            warmup_epoch: 5,
            clip_grad: 0.0,
            cutmix_beta: 1.0,
            cutmix_prob: 0.0,
            mixup_alpha: 1.0,
            label_smoothing: 0.1,
            amp: true,
        }
    }
}

impl TrainingConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.epochs == 0 {
            return Err(MixerError::Config("epochs must be > 0".to_string()));
        }
        if !(self.lr > 0.0) {
            return Err(MixerError::Config(format!("lr must be > 0, got {}", self.lr)));
        }
        if self.weight_decay < 0.0 || self.clip_grad < 0.0 {
            return Err(MixerError::Config(
                "weight_decay and clip_grad must be >= 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cutmix_prob) {
            return Err(MixerError::Config(format!(
                "cutmix_prob must be in [0, 1], got {}",
                self.cutmix_prob
            )));
        }
        if self.cutmix_beta < 0.0 || self.mixup_alpha < 0.0 {
            return Err(MixerError::Config("mixing alphas must be >= 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(MixerError::Config(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        if let OptimizerKind::Sgd { momentum, nesterov } = self.optimizer {
            if nesterov && momentum <= 0.0 {
                return Err(MixerError::Config(
                    "nesterov momentum requires momentum > 0".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Mixing parameters for a model with `num_classes` outputs
    pub fn mix_config(&self, num_classes: usize) -> MixConfig {
        MixConfig {
            mixup_alpha: self.mixup_alpha,
            cutmix_alpha: self.cutmix_beta,
            prob: self.cutmix_prob,
            switch_prob: 0.5,
            label_smoothing: self.label_smoothing,
            num_classes,
        }
    }

    pub fn schedule_config(&self) -> LrScheduleConfig {
        LrScheduleConfig {
            lr_init: self.lr,
            kind: self.scheduler.clone(),
            warmup_epochs: self.warmup_epoch,
            total_epochs: self.epochs,
        }
    }
}

/// Result of one optimization step
#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    /// Mean loss over the batch
    pub loss: f64,
    /// Predictions matching the dominant (possibly mixed) label
    pub correct: usize,
    pub batch_size: usize,
    /// Unscaled gradient norm before clipping, `None` when clipping is disabled
    pub grad_norm: Option<f64>,
    /// False when the loss scaler skipped the update
    pub stepped: bool,
}

/// Trainer for MixerModel
pub struct Trainer {
    model: MixerModel,
    varmap: VarMap,
    optimizer: MixerOptimizer,
    schedule: LrSchedule,
    scaler: GradScaler,
    mixer: BatchMixer,
    config: TrainingConfig,
    device: Device,
    compute_dtype: DType,
    rng: StdRng,
    step: usize,
}

impl Trainer {
    /// Create new trainer
    ///
    /// Master weights are f32. With `amp` on an accelerator the forward pass
    /// runs in f16 under a dynamic loss scaler.
    pub fn new(
        model_config: MixerConfig,
        training_config: TrainingConfig,
        device: &Device,
        seed: u64,
    ) -> crate::Result<Self> {
        training_config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = MixerModel::new(model_config, vb)?;

        let optimizer = MixerOptimizer::new(
            &training_config.optimizer,
            varmap.all_vars(),
            training_config.lr,
            training_config.weight_decay,
        )?;
        let schedule = LrSchedule::new(training_config.schedule_config());

        let use_amp = training_config.amp && device.is_cuda();
        let compute_dtype = if use_amp { DType::F16 } else { DType::F32 };
        let scaler = GradScaler::new(GradScalerConfig::default(), use_amp);

        let mixer = BatchMixer::new(training_config.mix_config(model.config().num_classes))?;

        log::info!(
            "Trainer: optimizer={}, scheduler={}, epochs={}, compute dtype {:?}",
            training_config.optimizer,
            training_config.scheduler,
            training_config.epochs,
            compute_dtype
        );

        Ok(Self {
            model,
            varmap,
            optimizer,
            schedule,
            scaler,
            mixer,
            config: training_config,
            device: device.clone(),
            compute_dtype,
            rng: StdRng::seed_from_u64(seed),
            step: 0,
        })
    }

    /// Build a trainer from the experiment's configuration, device and RNG
    pub fn from_context(ctx: &mut ExperimentContext) -> crate::Result<Self> {
        let seed = ctx.rng().gen::<u64>();
        let config = ctx.config().clone();
        let device = ctx.device().clone();
        Self::new(config.model, config.training, &device, seed)
    }

    pub fn model(&self) -> &MixerModel {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Optimization steps taken so far
    pub fn global_step(&self) -> usize {
        self.step
    }

    /// Mix the batch, run the scaled forward/backward pass
    fn forward_backward(
        &mut self,
        images: &Tensor,
        labels: &Tensor,
    ) -> crate::Result<(MixedBatch, Tensor, Tensor, GradStore)> {
        let images = images.to_device(&self.device)?;
        let labels = labels.to_device(&self.device)?;

        let mixed = self.mixer.apply(&images, &labels, &mut self.rng)?;

        let logits = self
            .model
            .forward_t(&mixed.images.to_dtype(self.compute_dtype)?, true)?
            .to_dtype(DType::F32)?;
        let loss = soft_cross_entropy(&logits, &mixed.targets)?;

        let grads = self.scaler.scale(&loss)?.backward()?;
        Ok((mixed, logits, loss, grads))
    }

    /// Training step
    ///
    /// Mix, forward under the loss scaler, backward, clip if enabled,
    /// unscale and step (or skip on overflow).
    pub fn train_step(&mut self, images: &Tensor, labels: &Tensor) -> crate::Result<StepOutcome> {
        let batch_size = images.dim(0)?;
        let (mixed, logits, loss, mut grads) = self.forward_backward(images, labels)?;

        let vars = self.varmap.all_vars();
        // Clipping acts on the still-scaled gradients; the reported norm is unscaled
        let grad_norm = if self.config.clip_grad > 0.0 {
            let scaled = clip_grad_norm(&mut grads, &vars, self.config.clip_grad)?;
            Some(scaled / self.scaler.scale_factor())
        } else {
            None
        };

        let stepped = self.scaler.step(&mut self.optimizer, &mut grads, &vars)?;
        self.step += 1;

        Ok(StepOutcome {
            loss: loss.to_scalar::<f32>()? as f64,
            correct: count_correct_soft(&logits, &mixed.targets)?,
            batch_size,
            grad_norm,
            stepped,
        })
    }

    /// Train for one epoch
    pub fn train_epoch(&mut self, dataloader: &mut impl BatchDataLoader) -> crate::Result<EpochAccumulator> {
        let mut acc = EpochAccumulator::new();
        let mut skipped = 0usize;

        dataloader.reset();
        while let Some((images, labels)) = dataloader.next_batch(&self.device)? {
            let outcome = self.train_step(&images, &labels)?;
            acc.add(outcome.loss, outcome.correct, outcome.batch_size);
            if !outcome.stepped {
                skipped += 1;
            }

            if self.step % 100 == 0 {
                log::debug!("Step {}: loss={:.4}, lr={:.6}", self.step, outcome.loss, self.learning_rate());
            }
        }

        if skipped > 0 {
            log::debug!(
                "{} steps skipped on overflow, loss scale now {}",
                skipped,
                self.scaler.scale_factor()
            );
        }

        Ok(acc)
    }

    /// Gradient-free pass with dropout disabled
    pub fn evaluate(&self, dataloader: &mut impl BatchDataLoader) -> crate::Result<EpochAccumulator> {
        let mut acc = EpochAccumulator::new();

        dataloader.reset();
        while let Some((images, labels)) = dataloader.next_batch(&self.device)? {
            let images = images.to_device(&self.device)?.to_dtype(self.compute_dtype)?;
            let labels = labels.to_device(&self.device)?;

            let logits = self.model.forward_t(&images, false)?.to_dtype(DType::F32)?.detach();
            let loss = hard_cross_entropy(&logits, &labels)?.to_scalar::<f32>()? as f64;
            acc.add(loss, count_correct(&logits, &labels)?, images.dim(0)?);
        }

        Ok(acc)
    }

    /// Full training loop
    ///
    /// Per epoch: train, advance the schedule, evaluate, overwrite the
    /// weight snapshot and rewrite the metrics table. Returns every row.
    pub fn fit(
        &mut self,
        ctx: &mut ExperimentContext,
        train: &mut impl BatchDataLoader,
        valid: &mut impl BatchDataLoader,
    ) -> crate::Result<Vec<EpochRecord>> {
        let mut metrics = MetricsLog::new(ctx.metrics_path());
        let weights_path = ctx.weights_path();

        log::info!("Starting training for {} epochs", self.config.epochs);
        log::info!("Total batches per epoch: {}", train.num_batches());

        for epoch in 1..=self.config.epochs {
            let lr = self.schedule.get_lr();
            self.optimizer.set_learning_rate(lr);

            let train_acc = self.train_epoch(train)?;
            ctx.log_metrics(
                epoch,
                &[
                    ("lr", lr),
                    ("epoch_tr_loss", train_acc.mean_loss()),
                    ("epoch_tr_acc", train_acc.accuracy()),
                ],
            );
            self.schedule.step();

            let valid_acc = self.evaluate(valid)?;
            ctx.log_metrics(
                epoch,
                &[("val_loss", valid_acc.mean_loss()), ("val_acc", valid_acc.accuracy())],
            );

            save_checkpoint(
                &self.varmap,
                &weights_path,
                &CheckpointMetadata {
                    epoch,
                    lr,
                    train_loss: Some(train_acc.mean_loss()),
                    valid_loss: Some(valid_acc.mean_loss()),
                },
            )?;

            metrics.append(EpochRecord {
                epoch,
                train_loss: train_acc.mean_loss(),
                valid_loss: valid_acc.mean_loss(),
                train_acc: train_acc.accuracy(),
                valid_acc: valid_acc.accuracy(),
                friction: self.model.friction(),
            })?;

            log::info!(
                "Epoch {}/{}: lr={:.6} train_loss={:.4} train_acc={:.4} valid_loss={:.4} valid_acc={:.4}",
                epoch,
                self.config.epochs,
                lr,
                train_acc.mean_loss(),
                train_acc.accuracy(),
                valid_acc.mean_loss(),
                valid_acc.accuracy()
            );
        }

        log::info!("Training complete");
        Ok(metrics.records().to_vec())
    }
}
