/// Per-epoch learning rate schedule: linear warmup composed with a base decay
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::MixerError;

/// Base decay schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Multiply by `gamma` at epochs/2 and 3*epochs/4
    Step { gamma: f64 },
    /// Cosine annealing from the initial rate down to `min_lr`
    Cosine { min_lr: f64 },
}

impl Default for SchedulerKind {
    fn default() -> Self {
        SchedulerKind::Cosine { min_lr: 1e-6 }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Step { .. } => f.write_str("step"),
            SchedulerKind::Cosine { .. } => f.write_str("cosine"),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = MixerError;

    /// Resolve a name to the schedule with its default parameters
    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "step" => Ok(SchedulerKind::Step { gamma: 0.1 }),
            "cosine" => Ok(SchedulerKind::default()),
            other => Err(MixerError::Config(format!("No such scheduler: {}", other))),
        }
    }
}

/// Learning rate scheduler configuration
#[derive(Debug, Clone)]
pub struct LrScheduleConfig {
    /// Initial (peak) learning rate
    pub lr_init: f64,
    /// Base decay schedule
    pub kind: SchedulerKind,
    /// Number of linear warmup epochs, 0 disables warmup
    pub warmup_epochs: usize,
    /// Total number of training epochs
    pub total_epochs: usize,
}

impl Default for LrScheduleConfig {
    fn default() -> Self {
        Self {
            lr_init: 1e-3,
            kind: SchedulerKind::default(),
            warmup_epochs: 5,
            total_epochs: 300,
        }
    }
}

/// Warmup + base schedule, advanced once per epoch
///
/// - Epochs `0..=warmup`: `lr_init * epoch / warmup`
/// - Afterwards: the base schedule evaluated at `epoch - warmup - 1`, with its
///   milestones and period laid out over `total_epochs`
pub struct LrSchedule {
    config: LrScheduleConfig,
    milestones: [usize; 2],
    current_epoch: usize,
}

impl LrSchedule {
    pub fn new(config: LrScheduleConfig) -> Self {
        let milestones = [config.total_epochs / 2, 3 * config.total_epochs / 4];
        Self {
            config,
            milestones,
            current_epoch: 0,
        }
    }

    /// Learning rate for the current epoch
    pub fn get_lr(&self) -> f64 {
        self.get_lr_at_epoch(self.current_epoch)
    }

    /// Learning rate for a specific number of completed epochs
    pub fn get_lr_at_epoch(&self, epoch: usize) -> f64 {
        let warmup = self.config.warmup_epochs;
        if warmup > 0 {
            if epoch <= warmup {
                return self.config.lr_init * (epoch as f64 / warmup as f64);
            }
            // Peak rate is held one extra epoch before the base schedule advances
            return self.base_lr(epoch - warmup - 1);
        }
        self.base_lr(epoch)
    }

    fn base_lr(&self, t: usize) -> f64 {
        let lr_init = self.config.lr_init;
        match self.config.kind {
            SchedulerKind::Step { gamma } => {
                let passed = self.milestones.iter().filter(|&&m| m <= t).count();
                lr_init * gamma.powi(passed as i32)
            }
            SchedulerKind::Cosine { min_lr } => {
                let t_max = self.config.total_epochs.max(1) as f64;
                let cosine_factor = 0.5 * (1.0 + (PI * t as f64 / t_max).cos());
                min_lr + (lr_init - min_lr) * cosine_factor
            }
        }
    }

    /// Step milestones (only meaningful for the step schedule)
    pub fn milestones(&self) -> [usize; 2] {
        self.milestones
    }

    /// Advance by one completed epoch
    pub fn step(&mut self) {
        self.current_epoch += 1;
    }

    pub fn get_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Reset scheduler to initial state
    pub fn reset(&mut self) {
        self.current_epoch = 0;
    }
}
