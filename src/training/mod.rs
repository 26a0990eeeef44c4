/// Training infrastructure for the MLP-Mixer
pub mod checkpoint;
pub mod context;
pub mod loss;
pub mod metrics;
pub mod mixup;
pub mod optimizer;
pub mod scaler;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::CheckpointMetadata;
pub use context::{ExperimentContext, JsonlSink, LogSink, TelemetrySink};
pub use metrics::{EpochAccumulator, EpochRecord, MetricsLog};
pub use mixup::{BatchMixer, MixConfig, MixMode};
pub use optimizer::{MixerOptimizer, OptimizerKind};
pub use scaler::{GradScaler, GradScalerConfig};
pub use scheduler::{LrSchedule, LrScheduleConfig, SchedulerKind};
pub use trainer::{StepOutcome, Trainer, TrainingConfig};
