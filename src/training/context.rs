/// Experiment context: artifact directory, seeding, device and telemetry
///
/// Created once with [`ExperimentContext::init`] and closed with
/// [`ExperimentContext::shutdown`]; the training loop receives it explicitly.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::Device;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{Map, Value};

use crate::utils::select_device;
use crate::{ExperimentConfig, MixerError};

/// Destination for per-epoch scalar metrics
pub trait TelemetrySink {
    /// Record `metrics` at `step`
    fn log_metrics(&mut self, step: usize, metrics: &[(&str, f64)]) -> crate::Result<()>;

    /// Flush and close the sink
    fn finish(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// Sink writing metrics through the `log` facade
#[derive(Debug, Clone)]
pub struct LogSink {
    experiment: String,
}

impl LogSink {
    pub fn new(experiment: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
        }
    }
}

impl TelemetrySink for LogSink {
    fn log_metrics(&mut self, step: usize, metrics: &[(&str, f64)]) -> crate::Result<()> {
        let line = metrics
            .iter()
            .map(|(name, value)| format!("{}={:.6}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        log::info!("[{}] step {}: {}", self.experiment, step, line);
        Ok(())
    }
}

/// Sink appending one JSON object per call to a file
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonlSink {
    fn log_metrics(&mut self, step: usize, metrics: &[(&str, f64)]) -> crate::Result<()> {
        let mut row = Map::new();
        row.insert("step".to_string(), Value::from(step));
        for (name, value) in metrics {
            row.insert(name.to_string(), Value::from(*value));
        }
        serde_json::to_writer(&mut self.writer, &row)?;
        self.writer.write_all(b"\n")?;
        self.writer
            .flush()
            .map_err(|e| MixerError::Telemetry(format!("{}: {}", self.path.display(), e)))
    }

    fn finish(&mut self) -> crate::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Per-run state that used to live in process globals
pub struct ExperimentContext {
    config: ExperimentConfig,
    dir: PathBuf,
    device: Device,
    rng: StdRng,
    sink: Box<dyn TelemetrySink>,
}

impl ExperimentContext {
    /// Validate the configuration, create `root/<experiment>`, dump
    /// `params.json`, pick the device and seed every RNG.
    pub fn init<P: AsRef<Path>>(
        root: P,
        config: ExperimentConfig,
        sink: Box<dyn TelemetrySink>,
    ) -> crate::Result<Self> {
        config.validate()?;

        let dir = root.as_ref().join(&config.experiment);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("params.json"), config.to_params_json()?)?;

        let device = select_device(config.cpu)?;
        if let Err(e) = device.set_seed(config.seed) {
            log::debug!("Device RNG not seeded: {}", e);
        }
        let rng = StdRng::seed_from_u64(config.seed);

        log::info!(
            "Experiment {}/{} in {:?} on {:?}",
            config.project,
            config.experiment,
            dir,
            device
        );

        Ok(Self {
            config,
            dir,
            device,
            rng,
            sink,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn params_path(&self) -> PathBuf {
        self.dir.join("params.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join("metrics.csv")
    }

    pub fn weights_path(&self) -> PathBuf {
        self.dir.join("model.safetensors")
    }

    /// Forward metrics to the sink; failures are logged, never returned
    pub fn log_metrics(&mut self, step: usize, metrics: &[(&str, f64)]) {
        if let Err(e) = self.sink.log_metrics(step, metrics) {
            log::warn!("Telemetry failed at step {}: {}", step, e);
        }
    }

    /// Close the telemetry sink
    pub fn shutdown(mut self) -> crate::Result<()> {
        self.sink.finish()?;
        log::info!("Experiment {} finished", self.config.experiment);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn log_metrics(&mut self, _step: usize, _metrics: &[(&str, f64)]) -> crate::Result<()> {
            Err(MixerError::Telemetry("unreachable server".to_string()))
        }
    }

    fn cpu_config() -> ExperimentConfig {
        ExperimentConfig {
            experiment: "unit".to_string(),
            cpu: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_init_writes_params() -> crate::Result<()> {
        let root = tempfile::tempdir()?;
        let ctx = ExperimentContext::init(root.path(), cpu_config(), Box::new(LogSink::new("unit")))?;

        assert!(ctx.dir().ends_with("unit"));
        let params: Value = serde_json::from_str(&std::fs::read_to_string(ctx.params_path())?)?;
        assert_eq!(params["seed"], Value::from(42));
        assert_eq!(params["dataset"], Value::from("c10"));
        assert!(ctx.device().is_cpu());

        ctx.shutdown()
    }

    #[test]
    fn test_invalid_config_fails_before_writing() -> crate::Result<()> {
        let root = tempfile::tempdir()?;
        let mut config = cpu_config();
        config.model.patch_size = 5;

        let result = ExperimentContext::init(root.path(), config, Box::new(LogSink::new("unit")));
        assert!(matches!(result, Err(MixerError::Config(_))));
        assert!(!root.path().join("unit").exists());

        Ok(())
    }

    #[test]
    fn test_sink_failure_is_not_fatal() -> crate::Result<()> {
        let root = tempfile::tempdir()?;
        let mut ctx = ExperimentContext::init(root.path(), cpu_config(), Box::new(FailingSink))?;

        ctx.log_metrics(1, &[("train_loss", 1.0)]);
        ctx.shutdown()
    }

    #[test]
    fn test_jsonl_sink_rows() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("telemetry.jsonl");
        let mut sink = JsonlSink::create(&path)?;

        sink.log_metrics(1, &[("lr", 0.5), ("train_loss", 2.0)])?;
        sink.log_metrics(2, &[("lr", 0.25)])?;
        sink.finish()?;

        let text = std::fs::read_to_string(&path)?;
        let rows: Vec<Value> = text
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["step"], Value::from(1));
        assert_eq!(rows[0]["train_loss"], Value::from(2.0));
        assert_eq!(rows[1]["lr"], Value::from(0.25));

        Ok(())
    }

    #[test]
    fn test_seeded_rng_is_reproducible() -> crate::Result<()> {
        use rand::Rng;

        let root = tempfile::tempdir()?;
        let mut a = ExperimentContext::init(root.path(), cpu_config(), Box::new(LogSink::new("a")))?;
        let mut b = ExperimentContext::init(root.path(), cpu_config(), Box::new(LogSink::new("b")))?;
        assert_eq!(a.rng().gen::<u64>(), b.rng().gen::<u64>());

        Ok(())
    }
}
