/// Train a small MLP-Mixer on random CIFAR-shaped data
///
/// Exercises the whole pipeline (mixing, loss scaling, warmup + cosine
/// schedule, snapshots, metrics CSV) without a real dataset.
use candle_core::{Device, Tensor};
use mlp_mixer::data::{BatchDataLoader, NpyImageDataset, TensorDataLoader};
use mlp_mixer::training::{ExperimentContext, JsonlSink, Trainer, TrainingConfig};
use mlp_mixer::{Dataset, ExperimentConfig, MixerConfig};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("=== MLP-Mixer - synthetic training run ===");

    let output = std::env::var("MIXER_OUTPUT").unwrap_or_else(|_| "out".to_string());
    let config = ExperimentConfig {
        experiment: "synthetic".to_string(),
        dataset: Dataset::C10,
        batch_size: 32,
        eval_batch_size: 64,
        model: MixerConfig {
            hidden_size: 64,
            hidden_s: 32,
            hidden_c: 128,
            num_layers: 2,
            ..MixerConfig::for_dataset(Dataset::C10)
        },
        training: TrainingConfig {
            epochs: 3,
            warmup_epoch: 1,
            cutmix_prob: 0.5,
            clip_grad: 1.0,
            ..Default::default()
        },
        ..Default::default()
    };

    std::fs::create_dir_all(&output)?;
    let sink = JsonlSink::create(std::path::Path::new(&output).join("telemetry.jsonl"))?;
    let mut ctx = ExperimentContext::init(&output, config, Box::new(sink))?;

    // A prepared split can be used instead: MIXER_DATA=<dir with train_/valid_ .npy files>
    let (mut train, mut valid) = match std::env::var("MIXER_DATA") {
        Ok(dir) => {
            let train = NpyImageDataset::from_directory(&dir, "train")?;
            let valid = NpyImageDataset::from_directory(&dir, "valid")?;
            let seed = ctx.config().seed;
            (
                train.into_loader(ctx.config().batch_size, true, seed)?,
                valid.into_loader(ctx.config().eval_batch_size, false, seed)?,
            )
        }
        Err(_) => synthetic_loaders(ctx.config())?,
    };

    log::info!(
        "Train: {} samples in {} batches, valid: {} samples",
        train.num_samples(),
        train.num_batches(),
        valid.num_samples()
    );

    let mut trainer = Trainer::from_context(&mut ctx)?;
    log::info!(
        "Parameters: {}",
        mlp_mixer::utils::count_varmap_parameters(trainer.varmap())
    );

    let records = trainer.fit(&mut ctx, &mut train, &mut valid)?;
    if let Some(last) = records.last() {
        log::info!(
            "Final epoch {}: valid_loss={:.4} valid_acc={:.4}",
            last.epoch,
            last.valid_loss,
            last.valid_acc
        );
    }
    log::info!("Artifacts in {:?}", ctx.dir());

    ctx.shutdown()?;
    Ok(())
}

fn synthetic_loaders(config: &ExperimentConfig) -> anyhow::Result<(TensorDataLoader, TensorDataLoader)> {
    let device = Device::Cpu;
    let size = config.dataset.img_size();
    let channels = config.dataset.in_channels();
    let classes = config.dataset.num_classes() as u32;

    let make = |n: usize| -> anyhow::Result<(Tensor, Tensor)> {
        let images = Tensor::randn(0f32, 1.0, (n, channels, size, size), &device)?;
        let labels: Vec<u32> = (0..n as u32).map(|i| i % classes).collect();
        Ok((images, Tensor::from_vec(labels, n, &device)?))
    };

    let (train_x, train_y) = make(256)?;
    let (valid_x, valid_y) = make(128)?;
    Ok((
        TensorDataLoader::new(train_x, train_y, config.batch_size, true, config.seed)?,
        TensorDataLoader::new(valid_x, valid_y, config.eval_batch_size, false, config.seed)?,
    ))
}
