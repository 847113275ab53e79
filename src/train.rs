use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::module::Module;
use burn::optim::AdamConfig;
use burn::tensor::backend::{AutodiffBackend, Backend};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointDir, LATEST};
use crate::config::TrainingConfig;
use crate::cycle_gan::{CycleGan, Discriminators, Generators, LossReport, Visuals};
use crate::dataset::{save_tensor_as_image, Phase, UnalignedDataset};
use crate::error::Result;
use crate::schedule::learning_rate;
use crate::vgg::{PerceptualLoss, Vgg19Features};

pub const LOSS_LOG_FILE: &str = "loss_log.txt";

#[derive(Debug, Clone)]
pub struct TrainOptions {
    /// Holds `trainA` and `trainB`.
    pub dataroot: PathBuf,
    pub continue_train: bool,
    pub which_epoch: String,
    /// torchvision `vgg19` state dict for the perceptual term.
    pub vgg_weights: Option<PathBuf>,
}

impl TrainOptions {
    pub fn new(dataroot: impl Into<PathBuf>) -> Self {
        Self {
            dataroot: dataroot.into(),
            continue_train: false,
            which_epoch: LATEST.to_string(),
            vgg_weights: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub epochs: usize,
    pub total_iters: usize,
    pub final_lr: f64,
    /// Mean losses of the last epoch.
    pub last_epoch_losses: LossReport,
}

/// Append-only text log of the periodic loss prints.
struct LossLog {
    file: File,
}

impl LossLog {
    fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOSS_LOG_FILE))?;
        writeln!(file, "================ Training Loss ================")?;
        Ok(Self { file })
    }

    fn write(&mut self, epoch: usize, iters: usize, time: f64, losses: &LossReport) -> Result<()> {
        let line = format!("(epoch: {epoch}, iters: {iters}, time: {time:.3}) {losses}");
        info!("{}", line);
        writeln!(self.file, "{line}")?;
        Ok(())
    }
}

/// True when a counter that just advanced by `step` passed a multiple of `freq`.
fn crossed(counter: usize, step: usize, freq: usize) -> bool {
    freq > 0 && counter / freq > counter.saturating_sub(step) / freq
}

fn perceptual_loss<B: Backend>(
    config: &TrainingConfig,
    weights: Option<&Path>,
    device: &B::Device,
) -> Result<Option<PerceptualLoss<B>>> {
    if config.lambda_perceptual <= 0.0 {
        return Ok(None);
    }
    match weights {
        Some(path) => {
            let vgg = Vgg19Features::from_torchvision(path, device)?;
            Ok(Some(PerceptualLoss::new(vgg, config.perceptual_criterion)))
        }
        None => {
            warn!(
                "lambda_perceptual is {} but no VGG-19 weights were given, perceptual loss disabled",
                config.lambda_perceptual
            );
            Ok(None)
        }
    }
}

fn save_visuals<B: Backend>(visuals: &Visuals<B>, dir: &Path, epoch: usize) -> Result<()> {
    for (name, image) in visuals.named() {
        save_tensor_as_image(image, &dir.join(format!("epoch{epoch:03}_{name}.png")))?;
    }
    debug!("Saved visuals for epoch {} to {}", epoch, dir.display());
    Ok(())
}

/// Trains both generator/discriminator pairs from `epoch_count` through
/// `n_epochs + n_epochs_decay`, writing checkpoints, loss log and visuals
/// under the experiment directory.
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    options: &TrainOptions,
    device: &B::Device,
) -> Result<TrainSummary> {
    config.validate()?;
    B::seed(config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let config_path = config.save_to_experiment()?;
    info!("Saved training config to {}", config_path.display());

    let dataset = UnalignedDataset::open(&options.dataroot, Phase::Train, config)?;
    info!(
        "Training on {} images per epoch ({} in A, {} in B)",
        dataset.len(),
        dataset.len_a(),
        dataset.len_b()
    );

    let checkpoints = CheckpointDir::for_experiment(config);
    let mut generators = Generators::<B>::new(config, device);
    let mut discriminators = Discriminators::<B>::new(config, device);
    if options.continue_train {
        info!("Resuming from epoch '{}'", options.which_epoch);
        generators = checkpoints.load_generators(generators, &options.which_epoch, device)?;
        discriminators = checkpoints.load_discriminators(discriminators, &options.which_epoch, device)?;
    }
    info!(
        "Parameters: G_A {} G_B {} D_A {} D_B {}",
        generators.g_a.num_params(),
        generators.g_b.num_params(),
        discriminators.d_a.num_params(),
        discriminators.d_b.num_params()
    );

    let perceptual = perceptual_loss::<B>(config, options.vgg_weights.as_deref(), device)?;
    let optim_g = AdamConfig::new()
        .with_beta_1(config.beta1 as f32)
        .with_beta_2(0.999)
        .init::<B, Generators<B>>();
    let optim_d = AdamConfig::new()
        .with_beta_1(config.beta1 as f32)
        .with_beta_2(0.999)
        .init::<B, Discriminators<B>>();
    let mut model = CycleGan::new(config, generators, discriminators, optim_g, optim_d, perceptual);

    let experiment_dir = config.experiment_dir();
    let image_dir = experiment_dir.join("web").join("images");
    let mut loss_log = LossLog::open(&experiment_dir)?;

    let mut lr = learning_rate(config, 0);
    info!("learning rate = {:.7}", lr);
    let mut total_iters = 0;
    let mut last_epoch_losses = LossReport::default();
    let mut epochs = 0;

    for epoch in config.epoch_count..=config.last_epoch() {
        let epoch_start = Instant::now();
        let mut epoch_iter = 0;
        let mut epoch_losses = LossReport::default();
        let mut steps = 0;

        let order = dataset.epoch_order(&mut rng);
        for indices in order.chunks(config.batch_size) {
            let iter_start = Instant::now();
            let (real_a, real_b) = dataset.get_batch::<B, _>(indices, &mut rng, device)?;
            let batch = indices.len();
            total_iters += batch;
            epoch_iter += batch;

            let (losses, visuals) = model.optimize_parameters(real_a, real_b, lr);
            epoch_losses.accumulate(&losses);
            steps += 1;

            if crossed(total_iters, batch, config.display_freq) {
                save_visuals(&visuals, &image_dir, epoch)?;
            }

            if crossed(total_iters, batch, config.print_freq) {
                let per_image = iter_start.elapsed().as_secs_f64() / batch as f64;
                loss_log.write(epoch, epoch_iter, per_image, &losses)?;
            }

            if crossed(total_iters, batch, config.save_latest_freq) {
                info!(
                    "saving the latest model (epoch {}, total_iters {})",
                    epoch, total_iters
                );
                checkpoints.save_networks(model.generators(), model.discriminators(), LATEST)?;
            }
        }

        if config.save_epoch_freq > 0 && epoch % config.save_epoch_freq == 0 {
            info!(
                "saving the model at the end of epoch {}, iters {}",
                epoch, total_iters
            );
            checkpoints.save_networks(model.generators(), model.discriminators(), LATEST)?;
            checkpoints.save_networks(
                model.generators(),
                model.discriminators(),
                &epoch.to_string(),
            )?;
        }

        epochs += 1;
        lr = learning_rate(config, epochs);
        if steps > 0 {
            last_epoch_losses = epoch_losses.scaled(1.0 / steps as f32);
        }
        info!(
            "End of epoch {} / {} \t Time Taken: {:.0} sec",
            epoch,
            config.last_epoch(),
            epoch_start.elapsed().as_secs_f64()
        );
        info!("mean losses: {}", last_epoch_losses);
        info!("learning rate = {:.7}", lr);
    }

    Ok(TrainSummary {
        epochs,
        total_iters,
        final_lr: lr,
        last_epoch_losses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::{scratch_dir, write_dataset};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_config(checkpoints_dir: &Path) -> TrainingConfig {
        TrainingConfig::new("run".into(), checkpoints_dir.to_string_lossy().into_owned())
            .with_ngf(4)
            .with_ndf(4)
            .with_n_blocks(1)
            .with_n_layers_d(2)
            .with_pool_size(2)
            .with_dark_channel_patch(3)
            .with_load_size(20)
            .with_crop_size(16)
            .with_n_epochs(1)
            .with_n_epochs_decay(1)
            .with_print_freq(1)
            .with_display_freq(2)
            .with_save_latest_freq(100)
            .with_save_epoch_freq(1)
    }

    #[test]
    fn crossed_detects_frequency_boundaries() {
        assert!(crossed(4, 1, 2));
        assert!(!crossed(3, 1, 2));
        assert!(crossed(5, 2, 4));
        assert!(!crossed(7, 2, 4));
        assert!(!crossed(10, 1, 0));
    }

    #[test]
    fn training_writes_checkpoints_logs_and_visuals() {
        let root = scratch_dir("train");
        write_dataset(&root, "train", 2, 3, 24);
        let config = tiny_config(&root.join("checkpoints"));
        let device = Default::default();

        let summary = train::<TestBackend>(&config, &TrainOptions::new(&root), &device).unwrap();

        assert_eq!(summary.epochs, 2);
        assert_eq!(summary.total_iters, 6);
        assert_eq!(summary.final_lr, 0.0);
        assert!(summary.last_epoch_losses.get("D_A").is_some());

        let experiment = config.experiment_dir();
        for file in ["config.json", "1_net_G_A.mpk", "2_net_D_B.mpk", "latest_net_G_B.mpk"] {
            assert!(experiment.join(file).exists(), "{file} missing");
        }
        assert!(experiment.join("web/images/epoch001_fake_B.png").exists());

        let log = fs::read_to_string(experiment.join(LOSS_LOG_FILE)).unwrap();
        assert!(log.contains("(epoch: 1, iters: 1, time: "));
        assert!(log.contains("D_A: "));
        assert_eq!(log.lines().filter(|l| l.starts_with("(epoch")).count(), 6);

        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn resuming_continues_from_a_saved_epoch() {
        let root = scratch_dir("train-resume");
        write_dataset(&root, "train", 2, 2, 24);
        let config = tiny_config(&root.join("checkpoints")).with_n_epochs_decay(0);
        let device = Default::default();
        train::<TestBackend>(&config, &TrainOptions::new(&root), &device).unwrap();

        let resumed = config.clone().with_epoch_count(2).with_n_epochs(2);
        let mut options = TrainOptions::new(&root);
        options.continue_train = true;
        options.which_epoch = "1".into();
        let summary = train::<TestBackend>(&resumed, &options, &device).unwrap();

        assert_eq!(summary.epochs, 1);
        assert!(resumed.experiment_dir().join("2_net_G_A.mpk").exists());
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn missing_dataset_is_reported() {
        let root = scratch_dir("train-missing");
        let config = tiny_config(&root.join("checkpoints"));
        let result = train::<TestBackend>(&config, &TrainOptions::new(root.join("nowhere")), &Default::default());
        assert!(result.is_err());
        fs::remove_dir_all(root).ok();
    }
}
