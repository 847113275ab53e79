use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use desmoke_gan::checkpoint::{count_generator_parameters, NetworkName, LATEST};
use desmoke_gan::config::{
    Direction, FeatureCriterion, GanMode, InitType, LrPolicy, TrainingConfig,
};
use desmoke_gan::inference::{translate_folder, TestOptions};
use desmoke_gan::stats::folder_report;
use desmoke_gan::train::{train, TrainOptions};

#[derive(Parser, Debug)]
#[command(name = "desmoke", version, about = "CycleGAN image desmoking")]
struct Cli {
    /// -v for debug, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train G_A, G_B, D_A and D_B on `<dataroot>/trainA` and `<dataroot>/trainB`
    Train(TrainArgs),
    /// Translate a folder of images with a trained generator
    Test(TestArgs),
    /// Mean Hue and mean a* of every image in a folder
    Stats(StatsArgs),
    /// Count the parameters of a saved generator
    Params(ParamsArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Wgpu,
    Ndarray,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GeneratorArg {
    #[value(name = "G_A")]
    GA,
    #[value(name = "G_B")]
    GB,
}

impl From<GeneratorArg> for NetworkName {
    fn from(arg: GeneratorArg) -> Self {
        match arg {
            GeneratorArg::GA => NetworkName::GA,
            GeneratorArg::GB => NetworkName::GB,
        }
    }
}

#[derive(Args, Debug)]
struct ExperimentArgs {
    #[arg(long, default_value = "desmoke")]
    name: String,
    #[arg(long, default_value = "checkpoints")]
    checkpoints_dir: String,
    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu)]
    backend: BackendKind,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long)]
    dataroot: PathBuf,
    #[command(flatten)]
    experiment: ExperimentArgs,
    /// Start from a saved config.json; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    continue_train: bool,
    #[arg(long, default_value = LATEST)]
    which_epoch: String,
    /// torchvision vgg19 state dict (.pth) for the perceptual loss
    #[arg(long)]
    vgg_weights: Option<PathBuf>,
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Args, Debug)]
struct ConfigOverrides {
    #[arg(long)]
    input_nc: Option<usize>,
    #[arg(long)]
    output_nc: Option<usize>,
    #[arg(long)]
    ngf: Option<usize>,
    #[arg(long)]
    ndf: Option<usize>,
    #[arg(long)]
    n_blocks: Option<usize>,
    #[arg(long)]
    n_layers_d: Option<usize>,
    /// Boolean flags take an optional value; `--use-dropout=false` clears a loaded config.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    use_dropout: Option<bool>,
    #[arg(long, value_enum)]
    init_type: Option<InitType>,
    #[arg(long)]
    init_gain: Option<f64>,
    #[arg(long, value_enum)]
    gan_mode: Option<GanMode>,
    #[arg(long)]
    lambda_a: Option<f64>,
    #[arg(long)]
    lambda_b: Option<f64>,
    #[arg(long)]
    lambda_identity: Option<f64>,
    #[arg(long)]
    lambda_perceptual: Option<f64>,
    #[arg(long, value_enum)]
    perceptual_criterion: Option<FeatureCriterion>,
    #[arg(long)]
    lambda_ic: Option<f64>,
    #[arg(long)]
    lambda_dc: Option<f64>,
    #[arg(long)]
    lambda_edge: Option<f64>,
    #[arg(long)]
    lambda_spatial: Option<f64>,
    #[arg(long)]
    dark_channel_patch: Option<usize>,
    #[arg(long)]
    pool_size: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    beta1: Option<f64>,
    #[arg(long, value_enum)]
    lr_policy: Option<LrPolicy>,
    #[arg(long)]
    lr_gamma: Option<f64>,
    #[arg(long)]
    lr_decay_iters: Option<usize>,
    #[arg(long)]
    n_epochs: Option<usize>,
    #[arg(long)]
    n_epochs_decay: Option<usize>,
    #[arg(long)]
    epoch_count: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    load_size: Option<u32>,
    #[arg(long)]
    crop_size: Option<u32>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    no_flip: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    serial_batches: Option<bool>,
    #[arg(long, value_enum)]
    direction: Option<Direction>,
    #[arg(long)]
    print_freq: Option<usize>,
    #[arg(long)]
    display_freq: Option<usize>,
    #[arg(long)]
    save_latest_freq: Option<usize>,
    #[arg(long)]
    save_epoch_freq: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
}

impl ConfigOverrides {
    fn apply(self, mut config: TrainingConfig) -> TrainingConfig {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field {
                    config.$field = value;
                })*
            };
        }
        set!(
            input_nc, output_nc, ngf, ndf, n_blocks, n_layers_d, init_type, init_gain, gan_mode,
            lambda_a, lambda_b, lambda_identity, lambda_perceptual, perceptual_criterion, lambda_ic,
            lambda_dc, lambda_edge, lambda_spatial, dark_channel_patch, pool_size, lr, beta1,
            lr_policy, lr_gamma, lr_decay_iters, n_epochs, n_epochs_decay, epoch_count, batch_size,
            load_size, crop_size, direction, print_freq, display_freq, save_latest_freq,
            save_epoch_freq, seed, use_dropout, no_flip, serial_batches,
        );
        config
    }
}

#[derive(Args, Debug)]
struct TestArgs {
    /// Folder of images to translate
    #[arg(long)]
    input_dir: PathBuf,
    #[command(flatten)]
    experiment: ExperimentArgs,
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,
    #[arg(long, default_value = LATEST)]
    which_epoch: String,
    /// Use G_B (clear to smoky) instead of G_A
    #[arg(long)]
    reverse: bool,
    /// Keep each image's size instead of resizing to crop_size
    #[arg(long)]
    keep_size: bool,
    #[arg(long)]
    num_test: Option<usize>,
}

#[derive(Args, Debug)]
struct StatsArgs {
    folder: PathBuf,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
    /// Also report the mean dark channel
    #[arg(long)]
    dark_channel: bool,
    #[arg(long, default_value_t = 15)]
    patch: usize,
}

#[derive(Args, Debug)]
struct ParamsArgs {
    #[arg(long, default_value = "desmoke")]
    name: String,
    #[arg(long, default_value = "checkpoints")]
    checkpoints_dir: String,
    #[arg(long, default_value = LATEST)]
    which_epoch: String,
    #[arg(long, value_enum, default_value_t = GeneratorArg::GA)]
    network: GeneratorArg,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Command::Train(args) => run_train(args),
        Command::Test(args) => run_test(args),
        Command::Stats(args) => run_stats(args),
        Command::Params(args) => run_params(args),
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let base = match &args.config {
        Some(path) => {
            let mut config = TrainingConfig::load_from(path)
                .with_context(|| format!("reading {}", path.display()))?;
            config.name = args.experiment.name.clone();
            config.checkpoints_dir = args.experiment.checkpoints_dir.clone();
            config
        }
        None => TrainingConfig::new(
            args.experiment.name.clone(),
            args.experiment.checkpoints_dir.clone(),
        ),
    };
    let config = args.overrides.apply(base);
    config.validate().context("invalid training options")?;

    let options = TrainOptions {
        dataroot: args.dataroot,
        continue_train: args.continue_train,
        which_epoch: args.which_epoch,
        vgg_weights: args.vgg_weights,
    };

    let summary = match args.experiment.backend {
        BackendKind::Wgpu => {
            let device = WgpuDevice::default();
            info!("Using device: {:?}", device);
            train::<Autodiff<Wgpu>>(&config, &options, &device)
        }
        BackendKind::Ndarray => train::<Autodiff<NdArray>>(&config, &options, &NdArrayDevice::Cpu),
    }
    .context("training failed")?;

    info!(
        "Training complete: {} epochs, {} images, final mean losses: {}",
        summary.epochs, summary.total_iters, summary.last_epoch_losses
    );
    Ok(())
}

fn run_test(args: TestArgs) -> Result<()> {
    let experiment = &args.experiment;
    let config = TrainingConfig::load_from_experiment(&experiment.checkpoints_dir, &experiment.name)
        .context("loading the training config of the experiment")?;

    let options = TestOptions {
        input_dir: args.input_dir,
        results_dir: args.results_dir,
        which_epoch: args.which_epoch,
        reverse: args.reverse,
        keep_size: args.keep_size,
        num_test: args.num_test,
    };

    let outputs = match experiment.backend {
        BackendKind::Wgpu => translate_folder::<Wgpu>(&config, &options, &WgpuDevice::default()),
        BackendKind::Ndarray => translate_folder::<NdArray>(&config, &options, &NdArrayDevice::Cpu),
    }
    .context("translating images")?;

    info!("Translated {} images", outputs.len());
    Ok(())
}

fn run_stats(args: StatsArgs) -> Result<()> {
    let patch = args.dark_channel.then_some(args.patch);
    let report = folder_report(&args.folder, patch)
        .with_context(|| format!("computing statistics for {}", args.folder.display()))?;

    if args.json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    println!("Folder Image Color Statistics:");
    for image in &report.images {
        println!("{image}");
    }
    println!();
    println!("{}", report.overall);
    Ok(())
}

fn run_params(args: ParamsArgs) -> Result<()> {
    let config = TrainingConfig::load_from_experiment(&args.checkpoints_dir, &args.name)
        .context("loading the training config of the experiment")?;
    let total = count_generator_parameters::<NdArray>(
        &config,
        &args.which_epoch,
        args.network.into(),
        &NdArrayDevice::Cpu,
    )
    .context("loading the generator checkpoint")?;
    println!("Total parameters: {total}");
    Ok(())
}
