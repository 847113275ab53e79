use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::nn::Initializer;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::DesmokeError;
use crate::networks::{NLayerDiscriminatorConfig, ResnetGeneratorConfig, GENERATOR_MIN_SIZE};

pub const CONFIG_FILE: &str = "config.json";

/// Adversarial objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GanMode {
    /// Least-squares GAN, MSE against 1.0 / 0.0 targets.
    Lsgan,
    /// Original GAN, binary cross-entropy on logits.
    Vanilla,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InitType {
    Normal,
    Xavier,
    Kaiming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LrPolicy {
    /// Constant for `n_epochs`, then linear decay to zero over `n_epochs_decay`.
    Linear,
    /// Multiply by `lr_gamma` every `lr_decay_iters` epochs.
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Direction {
    #[value(name = "AtoB")]
    AtoB,
    #[value(name = "BtoA")]
    BtoA,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FeatureCriterion {
    L1,
    Mse,
}

/// Every flag of a desmoking experiment. Saved as JSON next to the checkpoints
/// so `test` and `params` can rebuild the same architectures.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub name: String,
    pub checkpoints_dir: String,

    #[config(default = 3)]
    pub input_nc: usize,
    #[config(default = 3)]
    pub output_nc: usize,
    #[config(default = 64)]
    pub ngf: usize,
    #[config(default = 64)]
    pub ndf: usize,
    #[config(default = 9)]
    pub n_blocks: usize,
    #[config(default = 3)]
    pub n_layers_d: usize,
    #[config(default = false)]
    pub use_dropout: bool,
    #[config(default = "InitType::Normal")]
    pub init_type: InitType,
    #[config(default = 0.02)]
    pub init_gain: f64,

    #[config(default = "GanMode::Lsgan")]
    pub gan_mode: GanMode,
    #[config(default = 10.0)]
    pub lambda_a: f64,
    #[config(default = 10.0)]
    pub lambda_b: f64,
    #[config(default = 0.5)]
    pub lambda_identity: f64,
    #[config(default = 5.0)]
    pub lambda_perceptual: f64,
    #[config(default = "FeatureCriterion::L1")]
    pub perceptual_criterion: FeatureCriterion,
    #[config(default = 1.0)]
    pub lambda_ic: f64,
    #[config(default = 1.0)]
    pub lambda_dc: f64,
    #[config(default = 0.0)]
    pub lambda_edge: f64,
    #[config(default = 0.0)]
    pub lambda_spatial: f64,
    #[config(default = 15)]
    pub dark_channel_patch: usize,

    #[config(default = 50)]
    pub pool_size: usize,
    #[config(default = 0.0002)]
    pub lr: f64,
    #[config(default = 0.5)]
    pub beta1: f64,
    #[config(default = "LrPolicy::Linear")]
    pub lr_policy: LrPolicy,
    #[config(default = 50)]
    pub lr_decay_iters: usize,
    #[config(default = 0.1)]
    pub lr_gamma: f64,
    #[config(default = 100)]
    pub n_epochs: usize,
    #[config(default = 100)]
    pub n_epochs_decay: usize,
    #[config(default = 1)]
    pub epoch_count: usize,

    #[config(default = 1)]
    pub batch_size: usize,
    #[config(default = 286)]
    pub load_size: u32,
    #[config(default = 256)]
    pub crop_size: u32,
    #[config(default = false)]
    pub no_flip: bool,
    #[config(default = false)]
    pub serial_batches: bool,
    #[config(default = "Direction::AtoB")]
    pub direction: Direction,

    #[config(default = 100)]
    pub print_freq: usize,
    #[config(default = 400)]
    pub display_freq: usize,
    #[config(default = 5000)]
    pub save_latest_freq: usize,
    #[config(default = 5)]
    pub save_epoch_freq: usize,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    /// Rejects option combinations the networks or losses cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.lambda_identity > 0.0 && self.input_nc != self.output_nc {
            return Err(DesmokeError::Config(format!(
                "identity loss needs input_nc == output_nc (got {} and {})",
                self.input_nc, self.output_nc
            )));
        }
        for (label, channels) in [("input_nc", self.input_nc), ("output_nc", self.output_nc)] {
            if channels != 1 && channels != 3 {
                return Err(DesmokeError::Config(format!(
                    "{label} must be 1 or 3, got {channels}"
                )));
            }
        }
        if self.crop_size > self.load_size {
            return Err(DesmokeError::Config(format!(
                "crop_size {} is larger than load_size {}",
                self.crop_size, self.load_size
            )));
        }
        if self.crop_size == 0 || self.crop_size % 4 != 0 {
            return Err(DesmokeError::Config(format!(
                "crop_size must be a positive multiple of 4, got {}",
                self.crop_size
            )));
        }
        let min_crop = self.discriminator_a().min_input_size().max(GENERATOR_MIN_SIZE);
        if (self.crop_size as usize) < min_crop {
            return Err(DesmokeError::Config(format!(
                "crop_size {} is too small for a {}-layer discriminator (minimum {})",
                self.crop_size, self.n_layers_d, min_crop
            )));
        }
        if self.dark_channel_patch % 2 == 0 {
            return Err(DesmokeError::Config(format!(
                "dark_channel_patch must be odd, got {}",
                self.dark_channel_patch
            )));
        }
        if self.batch_size == 0 {
            return Err(DesmokeError::Config("batch_size must be at least 1".into()));
        }
        if self.n_layers_d == 0 {
            return Err(DesmokeError::Config("n_layers_d must be at least 1".into()));
        }
        if self.lr_policy == LrPolicy::Step && self.lr_decay_iters == 0 {
            return Err(DesmokeError::Config(
                "lr_decay_iters must be at least 1 for the step policy".into(),
            ));
        }
        if self.epoch_count == 0 {
            return Err(DesmokeError::Config("epoch_count starts at 1".into()));
        }
        Ok(())
    }

    pub fn experiment_dir(&self) -> PathBuf {
        Path::new(&self.checkpoints_dir).join(&self.name)
    }

    /// Last epoch of the run, inclusive.
    pub fn last_epoch(&self) -> usize {
        self.n_epochs + self.n_epochs_decay
    }

    pub fn initializer(&self) -> Initializer {
        match self.init_type {
            InitType::Normal => Initializer::Normal {
                mean: 0.0,
                std: self.init_gain,
            },
            InitType::Xavier => Initializer::XavierNormal {
                gain: self.init_gain,
            },
            InitType::Kaiming => Initializer::KaimingNormal {
                gain: std::f64::consts::SQRT_2,
                fan_out_only: false,
            },
        }
    }

    /// G_A: A -> B.
    pub fn generator_a(&self) -> ResnetGeneratorConfig {
        self.generator(self.input_nc, self.output_nc)
    }

    /// G_B: B -> A.
    pub fn generator_b(&self) -> ResnetGeneratorConfig {
        self.generator(self.output_nc, self.input_nc)
    }

    /// D_A judges domain B images.
    pub fn discriminator_a(&self) -> NLayerDiscriminatorConfig {
        self.discriminator(self.output_nc)
    }

    /// D_B judges domain A images.
    pub fn discriminator_b(&self) -> NLayerDiscriminatorConfig {
        self.discriminator(self.input_nc)
    }

    fn generator(&self, input_nc: usize, output_nc: usize) -> ResnetGeneratorConfig {
        ResnetGeneratorConfig::new(input_nc, output_nc)
            .with_ngf(self.ngf)
            .with_n_blocks(self.n_blocks)
            .with_use_dropout(self.use_dropout)
            .with_initializer(self.initializer())
    }

    fn discriminator(&self, input_nc: usize) -> NLayerDiscriminatorConfig {
        NLayerDiscriminatorConfig::new(input_nc)
            .with_ndf(self.ndf)
            .with_n_layers(self.n_layers_d)
            .with_initializer(self.initializer())
    }

    pub fn save_to_experiment(&self) -> crate::error::Result<PathBuf> {
        let dir = self.experiment_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(CONFIG_FILE);
        self.save(&path)?;
        Ok(path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let path = path.as_ref();
        Self::load(path).map_err(|e| DesmokeError::ConfigFile {
            path: path.to_path_buf(),
            reason: format!("{e:?}"),
        })
    }

    pub fn load_from_experiment(checkpoints_dir: &str, name: &str) -> crate::error::Result<Self> {
        Self::load_from(Path::new(checkpoints_dir).join(name).join(CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrainingConfig {
        TrainingConfig::new("unit".to_string(), "checkpoints".to_string())
    }

    #[test]
    fn defaults_follow_cyclegan() {
        let config = config();
        assert_eq!(config.lambda_a, 10.0);
        assert_eq!(config.lambda_b, 10.0);
        assert_eq!(config.lambda_identity, 0.5);
        assert_eq!(config.pool_size, 50);
        assert_eq!(config.gan_mode, GanMode::Lsgan);
        assert_eq!(config.last_epoch(), 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn identity_loss_needs_matching_channels() {
        let config = config().with_output_nc(1);
        assert!(matches!(config.validate(), Err(DesmokeError::Config(_))));
        let config = config.with_lambda_identity(0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn crop_must_fit_and_divide_by_four() {
        assert!(config().with_crop_size(300).validate().is_err());
        assert!(config().with_crop_size(254).validate().is_err());
        assert!(config().with_load_size(64).with_crop_size(64).validate().is_ok());
    }

    #[test]
    fn crop_must_leave_the_discriminator_a_patch() {
        let small = config().with_load_size(16).with_crop_size(16);
        assert!(small.clone().validate().is_err());
        assert!(small.clone().with_n_layers_d(2).validate().is_ok());
        assert!(config().with_load_size(24).with_crop_size(24).validate().is_ok());
        assert!(config().with_load_size(20).with_crop_size(20).validate().is_err());
    }

    #[test]
    fn crop_must_leave_the_generator_a_bottleneck() {
        let tiny = config().with_n_layers_d(1).with_load_size(8);
        assert!(tiny.clone().with_crop_size(8).validate().is_ok());
        assert!(tiny.with_crop_size(4).validate().is_err());
    }

    #[test]
    fn even_dark_channel_patch_is_rejected() {
        assert!(config().with_dark_channel_patch(14).validate().is_err());
    }

    #[test]
    fn config_survives_a_save_and_load() {
        let dir = std::env::temp_dir().join(format!("desmoke-config-{}", std::process::id()));
        let config = TrainingConfig::new("unit".to_string(), dir.to_string_lossy().into_owned())
            .with_gan_mode(GanMode::Vanilla)
            .with_direction(Direction::BtoA)
            .with_ngf(8);
        let path = config.save_to_experiment().unwrap();
        let loaded = TrainingConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gan_mode, GanMode::Vanilla);
        assert_eq!(loaded.direction, Direction::BtoA);
        assert_eq!(loaded.ngf, 8);
        std::fs::remove_dir_all(dir).ok();
    }
}
