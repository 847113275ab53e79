use std::fmt;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::Backend;
use tracing::info;

use crate::config::TrainingConfig;
use crate::cycle_gan::{Discriminators, Generators};
use crate::error::Result;

pub const LATEST: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkName {
    GA,
    GB,
    DA,
    DB,
}

impl NetworkName {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkName::GA => "G_A",
            NetworkName::GB => "G_B",
            NetworkName::DA => "D_A",
            NetworkName::DB => "D_B",
        }
    }
}

impl fmt::Display for NetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<checkpoints_dir>/<name>/<epoch>_net_<network>.mpk`
#[derive(Debug, Clone)]
pub struct CheckpointDir {
    root: PathBuf,
}

impl CheckpointDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_experiment(config: &TrainingConfig) -> Self {
        Self::new(config.experiment_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Without extension; the recorder appends `.mpk`.
    pub fn network_path(&self, epoch: &str, network: NetworkName) -> PathBuf {
        self.root.join(format!("{epoch}_net_{network}"))
    }

    pub fn save<B: Backend, M: Module<B>>(&self, module: &M, epoch: &str, network: NetworkName) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.network_path(epoch, network);
        CompactRecorder::new().record(module.clone().into_record(), path.clone())?;
        info!("Saved {} to {}", network, path.display());
        Ok(())
    }

    pub fn load<B: Backend, M: Module<B>>(
        &self,
        module: M,
        epoch: &str,
        network: NetworkName,
        device: &B::Device,
    ) -> Result<M> {
        let path = self.network_path(epoch, network);
        let record = CompactRecorder::new().load(path.clone(), device)?;
        info!("Loaded {} from {}", network, path.display());
        Ok(module.load_record(record))
    }

    pub fn save_networks<B: Backend>(
        &self,
        generators: &Generators<B>,
        discriminators: &Discriminators<B>,
        epoch: &str,
    ) -> Result<()> {
        self.save(&generators.g_a, epoch, NetworkName::GA)?;
        self.save(&generators.g_b, epoch, NetworkName::GB)?;
        self.save(&discriminators.d_a, epoch, NetworkName::DA)?;
        self.save(&discriminators.d_b, epoch, NetworkName::DB)?;
        Ok(())
    }

    pub fn load_generators<B: Backend>(
        &self,
        generators: Generators<B>,
        epoch: &str,
        device: &B::Device,
    ) -> Result<Generators<B>> {
        Ok(Generators {
            g_a: self.load(generators.g_a, epoch, NetworkName::GA, device)?,
            g_b: self.load(generators.g_b, epoch, NetworkName::GB, device)?,
        })
    }

    pub fn load_discriminators<B: Backend>(
        &self,
        discriminators: Discriminators<B>,
        epoch: &str,
        device: &B::Device,
    ) -> Result<Discriminators<B>> {
        Ok(Discriminators {
            d_a: self.load(discriminators.d_a, epoch, NetworkName::DA, device)?,
            d_b: self.load(discriminators.d_b, epoch, NetworkName::DB, device)?,
        })
    }
}

/// Total number of scalar parameters.
pub fn count_parameters<B: Backend, M: Module<B>>(module: &M) -> usize {
    module.num_params()
}

/// Loads one generator of a finished experiment and counts its parameters.
pub fn count_generator_parameters<B: Backend>(
    config: &TrainingConfig,
    epoch: &str,
    network: NetworkName,
    device: &B::Device,
) -> Result<usize> {
    let dir = CheckpointDir::for_experiment(config);
    let generator = match network {
        NetworkName::GB => config.generator_b().init::<B>(device),
        _ => config.generator_a().init::<B>(device),
    };
    let generator = dir.load(generator, epoch, network, device)?;
    Ok(count_parameters(&generator))
}
