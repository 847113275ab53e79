use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointDir, NetworkName, LATEST};
use crate::config::TrainingConfig;
use crate::dataset::{fit_to_generator, image_to_tensor, save_tensor_as_image, ImageFolder, Transform};
use crate::error::Result;
use crate::networks::ResnetGenerator;

#[derive(Debug, Clone)]
pub struct TestOptions {
    pub input_dir: PathBuf,
    pub results_dir: PathBuf,
    pub which_epoch: String,
    /// Run G_B (clear -> smoky) instead of G_A.
    pub reverse: bool,
    /// Keep each image's own size, rounded down to a multiple of 4, instead of
    /// resizing to `crop_size`.
    pub keep_size: bool,
    pub num_test: Option<usize>,
}

impl TestOptions {
    pub fn new(input_dir: impl Into<PathBuf>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            results_dir: results_dir.into(),
            which_epoch: LATEST.to_string(),
            reverse: false,
            keep_size: false,
            num_test: None,
        }
    }

    /// `<results_dir>/<name>/test_<epoch>/images`
    pub fn image_dir(&self, config: &TrainingConfig) -> PathBuf {
        self.results_dir
            .join(&config.name)
            .join(format!("test_{}", self.which_epoch))
            .join("images")
    }
}

/// One trained generator, run without gradients.
pub struct Desmoker<B: Backend> {
    generator: ResnetGenerator<B>,
    input_nc: usize,
}

impl<B: Backend> Desmoker<B> {
    pub fn load(config: &TrainingConfig, which_epoch: &str, reverse: bool, device: &B::Device) -> Result<Self> {
        let (network, generator_config, input_nc) = if reverse {
            (NetworkName::GB, config.generator_b(), config.output_nc)
        } else {
            (NetworkName::GA, config.generator_a(), config.input_nc)
        };
        let generator = CheckpointDir::for_experiment(config).load(
            generator_config.init::<B>(device),
            which_epoch,
            network,
            device,
        )?;
        Ok(Self { generator, input_nc })
    }

    pub fn input_nc(&self) -> usize {
        self.input_nc
    }

    pub fn test(&self, real: Tensor<B, 4>) -> Tensor<B, 4> {
        self.generator.forward(real)
    }
}

/// Translates every image of `options.input_dir` and writes `<stem>_real.png`
/// and `<stem>_fake.png` pairs. Returns the paths of the fakes.
pub fn translate_folder<B: Backend>(
    config: &TrainingConfig,
    options: &TestOptions,
    device: &B::Device,
) -> Result<Vec<PathBuf>> {
    let desmoker = Desmoker::<B>::load(config, &options.which_epoch, options.reverse, device)?;
    let folder = ImageFolder::directory(&options.input_dir)?;
    let transform = Transform::test(config, desmoker.input_nc());
    let mut rng = StdRng::seed_from_u64(config.seed);
    let out_dir = options.image_dir(config);

    let count = options.num_test.map_or(folder.size, |n| n.min(folder.size));
    let mut outputs = Vec::with_capacity(count);
    for path in folder.image_paths.iter().take(count) {
        let img = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let img = if options.keep_size {
            match fit_to_generator(img) {
                Ok(img) => img,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            }
        } else {
            transform.apply(img, &mut rng)
        };
        let real = image_to_tensor::<B>(&img, desmoker.input_nc(), device);
        let fake = desmoker.test(real.clone());

        let stem = file_stem(path);
        save_tensor_as_image(real, &out_dir.join(format!("{stem}_real.png")))?;
        let fake_path = out_dir.join(format!("{stem}_fake.png"));
        save_tensor_as_image(fake, &fake_path)?;
        info!("processing {}", path.display());
        outputs.push(fake_path);
    }

    info!("Wrote {} results to {}", outputs.len(), out_dir.display());
    Ok(outputs)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::{scratch_dir, write_solid};
    use image::{GenericImageView, RgbImage};

    type TestBackend = burn::backend::NdArray<f32>;

    fn trained_experiment(root: &Path) -> TrainingConfig {
        let config = TrainingConfig::new("infer".into(), root.join("checkpoints").to_string_lossy().into_owned())
            .with_ngf(4)
            .with_n_blocks(1)
            .with_load_size(16)
            .with_crop_size(16);
        let device = Default::default();
        let dir = CheckpointDir::for_experiment(&config);
        dir.save(&config.generator_a().init::<TestBackend>(&device), LATEST, NetworkName::GA)
            .unwrap();
        dir.save(&config.generator_b().init::<TestBackend>(&device), LATEST, NetworkName::GB)
            .unwrap();
        config
    }

    #[test]
    fn translates_every_image_to_crop_size() {
        let root = scratch_dir("inference");
        let config = trained_experiment(&root);
        let input = root.join("smoky");
        std::fs::create_dir_all(&input).unwrap();
        write_solid(&input.join("a.png"), 24, [180, 170, 160]);
        write_solid(&input.join("b.jpg"), 20, [90, 40, 30]);

        let options = TestOptions::new(&input, root.join("results"));
        let outputs = translate_folder::<TestBackend>(&config, &options, &Default::default()).unwrap();

        assert_eq!(outputs.len(), 2);
        let image_dir = options.image_dir(&config);
        assert_eq!(outputs[0], image_dir.join("a_fake.png"));
        assert!(image_dir.join("b_real.png").exists());
        assert_eq!(image::open(&outputs[1]).unwrap().dimensions(), (16, 16));
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn keep_size_rounds_to_multiples_of_four() {
        let root = scratch_dir("inference-keep");
        let config = trained_experiment(&root);
        let input = root.join("clear");
        std::fs::create_dir_all(&input).unwrap();
        RgbImage::from_pixel(22, 17, image::Rgb([10, 20, 30]))
            .save(input.join("wide.png"))
            .unwrap();

        let mut options = TestOptions::new(&input, root.join("results"));
        options.keep_size = true;
        options.reverse = true;
        let outputs = translate_folder::<TestBackend>(&config, &options, &Default::default()).unwrap();

        assert_eq!(image::open(&outputs[0]).unwrap().dimensions(), (20, 16));
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn keep_size_skips_images_too_small_for_the_generator() {
        let root = scratch_dir("inference-tiny");
        let config = trained_experiment(&root);
        let input = root.join("smoky");
        std::fs::create_dir_all(&input).unwrap();
        write_solid(&input.join("thumb.png"), 6, [120, 110, 100]);
        write_solid(&input.join("frame.png"), 12, [120, 110, 100]);

        let mut options = TestOptions::new(&input, root.join("results"));
        options.keep_size = true;
        let outputs = translate_folder::<TestBackend>(&config, &options, &Default::default()).unwrap();

        assert_eq!(outputs, vec![options.image_dir(&config).join("frame_fake.png")]);
        assert_eq!(image::open(&outputs[0]).unwrap().dimensions(), (12, 12));
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn num_test_limits_the_output() {
        let root = scratch_dir("inference-limit");
        let config = trained_experiment(&root);
        let input = root.join("smoky");
        std::fs::create_dir_all(&input).unwrap();
        for i in 0..3 {
            write_solid(&input.join(format!("{i}.png")), 16, [100, 100, 100]);
        }

        let mut options = TestOptions::new(&input, root.join("results"));
        options.num_test = Some(1);
        let outputs = translate_folder::<TestBackend>(&config, &options, &Default::default()).unwrap();
        assert_eq!(outputs.len(), 1);
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        let root = scratch_dir("inference-missing");
        let config = TrainingConfig::new("none".into(), root.to_string_lossy().into_owned());
        let result = Desmoker::<TestBackend>::load(&config, LATEST, false, &Default::default());
        assert!(result.is_err());
        std::fs::remove_dir_all(root).ok();
    }
}
