//! Frozen VGG-19 feature extractor for the perceptual loss.
//!
//! Weights come from a torchvision `vgg19` state dict (`.pth`), imported with
//! `burn-import`. Only the convolutions up to `conv5_1` are kept.

use std::path::Path;

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::record::{FullPrecisionSettings, Recorder};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::module::max_pool2d;
use burn::tensor::Tensor;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use tracing::info;

use crate::config::FeatureCriterion;
use crate::error::Result;
use crate::losses::{l1_loss, mse_loss, to_unit_range};

const CONV_CHANNELS: [[usize; 2]; 13] = [
    [3, 64],
    [64, 64],
    [64, 128],
    [128, 128],
    [128, 256],
    [256, 256],
    [256, 256],
    [256, 256],
    [256, 512],
    [512, 512],
    [512, 512],
    [512, 512],
    [512, 512],
];

/// Position of each kept conv inside torchvision's `features` sequential.
const TORCHVISION_INDICES: [usize; 13] = [0, 2, 5, 7, 10, 12, 14, 16, 19, 21, 23, 25, 28];

/// relu1_1, relu2_1, relu3_1, relu4_1, relu5_1
const FEATURE_LAYERS: [usize; 5] = [0, 2, 4, 8, 12];

/// A 2x2 max pool follows these convs.
const POOL_AFTER: [usize; 4] = [1, 3, 7, 11];

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Module, Debug)]
pub struct Vgg19Features<B: Backend> {
    convs: Vec<Conv2d<B>>,
}

impl<B: Backend> Vgg19Features<B> {
    /// Randomly initialised extractor, mostly useful as a load target.
    pub fn new(device: &B::Device) -> Self {
        let convs = CONV_CHANNELS
            .iter()
            .map(|&channels| {
                Conv2dConfig::new(channels, [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();
        Self { convs }
    }

    /// Loads torchvision weights and freezes every parameter.
    pub fn from_torchvision(path: &Path, device: &B::Device) -> Result<Self> {
        let mut args = LoadArgs::new(path.to_path_buf());
        for (i, index) in TORCHVISION_INDICES.iter().enumerate() {
            args = args.with_key_remap(&format!(r"^features\.{index}\.(.+)$"), &format!("convs.{i}.$1"));
        }
        let record = PyTorchFileRecorder::<FullPrecisionSettings>::default().load(args, device)?;
        info!("Loaded VGG-19 weights from {}", path.display());

        Ok(Self::new(device).load_record(record).no_grad())
    }

    /// Activations after relu1_1 .. relu5_1 for ImageNet-normalised input.
    pub fn features(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut features = Vec::with_capacity(FEATURE_LAYERS.len());
        let mut x = x;
        for (i, conv) in self.convs.iter().enumerate() {
            x = activation::relu(conv.forward(x));
            if FEATURE_LAYERS.contains(&i) {
                features.push(x.clone());
            }
            if i == FEATURE_LAYERS[FEATURE_LAYERS.len() - 1] {
                break;
            }
            if POOL_AFTER.contains(&i) {
                x = max_pool2d(x, [2, 2], [2, 2], [0, 0], [1, 1]);
            }
        }
        features
    }
}

/// Maps `[-1, 1]` images (1 or 3 channels) to the normalisation VGG was trained with.
pub fn imagenet_normalize<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let images = to_unit_range(images);
    let images = if images.dims()[1] == 1 {
        images.repeat_dim(1, 3)
    } else {
        images
    };
    let device = images.device();
    let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device).reshape([1, 3, 1, 1]);
    let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &device).reshape([1, 3, 1, 1]);
    (images - mean) / std
}

/// Sum over the five VGG stages of the distance between feature maps.
#[derive(Debug)]
pub struct PerceptualLoss<B: Backend> {
    vgg: Vgg19Features<B>,
    criterion: FeatureCriterion,
}

impl<B: Backend> PerceptualLoss<B> {
    /// The extractor is frozen; gradients only reach the compared images.
    pub fn new(vgg: Vgg19Features<B>, criterion: FeatureCriterion) -> Self {
        Self {
            vgg: vgg.no_grad(),
            criterion,
        }
    }

    pub fn vgg(&self) -> &Vgg19Features<B> {
        &self.vgg
    }

    pub fn forward(&self, prediction: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        let pred_features = self.vgg.features(imagenet_normalize(prediction));
        let target_features = self.vgg.features(imagenet_normalize(target));

        pred_features
            .into_iter()
            .zip(target_features)
            .map(|(p, t)| match self.criterion {
                FeatureCriterion::L1 => l1_loss(p, t),
                FeatureCriterion::Mse => mse_loss(p, t),
            })
            .reduce(|acc, loss| acc + loss)
            .unwrap_or_else(|| Tensor::zeros([1], &self.vgg.devices()[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, ElementConversion};

    type TestBackend = NdArray<f32>;

    #[test]
    fn features_come_from_five_stages() {
        let device = Default::default();
        let vgg = Vgg19Features::<TestBackend>::new(&device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);

        let shapes: Vec<[usize; 4]> = vgg.features(x).iter().map(|f| f.dims()).collect();
        assert_eq!(
            shapes,
            vec![
                [1, 64, 32, 32],
                [1, 128, 16, 16],
                [1, 256, 8, 8],
                [1, 512, 4, 4],
                [1, 512, 2, 2],
            ]
        );
    }

    #[test]
    fn grayscale_input_is_replicated_to_rgb() {
        let device = Default::default();
        let gray = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 4], &device);
        assert_eq!(imagenet_normalize(gray).dims(), [2, 3, 4, 4]);
    }

    #[test]
    fn perceptual_loss_is_zero_for_identical_images() {
        let device = Default::default();
        let loss = PerceptualLoss::new(Vgg19Features::<TestBackend>::new(&device), FeatureCriterion::L1);
        let x = Tensor::<TestBackend, 4>::random([1, 3, 16, 16], Distribution::Uniform(-1.0, 1.0), &device);

        let value = loss.forward(x.clone(), x).into_scalar().elem::<f32>();
        assert_eq!(value, 0.0);
    }
}
