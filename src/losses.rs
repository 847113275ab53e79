use burn::tensor::backend::Backend;
use burn::tensor::module::{conv2d, max_pool2d};
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Tensor, TensorData};

use crate::config::GanMode;

/// Adversarial criterion against a constant real (1.0) or fake (0.0) target.
#[derive(Debug, Clone, Copy)]
pub struct GanLoss {
    mode: GanMode,
}

impl GanLoss {
    pub fn new(mode: GanMode) -> Self {
        Self { mode }
    }

    pub fn forward<B: Backend>(&self, prediction: Tensor<B, 4>, target_is_real: bool) -> Tensor<B, 1> {
        let target = if target_is_real { 1.0 } else { 0.0 };
        match self.mode {
            GanMode::Lsgan => prediction.sub_scalar(target).powf_scalar(2.0).mean(),
            GanMode::Vanilla => {
                // max(x, 0) - x * t + log(1 + exp(-|x|))
                let x = prediction;
                (x.clone().clamp_min(0.0) - x.clone().mul_scalar(target) + x.abs().neg().exp().log1p())
                    .mean()
            }
        }
    }
}

pub fn l1_loss<B: Backend, const D: usize>(prediction: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    (prediction - target).abs().mean()
}

pub fn mse_loss<B: Backend, const D: usize>(prediction: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    (prediction - target).powf_scalar(2.0).mean()
}

/// `[-1, 1]` network range to `[0, 1]` intensities.
pub fn to_unit_range<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    images.add_scalar(1.0).mul_scalar(0.5)
}

/// Dark channel prior: per-pixel minimum over color channels, then a
/// `patch x patch` minimum filter. Input in `[-1, 1]`, output `[N, 1, H, W]` in `[0, 1]`.
/// `patch` must be odd.
pub fn dark_channel<B: Backend>(images: Tensor<B, 4>, patch: usize) -> Tensor<B, 4> {
    // channels moved last: the ndarray backward of min_dim only reduces the last axis
    let channel_min = to_unit_range(images).swap_dims(1, 3).min_dim(3).swap_dims(1, 3);
    if patch <= 1 {
        return channel_min;
    }
    let pad = patch / 2;
    // min filter as a negated max pool
    max_pool2d(channel_min.neg(), [patch, patch], [1, 1], [pad, pad], [1, 1]).neg()
}

/// Haze-free images have a dark channel close to zero, so the loss is its mean.
#[derive(Debug, Clone, Copy)]
pub struct DarkChannelLoss {
    patch: usize,
}

impl DarkChannelLoss {
    pub fn new(patch: usize) -> Self {
        Self { patch }
    }

    pub fn forward<B: Backend>(&self, images: Tensor<B, 4>) -> Tensor<B, 1> {
        dark_channel(images, self.patch).abs().mean()
    }
}

/// Color-cast penalty between channels.
///
/// Clear images (`hazy == false`) are pushed towards gray-world balance: each
/// channel's spatial mean should match the mean over channels. Hazy images
/// (`hazy == true`) are pushed towards achromatic smoke: every pixel's channels
/// should match that pixel's channel mean.
pub fn inter_channel_loss<B: Backend>(images: Tensor<B, 4>, hazy: bool) -> Tensor<B, 1> {
    let unit = to_unit_range(images);
    if hazy {
        let pixel_mean = unit.clone().mean_dim(1);
        (unit - pixel_mean).abs().mean()
    } else {
        let channel_means = unit.mean_dim(3).mean_dim(2);
        let gray = channel_means.clone().mean_dim(1);
        (channel_means - gray).abs().mean()
    }
}

const LAPLACIAN: [f32; 9] = [1.0, 1.0, 1.0, 1.0, -8.0, 1.0, 1.0, 1.0, 1.0];

/// Per-channel 3x3 Laplacian response, same spatial size as the input.
pub fn laplacian<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, channels, _, _] = images.dims();
    let weights: Vec<f32> = LAPLACIAN.iter().copied().cycle().take(9 * channels).collect();
    let kernel = Tensor::<B, 4>::from_data(TensorData::new(weights, [channels, 1, 3, 3]), &images.device());
    conv2d(images, kernel, None, ConvOptions::new([1, 1], [1, 1], [1, 1], channels))
}

pub fn edge_loss<B: Backend>(prediction: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    l1_loss(laplacian(prediction), laplacian(target))
}

/// Vertical and horizontal finite differences.
fn gradients<B: Backend>(x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [n, c, h, w] = x.dims();
    let dy = x.clone().slice([0..n, 0..c, 0..h - 1, 0..w]) - x.clone().slice([0..n, 0..c, 1..h, 0..w]);
    let dx = x.clone().slice([0..n, 0..c, 0..h, 0..w - 1]) - x.slice([0..n, 0..c, 0..h, 1..w]);
    (dy, dx)
}

pub fn spatial_consistency_loss<B: Backend>(prediction: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let (pred_dy, pred_dx) = gradients(prediction);
    let (target_dy, target_dx) = gradients(target);
    l1_loss(pred_dy, target_dy) + l1_loss(pred_dx, target_dx)
}
