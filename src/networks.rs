use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{
    Dropout, DropoutConfig, Initializer, InstanceNorm, InstanceNormConfig, PaddingConfig2d,
};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

/// Mirror-pads the two spatial dims by `pad` without repeating the edge pixel.
///
/// Implemented as an index selection so gradients flow back to the source pixels.
/// `pad` must be smaller than both spatial dims.
pub fn reflection_pad<B: Backend>(x: Tensor<B, 4>, pad: usize) -> Tensor<B, 4> {
    if pad == 0 {
        return x;
    }
    let [_, _, height, width] = x.dims();
    let device = x.device();

    let rows = reflect_indices(height, pad);
    let cols = reflect_indices(width, pad);
    let rows = Tensor::<B, 1, Int>::from_data(TensorData::new(rows, [height + 2 * pad]), &device);
    let cols = Tensor::<B, 1, Int>::from_data(TensorData::new(cols, [width + 2 * pad]), &device);

    x.select(2, rows).select(3, cols)
}

/// Source index for every padded position. Only valid for `pad < len`.
pub(crate) fn reflect_indices(len: usize, pad: usize) -> Vec<i64> {
    let last = len as i64 - 1;
    (0..len + 2 * pad)
        .map(|i| {
            let i = i as i64 - pad as i64;
            if i < 0 {
                -i
            } else if i > last {
                2 * last - i
            } else {
                i
            }
        })
        .collect()
}

#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: InstanceNorm<B>,
    dropout: Dropout,
    conv2: Conv2d<B>,
    norm2: InstanceNorm<B>,
}

impl<B: Backend> ResnetBlock<B> {
    pub fn new(
        channels: usize,
        use_dropout: bool,
        initializer: &Initializer,
        device: &B::Device,
    ) -> Self {
        Self {
            conv1: Conv2dConfig::new([channels, channels], [3, 3])
                .with_padding(PaddingConfig2d::Valid)
                .with_initializer(initializer.clone())
                .init(device),
            norm1: InstanceNormConfig::new(channels).init(device),
            dropout: DropoutConfig::new(if use_dropout { 0.5 } else { 0.0 }).init(),
            conv2: Conv2dConfig::new([channels, channels], [3, 3])
                .with_padding(PaddingConfig2d::Valid)
                .with_initializer(initializer.clone())
                .init(device),
            norm2: InstanceNormConfig::new(channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self.conv1.forward(reflection_pad(x.clone(), 1));
        let h = activation::relu(self.norm1.forward(h));
        let h = self.dropout.forward(h);

        let h = self.conv2.forward(reflection_pad(h, 1));
        let h = self.norm2.forward(h);
        x + h
    }
}

/// ResNet generator: c7s1-ngf, two stride-2 downsamplings, `n_blocks` residual
/// blocks, two transposed-conv upsamplings, c7s1-output with tanh.
#[derive(Config, Debug)]
pub struct ResnetGeneratorConfig {
    pub input_nc: usize,
    pub output_nc: usize,
    #[config(default = 64)]
    pub ngf: usize,
    #[config(default = 9)]
    pub n_blocks: usize,
    #[config(default = false)]
    pub use_dropout: bool,
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

const N_SAMPLING: usize = 2;

/// Smallest side the generator accepts: the residual blocks pad the
/// bottleneck (side / 4) by one pixel, so it needs at least two.
pub const GENERATOR_MIN_SIZE: usize = 2 << N_SAMPLING;

impl ResnetGeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResnetGenerator<B> {
        let ngf = self.ngf;

        let mut down = Vec::with_capacity(N_SAMPLING);
        let mut down_norms = Vec::with_capacity(N_SAMPLING);
        for i in 0..N_SAMPLING {
            let mult = 1 << i;
            down.push(
                Conv2dConfig::new([ngf * mult, ngf * mult * 2], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .with_initializer(self.initializer.clone())
                    .init(device),
            );
            down_norms.push(InstanceNormConfig::new(ngf * mult * 2).init(device));
        }

        let bottleneck = ngf * (1 << N_SAMPLING);
        let blocks = (0..self.n_blocks)
            .map(|_| ResnetBlock::new(bottleneck, self.use_dropout, &self.initializer, device))
            .collect();

        let mut up = Vec::with_capacity(N_SAMPLING);
        let mut up_norms = Vec::with_capacity(N_SAMPLING);
        for i in 0..N_SAMPLING {
            let mult = 1 << (N_SAMPLING - i);
            up.push(
                ConvTranspose2dConfig::new([ngf * mult, ngf * mult / 2], [3, 3])
                    .with_stride([2, 2])
                    .with_padding([1, 1])
                    .with_padding_out([1, 1])
                    .with_initializer(self.initializer.clone())
                    .init(device),
            );
            up_norms.push(InstanceNormConfig::new(ngf * mult / 2).init(device));
        }

        ResnetGenerator {
            stem: Conv2dConfig::new([self.input_nc, ngf], [7, 7])
                .with_padding(PaddingConfig2d::Valid)
                .with_initializer(self.initializer.clone())
                .init(device),
            stem_norm: InstanceNormConfig::new(ngf).init(device),
            down,
            down_norms,
            blocks,
            up,
            up_norms,
            head: Conv2dConfig::new([ngf, self.output_nc], [7, 7])
                .with_padding(PaddingConfig2d::Valid)
                .with_initializer(self.initializer.clone())
                .init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct ResnetGenerator<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: InstanceNorm<B>,
    down: Vec<Conv2d<B>>,
    down_norms: Vec<InstanceNorm<B>>,
    blocks: Vec<ResnetBlock<B>>,
    up: Vec<ConvTranspose2d<B>>,
    up_norms: Vec<InstanceNorm<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> ResnetGenerator<B> {
    /// Maps `[N, input_nc, H, W]` in `[-1, 1]` to `[N, output_nc, H, W]` in `[-1, 1]`.
    /// `H` and `W` must be multiples of 4.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem.forward(reflection_pad(x, 3));
        let mut x = activation::relu(self.stem_norm.forward(x));

        for (conv, norm) in self.down.iter().zip(&self.down_norms) {
            x = activation::relu(norm.forward(conv.forward(x)));
        }
        for block in &self.blocks {
            x = block.forward(x);
        }
        for (conv, norm) in self.up.iter().zip(&self.up_norms) {
            x = activation::relu(norm.forward(conv.forward(x)));
        }

        let x = self.head.forward(reflection_pad(x, 3));
        activation::tanh(x)
    }
}

/// 70x70 PatchGAN discriminator.
#[derive(Config, Debug)]
pub struct NLayerDiscriminatorConfig {
    pub input_nc: usize,
    #[config(default = 64)]
    pub ndf: usize,
    #[config(default = 3)]
    pub n_layers: usize,
    #[config(default = "Initializer::Normal { mean: 0.0, std: 0.02 }")]
    pub initializer: Initializer,
}

const MAX_FILTER_MULT: usize = 8;
const LEAKY_SLOPE: f64 = 0.2;

impl NLayerDiscriminatorConfig {
    /// Side of the patch logit map for a square input of side `input`,
    /// or `None` when some layer would receive fewer pixels than its kernel covers.
    pub fn output_size(&self, input: usize) -> Option<usize> {
        let conv = |n: usize, stride: usize| (n + 2).checked_sub(4).map(|m| m / stride + 1);
        let mut size = conv(input, 2)?;
        for n in 1..=self.n_layers {
            size = conv(size, if n < self.n_layers { 2 } else { 1 })?;
        }
        conv(size, 1)
    }

    /// Smallest input side that still yields a 1x1 patch map.
    pub fn min_input_size(&self) -> usize {
        u32::try_from(self.n_layers)
            .ok()
            .and_then(|n| 1usize.checked_shl(n))
            .map_or(usize::MAX, |scale| scale.saturating_mul(3))
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> NLayerDiscriminator<B> {
        let ndf = self.ndf;
        let conv = |channels: [usize; 2], stride: usize| {
            Conv2dConfig::new(channels, [4, 4])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_initializer(self.initializer.clone())
                .init(device)
        };

        let mut layers = Vec::with_capacity(self.n_layers);
        let mut norms = Vec::with_capacity(self.n_layers);
        let mut mult = 1;
        for n in 1..=self.n_layers {
            let prev = mult;
            mult = (1 << n).min(MAX_FILTER_MULT);
            let stride = if n < self.n_layers { 2 } else { 1 };
            layers.push(conv([ndf * prev, ndf * mult], stride));
            norms.push(InstanceNormConfig::new(ndf * mult).init(device));
        }

        NLayerDiscriminator {
            input: conv([self.input_nc, ndf], 2),
            layers,
            norms,
            head: conv([ndf * mult, 1], 1),
        }
    }
}

#[derive(Module, Debug)]
pub struct NLayerDiscriminator<B: Backend> {
    input: Conv2d<B>,
    layers: Vec<Conv2d<B>>,
    norms: Vec<InstanceNorm<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> NLayerDiscriminator<B> {
    /// Returns one real/fake logit per receptive-field patch, `[N, 1, h, w]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = activation::leaky_relu(self.input.forward(x), LEAKY_SLOPE);
        for (conv, norm) in self.layers.iter().zip(&self.norms) {
            x = activation::leaky_relu(norm.forward(conv.forward(x)), LEAKY_SLOPE);
        }
        self.head.forward(x)
    }
}
