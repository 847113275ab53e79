//! CycleGAN for desmoking.
//!
//! A is the smoky domain and B the clear one. `G_A: A -> B`, `G_B: B -> A`;
//! `D_A` tells real B from `G_A(A)`, `D_B` tells real A from `G_B(B)`.

use std::fmt;

use burn::module::Module;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};

use crate::config::TrainingConfig;
use crate::losses::{
    edge_loss, inter_channel_loss, l1_loss, spatial_consistency_loss, DarkChannelLoss, GanLoss,
};
use crate::networks::{NLayerDiscriminator, ResnetGenerator};
use crate::pool::ImagePool;
use crate::vgg::PerceptualLoss;

#[derive(Module, Debug)]
pub struct Generators<B: Backend> {
    pub g_a: ResnetGenerator<B>,
    pub g_b: ResnetGenerator<B>,
}

impl<B: Backend> Generators<B> {
    pub fn new(config: &TrainingConfig, device: &B::Device) -> Self {
        Self {
            g_a: config.generator_a().init(device),
            g_b: config.generator_b().init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct Discriminators<B: Backend> {
    pub d_a: NLayerDiscriminator<B>,
    pub d_b: NLayerDiscriminator<B>,
}

impl<B: Backend> Discriminators<B> {
    pub fn new(config: &TrainingConfig, device: &B::Device) -> Self {
        Self {
            d_a: config.discriminator_a().init(device),
            d_b: config.discriminator_b().init(device),
        }
    }
}

/// Named scalar losses of one optimisation step, in reporting order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossReport {
    entries: Vec<(&'static str, f32)>,
}

impl LossReport {
    pub fn push(&mut self, name: &'static str, value: f32) {
        self.entries.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    pub fn entries(&self) -> &[(&'static str, f32)] {
        &self.entries
    }

    /// Element-wise running sum, used to average over an epoch.
    pub fn accumulate(&mut self, other: &LossReport) {
        if self.entries.is_empty() {
            self.entries = other.entries.clone();
            return;
        }
        for (name, value) in &other.entries {
            match self.entries.iter_mut().find(|(n, _)| n == name) {
                Some((_, total)) => *total += value,
                None => self.entries.push((name, *value)),
            }
        }
    }

    pub fn scaled(&self, factor: f32) -> LossReport {
        LossReport {
            entries: self.entries.iter().map(|(n, v)| (*n, v * factor)).collect(),
        }
    }
}

impl fmt::Display for LossReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{name}: {value:.3}")?;
        }
        Ok(())
    }
}

/// Images of the last step, detached.
pub struct Visuals<B: Backend> {
    pub real_a: Tensor<B, 4>,
    pub fake_b: Tensor<B, 4>,
    pub rec_a: Tensor<B, 4>,
    pub idt_b: Option<Tensor<B, 4>>,
    pub real_b: Tensor<B, 4>,
    pub fake_a: Tensor<B, 4>,
    pub rec_b: Tensor<B, 4>,
    pub idt_a: Option<Tensor<B, 4>>,
}

impl<B: Backend> Visuals<B> {
    pub fn named(&self) -> Vec<(&'static str, Tensor<B, 4>)> {
        let mut visuals = vec![
            ("real_A", self.real_a.clone()),
            ("fake_B", self.fake_b.clone()),
            ("rec_A", self.rec_a.clone()),
        ];
        if let Some(idt_b) = &self.idt_b {
            visuals.push(("idt_B", idt_b.clone()));
        }
        visuals.extend([
            ("real_B", self.real_b.clone()),
            ("fake_A", self.fake_a.clone()),
            ("rec_B", self.rec_b.clone()),
        ]);
        if let Some(idt_a) = &self.idt_a {
            visuals.push(("idt_A", idt_a.clone()));
        }
        visuals
    }
}

/// Weights of the generator objective.
#[derive(Debug, Clone, Copy)]
struct LossWeights {
    cycle_a: f64,
    cycle_b: f64,
    identity: f64,
    perceptual: f64,
    inter_channel: f64,
    dark_channel: f64,
    edge: f64,
    spatial: f64,
}

impl LossWeights {
    fn from_config(config: &TrainingConfig) -> Self {
        Self {
            cycle_a: config.lambda_a,
            cycle_b: config.lambda_b,
            identity: config.lambda_identity,
            perceptual: config.lambda_perceptual,
            inter_channel: config.lambda_ic,
            dark_channel: config.lambda_dc,
            edge: config.lambda_edge,
            spatial: config.lambda_spatial,
        }
    }
}

fn scalar<B: Backend>(loss: &Tensor<B, 1>) -> f32 {
    loss.clone().into_scalar().elem::<f32>()
}

/// Both generator/discriminator pairs, their optimizers, criteria and image pools.
pub struct CycleGan<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Generators<B>, B>,
    OD: Optimizer<Discriminators<B>, B>,
{
    generators: Generators<B>,
    discriminators: Discriminators<B>,
    optim_g: OG,
    optim_d: OD,
    gan: GanLoss,
    dark_channel: DarkChannelLoss,
    perceptual: Option<PerceptualLoss<B>>,
    weights: LossWeights,
    fake_a_pool: ImagePool<Tensor<B, 4>>,
    fake_b_pool: ImagePool<Tensor<B, 4>>,
}

impl<B, OG, OD> CycleGan<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Generators<B>, B>,
    OD: Optimizer<Discriminators<B>, B>,
{
    /// `perceptual == None` drops the VGG term from the generator objective.
    pub fn new(
        config: &TrainingConfig,
        generators: Generators<B>,
        discriminators: Discriminators<B>,
        optim_g: OG,
        optim_d: OD,
        perceptual: Option<PerceptualLoss<B>>,
    ) -> Self {
        Self {
            generators,
            discriminators,
            optim_g,
            optim_d,
            gan: GanLoss::new(config.gan_mode),
            dark_channel: DarkChannelLoss::new(config.dark_channel_patch),
            perceptual,
            weights: LossWeights::from_config(config),
            fake_a_pool: ImagePool::new(config.pool_size, config.seed),
            fake_b_pool: ImagePool::new(config.pool_size, config.seed.wrapping_add(1)),
        }
    }

    pub fn generators(&self) -> &Generators<B> {
        &self.generators
    }

    pub fn perceptual(&self) -> Option<&PerceptualLoss<B>> {
        self.perceptual.as_ref()
    }

    pub fn discriminators(&self) -> &Discriminators<B> {
        &self.discriminators
    }

    /// One full CycleGAN iteration: forward both cycles, update both generators,
    /// then update both discriminators on pooled fakes.
    pub fn optimize_parameters(
        &mut self,
        real_a: Tensor<B, 4>,
        real_b: Tensor<B, 4>,
        lr: f64,
    ) -> (LossReport, Visuals<B>) {
        let mut report = LossReport::default();

        let fake_b = self.generators.g_a.forward(real_a.clone());
        let rec_a = self.generators.g_b.forward(fake_b.clone());
        let fake_a = self.generators.g_b.forward(real_b.clone());
        let rec_b = self.generators.g_a.forward(fake_a.clone());

        let (loss_g, idt_a, idt_b) = self.generator_loss(
            &real_a, &real_b, &fake_a, &fake_b, &rec_a, &rec_b, &mut report,
        );
        let grads = loss_g.backward();
        let grads = GradientsParams::from_grads(grads, &self.generators);
        self.generators = self.optim_g.step(lr, self.generators.clone(), grads);

        let pooled_fake_b = self.fake_b_pool.query(fake_b.clone().detach());
        let pooled_fake_a = self.fake_a_pool.query(fake_a.clone().detach());
        let loss_d_a =
            self.discriminator_loss(&self.discriminators.d_a, real_b.clone(), pooled_fake_b);
        let loss_d_b =
            self.discriminator_loss(&self.discriminators.d_b, real_a.clone(), pooled_fake_a);
        report.push("D_A", scalar(&loss_d_a));
        report.push("D_B", scalar(&loss_d_b));

        let grads = (loss_d_a + loss_d_b).backward();
        let grads = GradientsParams::from_grads(grads, &self.discriminators);
        self.discriminators = self.optim_d.step(lr, self.discriminators.clone(), grads);

        let visuals = Visuals {
            real_a,
            fake_b: fake_b.detach(),
            rec_a: rec_a.detach(),
            idt_b: idt_b.map(|t| t.detach()),
            real_b,
            fake_a: fake_a.detach(),
            rec_b: rec_b.detach(),
            idt_a: idt_a.map(|t| t.detach()),
        };
        (report, visuals)
    }

    /// Returns the summed objective plus the identity images when that term is on.
    #[allow(clippy::too_many_arguments)]
    fn generator_loss(
        &self,
        real_a: &Tensor<B, 4>,
        real_b: &Tensor<B, 4>,
        fake_a: &Tensor<B, 4>,
        fake_b: &Tensor<B, 4>,
        rec_a: &Tensor<B, 4>,
        rec_b: &Tensor<B, 4>,
        report: &mut LossReport,
    ) -> (Tensor<B, 1>, Option<Tensor<B, 4>>, Option<Tensor<B, 4>>) {
        let w = self.weights;
        let gens = &self.generators;

        let loss_g_a = self.gan.forward(self.discriminators.d_a.forward(fake_b.clone()), true);
        let loss_g_b = self.gan.forward(self.discriminators.d_b.forward(fake_a.clone()), true);
        let loss_cycle_a = l1_loss(rec_a.clone(), real_a.clone()).mul_scalar(w.cycle_a);
        let loss_cycle_b = l1_loss(rec_b.clone(), real_b.clone()).mul_scalar(w.cycle_b);
        report.push("G_A", scalar(&loss_g_a));
        report.push("G_B", scalar(&loss_g_b));
        report.push("cycle_A", scalar(&loss_cycle_a));
        report.push("cycle_B", scalar(&loss_cycle_b));

        let mut loss = loss_g_a + loss_g_b + loss_cycle_a + loss_cycle_b;

        let (mut idt_a, mut idt_b) = (None, None);
        if w.identity > 0.0 {
            // G_A should leave clear images alone, G_B smoky ones.
            let same_b = gens.g_a.forward(real_b.clone());
            let same_a = gens.g_b.forward(real_a.clone());
            let loss_idt_a = l1_loss(same_b.clone(), real_b.clone()).mul_scalar(w.cycle_b * w.identity);
            let loss_idt_b = l1_loss(same_a.clone(), real_a.clone()).mul_scalar(w.cycle_a * w.identity);
            report.push("idt_A", scalar(&loss_idt_a));
            report.push("idt_B", scalar(&loss_idt_b));
            loss = loss + loss_idt_a + loss_idt_b;
            idt_a = Some(same_b);
            idt_b = Some(same_a);
        }

        if let Some(perceptual) = self.perceptual.as_ref().filter(|_| w.perceptual > 0.0) {
            let loss_perc_a = perceptual.forward(rec_b.clone(), real_b.clone()).mul_scalar(w.perceptual);
            let loss_perc_b = perceptual.forward(rec_a.clone(), real_a.clone()).mul_scalar(w.perceptual);
            report.push("perc_A", scalar(&loss_perc_a));
            report.push("perc_B", scalar(&loss_perc_b));
            loss = loss + loss_perc_a + loss_perc_b;
        }

        if w.inter_channel > 0.0 {
            let loss_ic_a = inter_channel_loss(fake_b.clone(), false).mul_scalar(w.inter_channel);
            let loss_ic_b = inter_channel_loss(fake_a.clone(), true).mul_scalar(w.inter_channel);
            report.push("IC_A", scalar(&loss_ic_a));
            report.push("IC_B", scalar(&loss_ic_b));
            loss = loss + loss_ic_a + loss_ic_b;
        }

        if w.dark_channel > 0.0 {
            // only the clear-domain output should be haze free
            let loss_dc_a = self.dark_channel.forward(fake_b.clone()).mul_scalar(w.dark_channel);
            report.push("DC_A", scalar(&loss_dc_a));
            loss = loss + loss_dc_a;
        }

        if w.edge > 0.0 {
            let loss_edge = (edge_loss(rec_a.clone(), real_a.clone())
                + edge_loss(rec_b.clone(), real_b.clone()))
            .mul_scalar(w.edge);
            report.push("edge", scalar(&loss_edge));
            loss = loss + loss_edge;
        }

        if w.spatial > 0.0 {
            let loss_spatial = (spatial_consistency_loss(rec_a.clone(), real_a.clone())
                + spatial_consistency_loss(rec_b.clone(), real_b.clone()))
            .mul_scalar(w.spatial);
            report.push("spatial", scalar(&loss_spatial));
            loss = loss + loss_spatial;
        }

        (loss, idt_a, idt_b)
    }

    /// `(GAN(D(real), real) + GAN(D(fake), fake)) / 2`; `fake` is already detached.
    fn discriminator_loss(
        &self,
        discriminator: &NLayerDiscriminator<B>,
        real: Tensor<B, 4>,
        fake: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        let loss_real = self.gan.forward(discriminator.forward(real), true);
        let loss_fake = self.gan.forward(discriminator.forward(fake), false);
        (loss_real + loss_fake).mul_scalar(0.5)
    }
}
