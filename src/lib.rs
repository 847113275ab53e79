//! CycleGAN desmoking for endoscopic and surgical images, plus the color
//! statistics and parameter counts used to compare trained models.

pub mod checkpoint;
pub mod config;
pub mod cycle_gan;
pub mod dataset;
pub mod error;
pub mod inference;
pub mod losses;
pub mod networks;
pub mod pool;
pub mod schedule;
pub mod stats;
pub mod train;
pub mod vgg;

pub use error::{DesmokeError, Result};
