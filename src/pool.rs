//! History buffer of generated images, sampled to feed the discriminators.
//!
//! Feeding discriminators a mix of current and earlier fakes keeps them from
//! chasing the latest generator state.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct ImagePool<T> {
    capacity: usize,
    images: Vec<T>,
    rng: StdRng,
}

impl<T: Clone> ImagePool<T> {
    /// A pool with `capacity == 0` passes every query straight through.
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            images: Vec::with_capacity(capacity),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Returns either `image` or an older stored image, which `image` then replaces.
    pub fn query_one(&mut self, image: T) -> T {
        if self.capacity == 0 {
            return image;
        }
        if self.images.len() < self.capacity {
            self.images.push(image.clone());
            return image;
        }
        if self.rng.random::<f64>() > 0.5 {
            let slot = self.rng.random_range(0..self.images.len());
            std::mem::replace(&mut self.images[slot], image)
        } else {
            image
        }
    }
}

impl<B: Backend> ImagePool<Tensor<B, 4>> {
    /// Runs every image of an `[N, C, H, W]` batch through the pool and returns a
    /// batch of the same shape. Stored images are detached from the graph.
    pub fn query(&mut self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.capacity == 0 {
            return images;
        }
        let batch = images.dims()[0];
        let picked = (0..batch)
            .map(|i| self.query_one(images.clone().slice([i..i + 1]).detach()))
            .collect();
        Tensor::cat(picked, 0)
    }
}
