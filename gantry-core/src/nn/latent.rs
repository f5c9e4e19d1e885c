//! Latent noise for the generator.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::Result;

/// Standard-normal latent vectors from a seedable generator.
pub struct LatentSampler {
    rng: StdRng,
    latent_dim: usize,
}

impl LatentSampler {
    pub fn new(latent_dim: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, latent_dim }
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// A `(count, latent_dim)` batch of noise on `device`.
    pub fn sample(&mut self, count: usize, device: &Device) -> Result<Tensor> {
        let values: Vec<f32> = (0..count * self.latent_dim)
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(values, (count, self.latent_dim), device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape() {
        let mut sampler = LatentSampler::new(100, Some(1));
        let noise = sampler.sample(8, &Device::Cpu).unwrap();
        assert_eq!(noise.dims(), &[8, 100]);
    }

    #[test]
    fn test_seeded_samplers_agree() {
        let mut a = LatentSampler::new(4, Some(42));
        let mut b = LatentSampler::new(4, Some(42));
        let x = a.sample(3, &Device::Cpu).unwrap().flatten_all().unwrap();
        let y = b.sample(3, &Device::Cpu).unwrap().flatten_all().unwrap();
        assert_eq!(x.to_vec1::<f32>().unwrap(), y.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn test_consecutive_draws_differ() {
        let mut sampler = LatentSampler::new(4, Some(7));
        let x = sampler.sample(1, &Device::Cpu).unwrap().flatten_all().unwrap();
        let y = sampler.sample(1, &Device::Cpu).unwrap().flatten_all().unwrap();
        assert_ne!(x.to_vec1::<f32>().unwrap(), y.to_vec1::<f32>().unwrap());
    }
}
