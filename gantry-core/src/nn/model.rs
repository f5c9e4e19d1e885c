//! Trainable models: the generator and the discriminator.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::ops::{leaky_relu, sigmoid};
use candle_nn::{Linear, Module, VarBuilder, VarMap};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::config::TrainingConfig;
use crate::error::{CheckpointError, Result, TrainingError};

/// Whether a model is being optimized or only sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Any network with named trainable parameters and serializable state.
pub trait Model {
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Trainable parameters, sorted by name.
    fn parameters(&self) -> &[(String, Var)];

    fn mode(&self) -> Mode;

    fn set_mode(&mut self, mode: Mode);

    /// Deep copy of every parameter, keyed by name.
    fn state(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for (name, var) in self.parameters() {
            state.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(state)
    }

    /// Overwrite parameters in place from a state map.
    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in self.parameters() {
            let tensor = state
                .get(name)
                .ok_or_else(|| CheckpointError::MissingTensor {
                    id: "model".to_string(),
                    name: name.clone(),
                })?;
            if tensor.dims() != var.dims() {
                return Err(CheckpointError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    found: tensor.dims().to_vec(),
                }
                .into());
            }
            let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
            var.set(&tensor)?;
        }
        Ok(())
    }
}

/// SHA-256 over all parameter values, in name order.
///
/// Two digests are equal iff no parameter changed (up to bit patterns).
pub fn parameter_digest(model: &dyn Model) -> Result<String> {
    let mut hasher = Sha256::new();
    for (name, var) in model.parameters() {
        hasher.update(name.as_bytes());
        let values = var
            .as_tensor()
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for v in values {
            hasher.update(v.to_le_bytes());
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn collect_parameters(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| TrainingError::LockPoisoned(e.to_string()))?;
    let mut params: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Maps latent vectors `(B, latent_dim)` to images `(B, nc, size, size)` in
/// `[-1, 1]`. Hidden widths scale with `ngf`.
pub struct Generator {
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    latent_dim: usize,
    nc: usize,
    image_size: usize,
    params: Vec<(String, Var)>,
    mode: Mode,
}

impl Generator {
    pub fn new(config: &TrainingConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let hidden1 = config.ngf * 4;
        let hidden2 = config.ngf * 8;
        let out = config.nc * config.image_size * config.image_size;

        let fc1 = candle_nn::linear(config.latent_dim, hidden1, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden1, hidden2, vb.pp("fc2"))?;
        let fc3 = candle_nn::linear(hidden2, out, vb.pp("fc3"))?;

        Ok(Self {
            fc1,
            fc2,
            fc3,
            latent_dim: config.latent_dim,
            nc: config.nc,
            image_size: config.image_size,
            params: collect_parameters(&varmap)?,
            mode: Mode::Train,
        })
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }
}

impl Model for Generator {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, dim) = xs.dims2()?;
        if dim != self.latent_dim {
            return Err(TrainingError::InvalidShape {
                message: format!("generator expects latent dim {}, got {dim}", self.latent_dim),
            }
            .into());
        }
        let h = self.fc1.forward(xs)?.relu()?;
        let h = self.fc2.forward(&h)?.relu()?;
        let out = self.fc3.forward(&h)?.tanh()?;
        Ok(out.reshape((batch, self.nc, self.image_size, self.image_size))?)
    }

    fn parameters(&self) -> &[(String, Var)] {
        &self.params
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }
}

// ---------------------------------------------------------------------------
// Discriminator
// ---------------------------------------------------------------------------

/// Scores images `(B, nc, size, size)` with a probability of being real,
/// shape `(B,)`. Hidden widths scale with `ndf`.
pub struct Discriminator {
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    params: Vec<(String, Var)>,
    mode: Mode,
}

impl Discriminator {
    pub fn new(config: &TrainingConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let input = config.nc * config.image_size * config.image_size;
        let hidden1 = config.ndf * 8;
        let hidden2 = config.ndf * 4;

        let fc1 = candle_nn::linear(input, hidden1, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden1, hidden2, vb.pp("fc2"))?;
        let fc3 = candle_nn::linear(hidden2, 1, vb.pp("fc3"))?;

        Ok(Self {
            fc1,
            fc2,
            fc3,
            params: collect_parameters(&varmap)?,
            mode: Mode::Train,
        })
    }
}

impl Model for Discriminator {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = xs.flatten_from(1)?;
        let h = leaky_relu(&self.fc1.forward(&h)?, 0.2)?;
        let h = leaky_relu(&self.fc2.forward(&h)?, 0.2)?;
        let logits = self.fc3.forward(&h)?;
        Ok(sigmoid(&logits)?.squeeze(1)?)
    }

    fn parameters(&self) -> &[(String, Var)] {
        &self.params
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE_YAML;

    fn small_config() -> TrainingConfig {
        let mut config = TrainingConfig::from_yaml_str(SAMPLE_YAML).unwrap();
        config.latent_dim = 4;
        config.ngf = 2;
        config.ndf = 2;
        config.nc = 1;
        config.image_size = 4;
        config
    }

    #[test]
    fn test_generator_output_shape_and_range() {
        let config = small_config();
        let generator = Generator::new(&config, &Device::Cpu).unwrap();
        let noise = Tensor::randn(0f32, 1f32, (3, 4), &Device::Cpu).unwrap();
        let out = generator.forward(&noise).unwrap();
        assert_eq!(out.dims(), &[3, 1, 4, 4]);
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_generator_rejects_wrong_latent_dim() {
        let generator = Generator::new(&small_config(), &Device::Cpu).unwrap();
        let noise = Tensor::zeros((2, 7), DType::F32, &Device::Cpu).unwrap();
        assert!(generator.forward(&noise).is_err());
    }

    #[test]
    fn test_discriminator_outputs_probabilities() {
        let config = small_config();
        let discriminator = Discriminator::new(&config, &Device::Cpu).unwrap();
        let images = Tensor::randn(0f32, 1f32, (5, 1, 4, 4), &Device::Cpu).unwrap();
        let scores = discriminator.forward(&images).unwrap();
        assert_eq!(scores.dims(), &[5]);
        let values = scores.to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v > 0.0 && *v < 1.0));
    }

    #[test]
    fn test_parameters_sorted_by_name() {
        let generator = Generator::new(&small_config(), &Device::Cpu).unwrap();
        let names: Vec<_> = generator.parameters().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["fc1.bias", "fc1.weight", "fc2.bias", "fc2.weight", "fc3.bias", "fc3.weight"]
        );
    }

    #[test]
    fn test_state_roundtrip_restores_digest() {
        let config = small_config();
        let source = Generator::new(&config, &Device::Cpu).unwrap();
        let mut target = Generator::new(&config, &Device::Cpu).unwrap();
        assert_ne!(
            parameter_digest(&source).unwrap(),
            parameter_digest(&target).unwrap()
        );

        target.load_state(&source.state().unwrap()).unwrap();
        assert_eq!(
            parameter_digest(&source).unwrap(),
            parameter_digest(&target).unwrap()
        );
    }

    #[test]
    fn test_state_is_a_snapshot() {
        let config = small_config();
        let generator = Generator::new(&config, &Device::Cpu).unwrap();
        let state = generator.state().unwrap();
        let before = state["fc1.bias"].to_vec1::<f32>().unwrap();

        let (_, var) = &generator.parameters()[0];
        var.set(&var.as_tensor().ones_like().unwrap()).unwrap();
        assert_eq!(state["fc1.bias"].to_vec1::<f32>().unwrap(), before);
    }

    #[test]
    fn test_load_state_rejects_shape_mismatch() {
        let config = small_config();
        let mut generator = Generator::new(&config, &Device::Cpu).unwrap();
        let mut state = generator.state().unwrap();
        state.insert(
            "fc1.bias".into(),
            Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(generator.load_state(&state).is_err());
    }

    #[test]
    fn test_load_state_rejects_missing_tensor() {
        let config = small_config();
        let mut generator = Generator::new(&config, &Device::Cpu).unwrap();
        let mut state = generator.state().unwrap();
        state.remove("fc3.weight");
        assert!(generator.load_state(&state).is_err());
    }
}
