//! Stateful gradient-update rules bound to one model's parameters.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use std::collections::HashMap;

use crate::error::{CheckpointError, Result};

/// A gradient-update rule with serializable state.
///
/// `step` only reads gradients of the parameters the optimizer was built
/// with; gradients for any other tensor in the store are ignored.
pub trait Optimizer {
    fn step(&mut self, grads: &GradStore) -> Result<()>;

    fn state(&self) -> Result<HashMap<String, Tensor>>;

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()>;
}

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L2 penalty added to the gradient (coupled, not AdamW-style).
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

const STEP_KEY: &str = "step";

/// Adam with lazily created moment estimates.
pub struct Adam {
    params: Vec<(String, Var)>,
    hp: AdamParams,
    exp_avg: HashMap<String, Tensor>,
    exp_avg_sq: HashMap<String, Tensor>,
    step: u32,
}

impl Adam {
    pub fn new(params: Vec<(String, Var)>, hp: AdamParams) -> Self {
        Self {
            params,
            hp,
            exp_avg: HashMap::new(),
            exp_avg_sq: HashMap::new(),
            step: 0,
        }
    }

    /// Number of updates applied so far.
    pub fn steps_taken(&self) -> u32 {
        self.step
    }
}

impl Optimizer for Adam {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        let t = self.step as i32;
        let bc1 = 1.0 - self.hp.beta1.powi(t);
        let bc2 = 1.0 - self.hp.beta2.powi(t);

        for (name, var) in &self.params {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            let theta = var.as_tensor().detach();
            let grad = if self.hp.weight_decay != 0.0 {
                (grad + (&theta * self.hp.weight_decay)?)?
            } else {
                grad.clone()
            };

            let m = match self.exp_avg.get(name) {
                Some(m) => m.clone(),
                None => theta.zeros_like()?,
            };
            let v = match self.exp_avg_sq.get(name) {
                Some(v) => v.clone(),
                None => theta.zeros_like()?,
            };

            let m = ((m * self.hp.beta1)? + (&grad * (1.0 - self.hp.beta1))?)?;
            let v = ((v * self.hp.beta2)? + (grad.sqr()? * (1.0 - self.hp.beta2))?)?;

            let m_hat = (&m / bc1)?;
            let v_hat = (&v / bc2)?;
            let update = ((m_hat / (v_hat.sqrt()? + self.hp.eps)?)? * self.hp.lr)?;
            var.set(&(theta - update)?)?;

            self.exp_avg.insert(name.clone(), m);
            self.exp_avg_sq.insert(name.clone(), v);
        }
        Ok(())
    }

    fn state(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        state.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step], &Device::Cpu)?,
        );
        for (name, m) in &self.exp_avg {
            state.insert(format!("exp_avg.{name}"), m.copy()?);
        }
        for (name, v) in &self.exp_avg_sq {
            state.insert(format!("exp_avg_sq.{name}"), v.copy()?);
        }
        Ok(state)
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let step = state
            .get(STEP_KEY)
            .ok_or_else(|| CheckpointError::MissingTensor {
                id: "optimizer".to_string(),
                name: STEP_KEY.to_string(),
            })?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?
            .first()
            .copied()
            .unwrap_or(0);

        let mut exp_avg = HashMap::new();
        let mut exp_avg_sq = HashMap::new();
        for (name, var) in &self.params {
            for (prefix, target) in [("exp_avg", &mut exp_avg), ("exp_avg_sq", &mut exp_avg_sq)] {
                let key = format!("{prefix}.{name}");
                let Some(tensor) = state.get(&key) else {
                    continue;
                };
                if tensor.dims() != var.dims() {
                    return Err(CheckpointError::ShapeMismatch {
                        name: key,
                        expected: var.dims().to_vec(),
                        found: tensor.dims().to_vec(),
                    }
                    .into());
                }
                let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
                target.insert(name.clone(), tensor);
            }
        }

        self.step = step;
        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_param(value: f32) -> (String, Var) {
        let var = Var::new(&[value], &Device::Cpu).unwrap();
        ("w".to_string(), var)
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        // With bias correction the very first Adam update is lr * sign(g).
        let (name, var) = scalar_param(1.0);
        let mut opt = Adam::new(
            vec![(name, var.clone())],
            AdamParams {
                lr: 0.1,
                ..AdamParams::default()
            },
        );
        let loss = (var.as_tensor() * 3.0).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        assert!((value(&var) - 0.9).abs() < 1e-5);
        assert_eq!(opt.steps_taken(), 1);
    }

    #[test]
    fn test_ignores_foreign_gradients() {
        let (name, own) = scalar_param(1.0);
        let foreign = Var::new(&[2.0f32], &Device::Cpu).unwrap();
        let mut opt = Adam::new(vec![(name, own.clone())], AdamParams::default());

        let loss = (foreign.as_tensor() * 5.0).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();

        assert_eq!(value(&own), 1.0);
        assert_eq!(value(&foreign), 2.0);
    }

    #[test]
    fn test_state_roundtrip_continues_identically() {
        let hp = AdamParams {
            lr: 0.05,
            weight_decay: 0.01,
            ..AdamParams::default()
        };
        let (name_a, var_a) = scalar_param(1.0);
        let (name_b, var_b) = scalar_param(1.0);
        let mut a = Adam::new(vec![(name_a, var_a.clone())], hp);
        let mut b = Adam::new(vec![(name_b, var_b.clone())], hp);

        let step = |opt: &mut Adam, var: &Var| {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            opt.step(&loss.backward().unwrap()).unwrap();
        };

        step(&mut a, &var_a);
        step(&mut a, &var_a);
        var_b.set(var_a.as_tensor()).unwrap();
        b.load_state(&a.state().unwrap()).unwrap();
        assert_eq!(b.steps_taken(), 2);

        step(&mut a, &var_a);
        step(&mut b, &var_b);
        assert!((value(&var_a) - value(&var_b)).abs() < 1e-7);
    }

    #[test]
    fn test_load_state_requires_step() {
        let (name, var) = scalar_param(1.0);
        let mut opt = Adam::new(vec![(name, var)], AdamParams::default());
        assert!(opt.load_state(&HashMap::new()).is_err());
    }
}
