//! Synthetic regression task trained by `epochal run`.
//!
//! Samples come from `y = 3x - 0.5 + noise` with `x` uniform in `[-1, 1]`,
//! drawn from a seeded generator so every run with the same configuration
//! replays the same data.

use epochal_core::config::TrainerConfig;
use epochal_core::{ExperimentError, Model, StateDict, Stateful};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const BATCH_SIZE: usize = 16;

const TRUE_WEIGHT: f64 = 3.0;
const TRUE_BIAS: f64 = -0.5;
const NOISE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Parameters {
    weight: f64,
    bias: f64,
}

/// One-feature linear regression fitted by mini-batch gradient descent.
#[derive(Debug)]
pub struct LinearRegression {
    params: Parameters,
    learning_rate: f64,
    train: Vec<(f64, f64)>,
    valid: Vec<(f64, f64)>,
}

impl LinearRegression {
    pub fn new(config: &TrainerConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let train = sample(&mut rng, config.batches_per_epoch * BATCH_SIZE);
        let valid = sample(&mut rng, config.valid_batches * BATCH_SIZE);
        Self {
            params: Parameters {
                weight: 0.0,
                bias: 0.0,
            },
            learning_rate: config.learning_rate,
            train,
            valid,
        }
    }

    pub fn weight(&self) -> f64 {
        self.params.weight
    }

    pub fn bias(&self) -> f64 {
        self.params.bias
    }

    fn predict(&self, x: f64) -> f64 {
        self.params.weight * x + self.params.bias
    }

    fn mse(&self, batch: &[(f64, f64)]) -> f64 {
        let total: f64 = batch.iter().map(|&(x, y)| (self.predict(x) - y).powi(2)).sum();
        total / batch.len() as f64
    }
}

fn sample(rng: &mut StdRng, n: usize) -> Vec<(f64, f64)> {
    (0..n)
        .map(|_| {
            let x: f64 = rng.gen_range(-1.0..=1.0);
            let noise: f64 = rng.gen_range(-NOISE..=NOISE);
            (x, TRUE_WEIGHT * x + TRUE_BIAS + noise)
        })
        .collect()
}

fn batch_slice(data: &[(f64, f64)], batch: usize) -> Result<&[(f64, f64)], ExperimentError> {
    let start = batch * BATCH_SIZE;
    data.get(start..start + BATCH_SIZE)
        .ok_or_else(|| ExperimentError::model(format!("batch {batch} is out of range")))
}

impl Model for LinearRegression {
    /// Returns the loss before the update.
    fn train_batch(&mut self, _epoch: usize, batch: usize) -> epochal_core::Result<f64> {
        let samples = batch_slice(&self.train, batch)?.to_vec();
        let loss = self.mse(&samples);

        let n = samples.len() as f64;
        let (grad_w, grad_b) = samples.iter().fold((0.0, 0.0), |(gw, gb), &(x, y)| {
            let err = self.predict(x) - y;
            (gw + 2.0 * err * x / n, gb + 2.0 * err / n)
        });
        self.params.weight -= self.learning_rate * grad_w;
        self.params.bias -= self.learning_rate * grad_b;
        Ok(loss)
    }

    fn eval_batch(&mut self, batch: usize) -> epochal_core::Result<f64> {
        let samples = batch_slice(&self.valid, batch)?;
        Ok(self.mse(samples))
    }
}

impl Stateful for LinearRegression {
    fn state_dict(&self) -> epochal_core::Result<StateDict> {
        Ok(serde_json::to_value(self.params)?)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> epochal_core::Result<()> {
        self.params = serde_json::from_value(state.clone())
            .map_err(|e| ExperimentError::state("model", e.to_string()))?;
        Ok(())
    }
}
