use serde::{Deserialize, Serialize};

use super::*;

/// The adam optimizer algorithm as shown in the research paper <https://arxiv.org/abs/1412.6980>
#[derive(Clone, Debug)]
pub struct Adam {
    momentum: Vec<f32>,
    velocity: Vec<f32>,

    beta1: f32,
    beta2: f32,
    epsilon: f32,

    beta1_pow: f32,
    beta2_pow: f32,

    l_rate: f32,
}

impl OptimizerAlg for Adam {
    fn update_weights(&mut self, weights: &mut [f32], gradients: &[f32]) -> Result<()> {
        check_lengths(weights.len(), gradients.len())?;
        check_lengths(self.momentum.len(), gradients.len())?;

        for (m, g) in self.momentum.iter_mut().zip(gradients.iter()) {
            *m = self.beta1 * *m + (1. - self.beta1) * *g;
        }

        for (v, g) in self.velocity.iter_mut().zip(gradients.iter()) {
            *v = self.beta2 * *v + (1. - self.beta2) * *g * *g;
        }

        let alpha = -self.l_rate * f32::sqrt(1. - self.beta2_pow) / (1. - self.beta1_pow);

        for ((w, m), v) in weights.iter_mut().zip(&self.momentum).zip(&self.velocity) {
            *w += alpha * *m / (v.sqrt() + self.epsilon);
        }

        self.beta1_pow *= self.beta1;
        self.beta2_pow *= self.beta2;
        Ok(())
    }

    fn reset(&mut self) {
        self.momentum.iter_mut().for_each(|m| *m = 0.);
        self.velocity.iter_mut().for_each(|v| *v = 0.);
        self.beta1_pow = self.beta1;
        self.beta2_pow = self.beta2;
    }
}

impl Adam {
    pub fn new(beta1: f32, beta2: f32, epsilon: f32, l_rate: f32, len: usize) -> Self {
        Self {
            momentum: vec![0.; len],
            velocity: vec![0.; len],
            beta1,
            beta2,
            epsilon,
            beta1_pow: beta1,
            beta2_pow: beta2,
            l_rate,
        }
    }
}

/// Hyper-parameters of [Adam](self::Adam).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub l_rate: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 0.001,
            l_rate: 0.01,
        }
    }
}

impl AdamConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn beta1(mut self, beta1: f32) -> Self {
        self.beta1 = beta1;
        self
    }

    pub fn beta2(mut self, beta2: f32) -> Self {
        self.beta2 = beta2;
        self
    }

    pub fn epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn l_rate(mut self, l_rate: f32) -> Self {
        self.l_rate = l_rate;
        self
    }
}

impl AlgBuilder for AdamConfig {
    type Output = Adam;

    fn build(&self, len: usize) -> Self::Output {
        Adam::new(self.beta1, self.beta2, self.epsilon, self.l_rate, len)
    }
}
