use serde::{Deserialize, Serialize};

use super::*;

/// Gradient descent simply steps the weights based on their derivatives.
#[derive(Clone, Debug)]
pub struct GradientDescent {
    l_rate: f32,
}

impl OptimizerAlg for GradientDescent {
    fn update_weights(&mut self, weights: &mut [f32], gradients: &[f32]) -> Result<()> {
        check_lengths(weights.len(), gradients.len())?;
        let k = -self.l_rate;
        for (w, d) in weights.iter_mut().zip(gradients) {
            *w += k * *d;
        }
        Ok(())
    }
}

impl GradientDescent {
    pub fn builder() -> GradDescConfig {
        Default::default()
    }

    pub fn new(l_rate: f32) -> Self {
        Self { l_rate }
    }
}

/// Constructor for [GradientDescent](self::GradientDescent)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradDescConfig {
    pub l_rate: f32,
}

impl Default for GradDescConfig {
    fn default() -> Self {
        Self { l_rate: 0.01 }
    }
}

impl GradDescConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn l_rate(mut self, l_rate: f32) -> Self {
        self.l_rate = l_rate;
        self
    }
}

impl AlgBuilder for GradDescConfig {
    type Output = GradientDescent;

    fn build(&self, _len: usize) -> Self::Output {
        GradientDescent::new(self.l_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_against_the_gradient() {
        let mut alg = GradDescConfig::new().l_rate(0.5).build(2);
        let mut weights = [1., -1.];
        alg.update_weights(&mut weights, &[2., -4.]).unwrap();
        assert_eq!(weights, [0., 1.]);
        assert!(alg.update_weights(&mut weights, &[1.]).is_err());
    }
}
