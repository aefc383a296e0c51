pub use adam::{Adam, AdamConfig};
pub mod adam;

pub use gradient_descent::{GradDescConfig, GradientDescent};
pub mod gradient_descent;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// This trait provides interface which must be implemented by optimization
/// algorithms so that they can update a network's parameter storage.
#[enum_dispatch]
pub trait OptimizerAlg {
    /// Modifies the weights based on the gradients such that a minimum can be reached.
    fn update_weights(&mut self, weights: &mut [f32], gradients: &[f32]) -> Result<()>;

    /// Forget any state accumulated over previous updates.
    fn reset(&mut self) {}
}

/// Structs implementing this trait can be constructed into an instance of OptimizerAlg
/// by being provided the length of the data they work on.
pub trait AlgBuilder {
    type Output: OptimizerAlg;
    /// Receives data length and constructs Self::Output
    fn build(&self, len: usize) -> Self::Output;
}

/// Any of the available optimization algorithms.
#[enum_dispatch(OptimizerAlg)]
#[derive(Clone, Debug)]
pub enum Optimizer {
    Adam,
    GradientDescent,
}

/// Selects an optimization algorithm by its `algorithm` tag along with its hyper-parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam(AdamConfig),
    GradientDescent(GradDescConfig),
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam(AdamConfig::default())
    }
}

impl From<AdamConfig> for OptimizerConfig {
    fn from(config: AdamConfig) -> Self {
        OptimizerConfig::Adam(config)
    }
}

impl From<GradDescConfig> for OptimizerConfig {
    fn from(config: GradDescConfig) -> Self {
        OptimizerConfig::GradientDescent(config)
    }
}

impl AlgBuilder for OptimizerConfig {
    type Output = Optimizer;

    fn build(&self, len: usize) -> Optimizer {
        match self {
            OptimizerConfig::Adam(config) => config.build(len).into(),
            OptimizerConfig::GradientDescent(config) => config.build(len).into(),
        }
    }
}

fn check_lengths(weights: usize, gradients: usize) -> Result<()> {
    if weights == gradients {
        Ok(())
    } else {
        Err(Error::Shape(format!(
            "Got {} gradients for {} weights.",
            gradients, weights
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_is_tagged_by_algorithm() {
        let config: OptimizerConfig =
            serde_json::from_value(json!({"algorithm": "gradient_descent", "l_rate": 0.5})).unwrap();
        assert_eq!(config, GradDescConfig::new().l_rate(0.5).into());

        let config: OptimizerConfig = serde_json::from_value(json!({"algorithm": "adam"})).unwrap();
        assert_eq!(config, OptimizerConfig::default());

        let value = serde_json::to_value(OptimizerConfig::from(AdamConfig::new().l_rate(0.1))).unwrap();
        assert_eq!(value["algorithm"], json!("adam"));
        assert!(serde_json::from_value::<OptimizerConfig>(json!({"l_rate": 0.5})).is_err());
    }

    #[test]
    fn dispatch_to_the_selected_algorithm() {
        let mut optimizer = OptimizerConfig::from(GradDescConfig::new().l_rate(0.5)).build(2);
        assert!(matches!(optimizer, Optimizer::GradientDescent(_)));
        let mut weights = [1., 2.];
        optimizer.update_weights(&mut weights, &[1., -2.]).unwrap();
        assert_eq!(weights, [0.5, 3.]);
        assert!(matches!(
            optimizer.update_weights(&mut weights, &[1.]),
            Err(Error::Shape(_))
        ));

        let mut optimizer = OptimizerConfig::default().build(2);
        assert!(matches!(optimizer, Optimizer::Adam(_)));
        optimizer.update_weights(&mut weights, &[1., -2.]).unwrap();
        assert!(weights[0] < 0.5 && weights[1] > 3.);
        optimizer.reset();
    }
}
