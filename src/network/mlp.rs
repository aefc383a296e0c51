use log::warn;
use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::layers::{check_keep_prob, to_matrix, Kwargs, LayerKind, PrimaryParam, RunContext};
use crate::loss::{Loss, LossFunc, MeanSquared};
use crate::optimizer::{AlgBuilder, Optimizer, OptimizerAlg, OptimizerConfig};
use crate::storage::Storage;
use crate::Tensor;

use super::{DeepNeuralNetwork, Model, NetworkCore};

/// Options of a [MultilayerPerceptron].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpOptions {
    pub optimizer: OptimizerConfig,
}

/// Outputs a model can be asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readout {
    /// Readout layer output, in normalized target units.
    Raw,
    /// Raw output scaled back by the normalization parameters, if any.
    Prediction,
}

impl Readout {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "raw" => Ok(Readout::Raw),
            "prediction" => Ok(Readout::Prediction),
            _ => Err(Error::Lookup {
                kind: "readout",
                name: name.to_owned(),
            }),
        }
    }
}

/// Regression network predicting `n_targets` real values from the top hidden layer
/// through a linear readout layer. Trained on the mean squared error with the configured
/// optimizer.
#[derive(Debug, Clone)]
pub struct MultilayerPerceptron {
    optimizer_config: OptimizerConfig,
    scale: Option<Tensor>,
    optimizer: Option<Optimizer>,
}

impl Model for MultilayerPerceptron {
    const CLASS_PATH: &'static str = "ac2art::network::MultilayerPerceptron";

    type Options = MlpOptions;

    fn from_options(options: &MlpOptions) -> Self {
        Self {
            optimizer_config: options.optimizer.clone(),
            scale: None,
            optimizer: None,
        }
    }

    fn build_readout_layer(&mut self, core: &mut NetworkCore) -> Result<()> {
        let mut kwargs = Kwargs::new();
        kwargs.insert("activation".to_owned(), Value::from("identity"));
        kwargs.insert("keep_prob".to_owned(), Value::Null);
        let n_targets = PrimaryParam::from(core.n_targets());
        core.add_readout_layer(LayerKind::DenseLayer, "readout_layer", &n_targets, kwargs)?;
        Ok(())
    }

    fn build_readouts(&mut self, core: &NetworkCore) -> Result<()> {
        self.scale = core.norm_params().cloned();
        Ok(())
    }

    fn build_training_function(&mut self, core: &NetworkCore) -> Result<()> {
        self.optimizer = Some(self.optimizer_config.build(core.param_len()));
        Ok(())
    }

    fn reset_training_state(&mut self) {
        if let Some(optimizer) = &mut self.optimizer {
            optimizer.reset();
        }
    }
}

impl DeepNeuralNetwork<MultilayerPerceptron> {
    /// Evaluate one of the network's outputs, without dropout.
    pub fn readout(&mut self, readout: Readout, input: &Tensor) -> Result<Tensor> {
        let (storage, rng) = self.session.split();
        let mut ctx = RunContext {
            storage,
            rng,
            training: false,
            keep_prob: None,
        };
        let (raw, _) = self.core.forward(input, &mut ctx)?;
        Ok(match (readout, &self.model.scale) {
            (Readout::Prediction, Some(scale)) => raw * scale,
            _ => raw,
        })
    }

    /// Predict the targets associated with `input`, in de-normalized units.
    pub fn predict(&mut self, input: &Tensor) -> Result<Tensor> {
        self.readout(Readout::Prediction, input)
    }

    /// Root mean squared prediction error of each target, in de-normalized units.
    /// `targets` are expected in normalized units.
    pub fn score(&mut self, input: &Tensor, targets: &Tensor) -> Result<Array1<f32>> {
        self.core.placeholders()?.targets.check(targets.shape(), "targets")?;
        let raw = self.readout(Readout::Raw, input)?;
        let mut diff = raw - targets;
        if let Some(scale) = &self.model.scale {
            diff = diff * scale;
        }
        let mse = to_matrix(&diff, self.n_targets())?
            .mapv(|d| d * d)
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::Value("Cannot score an empty batch.".to_owned()))?;
        Ok(mse.mapv(f32::sqrt))
    }

    /// Run a single training step on a batch and return its loss. Dropout applies with
    /// `keep_prob` wherever the layers use the network-wide keep probability.
    pub fn run_training_function(
        &mut self,
        input: &Tensor,
        targets: &Tensor,
        keep_prob: f32,
    ) -> Result<f32> {
        check_keep_prob(keep_prob)?;
        self.core.placeholders()?.targets.check(targets.shape(), "targets")?;

        let (storage, rng) = self.session.split();
        let mut ctx = RunContext {
            storage,
            rng,
            training: true,
            keep_prob: Some(keep_prob),
        };
        let (raw, cache) = self.core.forward(input, &mut ctx)?;
        let Loss { loss, grads: out_grads } = MeanSquared.eval(&raw, targets)?;

        let mut grads = Storage::zeroed(self.session.storage().len());
        self.core
            .backward(&cache, &out_grads, self.session.storage(), &mut grads)?;
        let mut non_finite = 0;
        for g in grads.raw_mut() {
            if !g.is_finite() {
                *g = 0.;
                non_finite += 1;
            }
        }
        if non_finite > 0 {
            warn!("Replaced {} non-finite gradients by zero", non_finite);
        }

        let optimizer = self.model.optimizer.as_mut().ok_or(Error::OutOfOrder {
            phase: "run_training_function",
            requires: "build_training_function",
        })?;
        optimizer.update_weights(self.session.storage_mut().raw_mut(), grads.raw())?;
        Ok(loss)
    }
}
