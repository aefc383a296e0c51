use log::debug;
use ndarray::{Array2, Axis};

use crate::{
    activations::{ActivFunc, Activation},
    error::Result,
    initializer::Init,
    layers::{
        cache_mismatch, dropout_mask, from_matrix, to_matrix, KeepProb, KwargsReader, Layer,
        LayerCache, LayerConfig, LayerKind, PrimaryParam, RunContext, TensorShape,
    },
    storage::{Allocator, Param, Storage},
    Tensor,
};

/// Your run of the mill fully connected (dense) layer. Operates on the last axis of its input.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    input: TensorShape,
    output: TensorShape,
    n_inputs: usize,
    n_units: usize,
    activation: Activation,
    keep_prob: KeepProb,

    weight: Param,
    bias: Option<Param>,
}

#[derive(Debug, Clone)]
pub struct DenseCache {
    in_shape: Vec<usize>,
    input: Array2<f32>,
    weighted_inputs: Array2<f32>,
    activations: Array2<f32>,
    mask: Option<Array2<f32>>,
}

impl DenseLayer {
    pub fn new(
        input: &TensorShape,
        n_units: usize,
        activation: Activation,
        bias: bool,
        keep_prob: KeepProb,
        alloc: &mut Allocator,
    ) -> Result<Self> {
        let n_inputs = LayerKind::DenseLayer.input_width(input)?;
        let init = match activation {
            Activation::ReLU(_) | Activation::Softplus(_) => Init::Kaiming,
            _ => Init::Xavier,
        };
        let weight = alloc.allocate(&[n_inputs, n_units], init, n_inputs);
        let bias = if bias {
            Some(alloc.allocate(&[n_units], Init::Zeros, n_inputs))
        } else {
            None
        };

        Ok(Self {
            input: input.clone(),
            output: input.with_last(n_units),
            n_inputs,
            n_units,
            activation,
            keep_prob,
            weight,
            bias,
        })
    }

    /// Build the layer out of a layer specification's primary parameter and keyword arguments.
    pub fn from_spec(
        input: &TensorShape,
        param: &PrimaryParam,
        mut kwargs: KwargsReader<'_>,
        keep_prob: KeepProb,
        alloc: &mut Allocator,
    ) -> Result<Self> {
        let n_units = param.units("n_units")?;
        let activation = match kwargs.take_str("activation")? {
            Some(name) => Activation::from_name(&name)?,
            None => Activation::from_name("relu")?,
        };
        let bias = kwargs.take_bool("bias")?.unwrap_or(true);
        kwargs.finish()?;
        debug!(
            "Building dense layer: {} -> {} units ({})",
            input, n_units, activation
        );
        Self::new(input, n_units, activation, bias, keep_prob, alloc)
    }

    pub fn weight(&self) -> &Param {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Param> {
        self.bias.as_ref()
    }

    pub fn n_units(&self) -> usize {
        self.n_units
    }
}

impl Layer for DenseLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::DenseLayer
    }

    fn configuration(&self) -> LayerConfig {
        LayerConfig::DenseLayer {
            n_inputs: self.n_inputs,
            n_units: self.n_units,
            activation: self.activation,
            bias: self.bias.is_some(),
            keep_prob: self.keep_prob,
        }
    }

    fn input_shape(&self) -> &TensorShape {
        &self.input
    }

    fn output_shape(&self) -> &TensorShape {
        &self.output
    }

    fn params(&self) -> Vec<(String, &Param)> {
        let mut params = vec![("weight".to_owned(), &self.weight)];
        if let Some(bias) = &self.bias {
            params.push(("bias".to_owned(), bias));
        }
        params
    }

    fn forward(&self, input: &Tensor, ctx: &mut RunContext<'_>) -> Result<(Tensor, LayerCache)> {
        let x = to_matrix(input, self.n_inputs)?;
        let mut weighted_inputs = x.dot(&ctx.storage.matrix(&self.weight)?);
        if let Some(bias) = &self.bias {
            weighted_inputs += &ctx.storage.matrix(bias)?;
        }
        let activations = self.activation.forward(&weighted_inputs);

        let mask = ctx
            .dropout(self.keep_prob)
            .map(|p| dropout_mask(ctx.rng, activations.dim(), p));
        let output = match &mask {
            Some(mask) => &activations * mask,
            None => activations.clone(),
        };

        let mut out_shape = input.shape().to_vec();
        if let Some(last) = out_shape.last_mut() {
            *last = self.n_units;
        }
        let cache = DenseCache {
            in_shape: input.shape().to_vec(),
            input: x,
            weighted_inputs,
            activations,
            mask,
        };
        Ok((from_matrix(output, &out_shape)?, LayerCache::Dense(cache)))
    }

    fn backward(
        &self,
        cache: &LayerCache,
        out_grads: &Tensor,
        storage: &Storage,
        grads: &mut Storage,
    ) -> Result<Tensor> {
        let cache = match cache {
            LayerCache::Dense(cache) => cache,
            _ => return Err(cache_mismatch()),
        };
        let mut g = to_matrix(out_grads, self.n_units)?;
        if let Some(mask) = &cache.mask {
            g *= mask;
        }
        // derivatives w.r.t. the weighted inputs
        let g = self
            .activation
            .backward(&cache.weighted_inputs, &cache.activations, &g);

        grads
            .matrix_mut(&self.weight)?
            .scaled_add(1., &cache.input.t().dot(&g));
        if let Some(bias) = &self.bias {
            grads
                .matrix_mut(bias)?
                .scaled_add(1., &g.sum_axis(Axis(0)).insert_axis(Axis(0)));
        }

        let in_grads = g.dot(&storage.matrix(&self.weight)?.t());
        from_matrix(in_grads, &cache.in_shape)
    }
}
