pub mod dense_layer;
pub mod factory;
pub mod filter;
pub mod kwargs;
pub mod rnn;

pub use dense_layer::DenseLayer;
pub use factory::{get_layer_class, Capability, LayerClass, LayerKind, LAYER_KINDS};
pub use filter::LowpassFilter;
pub use kwargs::{Kwargs, KwargsReader};
pub use rnn::{BidirectionalRnn, CellType, RecurrentStack};

use std::collections::BTreeMap;
use std::fmt;

use enum_dispatch::enum_dispatch;
use ndarray::{Array2, IxDyn};
use rand::rngs::SmallRng;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::activations::Activation;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::storage::{check_value_shape, Param, Storage};
use crate::Tensor;

use self::dense_layer::DenseCache;
use self::filter::FilterCache;
use self::rnn::{BiRnnCache, RnnCache};

/// Values of a layer's parameters, by parameter name.
pub type LayerValues = BTreeMap<String, Tensor>;

/// Symbolic shape of a tensor. Unknown dimensions (batch size, sequence length) are `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorShape(Vec<Option<usize>>);

impl TensorShape {
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Self(dims)
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn last(&self) -> Option<usize> {
        self.0.last().copied().flatten()
    }

    /// Same shape with the last dimension replaced.
    pub fn with_last(&self, size: usize) -> Self {
        let mut dims = self.0.clone();
        if let Some(last) = dims.last_mut() {
            *last = Some(size);
        }
        Self(dims)
    }

    /// Check that a concrete shape is compatible with this one.
    pub fn check(&self, shape: &[usize], name: &str) -> Result<()> {
        let compatible = shape.len() == self.rank()
            && self
                .0
                .iter()
                .zip(shape)
                .all(|(expected, got)| expected.map_or(true, |e| e == *got));
        if compatible {
            Ok(())
        } else {
            Err(Error::Shape(format!(
                "Invalid '{}' shape: {:?} is incompatible with {}.",
                name, shape, self
            )))
        }
    }
}

impl From<Vec<Option<usize>>> for TensorShape {
    fn from(dims: Vec<Option<usize>>) -> Self {
        Self(dims)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self
            .0
            .iter()
            .map(|d| d.map_or_else(|| "?".to_owned(), |d| d.to_string()))
            .collect();
        write!(f, "({})", dims.join(", "))
    }
}

/// Dropout keep probability applied to a layer's outputs during training.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KeepProb {
    /// Use the keep probability fed to the network at training time.
    Shared,
    Fixed(f32),
    /// Never apply dropout to this layer.
    Disabled,
}

impl KeepProb {
    /// Parse the `keep_prob` keyword argument of a layer. A missing key means `Shared`
    /// while an explicit null disables dropout.
    pub fn from_kwarg(value: Option<Value>) -> Result<Self> {
        match value {
            None => Ok(KeepProb::Shared),
            Some(Value::Null) => Ok(KeepProb::Disabled),
            Some(Value::String(s)) if s == "shared" => Ok(KeepProb::Shared),
            Some(Value::Number(n)) => {
                let p = n.as_f64().unwrap_or(f64::NAN) as f32;
                check_keep_prob(p)?;
                Ok(KeepProb::Fixed(p))
            }
            Some(other) => Err(Error::type_mismatch("keep_prob", "float or None", &other)),
        }
    }

    /// Probability to use given the network-wide one, if dropout applies at all.
    pub fn resolve(&self, shared: Option<f32>) -> Option<f32> {
        let p = match *self {
            KeepProb::Shared => shared?,
            KeepProb::Fixed(p) => p,
            KeepProb::Disabled => return None,
        };
        if p < 1. {
            Some(p)
        } else {
            None
        }
    }
}

pub(crate) fn check_keep_prob(p: f32) -> Result<()> {
    if p > 0. && p <= 1. {
        Ok(())
    } else {
        Err(Error::Value(format!(
            "'keep_prob' must be in ]0, 1], got {}.",
            p
        )))
    }
}

impl Serialize for KeepProb {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            KeepProb::Shared => s.serialize_str("shared"),
            KeepProb::Fixed(p) => s.serialize_f32(*p),
            KeepProb::Disabled => s.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for KeepProb {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(d)?;
        KeepProb::from_kwarg(Some(value)).map_err(serde::de::Error::custom)
    }
}

/// Primary parameter of a layer specification: a number of units, a list of them
/// (one per stacked recurrent layer) or a cutoff frequency.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PrimaryParam {
    Int(i64),
    List(Vec<i64>),
    Float(f64),
}

impl PrimaryParam {
    pub fn from_value(value: &Value) -> Result<Self> {
        let wrong = || Error::type_mismatch("layer config primary parameter", "int, list or tuple", value);
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(PrimaryParam::Int(i)),
                None => n.as_f64().map(PrimaryParam::Float).ok_or_else(wrong),
            },
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_i64().ok_or_else(wrong))
                .collect::<Result<Vec<_>>>()
                .map(PrimaryParam::List),
            _ => Err(wrong()),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            PrimaryParam::Int(_) => "int",
            PrimaryParam::List(_) => "list",
            PrimaryParam::Float(_) => "float",
        }
    }

    /// Interpret the parameter as a single positive number of units.
    pub fn units(&self, name: &str) -> Result<usize> {
        match *self {
            PrimaryParam::Int(n) => crate::error::check_positive_int(n, name),
            _ => Err(self.mismatch(name, "int")),
        }
    }

    /// Interpret the parameter as a non-empty sequence of positive numbers of units.
    pub fn units_list(&self, name: &str) -> Result<Vec<usize>> {
        match self {
            PrimaryParam::Int(n) => Ok(vec![crate::error::check_positive_int(*n, name)?]),
            PrimaryParam::List(list) if !list.is_empty() => list
                .iter()
                .map(|n| crate::error::check_positive_int(*n, name))
                .collect(),
            PrimaryParam::List(_) => Err(Error::Value(format!("'{}' must not be empty.", name))),
            PrimaryParam::Float(_) => Err(self.mismatch(name, "int or list")),
        }
    }

    /// Interpret the parameter as a frequency.
    pub fn frequency(&self, name: &str) -> Result<f32> {
        match *self {
            PrimaryParam::Int(n) => Ok(n as f32),
            PrimaryParam::Float(x) => Ok(x as f32),
            PrimaryParam::List(_) => Err(self.mismatch(name, "int or float")),
        }
    }

    fn mismatch(&self, name: &str, expected: &str) -> Error {
        Error::TypeMismatch {
            name: name.to_owned(),
            expected: expected.to_owned(),
            got: self.kind_name().to_owned(),
        }
    }
}

impl From<usize> for PrimaryParam {
    fn from(n: usize) -> Self {
        PrimaryParam::Int(n as i64)
    }
}

impl From<Vec<usize>> for PrimaryParam {
    fn from(list: Vec<usize>) -> Self {
        PrimaryParam::List(list.into_iter().map(|n| n as i64).collect())
    }
}

impl From<f64> for PrimaryParam {
    fn from(x: f64) -> Self {
        PrimaryParam::Float(x)
    }
}

/// Configuration of a built layer, as recorded in a network's architecture descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum LayerConfig {
    DenseLayer {
        n_inputs: usize,
        n_units: usize,
        activation: Activation,
        bias: bool,
        keep_prob: KeepProb,
    },
    RnnStack {
        n_inputs: usize,
        n_units: Vec<usize>,
        cell_type: CellType,
        activation: Activation,
        keep_prob: KeepProb,
    },
    BiRnnStack {
        n_inputs: usize,
        n_units: Vec<usize>,
        cell_type: CellType,
        activation: Activation,
        keep_prob: KeepProb,
    },
    LowpassFilter {
        n_inputs: usize,
        cutoff: f32,
        sampling_rate: f32,
        window: usize,
        learnable: bool,
    },
}

/// Borrowed state needed to evaluate layers.
pub struct RunContext<'a> {
    pub storage: &'a Storage,
    pub rng: &'a mut SmallRng,
    /// Whether dropout applies.
    pub training: bool,
    /// Network-wide keep probability.
    pub keep_prob: Option<f32>,
}

impl<'a> RunContext<'a> {
    /// Keep probability in force for a layer, if dropout should be applied.
    pub fn dropout(&self, keep_prob: KeepProb) -> Option<f32> {
        if self.training {
            keep_prob.resolve(self.keep_prob)
        } else {
            None
        }
    }
}

/// Intermediate values recorded by a layer's forward pass, needed to compute gradients.
#[derive(Debug, Clone)]
pub enum LayerCache {
    Dense(DenseCache),
    Recurrent(RnnCache),
    Bidirectional(BiRnnCache),
    Filter(FilterCache),
}

pub(crate) fn cache_mismatch() -> Error {
    Error::OutOfOrder {
        phase: "backward",
        requires: "forward",
    }
}

#[enum_dispatch]
pub trait Layer {
    fn kind(&self) -> LayerKind;

    fn configuration(&self) -> LayerConfig;

    fn input_shape(&self) -> &TensorShape;

    /// Shape of the layer's output, against which the next layer is built.
    fn output_shape(&self) -> &TensorShape;

    /// All parameters of the layer, by name.
    fn params(&self) -> Vec<(String, &Param)>;

    /// Trainable weight and bias parameters.
    fn weights(&self) -> Vec<&Param> {
        self.params().into_iter().map(|(_, p)| p).collect()
    }

    fn forward(&self, input: &Tensor, ctx: &mut RunContext<'_>) -> Result<(Tensor, LayerCache)>;

    /// Accumulate parameter gradients into `grads` and return the gradients w.r.t. the input.
    fn backward(
        &self,
        cache: &LayerCache,
        out_grads: &Tensor,
        storage: &Storage,
        grads: &mut Storage,
    ) -> Result<Tensor>;

    fn get_values(&self, session: &Session) -> Result<LayerValues> {
        self.params()
            .into_iter()
            .map(|(name, param)| Ok((name, session.storage().array(param)?)))
            .collect()
    }

    /// Assign parameter values. Nothing is written unless every value matches.
    fn set_values(&self, values: &LayerValues, session: &mut Session) -> Result<()> {
        let params = self.params();
        check_values(&params, values)?;
        for (name, param) in params {
            session.storage_mut().assign(param, &values[&name])?;
        }
        Ok(())
    }
}

/// Check that `values` holds a correctly shaped value for every parameter, and nothing else.
pub fn check_values(params: &[(String, &Param)], values: &LayerValues) -> Result<()> {
    if values.len() != params.len() {
        return Err(Error::Shape(format!(
            "Expected values for {} parameters, got {}.",
            params.len(),
            values.len()
        )));
    }
    for (name, param) in params {
        let value = values
            .get(name)
            .ok_or_else(|| Error::Shape(format!("Missing value for parameter '{}'.", name)))?;
        check_value_shape(param, value)?;
    }
    Ok(())
}

/// A live layer of any of the supported kinds.
#[enum_dispatch(Layer)]
#[derive(Debug, Clone)]
pub enum LayerType {
    DenseLayer,
    RecurrentStack,
    BidirectionalRnn,
    LowpassFilter,
}

/// Flatten all but the last axis of `x`, checking that the last one has `cols` elements.
pub(crate) fn to_matrix(x: &Tensor, cols: usize) -> Result<Array2<f32>> {
    if x.ndim() < 2 || x.shape()[x.ndim() - 1] != cols {
        return Err(Error::Shape(format!(
            "Expected an input of rank >= 2 with {} features, got shape {:?}.",
            cols,
            x.shape()
        )));
    }
    let rows = x.len() / cols;
    x.as_standard_layout()
        .into_owned()
        .into_shape((rows, cols))
        .map_err(|e| Error::Shape(e.to_string()))
}

pub(crate) fn from_matrix(m: Array2<f32>, shape: &[usize]) -> Result<Tensor> {
    m.into_shape(IxDyn(shape))
        .map_err(|e| Error::Shape(e.to_string()))
}

/// Draw an inverted dropout mask: kept units are scaled by `1 / keep_prob`.
pub(crate) fn dropout_mask(rng: &mut SmallRng, dim: (usize, usize), keep_prob: f32) -> Array2<f32> {
    let scale = keep_prob.recip();
    Array2::from_shape_simple_fn(dim, || {
        if rng.gen::<f32>() < keep_prob {
            scale
        } else {
            0.
        }
    })
}
