use std::convert::TryFrom;
use std::fmt;

use enum_dispatch::enum_dispatch;
use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Short names of the available activation functions.
pub const ACTIVATION_NAMES: [&str; 7] = [
    "identity", "binary", "relu", "sigmoid", "softmax", "softplus", "tanh",
];

/// Activation functions operate on 2-D arrays of shape (samples, units).
/// Element-wise functions only need to implement `evaluate` and `derivative`.
#[enum_dispatch]
pub trait ActivFunc {
    fn name(&self) -> &'static str;

    fn evaluate(&self, x: f32) -> f32;

    /// Derivative given the pre-activation `inp` and the output `out`.
    fn derivative(&self, inp: f32, out: f32) -> f32;

    fn forward(&self, inp: &Array2<f32>) -> Array2<f32> {
        inp.mapv(|x| self.evaluate(x))
    }

    /// Propagate `grads` (taken w.r.t. the outputs) back to the pre-activations.
    fn backward(&self, inp: &Array2<f32>, out: &Array2<f32>, grads: &Array2<f32>) -> Array2<f32> {
        let mut res = grads.clone();
        Zip::from(&mut res)
            .and(inp)
            .and(out)
            .for_each(|g, &i, &o| *g *= self.derivative(i, o));
        res
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Identity;
impl ActivFunc for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }
    fn evaluate(&self, x: f32) -> f32 {
        x
    }
    fn derivative(&self, _: f32, _: f32) -> f32 {
        1.
    }
}

/// Binary step on the input's positivity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Binary;
impl ActivFunc for Binary {
    fn name(&self) -> &'static str {
        "binary"
    }
    fn evaluate(&self, x: f32) -> f32 {
        if x > 0. {
            1.
        } else {
            0.
        }
    }
    fn derivative(&self, _: f32, _: f32) -> f32 {
        0.
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReLU;
impl ActivFunc for ReLU {
    fn name(&self) -> &'static str {
        "relu"
    }
    fn evaluate(&self, x: f32) -> f32 {
        f32::max(x, 0.)
    }
    fn derivative(&self, inp: f32, _out: f32) -> f32 {
        if inp > 0. {
            1.
        } else {
            0.
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sigmoid;
impl ActivFunc for Sigmoid {
    fn name(&self) -> &'static str {
        "sigmoid"
    }
    fn evaluate(&self, x: f32) -> f32 {
        1. / (1. + (-x).exp())
    }
    fn derivative(&self, _: f32, out: f32) -> f32 {
        out * (1. - out)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Softplus;
impl ActivFunc for Softplus {
    fn name(&self) -> &'static str {
        "softplus"
    }
    fn evaluate(&self, x: f32) -> f32 {
        // ln(1 + e^x) without overflowing for large x
        f32::max(x, 0.) + (-x.abs()).exp().ln_1p()
    }
    fn derivative(&self, inp: f32, _: f32) -> f32 {
        Sigmoid.evaluate(inp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TanH;
impl ActivFunc for TanH {
    fn name(&self) -> &'static str {
        "tanh"
    }
    fn evaluate(&self, x: f32) -> f32 {
        x.tanh()
    }
    fn derivative(&self, _inp: f32, out: f32) -> f32 {
        1. - out * out
    }
}

/// Row-wise softmax. Not element-wise, so both array methods are overridden.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Softmax;
impl ActivFunc for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }
    fn evaluate(&self, x: f32) -> f32 {
        x.exp()
    }
    fn derivative(&self, _: f32, out: f32) -> f32 {
        out * (1. - out)
    }

    fn forward(&self, inp: &Array2<f32>) -> Array2<f32> {
        let mut out = inp.clone();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|x| x / sum);
        }
        out
    }

    fn backward(&self, _inp: &Array2<f32>, out: &Array2<f32>, grads: &Array2<f32>) -> Array2<f32> {
        let mut res = Array2::zeros(out.raw_dim());
        for ((mut r, o), g) in res
            .axis_iter_mut(Axis(0))
            .zip(out.axis_iter(Axis(0)))
            .zip(grads.axis_iter(Axis(0)))
        {
            let dot = (&o * &g).sum();
            Zip::from(&mut r)
                .and(&o)
                .and(&g)
                .for_each(|r, &o, &g| *r = o * (g - dot));
        }
        res
    }
}

/// Any of the registered activation functions. Serialized as its short name.
#[enum_dispatch(ActivFunc)]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Activation {
    Identity,
    Binary,
    ReLU,
    Sigmoid,
    Softmax,
    Softplus,
    TanH,
}

impl Activation {
    /// Look an activation function up by its short name.
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "identity" => Identity.into(),
            "binary" => Binary.into(),
            "relu" => ReLU.into(),
            "sigmoid" => Sigmoid.into(),
            "softmax" => Softmax.into(),
            "softplus" => Softplus.into(),
            "tanh" => TanH.into(),
            _ => {
                return Err(Error::Lookup {
                    kind: "activation function",
                    name: name.to_owned(),
                })
            }
        })
    }
}

impl TryFrom<String> for Activation {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Activation::from_name(&value)
    }
}

impl From<Activation> for String {
    fn from(activation: Activation) -> Self {
        activation.name().to_owned()
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
