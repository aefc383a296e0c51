use std::convert::TryFrom;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layers::{
    BidirectionalRnn, DenseLayer, KeepProb, Kwargs, KwargsReader, LayerType, LowpassFilter,
    PrimaryParam, RecurrentStack, TensorShape,
};
use crate::storage::Allocator;

/// The layer kinds that can be stacked in a network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    DenseLayer,
    RnnStack,
    BiRnnStack,
    LowpassFilter,
}

/// What a kind of layer does, which decides how the builder configures it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Trainable feed-forward transformation. Receives a keep probability.
    Neural,
    /// Trainable recurrent transformation. Receives a keep probability and a scope.
    Recurrent,
    /// Signal filter.
    Filter,
}

pub const LAYER_KINDS: [LayerKind; 4] = [
    LayerKind::DenseLayer,
    LayerKind::RnnStack,
    LayerKind::BiRnnStack,
    LayerKind::LowpassFilter,
];

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::DenseLayer => "dense_layer",
            LayerKind::RnnStack => "rnn_stack",
            LayerKind::BiRnnStack => "bi_rnn_stack",
            LayerKind::LowpassFilter => "lowpass_filter",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        LAYER_KINDS
            .iter()
            .copied()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| Error::Lookup {
                kind: "layer class",
                name: name.to_owned(),
            })
    }

    pub fn capability(&self) -> Capability {
        match self {
            LayerKind::DenseLayer => Capability::Neural,
            LayerKind::RnnStack | LayerKind::BiRnnStack => Capability::Recurrent,
            LayerKind::LowpassFilter => Capability::Filter,
        }
    }

    /// Check the rank of an input this kind of layer is built on, and return its
    /// (statically known) number of features.
    pub fn input_width(&self, input: &TensorShape) -> Result<usize> {
        let (accepted, expected) = match self {
            LayerKind::DenseLayer => (input.rank() >= 2, "a rank >= 2"),
            LayerKind::RnnStack | LayerKind::BiRnnStack => (input.rank() == 3, "a rank 3"),
            LayerKind::LowpassFilter => (matches!(input.rank(), 2 | 3), "a rank 2 or 3"),
        };
        if !accepted {
            return Err(Error::Shape(format!(
                "A '{}' layer requires {} input, got {}.",
                self, expected, input
            )));
        }
        input.last().ok_or_else(|| {
            Error::Shape(format!(
                "The last dimension of a '{}' layer's input must be known, got {}.",
                self, input
            ))
        })
    }

    /// Build a layer of this kind on top of `input`.
    ///
    /// `kwargs` must not contain the `name` override anymore. Trainable kinds consume
    /// `keep_prob` from it, and recurrent kinds are scoped as `<name>_<instance>` so that
    /// several networks can coexist.
    pub fn build(
        &self,
        name: &str,
        input: &TensorShape,
        param: &PrimaryParam,
        mut kwargs: Kwargs,
        instance: usize,
        alloc: &mut Allocator,
    ) -> Result<LayerType> {
        let keep_prob = match self.capability() {
            Capability::Neural | Capability::Recurrent => {
                KeepProb::from_kwarg(kwargs.remove("keep_prob"))?
            }
            Capability::Filter => KeepProb::Disabled,
        };
        let reader = KwargsReader::new(name, kwargs);
        let scope = || format!("{}_{}", name, instance);
        Ok(match self {
            LayerKind::DenseLayer => {
                DenseLayer::from_spec(input, param, reader, keep_prob, alloc)?.into()
            }
            LayerKind::RnnStack => {
                RecurrentStack::from_spec(input, param, reader, keep_prob, scope(), alloc)?.into()
            }
            LayerKind::BiRnnStack => {
                BidirectionalRnn::from_spec(input, param, reader, keep_prob, scope(), alloc)?
                    .into()
            }
            LayerKind::LowpassFilter => LowpassFilter::from_spec(input, param, reader, alloc)?.into(),
        })
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to a layer kind in a layer specification: either a short name or the kind
/// itself. Serialized as the short name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LayerClass {
    Name(String),
    Kind(LayerKind),
}

impl From<String> for LayerClass {
    fn from(name: String) -> Self {
        LayerClass::Name(name)
    }
}

impl From<&str> for LayerClass {
    fn from(name: &str) -> Self {
        LayerClass::Name(name.to_owned())
    }
}

impl From<LayerKind> for LayerClass {
    fn from(kind: LayerKind) -> Self {
        LayerClass::Kind(kind)
    }
}

impl From<LayerClass> for String {
    fn from(class: LayerClass) -> Self {
        match class {
            LayerClass::Name(name) => name,
            LayerClass::Kind(kind) => kind.name().to_owned(),
        }
    }
}

impl TryFrom<&LayerClass> for LayerKind {
    type Error = Error;

    fn try_from(class: &LayerClass) -> Result<Self> {
        get_layer_class(class)
    }
}

/// Resolve a layer class reference to the kind of layer it designates.
pub fn get_layer_class(class: &LayerClass) -> Result<LayerKind> {
    match class {
        LayerClass::Name(name) => LayerKind::from_name(name),
        LayerClass::Kind(kind) => Ok(*kind),
    }
}
