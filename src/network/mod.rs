pub mod config;
pub mod dump;
pub mod mlp;

pub use self::config::{LayerSpec, NetworkConfig, NoOptions};
pub use self::dump::{load_dumped_model, ModelDump, RebuildHints};
pub use self::mlp::{MlpOptions, MultilayerPerceptron, Readout};

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};
use serde::de::{DeserializeOwned, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::layers::{
    Capability, Kwargs, Layer, LayerCache, LayerConfig, LayerKind, LayerType, LayerValues,
    PrimaryParam, RunContext, TensorShape,
};
use crate::session::{Session, SessionConfig};
use crate::storage::{Allocator, Param, Storage};
use crate::Tensor;

use self::config::{LayerNamer, ResolvedSpec};

/// Source of the identities distinguishing coexisting networks.
static INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// Parameter values of every layer of a network, by layer name.
pub type NetworkValues = BTreeMap<String, LayerValues>;

/// Construction steps of a network, in the order they must run. Each runs exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Created,
    Validated,
    Placeholders,
    HiddenLayers,
    ReadoutLayer,
    Readouts,
    TrainingFunction,
}

impl Phase {
    /// Name of the step that completes this phase.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Created => "initialization",
            Phase::Validated => "validate_args",
            Phase::Placeholders => "build_placeholders",
            Phase::HiddenLayers => "build_hidden_layers",
            Phase::ReadoutLayer => "build_readout_layer",
            Phase::Readouts => "build_readouts",
            Phase::TrainingFunction => "build_training_function",
        }
    }

    fn previous(&self) -> Phase {
        match self {
            Phase::Created | Phase::Validated => Phase::Created,
            Phase::Placeholders => Phase::Validated,
            Phase::HiddenLayers => Phase::Placeholders,
            Phase::ReadoutLayer => Phase::HiddenLayers,
            Phase::Readouts => Phase::ReadoutLayer,
            Phase::TrainingFunction => Phase::Readouts,
        }
    }
}

/// Shapes of the values fed to the network.
#[derive(Clone, Debug, PartialEq)]
pub struct Placeholders {
    pub input: TensorShape,
    pub targets: TensorShape,
}

/// Ordered description of a stack of layers, by layer name. Two networks whose
/// architectures are equal can exchange parameter values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Architecture(Vec<(String, LayerConfig)>);

impl Architecture {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&LayerConfig> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LayerConfig)> {
        self.0.iter().map(|(n, c)| (n.as_str(), c))
    }
}

impl Serialize for Architecture {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_map(self.0.iter().map(|(n, c)| (n, c)))
    }
}

impl<'de> Deserialize<'de> for Architecture {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct OrderedMap;

        impl<'de> Visitor<'de> for OrderedMap {
            type Value = Architecture;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of layer names to layer configurations")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Architecture, A::Error> {
                let mut layers = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry()? {
                    layers.push(entry);
                }
                Ok(Architecture(layers))
            }
        }

        d.deserialize_map(OrderedMap)
    }
}

/// Forward values needed to backpropagate through a network.
#[derive(Debug, Clone)]
pub struct NetworkCache {
    hidden: Vec<LayerCache>,
    readout: Vec<LayerCache>,
}

/// An ordered stack of named layers, each fed with the previous one's output.
#[derive(Debug, Clone, Default)]
pub struct LayerStack {
    layers: Vec<(String, LayerType)>,
}

impl LayerStack {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&LayerType> {
        self.layers.iter().find(|(n, _)| n == name).map(|(_, l)| l)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LayerType)> {
        self.layers.iter().map(|(n, l)| (n.as_str(), l))
    }

    pub fn last(&self) -> Option<(&str, &LayerType)> {
        self.layers.last().map(|(n, l)| (n.as_str(), l))
    }

    fn push(&mut self, name: String, layer: LayerType) {
        self.layers.push((name, layer));
    }

    pub fn architecture(&self) -> Architecture {
        Architecture(
            self.layers
                .iter()
                .map(|(n, l)| (n.clone(), l.configuration()))
                .collect(),
        )
    }

    pub fn forward(
        &self,
        input: &Tensor,
        ctx: &mut RunContext<'_>,
    ) -> Result<(Tensor, Vec<LayerCache>)> {
        let mut caches = Vec::with_capacity(self.len());
        let mut output: Option<Tensor> = None;
        for (_, layer) in &self.layers {
            let (y, cache) = layer.forward(output.as_ref().unwrap_or(input), ctx)?;
            caches.push(cache);
            output = Some(y);
        }
        Ok((output.unwrap_or_else(|| input.clone()), caches))
    }

    pub fn backward(
        &self,
        caches: &[LayerCache],
        out_grads: &Tensor,
        storage: &Storage,
        grads: &mut Storage,
    ) -> Result<Tensor> {
        if caches.len() != self.len() {
            return Err(crate::layers::cache_mismatch());
        }
        let mut g: Option<Tensor> = None;
        for ((_, layer), cache) in self.layers.iter().zip(caches).rev() {
            g = Some(layer.backward(cache, g.as_ref().unwrap_or(out_grads), storage, grads)?);
        }
        Ok(g.unwrap_or_else(|| out_grads.clone()))
    }
}

/// The structure of a network: validated arguments, placeholders and layer stacks, along
/// with the layout of their parameters. This is what model hooks build upon.
#[derive(Debug)]
pub struct NetworkCore {
    instance: usize,
    phase: Phase,
    input_shape: TensorShape,
    n_targets: usize,
    norm_params: Option<Tensor>,
    specs: Vec<ResolvedSpec>,
    placeholders: Option<Placeholders>,
    layers: LayerStack,
    readout_layers: LayerStack,
    allocator: Allocator,
}

impl NetworkCore {
    fn new() -> Self {
        Self {
            instance: INSTANCES.fetch_add(1, Ordering::Relaxed),
            phase: Phase::Created,
            input_shape: TensorShape::new(Vec::new()),
            n_targets: 0,
            norm_params: None,
            specs: Vec::new(),
            placeholders: None,
            layers: LayerStack::default(),
            readout_layers: LayerStack::default(),
            allocator: Allocator::new(),
        }
    }

    /// Fail unless `phase` is the next one to run.
    fn check_phase(&self, phase: Phase) -> Result<()> {
        if self.phase >= phase {
            return Err(Error::AlreadyBuilt(phase.name()));
        }
        let requires = phase.previous();
        if self.phase != requires {
            return Err(Error::OutOfOrder {
                phase: phase.name(),
                requires: requires.name(),
            });
        }
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Network {}: {} done", self.instance, phase.name());
        self.phase = phase;
    }

    /// Identity of the network, unique within the process.
    pub fn instance(&self) -> usize {
        self.instance
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn input_shape(&self) -> &TensorShape {
        &self.input_shape
    }

    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    pub fn norm_params(&self) -> Option<&Tensor> {
        self.norm_params.as_ref()
    }

    pub fn placeholders(&self) -> Result<&Placeholders> {
        self.placeholders.as_ref().ok_or(Error::OutOfOrder {
            phase: "placeholders access",
            requires: Phase::Placeholders.name(),
        })
    }

    pub fn layers(&self) -> &LayerStack {
        &self.layers
    }

    pub fn readout_layers(&self) -> &LayerStack {
        &self.readout_layers
    }

    /// Shape of the values the next readout layer is built on: the output of the last
    /// readout layer, the top hidden layer or the input placeholder.
    pub fn top_shape(&self) -> Result<&TensorShape> {
        if let Some((_, layer)) = self.readout_layers.last() {
            return Ok(layer.output_shape());
        }
        if let Some((_, layer)) = self.layers.last() {
            return Ok(layer.output_shape());
        }
        Ok(&self.placeholders()?.input)
    }

    /// Number of scalar parameters allocated so far.
    pub fn param_len(&self) -> usize {
        self.allocator.len()
    }

    /// Every parameter of the network, hidden and readout layers alike.
    pub fn params(&self) -> Vec<&Param> {
        self.layers
            .iter()
            .chain(self.readout_layers.iter())
            .flat_map(|(_, layer)| layer.params().into_iter().map(|(_, p)| p))
            .collect()
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.layers.contains(name) || self.readout_layers.contains(name) {
            return Err(Error::Config(format!("duplicate layer name '{}'.", name)));
        }
        Ok(())
    }

    /// Build a readout layer on top of the network. Only valid while the readout layer
    /// is being built.
    pub fn add_readout_layer(
        &mut self,
        kind: LayerKind,
        name: &str,
        param: &PrimaryParam,
        kwargs: Kwargs,
    ) -> Result<&LayerType> {
        let phase = Phase::ReadoutLayer;
        self.check_phase(phase)?;
        self.check_name(name)?;
        let input = self.top_shape()?.clone();
        let layer = kind.build(name, &input, param, kwargs, self.instance, &mut self.allocator)?;
        debug!(
            "Built readout layer '{}': {} -> {}",
            name,
            input,
            layer.output_shape()
        );
        self.readout_layers.push(name.to_owned(), layer);
        let (_, layer) = self.readout_layers.last().ok_or(Error::OutOfOrder {
            phase: phase.name(),
            requires: Phase::HiddenLayers.name(),
        })?;
        Ok(layer)
    }

    /// Run the hidden and readout stacks.
    pub fn forward(&self, input: &Tensor, ctx: &mut RunContext<'_>) -> Result<(Tensor, NetworkCache)> {
        self.placeholders()?.input.check(input.shape(), "input")?;
        let (top, hidden) = self.layers.forward(input, ctx)?;
        let (output, readout) = self.readout_layers.forward(&top, ctx)?;
        Ok((output, NetworkCache { hidden, readout }))
    }

    /// Accumulate every parameter's gradient given the gradient of the network's output.
    /// Returns the gradient w.r.t. the input.
    pub fn backward(
        &self,
        cache: &NetworkCache,
        out_grads: &Tensor,
        storage: &Storage,
        grads: &mut Storage,
    ) -> Result<Tensor> {
        let top = self
            .readout_layers
            .backward(&cache.readout, out_grads, storage, grads)?;
        self.layers.backward(&cache.hidden, &top, storage, grads)
    }
}

/// A concrete kind of network. Models define the readout layer, the outputs derived from
/// it and the way the network is trained, on top of the generic hidden stack.
pub trait Model: Sized {
    /// Identity of the model recorded in dumps.
    const CLASS_PATH: &'static str;

    /// Model specific initialization arguments.
    type Options: Clone + fmt::Debug + Default + PartialEq + Serialize + DeserializeOwned;

    fn from_options(options: &Self::Options) -> Self;

    /// Add the readout layer(s) with [`NetworkCore::add_readout_layer`].
    fn build_readout_layer(&mut self, core: &mut NetworkCore) -> Result<()>;

    /// Set up the outputs derived from the readout layer.
    fn build_readouts(&mut self, core: &NetworkCore) -> Result<()>;

    /// Set up the training step.
    fn build_training_function(&mut self, core: &NetworkCore) -> Result<()>;

    /// Called whenever the network's parameters are reset.
    fn reset_training_state(&mut self) {}

    /// Split the initialization arguments into a serializable record and reconstruction
    /// hints for the arguments that are not. An explicitly supplied session is recorded
    /// as a `"session"` hint holding its configuration.
    fn adjust_init_arguments_for_saving(
        config: &NetworkConfig<Self::Options>,
        session: Option<&SessionConfig>,
    ) -> Result<(Value, Option<RebuildHints>)> {
        let init = serde_json::to_value(config)?;
        let hints = match session {
            Some(session) => {
                let mut hints = RebuildHints::new();
                hints.insert("session".to_owned(), serde_json::to_value(session)?);
                Some(hints)
            }
            None => None,
        };
        Ok((init, hints))
    }
}

/// A deep neural network: a configurable stack of hidden layers topped by the readout
/// defined by the model `M`, along with the session holding its parameters.
pub struct DeepNeuralNetwork<M: Model> {
    config: NetworkConfig<M::Options>,
    explicit_session: bool,
    core: NetworkCore,
    model: M,
    session: Session,
}

impl<M: Model> DeepNeuralNetwork<M> {
    /// Build the network and randomly initialize its parameters in a new session.
    pub fn new(config: NetworkConfig<M::Options>) -> Result<Self> {
        Self::build(config, None)
    }

    /// Build the network within an existing session. The session's current values are
    /// kept when they fit the network's parameters; an empty session is left zeroed.
    pub fn with_session(config: NetworkConfig<M::Options>, session: Session) -> Result<Self> {
        Self::build(config, Some(session))
    }

    fn build(config: NetworkConfig<M::Options>, session: Option<Session>) -> Result<Self> {
        let explicit_session = session.is_some();
        let mut net = Self {
            model: M::from_options(&config.options),
            config,
            explicit_session,
            core: NetworkCore::new(),
            session: session.unwrap_or_default(),
        };
        net.validate_args()?;
        net.build_placeholders()?;
        net.build_hidden_layers()?;
        net.build_readout_layer()?;
        net.build_readouts()?;
        net.build_training_function()?;

        let len = net.core.param_len();
        if explicit_session {
            if net.session.bind(len)? && len > 0 {
                warn!(
                    "Network {} adopted an empty session: its {} parameter values are uninitialized.",
                    net.core.instance, len
                );
            }
        } else {
            net.reset_model(false)?;
        }
        info!(
            "Built {} {} with {} parameter values",
            M::CLASS_PATH,
            net.core.instance,
            len
        );
        Ok(net)
    }

    /// Check the initialization arguments.
    pub fn validate_args(&mut self) -> Result<()> {
        self.core.check_phase(Phase::Validated)?;
        let valid = self.config.validate()?;
        self.core.input_shape = valid.input_shape;
        self.core.n_targets = valid.n_targets;
        self.core.norm_params = valid.norm_params;
        self.core.specs = valid.layers;
        self.core.enter(Phase::Validated);
        Ok(())
    }

    pub fn build_placeholders(&mut self) -> Result<()> {
        self.core.check_phase(Phase::Placeholders)?;
        let input = self.core.input_shape.clone();
        let targets = input.with_last(self.core.n_targets);
        self.core.placeholders = Some(Placeholders { input, targets });
        self.core.enter(Phase::Placeholders);
        Ok(())
    }

    /// Build the hidden layers in configuration order, each on top of the previous one.
    pub fn build_hidden_layers(&mut self) -> Result<()> {
        self.core.check_phase(Phase::HiddenLayers)?;
        let specs = std::mem::take(&mut self.core.specs);
        let mut namer = LayerNamer::default();
        let mut shape = self.core.placeholders()?.input.clone();
        for spec in &specs {
            let name = namer.next(&spec.token, spec.name.as_deref());
            self.core.check_name(&name)?;
            let mut kwargs = spec.kwargs.clone();
            kwargs.remove("name");
            let layer = spec.kind.build(
                &name,
                &shape,
                &spec.param,
                kwargs,
                self.core.instance,
                &mut self.core.allocator,
            )?;
            debug!(
                "Built layer '{}' ({}): {} -> {}",
                name,
                spec.kind,
                shape,
                layer.output_shape()
            );
            shape = layer.output_shape().clone();
            self.core.layers.push(name, layer);
        }
        self.core.specs = specs;
        self.core.enter(Phase::HiddenLayers);
        Ok(())
    }

    pub fn build_readout_layer(&mut self) -> Result<()> {
        self.core.check_phase(Phase::ReadoutLayer)?;
        self.model.build_readout_layer(&mut self.core)?;
        self.core.enter(Phase::ReadoutLayer);
        Ok(())
    }

    pub fn build_readouts(&mut self) -> Result<()> {
        self.core.check_phase(Phase::Readouts)?;
        self.model.build_readouts(&self.core)?;
        self.core.enter(Phase::Readouts);
        Ok(())
    }

    pub fn build_training_function(&mut self) -> Result<()> {
        self.core.check_phase(Phase::TrainingFunction)?;
        self.model.build_training_function(&self.core)?;
        self.core.enter(Phase::TrainingFunction);
        Ok(())
    }

    /// The initialization arguments, as supplied.
    pub fn config(&self) -> &NetworkConfig<M::Options> {
        &self.config
    }

    pub fn options(&self) -> &M::Options {
        &self.config.options
    }

    pub fn input_shape(&self) -> &TensorShape {
        self.core.input_shape()
    }

    pub fn n_targets(&self) -> usize {
        self.core.n_targets()
    }

    pub fn norm_params(&self) -> Option<&Tensor> {
        self.core.norm_params()
    }

    pub fn core(&self) -> &NetworkCore {
        &self.core
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Configuration of every hidden layer, by layer name, in construction order.
    pub fn architecture(&self) -> Architecture {
        self.core.layers.architecture()
    }

    pub fn readout_architecture(&self) -> Architecture {
        self.core.readout_layers.architecture()
    }

    /// Current parameter values of every layer.
    pub fn get_values(&self) -> Result<NetworkValues> {
        self.core
            .layers
            .iter()
            .chain(self.core.readout_layers.iter())
            .map(|(name, layer)| Ok((name.to_owned(), layer.get_values(&self.session)?)))
            .collect()
    }

    /// Weight and bias parameters of the network's trainable layers. Filters are left out.
    pub fn layer_weights(&self) -> Vec<&Param> {
        self.core
            .layers
            .iter()
            .chain(self.core.readout_layers.iter())
            .filter(|(_, layer)| layer.kind().capability() != Capability::Filter)
            .flat_map(|(_, layer)| layer.weights())
            .collect()
    }

    /// The last hidden layer, if any.
    pub fn top_layer(&self) -> Option<(&str, &LayerType)> {
        self.core.layers.last()
    }

    /// Reinitialize every parameter. With `restart_session`, the session is first replaced
    /// by a fresh one with the same configuration.
    pub fn reset_model(&mut self, restart_session: bool) -> Result<()> {
        if restart_session {
            self.session = self.session.restart();
        }
        self.session.bind(self.core.param_len())?;
        self.session.initialize(self.core.params());
        self.model.reset_training_state();
        debug!("Network {}: parameters reset", self.core.instance);
        Ok(())
    }

    /// Dump the network's configuration and parameter values to `path`.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let session = if self.explicit_session {
            Some(self.session.config())
        } else {
            None
        };
        let (init, rebuild_init) = M::adjust_init_arguments_for_saving(&self.config, session)?;
        let dump = ModelDump {
            init,
            class: M::CLASS_PATH.to_owned(),
            rebuild_init,
            architecture: self.architecture(),
            readout_architecture: self.readout_architecture(),
            values: self.get_values()?,
        };
        dump.save(path)?;
        info!("Saved {} to '{}'", M::CLASS_PATH, path.display());
        Ok(())
    }

    /// Restore parameter values from a dump of a network with the same architecture.
    pub fn restore_model<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        load_dumped_model(path, Some(self)).map(|_| ())
    }
}
