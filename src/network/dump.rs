use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::layers::{check_values, Layer};
use crate::session::{Session, SessionConfig};

use super::{Architecture, DeepNeuralNetwork, Model, NetworkConfig, NetworkValues};

/// Reconstruction recipes of initialization arguments that cannot be serialized as is,
/// by argument name.
pub type RebuildHints = BTreeMap<String, Value>;

/// Everything needed to rebuild a network and restore its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDump {
    #[serde(rename = "__init__")]
    pub init: Value,
    #[serde(rename = "__class__")]
    pub class: String,
    #[serde(rename = "__rebuild_init__", default)]
    pub rebuild_init: Option<RebuildHints>,
    pub architecture: Architecture,
    #[serde(default)]
    pub readout_architecture: Architecture,
    pub values: NetworkValues,
}

impl ModelDump {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_owned()));
        }
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the dump in a single call.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = serde_json::to_string(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    fn session_recipe(&self) -> Result<Option<SessionConfig>> {
        match self.rebuild_init.as_ref().and_then(|hints| hints.get("session")) {
            Some(recipe) => Ok(Some(serde_json::from_value(recipe.clone())?)),
            None => Ok(None),
        }
    }
}

/// Restore a network from a dump at `path`.
///
/// Without `model`, a network is rebuilt from the dumped initialization arguments and
/// returned. Otherwise the dumped values are restored into `model` and nothing is
/// returned. Either way the dump must come from a network of the same class and
/// architecture; no value is written otherwise.
pub fn load_dumped_model<M, P>(
    path: P,
    model: Option<&mut DeepNeuralNetwork<M>>,
) -> Result<Option<DeepNeuralNetwork<M>>>
where
    M: Model,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let dump = ModelDump::load(path)?;
    if dump.class != M::CLASS_PATH {
        return Err(Error::ClassMismatch {
            expected: M::CLASS_PATH.to_owned(),
            found: dump.class,
        });
    }

    match model {
        Some(net) => {
            restore_values(net, &dump)?;
            info!("Restored parameter values from '{}'", path.display());
            Ok(None)
        }
        None => {
            let config = NetworkConfig::<M::Options>::from_value(dump.init.clone())?;
            let mut net = match dump.session_recipe()? {
                Some(session) => DeepNeuralNetwork::with_session(config, Session::new(session))?,
                None => DeepNeuralNetwork::new(config)?,
            };
            restore_values(&mut net, &dump)?;
            info!("Loaded {} from '{}'", M::CLASS_PATH, path.display());
            Ok(Some(net))
        }
    }
}

fn restore_values<M: Model>(net: &mut DeepNeuralNetwork<M>, dump: &ModelDump) -> Result<()> {
    if net.architecture() != dump.architecture
        || net.readout_architecture() != dump.readout_architecture
    {
        return Err(Error::ArchitectureMismatch);
    }
    let layers: Vec<_> = net
        .core
        .layers
        .iter()
        .chain(net.core.readout_layers.iter())
        .collect();
    if let Some(name) = dump
        .values
        .keys()
        .find(|name| !layers.iter().any(|(n, _)| *n == name.as_str()))
    {
        return Err(Error::Shape(format!(
            "Dumped values hold an unknown layer '{}'.",
            name
        )));
    }
    for (name, layer) in &layers {
        let values = dump
            .values
            .get(*name)
            .ok_or_else(|| Error::Shape(format!("Missing values for layer '{}'.", name)))?;
        check_values(&layer.params(), values)?;
    }
    for (name, layer) in &layers {
        layer.set_values(&dump.values[*name], &mut net.session)?;
    }
    Ok(())
}
