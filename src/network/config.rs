use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs;
use std::path::Path;

use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{check_positive_int, json_type_name, Error, Result};
use crate::layers::{get_layer_class, Kwargs, LayerClass, LayerKind, PrimaryParam, TensorShape};
use crate::Tensor;

/// One entry of a network's layers configuration: a layer class (or its short name), a
/// primary parameter (number of units or cutoff frequency) and keyword arguments.
///
/// Serialized as a `[class, param, kwargs]` array. Two-element arrays are accepted and
/// get empty keyword arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct LayerSpec {
    pub class: LayerClass,
    pub param: PrimaryParam,
    pub kwargs: Kwargs,
}

impl LayerSpec {
    pub fn new<C, P>(class: C, param: P) -> Self
    where
        C: Into<LayerClass>,
        P: Into<PrimaryParam>,
    {
        Self {
            class: class.into(),
            param: param.into(),
            kwargs: Kwargs::new(),
        }
    }

    pub fn with_kwargs<C, P>(class: C, param: P, kwargs: Kwargs) -> Self
    where
        C: Into<LayerClass>,
        P: Into<PrimaryParam>,
    {
        Self {
            class: class.into(),
            param: param.into(),
            kwargs,
        }
    }

    /// Set a single keyword argument.
    pub fn kwarg<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.kwargs.insert(key.to_owned(), value.into());
        self
    }
}

impl TryFrom<Vec<Value>> for LayerSpec {
    type Error = Error;

    fn try_from(items: Vec<Value>) -> Result<Self> {
        let n = items.len();
        let mut items = items.into_iter();
        let (class, param, kwargs) = match (items.next(), items.next(), items.next()) {
            (Some(class), Some(param), kwargs) if n == 2 || n == 3 => (class, param, kwargs),
            _ => {
                return Err(Error::Config(format!(
                    "entries must be tuples of length 2 or 3, got length {}.",
                    n
                )))
            }
        };
        let class = match class {
            Value::String(name) => LayerClass::Name(name),
            other => return Err(Error::type_mismatch("layer class", "str", &other)),
        };
        let param = PrimaryParam::from_value(&param)?;
        let kwargs = match kwargs {
            None => Kwargs::new(),
            Some(Value::Object(map)) => map,
            Some(other) => return Err(Error::type_mismatch("layer config kwargs", "dict", &other)),
        };
        Ok(Self {
            class,
            param,
            kwargs,
        })
    }
}

impl From<LayerSpec> for Vec<Value> {
    fn from(spec: LayerSpec) -> Self {
        let param = match spec.param {
            PrimaryParam::Int(n) => Value::from(n),
            PrimaryParam::List(list) => Value::from(list),
            PrimaryParam::Float(x) => Value::from(x),
        };
        vec![
            Value::String(spec.class.into()),
            param,
            Value::Object(spec.kwargs),
        ]
    }
}

/// Initialization arguments of a network. `O` holds the options specific to a model and
/// is flattened into the same record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig<O> {
    /// Shape of the network's inputs, with the number of samples as first component.
    pub input_shape: Vec<Option<i64>>,
    pub n_targets: i64,
    pub layers_config: Vec<LayerSpec>,
    /// Normalization parameters of the targets, of shape `(n_targets,)`.
    #[serde(default)]
    pub norm_params: Option<Tensor>,
    #[serde(flatten)]
    pub options: O,
}

impl<O: Default> NetworkConfig<O> {
    pub fn new(input_shape: Vec<Option<i64>>, n_targets: i64, layers_config: Vec<LayerSpec>) -> Self {
        Self {
            input_shape,
            n_targets,
            layers_config,
            norm_params: None,
            options: O::default(),
        }
    }
}

impl<O> NetworkConfig<O> {
    pub fn norm_params(mut self, norm_params: Tensor) -> Self {
        self.norm_params = Some(norm_params);
        self
    }

    pub fn options(mut self, options: O) -> Self {
        self.options = options;
        self
    }

    pub(crate) fn validate(&self) -> Result<ValidatedConfig> {
        if self.input_shape.len() < 2 {
            return Err(Error::Shape(
                "'input_shape' must be at least bi-dimensional.".to_owned(),
            ));
        }
        let dims = self
            .input_shape
            .iter()
            .map(|dim| match *dim {
                Some(d) => check_positive_int(d, "input_shape").map(Some),
                None => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;

        let layers = self
            .layers_config
            .iter()
            .map(|spec| {
                let kind = get_layer_class(&spec.class)?;
                let name = match spec.kwargs.get("name") {
                    None => None,
                    Some(Value::String(name)) => Some(name.clone()),
                    Some(other) => return Err(Error::type_mismatch("name", "str", other)),
                };
                Ok(ResolvedSpec {
                    kind,
                    token: String::from(spec.class.clone()),
                    name,
                    param: spec.param.clone(),
                    kwargs: spec.kwargs.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let n_targets = check_positive_int(self.n_targets, "n_targets")?;
        if let Some(norm_params) = &self.norm_params {
            if norm_params.shape() != [n_targets] {
                return Err(Error::Shape(format!(
                    "Wrong 'norm_params' shape: {:?} instead of ({},).",
                    norm_params.shape(),
                    n_targets
                )));
            }
        }

        Ok(ValidatedConfig {
            input_shape: TensorShape::new(dims),
            n_targets,
            layers,
            norm_params: self.norm_params.clone(),
        })
    }
}

impl<O: Serialize + DeserializeOwned> NetworkConfig<O> {
    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_owned()));
        }
        let text = fs::read_to_string(path)?;
        Self::from_value(serde_json::from_str(&text)?)
    }

    /// Parse a configuration out of a JSON record. Malformed layer entries and wrongly
    /// typed arguments are reported as such. Unrecognized keys are ignored with a warning.
    pub fn from_value(value: Value) -> Result<Self> {
        let fields = match &value {
            Value::Object(fields) => fields,
            other => return Err(Error::type_mismatch("network configuration", "dict", other)),
        };
        check_fields(fields)?;
        let config: Self = serde_json::from_value(value.clone())?;
        for key in config.unrecognized_keys(fields)? {
            warn!("Ignoring unrecognized configuration key '{}'", key);
        }
        Ok(config)
    }

    /// Keys of `fields` that no argument of the configuration accounts for.
    pub(crate) fn unrecognized_keys(&self, fields: &Map<String, Value>) -> Result<Vec<String>> {
        let known = match serde_json::to_value(self)? {
            Value::Object(known) => known,
            _ => Map::new(),
        };
        Ok(fields
            .keys()
            .filter(|key| !known.contains_key(*key))
            .cloned()
            .collect())
    }
}

fn check_fields(fields: &Map<String, Value>) -> Result<()> {
    if let Some(shape) = fields.get("input_shape") {
        let dims = shape
            .as_array()
            .ok_or_else(|| Error::type_mismatch("input_shape", "list", shape))?;
        if let Some(dim) = dims.iter().find(|d| !(d.is_null() || d.is_i64())) {
            return Err(Error::type_mismatch("input_shape", "int or None", dim));
        }
    }
    if let Some(n_targets) = fields.get("n_targets") {
        if !n_targets.is_i64() {
            return Err(Error::type_mismatch("n_targets", "int", n_targets));
        }
    }
    if let Some(layers) = fields.get("layers_config") {
        let entries = layers
            .as_array()
            .ok_or_else(|| Error::type_mismatch("layers_config", "list", layers))?;
        for entry in entries {
            match entry {
                Value::Array(items) => {
                    LayerSpec::try_from(items.clone())?;
                }
                other => {
                    return Err(Error::Config(format!(
                        "entries must be tuples of length 2 or 3, got {}.",
                        json_type_name(other)
                    )))
                }
            }
        }
    }
    Ok(())
}

/// Options of a model that has none of its own.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NoOptions {}

/// A layer specification whose class has been resolved.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedSpec {
    pub kind: LayerKind,
    /// Class token as written in the configuration, used to count layers.
    pub token: String,
    pub name: Option<String>,
    pub param: PrimaryParam,
    pub kwargs: Kwargs,
}

/// Checked initialization arguments.
#[derive(Clone, Debug)]
pub(crate) struct ValidatedConfig {
    pub input_shape: TensorShape,
    pub n_targets: usize,
    pub layers: Vec<ResolvedSpec>,
    pub norm_params: Option<Tensor>,
}

/// Generate unique layer names as `<class>_<n>`, counting layers per class token.
#[derive(Debug, Default)]
pub(crate) struct LayerNamer {
    counts: HashMap<String, usize>,
}

impl LayerNamer {
    /// Name of the next layer built from `token`. An explicit name takes precedence but
    /// still counts as an occurrence of the token.
    pub fn next(&mut self, token: &str, explicit: Option<&str>) -> String {
        let count = self.counts.entry(token.to_owned()).or_insert(0);
        let name = match explicit {
            Some(name) => name.to_owned(),
            None => format!("{}_{}", token, count),
        };
        *count += 1;
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use serde_json::json;

    type Config = NetworkConfig<NoOptions>;

    fn config(layers: Vec<LayerSpec>) -> Config {
        NetworkConfig {
            input_shape: vec![None, Some(40)],
            n_targets: 5,
            layers_config: layers,
            norm_params: None,
            options: NoOptions::default(),
        }
    }

    #[test]
    fn short_specs_get_empty_kwargs() {
        let spec: LayerSpec = serde_json::from_value(json!(["dense_layer", 32])).unwrap();
        assert_eq!(spec, LayerSpec::new("dense_layer", 32usize));
        let spec: LayerSpec =
            serde_json::from_value(json!(["rnn_stack", [8, 4], {"cell_type": "gru"}])).unwrap();
        assert_eq!(spec.kwargs["cell_type"], json!("gru"));
    }

    #[test]
    fn wrong_spec_length() {
        for value in [json!(["dense_layer"]), json!(["dense_layer", 3, {}, 1])] {
            let res = LayerSpec::try_from(serde_json::from_value::<Vec<Value>>(value).unwrap());
            assert!(matches!(res, Err(Error::Config(_))));
        }
    }

    #[test]
    fn wrong_spec_types() {
        let res = LayerSpec::try_from(vec![json!(3), json!(3)]);
        assert!(matches!(res, Err(Error::TypeMismatch { .. })));
        let res = LayerSpec::try_from(vec![json!("dense_layer"), json!(3), json!([1])]);
        assert!(matches!(res, Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn spec_serializes_as_triple() {
        let spec = LayerSpec::new("lowpass_filter", 20.5).kwarg("window", 3);
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!(["lowpass_filter", 20.5, {"window": 3}])
        );
    }

    #[test]
    fn validation_errors() {
        let mut cfg = config(vec![LayerSpec::new("dense_layer", 8usize)]);
        cfg.input_shape = vec![Some(40)];
        assert!(matches!(cfg.validate(), Err(Error::Shape(_))));

        for n in [0, -3] {
            let mut cfg = config(vec![LayerSpec::new("dense_layer", 8usize)]);
            cfg.n_targets = n;
            assert!(matches!(cfg.validate(), Err(Error::Value(_))));
        }

        let cfg = config(vec![LayerSpec::new("unknown_kind", 8usize)]);
        match cfg.validate() {
            Err(Error::Lookup { name, .. }) => assert_eq!(name, "unknown_kind"),
            other => panic!("unexpected result: {:?}", other),
        }

        let cfg = config(vec![]).norm_params(array![1., 2.].into_dyn());
        assert!(matches!(cfg.validate(), Err(Error::Shape(_))));
        let cfg = config(vec![]).norm_params(array![1., 2., 3., 4., 5.].into_dyn());
        cfg.validate().unwrap();
    }

    #[test]
    fn names_count_per_class() {
        let mut namer = LayerNamer::default();
        assert_eq!(namer.next("dense_layer", None), "dense_layer_0");
        assert_eq!(namer.next("dense_layer", Some("hidden")), "hidden");
        assert_eq!(namer.next("rnn_stack", None), "rnn_stack_0");
        assert_eq!(namer.next("dense_layer", None), "dense_layer_2");
    }

    #[test]
    fn typed_errors_from_json() {
        let record = |layers: Value| {
            json!({"input_shape": [null, 40], "n_targets": 5, "layers_config": layers})
        };
        let res = Config::from_value(record(json!([["dense_layer", 8, {}, "extra"]])));
        assert!(matches!(res, Err(Error::Config(_))));
        let res = Config::from_value(record(json!([{"class": "dense_layer"}])));
        assert!(matches!(res, Err(Error::Config(_))));
        let res = Config::from_value(record(json!([["dense_layer", 8, [1]]])));
        assert!(matches!(res, Err(Error::TypeMismatch { .. })));
        let res = Config::from_value(record(json!("dense_layer")));
        assert!(matches!(res, Err(Error::TypeMismatch { .. })));

        let mut value = record(json!([["dense_layer", 8]]));
        value["n_targets"] = json!("5");
        assert!(matches!(Config::from_value(value), Err(Error::TypeMismatch { .. })));
        let mut value = record(json!([["dense_layer", 8]]));
        value["input_shape"] = json!([null, 40.5]);
        assert!(matches!(Config::from_value(value), Err(Error::TypeMismatch { .. })));
        assert!(matches!(Config::from_value(json!([1])), Err(Error::TypeMismatch { .. })));

        let cfg = Config::from_value(record(json!([["dense_layer", 8]]))).unwrap();
        assert_eq!(cfg.layers_config, vec![LayerSpec::new("dense_layer", 8usize)]);
    }

    #[test]
    fn unrecognized_keys_are_reported() {
        let value = json!({
            "input_shape": [null, 40],
            "n_targets": 5,
            "layers_config": [],
            "optimiser": {"l_rate": 0.1},
        });
        let cfg = Config::from_value(value.clone()).unwrap();
        let fields = value.as_object().unwrap();
        assert_eq!(cfg.unrecognized_keys(fields).unwrap(), vec!["optimiser".to_owned()]);

        let mut fields = fields.clone();
        fields.remove("optimiser");
        assert!(cfg.unrecognized_keys(&fields).unwrap().is_empty());
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = config(vec![
            LayerSpec::new("dense_layer", 8usize).kwarg("keep_prob", Value::Null),
            LayerSpec::new("bi_rnn_stack", vec![4usize, 2]),
        ])
        .norm_params(array![1., 2., 3., 4., 5.].into_dyn());
        let text = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }
}
