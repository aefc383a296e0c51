use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Keyword arguments of a layer specification.
pub type Kwargs = Map<String, Value>;

/// Consumes a layer's keyword arguments one by one, so that leftovers can be reported.
pub struct KwargsReader<'a> {
    layer: &'a str,
    kwargs: Kwargs,
}

impl<'a> KwargsReader<'a> {
    pub fn new(layer: &'a str, kwargs: Kwargs) -> Self {
        Self { layer, kwargs }
    }

    pub fn take(&mut self, key: &str) -> Option<Value> {
        self.kwargs.remove(key)
    }

    pub fn take_str(&mut self, key: &str) -> Result<Option<String>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(Error::type_mismatch(key, "str", &other)),
        }
    }

    pub fn take_bool(&mut self, key: &str) -> Result<Option<bool>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(other) => Err(Error::type_mismatch(key, "bool", &other)),
        }
    }

    /// Integers are accepted where floats are expected.
    pub fn take_f32(&mut self, key: &str) -> Result<Option<f32>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64().map(|x| x as f32)),
            Some(other) => Err(Error::type_mismatch(key, "float", &other)),
        }
    }

    pub fn take_usize(&mut self, key: &str) -> Result<Option<usize>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::Number(n)) if n.is_u64() => Ok(n.as_u64().map(|x| x as usize)),
            Some(Value::Number(n)) if n.is_i64() => Err(Error::Value(format!(
                "'{}' must be positive, got {}.",
                key, n
            ))),
            Some(other) => Err(Error::type_mismatch(key, "int", &other)),
        }
    }

    /// Fail if any keyword argument was left unread.
    pub fn finish(self) -> Result<()> {
        match self.kwargs.keys().next() {
            Some(key) => Err(Error::Config(format!(
                "unexpected keyword argument '{}' for layer '{}'.",
                key, self.layer
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(value: Value) -> Kwargs {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn reads_typed_values() {
        let mut reader = KwargsReader::new(
            "dense_layer",
            kwargs(json!({"activation": "tanh", "bias": false, "rate": 200, "window": 3})),
        );
        assert_eq!(reader.take_str("activation").unwrap().as_deref(), Some("tanh"));
        assert_eq!(reader.take_bool("bias").unwrap(), Some(false));
        assert_eq!(reader.take_f32("rate").unwrap(), Some(200.));
        assert_eq!(reader.take_usize("window").unwrap(), Some(3));
        assert_eq!(reader.take_str("missing").unwrap(), None);
        reader.finish().unwrap();
    }

    #[test]
    fn wrong_type_is_reported() {
        let mut reader = KwargsReader::new("dense_layer", kwargs(json!({"bias": "yes"})));
        assert!(matches!(
            reader.take_bool("bias"),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn leftovers_are_rejected() {
        let reader = KwargsReader::new("dense_layer", kwargs(json!({"units": 3})));
        match reader.finish() {
            Err(Error::Config(msg)) => assert!(msg.contains("units")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
