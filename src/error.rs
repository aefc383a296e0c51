use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring, building, running or persisting a network.
#[derive(Debug, Error)]
pub enum Error {
    /// An argument was of the wrong kind.
    #[error("Expected '{name}' to be of type {expected}, not {got}.")]
    TypeMismatch {
        name: String,
        expected: String,
        got: String,
    },

    /// A numeric argument is out of its valid range.
    #[error("{0}")]
    Value(String),

    /// A shape constraint was violated.
    #[error("{0}")]
    Shape(String),

    /// A layer specification is malformed.
    #[error("Invalid layers configuration: {0}")]
    Config(String),

    /// A registry lookup failed.
    #[error("Invalid {kind} name: '{name}'.")]
    Lookup { kind: &'static str, name: String },

    /// A dump's architecture does not match the network it is restored into.
    #[error("Invalid network architecture.")]
    ArchitectureMismatch,

    /// A dump was produced by a different model type.
    #[error("Dumped model is a '{found}', not a '{expected}'.")]
    ClassMismatch { expected: String, found: String },

    /// A one-time build phase was invoked a second time.
    #[error("Build phase '{0}' has already been run.")]
    AlreadyBuilt(&'static str),

    /// A build phase was invoked before the phases it depends on.
    #[error("Build phase '{phase}' cannot run before '{requires}'.")]
    OutOfOrder {
        phase: &'static str,
        requires: &'static str,
    },

    #[error("File not found: '{}'.", .0.display())]
    FileNotFound(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn type_mismatch(name: &str, expected: &str, got: &serde_json::Value) -> Self {
        Error::TypeMismatch {
            name: name.to_owned(),
            expected: expected.to_owned(),
            got: json_type_name(got).to_owned(),
        }
    }
}

/// Name of the kind of a JSON value, used in type mismatch messages.
pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Check that a given integer is positive.
pub(crate) fn check_positive_int(value: i64, name: &str) -> Result<usize> {
    if value <= 0 {
        Err(Error::Value(format!("'{}' must be positive.", name)))
    } else {
        Ok(value as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn positive_int() {
        assert_eq!(check_positive_int(5, "n").unwrap(), 5);
        assert!(matches!(check_positive_int(0, "n"), Err(Error::Value(_))));
        assert!(matches!(check_positive_int(-3, "n"), Err(Error::Value(_))));
    }

    #[test]
    fn type_mismatch_message() {
        let err = Error::type_mismatch("layer config kwargs", "dict", &json!([1, 2]));
        assert_eq!(
            err.to_string(),
            "Expected 'layer config kwargs' to be of type dict, not list."
        );
    }
}
