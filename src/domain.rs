//! The domain configuration document that jobs refine.
//!
//! To the scheduling core a domain configuration is an opaque JSON object.
//! The only structural rule enforced here is the presence of required
//! top-level keys, checked at submission time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Top-level keys every submitted configuration must carry.
pub const DEFAULT_REQUIRED_KEYS: &[&str] = &["domain", "patterns"];

/// A domain configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainConfig(Map<String, Value>);

impl DomainConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from an arbitrary JSON value.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::PayloadNotObject` unless the value is an object.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(ValidationError::PayloadNotObject),
        }
    }

    /// Sets a top-level key, returning the configuration for chaining.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    /// Returns the value stored under a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Inserts or replaces a top-level key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Returns true if the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterates over the top-level keys.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the configuration has no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `domain` name, if present and a string.
    pub fn domain_name(&self) -> Option<&str> {
        self.0.get("domain").and_then(Value::as_str)
    }

    /// Lists the required keys absent from this configuration, in the given order.
    pub fn missing_keys<S: AsRef<str>>(&self, required: &[S]) -> Vec<String> {
        required
            .iter()
            .map(AsRef::as_ref)
            .filter(|key| !self.0.contains_key(*key))
            .map(str::to_string)
            .collect()
    }

    /// Checks that every required key is present.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingKeys` listing every absent key.
    pub fn validate_required<S: AsRef<str>>(&self, required: &[S]) -> Result<(), ValidationError> {
        let missing = self.missing_keys(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::MissingKeys(missing))
        }
    }

    /// Returns the underlying JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Consumes the configuration, returning the underlying map.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for DomainConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for DomainConfig {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_requires_object() {
        assert!(DomainConfig::from_value(json!({"domain": "x"})).is_ok());
        assert_eq!(
            DomainConfig::from_value(json!([1, 2])),
            Err(ValidationError::PayloadNotObject)
        );
    }

    #[test]
    fn test_validate_required_lists_all_missing() {
        let config = DomainConfig::new().with("name", json!("x"));
        let err = config
            .validate_required(DEFAULT_REQUIRED_KEYS)
            .expect_err("keys are missing");
        assert_eq!(
            err,
            ValidationError::MissingKeys(vec!["domain".to_string(), "patterns".to_string()])
        );
    }

    #[test]
    fn test_validate_required_passes() {
        let config = DomainConfig::from_value(json!({"domain": "test", "patterns": []}))
            .expect("object payload");
        assert!(config.validate_required(DEFAULT_REQUIRED_KEYS).is_ok());
        assert_eq!(config.domain_name(), Some("test"));
    }

    #[test]
    fn test_serde_is_transparent() {
        let config = DomainConfig::new().with("domain", json!("ops"));
        let text = serde_json::to_string(&config).expect("serialize");
        assert_eq!(text, r#"{"domain":"ops"}"#);
    }
}
