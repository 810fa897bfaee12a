//! Typed payload values exchanged with plugins
//!
//! Inputs, outputs and message payloads are a closed set of shapes rather
//! than free-form JSON. `null` has no representation and is rejected when
//! converting from JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{PluginError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
}

impl Payload {
    /// An empty map, the conventional "no input" payload
    pub fn empty() -> Self {
        Self::Map(BTreeMap::new())
    }

    /// Build a map payload from key/value pairs
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Payload)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up a key when this payload is a map
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Self::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Self::Map(_))
    }

    /// Parse a JSON document into a payload
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PluginError::InvalidPayload(e.to_string()))
    }

    /// Serialize to a JSON string. Non-finite numbers have no JSON form and are rejected.
    pub fn to_json_string(&self) -> Result<String> {
        self.ensure_finite()?;
        serde_json::to_string(self).map_err(|e| PluginError::InvalidPayload(e.to_string()))
    }

    /// Fail if any number in the payload is NaN or infinite
    pub fn ensure_finite(&self) -> Result<()> {
        match self {
            Self::Number(n) if !n.is_finite() => Err(PluginError::InvalidPayload(format!(
                "number {n} has no JSON representation"
            ))),
            Self::List(items) => items.iter().try_for_each(Self::ensure_finite),
            Self::Map(entries) => entries.values().try_for_each(Self::ensure_finite),
            _ => Ok(()),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl TryFrom<serde_json::Value> for Payload {
    type Error = PluginError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Err(PluginError::InvalidPayload(
                "null values are not supported".to_string(),
            )),
            serde_json::Value::Bool(b) => Ok(Self::Bool(b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number).ok_or_else(|| {
                PluginError::InvalidPayload(format!("number {n} is not representable"))
            }),
            serde_json::Value::String(s) => Ok(Self::String(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Self::try_from)
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            serde_json::Value::Object(entries) => entries
                .into_iter()
                .map(|(k, v)| Self::try_from(v).map(|v| (k, v)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Self::Map),
        }
    }
}

impl From<Payload> for serde_json::Value {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Bool(b) => Self::Bool(b),
            Payload::Number(n) => serde_json::Number::from_f64(n)
                .map(Self::Number)
                .unwrap_or_else(|| Self::String(n.to_string())),
            Payload::String(s) => Self::String(s),
            Payload::List(items) => Self::Array(items.into_iter().map(Into::into).collect()),
            Payload::Map(entries) => {
                Self::Object(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Payload {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(items: Vec<Payload>) -> Self {
        Self::List(items)
    }
}
