//! Module identity: a qualified name plus a deep-frozen options map.
//!
//! Two descriptors are the same module exactly when their names and
//! options are equal, so options are frozen into an ordered, hashable
//! form on the way in and thawed back to JSON when a module reads them.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A frozen JSON value with total equality and hashing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    /// IEEE bits of an `f64`
    Float(u64),
    String(String),
    List(Vec<OptionValue>),
    Map(BTreeMap<String, OptionValue>),
}

impl OptionValue {
    /// Freeze a JSON value
    pub fn freeze(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or_default().to_bits())
                }
            }
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::freeze).collect()),
            Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::freeze(v)))
                    .collect(),
            ),
        }
    }

    /// Thaw back into a plain JSON value
    pub fn thaw(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::UInt(u) => Value::from(*u),
            Self::Float(bits) => Number::from_f64(f64::from_bits(*bits))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::thaw).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.thaw()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

/// Frozen module options, ordered by key
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Options(BTreeMap<String, OptionValue>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze a JSON object
    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self(
            map.iter()
                .map(|(k, v)| (k.clone(), OptionValue::freeze(v)))
                .collect(),
        )
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), OptionValue::freeze(&value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Thawed value for `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.get(key).map(OptionValue::thaw)
    }

    /// Deserialize the value for `key` into `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// The whole options map as a JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.thaw()))
                .collect(),
        )
    }
}

impl TryFrom<Value> for Options {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self::from_map(&map)),
            Value::Null => Ok(Self::default()),
            other => Err(Error::InvalidOptions {
                found: other.to_string(),
            }),
        }
    }
}

impl Serialize for Options {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Options {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Ok(Self::from_map(&map))
    }
}

/// A module reference: name plus options.
///
/// Serializes to `{"name": ..., "options": {...}}`, the form sent to hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub options: Options,
}

impl ModuleDescriptor {
    /// A module with no options
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Options::default(),
        }
    }

    pub fn with_options(name: impl Into<String>, options: Options) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }

    /// A module configured from a JSON object
    pub fn configured(name: impl Into<String>, options: Value) -> Result<Self> {
        Ok(Self::with_options(name, Options::try_from(options)?))
    }
}

impl From<&str> for ModuleDescriptor {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.options.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{} {}", self.name, self.options.to_value())
        }
    }
}
