//! Parameter values and declared parameter schemas shared by every plugin registry.
//!
//! Each registered strategy (sampling function, predefined generator, extraction or analysis
//! method) declares a list of [`ParamSpec`]s: name, physical unit, default value, bounds and type.
//! Actual values travel as a [`ParamSet`], an ordered name-to-[`ParamValue`] map.
//!
//! [`resolve_params`] merges user-supplied values over the declared defaults. Values are type- and
//! range-checked against their spec; keys the schema does not know are dropped with a warning.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{PulsedError, Result};

/// A single parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}
impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}
impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}
impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}
impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}
impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// Declared type of a parameter. `Enum` is a closed set of allowed strings.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamType {
    Float,
    Int,
    Bool,
    Str,
    Enum(Vec<String>),
}

/// Declared schema entry of one strategy parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub unit: String,
    pub default: ParamValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub param_type: ParamType,
}

impl ParamSpec {
    pub fn float(name: &str, unit: &str, default: f64, min: f64, max: f64) -> Self {
        ParamSpec {
            name: name.to_string(),
            unit: unit.to_string(),
            default: ParamValue::Float(default),
            min: Some(min),
            max: Some(max),
            param_type: ParamType::Float,
        }
    }

    pub fn int(name: &str, unit: &str, default: i64, min: i64, max: i64) -> Self {
        ParamSpec {
            name: name.to_string(),
            unit: unit.to_string(),
            default: ParamValue::Int(default),
            min: Some(min as f64),
            max: Some(max as f64),
            param_type: ParamType::Int,
        }
    }

    pub fn boolean(name: &str, default: bool) -> Self {
        ParamSpec {
            name: name.to_string(),
            unit: String::new(),
            default: ParamValue::Bool(default),
            min: None,
            max: None,
            param_type: ParamType::Bool,
        }
    }

    pub fn string(name: &str, default: &str) -> Self {
        ParamSpec {
            name: name.to_string(),
            unit: String::new(),
            default: ParamValue::Str(default.to_string()),
            min: None,
            max: None,
            param_type: ParamType::Str,
        }
    }

    pub fn choice(name: &str, default: &str, options: &[&str]) -> Self {
        ParamSpec {
            name: name.to_string(),
            unit: String::new(),
            default: ParamValue::Str(default.to_string()),
            min: None,
            max: None,
            param_type: ParamType::Enum(options.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Checks `value` against the declared type and bounds, returning the value coerced to the
    /// declared type (integers are accepted for float parameters).
    pub fn validate(&self, value: &ParamValue) -> Result<ParamValue> {
        let type_err = || {
            PulsedError::config(format!(
                "Parameter '{}' expects {:?}, got '{}'",
                self.name, self.param_type, value
            ))
        };
        let checked = match &self.param_type {
            ParamType::Float => ParamValue::Float(value.as_f64().ok_or_else(type_err)?),
            ParamType::Int => ParamValue::Int(value.as_i64().ok_or_else(type_err)?),
            ParamType::Bool => ParamValue::Bool(value.as_bool().ok_or_else(type_err)?),
            ParamType::Str => ParamValue::Str(value.as_str().ok_or_else(type_err)?.to_string()),
            ParamType::Enum(options) => {
                let s = value.as_str().ok_or_else(type_err)?;
                if !options.iter().any(|o| o == s) {
                    return Err(PulsedError::config(format!(
                        "Parameter '{}' must be one of {:?}, got '{}'",
                        self.name, options, s
                    )));
                }
                ParamValue::Str(s.to_string())
            }
        };
        if let Some(v) = checked.as_f64() {
            let below = self.min.map_or(false, |min| v < min);
            let above = self.max.map_or(false, |max| v > max);
            if below || above || v.is_nan() {
                return Err(PulsedError::config(format!(
                    "Parameter '{}' = {} outside of [{:?}, {:?}]",
                    self.name, v, self.min, self.max
                )));
            }
        }
        Ok(checked)
    }
}

/// Ordered parameter name to value map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSet(IndexMap<String, ParamValue>);

impl ParamSet {
    pub fn new() -> Self {
        ParamSet(IndexMap::new())
    }

    /// Builds the set of declared defaults of a schema.
    pub fn defaults(schema: &[ParamSpec]) -> Self {
        schema
            .iter()
            .map(|spec| (spec.name.clone(), spec.default.clone()))
            .collect()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn missing(key: &str) -> PulsedError {
        PulsedError::config(format!("Missing or mistyped parameter '{}'", key))
    }

    pub fn f64(&self, key: &str) -> Result<f64> {
        self.get(key)
            .and_then(ParamValue::as_f64)
            .ok_or_else(|| Self::missing(key))
    }

    pub fn i64(&self, key: &str) -> Result<i64> {
        self.get(key)
            .and_then(ParamValue::as_i64)
            .ok_or_else(|| Self::missing(key))
    }

    pub fn usize(&self, key: &str) -> Result<usize> {
        let v = self.i64(key)?;
        usize::try_from(v)
            .map_err(|_| PulsedError::config(format!("Parameter '{}' must be >= 0", key)))
    }

    pub fn bool(&self, key: &str) -> Result<bool> {
        self.get(key)
            .and_then(ParamValue::as_bool)
            .ok_or_else(|| Self::missing(key))
    }

    pub fn str(&self, key: &str) -> Result<&str> {
        self.get(key)
            .and_then(ParamValue::as_str)
            .ok_or_else(|| Self::missing(key))
    }
}

impl FromIterator<(String, ParamValue)> for ParamSet {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        ParamSet(iter.into_iter().collect())
    }
}

/// Merges `given` over the defaults of `schema`.
///
/// Every given value is validated against its spec. Keys absent from the schema are ignored
/// with a warning naming `owner`.
pub fn resolve_params(owner: &str, schema: &[ParamSpec], given: &ParamSet) -> Result<ParamSet> {
    let mut resolved = ParamSet::defaults(schema);
    for (key, value) in given.iter() {
        match schema.iter().find(|spec| &spec.name == key) {
            Some(spec) => {
                let checked = spec.validate(value)?;
                resolved.0.insert(key.clone(), checked);
            }
            None => tracing::warn!(
                "Parameter '{}' is not declared by '{}' and will be ignored",
                key,
                owner
            ),
        }
    }
    Ok(resolved)
}
