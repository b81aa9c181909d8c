//! Flat mapping of named options handed to stage capabilities.
//!
//! Options are fully resolved (config file, environment, CLI) before a stage is
//! declared. Stages read them through the typed getters below.

use crate::error::{Result, StreamboardError};
use std::collections::BTreeMap;
use toml::Value;

/// Named options for one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    values: BTreeMap<String, Value>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an option, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn u64(&self, key: &str) -> Result<Option<u64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Integer(n)) if *n >= 0 => Ok(Some(*n as u64)),
            Some(_) => Err(invalid(key, "non-negative integer")),
        }
    }

    pub fn u32(&self, key: &str) -> Result<Option<u32>> {
        match self.u64(key)? {
            None => Ok(None),
            Some(n) => u32::try_from(n)
                .map(Some)
                .map_err(|_| invalid(key, "32-bit unsigned integer")),
        }
    }

    /// Floats also accept integer values (`rate = 8000` reads as 8000.0).
    pub fn f64(&self, key: &str) -> Result<Option<f64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Float(x)) => Ok(Some(*x)),
            Some(Value::Integer(n)) => Ok(Some(*n as f64)),
            Some(_) => Err(invalid(key, "number")),
        }
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Boolean(b)) => Ok(Some(*b)),
            Some(_) => Err(invalid(key, "bool")),
        }
    }

    pub fn str(&self, key: &str) -> Result<Option<&str>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(invalid(key, "string")),
        }
    }

    /// A list of strings. A single string is read as a one-element list.
    pub fn string_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(vec![s.clone()])),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(invalid(key, "list of strings")),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(_) => Err(invalid(key, "list of strings")),
        }
    }

    pub fn require_string_list(&self, key: &str) -> Result<Vec<String>> {
        self.string_list(key)?.ok_or_else(|| missing(key))
    }
}

fn missing(key: &str) -> StreamboardError {
    StreamboardError::MissingOption {
        key: key.to_string(),
    }
}

fn invalid(key: &str, expected: &'static str) -> StreamboardError {
    StreamboardError::InvalidOption {
        key: key.to_string(),
        expected,
    }
}
