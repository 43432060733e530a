//! Filter tree and interpreter types

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::data::error::{EngineError, Result};
use crate::data::sql::SqlFragment;

/// Request context handed to interpreters, constraints and FROM factories
pub type Context = Map<String, Value>;

/// Recursive filter conditions
///
/// Field entries are evaluated first (implicitly AND-ed), followed by the `OR`,
/// `AND` and `NOT` groups. Field order follows the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterTree {
    pub fields: Vec<(String, Value)>,
    pub and: Vec<FilterTree>,
    pub or: Vec<FilterTree>,
    pub not: Option<Box<FilterTree>>,
}

impl FilterTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse request JSON into a tree.
    ///
    /// `null` values are dropped so they never reach an interpreter.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => Self::from_map(map),
            other => Err(EngineError::InvalidArgument(format!(
                "where must be an object, got {}",
                other
            ))),
        }
    }

    fn from_map(map: Map<String, Value>) -> Result<Self> {
        let mut tree = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "AND" | "OR" => {
                    let items = match value {
                        Value::Null => continue,
                        Value::Array(items) => items,
                        single @ Value::Object(_) => vec![single],
                        other => {
                            return Err(EngineError::InvalidArgument(format!(
                                "{} must be an array of filters, got {}",
                                key, other
                            )));
                        }
                    };
                    let parsed = items
                        .into_iter()
                        .map(Self::from_value)
                        .collect::<Result<Vec<_>>>()?;
                    if key == "AND" {
                        tree.and = parsed;
                    } else {
                        tree.or = parsed;
                    }
                }
                "NOT" => {
                    if !value.is_null() {
                        tree.not = Some(Box::new(Self::from_value(value)?));
                    }
                }
                _ => {
                    if !value.is_null() {
                        tree.fields.push((key, value));
                    }
                }
            }
        }
        Ok(tree)
    }

    /// Convert back into request JSON
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        if !self.and.is_empty() {
            map.insert(
                "AND".into(),
                Value::Array(self.and.iter().map(Self::to_value).collect()),
            );
        }
        if !self.or.is_empty() {
            map.insert(
                "OR".into(),
                Value::Array(self.or.iter().map(Self::to_value).collect()),
            );
        }
        if let Some(not) = &self.not {
            map.insert("NOT".into(), not.to_value());
        }
        Value::Object(map)
    }

    /// Add or replace a field value
    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn and(mut self, trees: Vec<FilterTree>) -> Self {
        self.and = trees;
        self
    }

    pub fn or(mut self, trees: Vec<FilterTree>) -> Self {
        self.or = trees;
        self
    }

    pub fn not(mut self, tree: FilterTree) -> Self {
        self.not = Some(Box::new(tree));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if value.is_null() {
            self.remove(&key);
            return;
        }
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.and.is_empty() && self.or.is_empty() && self.not.is_none()
    }
}

impl<'de> Deserialize<'de> for FilterTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl Serialize for FilterTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Everything an interpreter sees for one filter entry
#[derive(Debug, Clone, Copy)]
pub struct FilterInput<'a> {
    /// The entry's value (never `null`)
    pub value: &'a Value,
    /// The tree level the entry belongs to
    pub all: &'a FilterTree,
    pub ctx: &'a Context,
    /// The registered name that matched
    pub key: &'a str,
}

/// Compiles one filter value into a boolean condition.
///
/// `Ok(None)` means the filter contributes nothing, which is not an error.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn interpret(&self, input: &FilterInput<'_>) -> Result<Option<SqlFragment>>;
}

#[async_trait]
impl<F> Interpreter for F
where
    F: Fn(&FilterInput<'_>) -> Result<Option<SqlFragment>> + Send + Sync,
{
    async fn interpret(&self, input: &FilterInput<'_>) -> Result<Option<SqlFragment>> {
        self(input)
    }
}

/// Named interpreters. Inserting an existing name replaces it.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    interpreters: BTreeMap<String, Arc<dyn Interpreter>>,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.interpreters.keys()).finish()
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, interpreter: Arc<dyn Interpreter>) {
        self.interpreters.insert(name.into(), interpreter);
    }

    /// Register a synchronous closure
    pub fn insert_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&FilterInput<'_>) -> Result<Option<SqlFragment>> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(f));
    }

    /// Builder form of [`FilterRegistry::insert_fn`]
    pub fn with_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&FilterInput<'_>) -> Result<Option<SqlFragment>> + Send + Sync + 'static,
    {
        self.insert_fn(name, f);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Interpreter>> {
        self.interpreters.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.interpreters.contains_key(name)
    }

    /// Merge `other` in; its entries win on conflict
    pub fn extend(&mut self, other: &FilterRegistry) {
        for (name, interpreter) in &other.interpreters {
            self.interpreters.insert(name.clone(), Arc::clone(interpreter));
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.interpreters.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Interpreter>)> {
        self.interpreters.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.interpreters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interpreters.is_empty()
    }
}

/// Per-call evaluation switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterOptions {
    /// Allow `OR` groups
    pub or_enabled: bool,
    /// Skip the view's authorization constraints
    pub bypass_constraints: bool,
}

impl FilterOptions {
    pub fn or_enabled() -> Self {
        Self {
            or_enabled: true,
            ..Default::default()
        }
    }

    /// Combine two option sets; a switch is on when either side turns it on
    pub fn union(self, other: FilterOptions) -> Self {
        Self {
            or_enabled: self.or_enabled || other.or_enabled,
            bypass_constraints: self.bypass_constraints || other.bypass_constraints,
        }
    }
}
