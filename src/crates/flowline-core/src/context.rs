//! Shared context threaded through a flow run
//!
//! A [`SharedContext`] maps string keys to JSON values. Nodes read their
//! inputs from it in `prep` and write their outputs in `post`. Fan-out
//! primitives hand each branch its own copy and fold the branch's changes back
//! afterwards; the context is never mutated by two branches at once.
//!
//! Typed access goes through [`ContextKey`], which pins a key name to the Rust
//! type stored under it:
//!
//! ```rust
//! use flowline_core::{ContextKey, SharedContext};
//!
//! const FILES: ContextKey<Vec<String>> = ContextKey::new("files");
//!
//! let mut ctx = SharedContext::new();
//! ctx.set(FILES, &vec!["lib.rs".to_string()]).unwrap();
//! assert_eq!(ctx.get(FILES).unwrap(), Some(vec!["lib.rs".to_string()]));
//! ```

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;

/// Reserved key whose presence signals an upstream failure
pub const ERROR_KEY: &str = "error";

/// Per-instance parameters supplied to a batch instance
pub type Params = HashMap<String, Value>;

/// Keys that a branch added or changed, ordered by key
pub type ContextChanges = BTreeMap<String, Value>;

/// A key name bound to the type stored under it
pub struct ContextKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({:?})", self.name)
    }
}

/// Mutable key-value store for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    values: HashMap<String, Value>,
    #[serde(default)]
    params: Params,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Read a typed value; `Ok(None)` when the key is absent
    pub fn get<T: DeserializeOwned>(&self, key: ContextKey<T>) -> Result<Option<T>> {
        self.values
            .get(key.name)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(Into::into)
    }

    /// Store a typed value
    pub fn set<T: Serialize>(&mut self, key: ContextKey<T>, value: &T) -> Result<()> {
        self.values
            .insert(key.name.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Remove and return a typed value
    pub fn remove<T: DeserializeOwned>(&mut self, key: ContextKey<T>) -> Result<Option<T>> {
        self.values
            .remove(key.name)
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Insert a raw value, returning the previous one
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove_raw(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Overlay `params` on the current parameters
    pub fn extend_params(&mut self, params: Params) {
        self.params.extend(params);
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.extend_params(params);
        self
    }

    /// Record a failure under the reserved `error` key
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.values
            .insert(ERROR_KEY.to_string(), Value::String(message.into()));
    }

    /// The recorded failure, if any
    ///
    /// Non-string values under the `error` key are rendered as JSON.
    pub fn error(&self) -> Option<String> {
        self.values.get(ERROR_KEY).map(|value| match value {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        })
    }

    pub fn has_error(&self) -> bool {
        self.values.contains_key(ERROR_KEY)
    }

    pub fn clear_error(&mut self) -> Option<Value> {
        self.values.remove(ERROR_KEY)
    }

    /// Keys whose value differs from `snapshot`, including new keys
    ///
    /// Keys removed since the snapshot are not reported.
    pub fn diff(&self, snapshot: &SharedContext) -> ContextChanges {
        self.values
            .iter()
            .filter(|(key, value)| snapshot.values.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Apply changes produced by [`diff`](Self::diff)
    pub fn merge_changes(&mut self, changes: ContextChanges) {
        self.values.extend(changes);
    }
}
