use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{GraphError, Result};

/// Context for sharing data between tasks in a graph execution.
///
/// Values are stored as JSON so a whole context can be persisted with its session.
#[derive(Clone, Debug)]
pub struct Context {
    data: Arc<DashMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
        }
    }

    /// Store a value, replacing any previous value under the same key.
    ///
    /// Fails with [`GraphError::ContextError`] when the value cannot be represented as JSON;
    /// the previous value, if any, is left in place.
    pub async fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        self.set_sync(key, value)
    }

    pub fn set_sync(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .map_err(|e| GraphError::ContextError(format!("failed to serialize {key}: {e}")))?;
        self.data.insert(key, value);
        Ok(())
    }

    pub async fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_sync(key)
    }

    pub fn get_sync<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.data.remove(key).map(|(_, v)| v)
    }

    pub async fn clear(&self) {
        self.data.clear();
    }

    /// Ordered copy of every entry, used for persistence and status views
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for Context {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Context {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let entries = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let data = DashMap::new();
        for (key, value) in entries {
            data.insert(key, value);
        }
        Ok(Self {
            data: Arc::new(data),
        })
    }
}
