//! Job-scoped artifact storage.
//!
//! Artifacts are keyed by producer (a node id, or a synthetic cache key) and
//! then by artifact name. Writes never retract; a later write to the same
//! pair overwrites it and becomes the most recent entry.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::errors::Result;

/// Producer keys in the content-addressed namespace start with this prefix.
pub const CACHE_PREFIX: &str = "cache:";

/// A stored artifact value together with its global write sequence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SerializableData {
    pub value: Value,
    #[serde(default)]
    pub sequence: u64,
}

/// One artifact as returned by [`ArtifactStore::entries_by_recency`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactEntry {
    pub producer: String,
    pub name: String,
    pub value: Value,
    pub sequence: u64,
}

#[derive(Debug, Default)]
pub struct ArtifactStore {
    pub data: Arc<DashMap<String, DashMap<String, SerializableData>>>,
    sequence: Arc<AtomicU64>,
}

// Clones share the same underlying maps.
impl Clone for ArtifactStore {
    fn clone(&self) -> Self {
        ArtifactStore {
            data: self.data.clone(),
            sequence: self.sequence.clone(),
        }
    }
}

impl ArtifactStore {
    pub fn new() -> Self {
        ArtifactStore {
            data: Arc::new(DashMap::new()),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Write `value` under `(producer, name)` unconditionally.
    pub fn store(&self, producer: &str, name: &str, value: Value) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let inner_map = self
            .data
            .entry(producer.to_string())
            .or_insert_with(DashMap::new);
        inner_map.insert(name.to_string(), SerializableData { value, sequence });
    }

    /// Serialize and store any value.
    pub fn insert_value<T: Serialize>(&self, producer: &str, name: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.store(producer, name, value);
        Ok(())
    }

    /// Store every entry of `artifacts` under `producer`.
    pub fn store_all(&self, producer: &str, artifacts: &Map<String, Value>) {
        for (name, value) in artifacts {
            self.store(producer, name, value.clone());
        }
    }

    pub fn get(&self, producer: &str, name: &str) -> Option<Value> {
        self.data
            .get(producer)
            .and_then(|inner| inner.get(name).map(|data| data.value.clone()))
    }

    /// Fetch and deserialize an artifact. `Ok(None)` when absent.
    pub fn get_as<T: DeserializeOwned>(&self, producer: &str, name: &str) -> Result<Option<T>> {
        match self.get(producer, name) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, producer: &str, name: &str) -> bool {
        self.data
            .get(producer)
            .map(|inner| inner.contains_key(name))
            .unwrap_or(false)
    }

    /// All artifacts written by `producer`, ordered by name.
    pub fn list(&self, producer: &str) -> BTreeMap<String, Value> {
        self.data
            .get(producer)
            .map(|inner| {
                inner
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn producers(&self) -> Vec<String> {
        let mut producers: Vec<String> = self.data.iter().map(|e| e.key().clone()).collect();
        producers.sort();
        producers
    }

    /// Number of stored (producer, name) pairs.
    pub fn len(&self) -> usize {
        self.data.iter().map(|inner| inner.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every artifact, most recently written first.
    pub fn entries_by_recency(&self) -> Vec<ArtifactEntry> {
        let mut entries = Vec::with_capacity(self.len());
        for outer in self.data.iter() {
            for inner in outer.value().iter() {
                entries.push(ArtifactEntry {
                    producer: outer.key().clone(),
                    name: inner.key().clone(),
                    value: inner.value().value.clone(),
                    sequence: inner.value().sequence,
                });
            }
        }
        entries.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        entries
    }

    /// Plain nested-map view of the store.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
        self.data
            .iter()
            .map(|outer| {
                let artifacts = outer
                    .value()
                    .iter()
                    .map(|inner| (inner.key().clone(), inner.value().value.clone()))
                    .collect();
                (outer.key().clone(), artifacts)
            })
            .collect()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Rebuild a store from [`ArtifactStore::to_json_pretty`] output.
    pub fn from_json(json_data: &str) -> Result<Self> {
        let snapshot: BTreeMap<String, BTreeMap<String, Value>> = serde_json::from_str(json_data)?;
        let store = ArtifactStore::new();
        for (producer, artifacts) in snapshot {
            for (name, value) in artifacts {
                store.store(&producer, &name, value);
            }
        }
        Ok(store)
    }
}

/// Deterministic producer key for `(tool_name, args)`.
///
/// Object keys are sorted before hashing so argument order never matters.
pub fn cache_key(tool_name: &str, args: &Map<String, Value>) -> String {
    let mut canonical = String::new();
    write_canonical(&Value::Object(args.clone()), &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(CACHE_PREFIX.len() + digest.len() * 2);
    out.push_str(CACHE_PREFIX);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

pub fn is_cache_key(producer: &str) -> bool {
    producer.starts_with(CACHE_PREFIX)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_and_get() {
        let store = ArtifactStore::new();
        store.store("n1", "price", json!(42.5));
        store.insert_value("n1", "ticker", &"AAPL").unwrap();

        assert_eq!(store.get("n1", "price"), Some(json!(42.5)));
        assert_eq!(store.get_as::<String>("n1", "ticker").unwrap().as_deref(), Some("AAPL"));
        assert_eq!(store.get("n1", "missing"), None);
        assert_eq!(store.get("n2", "price"), None);
        assert_eq!(store.list("n1").len(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_overwrite_is_last_writer_visible() {
        let store = ArtifactStore::new();
        store.store("n1", "v", json!(1));
        store.store("n2", "v", json!(2));
        store.store("n1", "v", json!(3));

        assert_eq!(store.get("n1", "v"), Some(json!(3)));
        let order: Vec<String> = store
            .entries_by_recency()
            .into_iter()
            .map(|e| e.producer)
            .collect();
        assert_eq!(order, vec!["n1".to_string(), "n2".to_string()]);
    }

    #[test]
    fn test_clone_shares_data() {
        let store = ArtifactStore::new();
        let other = store.clone();
        other.store("a", "b", json!(true));
        assert!(store.contains("a", "b"));
    }

    #[test]
    fn test_cache_key_ignores_key_order() {
        let a = json!({"x": 1, "y": {"b": 2, "a": [1, 2]}});
        let b = json!({"y": {"a": [1, 2], "b": 2}, "x": 1});
        let key_a = cache_key("search", a.as_object().unwrap());
        let key_b = cache_key("search", b.as_object().unwrap());
        assert_eq!(key_a, key_b);
        assert!(is_cache_key(&key_a));
        assert_ne!(key_a, cache_key("fetch", a.as_object().unwrap()));
    }

    #[test]
    fn test_json_roundtrip() {
        let store = ArtifactStore::new();
        store.store("n1", "out", json!({"k": [1, 2]}));
        let restored = ArtifactStore::from_json(&store.to_json_pretty().unwrap()).unwrap();
        assert_eq!(restored.get("n1", "out"), Some(json!({"k": [1, 2]})));
    }
}
