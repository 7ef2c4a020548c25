//! Flattening of the artifact store into wiring candidates.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use crate::dag_flow::config::WiringConfig;
use crate::dag_flow::reference::as_text;
use crate::dag_flow::store::{is_cache_key, ArtifactStore};

/// Coarse runtime shape of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Null,
}

impl ValueType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueType::String,
            Value::Number(_) => ValueType::Number,
            Value::Bool(_) => ValueType::Boolean,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
            Value::Null => ValueType::Null,
        }
    }

    /// Map a JSON-schema `type` keyword. `integer` collapses into `number`.
    pub fn from_schema_type(json_type: &str) -> Option<Self> {
        match json_type {
            "string" => Some(ValueType::String),
            "number" | "integer" => Some(ValueType::Number),
            "boolean" => Some(ValueType::Boolean),
            "array" => Some(ValueType::Array),
            "object" => Some(ValueType::Object),
            "null" => Some(ValueType::Null),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Array => "array",
            ValueType::Object => "object",
            ValueType::Null => "null",
        };
        f.write_str(name)
    }
}

/// One addressable value found in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct WiringCandidate {
    /// `producer.artifact` followed by `.key` / `[i]` segments
    pub reference: String,
    /// Nearest named field; list elements inherit their parent's key
    pub local_key: String,
    pub value: Value,
    pub declared_type: ValueType,
    pub score: f64,
}

/// Candidate description handed to the semantic resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub reference: String,
    pub local_key: String,
    pub declared_type: ValueType,
    /// Value rendered as text and truncated
    pub preview: String,
}

/// Read-only, most-recent-first list of candidates built from one store snapshot.
#[derive(Debug, Clone, Default)]
pub struct CandidateIndex {
    candidates: Vec<WiringCandidate>,
}

impl CandidateIndex {
    /// Flatten every artifact in `store`.
    ///
    /// Producers in the cache namespace are left out: they always mirror an
    /// entry already published under a node id.
    pub fn build(store: &ArtifactStore, config: &WiringConfig) -> Self {
        let mut candidates = Vec::new();
        for entry in store.entries_by_recency() {
            if is_cache_key(&entry.producer) {
                continue;
            }
            let reference = format!("{}.{}", entry.producer, entry.name);
            flatten(
                &mut candidates,
                reference,
                &entry.name,
                &entry.value,
                0,
                config,
            );
        }
        tracing::trace!(count = candidates.len(), "Built candidate index");
        Self { candidates }
    }

    pub fn candidates(&self) -> &[WiringCandidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn find(&self, reference: &str) -> Option<&WiringCandidate> {
        self.candidates.iter().find(|c| c.reference == reference)
    }

    /// At most `limit` summaries, one per reference, previews cut to `max_chars`.
    pub fn summarize(&self, limit: usize, max_chars: usize) -> Vec<CandidateSummary> {
        let mut seen = HashSet::new();
        self.candidates
            .iter()
            .filter(|c| seen.insert(c.reference.as_str()))
            .take(limit)
            .map(|c| CandidateSummary {
                reference: c.reference.clone(),
                local_key: c.local_key.clone(),
                declared_type: c.declared_type,
                preview: truncate_chars(&as_text(&c.value), max_chars),
            })
            .collect()
    }
}

fn flatten(
    out: &mut Vec<WiringCandidate>,
    reference: String,
    local_key: &str,
    value: &Value,
    depth: usize,
    config: &WiringConfig,
) {
    out.push(WiringCandidate {
        reference: reference.clone(),
        local_key: local_key.to_string(),
        value: value.clone(),
        declared_type: ValueType::of(value),
        score: 0.0,
    });

    if depth >= config.max_depth {
        return;
    }

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten(out, format!("{}.{}", reference, key), key, child, depth + 1, config);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().take(config.max_list_items).enumerate() {
                flatten(
                    out,
                    format!("{}[{}]", reference, index),
                    local_key,
                    child,
                    depth + 1,
                    config,
                );
            }
        }
        _ => {}
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_flow::store::cache_key;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    fn references(index: &CandidateIndex) -> Vec<&str> {
        index.candidates().iter().map(|c| c.reference.as_str()).collect()
    }

    #[test]
    fn test_flatten_objects_and_lists() {
        let store = ArtifactStore::new();
        store.store(
            "search",
            "results",
            json!([{"url": "a"}, {"url": "b"}, {"url": "c"}, {"url": "d"}]),
        );
        let index = CandidateIndex::build(&store, &WiringConfig::default());

        assert_eq!(
            references(&index),
            vec![
                "search.results",
                "search.results[0]",
                "search.results[0].url",
                "search.results[1]",
                "search.results[1].url",
                "search.results[2]",
                "search.results[2].url",
            ]
        );
        let element = index.find("search.results[1]").unwrap();
        assert_eq!(element.local_key, "results");
        assert_eq!(element.declared_type, ValueType::Object);
        let leaf = index.find("search.results[2].url").unwrap();
        assert_eq!(leaf.local_key, "url");
        assert_eq!(leaf.value, json!("c"));
    }

    #[test]
    fn test_depth_bound() {
        let store = ArtifactStore::new();
        store.store("n", "a", json!({"b": {"c": {"d": {"e": 1}}}}));
        let index = CandidateIndex::build(&store, &WiringConfig::default());
        assert!(index.find("n.a.b.c.d").is_some());
        assert!(index.find("n.a.b.c.d.e").is_none());
    }

    #[test]
    fn test_recency_and_cache_namespace() {
        let store = ArtifactStore::new();
        store.store("old", "ticker", json!("MSFT"));
        store.store("new", "ticker", json!("AAPL"));
        store.store(&cache_key("quote", &Map::new()), "ticker", json!("AAPL"));

        let index = CandidateIndex::build(&store, &WiringConfig::default());
        assert_eq!(references(&index), vec!["new.ticker", "old.ticker"]);
    }

    #[test]
    fn test_summaries_truncate_and_limit() {
        let store = ArtifactStore::new();
        store.store("n", "text", json!("x".repeat(80)));
        store.store("n", "count", json!(3));
        let index = CandidateIndex::build(&store, &WiringConfig::default());

        let summaries = index.summarize(1, 10);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].reference, "n.count");
        assert_eq!(summaries[0].preview, "3");

        let all = index.summarize(50, 10);
        assert_eq!(all[1].preview, format!("{}...", "x".repeat(10)));
    }

    #[test]
    fn test_schema_types() {
        assert_eq!(ValueType::from_schema_type("integer"), Some(ValueType::Number));
        assert_eq!(ValueType::from_schema_type("any"), None);
        assert_eq!(ValueType::of(&json!(null)).to_string(), "null");
    }
}
