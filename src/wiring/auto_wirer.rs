//! Fills a tool's missing required arguments from prior artifacts.
//!
//! Heuristic name/type matching runs first; a semantic resolver, when one is
//! configured, gets a single chance at whatever is still missing. Every
//! failure on this path degrades to leaving the argument absent.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::candidates::{CandidateIndex, ValueType, WiringCandidate};
use crate::coord::types::{Resolution, SchemaSource, SemanticResolver, ToolSchema};
use crate::dag_flow::config::WiringConfig;
use crate::dag_flow::reference::Reference;
use crate::dag_flow::store::ArtifactStore;

const EXACT_NAME_SCORE: f64 = 1.0;
const ARG_IN_KEY_SCORE: f64 = 0.8;
const KEY_IN_ARG_SCORE: f64 = 0.5;
const TYPE_MATCH_BONUS: f64 = 0.3;
const TYPE_MISMATCH_PENALTY: f64 = -1.0;

#[derive(Clone)]
pub struct AutoWirer {
    schema_source: Arc<dyn SchemaSource>,
    resolver: Option<Arc<dyn SemanticResolver>>,
    config: WiringConfig,
    resolver_timeout: Duration,
}

impl AutoWirer {
    pub fn new(schema_source: Arc<dyn SchemaSource>) -> Self {
        Self {
            schema_source,
            resolver: None,
            config: WiringConfig::default(),
            resolver_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SemanticResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_config(mut self, config: WiringConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_resolver_timeout(mut self, timeout: Duration) -> Self {
        self.resolver_timeout = timeout;
        self
    }

    /// Return `explicit_args` plus whatever missing required arguments could
    /// be resolved from `store`. Never removes or overwrites an argument.
    pub async fn wire(
        &self,
        tool_name: &str,
        explicit_args: Map<String, Value>,
        store: &ArtifactStore,
    ) -> Map<String, Value> {
        if !self.config.enabled {
            return explicit_args;
        }

        let schema = match self.schema_source.tool_schema(tool_name).await {
            Ok(Some(schema)) => schema,
            Ok(None) => {
                debug!(tool = %tool_name, "No schema, skipping wiring");
                return explicit_args;
            }
            Err(e) => {
                warn!(tool = %tool_name, "Schema unavailable, skipping wiring: {}", e);
                return explicit_args;
            }
        };

        let missing = schema.missing(&explicit_args);
        if missing.is_empty() {
            return explicit_args;
        }

        let index = CandidateIndex::build(store, &self.config);
        let mut resolved = explicit_args;
        let mut still_missing = Vec::new();

        for arg in missing {
            let expected = schema.property_type(&arg).and_then(ValueType::from_schema_type);
            match best_candidate(&arg, expected, index.candidates(), self.config.accept_threshold)
            {
                Some(candidate) => {
                    debug!(
                        tool = %tool_name,
                        arg = %arg,
                        reference = %candidate.reference,
                        score = candidate.score,
                        "Wired argument"
                    );
                    resolved.insert(arg, candidate.value);
                }
                None => still_missing.push(arg),
            }
        }

        if !still_missing.is_empty() && !index.is_empty() {
            if let Some(resolver) = &self.resolver {
                self.resolve_semantically(
                    resolver.as_ref(),
                    tool_name,
                    &schema,
                    &still_missing,
                    &index,
                    store,
                    &mut resolved,
                )
                .await;
            }
        }

        resolved
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_semantically(
        &self,
        resolver: &dyn SemanticResolver,
        tool_name: &str,
        schema: &ToolSchema,
        still_missing: &[String],
        index: &CandidateIndex,
        store: &ArtifactStore,
        resolved: &mut Map<String, Value>,
    ) {
        let missing_schemas: Map<String, Value> = still_missing
            .iter()
            .map(|arg| (arg.clone(), schema.property_schema(arg)))
            .collect();
        let summaries = index.summarize(self.config.summary_limit, self.config.summary_value_chars);

        let answers = match tokio::time::timeout(
            self.resolver_timeout,
            resolver.resolve(tool_name, &missing_schemas, &summaries),
        )
        .await
        {
            Ok(Ok(answers)) => answers,
            Ok(Err(e)) => {
                warn!(tool = %tool_name, "Semantic resolver failed: {}", e);
                return;
            }
            Err(_) => {
                warn!(
                    tool = %tool_name,
                    timeout_ms = self.resolver_timeout.as_millis() as u64,
                    "Semantic resolver timed out"
                );
                return;
            }
        };

        for arg in still_missing {
            let value = match answers.get(arg) {
                Some(Resolution::Reference { reference }) => index
                    .find(reference)
                    .map(|candidate| candidate.value.clone())
                    .or_else(|| {
                        Reference::parse(reference)
                            .ok()
                            .and_then(|parsed| parsed.resolve(store))
                    }),
                Some(Resolution::Literal { value }) => Some(value.clone()),
                None => None,
            };
            match value {
                Some(value) => {
                    debug!(tool = %tool_name, arg = %arg, "Argument resolved semantically");
                    resolved.insert(arg.clone(), value);
                }
                None => debug!(tool = %tool_name, arg = %arg, "Argument left unresolved"),
            }
        }
    }
}

/// Heuristic score of `candidate` for argument `arg`.
///
/// A schema without a type for `arg` neither rewards nor penalizes.
pub fn score_candidate(arg: &str, expected: Option<ValueType>, candidate: &WiringCandidate) -> f64 {
    let key = candidate.local_key.as_str();
    let name_score = if key == arg {
        EXACT_NAME_SCORE
    } else if !arg.is_empty() && key.contains(arg) {
        ARG_IN_KEY_SCORE
    } else if !key.is_empty() && arg.contains(key) {
        KEY_IN_ARG_SCORE
    } else {
        0.0
    };

    let type_score = match expected {
        Some(expected) if expected == candidate.declared_type => TYPE_MATCH_BONUS,
        Some(_) => TYPE_MISMATCH_PENALTY,
        None => 0.0,
    };

    name_score + type_score
}

/// Highest-scoring candidate above `threshold`, scanning in index order.
///
/// An exact name hit scoring at least 1.0 ends the scan, so the most recent
/// exact match wins over any substring match.
pub fn best_candidate(
    arg: &str,
    expected: Option<ValueType>,
    candidates: &[WiringCandidate],
    threshold: f64,
) -> Option<WiringCandidate> {
    let mut best: Option<WiringCandidate> = None;
    for candidate in candidates {
        let score = score_candidate(arg, expected, candidate);
        if score <= threshold {
            continue;
        }
        let exact = candidate.local_key == arg && score >= EXACT_NAME_SCORE;
        if exact || best.as_ref().map(|b| score > b.score).unwrap_or(true) {
            let mut chosen = candidate.clone();
            chosen.score = score;
            best = Some(chosen);
        }
        if exact {
            break;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::types::StaticSchemaSource;
    use crate::wiring::candidates::CandidateSummary;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn candidate(key: &str, value: Value) -> WiringCandidate {
        WiringCandidate {
            reference: format!("n.{}", key),
            local_key: key.to_string(),
            declared_type: ValueType::of(&value),
            value,
            score: 0.0,
        }
    }

    fn wirer(schema: ToolSchema) -> AutoWirer {
        AutoWirer::new(Arc::new(StaticSchemaSource::new().with_schema("quote", schema)))
    }

    #[test]
    fn test_scores() {
        let exact = candidate("ticker", json!("AAPL"));
        let longer = candidate("ticker_symbol", json!("MSFT"));
        let shorter = candidate("tick", json!("X"));
        let string = Some(ValueType::String);

        let close = |a: f64, b: f64| (a - b).abs() < 1e-9;
        assert!(close(score_candidate("ticker", string, &exact), 1.3));
        assert!(close(score_candidate("ticker", string, &longer), 1.1));
        assert!(close(score_candidate("ticker", string, &shorter), 0.8));
        assert!(close(score_candidate("ticker", Some(ValueType::Number), &exact), 0.0));
        assert!(close(score_candidate("ticker", None, &longer), 0.8));
    }

    #[test]
    fn test_exact_match_wins_in_either_order() {
        let exact = candidate("ticker", json!("AAPL"));
        let substring = candidate("ticker_symbol", json!("MSFT"));
        let string = Some(ValueType::String);

        let forward = vec![exact.clone(), substring.clone()];
        let backward = vec![substring, exact];
        for candidates in [forward, backward] {
            let best = best_candidate("ticker", string, &candidates, 0.7).unwrap();
            assert_eq!(best.value, json!("AAPL"));
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let weak = candidate("tick", json!(1));
        assert!(best_candidate("ticker", None, &[weak.clone()], 0.5).is_none());
        assert!(best_candidate("ticker", None, &[weak], 0.4).is_some());
    }

    #[tokio::test]
    async fn test_wire_fills_missing_only() {
        let store = ArtifactStore::new();
        store.store("lookup", "quote", json!({"ticker": "AAPL", "price": 10.5}));

        let wirer = wirer(
            ToolSchema::new(["ticker", "price", "currency"])
                .with_property("ticker", "string")
                .with_property("price", "number")
                .with_property("currency", "string"),
        );
        let mut explicit = Map::new();
        explicit.insert("price".into(), json!(99));

        let wired = wirer.wire("quote", explicit, &store).await;
        assert_eq!(wired.get("ticker"), Some(&json!("AAPL")));
        assert_eq!(wired.get("price"), Some(&json!(99)));
        assert!(!wired.contains_key("currency"));
    }

    #[tokio::test]
    async fn test_wire_without_schema_is_noop() {
        let store = ArtifactStore::new();
        store.store("lookup", "ticker", json!("AAPL"));
        let wirer = AutoWirer::new(Arc::new(StaticSchemaSource::new()));
        let wired = wirer.wire("quote", Map::new(), &store).await;
        assert!(wired.is_empty());
    }

    struct Oracle {
        calls: AtomicUsize,
        answers: Value,
    }

    #[async_trait]
    impl SemanticResolver for Oracle {
        async fn resolve(
            &self,
            _tool_name: &str,
            missing: &Map<String, Value>,
            candidates: &[CandidateSummary],
        ) -> anyhow::Result<HashMap<String, Resolution>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(missing.contains_key("symbol"));
            assert!(!candidates.is_empty());
            Ok(Resolution::parse_map(&self.answers))
        }
    }

    #[tokio::test]
    async fn test_resolver_fallback() {
        let store = ArtifactStore::new();
        store.store("pick", "company", json!({"code": "NVDA"}));

        let oracle = Arc::new(Oracle {
            calls: AtomicUsize::new(0),
            answers: json!({
                "symbol": {"reference": "pick.company.code"},
                "venue": {"value": "NASDAQ"}
            }),
        });
        let wirer = wirer(ToolSchema::new(["symbol", "venue"])).with_resolver(oracle.clone());

        let wired = wirer.wire("quote", Map::new(), &store).await;
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
        assert_eq!(wired.get("symbol"), Some(&json!("NVDA")));
        assert_eq!(wired.get("venue"), Some(&json!("NASDAQ")));
    }

    struct Failing;

    #[async_trait]
    impl SemanticResolver for Failing {
        async fn resolve(
            &self,
            _tool_name: &str,
            _missing: &Map<String, Value>,
            _candidates: &[CandidateSummary],
        ) -> anyhow::Result<HashMap<String, Resolution>> {
            anyhow::bail!("model unavailable")
        }
    }

    #[tokio::test]
    async fn test_resolver_failure_leaves_args_absent() {
        let store = ArtifactStore::new();
        store.store("pick", "company", json!("NVDA"));
        let wirer = wirer(ToolSchema::new(["symbol"])).with_resolver(Arc::new(Failing));
        let wired = wirer.wire("quote", Map::new(), &store).await;
        assert!(wired.is_empty());
    }

    struct Stalling;

    #[async_trait]
    impl SemanticResolver for Stalling {
        async fn resolve(
            &self,
            _tool_name: &str,
            _missing: &Map<String, Value>,
            _candidates: &[CandidateSummary],
        ) -> anyhow::Result<HashMap<String, Resolution>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Resolution::parse_map(&json!({"symbol": {"value": "LATE"}})))
        }
    }

    #[tokio::test]
    async fn test_resolver_timeout_leaves_args_absent() {
        let store = ArtifactStore::new();
        store.store("pick", "company", json!("NVDA"));
        let wirer = wirer(ToolSchema::new(["symbol"]))
            .with_resolver(Arc::new(Stalling))
            .with_resolver_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let wired = wirer.wire("quote", Map::new(), &store).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!wired.contains_key("symbol"));
    }

    #[tokio::test]
    async fn test_resolver_not_called_without_candidates() {
        let oracle = Arc::new(Oracle {
            calls: AtomicUsize::new(0),
            answers: json!({}),
        });
        let wirer = wirer(ToolSchema::new(["symbol"])).with_resolver(oracle.clone());
        let wired = wirer.wire("quote", Map::new(), &ArtifactStore::new()).await;
        assert!(wired.is_empty());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }
}
