//! Shared collaborator fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskdag::{ArtifactStore, DagExecutor, NodeExecutor, NodeResult, WorkflowNode};

/// Node executor driven by the tool name and a few reserved arguments.
///
/// - `fail`: returns `Err(args.message)`
/// - `soft_fail`: returns a FAILED result
/// - `echo`: outputs its arguments as an object
/// - `value`: outputs `args.value`
/// - anything else: outputs `"<id>:done"`
///
/// `delay_ms` sleeps before answering and `fail: true` fails any tool.
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }

    pub fn was_dispatched(&self, node_id: &str) -> bool {
        self.started.lock().iter().any(|id| id == node_id)
    }

    pub fn finish_position(&self, node_id: &str) -> Option<usize> {
        self.finished.lock().iter().position(|id| id == node_id)
    }
}

#[async_trait]
impl NodeExecutor for ScriptedExecutor {
    async fn dispatch(
        &self,
        node: &WorkflowNode,
        args: &Map<String, Value>,
        _store: &ArtifactStore,
    ) -> anyhow::Result<NodeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().push(node.id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = args.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let forced_failure = args.get("fail").and_then(Value::as_bool).unwrap_or(false);
        let outcome = match node.tool_name() {
            _ if forced_failure => Err(anyhow::anyhow!("requested failure")),
            Some("fail") => {
                let message = args
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("failed")
                    .to_string();
                Err(anyhow::anyhow!(message))
            }
            Some("soft_fail") => Ok(NodeResult::failed(&node.id, "rejected by backend")),
            Some("echo") => Ok(NodeResult::completed(&node.id, Value::Object(args.clone()))),
            Some("value") => Ok(NodeResult::completed(
                &node.id,
                args.get("value").cloned().unwrap_or(Value::Null),
            )),
            _ => Ok(NodeResult::completed(&node.id, json!(format!("{}:done", node.id)))),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.lock().push(node.id.clone());
        outcome
    }
}

/// Executor whose runs all read and write `store`.
pub fn executor_on(fake: &Arc<ScriptedExecutor>, store: &ArtifactStore) -> DagExecutor {
    DagExecutor::builder(fake.clone())
        .store(store.clone())
        .build()
        .expect("default config is valid")
}

/// Every node ended in a terminal state and the counters add up.
pub fn assert_partition(result: &taskdag::DagExecutionResult) {
    assert_eq!(
        result.completed + result.failed + result.skipped,
        result.total_nodes,
        "counts do not partition the graph"
    );
    assert_eq!(result.node_results.len(), result.total_nodes);
    for node_result in result.node_results.values() {
        assert!(node_result.status.is_terminal(), "{} not terminal", node_result.node_id);
    }
}
