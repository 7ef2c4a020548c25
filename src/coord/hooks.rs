//! Microplanner checkpoint hooks.
//!
//! A planner sees every successful dispatch and may hand back new nodes to
//! inject into the running graph. Planners never mutate scheduler state
//! themselves; the executor applies what they return.

use async_trait::async_trait;
use std::sync::Arc;

use crate::dag_flow::node::{NodeResult, WorkflowNode};
use crate::dag_flow::store::ArtifactStore;

#[async_trait]
pub trait Microplanner: Send + Sync {
    /// Called after `node` completed with `result`.
    ///
    /// `pending` holds the nodes that have not started yet. Returned nodes
    /// whose id already exists in the graph are ignored.
    async fn checkpoint(
        &self,
        node: &WorkflowNode,
        result: &NodeResult,
        pending: &[WorkflowNode],
        store: &ArtifactStore,
    ) -> anyhow::Result<Vec<WorkflowNode>>;
}

/// Planner that never injects anything.
pub struct NoopPlanner;

#[async_trait]
impl Microplanner for NoopPlanner {
    async fn checkpoint(
        &self,
        _node: &WorkflowNode,
        _result: &NodeResult,
        _pending: &[WorkflowNode],
        _store: &ArtifactStore,
    ) -> anyhow::Result<Vec<WorkflowNode>> {
        Ok(Vec::new())
    }
}

/// Composite planner that chains multiple planners
#[derive(Default)]
pub struct CompositePlanner {
    planners: Vec<Arc<dyn Microplanner>>,
}

impl CompositePlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_planner(&mut self, planner: Arc<dyn Microplanner>) {
        self.planners.push(planner);
    }

    pub fn with_planner(mut self, planner: Arc<dyn Microplanner>) -> Self {
        self.add_planner(planner);
        self
    }
}

#[async_trait]
impl Microplanner for CompositePlanner {
    /// A failing planner is logged and skipped; the others still run.
    async fn checkpoint(
        &self,
        node: &WorkflowNode,
        result: &NodeResult,
        pending: &[WorkflowNode],
        store: &ArtifactStore,
    ) -> anyhow::Result<Vec<WorkflowNode>> {
        let mut injected = Vec::new();
        for planner in &self.planners {
            match planner.checkpoint(node, result, pending, store).await {
                Ok(nodes) => injected.extend(nodes),
                Err(e) => tracing::warn!(node_id = %node.id, "Planner failed: {}", e),
            }
        }
        Ok(injected)
    }
}
