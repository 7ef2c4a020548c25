//! Workflow node model and per-node state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::store::ArtifactStore;
use crate::core::errors::{DagError, Result};

/// Coarse node type, mirroring the [`NodeKind`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Tool,
    Code,
    Llm,
    Agentic,
    Loop,
    Switch,
    Merge,
}

impl NodeType {
    /// Structural nodes are executed by the scheduler itself.
    pub fn is_structural(self) -> bool {
        matches!(self, NodeType::Loop | NodeType::Switch | NodeType::Merge)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Tool => "TOOL",
            NodeType::Code => "CODE",
            NodeType::Llm => "LLM",
            NodeType::Agentic => "AGENTIC",
            NodeType::Loop => "LOOP",
            NodeType::Switch => "SWITCH",
            NodeType::Merge => "MERGE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }

    /// PENDING -> RUNNING -> {COMPLETED, FAILED}, PENDING -> {FAILED, SKIPPED}.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Completed => "COMPLETED",
            NodeStatus::Failed => "FAILED",
            NodeStatus::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Concat,
    Dict,
    First,
}

/// Iterate `loop_body` once per element of the iterable behind `loop_over`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    pub loop_over: String,
    #[serde(default = "default_loop_variable")]
    pub loop_variable: String,
    pub loop_body: Vec<WorkflowNode>,
    #[serde(default = "default_loop_parallel")]
    pub max_parallel: usize,
}

fn default_loop_variable() -> String {
    "item".to_string()
}

fn default_loop_parallel() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchSpec {
    pub condition: String,
    #[serde(default)]
    pub true_branch: Vec<WorkflowNode>,
    #[serde(default)]
    pub false_branch: Vec<WorkflowNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    pub merge_inputs: Vec<String>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
}

/// Type-specific payload. Only structural kinds carry a payload; the rest
/// name the tool the node executor should run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Tool { tool: String },
    Code { tool: String },
    Llm { tool: String },
    Agentic { tool: String },
    Loop(LoopSpec),
    Switch(SwitchSpec),
    Merge(MergeSpec),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Tool { .. } => NodeType::Tool,
            NodeKind::Code { .. } => NodeType::Code,
            NodeKind::Llm { .. } => NodeType::Llm,
            NodeKind::Agentic { .. } => NodeType::Agentic,
            NodeKind::Loop(_) => NodeType::Loop,
            NodeKind::Switch(_) => NodeType::Switch,
            NodeKind::Merge(_) => NodeType::Merge,
        }
    }

    pub fn tool(&self) -> Option<&str> {
        match self {
            NodeKind::Tool { tool }
            | NodeKind::Code { tool }
            | NodeKind::Llm { tool }
            | NodeKind::Agentic { tool } => Some(tool),
            _ => None,
        }
    }
}

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique identifier, stable for the whole run.
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Nodes that must complete before this one is eligible.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Argument name -> reference expression, resolved at dispatch time.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub output_artifact: Option<String>,
    #[serde(skip)]
    pub status: NodeStatus,
    #[serde(skip)]
    pub result: Option<NodeResult>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: Vec::new(),
            args: Map::new(),
            input_mapping: BTreeMap::new(),
            output_artifact: None,
            status: NodeStatus::Pending,
            result: None,
        }
    }

    pub fn tool(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Tool { tool: tool.into() })
    }

    pub fn code(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Code { tool: tool.into() })
    }

    pub fn llm(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Llm { tool: tool.into() })
    }

    pub fn agentic(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Agentic { tool: tool.into() })
    }

    pub fn loop_over(
        id: impl Into<String>,
        loop_over: impl Into<String>,
        loop_variable: impl Into<String>,
        loop_body: Vec<WorkflowNode>,
        max_parallel: usize,
    ) -> Self {
        Self::new(
            id,
            NodeKind::Loop(LoopSpec {
                loop_over: loop_over.into(),
                loop_variable: loop_variable.into(),
                loop_body,
                max_parallel,
            }),
        )
    }

    pub fn switch(
        id: impl Into<String>,
        condition: impl Into<String>,
        true_branch: Vec<WorkflowNode>,
        false_branch: Vec<WorkflowNode>,
    ) -> Self {
        Self::new(
            id,
            NodeKind::Switch(SwitchSpec {
                condition: condition.into(),
                true_branch,
                false_branch,
            }),
        )
    }

    /// A merge node; its inputs are also added as dependencies.
    pub fn merge(id: impl Into<String>, merge_inputs: Vec<String>, strategy: MergeStrategy) -> Self {
        let mut node = Self::new(
            id,
            NodeKind::Merge(MergeSpec {
                merge_inputs: merge_inputs.clone(),
                merge_strategy: strategy,
            }),
        );
        node.depends_on = merge_inputs;
        node
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.depends_on.contains(&dep) {
                self.depends_on.push(dep);
            }
        }
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        if let Value::Object(map) = args {
            self.args.extend(map);
        }
        self
    }

    pub fn with_mapping(mut self, arg: impl Into<String>, reference: impl Into<String>) -> Self {
        self.input_mapping.insert(arg.into(), reference.into());
        self
    }

    pub fn with_output(mut self, artifact: impl Into<String>) -> Self {
        self.output_artifact = Some(artifact.into());
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.kind.tool()
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: NodeStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DagError::InvalidState {
                node_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record the terminal result, transitioning to its status.
    pub fn resolve(&mut self, result: NodeResult) -> Result<()> {
        self.transition(result.status)?;
        self.result = Some(result);
        Ok(())
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub artifacts: Map<String, Value>,
    /// Present iff `status` is FAILED.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub children_spawned: Vec<String>,
}

impl NodeResult {
    pub fn completed(node_id: impl Into<String>, output: Value) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Completed,
            output,
            artifacts: Map::new(),
            error: None,
            metadata: Map::new(),
            children_spawned: Vec::new(),
        }
    }

    pub fn failed(node_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Failed,
            output: Value::Null,
            artifacts: Map::new(),
            error: Some(error.into()),
            metadata: Map::new(),
            children_spawned: Vec::new(),
        }
    }

    pub fn skipped(node_id: impl Into<String>, reason: &str) -> Self {
        let mut result = Self::completed(node_id, Value::Null);
        result.status = NodeStatus::Skipped;
        result.metadata.insert("reason".into(), json!(reason));
        result
    }

    pub fn with_artifact(mut self, name: impl Into<String>, value: Value) -> Self {
        self.artifacts.insert(name.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Completed
    }

    pub fn is_cached(&self) -> bool {
        self.metadata.get("cached").and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Aggregate outcome of one `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagExecutionResult {
    pub run_id: String,
    pub total_nodes: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub node_results: HashMap<String, NodeResult>,
    pub replans_triggered: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Artifacts published during the run
    #[serde(skip)]
    pub store: ArtifactStore,
}

impl DagExecutionResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_results.get(node_id).map(|r| r.status)
    }

    pub fn error_of(&self, node_id: &str) -> Option<&str> {
        self.node_results.get(node_id).and_then(|r| r.error.as_deref())
    }

    pub fn output_of(&self, node_id: &str) -> Option<&Value> {
        self.node_results.get(node_id).map(|r| &r.output)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
