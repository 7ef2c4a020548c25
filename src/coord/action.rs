//! Node execution contracts.
//!
//! [`NodeExecutor`] is what the scheduler calls for TOOL/CODE/LLM/AGENTIC
//! nodes. [`NodeAction`] is the finer-grained, per-tool unit that
//! [`ActionRegistry`](super::registry::ActionRegistry) dispatches to.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::dag_flow::node::{NodeResult, NodeType, WorkflowNode};
use crate::dag_flow::store::ArtifactStore;

/// Dispatches a non-structural node with its fully resolved arguments.
///
/// Returning `Err` and returning a FAILED `NodeResult` both fail the node;
/// the scheduler never retries either.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn dispatch(
        &self,
        node: &WorkflowNode,
        args: &Map<String, Value>,
        store: &ArtifactStore,
    ) -> anyhow::Result<NodeResult>;
}

/// Context for node execution (immutable, clonable)
#[derive(Clone)]
pub struct NodeCtx {
    pub node_id: String,
    pub node_type: NodeType,
    pub tool: String,
    /// Resolved arguments (explicit, mapped and auto-wired)
    pub args: Map<String, Value>,
    /// Read access to prior artifacts
    pub store: ArtifactStore,
}

impl NodeCtx {
    pub fn new(
        node_id: impl Into<String>,
        node_type: NodeType,
        tool: impl Into<String>,
        args: Map<String, Value>,
        store: ArtifactStore,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            tool: tool.into(),
            args,
            store,
        }
    }

    /// Get input value by key
    pub fn get_input<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .args
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Input '{}' not found", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))
    }

    /// Get optional input value
    pub fn get_input_opt<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        match self.args.get(key) {
            Some(value) if !value.is_null() => {
                let parsed = serde_json::from_value(value.clone())
                    .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        }
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub output: Value,
    /// Named artifacts to publish in addition to `output`
    pub artifacts: Map<String, Value>,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
}

impl NodeOutput {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            success: true,
            ..Default::default()
        }
    }

    /// A deliberate failure reported by the action, as opposed to an `Err`
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, name: impl Into<String>, value: Value) -> Self {
        self.artifacts.insert(name.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn into_result(self, node_id: &str) -> NodeResult {
        let mut result = if self.success {
            NodeResult::completed(node_id, self.output)
        } else {
            let error = self
                .error
                .unwrap_or_else(|| format!("Node '{}' reported failure", node_id));
            let mut failed = NodeResult::failed(node_id, error);
            failed.output = self.output;
            failed
        };
        result.artifacts = self.artifacts;
        result.metadata = self.metadata;
        result
    }
}

/// NodeAction - compute-only node action
///
/// Actions read their arguments, perform work and return outputs. Writing to
/// the artifact store is the scheduler's job.
#[async_trait]
pub trait NodeAction: Send + Sync {
    /// Tool name this action answers to
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput>;

    /// Optional JSON schema for the arguments (`required` + `properties`)
    fn input_schema(&self) -> Option<Value> {
        None
    }

    /// Validate arguments against [`NodeAction::input_schema`]
    fn validate_inputs(&self, args: &Value) -> anyhow::Result<()> {
        let Some(schema) = self.input_schema() else {
            return Ok(());
        };
        let compiled_schema = jsonschema::validator_for(&schema)
            .map_err(|e| anyhow::anyhow!("Failed to compile input schema: {}", e))?;
        if let Err(error) = compiled_schema.validate(args) {
            tracing::warn!(action = %self.name(), "Input validation failed: {}", error);
            return Err(anyhow::anyhow!("Invalid input for '{}': {}", self.name(), error));
        }
        Ok(())
    }
}

/// Example: Echo action that just returns its inputs
pub struct EchoAction;

#[async_trait]
impl NodeAction for EchoAction {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        tracing::debug!(node_id = %ctx.node_id, "Echo action with args: {:?}", ctx.args);
        Ok(NodeOutput::success(Value::Object(ctx.args.clone())))
    }
}
