//! Registry for NodeAction instances
//!
//! Doubles as the node executor (tool name -> action) and as the schema
//! source (each action's input schema).

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::action::{NodeAction, NodeCtx, NodeExecutor};
use super::types::{SchemaSource, ToolSchema};
use crate::dag_flow::node::{NodeResult, WorkflowNode};
use crate::dag_flow::store::ArtifactStore;

/// Registry for node actions
#[derive(Clone)]
pub struct ActionRegistry {
    actions: Arc<RwLock<HashMap<String, Arc<dyn NodeAction>>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register an action under its own name, replacing any previous one
    pub fn register(&self, action: Arc<dyn NodeAction>) {
        let mut actions = self.actions.write();
        tracing::debug!(action = %action.name(), "Registered action");
        actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeAction>> {
        let actions = self.actions.read();
        actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let actions = self.actions.read();
        actions.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let actions = self.actions.read();
        let mut names: Vec<String> = actions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for ActionRegistry {
    async fn dispatch(
        &self,
        node: &WorkflowNode,
        args: &Map<String, Value>,
        store: &ArtifactStore,
    ) -> anyhow::Result<NodeResult> {
        let tool = node
            .tool_name()
            .ok_or_else(|| anyhow::anyhow!("Node '{}' does not name a tool", node.id))?;
        let action = self.get(tool).ok_or_else(|| {
            anyhow::anyhow!("Action '{}' not registered for node '{}'", tool, node.id)
        })?;

        action.validate_inputs(&Value::Object(args.clone()))?;

        let ctx = NodeCtx::new(
            node.id.clone(),
            node.node_type(),
            tool,
            args.clone(),
            store.clone(),
        );
        let output = action.execute(&ctx).await?;
        Ok(output.into_result(&node.id))
    }
}

#[async_trait]
impl SchemaSource for ActionRegistry {
    async fn tool_schema(&self, tool_name: &str) -> anyhow::Result<Option<ToolSchema>> {
        Ok(self
            .get(tool_name)
            .and_then(|action| action.input_schema())
            .and_then(|schema| ToolSchema::from_json_schema(&schema)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::action::{EchoAction, NodeOutput};
    use crate::dag_flow::node::NodeStatus;
    use serde_json::json;

    struct Quote;

    #[async_trait]
    impl NodeAction for Quote {
        fn name(&self) -> &str {
            "quote"
        }

        async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
            let ticker: String = ctx.get_input("ticker")?;
            Ok(NodeOutput::success(json!({ "ticker": ticker, "price": 10.0 })))
        }

        fn input_schema(&self) -> Option<Value> {
            Some(json!({
                "type": "object",
                "properties": {"ticker": {"type": "string"}},
                "required": ["ticker"]
            }))
        }
    }

    fn registry() -> ActionRegistry {
        let registry = ActionRegistry::new();
        registry.register(Arc::new(EchoAction));
        registry.register(Arc::new(Quote));
        registry
    }

    #[tokio::test]
    async fn test_dispatch_by_tool_name() {
        let registry = registry();
        assert_eq!(registry.list(), vec!["echo".to_string(), "quote".to_string()]);

        let node = WorkflowNode::tool("q", "quote");
        let mut args = Map::new();
        args.insert("ticker".into(), json!("AAPL"));
        let result = registry
            .dispatch(&node, &args, &ArtifactStore::new())
            .await
            .unwrap();
        assert_eq!(result.status, NodeStatus::Completed);
        assert_eq!(result.output["ticker"], json!("AAPL"));
    }

    #[tokio::test]
    async fn test_dispatch_validation_and_unknown_tool() {
        let registry = registry();
        let store = ArtifactStore::new();

        let missing = registry
            .dispatch(&WorkflowNode::tool("q", "quote"), &Map::new(), &store)
            .await;
        assert!(missing.unwrap_err().to_string().contains("Invalid input"));

        let unknown = registry
            .dispatch(&WorkflowNode::tool("x", "nope"), &Map::new(), &store)
            .await;
        assert!(unknown.unwrap_err().to_string().contains("not registered"));
    }

    #[tokio::test]
    async fn test_schema_source() {
        let registry = registry();
        let schema = registry.tool_schema("quote").await.unwrap().unwrap();
        assert_eq!(schema.required, vec!["ticker".to_string()]);
        assert!(registry.tool_schema("echo").await.unwrap().is_none());
    }
}
