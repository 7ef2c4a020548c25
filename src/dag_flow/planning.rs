//! Planning utilities for DAG Flow
//!
//! Declarative helpers for assembling nodes that a microplanner injects into
//! a running graph, and a planner that turns model tool calls into TOOL nodes.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use super::node::{NodeResult, NodeType, WorkflowNode};
use super::store::ArtifactStore;
use crate::coord::hooks::Microplanner;

/// A declarative plan builder for constructing injected nodes
#[derive(Debug, Clone)]
pub struct Plan {
    /// The nodes to be injected
    pub nodes: Vec<WorkflowNode>,
    /// Namespace for generated ids, usually the parent node id
    scope: String,
    /// Logical name -> generated id
    id_map: HashMap<String, String>,
    id_counter: usize,
}

impl Plan {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            nodes: Vec::new(),
            scope: scope.into(),
            id_map: HashMap::new(),
            id_counter: 0,
        }
    }

    fn gen_id(&mut self, prefix: &str) -> String {
        self.id_counter += 1;
        format!("{}_{}_{}", self.scope, prefix, self.id_counter)
    }

    /// Add a prepared node as-is
    pub fn add_node(&mut self, node: WorkflowNode) -> String {
        let node_id = node.id.clone();
        self.nodes.push(node);
        node_id
    }

    /// Add a TOOL node depending on `dep`
    pub fn add_tool(&mut self, dep: &str, name: &str, args: Map<String, Value>) -> String {
        let node_id = self.gen_id(&format!("tool_{}", name));
        let mut node = WorkflowNode::tool(node_id.clone(), name).with_deps([dep]);
        node.args = args;
        self.nodes.push(node);
        self.id_map.insert(format!("tool_{}", name), node_id.clone());
        node_id
    }

    /// Add an LLM node that waits for every id in `deps`
    pub fn add_continuation(&mut self, deps: &[String], tool: &str, args: Value) -> String {
        let node_id = self.gen_id("continuation");
        let node = WorkflowNode::llm(node_id.clone(), tool)
            .with_deps(deps.iter().cloned())
            .with_args(args);
        self.nodes.push(node);
        self.id_map.insert("continuation".to_string(), node_id.clone());
        node_id
    }

    /// Look up a generated id by its logical name
    pub fn get_node_id(&self, logical_name: &str) -> Option<&String> {
        self.id_map.get(logical_name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn into_nodes(self) -> Vec<WorkflowNode> {
        self.nodes
    }
}

/// Build a plan from a model node's `tool_calls` output.
///
/// Each call is `{"name": .., "arguments": ..}`; `arguments` may be an
/// object or a JSON-encoded string. Returns `None` when nothing is callable.
pub fn plan_from_llm_output(
    llm_node_id: &str,
    output: &Value,
    continuation_tool: Option<&str>,
) -> Option<Plan> {
    let tool_calls = output.get("tool_calls")?.as_array()?;
    let mut plan = Plan::new(llm_node_id);
    let mut tool_ids = Vec::new();

    for tool_call in tool_calls {
        let Some(name) = tool_call.get("name").and_then(Value::as_str) else {
            continue;
        };
        let args = match tool_call.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::String(encoded)) => match serde_json::from_str::<Value>(encoded) {
                Ok(Value::Object(map)) => map,
                _ => {
                    tracing::warn!(node_id = %llm_node_id, tool = %name, "Unparseable tool arguments");
                    continue;
                }
            },
            _ => Map::new(),
        };
        tool_ids.push(plan.add_tool(llm_node_id, name, args));
    }

    if tool_ids.is_empty() {
        return None;
    }

    if let Some(tool) = continuation_tool {
        plan.add_continuation(&tool_ids, tool, json!({ "tool_count": tool_ids.len() }));
    }

    Some(plan)
}

/// Microplanner that expands model tool calls into TOOL nodes.
///
/// Only LLM and AGENTIC results are inspected. With a continuation tool set,
/// an extra LLM node is injected that depends on every generated tool node.
#[derive(Debug, Clone, Default)]
pub struct ToolCallPlanner {
    continuation_tool: Option<String>,
}

impl ToolCallPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_continuation(mut self, tool: impl Into<String>) -> Self {
        self.continuation_tool = Some(tool.into());
        self
    }
}

#[async_trait]
impl Microplanner for ToolCallPlanner {
    async fn checkpoint(
        &self,
        node: &WorkflowNode,
        result: &NodeResult,
        _pending: &[WorkflowNode],
        _store: &ArtifactStore,
    ) -> anyhow::Result<Vec<WorkflowNode>> {
        if !matches!(node.node_type(), NodeType::Llm | NodeType::Agentic) {
            return Ok(Vec::new());
        }
        Ok(
            plan_from_llm_output(&node.id, &result.output, self.continuation_tool.as_deref())
                .map(Plan::into_nodes)
                .unwrap_or_default(),
        )
    }
}
