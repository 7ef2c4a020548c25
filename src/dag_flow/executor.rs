//! Streaming DAG executor.
//!
//! One scheduler loop owns every piece of run bookkeeping. Ready nodes are
//! spawned as workers behind a global semaphore; each worker reports back on
//! a completion channel and the loop recomputes the ready set after every
//! single completion, so a node never waits for unrelated siblings.

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use super::config::{DagConfig, WorkflowDefinition};
use super::events::{EventSink, RuntimeEvent, RuntimeEventEnvelope};
use super::node::{
    DagExecutionResult, LoopSpec, MergeSpec, NodeKind, NodeResult, NodeStatus, SwitchSpec,
    WorkflowNode,
};
use super::reference::Reference;
use super::store::{cache_key, ArtifactStore};
use super::structural;
use crate::coord::action::NodeExecutor;
use crate::coord::condition::{ConditionEvaluator, ExpressionEvaluator};
use crate::coord::hooks::Microplanner;
use crate::coord::types::{SchemaSource, SemanticResolver};
use crate::core::errors::{DagError, Result};
use crate::wiring::{AutoWirer, ValueType};

/// Error recorded on nodes whose dependency failed.
pub const UPSTREAM_FAILED: &str = "Upstream dependency failed";

/// Artifact name used for a node's output when it declares no
/// `output_artifact` and returns no artifacts of its own.
pub const DEFAULT_OUTPUT_ARTIFACT: &str = "output";

pub struct DagExecutor {
    node_executor: Arc<dyn NodeExecutor>,
    schema_source: Option<Arc<dyn SchemaSource>>,
    resolver: Option<Arc<dyn SemanticResolver>>,
    conditions: Arc<dyn ConditionEvaluator>,
    microplanner: Option<Arc<dyn Microplanner>>,
    event_sink: Option<Arc<dyn EventSink>>,
    config: DagConfig,
    /// Store shared by every run; each run starts empty when unset
    shared_store: Option<ArtifactStore>,
}

pub struct DagExecutorBuilder {
    node_executor: Arc<dyn NodeExecutor>,
    schema_source: Option<Arc<dyn SchemaSource>>,
    resolver: Option<Arc<dyn SemanticResolver>>,
    conditions: Option<Arc<dyn ConditionEvaluator>>,
    microplanner: Option<Arc<dyn Microplanner>>,
    event_sink: Option<Arc<dyn EventSink>>,
    config: DagConfig,
    store: Option<ArtifactStore>,
}

impl DagExecutorBuilder {
    /// Enables auto-wiring of missing required arguments
    pub fn schema_source(mut self, source: Arc<dyn SchemaSource>) -> Self {
        self.schema_source = Some(source);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn SemanticResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = Some(evaluator);
        self
    }

    pub fn microplanner(mut self, planner: Arc<dyn Microplanner>) -> Self {
        self.microplanner = Some(planner);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn config(mut self, config: DagConfig) -> Self {
        self.config = config;
        self
    }

    /// Run every job against `store` instead of a fresh one per run
    pub fn store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<DagExecutor> {
        self.config.validate()?;
        Ok(DagExecutor {
            node_executor: self.node_executor,
            schema_source: self.schema_source,
            resolver: self.resolver,
            conditions: self
                .conditions
                .unwrap_or_else(|| Arc::new(ExpressionEvaluator)),
            microplanner: self.microplanner,
            event_sink: self.event_sink,
            config: self.config,
            shared_store: self.store,
        })
    }
}

impl DagExecutor {
    /// Executor with default configuration and no optional collaborators.
    pub fn new(node_executor: Arc<dyn NodeExecutor>) -> Self {
        Self {
            node_executor,
            schema_source: None,
            resolver: None,
            conditions: Arc::new(ExpressionEvaluator),
            microplanner: None,
            event_sink: None,
            config: DagConfig::default(),
            shared_store: None,
        }
    }

    pub fn builder(node_executor: Arc<dyn NodeExecutor>) -> DagExecutorBuilder {
        DagExecutorBuilder {
            node_executor,
            schema_source: None,
            resolver: None,
            conditions: None,
            microplanner: None,
            event_sink: None,
            config: DagConfig::default(),
            store: None,
        }
    }

    /// The store configured with [`DagExecutorBuilder::store`], if any.
    /// Without one, each run's store is only reachable through its result.
    pub fn store(&self) -> Option<&ArtifactStore> {
        self.shared_store.as_ref()
    }

    pub fn config(&self) -> &DagConfig {
        &self.config
    }

    /// Run `nodes` to completion.
    ///
    /// Only structural problems are returned as `Err`; every per-node failure
    /// is recorded in the returned result.
    pub async fn execute(&self, nodes: Vec<WorkflowNode>) -> Result<DagExecutionResult> {
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        self.run(nodes, &self.config, cancel_rx).await
    }

    /// Like [`execute`](Self::execute), but a signal on `cancel` stops new
    /// launches. In-flight dispatches are drained and everything that never
    /// started is marked SKIPPED.
    pub async fn execute_with_cancel(
        &self,
        nodes: Vec<WorkflowNode>,
        cancel: oneshot::Receiver<()>,
    ) -> Result<DagExecutionResult> {
        self.run(nodes, &self.config, cancel).await
    }

    /// Run a file-declared graph, layering its config over the executor's.
    pub async fn execute_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<DagExecutionResult> {
        let config = definition.effective_config(&self.config)?;
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        info!(workflow = %definition.name, "Executing workflow definition");
        self.run(definition.nodes.clone(), &config, cancel_rx).await
    }

    async fn run(
        &self,
        nodes: Vec<WorkflowNode>,
        config: &DagConfig,
        cancel: oneshot::Receiver<()>,
    ) -> Result<DagExecutionResult> {
        if config.validate_acyclic {
            validate_graph(&nodes)?;
        }

        let wirer = match &self.schema_source {
            Some(source) if config.wiring.enabled => {
                let mut wirer = AutoWirer::new(source.clone())
                    .with_config(config.wiring.clone())
                    .with_resolver_timeout(config.resolver_timeout());
                if let Some(resolver) = &self.resolver {
                    wirer = wirer.with_resolver(resolver.clone());
                }
                Some(wirer)
            }
            _ => None,
        };

        let ctx = Arc::new(RunContext {
            run_id: cuid2::create_id(),
            node_executor: self.node_executor.clone(),
            wirer,
            conditions: self.conditions.clone(),
            event_sink: self.event_sink.clone(),
            node_timeout: config.node_timeout(),
            store: self.shared_store.clone().unwrap_or_default(),
        });

        let (scheduler, completions) = Scheduler::new(
            ctx,
            self.microplanner.clone(),
            nodes,
            config.max_parallel_nodes,
        )?;
        Ok(scheduler.run(completions, cancel).await)
    }
}

/// Reject unknown dependencies and cycles before anything is dispatched.
fn validate_graph(nodes: &[WorkflowNode]) -> Result<()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in nodes {
        index
            .entry(node.id.as_str())
            .or_insert_with(|| graph.add_node(node.id.as_str()));
    }

    for node in nodes {
        let to = index[node.id.as_str()];
        for dep in &node.depends_on {
            let from = index.get(dep.as_str()).ok_or_else(|| {
                DagError::NodeNotFound(format!("{} (dependency of {})", dep, node.id))
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    if is_cyclic_directed(&graph) {
        let mut cyclic: Vec<String> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .flatten()
            .map(|idx| graph[idx].to_string())
            .collect();
        cyclic.sort();
        return Err(DagError::invalid_graph(
            "cycle detected in workflow graph",
            cyclic,
        ));
    }
    Ok(())
}

/// What a worker sends back to the scheduler.
struct Completion {
    node_id: String,
    outcome: Dispatched,
    elapsed_ms: u64,
}

/// Result of one dispatch, plus what the scheduler needs to apply it.
struct Dispatched {
    result: NodeResult,
    /// Arguments after mapping and wiring
    args: Map<String, Value>,
    /// Branch nodes to inject (SWITCH only)
    spawned: Vec<WorkflowNode>,
    cache_key: Option<String>,
}

impl Dispatched {
    fn done(result: NodeResult, args: Map<String, Value>) -> Self {
        Self {
            result,
            args,
            spawned: Vec::new(),
            cache_key: None,
        }
    }

    fn failed(node: &WorkflowNode, error: impl Into<String>) -> Self {
        Self::done(NodeResult::failed(&node.id, error), node.args.clone())
    }
}

/// Per-run collaborators shared by every worker.
struct RunContext {
    run_id: String,
    node_executor: Arc<dyn NodeExecutor>,
    wirer: Option<AutoWirer>,
    conditions: Arc<dyn ConditionEvaluator>,
    event_sink: Option<Arc<dyn EventSink>>,
    node_timeout: Option<Duration>,
    store: ArtifactStore,
}

impl RunContext {
    fn emit(&self, event: RuntimeEvent) {
        if let Some(sink) = &self.event_sink {
            sink.emit(&RuntimeEventEnvelope::new(&self.run_id, event));
        }
    }

    /// Dispatch with the per-node deadline applied and panics captured.
    async fn run_guarded(
        &self,
        node: &WorkflowNode,
        upstream: &HashMap<String, Value>,
    ) -> Dispatched {
        let dispatch = AssertUnwindSafe(self.dispatch(node, upstream)).catch_unwind();
        let outcome = match self.node_timeout {
            Some(limit) => match tokio::time::timeout(limit, dispatch).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Dispatched::failed(
                        node,
                        format!("Node dispatch timed out after {}s", limit.as_secs()),
                    )
                }
            },
            None => dispatch.await,
        };
        outcome.unwrap_or_else(|panic| {
            Dispatched::failed(node, format!("Dispatch panicked: {}", panic_message(&panic)))
        })
    }

    fn dispatch<'a>(
        &'a self,
        node: &'a WorkflowNode,
        upstream: &'a HashMap<String, Value>,
    ) -> BoxFuture<'a, Dispatched> {
        async move {
            let mut args = node.args.clone();
            self.apply_input_mapping(node, &mut args);
            if let (Some(wirer), Some(tool)) = (&self.wirer, node.tool_name()) {
                args = wirer.wire(tool, args, &self.store).await;
            }

            match &node.kind {
                NodeKind::Loop(spec) => self.run_loop(node, spec, args).await,
                NodeKind::Switch(spec) => self.run_switch(node, spec, args).await,
                NodeKind::Merge(spec) => {
                    Dispatched::done(self.run_merge(node, spec, upstream), args)
                }
                NodeKind::Tool { tool }
                | NodeKind::Code { tool }
                | NodeKind::Llm { tool }
                | NodeKind::Agentic { tool } => self.run_tool(node, tool, args).await,
            }
        }
        .boxed()
    }

    /// Mapped references override explicit args; unresolved ones leave the
    /// argument as it was.
    fn apply_input_mapping(&self, node: &WorkflowNode, args: &mut Map<String, Value>) {
        for (arg, raw) in &node.input_mapping {
            match Reference::parse(raw) {
                Ok(reference) => match reference.resolve(&self.store) {
                    Some(value) => {
                        args.insert(arg.clone(), value);
                    }
                    None => warn!(node_id = %node.id, arg = %arg, reference = %raw, "Unresolved input mapping"),
                },
                Err(e) => warn!(node_id = %node.id, arg = %arg, "Invalid input mapping: {}", e),
            }
        }
    }

    async fn run_tool(&self, node: &WorkflowNode, tool: &str, args: Map<String, Value>) -> Dispatched {
        let key = cache_key(tool, &args);

        if let Some(name) = &node.output_artifact {
            if let Some(output) = self.store.get(&key, name) {
                info!(node_id = %node.id, tool = %tool, cache_key = %key, "Cache hit, skipping dispatch");
                self.emit(RuntimeEvent::CacheHit {
                    step_id: node.id.clone(),
                    cache_key: key.clone(),
                });
                let mut result = NodeResult::completed(&node.id, output)
                    .with_metadata("cached", json!(true))
                    .with_metadata("cache_key", json!(key));
                result.artifacts = self.store.list(&key).into_iter().collect();
                return Dispatched {
                    result,
                    args,
                    spawned: Vec::new(),
                    cache_key: Some(key),
                };
            }
        }

        let mut call = node.clone();
        call.args = args.clone();
        let result = match self.node_executor.dispatch(&call, &args, &self.store).await {
            Ok(result) => normalize(node, result),
            Err(e) => NodeResult::failed(&node.id, e.to_string()),
        };
        Dispatched {
            result,
            args,
            spawned: Vec::new(),
            cache_key: node.output_artifact.as_ref().map(|_| key),
        }
    }

    async fn run_switch(
        &self,
        node: &WorkflowNode,
        spec: &SwitchSpec,
        args: Map<String, Value>,
    ) -> Dispatched {
        let taken = match self.conditions.evaluate(&spec.condition, &self.store).await {
            Ok(taken) => taken,
            Err(e) => {
                return Dispatched::done(
                    NodeResult::failed(&node.id, format!("Condition evaluation failed: {}", e)),
                    args,
                )
            }
        };

        let (label, branch) = if taken {
            ("true", &spec.true_branch)
        } else {
            ("false", &spec.false_branch)
        };
        let spawned = structural::instantiate_branch(&node.id, branch);
        debug!(node_id = %node.id, branch = label, count = spawned.len(), "Switch evaluated");

        let mut result = NodeResult::completed(&node.id, json!({ "condition": taken, "branch": label }))
            .with_metadata("branch", json!(label));
        result.children_spawned = spawned.iter().map(|n| n.id.clone()).collect();
        Dispatched {
            result,
            args,
            spawned,
            cache_key: None,
        }
    }

    fn run_merge(
        &self,
        node: &WorkflowNode,
        spec: &MergeSpec,
        upstream: &HashMap<String, Value>,
    ) -> NodeResult {
        let inputs: Vec<(String, Value)> = spec
            .merge_inputs
            .iter()
            .map(|id| {
                let value = upstream
                    .get(id)
                    .filter(|v| !v.is_null())
                    .cloned()
                    .unwrap_or_else(|| structural::stored_output(&self.store, id));
                (id.clone(), value)
            })
            .collect();
        NodeResult::completed(&node.id, structural::merge_values(spec.merge_strategy, &inputs))
            .with_metadata("merged_inputs", json!(spec.merge_inputs.len()))
    }

    async fn run_loop(&self, node: &WorkflowNode, spec: &LoopSpec, args: Map<String, Value>) -> Dispatched {
        let items = match Reference::parse(&spec.loop_over) {
            Ok(reference) => match reference.resolve(&self.store) {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Dispatched::done(
                        NodeResult::failed(
                            &node.id,
                            format!(
                                "loop_over '{}' resolved to {} instead of an array",
                                spec.loop_over,
                                ValueType::of(&other)
                            ),
                        ),
                        args,
                    )
                }
                None => {
                    return Dispatched::done(
                        NodeResult::failed(
                            &node.id,
                            format!("loop_over '{}' did not resolve", spec.loop_over),
                        ),
                        args,
                    )
                }
            },
            Err(e) => {
                return Dispatched::done(
                    NodeResult::failed(&node.id, format!("Invalid loop_over: {}", e)),
                    args,
                )
            }
        };

        let limit = Semaphore::new(spec.max_parallel.max(1));
        let iterations = items.iter().enumerate().map(|(index, item)| {
            let children = structural::instantiate_iteration(&node.id, spec, index, item);
            let limit = &limit;
            async move {
                let _permit = limit.acquire().await.ok();
                self.run_iteration(children).await
            }
        });
        // join_all keeps iteration order whatever the completion order.
        let outcomes = join_all(iterations).await;

        let mut outputs = Vec::with_capacity(outcomes.len());
        let mut children_spawned = Vec::new();
        let mut child_errors = Map::new();
        for outcome in outcomes {
            children_spawned.extend(outcome.child_ids);
            match outcome.error {
                Some((child_id, error)) => {
                    child_errors.insert(child_id, json!(error));
                    outputs.push(Value::Null);
                }
                None => outputs.push(outcome.output),
            }
        }

        let failed = child_errors.len();
        info!(
            node_id = %node.id,
            iterations = outputs.len(),
            failed,
            "Loop finished"
        );
        let mut result = NodeResult::completed(&node.id, Value::Array(outputs))
            .with_metadata("iterations", json!(items.len()))
            .with_metadata("succeeded", json!(items.len() - failed))
            .with_metadata("failed", json!(failed))
            .with_metadata("child_errors", Value::Object(child_errors));
        result.children_spawned = children_spawned;
        Dispatched::done(result, args)
    }

    /// Run one iteration's children in body order; the last child's output
    /// is the iteration's output. Stops at the first failure.
    async fn run_iteration(&self, children: Vec<WorkflowNode>) -> IterationOutcome {
        let child_ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
        let no_upstream = HashMap::new();
        let mut output = Value::Null;

        for child in &children {
            let dispatched = self.run_guarded(child, &no_upstream).await;
            if !dispatched.spawned.is_empty() {
                warn!(node_id = %child.id, "Branch nodes inside a loop body are not scheduled");
            }
            if dispatched.result.is_success() {
                publish(
                    &self.store,
                    child,
                    &dispatched.result,
                    dispatched.cache_key.as_deref(),
                );
                output = dispatched.result.output;
            } else {
                let error = dispatched.result.error.unwrap_or_default();
                debug!(node_id = %child.id, error = %error, "Loop child failed");
                return IterationOutcome {
                    child_ids,
                    output: Value::Null,
                    error: Some((child.id.clone(), error)),
                };
            }
        }

        IterationOutcome {
            child_ids,
            output,
            error: None,
        }
    }
}

struct IterationOutcome {
    child_ids: Vec<String>,
    output: Value,
    error: Option<(String, String)>,
}

/// Keep collaborator results consistent with the node they came from.
fn normalize(node: &WorkflowNode, mut result: NodeResult) -> NodeResult {
    result.node_id = node.id.clone();
    match result.status {
        NodeStatus::Completed => result.error = None,
        NodeStatus::Failed => {
            if result.error.is_none() {
                result.error = Some("Node executor reported failure".to_string());
            }
        }
        other => {
            result.status = NodeStatus::Failed;
            result.error = Some(format!("Node executor returned non-terminal status {}", other));
        }
    }
    result
}

/// Publish a successful result under the node id and, for tool nodes,
/// under the cache key.
fn publish(store: &ArtifactStore, node: &WorkflowNode, result: &NodeResult, cache_key: Option<&str>) {
    let mut artifacts = result.artifacts.clone();
    match &node.output_artifact {
        Some(name) => {
            if !artifacts.contains_key(name) {
                artifacts.insert(name.clone(), result.output.clone());
            }
        }
        None => {
            if artifacts.is_empty() && !result.output.is_null() {
                artifacts.insert(DEFAULT_OUTPUT_ARTIFACT.to_string(), result.output.clone());
            }
        }
    }

    store.store_all(&node.id, &artifacts);
    if let Some(key) = cache_key {
        store.store_all(key, &artifacts);
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run bookkeeping. Only the scheduler loop touches it, which serializes
/// every completion handler.
struct Scheduler {
    ctx: Arc<RunContext>,
    microplanner: Option<Arc<dyn Microplanner>>,
    nodes: HashMap<String, WorkflowNode>,
    /// Insertion order, for deterministic scans
    order: Vec<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    running: HashSet<String>,
    results: HashMap<String, NodeResult>,
    replans: usize,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Completion>,
    started_at: chrono::DateTime<Utc>,
}

impl Scheduler {
    fn new(
        ctx: Arc<RunContext>,
        microplanner: Option<Arc<dyn Microplanner>>,
        initial: Vec<WorkflowNode>,
        max_parallel: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Completion>)> {
        let mut nodes = HashMap::with_capacity(initial.len());
        let mut order = Vec::with_capacity(initial.len());
        for mut node in initial {
            if nodes.contains_key(&node.id) {
                return Err(DagError::NodeAlreadyExists(node.id));
            }
            node.status = NodeStatus::Pending;
            node.result = None;
            order.push(node.id.clone());
            nodes.insert(node.id.clone(), node);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            ctx,
            microplanner,
            nodes,
            order,
            completed: HashSet::new(),
            failed: HashSet::new(),
            running: HashSet::new(),
            results: HashMap::new(),
            replans: 0,
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            tx,
            started_at: Utc::now(),
        };
        Ok((scheduler, rx))
    }

    async fn run(
        mut self,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut cancel: oneshot::Receiver<()>,
    ) -> DagExecutionResult {
        info!(run_id = %self.ctx.run_id, nodes = self.order.len(), "Starting DAG run");
        let mut cancel_armed = true;
        let mut cancelled = false;

        loop {
            if !cancelled {
                self.propagate_failures();
                let ready = self.ready_nodes();
                if !ready.is_empty() {
                    debug!(ready = ?ready, running = self.running.len(), "Launching ready nodes");
                }
                for node_id in ready {
                    self.launch(&node_id);
                }
            }

            if self.running.is_empty() {
                break;
            }

            tokio::select! {
                Some(completion) = completions.recv() => {
                    self.complete(completion).await;
                }
                signal = &mut cancel, if cancel_armed => {
                    cancel_armed = false;
                    if signal.is_ok() {
                        info!(run_id = %self.ctx.run_id, in_flight = self.running.len(), "Cancel requested, draining");
                        cancelled = true;
                    }
                }
                else => break,
            }
        }

        self.sweep(if cancelled { "cancelled" } else { "unreachable" });
        self.finish()
    }

    fn is_pending(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .map(|n| n.status == NodeStatus::Pending)
            .unwrap_or(false)
    }

    /// Fail every pending node with a failed dependency, transitively.
    fn propagate_failures(&mut self) {
        loop {
            let doomed: Vec<String> = self
                .order
                .iter()
                .filter(|id| self.is_pending(id))
                .filter(|id| {
                    self.nodes[id.as_str()]
                        .depends_on
                        .iter()
                        .any(|dep| self.failed.contains(dep))
                })
                .cloned()
                .collect();
            if doomed.is_empty() {
                return;
            }
            for node_id in doomed {
                debug!(node_id = %node_id, "Dependency failed, not dispatching");
                self.record_failure(&node_id, NodeResult::failed(&node_id, UPSTREAM_FAILED));
            }
        }
    }

    fn ready_nodes(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.is_pending(id))
            .filter(|id| {
                self.nodes[id.as_str()]
                    .depends_on
                    .iter()
                    .all(|dep| self.completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    fn launch(&mut self, node_id: &str) {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return;
        };
        if let Err(e) = node.transition(NodeStatus::Running) {
            error!(node_id = %node_id, "Cannot launch: {}", e);
            return;
        }
        let node = node.clone();

        let upstream: HashMap<String, Value> = match &node.kind {
            NodeKind::Merge(spec) => spec
                .merge_inputs
                .iter()
                .filter_map(|id| {
                    self.results
                        .get(id)
                        .filter(|r| r.is_success())
                        .map(|r| (id.clone(), r.output.clone()))
                })
                .collect(),
            _ => HashMap::new(),
        };

        self.running.insert(node_id.to_string());
        info!(node_id = %node_id, node_type = %node.node_type(), in_flight = self.running.len(), "Launching node");
        self.ctx.emit(RuntimeEvent::StepStarted {
            step_id: node_id.to_string(),
            node_type: node.node_type(),
        });

        let ctx = self.ctx.clone();
        let semaphore = self.semaphore.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let (outcome, elapsed_ms) = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    let started = Instant::now();
                    let outcome = ctx.run_guarded(&node, &upstream).await;
                    (outcome, started.elapsed().as_millis() as u64)
                }
                Err(_) => (Dispatched::failed(&node, "Scheduler semaphore closed"), 0),
            };
            let _ = tx.send(Completion {
                node_id: node.id.clone(),
                outcome,
                elapsed_ms,
            });
        });
    }

    async fn complete(&mut self, completion: Completion) {
        let Completion {
            node_id,
            outcome,
            elapsed_ms,
        } = completion;
        self.running.remove(&node_id);

        let Dispatched {
            result,
            args,
            spawned,
            cache_key,
        } = outcome;

        let Some(node) = self.nodes.get_mut(&node_id) else {
            error!(node_id = %node_id, "Completion for unknown node");
            return;
        };
        node.args = args;

        if !result.is_success() {
            let error = result.error.clone().unwrap_or_default();
            warn!(node_id = %node_id, error = %error, "Node failed");
            self.record_failure(&node_id, result);
            return;
        }

        publish(&self.ctx.store, node, &result, cache_key.as_deref());
        if let Err(e) = node.resolve(result.clone()) {
            error!(node_id = %node_id, "Cannot complete: {}", e);
        }
        let node = node.clone();
        self.completed.insert(node_id.clone());
        self.results.insert(node_id.clone(), result.clone());
        info!(node_id = %node_id, elapsed_ms, cached = result.is_cached(), "Node completed");
        self.ctx.emit(RuntimeEvent::StepCompleted {
            step_id: node_id.clone(),
            duration_ms: elapsed_ms,
        });

        let mut result = result;
        if !spawned.is_empty() {
            let added = self.inject(&node_id, spawned, false);
            if added.len() != result.children_spawned.len() {
                result.children_spawned = added;
                self.record_children(&node_id, &result.children_spawned);
            }
        }

        if let Some(planner) = self.microplanner.clone() {
            let pending: Vec<WorkflowNode> = self
                .order
                .iter()
                .filter(|id| self.is_pending(id))
                .map(|id| self.nodes[id.as_str()].clone())
                .collect();
            match planner
                .checkpoint(&node, &result, &pending, &self.ctx.store)
                .await
            {
                Ok(new_nodes) if !new_nodes.is_empty() => {
                    if !self.inject(&node_id, new_nodes, true).is_empty() {
                        self.replans += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(node_id = %node_id, "Microplanner checkpoint failed: {}", e),
            }
        }
    }

    fn record_failure(&mut self, node_id: &str, result: NodeResult) {
        let error = result.error.clone().unwrap_or_default();
        if let Some(node) = self.nodes.get_mut(node_id) {
            if let Err(e) = node.resolve(result.clone()) {
                error!(node_id = %node_id, "Cannot fail node: {}", e);
            }
        }
        self.failed.insert(node_id.to_string());
        self.results.insert(node_id.to_string(), result);
        self.ctx.emit(RuntimeEvent::StepFailed {
            step_id: node_id.to_string(),
            error,
        });
    }

    fn record_children(&mut self, node_id: &str, children: &[String]) {
        if let Some(stored) = self.results.get_mut(node_id) {
            stored.children_spawned = children.to_vec();
        }
        if let Some(stored) = self.nodes.get_mut(node_id).and_then(|n| n.result.as_mut()) {
            stored.children_spawned = children.to_vec();
        }
    }

    /// Add nodes to the live graph and return the ids actually added. Ids
    /// already present are ignored.
    fn inject(&mut self, parent_id: &str, new_nodes: Vec<WorkflowNode>, replan: bool) -> Vec<String> {
        let mut added = Vec::new();
        for mut node in new_nodes {
            if self.nodes.contains_key(&node.id) {
                debug!(node_id = %node.id, parent_id = %parent_id, "Ignoring injected node with existing id");
                continue;
            }
            node.status = NodeStatus::Pending;
            node.result = None;
            self.order.push(node.id.clone());
            added.push(node.id.clone());
            self.nodes.insert(node.id.clone(), node);
        }

        if !added.is_empty() {
            info!(parent_id = %parent_id, count = added.len(), replan, "Injected nodes");
            self.ctx.emit(RuntimeEvent::NodesInjected {
                parent_id: parent_id.to_string(),
                node_ids: added.clone(),
                replan,
            });
        }
        added
    }

    fn sweep(&mut self, reason: &str) {
        let leftover: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.is_pending(id))
            .cloned()
            .collect();
        for node_id in leftover {
            let result = NodeResult::skipped(&node_id, reason);
            if let Some(node) = self.nodes.get_mut(&node_id) {
                if let Err(e) = node.resolve(result.clone()) {
                    error!(node_id = %node_id, "Cannot skip node: {}", e);
                }
            }
            debug!(node_id = %node_id, reason, "Node skipped");
            self.results.insert(node_id.clone(), result);
            self.ctx.emit(RuntimeEvent::StepSkipped { step_id: node_id });
        }
    }

    fn finish(self) -> DagExecutionResult {
        let mut completed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for node in self.nodes.values() {
            match node.status {
                NodeStatus::Completed => completed += 1,
                NodeStatus::Failed => failed += 1,
                NodeStatus::Skipped => skipped += 1,
                NodeStatus::Pending | NodeStatus::Running => {
                    error!(node_id = %node.id, status = %node.status, "Node left non-terminal")
                }
            }
        }

        info!(
            run_id = %self.ctx.run_id,
            total = self.order.len(),
            completed,
            failed,
            skipped,
            replans = self.replans,
            "DAG run finished"
        );

        DagExecutionResult {
            run_id: self.ctx.run_id.clone(),
            total_nodes: self.order.len(),
            completed,
            failed,
            skipped,
            node_results: self.results,
            replans_triggered: self.replans,
            started_at: self.started_at,
            finished_at: Utc::now(),
            store: self.ctx.store.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Constant;

    #[async_trait]
    impl NodeExecutor for Constant {
        async fn dispatch(
            &self,
            node: &WorkflowNode,
            _args: &Map<String, Value>,
            _store: &ArtifactStore,
        ) -> anyhow::Result<NodeResult> {
            Ok(NodeResult::completed(&node.id, json!(node.id)))
        }
    }

    #[test]
    fn test_validate_graph() {
        let ok = vec![
            WorkflowNode::tool("a", "t"),
            WorkflowNode::tool("b", "t").with_deps(["a"]),
        ];
        assert!(validate_graph(&ok).is_ok());

        let cyclic = vec![
            WorkflowNode::tool("a", "t").with_deps(["c"]),
            WorkflowNode::tool("b", "t").with_deps(["a"]),
            WorkflowNode::tool("c", "t").with_deps(["b"]),
            WorkflowNode::tool("d", "t"),
        ];
        match validate_graph(&cyclic).unwrap_err() {
            DagError::InvalidGraph { nodes, .. } => assert_eq!(nodes, vec!["a", "b", "c"]),
            other => panic!("unexpected error {:?}", other),
        }

        let dangling = vec![WorkflowNode::tool("a", "t").with_deps(["ghost"])];
        assert!(matches!(
            validate_graph(&dangling),
            Err(DagError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_normalize() {
        let node = WorkflowNode::tool("n", "t");
        let mut odd = NodeResult::completed("other", json!(1));
        odd.status = NodeStatus::Running;
        let fixed = normalize(&node, odd);
        assert_eq!(fixed.node_id, "n");
        assert_eq!(fixed.status, NodeStatus::Failed);
        assert!(fixed.error.is_some());
    }

    #[test]
    fn test_publish_default_artifact() {
        let store = ArtifactStore::new();
        let plain = WorkflowNode::tool("plain", "t");
        publish(&store, &plain, &NodeResult::completed("plain", json!(5)), None);
        assert_eq!(store.get("plain", DEFAULT_OUTPUT_ARTIFACT), Some(json!(5)));

        let named = WorkflowNode::tool("named", "t").with_output("answer");
        let result = NodeResult::completed("named", json!("x")).with_artifact("extra", json!(1));
        publish(&store, &named, &result, Some("cache:abc"));
        assert_eq!(store.get("named", "answer"), Some(json!("x")));
        assert_eq!(store.get("cache:abc", "extra"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_duplicate_initial_ids_rejected() {
        let executor = DagExecutor::new(Arc::new(Constant));
        let err = executor
            .execute(vec![WorkflowNode::tool("a", "t"), WorkflowNode::tool("a", "u")])
            .await
            .unwrap_err();
        assert!(matches!(err, DagError::NodeAlreadyExists(id) if id == "a"));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        struct Panics;

        #[async_trait]
        impl NodeExecutor for Panics {
            async fn dispatch(
                &self,
                _node: &WorkflowNode,
                _args: &Map<String, Value>,
                _store: &ArtifactStore,
            ) -> anyhow::Result<NodeResult> {
                panic!("boom")
            }
        }

        let executor = DagExecutor::new(Arc::new(Panics));
        let result = executor
            .execute(vec![WorkflowNode::tool("a", "t")])
            .await
            .unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(result.error_of("a"), Some("Dispatch panicked: boom"));
    }
}
