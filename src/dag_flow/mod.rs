pub mod config;
pub mod events;
pub mod executor;
pub mod node;
pub mod planning;
pub mod reference;
pub mod store;
pub mod structural;

pub use config::{DagConfig, WiringConfig, WorkflowDefinition};
pub use events::{BufferingEventSink, EventSink, LoggingEventSink, RuntimeEvent, RuntimeEventEnvelope};
pub use executor::{DagExecutor, DagExecutorBuilder, DEFAULT_OUTPUT_ARTIFACT, UPSTREAM_FAILED};
pub use node::{
    DagExecutionResult, LoopSpec, MergeSpec, MergeStrategy, NodeKind, NodeResult, NodeStatus,
    NodeType, SwitchSpec, WorkflowNode,
};
pub use planning::{plan_from_llm_output, Plan, ToolCallPlanner};
pub use reference::{PathSegment, Reference};
pub use store::{cache_key, ArtifactStore, CACHE_PREFIX};
