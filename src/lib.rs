// Core infrastructure modules
pub mod core;

// Collaborator contracts and stock implementations
pub mod coord;

// Candidate index and auto-wirer
pub mod wiring;

// Node model, artifact store and the executor
pub mod dag_flow;

// Re-exports for convenience
pub use crate::core::errors::{DagError, Result};
pub use crate::core::telemetry::init_tracing;

pub use coord::{
    ActionRegistry, CompositePlanner, ConditionEvaluator, ExpressionEvaluator, Microplanner,
    NodeAction, NodeCtx, NodeExecutor, NodeOutput, NoopPlanner, Resolution, SchemaSource,
    SemanticResolver, StaticSchemaSource, ToolSchema,
};
pub use dag_flow::*;
pub use wiring::{AutoWirer, CandidateIndex, CandidateSummary, ValueType, WiringCandidate};
