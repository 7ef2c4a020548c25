//! Collaborator contracts consumed by the executor and the auto-wirer,
//! plus the stock implementations shipped with the crate.

pub mod action;
pub mod condition;
pub mod hooks;
pub mod registry;
pub mod types;

pub use action::*;
pub use condition::{ConditionEvaluator, ExpressionEvaluator};
pub use hooks::*;
pub use registry::*;
pub use types::*;
