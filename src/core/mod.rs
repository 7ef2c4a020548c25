// Core infrastructure shared by the wiring engine and the executor

pub mod errors;
pub mod telemetry;

pub use errors::{DagError, Result};
pub use telemetry::{init_test_tracing, init_tracing};
