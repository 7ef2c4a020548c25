//! Autonomous input wiring: candidate flattening and argument resolution.

pub mod auto_wirer;
pub mod candidates;

pub use auto_wirer::AutoWirer;
pub use candidates::{CandidateIndex, CandidateSummary, ValueType, WiringCandidate};
