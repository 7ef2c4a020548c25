use thiserror::Error;

/// Unified error type for the taskdag library.
///
/// Per-node failures never surface here; they are recorded on the node's
/// `NodeResult`. This type covers structural and setup problems only.
#[derive(Debug, Error)]
pub enum DagError {
    /// The graph cannot be scheduled (e.g. a cycle when validation is enabled)
    #[error("Invalid graph: {message}")]
    InvalidGraph {
        message: String,
        nodes: Vec<String>,
    },

    /// A node state transition that the state machine does not allow
    #[error("Invalid state transition for node {node_id}: {from} -> {to}")]
    InvalidState {
        node_id: String,
        from: String,
        to: String,
    },

    /// A reference expression that does not follow the reference grammar
    #[error("Invalid reference '{reference}': {message}")]
    Reference { reference: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already exists: {0}")]
    NodeAlreadyExists(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DagError {
    /// Create an invalid graph error naming the offending nodes
    pub fn invalid_graph<S: Into<String>>(message: S, nodes: Vec<String>) -> Self {
        Self::InvalidGraph {
            message: message.into(),
            nodes,
        }
    }

    /// Create a reference parse error
    pub fn reference<R: Into<String>, M: Into<String>>(reference: R, message: M) -> Self {
        Self::Reference {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error for a specific field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidGraph { .. } => "graph",
            Self::InvalidState { .. } => "state",
            Self::Reference { .. } => "reference",
            Self::Configuration { .. } => "configuration",
            Self::NodeNotFound(_) | Self::NodeAlreadyExists(_) => "node",
            Self::Json(_) | Self::Yaml(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

/// Result type alias for convenience
pub type Result<T, E = DagError> = std::result::Result<T, E>;
