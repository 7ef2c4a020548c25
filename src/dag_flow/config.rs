use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use super::node::WorkflowNode;
use crate::core::errors::{DagError, Result};

/// Tuning for the auto-wirer and its candidate index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WiringConfig {
    /// Disable to dispatch nodes with exactly the args they were given
    pub enabled: bool,
    /// How deep artifact values are flattened into candidates
    pub max_depth: usize,
    /// How many leading list elements become candidates
    pub max_list_items: usize,
    /// A heuristic match must score strictly above this
    pub accept_threshold: f64,
    /// Maximum candidates summarized for the semantic resolver
    pub summary_limit: usize,
    /// Candidate values are truncated to this many characters in summaries
    pub summary_value_chars: usize,
}

impl Default for WiringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 3,
            max_list_items: 3,
            accept_threshold: 0.7,
            summary_limit: 50,
            summary_value_chars: 50,
        }
    }
}

/// Configuration for DAG execution behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagConfig {
    /// Maximum number of node dispatches in flight at once
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
    /// Per-dispatch deadline; expiry fails the node
    #[serde(default)]
    pub node_timeout_secs: Option<u64>,
    /// Reject cyclic graphs before scheduling instead of skipping their nodes
    #[serde(default)]
    pub validate_acyclic: bool,
    /// Upper bound on one semantic-resolver call
    #[serde(default = "default_resolver_timeout_secs")]
    pub resolver_timeout_secs: u64,
    #[serde(default)]
    pub wiring: WiringConfig,
}

fn default_max_parallel_nodes() -> usize {
    3
}

fn default_resolver_timeout_secs() -> u64 {
    30
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel_nodes(),
            node_timeout_secs: None,
            validate_acyclic: false,
            resolver_timeout_secs: default_resolver_timeout_secs(),
            wiring: WiringConfig::default(),
        }
    }
}

impl DagConfig {
    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_nodes == 0 {
            return Err(DagError::configuration_field(
                "max_parallel_nodes must be greater than 0",
                "max_parallel_nodes",
            ));
        }

        if let Some(timeout) = self.node_timeout_secs {
            if timeout == 0 {
                return Err(DagError::configuration_field(
                    "node_timeout_secs must be greater than 0",
                    "node_timeout_secs",
                ));
            }
        }

        if self.resolver_timeout_secs == 0 {
            return Err(DagError::configuration_field(
                "resolver_timeout_secs must be greater than 0",
                "resolver_timeout_secs",
            ));
        }

        if !(0.0..=2.0).contains(&self.wiring.accept_threshold) {
            return Err(DagError::configuration_field(
                "accept_threshold must be within [0, 2]",
                "wiring.accept_threshold",
            ));
        }

        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: DagConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut content = String::new();
        File::open(path.as_ref())?.read_to_string(&mut content)?;
        Self::from_yaml_str(&content)
    }

    /// Merges two configurations, with override_with taking precedence
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self> {
        let merged = Self {
            max_parallel_nodes: override_with.max_parallel_nodes,
            node_timeout_secs: override_with.node_timeout_secs.or(base.node_timeout_secs),
            validate_acyclic: base.validate_acyclic || override_with.validate_acyclic,
            resolver_timeout_secs: override_with.resolver_timeout_secs,
            wiring: override_with.wiring.clone(),
        };

        merged.validate()?;
        Ok(merged)
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_secs.map(Duration::from_secs)
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver_timeout_secs)
    }
}

/// A graph declared in a file.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: Option<DagConfig>,
    pub nodes: Vec<WorkflowNode>,
}

impl WorkflowDefinition {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let definition: WorkflowDefinition = serde_yaml::from_str(yaml)?;
        if let Some(config) = &definition.config {
            config.validate()?;
        }
        Ok(definition)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut content = String::new();
        File::open(path.as_ref())?.read_to_string(&mut content)?;
        Self::from_yaml_str(&content)
    }

    /// The definition's config layered over `base`.
    pub fn effective_config(&self, base: &DagConfig) -> Result<DagConfig> {
        match &self.config {
            Some(config) => DagConfig::merge(base, config),
            None => Ok(base.clone()),
        }
    }
}
