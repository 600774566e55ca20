// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::dag::{Graph, Node, TaskErrorKind};
use crate::engine::RunOptions;
use crate::errors::Result;
use crate::exec::BackendSettings;
use crate::types::{BackendChoice, FailurePolicy};

/// Graph file exactly as read from TOML.
///
/// ```toml
/// [graph]
/// id = "release"
///
/// [run]
/// failure_policy = "fail-fast"
///
/// [node.build]
/// prompt = "Build the project"
///
/// [node.test]
/// prompt = "Run the tests"
/// after = ["build"]
/// ```
///
/// Every section is optional except at least one `[node.<id>]`, which is
/// enforced during validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub graph: GraphSection,

    #[serde(default)]
    pub run: RunSection,

    /// Default retry policy, applied to every node.
    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub backend: BackendSection,

    /// Keys are node IDs.
    #[serde(default)]
    pub node: BTreeMap<String, NodeConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphSection {
    /// Defaults to the file stem when loaded from disk.
    pub id: Option<String>,
    pub name: Option<String>,
}

/// `[run]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunSection {
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    pub max_concurrency: Option<usize>,

    /// Duration string, e.g. `"10m"`.
    pub global_timeout: Option<String>,

    /// Default per-node timeout, e.g. `"2m"`.
    pub node_timeout: Option<String>,

    #[serde(default)]
    pub backend: BackendChoice,
}

/// Retry settings. Used for `[retry]` and as a partial per-node override;
/// unset fields inherit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub base_delay: Option<String>,
    pub max_delay: Option<String>,
    pub multiplier: Option<f64>,
    pub retryable: Option<Vec<TaskErrorKind>>,
    pub non_retryable: Option<Vec<TaskErrorKind>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub process: ProcessSection,

    #[serde(default)]
    pub worktree: WorktreeSection,

    #[serde(default)]
    pub shared_context: SharedContextSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessSection {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub model: Option<String>,
    pub timeout: Option<String>,
    pub max_processes: Option<usize>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorktreeSection {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub model: Option<String>,
    pub timeout: Option<String>,
    pub base_dir: Option<PathBuf>,
    pub branch_prefix: Option<String>,
    pub max_worktrees: Option<usize>,
    pub repo_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SharedContextSection {
    pub max_parallel: Option<usize>,
    pub default_agent: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub run_in_background: Option<bool>,
}

/// `[node.<id>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    /// Defaults to the node ID.
    pub description: Option<String>,

    #[serde(default)]
    pub prompt: String,

    pub skill: Option<String>,

    /// This node waits for every node listed here.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub priority: i32,

    pub timeout: Option<String>,

    pub model: Option<String>,

    pub retry: Option<RetrySection>,

    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

/// Validated graph file. Built through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub graph_id: String,
    pub graph_name: Option<String>,
    pub run: RunOptions,
    pub backend: BackendChoice,
    pub backends: BackendSettings,
    /// In node-ID order.
    pub nodes: Vec<Node>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        graph_id: String,
        graph_name: Option<String>,
        run: RunOptions,
        backend: BackendChoice,
        backends: BackendSettings,
        nodes: Vec<Node>,
    ) -> Self {
        Self {
            graph_id,
            graph_name,
            run,
            backend,
            backends,
            nodes,
        }
    }

    /// Freeze the nodes into an executable [`Graph`].
    pub fn to_graph(&self) -> Result<Graph> {
        let mut builder = Graph::builder(&self.graph_id);
        if let Some(name) = &self.graph_name {
            builder = builder.name(name);
        }
        for node in &self.nodes {
            builder.add_node(node.clone());
        }
        builder.build()
    }
}
