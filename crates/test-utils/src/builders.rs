#![allow(dead_code)]

use dagwave::config::{ConfigFile, NodeConfig, RawConfigFile, RetrySection};
use dagwave::dag::{Graph, Node, RetryPolicy};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn with_node(mut self, id: &str, node: NodeConfig) -> Self {
        self.config.node.insert(id.to_string(), node);
        self
    }

    pub fn with_graph_id(mut self, id: &str) -> Self {
        self.config.graph.id = Some(id.to_string());
        self
    }

    pub fn with_default_retry(mut self, retry: RetrySection) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.config.run.max_concurrency = Some(limit);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `NodeConfig`.
pub struct NodeConfigBuilder {
    node: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new(prompt: &str) -> Self {
        Self {
            node: NodeConfig {
                prompt: prompt.to_string(),
                ..NodeConfig::default()
            },
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.node.after = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.node.timeout = Some(timeout.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.node.priority = priority;
        self
    }

    pub fn retry(mut self, retry: RetrySection) -> Self {
        self.node.retry = Some(retry);
        self
    }

    pub fn build(self) -> NodeConfig {
        self.node
    }
}

/// Policy with no backoff delay, so retry tests stay fast.
pub fn instant_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: std::time::Duration::ZERO,
        max_delay: std::time::Duration::ZERO,
        ..RetryPolicy::default()
    }
}

/// `ids[0] -> ids[1] -> ...`, each depending on the previous one.
pub fn chain(ids: &[&str]) -> Graph {
    let mut builder = Graph::builder("chain");
    let mut previous: Option<&str> = None;
    for id in ids {
        let mut node = Node::new(*id).with_prompt(format!("run {id}"));
        if let Some(prev) = previous {
            node = node.depends_on(prev);
        }
        builder.add_node(node);
        previous = Some(id);
    }
    builder.build().expect("chain ids are unique")
}

/// `start -> {p0..p(width-1)} -> end`.
pub fn fan_out_fan_in(width: usize) -> Graph {
    let mut builder = Graph::builder("fan").node(Node::new("start"));
    let mut end = Node::new("end");
    for i in 0..width {
        let id = format!("p{i}");
        builder.add_node(Node::new(id.as_str()).depends_on("start"));
        end = end.depends_on(id);
    }
    builder.node(end).build().expect("fan ids are unique")
}

/// `a -> {b, c} -> d`.
pub fn diamond() -> Graph {
    Graph::builder("diamond")
        .node(Node::new("a"))
        .node(Node::new("b").depends_on("a"))
        .node(Node::new("c").depends_on("a"))
        .node(Node::new("d").depends_on("b").depends_on("c"))
        .build()
        .expect("diamond ids are unique")
}

/// Apply `policy` to every node of `graph`.
pub fn with_policy(graph: &Graph, policy: RetryPolicy) -> Graph {
    let mut builder = Graph::builder(graph.id()).name(graph.name());
    for node in graph.nodes() {
        builder.add_node(node.clone().with_retry_policy(policy.clone()));
    }
    builder.build().expect("source graph ids are unique")
}
