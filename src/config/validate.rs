// src/config/validate.rs

use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile, RetrySection};
use crate::dag::{Node, RetryPolicy};
use crate::engine::{DEFAULT_GLOBAL_TIMEOUT, DEFAULT_NODE_TIMEOUT, RunOptions};
use crate::errors::{DagwaveError, Result};
use crate::exec::{
    BackendSettings, ProcessBackendConfig, SharedContextConfig, WorktreeBackendConfig,
};
use crate::types::parse_duration;

const DEFAULT_GRAPH_ID: &str = "dag";

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = DagwaveError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_nodes(&raw)?;
        validate_node_dependencies(&raw)?;
        validate_dag(&raw)?;

        let run = build_run_options(&raw)?;
        let default_retry = apply_retry(&RetryPolicy::default(), &raw.retry, "[retry]")?;
        let backends = build_backend_settings(&raw)?;
        let nodes = build_nodes(&raw, &default_retry)?;

        Ok(ConfigFile::new_unchecked(
            raw.graph.id.unwrap_or_else(|| DEFAULT_GRAPH_ID.to_string()),
            raw.graph.name,
            run,
            raw.run.backend,
            backends,
            nodes,
        ))
    }
}

fn ensure_has_nodes(cfg: &RawConfigFile) -> Result<()> {
    if cfg.node.is_empty() {
        return Err(DagwaveError::ConfigError(
            "config must contain at least one [node.<id>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_node_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (id, node) in cfg.node.iter() {
        for dep in node.after.iter() {
            if dep == id {
                return Err(DagwaveError::ConfigError(format!(
                    "node '{}' cannot depend on itself in `after`",
                    id
                )));
            }
            if !cfg.node.contains_key(dep) {
                return Err(DagwaveError::ConfigError(format!(
                    "node '{}' has unknown dependency '{}' in `after`",
                    id, dep
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: dep -> node.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for id in cfg.node.keys() {
        graph.add_node(id.as_str());
    }
    for (id, node) in cfg.node.iter() {
        for dep in node.after.iter() {
            graph.add_edge(dep.as_str(), id.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(DagwaveError::DagCycle(format!(
            "cycle detected in node graph involving node '{}'",
            cycle.node_id()
        ))),
    }
}

fn duration_field(value: Option<&str>, field: &str) -> Result<Option<Duration>> {
    value
        .map(|s| {
            parse_duration(s)
                .map_err(|e| DagwaveError::ConfigError(format!("{field}: {e}")))
        })
        .transpose()
}

fn build_run_options(cfg: &RawConfigFile) -> Result<RunOptions> {
    let run = &cfg.run;

    if run.max_concurrency == Some(0) {
        return Err(DagwaveError::ConfigError(
            "[run].max_concurrency must be >= 1 (got 0)".to_string(),
        ));
    }

    let global_timeout = duration_field(run.global_timeout.as_deref(), "[run].global_timeout")?
        .unwrap_or(DEFAULT_GLOBAL_TIMEOUT);
    let node_timeout = duration_field(run.node_timeout.as_deref(), "[run].node_timeout")?
        .unwrap_or(DEFAULT_NODE_TIMEOUT);
    if global_timeout.is_zero() || node_timeout.is_zero() {
        return Err(DagwaveError::ConfigError(
            "[run] timeouts must be greater than zero".to_string(),
        ));
    }

    Ok(RunOptions {
        failure_policy: run.failure_policy,
        max_concurrency: run.max_concurrency,
        global_timeout: Some(global_timeout),
        node_timeout,
    })
}

/// Overlay `section` on `base` and check the result.
fn apply_retry(base: &RetryPolicy, section: &RetrySection, scope: &str) -> Result<RetryPolicy> {
    let mut policy = base.clone();

    if let Some(max_attempts) = section.max_attempts {
        policy.max_attempts = max_attempts;
    }
    if let Some(d) = duration_field(section.base_delay.as_deref(), &format!("{scope}.base_delay"))? {
        policy.base_delay = d;
    }
    if let Some(d) = duration_field(section.max_delay.as_deref(), &format!("{scope}.max_delay"))? {
        policy.max_delay = d;
    }
    if let Some(multiplier) = section.multiplier {
        policy.multiplier = multiplier;
    }
    if let Some(kinds) = &section.retryable {
        policy.retryable = kinds.clone();
    }
    if let Some(kinds) = &section.non_retryable {
        policy.non_retryable = kinds.clone();
    }

    if policy.max_attempts == 0 {
        return Err(DagwaveError::ConfigError(format!(
            "{scope}.max_attempts must be >= 1 (got 0)"
        )));
    }
    if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
        return Err(DagwaveError::ConfigError(format!(
            "{scope}.multiplier must be >= 1.0 (got {})",
            policy.multiplier
        )));
    }
    if policy.base_delay > policy.max_delay {
        return Err(DagwaveError::ConfigError(format!(
            "{scope}.base_delay ({:?}) must not exceed max_delay ({:?})",
            policy.base_delay, policy.max_delay
        )));
    }

    Ok(policy)
}

fn positive_cap(value: Option<usize>, default: usize, field: &str) -> Result<usize> {
    match value {
        Some(0) => Err(DagwaveError::ConfigError(format!(
            "{field} must be >= 1 (got 0)"
        ))),
        Some(n) => Ok(n),
        None => Ok(default),
    }
}

fn build_backend_settings(cfg: &RawConfigFile) -> Result<BackendSettings> {
    let section = &cfg.backend;

    let mut process = ProcessBackendConfig::default();
    let p = &section.process;
    if let Some(program) = &p.program {
        process.program = program.clone();
    }
    if let Some(args) = &p.args {
        process.args = args.clone();
    }
    if let Some(model) = &p.model {
        process.default_model = model.clone();
    }
    if let Some(d) = duration_field(p.timeout.as_deref(), "[backend.process].timeout")? {
        process.default_timeout = d;
    }
    process.max_processes = positive_cap(
        p.max_processes,
        process.max_processes,
        "[backend.process].max_processes",
    )?;
    process.working_dir = p.working_dir.clone();

    let mut worktree = WorktreeBackendConfig::default();
    let w = &section.worktree;
    if let Some(program) = &w.program {
        worktree.program = program.clone();
    }
    if let Some(args) = &w.args {
        worktree.args = args.clone();
    }
    if let Some(model) = &w.model {
        worktree.default_model = model.clone();
    }
    if let Some(d) = duration_field(w.timeout.as_deref(), "[backend.worktree].timeout")? {
        worktree.default_timeout = d;
    }
    if let Some(base_dir) = &w.base_dir {
        worktree.base_dir = base_dir.clone();
    }
    if let Some(prefix) = &w.branch_prefix {
        worktree.branch_prefix = prefix.clone();
    }
    worktree.max_worktrees = positive_cap(
        w.max_worktrees,
        worktree.max_worktrees,
        "[backend.worktree].max_worktrees",
    )?;
    worktree.repo_dir = w.repo_dir.clone();

    let mut shared_context = SharedContextConfig::default();
    let s = &section.shared_context;
    shared_context.max_parallel = positive_cap(
        s.max_parallel,
        shared_context.max_parallel,
        "[backend.shared_context].max_parallel",
    )?;
    if let Some(agent) = &s.default_agent {
        shared_context.default_agent = agent.clone();
    }
    if s.model.is_some() {
        shared_context.default_model = s.model.clone();
    }
    if let Some(turns) = s.max_turns {
        shared_context.max_turns = turns;
    }
    if let Some(background) = s.run_in_background {
        shared_context.run_in_background = background;
    }

    Ok(BackendSettings {
        process,
        worktree,
        shared_context,
    })
}

fn build_nodes(cfg: &RawConfigFile, default_retry: &RetryPolicy) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(cfg.node.len());

    for (id, raw) in cfg.node.iter() {
        let scope = format!("[node.{id}]");
        let mut node = Node::new(id.as_str())
            .with_prompt(raw.prompt.as_str())
            .with_priority(raw.priority);

        if let Some(description) = &raw.description {
            node = node.with_description(description.as_str());
        }
        if let Some(skill) = &raw.skill {
            node = node.with_skill(skill.as_str());
        }
        if let Some(model) = &raw.model {
            node = node.with_model(model.as_str());
        }
        if let Some(timeout) = duration_field(raw.timeout.as_deref(), &format!("{scope}.timeout"))? {
            if timeout.is_zero() {
                return Err(DagwaveError::ConfigError(format!(
                    "{scope}.timeout must be greater than zero"
                )));
            }
            node = node.with_timeout(timeout);
        }

        let policy = match &raw.retry {
            Some(section) => apply_retry(default_retry, section, &format!("{scope}.retry"))?,
            None => default_retry.clone(),
        };
        node = node.with_retry_policy(policy);

        for dep in &raw.after {
            node = node.depends_on(dep.as_str());
        }
        for (key, value) in &raw.context {
            node = node.with_context(key.as_str(), value.clone());
        }

        nodes.push(node);
    }

    Ok(nodes)
}
