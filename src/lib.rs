// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod types;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use petgraph::dot::{Config, Dot};
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::dag::topology::{find_critical_path, topological_sort};
use crate::dag::{Graph, TracingListener};
use crate::engine::WaveExecutor;
use crate::exec::{BackendRegistry, BackendRequirements, TaskBackend};
use crate::types::{BackendChoice, BackendKind};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - graph file loading
/// - backend registry and selection
/// - the wave executor
/// - Ctrl-C handling
///
/// An unsuccessful run is an `Err` after the JSON result has been printed.
pub async fn run(args: CliArgs) -> Result<()> {
    let graph_path = args.graph.clone();
    let cfg = load_and_validate(&graph_path)
        .with_context(|| format!("loading graph file {}", graph_path.display()))?;
    let graph = cfg.to_graph()?;
    let registry = BackendRegistry::with_builtins(cfg.backends.clone());

    if args.compare_backends {
        print_backend_table(&registry).await;
        return Ok(());
    }
    if args.dot {
        println!("{}", render_dot(&graph));
        return Ok(());
    }
    if args.dry_run {
        print_dry_run(&cfg, &graph)?;
        return Ok(());
    }

    let mut options = cfg.run;
    if args.fail_fast {
        options = options.fail_fast();
    }
    if let Some(limit) = args.max_concurrency {
        options = options.with_max_concurrency(usize::try_from(limit).unwrap_or(usize::MAX));
    }

    let choice = args.backend.unwrap_or(cfg.backend);
    let backend = select_backend(&registry, choice, &graph).await?;

    let executor = WaveExecutor::new(Arc::clone(&backend)).with_options(options);
    executor.subscribe(Arc::new(TracingListener));

    // Ctrl-C → cancel the run token.
    {
        let token = executor.cancellation_token();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; cancelling run");
            token.cancel();
        });
    }

    let result = executor.run(&graph).await;

    if backend.kind() == BackendKind::Worktree {
        info!("keeping task worktrees and branches for inspection");
    } else {
        backend.cleanup().await?;
    }

    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        match &result.run_error {
            Some(run_error) => bail!("run {} failed: {}", result.run_id, run_error),
            None => bail!(
                "run {} failed: {} node(s) failed",
                result.run_id,
                result.errors.len()
            ),
        }
    }
    Ok(())
}

/// Resolve the backend to run on. `auto` scores every available backend
/// against the graph's widest wave, preferring isolation and zero token
/// overhead.
async fn select_backend(
    registry: &BackendRegistry,
    choice: BackendChoice,
    graph: &Graph,
) -> Result<Arc<dyn TaskBackend>> {
    let backend = match choice {
        BackendChoice::Fixed(kind) => registry.create(kind)?,
        BackendChoice::Auto => {
            let widest = topological_sort(graph)
                .ok()
                .map(|order| order.stats.max_parallelism);
            let requirements = BackendRequirements {
                needs_isolation: true,
                parallel_tasks: widest,
                minimize_tokens: true,
                ..BackendRequirements::default()
            };
            registry.select_best(&requirements).await?
        }
    };
    info!(backend = backend.name(), "using backend");
    Ok(backend)
}

/// Graphviz rendering, edges pointing from dependency to dependent.
pub fn render_dot(graph: &Graph) -> String {
    let mut g: DiGraphMap<&str, ()> = DiGraphMap::new();
    for id in graph.node_ids() {
        g.add_node(id);
    }
    for node in graph.nodes() {
        for dep in &node.dependencies {
            if graph.contains(dep) {
                g.add_edge(dep.as_str(), node.id.as_str(), ());
            }
        }
    }
    format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
}

async fn print_backend_table(registry: &BackendRegistry) {
    println!(
        "{:<16} {:>9} {:>10} {:>8} {:>9} {:>10} {:>8} {:>9}",
        "backend", "available", "max_tasks", "tokens", "isolated", "shared_ctx", "stream", "dep_pass"
    );
    for row in registry.compare().await {
        let caps = row.capabilities;
        let max = if caps.max_parallelism == 0 {
            "unbounded".to_string()
        } else {
            caps.max_parallelism.to_string()
        };
        println!(
            "{:<16} {:>9} {:>10} {:>8} {:>9} {:>10} {:>8} {:>9}",
            row.name,
            row.available,
            max,
            caps.token_overhead_per_task,
            caps.true_isolation,
            caps.shared_context,
            caps.supports_streaming,
            caps.efficient_dependency_passing
        );
    }
}

/// Waves, stats and critical path; nothing is executed.
fn print_dry_run(cfg: &ConfigFile, graph: &Graph) -> Result<()> {
    let order = topological_sort(graph)?;
    let critical = find_critical_path(graph, None)?;

    println!("dagwave dry-run: {} ({})", graph.name(), graph.id());
    println!("  run.failure_policy = {:?}", cfg.run.failure_policy);
    println!("  run.max_concurrency = {:?}", cfg.run.max_concurrency);
    println!("  run.global_timeout = {:?}", cfg.run.global_timeout);
    println!("  run.node_timeout = {:?}", cfg.run.node_timeout);
    println!("  run.backend = {:?}", cfg.backend);
    println!();

    println!("waves ({}):", order.waves.len());
    for wave in &order.waves {
        println!("  [{}] {}", wave.index, wave.node_ids.join(", "));
    }
    println!();

    let stats = &order.stats;
    println!("stats:");
    println!("  nodes: {}", stats.total_nodes);
    println!("  edges: {}", stats.total_edges);
    println!("  roots: {}", stats.root_nodes);
    println!("  leaves: {}", stats.leaf_nodes);
    println!("  max parallelism: {}", stats.max_parallelism);
    println!("  avg parallelism: {:.2}", stats.avg_parallelism);
    println!();

    println!("critical path ({}): {}", critical.cost, critical.path.join(" -> "));

    debug!("dry-run complete (no execution)");
    Ok(())
}
