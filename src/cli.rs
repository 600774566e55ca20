// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::default_config_path;
use crate::types::BackendChoice;

/// Command-line arguments for `dagwave`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dagwave",
    version,
    about = "Run a dependency graph of agent tasks in parallel waves.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the graph file (TOML).
    ///
    /// Default: `Dagwave.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value_os_t = default_config_path())]
    pub graph: PathBuf,

    /// Backend to run tasks on: `auto`, `process`, `worktree` or
    /// `shared-context`. Overrides `[run].backend`.
    #[arg(long, value_name = "KIND", value_parser = parse_backend_choice)]
    pub backend: Option<BackendChoice>,

    /// Stop after the first wave in which a node fails for good.
    #[arg(long)]
    pub fail_fast: bool,

    /// Upper bound on nodes running at once within a wave.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub max_concurrency: Option<u64>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DAGWAVE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print waves, stats and the critical path, but don't
    /// execute anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the graph in Graphviz DOT format and exit.
    #[arg(long)]
    pub dot: bool,

    /// Print the capability table of every backend and exit.
    #[arg(long)]
    pub compare_backends: bool,
}

fn parse_backend_choice(s: &str) -> Result<BackendChoice, String> {
    s.parse()
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
