mod app_state;
mod error;
mod http;
mod worker_client;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use flowgraph_core::cache::Cache;
use flowgraph_core::config::CoordinatorConfig;
use flowgraph_core::persistence::yaml::Persistence;
use flowgraph_core::scheduler::{Executor, LocalExecutor, Scheduler};
use flowgraph_core::store_memory::MemoryStore;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use worker_client::WorkerClient;

/// [SUPPLEMENT] CLI wrapper (§6 exit codes): `flowgraph-coordinator` with no
/// arguments starts the HTTP server; `--once <flow.yaml>` runs a graph to
/// completion and exits, for scripting and CI use without standing up a
/// worker process.
#[derive(Parser, Debug)]
#[command(name = "flowgraph-coordinator")]
struct Cli {
    /// Run this flow file to completion and exit instead of serving HTTP.
    #[arg(long)]
    once: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let config = CoordinatorConfig::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let exit_code = match cli.once {
        Some(path) => run_once(config, path).await,
        None => {
            serve(config).await;
            0
        }
    };
    std::process::exit(exit_code);
}

async fn serve(config: CoordinatorConfig) {
    let addr = format!("{}:{}", config.host, config.port);
    let max_in_flight = config.max_parallel_nodes;
    let worker_base_url = config.worker_base_url.clone();

    let store = Arc::new(MemoryStore::new());
    let executor: Arc<dyn Executor> = Arc::new(WorkerClient::new(worker_base_url, max_in_flight));
    let state = AppState::new(config, store, executor);

    tracing::info!(%addr, "flowgraph-coordinator listening");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind coordinator address");
            std::process::exit(70);
        }
    };
    if let Err(e) = axum::serve(listener, http::router(state)).await {
        tracing::error!(error = %e, "coordinator server exited with error");
    }
}

/// Loads a flow, runs it to completion against an in-process [`LocalExecutor`]
/// (no worker process required for one-shot use), and maps the outcome to the
/// exit codes in §6: `0` success, `1` user error, `2` run failure, `3`
/// cancelled, `>= 64` internal.
async fn run_once(config: CoordinatorConfig, path: PathBuf) -> i32 {
    let persistence = Persistence::new();
    let graph = match persistence.load_file(&path) {
        Ok(g) => g,
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "failed to load flow");
            return 1;
        }
    };

    let targets: HashSet<_> = graph.terminal_nodes().into_iter().collect();
    if targets.is_empty() {
        tracing::error!("flow has no nodes to run");
        return 1;
    }

    let cache = Cache::new(config.cache_max_bytes);
    let scheduler = Scheduler::new(config.max_parallel_nodes);
    let executor = LocalExecutor;

    match scheduler.run(&graph, &cache, &executor, &targets, graph.flow_settings.execution_mode).await {
        Ok(outcome) if outcome.success => 0,
        Ok(outcome) if !outcome.cancelled_nodes.is_empty() => {
            tracing::warn!(cancelled = ?outcome.cancelled_nodes, "run cancelled");
            3
        }
        Ok(outcome) => {
            tracing::error!(failed = ?outcome.failed_nodes, "run failed");
            2
        }
        Err(e) => {
            tracing::error!(error = %e, "internal error running flow");
            70
        }
    }
}
