mod http;
mod tasks;

use std::sync::Arc;

use flowgraph_core::config::WorkerConfig;
use tasks::TaskPool;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = WorkerConfig::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pool = Arc::new(TaskPool::new(config.max_in_flight));
    let addr = format!("{}:{}", config.host, config.port);

    tracing::info!(%addr, max_in_flight = config.max_in_flight, "flowgraph-worker listening");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind worker address");
            std::process::exit(70);
        }
    };
    if let Err(e) = axum::serve(listener, http::router(pool)).await {
        tracing::error!(error = %e, "worker server exited with error");
    }
}
