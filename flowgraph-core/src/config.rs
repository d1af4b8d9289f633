//! Environment-variable configuration (§6 "Environment variables the core
//! reads"). Manual `std::env::var` reads with defaults and CLI-arg
//! precedence, following the teacher's `parse_database_url()` idiom rather
//! than a reflective config-loading framework.

use crate::graph::ExecutionMode;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    pub worker_base_url: String,
    pub cache_dir: String,
    pub cache_max_bytes: u64,
    pub log_level: String,
    pub execution_mode: ExecutionMode,
    pub max_parallel_nodes: usize,
    pub cancel_grace_ms: u64,
}

impl CoordinatorConfig {
    /// Reads `COORDINATOR_HOST`, `COORDINATOR_PORT`, `WORKER_BASE_URL`,
    /// `CACHE_DIR`, `CACHE_MAX_BYTES`, `LOG_LEVEL`, `EXECUTION_MODE`,
    /// `MAX_PARALLEL_NODES`, `CANCEL_GRACE_MS` (§6), each with a sane
    /// default so the binary runs unconfigured for local development.
    pub fn from_env() -> Self {
        Self {
            host: env_or("COORDINATOR_HOST", "0.0.0.0"),
            port: env_or("COORDINATOR_PORT", "8080").parse().unwrap_or(8080),
            worker_base_url: env_or("WORKER_BASE_URL", "http://127.0.0.1:8081"),
            cache_dir: env_or("CACHE_DIR", "/tmp/flowgraph-cache"),
            cache_max_bytes: env_or("CACHE_MAX_BYTES", "1073741824").parse().unwrap_or(1_073_741_824),
            log_level: env_or("LOG_LEVEL", "info"),
            execution_mode: match env_or("EXECUTION_MODE", "Development").as_str() {
                "Performance" => ExecutionMode::Performance,
                _ => ExecutionMode::Development,
            },
            max_parallel_nodes: env_or("MAX_PARALLEL_NODES", "8").parse().unwrap_or(8),
            cancel_grace_ms: env_or("CANCEL_GRACE_MS", "5000").parse().unwrap_or(5000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_in_flight: usize,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("WORKER_HOST", "0.0.0.0"),
            port: env_or("WORKER_PORT", "8081").parse().unwrap_or(8081),
            log_level: env_or("LOG_LEVEL", "info"),
            max_in_flight: env_or("MAX_IN_FLIGHT", &default_parallelism().to_string()).parse().unwrap_or_else(|_| default_parallelism()),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        std::env::remove_var("COORDINATOR_PORT");
        let config = CoordinatorConfig::from_env();
        assert_eq!(config.port, 8080);
        assert_eq!(config.execution_mode, ExecutionMode::Development);
    }
}
