use thiserror::Error;

/// Stable, machine-readable failure tag (§7). Carried on every `NodeRun` and
/// surfaced verbatim across the worker protocol and the coordinator's HTTP
/// surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    GraphStructure,
    InputMissing,
    Runtime,
    OutOfMemory,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether the scheduler is allowed to retry a node that failed with
    /// this kind (§7: `input_missing` and `internal`, bounded to a couple of
    /// attempts; everything else surfaces immediately).
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::InputMissing | ErrorKind::Internal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::GraphStructure => "graph_structure",
            ErrorKind::InputMissing => "input_missing",
            ErrorKind::Runtime => "runtime",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Typed failure surface for the core. Fallible operations that don't need a
/// stable tag (internal plumbing) return `anyhow::Result`; operations whose
/// failure a caller must branch on (validation, graph mutation, scheduling)
/// return `FlowError`.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("graph structure: {0}")]
    GraphStructure(String),

    #[error("node {0} not found")]
    NodeNotFound(u64),

    #[error("port {port} on node {node} out of arity")]
    PortArity { node: u64, port: String },

    #[error("cycle would be introduced by this edge")]
    WouldCycle,

    #[error("input missing: {0}")]
    InputMissing(String),

    #[error("runtime: {0}")]
    Runtime(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(String),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Validation(_) => ErrorKind::Validation,
            FlowError::GraphStructure(_) | FlowError::PortArity { .. } | FlowError::WouldCycle => {
                ErrorKind::GraphStructure
            }
            FlowError::NodeNotFound(_) => ErrorKind::GraphStructure,
            FlowError::InputMissing(_) => ErrorKind::InputMissing,
            FlowError::Runtime(_) => ErrorKind::Runtime,
            FlowError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            FlowError::Timeout(_) => ErrorKind::Timeout,
            FlowError::Cancelled => ErrorKind::Cancelled,
            FlowError::Internal(_) | FlowError::Yaml(_) | FlowError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Single-line message bounded for the `error_message` field (§7). The
    /// full `Display` text may be longer; callers that need the bounded
    /// 64 KiB `detail` field should use `Display` directly instead.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_spec() {
        assert!(ErrorKind::InputMissing.is_retryable());
        assert!(ErrorKind::Internal.is_retryable());
        assert!(!ErrorKind::Runtime.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::GraphStructure).unwrap();
        assert_eq!(s, "\"graph_structure\"");
    }

    #[test]
    fn flow_error_maps_to_expected_kind() {
        assert_eq!(FlowError::WouldCycle.kind(), ErrorKind::GraphStructure);
        assert_eq!(FlowError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            FlowError::InputMissing("payload gone".into()).kind(),
            ErrorKind::InputMissing
        );
    }
}
