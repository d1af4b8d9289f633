//! Worker Protocol (C8): wire types shared by the coordinator's client and
//! the worker's HTTP server (§4.8). Transport-agnostic — `flowgraph-worker`
//! and `flowgraph-coordinator` serialize these as JSON bodies.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::graph::ExecutionMode;
use crate::types::Schema;

pub type TaskId = uuid::Uuid;

/// `POST /submit` request body (§4.8). `plan_blob` is an opaque, versioned
/// serialization of a lazy plan — the worker understands it, the
/// coordinator does not inspect it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub task_id: TaskId,
    pub plan_blob: String,
    pub output_spec: Option<crate::output_validator::OutputFieldConfig>,
    pub mode: ExecutionMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub accepted: bool,
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

/// `GET /status/{task_id}` response (§4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: TaskState,
    pub progress: Option<f32>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// `GET /result/{task_id}` response, only valid when `state == done` (§4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultResponse {
    pub schema: Schema,
    pub row_count: u64,
    pub payload_location: String,
}

/// `GET /sample/{task_id}?rows=N` response (§4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SampleResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<crate::types::Value>>,
    pub truncated: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// `GET /healthz` response (§4.8): back-pressure signal the coordinator's
/// client reads to enforce `max_in_flight`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub queue_depth: u64,
    pub running_tasks: u64,
    pub memory_bytes: u64,
}

/// Retries are limited to `input_missing` and `internal`, up to 2 attempts
/// with exponential backoff; other kinds surface immediately (§4.8).
pub fn is_retryable(kind: ErrorKind) -> bool {
    kind.is_retryable()
}

/// Polling backoff schedule: 100 ms → 2 s cap (§4.8).
pub fn next_backoff(current_ms: u64) -> u64 {
    (current_ms.saturating_mul(2)).clamp(100, 2_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut ms = 100;
        for _ in 0..20 {
            ms = next_backoff(ms);
        }
        assert_eq!(ms, 2_000);
    }

    #[test]
    fn status_response_round_trips_through_json() {
        let resp = StatusResponse { state: TaskState::Running, progress: Some(0.5), error_kind: None, error_message: None };
        let json = serde_json::to_string(&resp).unwrap();
        let back: StatusResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, TaskState::Running);
    }
}
