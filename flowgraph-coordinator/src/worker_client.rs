//! Worker Protocol client (§4.8): submits a plan to `flowgraph-worker` over
//! HTTP and polls for completion. Implements [`Executor`] so the `Scheduler`
//! can treat it interchangeably with [`LocalExecutor`] — grounded on the
//! teacher's pattern of hiding transport behind a trait the engine core
//! depends on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use flowgraph_core::error::FlowError;
use flowgraph_core::graph::NodeId;
use flowgraph_core::lazy::Plan;
use flowgraph_core::output_validator::ActualResult;
use flowgraph_core::scheduler::Executor;
use flowgraph_core::worker_protocol::{
    next_backoff, CancelResponse, SampleResponse, StatusResponse, SubmitRequest, SubmitResponse, TaskId, TaskState,
};
use reqwest::Client;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// HTTP client to a single worker, enforcing `max_in_flight` with a
/// semaphore the way the teacher bounds concurrent outbound calls (§5).
///
/// Tracks the `node_id -> task_id` mapping for every in-flight `execute`
/// call so a separate `cancel(node_id)` invocation (racing in from the
/// coordinator's `/flow/{id}/cancel` handler on another task) can reach the
/// right worker task and unstick the polling loop in `execute`.
pub struct WorkerClient {
    http: Client,
    base_url: String,
    in_flight: Semaphore,
    inflight_tasks: DashMap<NodeId, (TaskId, Arc<AtomicBool>)>,
}

impl WorkerClient {
    pub fn new(base_url: impl Into<String>, max_in_flight: usize) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            in_flight: Semaphore::new(max_in_flight.max(1)),
            inflight_tasks: DashMap::new(),
        }
    }

    async fn submit(&self, task_id: TaskId, plan: &Plan) -> Result<SubmitResponse, FlowError> {
        let plan_blob = serde_json::to_string(plan).map_err(|e| FlowError::Internal(e.to_string()))?;
        let request = SubmitRequest {
            task_id,
            plan_blob,
            output_spec: None,
            mode: flowgraph_core::graph::ExecutionMode::Development,
        };
        self.http
            .post(format!("{}/submit", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| FlowError::Runtime(format!("worker submit failed: {e}")))?
            .json::<SubmitResponse>()
            .await
            .map_err(|e| FlowError::Internal(format!("worker submit response: {e}")))
    }

    async fn status(&self, task_id: TaskId) -> Result<StatusResponse, FlowError> {
        self.http
            .get(format!("{}/status/{task_id}", self.base_url))
            .send()
            .await
            .map_err(|e| FlowError::Runtime(format!("worker status failed: {e}")))?
            .json::<StatusResponse>()
            .await
            .map_err(|e| FlowError::Internal(format!("worker status response: {e}")))
    }

    async fn result(&self, task_id: TaskId) -> Result<ActualResult, FlowError> {
        #[derive(serde::Deserialize)]
        struct Raw {
            schema: flowgraph_core::types::Schema,
            row_count: u64,
        }
        let raw: Raw = self
            .http
            .get(format!("{}/result/{task_id}", self.base_url))
            .send()
            .await
            .map_err(|e| FlowError::Runtime(format!("worker result failed: {e}")))?
            .json()
            .await
            .map_err(|e| FlowError::Internal(format!("worker result response: {e}")))?;

        // Pull the full payload back through `/sample` (§4.8) rather than a
        // bounded peek — the scheduler needs every row to materialize a
        // correct cache entry, not just an observation sample.
        let rows = self.sample(task_id, raw.row_count as usize).await.map(|s| s.rows).unwrap_or_default();
        let sample = rows.iter().take(20).cloned().collect();
        Ok(ActualResult { schema: raw.schema, row_count: raw.row_count, rows, sample })
    }

    pub async fn sample(&self, task_id: TaskId, rows: usize) -> Result<SampleResponse, FlowError> {
        self.http
            .get(format!("{}/sample/{task_id}?rows={rows}", self.base_url))
            .send()
            .await
            .map_err(|e| FlowError::Runtime(format!("worker sample failed: {e}")))?
            .json::<SampleResponse>()
            .await
            .map_err(|e| FlowError::Internal(format!("worker sample response: {e}")))
    }
}

#[async_trait]
impl Executor for WorkerClient {
    async fn execute(&self, node_id: NodeId, plan: Plan) -> Result<ActualResult, FlowError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FlowError::Internal("worker client semaphore closed".into()))?;

        let task_id = Uuid::new_v4();
        let submitted = self.submit(task_id, &plan).await?;
        if !submitted.accepted {
            return Err(FlowError::Runtime(submitted.reason.unwrap_or_else(|| "worker rejected task".into())));
        }

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.inflight_tasks.insert(node_id, (task_id, cancel_flag.clone()));
        let outcome = self.poll_until_done(node_id, task_id, &cancel_flag).await;
        self.inflight_tasks.remove(&node_id);
        outcome
    }

    /// §5 "A cancel request on a running graph ... issues `POST /cancel`;
    /// waits up to `cancel_grace_ms` ... thereafter transitions remaining
    /// `Running` nodes to `Cancelled` regardless of worker reply." The
    /// coordinator enforces the grace window; this only needs to stop
    /// polling and report cancelled once asked.
    async fn cancel(&self, node_id: NodeId) {
        let Some((_, (task_id, flag))) = self.inflight_tasks.remove(&node_id) else {
            tracing::debug!(node_id, "cancel requested for node with no in-flight worker task");
            return;
        };
        flag.store(true, Ordering::SeqCst);
        let response = cancel_task(&self.http, &self.base_url, task_id).await;
        tracing::info!(node_id, task_id = %task_id, cancelled = response.cancelled, "sent worker cancel");
    }
}

impl WorkerClient {
    async fn poll_until_done(
        &self,
        node_id: NodeId,
        task_id: TaskId,
        cancel_flag: &AtomicBool,
    ) -> Result<ActualResult, FlowError> {
        let mut backoff_ms = 100;
        loop {
            if cancel_flag.load(Ordering::SeqCst) {
                return Err(FlowError::Cancelled);
            }
            let status = self.status(task_id).await?;
            match status.state {
                TaskState::Done => return self.result(task_id).await,
                TaskState::Failed => {
                    return Err(FlowError::Runtime(
                        status.error_message.unwrap_or_else(|| "worker task failed".into()),
                    ))
                }
                TaskState::Cancelled => return Err(FlowError::Cancelled),
                TaskState::Queued | TaskState::Running => {
                    tracing::debug!(node_id, task_id = %task_id, state = ?status.state, "polling worker");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = next_backoff(backoff_ms);
                }
            }
        }
    }
}

/// Best-effort cancel of a specific worker task by id.
pub async fn cancel_task(http: &Client, base_url: &str, task_id: TaskId) -> CancelResponse {
    http.post(format!("{base_url}/cancel/{task_id}"))
        .send()
        .await
        .ok()
        .and_then(|r| r.json::<CancelResponse>().await.ok())
        .unwrap_or(CancelResponse { cancelled: false })
}
