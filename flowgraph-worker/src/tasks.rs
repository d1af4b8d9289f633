//! Worker task pool [SUPPLEMENT]: a bounded in-process executor for lazy
//! plans submitted over the Worker Protocol (§4.8), grounded on the
//! teacher's fiber-pool idiom (a shared table of task records plus a
//! semaphore-bounded spawn), adapted here to a flat task map since the
//! worker has no BPMN process/fiber hierarchy to track.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use flowgraph_core::error::{ErrorKind, FlowError};
use flowgraph_core::lazy::Plan;
use flowgraph_core::output_validator::{self, ActualResult, OutputFieldConfig};
use flowgraph_core::worker_protocol::TaskState;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub struct TaskRecord {
    pub state: TaskState,
    pub result: Option<ActualResult>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    cancel_requested: Arc<AtomicBool>,
}

impl TaskRecord {
    fn queued() -> Self {
        Self {
            state: TaskState::Queued,
            result: None,
            error_kind: None,
            error_message: None,
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Bounded pool: `max_in_flight` concurrent plan executions, each run via
/// `spawn_blocking` since `Plan::execute` is synchronous CPU work (§5 "the
/// lazy runtime may use its own thread pool, which the worker treats as
/// opaque").
pub struct TaskPool {
    tasks: DashMap<Uuid, TaskRecord>,
    in_flight: Arc<Semaphore>,
}

impl TaskPool {
    pub fn new(max_in_flight: usize) -> Self {
        Self { tasks: DashMap::new(), in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))) }
    }

    pub fn queue_depth(&self) -> u64 {
        self.tasks.iter().filter(|t| t.state == TaskState::Queued).count() as u64
    }

    pub fn running_count(&self) -> u64 {
        self.tasks.iter().filter(|t| t.state == TaskState::Running).count() as u64
    }

    /// Registers the task and spawns its execution. Returns immediately;
    /// the caller polls `status`/`result`.
    pub fn submit(self: &Arc<Self>, task_id: Uuid, plan: Plan, output_spec: Option<OutputFieldConfig>) {
        self.tasks.insert(task_id, TaskRecord::queued());
        let pool = self.clone();
        tokio::spawn(async move {
            let _permit = match pool.in_flight.acquire().await {
                Ok(p) => p,
                Err(_) => return,
            };

            if let Some(mut entry) = pool.tasks.get_mut(&task_id) {
                if entry.cancel_requested.load(Ordering::SeqCst) {
                    entry.state = TaskState::Cancelled;
                    return;
                }
                entry.state = TaskState::Running;
            }

            let result = tokio::task::spawn_blocking(move || plan.execute()).await;

            let mut entry = match pool.tasks.get_mut(&task_id) {
                Some(e) => e,
                None => return,
            };
            if entry.cancel_requested.load(Ordering::SeqCst) {
                entry.state = TaskState::Cancelled;
                return;
            }

            match result {
                Ok(Ok(frame)) => {
                    let row_count = frame.row_count() as u64;
                    let sample = frame.rows.iter().take(20).cloned().collect();
                    let actual = ActualResult { schema: frame.schema, row_count, rows: frame.rows, sample };
                    let validated = match &output_spec {
                        Some(cfg) if cfg.enabled => output_validator::validate(cfg, &actual),
                        _ => Ok(actual),
                    };
                    match validated {
                        Ok(actual) => {
                            entry.state = TaskState::Done;
                            entry.result = Some(actual);
                        }
                        Err(e) => set_failed(&mut entry, &e),
                    }
                }
                Ok(Err(e)) => set_failed(&mut entry, &e),
                Err(join_err) => set_failed(&mut entry, &FlowError::Internal(join_err.to_string())),
            }
        });
    }

    pub fn status(&self, task_id: Uuid) -> Option<(TaskState, Option<ErrorKind>, Option<String>)> {
        self.tasks.get(&task_id).map(|t| (t.state, t.error_kind, t.error_message.clone()))
    }

    pub fn result(&self, task_id: Uuid) -> Option<ActualResult> {
        self.tasks.get(&task_id).and_then(|t| t.result.clone())
    }

    /// Best-effort: a task not yet started is cancelled before it runs; a
    /// task already executing in `spawn_blocking` runs to completion (the
    /// in-process lazy runtime has no cancellation hook), matching the
    /// `cancel_grace_ms` fallback behavior described in §5 at the
    /// coordinator layer.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        if let Some(mut entry) = self.tasks.get_mut(&task_id) {
            entry.cancel_requested.store(true, Ordering::SeqCst);
            if entry.state == TaskState::Queued {
                entry.state = TaskState::Cancelled;
            }
            true
        } else {
            false
        }
    }
}

fn set_failed(entry: &mut TaskRecord, error: &FlowError) {
    entry.state = TaskState::Failed;
    entry.error_kind = Some(error.kind());
    entry.error_message = Some(error.message());
}
