//! Worker HTTP surface (§4.8): `/submit /status/{id} /result/{id}
//! /sample/{id} /cancel/{id} /healthz`, grounded on the teacher's and
//! `orca`'s axum handler idiom (`State` + `Path` + `Query` + `Json`
//! extractors, a flat error-to-response mapping).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use flowgraph_core::lazy::Plan;
use flowgraph_core::worker_protocol::{
    CancelResponse, HealthResponse, ResultResponse, SampleResponse, StatusResponse, SubmitRequest, SubmitResponse,
    TaskState,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::tasks::TaskPool;

pub fn router(pool: Arc<TaskPool>) -> Router {
    Router::new()
        .route("/submit", post(submit))
        .route("/status/:task_id", get(status))
        .route("/result/:task_id", get(result))
        .route("/sample/:task_id", get(sample))
        .route("/cancel/:task_id", post(cancel))
        .route("/healthz", get(healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(pool)
}

async fn submit(State(pool): State<Arc<TaskPool>>, Json(req): Json<SubmitRequest>) -> Response {
    let plan: Plan = match serde_json::from_str(&req.plan_blob) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(SubmitResponse { accepted: false, reason: Some(format!("bad plan_blob: {e}")) }),
            )
                .into_response()
        }
    };

    pool.submit(req.task_id, plan, req.output_spec);
    Json(SubmitResponse { accepted: true, reason: None }).into_response()
}

async fn status(State(pool): State<Arc<TaskPool>>, Path(task_id): Path<Uuid>) -> Response {
    match pool.status(task_id) {
        Some((state, error_kind, error_message)) => {
            Json(StatusResponse { state, progress: None, error_kind, error_message }).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn result(State(pool): State<Arc<TaskPool>>, Path(task_id): Path<Uuid>) -> Response {
    match pool.status(task_id) {
        Some((TaskState::Done, _, _)) => match pool.result(task_id) {
            Some(actual) => Json(ResultResponse {
                schema: actual.schema,
                row_count: actual.row_count,
                payload_location: format!("mem://{task_id}"),
            })
            .into_response(),
            None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
        Some(_) => StatusCode::CONFLICT.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct SampleQuery {
    rows: Option<usize>,
}

async fn sample(
    State(pool): State<Arc<TaskPool>>,
    Path(task_id): Path<Uuid>,
    Query(q): Query<SampleQuery>,
) -> Response {
    let limit = q.rows.unwrap_or(20);
    match pool.result(task_id) {
        Some(actual) => {
            let columns = actual.schema.names().into_iter().map(String::from).collect();
            let truncated = actual.rows.len() > limit;
            let rows = actual.rows.into_iter().take(limit).collect();
            Json(SampleResponse { columns, rows, truncated }).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn cancel(State(pool): State<Arc<TaskPool>>, Path(task_id): Path<Uuid>) -> Response {
    Json(CancelResponse { cancelled: pool.cancel(task_id) }).into_response()
}

async fn healthz(State(pool): State<Arc<TaskPool>>) -> Response {
    Json(HealthResponse {
        ok: true,
        queue_depth: pool.queue_depth(),
        running_tasks: pool.running_count(),
        memory_bytes: 0,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_empty_pool() {
        let pool = Arc::new(TaskPool::new(4));
        let resp = healthz(State(pool)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_unknown_task_is_404() {
        let pool = Arc::new(TaskPool::new(4));
        let resp = status(State(pool), Path(Uuid::new_v4())).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
