//! Coordinator HTTP surface (§6): run/graph/observation endpoints only —
//! auth, catalog, and secrets are explicitly out of scope. Routing follows
//! `orca`'s `api/routes.rs` shape (one `Router::new()` with `.route(...)`
//! chains, `with_state`); handlers follow its `handlers/workflows.rs`
//! extractor style (`State`, `Path`, `Query`, `Json`).

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use flowgraph_core::catalog::{self, NodeSettings};
use flowgraph_core::graph::{Edge, Graph, Node, NodeId, Port, Position};
use flowgraph_core::output_validator::OutputFieldConfig;
use flowgraph_core::persistence::dto::GraphDto;
use flowgraph_core::scheduler::{Executor, NodeRunStatus, RunOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::{AppState, CurrentRun, FlowEntry};
use crate::error::ApiError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/flow", post(create_flow))
        .route("/flow/load", post(load_flow))
        .route("/flow/:id", get(get_flow))
        .route("/flow/:id/node", post(add_node))
        .route("/flow/:id/node/:nid", patch(update_node).delete(remove_node))
        .route("/flow/:id/edge", post(add_edge).delete(remove_edge))
        .route("/flow/:id/run", post(run_flow))
        .route("/flow/:id/cancel", post(cancel_flow))
        .route("/flow/:id/status", get(flow_status))
        .route("/flow/:id/node/:nid/sample", get(node_sample))
        .route("/flow/:id/events", get(flow_events))
        .route("/flow/:id/schema/:nid", get(node_schema))
        .route("/flow/:id/save", post(save_flow))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn flow_or_404(state: &AppState, id: u64) -> Result<Arc<FlowEntry>, ApiError> {
    state.flow(id).ok_or_else(|| ApiError::NotFound(format!("flow {id} not found")))
}

// ─── /flow ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateFlowRequest {
    name: String,
    #[serde(default)]
    description: String,
}

async fn create_flow(State(state): State<AppState>, Json(req): Json<CreateFlowRequest>) -> Json<GraphDto> {
    let graph_id = state.alloc_graph_id();
    let mut graph = Graph::new(graph_id, req.name);
    graph.description = req.description;
    let entry = state.insert_flow(graph);
    let snapshot = entry.graph.read().await;
    Json(GraphDto::from_graph(&snapshot))
}

async fn get_flow(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<GraphDto>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let graph = entry.graph.read().await;
    Ok(Json(GraphDto::from_graph(&graph)))
}

#[derive(Deserialize)]
struct LoadFlowRequest {
    path: String,
}

async fn load_flow(State(state): State<AppState>, Json(req): Json<LoadFlowRequest>) -> Result<Json<GraphDto>, ApiError> {
    let mut graph = state
        .0
        .persistence
        .load_file(&req.path)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    graph.graph_id = state.alloc_graph_id();
    let entry = state.insert_flow(graph);
    let snapshot = entry.graph.read().await;
    Ok(Json(GraphDto::from_graph(&snapshot)))
}

#[derive(Deserialize)]
struct SaveFlowRequest {
    path: Option<String>,
}

async fn save_flow(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<SaveFlowRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let graph = entry.graph.read().await;
    let path = req
        .path
        .or_else(|| graph.flow_settings.path.clone())
        .ok_or_else(|| ApiError::BadRequest("no path given and flow has no saved path".into()))?;
    state.0.persistence.save_file(&graph, &path).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "saved": true, "path": path })))
}

// ─── /flow/{id}/node ────────────────────────────────────────────

#[derive(Deserialize)]
struct AddNodeRequest {
    node_id: Option<NodeId>,
    #[serde(default)]
    position: Position,
    settings: NodeSettings,
    #[serde(default = "default_true")]
    cache_results: bool,
    #[serde(default)]
    description: String,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct NodeResponse {
    node_id: NodeId,
}

async fn add_node(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<AddNodeRequest>,
) -> Result<Json<NodeResponse>, ApiError> {
    let entry = flow_or_404(&state, id)?;

    let errors = catalog::validate_settings(&req.settings);
    if !errors.is_empty() {
        return Err(ApiError::BadRequest(format!("{:?}", errors)));
    }

    let node_id = req.node_id.unwrap_or_else(|| entry.alloc_node_id());
    let mut graph = entry.graph.write().await;
    graph
        .add_node(Node {
            node_id,
            settings: req.settings,
            position: req.position,
            cache_results: req.cache_results,
            description: req.description,
            output_field_config: None,
        })
        .map_err(ApiError::from)?;
    Ok(Json(NodeResponse { node_id }))
}

#[derive(Deserialize, Default)]
struct UpdateNodeRequest {
    #[serde(default)]
    settings: Option<NodeSettings>,
    #[serde(default)]
    position: Option<Position>,
    #[serde(default)]
    cache_results: Option<bool>,
    #[serde(default)]
    output_field_config: Option<Option<OutputFieldConfig>>,
}

async fn update_node(
    State(state): State<AppState>,
    Path((id, nid)): Path<(u64, NodeId)>,
    Json(req): Json<UpdateNodeRequest>,
) -> Result<Json<GraphDto>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let mut graph = entry.graph.write().await;

    if let Some(settings) = req.settings {
        let errors = catalog::validate_settings(&settings);
        if !errors.is_empty() {
            return Err(ApiError::BadRequest(format!("{:?}", errors)));
        }
        graph.update_settings(nid, settings).map_err(ApiError::from)?;
    }
    if let Some(position) = req.position {
        graph.update_node_position(nid, position).map_err(ApiError::from)?;
    }
    if let Some(cache_results) = req.cache_results {
        graph.update_cache_results(nid, cache_results).map_err(ApiError::from)?;
    }
    if let Some(config) = req.output_field_config {
        graph.update_output_field_config(nid, config).map_err(ApiError::from)?;
    }

    Ok(Json(GraphDto::from_graph(&graph)))
}

async fn remove_node(State(state): State<AppState>, Path((id, nid)): Path<(u64, NodeId)>) -> Result<Json<GraphDto>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let mut graph = entry.graph.write().await;
    graph.remove_node(nid).map_err(ApiError::from)?;
    Ok(Json(GraphDto::from_graph(&graph)))
}

// ─── /flow/{id}/edge ────────────────────────────────────────────

#[derive(Deserialize)]
struct EdgeRequest {
    source_node: NodeId,
    source_port: Port,
    target_node: NodeId,
    target_port: Port,
}

async fn add_edge(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<EdgeRequest>,
) -> Result<Json<GraphDto>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let mut graph = entry.graph.write().await;
    graph
        .add_edge(Edge {
            source_node: req.source_node,
            source_port: req.source_port,
            target_node: req.target_node,
            target_port: req.target_port,
        })
        .map_err(ApiError::from)?;
    Ok(Json(GraphDto::from_graph(&graph)))
}

async fn remove_edge(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<EdgeRequest>,
) -> Result<Json<GraphDto>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let mut graph = entry.graph.write().await;
    graph
        .remove_edge(req.source_node, &req.source_port, req.target_node, &req.target_port)
        .map_err(ApiError::from)?;
    Ok(Json(GraphDto::from_graph(&graph)))
}

// ─── run / cancel / status ──────────────────────────────────────

#[derive(Deserialize, Default)]
struct RunRequest {
    #[serde(default)]
    targets: Option<Vec<NodeId>>,
}

#[derive(Serialize)]
struct RunResponse {
    run_id: Uuid,
}

async fn run_flow(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let graph_snapshot = entry.graph.read().await.clone();

    let targets: HashSet<NodeId> = match req.targets {
        Some(t) => t.into_iter().collect(),
        None => graph_snapshot.terminal_nodes().into_iter().collect(),
    };
    if targets.is_empty() {
        return Err(ApiError::BadRequest("flow has no nodes to run".into()));
    }

    let run_id = Uuid::new_v4();
    let scheduler = Arc::new(flowgraph_core::scheduler::Scheduler::new(state.0.config.max_parallel_nodes));
    *entry.current_run.write().await = Some(CurrentRun { run_id, scheduler: scheduler.clone() });

    state
        .0
        .store
        .create_run(run_id, graph_snapshot.graph_id, &targets.iter().copied().collect::<Vec<_>>())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let _ = state
        .0
        .store
        .append_event(
            run_id,
            &flowgraph_core::events::RuntimeEvent::RunStarted {
                run_id,
                graph_id: graph_snapshot.graph_id,
                targets: targets.iter().copied().collect(),
                at: flowgraph_core::types::now_ms(),
            },
        )
        .await;

    let execution_mode = graph_snapshot.flow_settings.execution_mode;
    let cache = state.0.cache.clone();
    let executor = state.0.executor.clone();
    let store = state.0.store.clone();

    let node_ids: Vec<NodeId> = graph_snapshot.list_nodes().map(|n| n.node_id).collect();

    tokio::spawn(async move {
        let outcome = scheduler.run(&graph_snapshot, &cache, executor.as_ref(), &targets, execution_mode).await;
        for node_id in &node_ids {
            if let Some((columns, rows)) = scheduler.node_run(*node_id).sample {
                let _ = store.save_sample(run_id, *node_id, &columns, &rows).await;
            }
        }
        record_run_outcome(store.as_ref(), run_id, outcome).await;
    });

    Ok(Json(RunResponse { run_id }))
}

async fn record_run_outcome(
    store: &dyn flowgraph_core::store::RunStore,
    run_id: Uuid,
    outcome: Result<RunOutcome, flowgraph_core::error::FlowError>,
) {
    let (success, failed_nodes) = match &outcome {
        Ok(o) => (o.success, o.failed_nodes.clone()),
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "run failed to complete");
            (false, Vec::new())
        }
    };
    let _ = store.finish_run(run_id, success).await;
    let _ = store
        .append_event(
            run_id,
            &flowgraph_core::events::RuntimeEvent::RunFinished {
                run_id,
                success,
                failed_nodes,
                error_kind_counts: Vec::new(),
                at: flowgraph_core::types::now_ms(),
            },
        )
        .await;
}

async fn cancel_flow(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<serde_json::Value>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let current = entry.current_run.read().await;
    match current.as_ref() {
        Some(run) => {
            run.scheduler.cancel();
            // §5: send an out-of-band cancel to every node the worker is
            // currently executing, not just the scheduler's own flag.
            let graph = entry.graph.read().await;
            for node in graph.list_nodes() {
                if run.scheduler.node_run(node.node_id).status == NodeRunStatus::Running {
                    state.0.executor.cancel(node.node_id).await;
                }
            }
            Ok(Json(serde_json::json!({ "cancelled": true, "run_id": run.run_id })))
        }
        None => Err(ApiError::NotFound("no run in progress for this flow".into())),
    }
}

#[derive(Serialize)]
struct NodeStatusDto {
    node_id: NodeId,
    status: NodeRunStatus,
    error_kind: Option<flowgraph_core::error::ErrorKind>,
    error_message: Option<String>,
    row_count: Option<u64>,
}

#[derive(Serialize)]
struct FlowStatusResponse {
    run_id: Uuid,
    nodes: Vec<NodeStatusDto>,
}

async fn flow_status(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<FlowStatusResponse>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let current = entry.current_run.read().await;
    let run = current.as_ref().ok_or_else(|| ApiError::NotFound("no run recorded for this flow".into()))?;

    let graph = entry.graph.read().await;
    let nodes = graph
        .list_nodes()
        .map(|n| {
            let run_state = run.scheduler.node_run(n.node_id);
            NodeStatusDto {
                node_id: n.node_id,
                status: run_state.status,
                error_kind: run_state.error_kind,
                error_message: run_state.error_message,
                row_count: run_state.row_count,
            }
        })
        .collect();

    Ok(Json(FlowStatusResponse { run_id: run.run_id, nodes }))
}

// ─── sample / events / schema ───────────────────────────────────

#[derive(Deserialize)]
struct SampleQuery {
    #[serde(default)]
    rows: Option<usize>,
}

async fn node_sample(
    State(state): State<AppState>,
    Path((id, nid)): Path<(u64, NodeId)>,
    Query(query): Query<SampleQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let current = entry.current_run.read().await;
    let run = current.as_ref().ok_or_else(|| ApiError::NotFound("no run recorded for this flow".into()))?;

    let (columns, mut rows) = state
        .0
        .store
        .load_sample(run.run_id, nid)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("no sample available for node {nid}")))?;

    let limit = query.rows.unwrap_or(100);
    let truncated = rows.len() > limit;
    rows.truncate(limit);
    Ok(Json(serde_json::json!({ "columns": columns, "rows": rows, "truncated": truncated })))
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    #[serde(default)]
    since: Option<u64>,
}

async fn flow_events(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<flowgraph_core::events::LoggedEvent>>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let current = entry.current_run.read().await;
    let run = current.as_ref().ok_or_else(|| ApiError::NotFound("no run recorded for this flow".into()))?;

    let events = state
        .0
        .store
        .read_events(run.run_id, query.since.unwrap_or(0))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .into_iter()
        .map(|(seq, event)| flowgraph_core::events::LoggedEvent { seq, event })
        .collect();
    Ok(Json(events))
}

async fn node_schema(
    State(state): State<AppState>,
    Path((id, nid)): Path<(u64, NodeId)>,
) -> Result<Json<flowgraph_core::types::Schema>, ApiError> {
    let entry = flow_or_404(&state, id)?;
    let graph = entry.graph.read().await;
    entry
        .propagator
        .schema_of(&graph, nid)
        .map(Json)
        .map_err(|d| ApiError::BadRequest(d.message))
}
