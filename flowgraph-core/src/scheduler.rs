//! Scheduler / Executor (C7): topological dispatch, per-node state machine,
//! cancellation, fan-in synchronization, partial reruns (§4.7).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::error::{ErrorKind, FlowError};
use crate::fingerprint::{self, Fingerprint, SourceMetadata};
use crate::graph::{ExecutionMode, Graph, NodeId};
use crate::output_validator::{self, ActualResult};
use crate::plan::PlanBuilder;
use crate::types::{Timestamp, Value};

/// Bound on rows kept for `/sample` (§4.8, §4.11): the executor truncates
/// before the result ever reaches the scheduler.
const SAMPLE_ROW_LIMIT: usize = 20;

/// Per-node lifecycle state (§4.7 state diagram).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Idle,
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Skipped,
}

impl NodeRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeRunStatus::Success | NodeRunStatus::Failed | NodeRunStatus::Cancelled | NodeRunStatus::Skipped
        )
    }
}

/// Transient per-execution state of a single node (§3 NodeRun).
#[derive(Clone, Debug)]
pub struct NodeRun {
    pub status: NodeRunStatus,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub row_count: Option<u64>,
    pub fingerprint: Option<Fingerprint>,
    /// `(column_names, rows)` bounded to [`SAMPLE_ROW_LIMIT`], populated on
    /// successful execution for the `/sample` endpoint.
    pub sample: Option<(Vec<String>, Vec<Vec<Value>>)>,
}

impl Default for NodeRun {
    fn default() -> Self {
        Self {
            status: NodeRunStatus::Idle,
            started_at: None,
            finished_at: None,
            error_kind: None,
            error_message: None,
            row_count: None,
            fingerprint: None,
            sample: None,
        }
    }
}

/// Something the Scheduler can hand a plan to: the Worker Protocol client in
/// multi-process mode, or an in-process executor in single-machine mode
/// (§4.7 step 3). Kept as a trait so the worker-protocol crate can plug in
/// without the core depending on HTTP.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, node_id: NodeId, plan: crate::lazy::Plan) -> Result<ActualResult, FlowError>;
    async fn cancel(&self, node_id: NodeId);
}

/// A simple in-process executor running `Plan::execute` directly — the
/// "single-machine mode" fallback named in §4.7 step 3.
pub struct LocalExecutor;

#[async_trait::async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, _node_id: NodeId, plan: crate::lazy::Plan) -> Result<ActualResult, FlowError> {
        let frame = plan.execute()?;
        let row_count = frame.row_count() as u64;
        let sample = frame.rows.iter().take(SAMPLE_ROW_LIMIT).cloned().collect();
        Ok(ActualResult { schema: frame.schema, row_count, rows: frame.rows, sample })
    }

    async fn cancel(&self, _node_id: NodeId) {}
}

/// Owns all `NodeRun` state for a single run and drives dispatch (§4.7,
/// §5). The Graph itself is observed read-only for the duration of a run.
pub struct Scheduler {
    runs: DashMap<NodeId, NodeRun>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    max_parallel: Arc<Semaphore>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub success: bool,
    pub failed_nodes: Vec<NodeId>,
    pub cancelled_nodes: Vec<NodeId>,
}

impl Scheduler {
    pub fn new(max_parallel_nodes: usize) -> Self {
        Self {
            runs: DashMap::new(),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            max_parallel: Arc::new(Semaphore::new(max_parallel_nodes.max(1))),
        }
    }

    pub fn node_run(&self, id: NodeId) -> NodeRun {
        self.runs.get(&id).map(|r| r.clone()).unwrap_or_default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn set_status(&self, id: NodeId, status: NodeRunStatus) {
        let mut entry = self.runs.entry(id).or_default();
        entry.status = status;
        match status {
            NodeRunStatus::Running => entry.started_at = Some(crate::types::now_ms()),
            s if s.is_terminal() => entry.finished_at = Some(crate::types::now_ms()),
            _ => {}
        }
    }

    /// Runs the graph to completion against `targets` (default: all
    /// terminal nodes). Per §4.7 "Ordering and concurrency": nodes whose
    /// predecessors are all `Success` are eligible together, and the
    /// scheduler runs up to `max_parallel_nodes` of them concurrently —
    /// sibling independence is the only ordering guarantee. Ready nodes are
    /// dispatched into a `FuturesUnordered` pool as soon as they're
    /// unblocked rather than one at a time in topological order; the
    /// `max_parallel` semaphore, acquired inside each dispatched future,
    /// bounds how many actually execute at once.
    pub async fn run(
        &self,
        graph: &Graph,
        cache: &Cache,
        executor: &dyn Executor,
        targets: &HashSet<NodeId>,
        mode: ExecutionMode,
    ) -> Result<RunOutcome, FlowError> {
        let order = graph.topological_order()?;
        let required = required_ancestry(graph, targets);

        let mut fingerprints: HashMap<NodeId, Fingerprint> = HashMap::new();
        let mut remaining: HashMap<NodeId, usize> = HashMap::new();
        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for &id in &order {
            if !required.contains(&id) {
                continue;
            }
            let node = graph.get_node(id).ok_or(FlowError::NodeNotFound(id))?;
            let preds: Vec<(NodeId, Fingerprint)> = graph
                .predecessors(id)
                .into_iter()
                .filter(|(_, n)| required.contains(&n.node_id))
                .filter_map(|(_, n)| fingerprints.get(&n.node_id).cloned().map(|fp| (n.node_id, fp)))
                .collect();
            let pred_fps: Vec<Fingerprint> = preds.iter().map(|(_, fp)| fp.clone()).collect();
            let fp = fingerprint::compute(&node.settings, &pred_fps, &SourceMetadata::None);
            fingerprints.insert(id, fp.clone());
            self.runs.entry(id).or_default().fingerprint = Some(fp);
            self.set_status(id, NodeRunStatus::Pending);

            remaining.insert(id, preds.len());
            for (pred_id, _) in preds {
                dependents.entry(pred_id).or_default().push(id);
            }
        }

        let mut failed = Vec::new();
        let mut cancelled_nodes = Vec::new();
        let mut skipped: HashSet<NodeId> = HashSet::new();

        let mut ready: VecDeque<NodeId> = order
            .iter()
            .copied()
            .filter(|id| required.contains(id) && remaining.get(id).copied().unwrap_or(0) == 0)
            .collect();

        // (fingerprint, materialize) for each node currently executing, kept
        // outside the future so the post-await match can reuse them.
        let mut pending_meta: HashMap<NodeId, (Option<Fingerprint>, bool)> = HashMap::new();
        let mut in_flight: FuturesUnordered<BoxFuture<'_, (NodeId, Result<ActualResult, FlowError>)>> =
            FuturesUnordered::new();

        loop {
            while let Some(id) = ready.pop_front() {
                if self.is_cancelled() {
                    self.set_status(id, NodeRunStatus::Cancelled);
                    cancelled_nodes.push(id);
                    advance_dependents(id, &dependents, &mut remaining, &mut ready);
                    continue;
                }

                let blocked_by_failure = graph.predecessors(id).into_iter().any(|(_, n)| {
                    let status = self.node_run(n.node_id).status;
                    status == NodeRunStatus::Failed || status == NodeRunStatus::Cancelled || skipped.contains(&n.node_id)
                });
                if blocked_by_failure {
                    self.set_status(id, NodeRunStatus::Skipped);
                    skipped.insert(id);
                    advance_dependents(id, &dependents, &mut remaining, &mut ready);
                    continue;
                }

                let fp = fingerprints.get(&id).cloned();
                let materialize = matches!(mode, ExecutionMode::Development)
                    || graph.get_node(id).map(|n| n.cache_results).unwrap_or(false)
                    || graph.terminal_nodes().contains(&id);

                if let Some(fp) = &fp {
                    if let Some(entry) = cache.lookup(fp) {
                        debug!(node_id = id, fingerprint = %fp, "cache hit");
                        self.set_status(id, NodeRunStatus::Success);
                        self.runs.entry(id).or_default().row_count = Some(entry.row_count);
                        advance_dependents(id, &dependents, &mut remaining, &mut ready);
                        continue;
                    }
                }

                self.set_status(id, NodeRunStatus::Running);
                info!(node_id = id, "dispatching node");

                let plan = {
                    let mut builder = PlanBuilder::new(graph, cache, &fingerprints);
                    builder.plan_of(id)?
                };

                pending_meta.insert(id, (fp, materialize));
                let max_parallel = self.max_parallel.clone();
                let fut: BoxFuture<'_, (NodeId, Result<ActualResult, FlowError>)> = Box::pin(async move {
                    let _permit = max_parallel.acquire().await;
                    let result = executor.execute(id, plan).await;
                    (id, result)
                });
                in_flight.push(fut);
            }

            let Some((id, result)) = in_flight.next().await else {
                break;
            };
            let (fp, materialize) = pending_meta.remove(&id).unwrap_or((None, false));

            match result {
                Ok(actual) => {
                    let node = graph.get_node(id).ok_or(FlowError::NodeNotFound(id))?;
                    let validated: Result<ActualResult, FlowError> = match &node.output_field_config {
                        Some(cfg) if cfg.enabled => output_validator::validate(cfg, &actual),
                        _ => Ok(actual),
                    };

                    match validated {
                        Ok(actual) => {
                            let columns: Vec<String> = actual.schema.names().into_iter().map(String::from).collect();
                            if materialize {
                                if let Some(fp) = &fp {
                                    let row_count = actual.row_count;
                                    let schema_for_cache = actual.schema.clone();
                                    let payload_rows = actual.rows.clone();
                                    let _ = cache
                                        .insert(fp, || async move {
                                            Ok((schema_for_cache, row_count, format!("mem://{}", id), row_count.max(1) * 64, payload_rows))
                                        })
                                        .await;
                                }
                            }
                            self.set_status(id, NodeRunStatus::Success);
                            let mut entry = self.runs.entry(id).or_default();
                            entry.row_count = Some(actual.row_count);
                            entry.sample = Some((columns, actual.sample.clone()));
                        }
                        Err(e) => {
                            self.mark_failed(id, &e);
                            failed.push(id);
                        }
                    }
                }
                Err(e) => {
                    warn!(node_id = id, error = %e, "node execution failed");
                    self.mark_failed(id, &e);
                    failed.push(id);
                }
            }

            advance_dependents(id, &dependents, &mut remaining, &mut ready);
        }

        let success = failed.is_empty() && cancelled_nodes.is_empty();
        Ok(RunOutcome { success, failed_nodes: failed, cancelled_nodes })
    }

    fn mark_failed(&self, id: NodeId, error: &FlowError) {
        self.set_status(id, NodeRunStatus::Failed);
        let mut entry = self.runs.entry(id).or_default();
        entry.error_kind = Some(error.kind());
        entry.error_message = Some(error.message());
    }
}

/// Decrements `remaining[dependent]` for every required successor of `id`
/// and enqueues any that just reached zero — the fan-in half of dispatch.
fn advance_dependents(
    id: NodeId,
    dependents: &HashMap<NodeId, Vec<NodeId>>,
    remaining: &mut HashMap<NodeId, usize>,
    ready: &mut VecDeque<NodeId>,
) {
    let Some(dependent_ids) = dependents.get(&id) else { return };
    for &dep in dependent_ids {
        if let Some(count) = remaining.get_mut(&dep) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ready.push_back(dep);
            }
        }
    }
}

/// `{n} ∪ descendants(n) ∩ required_targets` style set used both for
/// partial reruns (§4.7, §8 property 6) and to scope which nodes this run
/// even computes fingerprints for.
fn required_ancestry(graph: &Graph, targets: &HashSet<NodeId>) -> HashSet<NodeId> {
    let mut required = HashSet::new();
    let mut stack: Vec<NodeId> = targets.iter().copied().collect();
    while let Some(id) = stack.pop() {
        if required.insert(id) {
            for (_, pred) in graph.predecessors(id) {
                stack.push(pred.node_id);
            }
        }
    }
    required
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::catalog::NodeSettings;
    use crate::graph::{Edge, Graph, Node, Port, Position};
    use crate::types::{Column, DataType};

    fn linear_graph() -> Graph {
        let mut g = Graph::new(1, "t");
        g.add_node(Node {
            node_id: 1,
            settings: NodeSettings::Read { path: "a.csv".into(), format: "csv".into(), columns: vec![Column::new("id", DataType::Int64, false)], etag: None },
            position: Position::default(),
            cache_results: false,
            description: String::new(),
            output_field_config: None,
        })
        .unwrap();
        g.add_node(Node {
            node_id: 2,
            settings: NodeSettings::Filter { predicate: "id > 0".into() },
            position: Position::default(),
            cache_results: false,
            description: String::new(),
            output_field_config: None,
        })
        .unwrap();
        g.add_edge(Edge { source_node: 1, source_port: Port::Main, target_node: 2, target_port: Port::Main }).unwrap();
        g
    }

    #[tokio::test]
    async fn linear_run_succeeds_end_to_end() {
        let g = linear_graph();
        let cache = Cache::new(1024 * 1024);
        let scheduler = Scheduler::new(4);
        let executor = LocalExecutor;
        let targets: HashSet<NodeId> = [2].into_iter().collect();
        let outcome = scheduler.run(&g, &cache, &executor, &targets, ExecutionMode::Development).await.unwrap();
        assert!(outcome.success);
        assert_eq!(scheduler.node_run(1).status, NodeRunStatus::Success);
        assert_eq!(scheduler.node_run(2).status, NodeRunStatus::Success);
    }

    #[tokio::test]
    async fn cancelling_before_start_marks_targets_cancelled() {
        let g = linear_graph();
        let cache = Cache::new(1024 * 1024);
        let scheduler = Scheduler::new(4);
        scheduler.cancel();
        let executor = LocalExecutor;
        let targets: HashSet<NodeId> = [2].into_iter().collect();
        let outcome = scheduler.run(&g, &cache, &executor, &targets, ExecutionMode::Development).await.unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn second_run_with_no_mutation_hits_cache() {
        let g = linear_graph();
        let cache = Cache::new(1024 * 1024);
        let executor = LocalExecutor;
        let targets: HashSet<NodeId> = [2].into_iter().collect();

        let scheduler_a = Scheduler::new(4);
        scheduler_a.run(&g, &cache, &executor, &targets, ExecutionMode::Development).await.unwrap();

        let scheduler_b = Scheduler::new(4);
        let outcome = scheduler_b.run(&g, &cache, &executor, &targets, ExecutionMode::Development).await.unwrap();
        assert!(outcome.success);
        assert_eq!(scheduler_b.node_run(1).status, NodeRunStatus::Success);
    }

    /// Read(1) fans out to two independent Filters (2, 3), which fan back
    /// into a Union (4) — both siblings must be dispatched together rather
    /// than one waiting on the other, and the merge only becomes ready once
    /// both have reported `Success`.
    fn diamond_graph() -> Graph {
        let mut g = Graph::new(1, "t");
        g.add_node(Node {
            node_id: 1,
            settings: NodeSettings::Read { path: "a.csv".into(), format: "csv".into(), columns: vec![Column::new("id", DataType::Int64, false)], etag: None },
            position: Position::default(),
            cache_results: false,
            description: String::new(),
            output_field_config: None,
        })
        .unwrap();
        g.add_node(Node {
            node_id: 2,
            settings: NodeSettings::Filter { predicate: "id > 0".into() },
            position: Position::default(),
            cache_results: false,
            description: String::new(),
            output_field_config: None,
        })
        .unwrap();
        g.add_node(Node {
            node_id: 3,
            settings: NodeSettings::Filter { predicate: "id < 1000".into() },
            position: Position::default(),
            cache_results: false,
            description: String::new(),
            output_field_config: None,
        })
        .unwrap();
        g.add_node(Node {
            node_id: 4,
            settings: NodeSettings::Union { diagonal_relaxed: true },
            position: Position::default(),
            cache_results: false,
            description: String::new(),
            output_field_config: None,
        })
        .unwrap();
        g.add_edge(Edge { source_node: 1, source_port: Port::Main, target_node: 2, target_port: Port::Main }).unwrap();
        g.add_edge(Edge { source_node: 1, source_port: Port::Main, target_node: 3, target_port: Port::Main }).unwrap();
        g.add_edge(Edge { source_node: 2, source_port: Port::Main, target_node: 4, target_port: Port::Union(0) }).unwrap();
        g.add_edge(Edge { source_node: 3, source_port: Port::Main, target_node: 4, target_port: Port::Union(1) }).unwrap();
        g
    }

    #[tokio::test]
    async fn diamond_graph_runs_independent_siblings_and_merges() {
        let g = diamond_graph();
        let cache = Cache::new(1024 * 1024);
        let scheduler = Scheduler::new(4);
        let executor = LocalExecutor;
        let targets: HashSet<NodeId> = [4].into_iter().collect();
        let outcome = scheduler.run(&g, &cache, &executor, &targets, ExecutionMode::Development).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.failed_nodes.is_empty());
        for id in [1, 2, 3, 4] {
            assert_eq!(scheduler.node_run(id).status, NodeRunStatus::Success);
        }
    }

    #[tokio::test]
    async fn diamond_graph_bounds_concurrency_to_max_parallel() {
        let g = diamond_graph();
        let cache = Cache::new(1024 * 1024);
        // Siblings 2 and 3 are both ready at once; a pool of 1 must still
        // run them to completion serially instead of deadlocking.
        let scheduler = Scheduler::new(1);
        let executor = LocalExecutor;
        let targets: HashSet<NodeId> = [4].into_iter().collect();
        let outcome = scheduler.run(&g, &cache, &executor, &targets, ExecutionMode::Development).await.unwrap();
        assert!(outcome.success);
        assert_eq!(scheduler.node_run(4).status, NodeRunStatus::Success);
    }
}
