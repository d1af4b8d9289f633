//! Shared application state for the coordinator's HTTP surface, grounded on
//! the teacher's `BpmnLiteEngine` (one shared store + in-memory process
//! table) and `orca`'s `AppState` (a plain `Clone`-able struct of `Arc`
//! fields handed to every handler via `.with_state`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use flowgraph_core::cache::Cache;
use flowgraph_core::config::CoordinatorConfig;
use flowgraph_core::graph::{Graph, NodeId};
use flowgraph_core::persistence::yaml::Persistence;
use flowgraph_core::scheduler::{Executor, Scheduler};
use flowgraph_core::schema_propagator::SchemaPropagator;
use flowgraph_core::store::RunStore;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A run dispatched against a flow's current graph snapshot. Kept alive
/// after completion so `/status`, `/events` and `/cancel` keep working
/// until the next run replaces it.
pub struct CurrentRun {
    pub run_id: Uuid,
    pub scheduler: Arc<Scheduler>,
}

/// One entry per live flow graph. The graph is guarded by its own lock
/// rather than the whole table's, matching §4.3's "per-graph read/write
/// lock" — a run holds a read-equivalent snapshot (a clone) for its
/// duration rather than the write lock itself, so structural mutations on
/// unrelated nodes are never blocked by a run (§9 accepted simplification,
/// see DESIGN.md).
pub struct FlowEntry {
    pub graph: RwLock<Graph>,
    pub propagator: SchemaPropagator,
    pub current_run: RwLock<Option<CurrentRun>>,
    node_id_seq: AtomicU64,
}

impl FlowEntry {
    pub fn new(graph: Graph) -> Self {
        let next = graph.list_nodes().map(|n| n.node_id).max().unwrap_or(0) + 1;
        Self {
            graph: RwLock::new(graph),
            propagator: SchemaPropagator::new(),
            current_run: RwLock::new(None),
            node_id_seq: AtomicU64::new(next),
        }
    }

    pub fn alloc_node_id(&self) -> NodeId {
        self.node_id_seq.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct AppStateInner {
    pub config: CoordinatorConfig,
    pub flows: DashMap<u64, Arc<FlowEntry>>,
    pub cache: Arc<Cache>,
    pub store: Arc<dyn RunStore>,
    pub persistence: Arc<Persistence>,
    pub executor: Arc<dyn Executor>,
    next_graph_id: AtomicU64,
}

#[derive(Clone)]
pub struct AppState(pub Arc<AppStateInner>);

impl AppState {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn RunStore>, executor: Arc<dyn Executor>) -> Self {
        let cache_max_bytes = config.cache_max_bytes;
        Self(Arc::new(AppStateInner {
            config,
            flows: DashMap::new(),
            cache: Arc::new(Cache::new(cache_max_bytes)),
            store,
            persistence: Arc::new(Persistence::new()),
            executor,
            next_graph_id: AtomicU64::new(1),
        }))
    }

    pub fn alloc_graph_id(&self) -> u64 {
        self.0.next_graph_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert_flow(&self, graph: Graph) -> Arc<FlowEntry> {
        let id = graph.graph_id;
        let entry = Arc::new(FlowEntry::new(graph));
        self.0.flows.insert(id, entry.clone());
        entry
    }

    pub fn flow(&self, graph_id: u64) -> Option<Arc<FlowEntry>> {
        self.0.flows.get(&graph_id).map(|e| e.value().clone())
    }
}
