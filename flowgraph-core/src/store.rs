use anyhow::Result;
use async_trait::async_trait;

use crate::events::{RuntimeEvent, Seq};
use crate::graph::NodeId;
use crate::scheduler::NodeRun;

/// Persistence trait for run state and the observation event log.
///
/// Pluggable backend behind an async trait, exactly the teacher's
/// `ProcessStore` shape: the Scheduler and the Observation Surface operate
/// exclusively through this trait, so an in-memory backend (this crate's
/// default) and a durable backend are interchangeable.
#[async_trait]
pub trait RunStore: Send + Sync {
    // ── Run registry ──

    async fn create_run(&self, run_id: uuid::Uuid, graph_id: u64, targets: &[NodeId]) -> Result<()>;
    async fn finish_run(&self, run_id: uuid::Uuid, success: bool) -> Result<()>;

    // ── NodeRun state ──

    async fn save_node_run(&self, run_id: uuid::Uuid, node_id: NodeId, run: &NodeRun) -> Result<()>;
    async fn load_node_run(&self, run_id: uuid::Uuid, node_id: NodeId) -> Result<Option<NodeRun>>;
    async fn load_all_node_runs(&self, run_id: uuid::Uuid) -> Result<Vec<(NodeId, NodeRun)>>;

    // ── Event log (append-only) ──

    /// Appends an event and returns its sequence number (§4.11).
    async fn append_event(&self, run_id: uuid::Uuid, event: &RuntimeEvent) -> Result<Seq>;
    async fn read_events(&self, run_id: uuid::Uuid, since: Seq) -> Result<Vec<(Seq, RuntimeEvent)>>;

    // ── Sample storage (per-node last successful sample) ──

    async fn save_sample(&self, run_id: uuid::Uuid, node_id: NodeId, columns: &[String], rows: &[Vec<crate::types::Value>]) -> Result<()>;
    async fn load_sample(&self, run_id: uuid::Uuid, node_id: NodeId) -> Result<Option<(Vec<String>, Vec<Vec<crate::types::Value>>)>>;
}
