use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::events::{RuntimeEvent, Seq};
use crate::graph::NodeId;
use crate::scheduler::NodeRun;
use crate::store::RunStore;
use crate::types::Value;

struct Inner {
    node_runs: HashMap<(Uuid, NodeId), NodeRun>,
    run_targets: HashMap<Uuid, (u64, Vec<NodeId>)>,
    run_success: HashMap<Uuid, bool>,
    events: HashMap<Uuid, Vec<(Seq, RuntimeEvent)>>,
    event_seq: HashMap<Uuid, Seq>,
    samples: HashMap<(Uuid, NodeId), (Vec<String>, Vec<Vec<Value>>)>,
}

/// In-memory implementation of `RunStore`, used as the default backend for
/// both the CLI `--once` mode and tests.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                node_runs: HashMap::new(),
                run_targets: HashMap::new(),
                run_success: HashMap::new(),
                events: HashMap::new(),
                event_seq: HashMap::new(),
                samples: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run_id: Uuid, graph_id: u64, targets: &[NodeId]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.run_targets.insert(run_id, (graph_id, targets.to_vec()));
        Ok(())
    }

    async fn finish_run(&self, run_id: Uuid, success: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.run_success.insert(run_id, success);
        Ok(())
    }

    async fn save_node_run(&self, run_id: Uuid, node_id: NodeId, run: &NodeRun) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.node_runs.insert((run_id, node_id), run.clone());
        Ok(())
    }

    async fn load_node_run(&self, run_id: Uuid, node_id: NodeId) -> Result<Option<NodeRun>> {
        let inner = self.inner.read().await;
        Ok(inner.node_runs.get(&(run_id, node_id)).cloned())
    }

    async fn load_all_node_runs(&self, run_id: Uuid) -> Result<Vec<(NodeId, NodeRun)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .node_runs
            .iter()
            .filter(|((r, _), _)| *r == run_id)
            .map(|((_, n), run)| (*n, run.clone()))
            .collect())
    }

    async fn append_event(&self, run_id: Uuid, event: &RuntimeEvent) -> Result<Seq> {
        let mut inner = self.inner.write().await;
        let seq = inner.event_seq.entry(run_id).or_insert(0);
        *seq += 1;
        let seq = *seq;
        inner.events.entry(run_id).or_default().push((seq, event.clone()));
        Ok(seq)
    }

    async fn read_events(&self, run_id: Uuid, since: Seq) -> Result<Vec<(Seq, RuntimeEvent)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .get(&run_id)
            .map(|events| events.iter().filter(|(seq, _)| *seq > since).cloned().collect())
            .unwrap_or_default())
    }

    async fn save_sample(&self, run_id: Uuid, node_id: NodeId, columns: &[String], rows: &[Vec<Value>]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.samples.insert((run_id, node_id), (columns.to_vec(), rows.to_vec()));
        Ok(())
    }

    async fn load_sample(&self, run_id: Uuid, node_id: NodeId) -> Result<Option<(Vec<String>, Vec<Vec<Value>>)>> {
        let inner = self.inner.read().await;
        Ok(inner.samples.get(&(run_id, node_id)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::NodeRunStatus;

    fn run_id() -> Uuid {
        Uuid::from_u128(1)
    }

    #[tokio::test]
    async fn test_node_run_round_trip() {
        let store = MemoryStore::new();
        let run = NodeRun { status: NodeRunStatus::Success, ..Default::default() };
        store.save_node_run(run_id(), 1, &run).await.unwrap();
        let loaded = store.load_node_run(run_id(), 1).await.unwrap().unwrap();
        assert_eq!(loaded.status, NodeRunStatus::Success);
    }

    #[tokio::test]
    async fn test_event_log_is_append_only_and_ordered() {
        let store = MemoryStore::new();
        let event = RuntimeEvent::RunStarted { run_id: run_id(), graph_id: 1, targets: vec![1], at: 0 };
        let seq1 = store.append_event(run_id(), &event).await.unwrap();
        let seq2 = store.append_event(run_id(), &event).await.unwrap();
        assert_eq!((seq1, seq2), (1, 2));

        let events = store.read_events(run_id(), 0).await.unwrap();
        assert_eq!(events.len(), 2);
        let tail = store.read_events(run_id(), 1).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn test_sample_round_trip() {
        let store = MemoryStore::new();
        store.save_sample(run_id(), 1, &["id".to_string()], &[vec![Value::I64(1)]]).await.unwrap();
        let (columns, rows) = store.load_sample(run_id(), 1).await.unwrap().unwrap();
        assert_eq!(columns, vec!["id".to_string()]);
        assert_eq!(rows, vec![vec![Value::I64(1)]]);
    }

    #[tokio::test]
    async fn test_run_targets_and_success() {
        let store = MemoryStore::new();
        store.create_run(run_id(), 7, &[1, 2]).await.unwrap();
        store.finish_run(run_id(), true).await.unwrap();
        let inner = store.inner.read().await;
        assert_eq!(inner.run_targets.get(&run_id()), Some(&(7, vec![1, 2])));
        assert_eq!(inner.run_success.get(&run_id()), Some(&true));
    }
}
