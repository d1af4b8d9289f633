//! Observation Surface (C11) event types: an append-only, monotonic event
//! log per run, polled via `/events?since=<seq>` (§4.11).

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::graph::NodeId;
use crate::scheduler::NodeRunStatus;
use crate::types::Timestamp;

pub type RunId = uuid::Uuid;
pub type Seq = u64;

/// Events are idempotent, keyed by `(run_id, seq)` (§4.11); delivery order
/// for a single node is monotonic in state, but sibling ordering is
/// unspecified (§5).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    RunStarted {
        run_id: RunId,
        graph_id: u64,
        targets: Vec<NodeId>,
        at: Timestamp,
    },
    NodeStateChanged {
        run_id: RunId,
        node_id: NodeId,
        status: NodeRunStatus,
        at: Timestamp,
    },
    SampleAvailable {
        run_id: RunId,
        node_id: NodeId,
        row_count: u64,
        at: Timestamp,
    },
    RunFinished {
        run_id: RunId,
        success: bool,
        failed_nodes: Vec<NodeId>,
        error_kind_counts: Vec<(ErrorKind, u64)>,
        at: Timestamp,
    },
}

/// An entry in the append-only log: `(seq, event)` (§4.11).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub seq: Seq,
    pub event: RuntimeEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_tag() {
        let event = RuntimeEvent::RunStarted {
            run_id: uuid::Uuid::nil(),
            graph_id: 1,
            targets: vec![1, 2],
            at: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"run_started\""));
    }
}
