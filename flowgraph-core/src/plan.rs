//! Plan Builder (C5): composes a lazy query for a node by feeding
//! predecessors' lazy plans into the node's `build_plan` factory (§4.5).

use std::collections::HashMap;

use crate::cache::Cache;
use crate::catalog::NodeKindId;
use crate::error::FlowError;
use crate::fingerprint::Fingerprint;
use crate::graph::{Graph, NodeId, Port};
use crate::lazy::{self, Frame, Plan};

/// Walks predecessors recursively, building their plans first, then invokes
/// the node's `build_plan`. Does not execute anything — `Plan::execute` is
/// the only thing that touches data (§4.5).
///
/// If an ancestor has a valid [`crate::cache::CacheEntry`] for its current
/// fingerprint, the builder substitutes `Plan::ScanFromCache` for that
/// subtree, pruning redundant recomputation — the builder never recurses
/// past a cache hit.
pub struct PlanBuilder<'a> {
    graph: &'a Graph,
    cache: &'a Cache,
    fingerprints: &'a HashMap<NodeId, Fingerprint>,
    memo: HashMap<NodeId, Plan>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(graph: &'a Graph, cache: &'a Cache, fingerprints: &'a HashMap<NodeId, Fingerprint>) -> Self {
        Self { graph, cache, fingerprints, memo: HashMap::new() }
    }

    pub fn plan_of(&mut self, node_id: NodeId) -> Result<Plan, FlowError> {
        if let Some(plan) = self.memo.get(&node_id) {
            return Ok(plan.clone());
        }

        if let Some(fp) = self.fingerprints.get(&node_id) {
            if let Some(entry) = self.cache.lookup(fp) {
                let rows = self.cache.payload(fp).unwrap_or_default();
                let plan = Plan::ScanFromCache(Box::new(Frame { schema: entry.schema.clone(), rows }));
                self.memo.insert(node_id, plan.clone());
                return Ok(plan);
            }
        }

        let node = self.graph.get_node(node_id).ok_or(FlowError::NodeNotFound(node_id))?;

        let mut ordered_preds: Vec<(&Port, NodeId)> = self
            .graph
            .predecessors(node_id)
            .into_iter()
            .map(|(edge, pred_node)| (&edge.target_port, pred_node.node_id))
            .collect();
        ordered_preds.sort_by(|a, b| a.0.cmp(b.0));

        let mut input_plans = Vec::with_capacity(ordered_preds.len());
        for (_, pred_id) in ordered_preds {
            input_plans.push(self.plan_of(pred_id)?);
        }

        if matches!(node.settings.kind_id(), NodeKindId::Read) && input_plans.is_empty() {
            input_plans.push(Plan::Source(Box::new(Frame::default())));
            input_plans.clear();
        }

        let plan = lazy::build_plan(&node.settings, input_plans);
        self.memo.insert(node_id, plan.clone());
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::catalog::NodeSettings;
    use crate::graph::{Edge, Node, Position};
    use crate::types::{Column, DataType};

    fn graph_with_filter() -> Graph {
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

    #[test]
    fn builds_plan_recursively_through_predecessors() {
        let g = graph_with_filter();
        let cache = Cache::new(1024 * 1024);
        let fps = HashMap::new();
        let mut builder = PlanBuilder::new(&g, &cache, &fps);
        let plan = builder.plan_of(2).unwrap();
        assert!(matches!(plan, Plan::Filter { .. }));
    }
}
