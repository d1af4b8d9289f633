//! Graph Store (C3): the in-memory DAG of nodes and typed edges, with a
//! versioned mutation API (§4.3).

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::catalog::{kind_descriptor, NodeSettings};
use crate::error::FlowError;

pub type NodeId = u64;

/// A named input or output slot on a node (§3, GLOSSARY). `Union(i)` is the
/// i-th arm of a union node's variadic input.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Port {
    Main,
    Right,
    Union(usize),
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Port::Main => write!(f, "main"),
            Port::Right => write!(f, "right"),
            Port::Union(i) => write!(f, "union[{i}]"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node instance (§3). `settings` is always fully materialized; defaults
/// are filled in by the caller before `add_node` (catalog validation runs
/// there, not as a side effect of graph mutation).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub settings: NodeSettings,
    pub position: Position,
    pub cache_results: bool,
    pub description: String,
    pub output_field_config: Option<crate::output_validator::OutputFieldConfig>,
}

/// `(source_node, source_port, target_node, target_port)` (§3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source_node: NodeId,
    pub source_port: Port,
    pub target_node: NodeId,
    pub target_port: Port,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Development,
    Performance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionLocation {
    Local,
    Remote,
}

/// `(execution_mode, execution_location, auto_save, modified_on, path)` (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowSettings {
    pub execution_mode: ExecutionMode,
    pub execution_location: ExecutionLocation,
    pub auto_save: bool,
    pub modified_on: crate::types::Timestamp,
    pub path: Option<String>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Development,
            execution_location: ExecutionLocation::Local,
            auto_save: false,
            modified_on: crate::types::now_ms(),
            path: None,
        }
    }
}

/// An in-memory DAG: nodes, directed typed edges, per-graph settings, and a
/// monotonic version counter (§4.3). All mutations go through `&mut self`;
/// the caller is responsible for the per-graph mutex described in §4.3 and
/// §5 — this type itself is not internally synchronized, matching the
/// teacher's separation between a plain IR graph and its lock-guarded store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Graph {
    pub graph_id: u64,
    pub name: String,
    pub description: String,
    nodes: BTreeMap<NodeId, Node>,
    edges: Vec<Edge>,
    pub flow_settings: FlowSettings,
    version: u64,
    #[serde(skip)]
    dirty_since: Option<NodeId>,
}

impl Graph {
    pub fn new(graph_id: u64, name: impl Into<String>) -> Self {
        Self {
            graph_id,
            name: name.into(),
            description: String::new(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            flow_settings: FlowSettings::default(),
            version: 0,
            dirty_since: None,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn list_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn list_edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn add_node(&mut self, node: Node) -> Result<(), FlowError> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(FlowError::GraphStructure(format!(
                "node {} already exists",
                node.node_id
            )));
        }
        self.nodes.insert(node.node_id, node);
        self.bump_version();
        Ok(())
    }

    /// Enforces acyclicity, endpoint existence, port arity, and the
    /// at-most-one-edge-per-non-union-port rule (§4.3).
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), FlowError> {
        let source = self
            .nodes
            .get(&edge.source_node)
            .ok_or(FlowError::NodeNotFound(edge.source_node))?;
        let target = self
            .nodes
            .get(&edge.target_node)
            .ok_or(FlowError::NodeNotFound(edge.target_node))?;

        let source_kind = kind_descriptor(source.settings.kind_id());
        if source_kind.outputs == 0 {
            return Err(FlowError::PortArity {
                node: edge.source_node,
                port: edge.source_port.to_string(),
            });
        }

        let target_kind = kind_descriptor(target.settings.kind_id());
        match &edge.target_port {
            Port::Union(_) => {
                if target_kind.max_inputs.is_some() {
                    return Err(FlowError::PortArity {
                        node: edge.target_node,
                        port: edge.target_port.to_string(),
                    });
                }
            }
            Port::Main | Port::Right => {
                let occupied = self
                    .edges
                    .iter()
                    .any(|e| e.target_node == edge.target_node && e.target_port == edge.target_port);
                if occupied {
                    return Err(FlowError::GraphStructure(format!(
                        "port {} on node {} already has an incoming edge",
                        edge.target_port, edge.target_node
                    )));
                }
            }
        }

        if self.edges.contains(&edge) {
            return Err(FlowError::GraphStructure("duplicate edge".into()));
        }

        self.edges.push(edge.clone());
        if self.has_cycle() {
            self.edges.pop();
            return Err(FlowError::WouldCycle);
        }

        self.bump_version();
        self.invalidate_from(edge.target_node);
        Ok(())
    }

    pub fn remove_node(&mut self, id: NodeId) -> Result<(), FlowError> {
        if self.nodes.remove(&id).is_none() {
            return Err(FlowError::NodeNotFound(id));
        }
        self.edges.retain(|e| e.source_node != id && e.target_node != id);
        self.bump_version();
        self.invalidate_from(id);
        Ok(())
    }

    pub fn remove_edge(&mut self, source: NodeId, source_port: &Port, target: NodeId, target_port: &Port) -> Result<(), FlowError> {
        let before = self.edges.len();
        self.edges.retain(|e| {
            !(e.source_node == source
                && &e.source_port == source_port
                && e.target_node == target
                && &e.target_port == target_port)
        });
        if self.edges.len() == before {
            return Err(FlowError::GraphStructure("edge not found".into()));
        }
        self.bump_version();
        self.invalidate_from(target);
        Ok(())
    }

    pub fn update_settings(&mut self, id: NodeId, settings: NodeSettings) -> Result<(), FlowError> {
        let node = self.nodes.get_mut(&id).ok_or(FlowError::NodeNotFound(id))?;
        node.settings = settings;
        self.bump_version();
        self.invalidate_from(id);
        Ok(())
    }

    pub fn update_node_position(&mut self, id: NodeId, position: Position) -> Result<(), FlowError> {
        let node = self.nodes.get_mut(&id).ok_or(FlowError::NodeNotFound(id))?;
        node.position = position;
        self.bump_version();
        Ok(())
    }

    pub fn update_cache_results(&mut self, id: NodeId, cache_results: bool) -> Result<(), FlowError> {
        let node = self.nodes.get_mut(&id).ok_or(FlowError::NodeNotFound(id))?;
        node.cache_results = cache_results;
        self.bump_version();
        Ok(())
    }

    pub fn update_output_field_config(
        &mut self,
        id: NodeId,
        config: Option<crate::output_validator::OutputFieldConfig>,
    ) -> Result<(), FlowError> {
        let node = self.nodes.get_mut(&id).ok_or(FlowError::NodeNotFound(id))?;
        node.output_field_config = config;
        self.bump_version();
        self.invalidate_from(id);
        Ok(())
    }

    /// Nodes with no incoming edges (§3 `start_nodes`).
    pub fn start_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| !self.edges.iter().any(|e| e.target_node == *id))
            .collect()
    }

    /// Nodes with no outgoing edges — the default run targets (§4.7).
    pub fn terminal_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| !self.edges.iter().any(|e| e.source_node == *id))
            .collect()
    }

    pub fn predecessors(&self, id: NodeId) -> Vec<(&Edge, &Node)> {
        self.edges
            .iter()
            .filter(|e| e.target_node == id)
            .filter_map(|e| self.nodes.get(&e.source_node).map(|n| (e, n)))
            .collect()
    }

    pub fn descendants(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for edge in self.edges.iter().filter(|e| e.source_node == current) {
                if out.insert(edge.target_node) {
                    stack.push(edge.target_node);
                }
            }
        }
        out
    }

    /// Every mutation record invalidates the downstream subtree of the
    /// mutated node (§4.3, §3 Lifecycle): C4/C7 observe this via
    /// `version()` and recompute, so this only needs to bump the version —
    /// callers key their memoization off `(node_id, version)`.
    fn invalidate_from(&mut self, id: NodeId) {
        self.dirty_since = Some(id);
    }

    /// The node (if any) whose mutation most recently triggered an
    /// invalidation, consumed by callers that want to scope a partial rerun
    /// instead of recomputing from `dirty_since = None` onward.
    pub fn take_dirty_root(&mut self) -> Option<NodeId> {
        self.dirty_since.take()
    }

    fn to_petgraph(&self) -> (DiGraph<NodeId, ()>, BTreeMap<NodeId, NodeIndex>) {
        let mut g = DiGraph::new();
        let mut index_of = BTreeMap::new();
        for id in self.nodes.keys() {
            index_of.insert(*id, g.add_node(*id));
        }
        for edge in &self.edges {
            if let (Some(&a), Some(&b)) = (index_of.get(&edge.source_node), index_of.get(&edge.target_node)) {
                g.add_edge(a, b, ());
            }
        }
        (g, index_of)
    }

    fn has_cycle(&self) -> bool {
        let (g, _) = self.to_petgraph();
        petgraph::algo::is_cyclic_directed(&g)
    }

    /// Topological order of node ids (§4.3). Recomputed on demand rather than
    /// maintained incrementally, per the design-note acceptance that
    /// recomputation is fine at visual-graph scale (§9).
    pub fn topological_order(&self) -> Result<Vec<NodeId>, FlowError> {
        let (g, _) = self.to_petgraph();
        petgraph::algo::toposort(&g, None)
            .map(|order| order.into_iter().map(|idx| g[idx]).collect())
            .map_err(|_| FlowError::WouldCycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NodeSettings;
    use crate::types::{Column, DataType};

    fn read_node(id: NodeId) -> Node {
        Node {
            node_id: id,
            settings: NodeSettings::Read {
                path: "a.csv".into(),
                format: "csv".into(),
                columns: vec![Column::new("id", DataType::Int64, false)],
                etag: None,
            },
            position: Position::default(),
            cache_results: false,
            description: String::new(),
            output_field_config: None,
        }
    }

    fn filter_node(id: NodeId) -> Node {
        Node {
            node_id: id,
            settings: NodeSettings::Filter { predicate: "id > 0".into() },
            position: Position::default(),
            cache_results: false,
            description: String::new(),
            output_field_config: None,
        }
    }

    #[test]
    fn rejects_cycles() {
        let mut g = Graph::new(1, "t");
        g.add_node(read_node(1)).unwrap();
        g.add_node(filter_node(2)).unwrap();
        g.add_edge(Edge {
            source_node: 1,
            source_port: Port::Main,
            target_node: 2,
            target_port: Port::Main,
        })
        .unwrap();
        let err = g
            .add_edge(Edge {
                source_node: 2,
                source_port: Port::Main,
                target_node: 1,
                target_port: Port::Main,
            })
            .unwrap_err();
        assert!(matches!(err, FlowError::WouldCycle));
    }

    #[test]
    fn rejects_second_edge_into_main_port() {
        let mut g = Graph::new(1, "t");
        g.add_node(read_node(1)).unwrap();
        g.add_node(read_node(2)).unwrap();
        g.add_node(filter_node(3)).unwrap();
        g.add_edge(Edge { source_node: 1, source_port: Port::Main, target_node: 3, target_port: Port::Main }).unwrap();
        let err = g
            .add_edge(Edge { source_node: 2, source_port: Port::Main, target_node: 3, target_port: Port::Main })
            .unwrap_err();
        assert!(matches!(err, FlowError::GraphStructure(_)));
    }

    #[test]
    fn remove_node_cascades_edges() {
        let mut g = Graph::new(1, "t");
        g.add_node(read_node(1)).unwrap();
        g.add_node(filter_node(2)).unwrap();
        g.add_edge(Edge { source_node: 1, source_port: Port::Main, target_node: 2, target_port: Port::Main }).unwrap();
        g.remove_node(1).unwrap();
        assert!(g.list_edges().is_empty());
    }

    #[test]
    fn topological_order_respects_edges() {
        let mut g = Graph::new(1, "t");
        g.add_node(read_node(1)).unwrap();
        g.add_node(filter_node(2)).unwrap();
        g.add_edge(Edge { source_node: 1, source_port: Port::Main, target_node: 2, target_port: Port::Main }).unwrap();
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn start_and_terminal_nodes() {
        let mut g = Graph::new(1, "t");
        g.add_node(read_node(1)).unwrap();
        g.add_node(filter_node(2)).unwrap();
        g.add_edge(Edge { source_node: 1, source_port: Port::Main, target_node: 2, target_port: Port::Main }).unwrap();
        assert_eq!(g.start_nodes(), BTreeSet::from([1]));
        assert_eq!(g.terminal_nodes(), BTreeSet::from([2]));
    }
}
