//! On-disk DTOs for the YAML persistence format (§4.10). Kept separate from
//! the in-memory [`crate::graph::Graph`] so the wire format can evolve
//! independently (migration hooks operate on this layer).

use serde::{Deserialize, Serialize};

use crate::catalog::NodeSettings;
use crate::error::FlowError;
use crate::graph::{Edge, ExecutionLocation, ExecutionMode, FlowSettings, Graph, Node, Port, Position};
use crate::output_validator::OutputFieldConfig;

pub const CURRENT_VERSION: &str = "2.0";

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowSettingsDto {
    pub execution_mode: ExecutionMode,
    pub execution_location: ExecutionLocation,
    #[serde(default)]
    pub auto_save: bool,
    pub path: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PositionDto {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDto {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub position: PositionDto,
    #[serde(default = "default_true")]
    pub cache_results: bool,
    #[serde(default)]
    pub description: String,
    pub output_field_config: Option<OutputFieldConfig>,
    pub settings: NodeSettings,
}

fn port_to_string(port: &Port) -> String {
    port.to_string()
}

fn port_from_string(s: &str) -> Port {
    match s {
        "main" => Port::Main,
        "right" => Port::Right,
        other if other.starts_with("union[") && other.ends_with(']') => {
            other[6..other.len() - 1].parse().map(Port::Union).unwrap_or(Port::Main)
        }
        _ => Port::Main,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeDto {
    pub source: u64,
    pub source_port: String,
    pub target: u64,
    pub target_port: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphDto {
    pub version: String,
    pub flow_id: u64,
    pub flow_name: String,
    pub flow_settings: FlowSettingsDto,
    pub nodes: Vec<NodeDto>,
    pub edges: Vec<EdgeDto>,
}

impl GraphDto {
    pub fn from_graph(graph: &Graph) -> Self {
        let mut nodes: Vec<NodeDto> = graph
            .list_nodes()
            .map(|n| NodeDto {
                id: n.node_id,
                kind: format!("{:?}", n.settings.kind_id()).to_lowercase(),
                position: PositionDto { x: n.position.x.round(), y: n.position.y.round() },
                cache_results: n.cache_results,
                description: n.description.clone(),
                output_field_config: n.output_field_config.clone(),
                settings: n.settings.clone(),
            })
            .collect();
        nodes.sort_by_key(|n| n.id);

        let mut edges: Vec<EdgeDto> = graph
            .list_edges()
            .iter()
            .map(|e| EdgeDto {
                source: e.source_node,
                source_port: port_to_string(&e.source_port),
                target: e.target_node,
                target_port: port_to_string(&e.target_port),
            })
            .collect();
        edges.sort_by_key(|e| (e.source, e.target));

        GraphDto {
            version: CURRENT_VERSION.to_string(),
            flow_id: graph.graph_id,
            flow_name: graph.name.clone(),
            flow_settings: FlowSettingsDto {
                execution_mode: graph.flow_settings.execution_mode,
                execution_location: graph.flow_settings.execution_location,
                auto_save: graph.flow_settings.auto_save,
                path: graph.flow_settings.path.clone(),
                description: graph.description.clone(),
            },
            nodes,
            edges,
        }
    }

    pub fn into_graph(self) -> Result<Graph, FlowError> {
        let mut graph = Graph::new(self.flow_id, self.flow_name);
        graph.description = self.flow_settings.description.clone();
        graph.flow_settings = FlowSettings {
            execution_mode: self.flow_settings.execution_mode,
            execution_location: self.flow_settings.execution_location,
            auto_save: self.flow_settings.auto_save,
            modified_on: crate::types::now_ms(),
            path: self.flow_settings.path,
        };

        for node_dto in self.nodes {
            graph.add_node(Node {
                node_id: node_dto.id,
                settings: node_dto.settings,
                position: Position { x: node_dto.position.x, y: node_dto.position.y },
                cache_results: node_dto.cache_results,
                description: node_dto.description,
                output_field_config: node_dto.output_field_config,
            })?;
        }

        for edge_dto in self.edges {
            graph.add_edge(Edge {
                source_node: edge_dto.source,
                source_port: port_from_string(&edge_dto.source_port),
                target_node: edge_dto.target,
                target_port: port_from_string(&edge_dto.target_port),
            })?;
        }

        Ok(graph)
    }

    /// Canonical JSON used by the fingerprint layer's YAML-round-trip test
    /// and by any caller wanting a stable diff of two graph documents:
    /// nodes sorted by id, edges sorted by `(source, target)`, serialized
    /// with `to_string_pretty`.
    pub fn deterministic_json(&self) -> String {
        let mut clone = self.clone();
        clone.nodes.sort_by_key(|n| n.id);
        clone.edges.sort_by_key(|e| (e.source, e.target));
        serde_json::to_string_pretty(&clone).expect("GraphDto always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NodeSettings;
    use crate::graph::{Edge as GraphEdge, Node as GraphNode, Port};
    use crate::types::{Column, DataType};

    fn sample_graph() -> Graph {
        let mut g = Graph::new(7, "demo");
        g.add_node(GraphNode {
            node_id: 1,
            settings: NodeSettings::Read { path: "a.csv".into(), format: "csv".into(), columns: vec![Column::new("id", DataType::Int64, false)], etag: None },
            position: Position { x: 1.4, y: 2.6 },
            cache_results: true,
            description: String::new(),
            output_field_config: None,
        })
        .unwrap();
        g.add_node(GraphNode {
            node_id: 2,
            settings: NodeSettings::Filter { predicate: "id > 0".into() },
            position: Position::default(),
            cache_results: false,
            description: String::new(),
            output_field_config: None,
        })
        .unwrap();
        g.add_edge(GraphEdge { source_node: 1, source_port: Port::Main, target_node: 2, target_port: Port::Main }).unwrap();
        g
    }

    #[test]
    fn round_trips_through_dto() {
        let g = sample_graph();
        let dto = GraphDto::from_graph(&g);
        let back = dto.into_graph().unwrap();
        assert_eq!(back.list_nodes().count(), 2);
        assert_eq!(back.list_edges().len(), 1);
    }

    #[test]
    fn positions_round_to_integer_pixels() {
        let g = sample_graph();
        let dto = GraphDto::from_graph(&g);
        let node = dto.nodes.iter().find(|n| n.id == 1).unwrap();
        assert_eq!(node.position.x, 1.0);
        assert_eq!(node.position.y, 3.0);
    }

    #[test]
    fn deterministic_json_is_stable_under_shuffle() {
        let g = sample_graph();
        let mut dto = GraphDto::from_graph(&g);
        let a = dto.deterministic_json();
        dto.nodes.reverse();
        dto.edges.reverse();
        let b = dto.deterministic_json();
        assert_eq!(a, b);
    }
}
