//! Serializable view of a session for diagnostics.

use rn_core::{RnError, SepAddr, SepId};
use rn_props::{PropValue, ResSourceInfo};
use serde::{Deserialize, Serialize};

use crate::edge::GraphEdge;
use crate::error::GraphResult;
use crate::graph::{NodeArena, PropGraph};
use crate::session::ActiveConnection;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropSnapshot {
    pub id: String,
    pub src: ResSourceInfo,
    pub value: Option<PropValue>,
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub in_graph: bool,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub properties: Vec<PropSnapshot>,
}

impl NodeSnapshot {
    pub fn dirty(&self) -> impl Iterator<Item = &PropSnapshot> {
        self.properties.iter().filter(|p| p.dirty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpidEntry {
    pub addr: SepAddr,
    pub epid: SepId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub committed: bool,
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<GraphEdge>,
    pub connections: Vec<ActiveConnection>,
    pub epids: Vec<EpidEntry>,
}

impl GraphSnapshot {
    /// Capture `node_ids` from `arena` together with the graph's edges.
    /// IDs missing from the arena are skipped.
    pub fn capture<I>(
        graph: &PropGraph,
        arena: &dyn NodeArena,
        node_ids: I,
        connections: &[ActiveConnection],
        epids: Vec<(SepAddr, SepId)>,
    ) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let nodes = node_ids
            .into_iter()
            .filter_map(|id| {
                let core = arena.node(&id)?.core();
                let properties = core
                    .props()
                    .filter(|p| p.src().kind != rn_props::SourceKind::Framework)
                    .map(|p| PropSnapshot {
                        id: p.id().to_string(),
                        src: p.src(),
                        value: p.value().cloned(),
                        dirty: p.is_dirty(),
                    })
                    .collect();
                Some(NodeSnapshot {
                    in_graph: graph.contains(&id),
                    num_inputs: core.num_input_ports(),
                    num_outputs: core.num_output_ports(),
                    properties,
                    id,
                })
            })
            .collect();
        Self {
            committed: graph.is_committed(),
            nodes,
            edges: graph.enumerate_edges(),
            connections: connections.to_vec(),
            epids: epids
                .into_iter()
                .map(|(addr, epid)| EpidEntry { addr, epid })
                .collect(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn to_json(&self) -> GraphResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RnError::runtime(format!("cannot serialize graph snapshot: {e}")).into())
    }

    pub fn from_json(content: &str) -> GraphResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| RnError::value(format!("malformed graph snapshot: {e}")).into())
    }
}
