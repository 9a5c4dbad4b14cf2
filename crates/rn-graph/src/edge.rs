//! Edges between graph nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How an edge is realized in hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Fixed wire in the fabric.
    Static,
    /// Routed through stream endpoints at connect time.
    #[default]
    Dynamic,
    /// Device block to host receive streamer.
    RxStream,
    /// Host transmit streamer to device block.
    TxStream,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    pub src_blockid: String,
    pub src_port: usize,
    pub dst_blockid: String,
    pub dst_port: usize,
    pub edge: EdgeKind,
    /// Forward edges carry properties during the forward sweep and take part
    /// in topological ordering; back edges only in the backward sweep.
    pub property_propagation_active: bool,
}

impl GraphEdge {
    pub fn new(
        src_blockid: impl Into<String>,
        src_port: usize,
        dst_blockid: impl Into<String>,
        dst_port: usize,
        edge: EdgeKind,
    ) -> Self {
        Self {
            src_blockid: src_blockid.into(),
            src_port,
            dst_blockid: dst_blockid.into(),
            dst_port,
            edge,
            property_propagation_active: true,
        }
    }

    /// Same edge, excluded from topological ordering.
    pub fn into_back_edge(mut self) -> Self {
        self.property_propagation_active = false;
        self
    }

    pub fn is_back_edge(&self) -> bool {
        !self.property_propagation_active
    }

    /// Same endpoints, ignoring the edge attributes.
    pub fn same_ports(&self, other: &GraphEdge) -> bool {
        self.src_blockid == other.src_blockid
            && self.src_port == other.src_port
            && self.dst_blockid == other.dst_blockid
            && self.dst_port == other.dst_port
    }
}

impl fmt::Display for GraphEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-->{}:{}",
            self.src_blockid, self.src_port, self.dst_blockid, self.dst_port
        )
    }
}
