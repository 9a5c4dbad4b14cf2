//! Static fabric wiring of a device: which block ports connect directly to
//! other block ports or to stream endpoints.

use std::fmt;

use rn_core::{BlockId, SepAddr};
use serde::{Deserialize, Serialize};

use crate::error::GraphResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FabricPort {
    Block { id: BlockId, port: usize },
    Sep { addr: SepAddr, port: usize },
}

impl FabricPort {
    pub fn block(id: BlockId, port: usize) -> Self {
        Self::Block { id, port }
    }

    pub fn sep(addr: SepAddr, port: usize) -> Self {
        Self::Sep { addr, port }
    }

    pub fn sep_addr(&self) -> Option<SepAddr> {
        match self {
            Self::Sep { addr, .. } => Some(*addr),
            Self::Block { .. } => None,
        }
    }
}

impl fmt::Display for FabricPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block { id, port } => write!(f, "{id}:{port}"),
            Self::Sep { addr, port } => write!(f, "SEP{addr}:{port}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticLink {
    pub src: FabricPort,
    pub dst: FabricPort,
}

/// The device adjacency list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTopology {
    pub links: Vec<StaticLink>,
}

impl DeviceTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link(mut self, src: FabricPort, dst: FabricPort) -> Self {
        self.links.push(StaticLink { src, dst });
        self
    }

    pub fn from_json(content: &str) -> GraphResult<Self> {
        serde_json::from_str(content).map_err(|e| {
            rn_core::RnError::value(format!("malformed device topology: {e}")).into()
        })
    }

    pub fn to_json(&self) -> GraphResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| rn_core::RnError::runtime(format!("cannot serialize topology: {e}")).into())
    }

    /// Where `src` is wired to.
    pub fn downstream_of(&self, src: &FabricPort) -> Option<&FabricPort> {
        self.links.iter().find(|l| &l.src == src).map(|l| &l.dst)
    }

    /// What feeds `dst`.
    pub fn upstream_of(&self, dst: &FabricPort) -> Option<&FabricPort> {
        self.links.iter().find(|l| &l.dst == dst).map(|l| &l.src)
    }
}
