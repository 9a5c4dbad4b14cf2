//! Graph and session error types.

use rn_core::RnError;
use rn_props::PropError;

pub type GraphResult<T> = Result<T, GraphError>;

/// Errors from graph construction, resolution and action delivery.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error(transparent)]
    Prop(#[from] PropError),

    #[error(transparent)]
    Rn(#[from] RnError),

    #[error("Caught attempt to modify properties of edge {edge}")]
    EdgeModify { edge: String },

    #[error("Attempting to reconnect output port {node}:{port}")]
    OutputInUse { node: String, port: usize },

    #[error("Attempting to reconnect input port {node}:{port}")]
    InputInUse { node: String, port: usize },

    #[error(
        "Adding edge {edge} without disabling property_propagation_active will lead to \
         unresolvable graph"
    )]
    Cycle { edge: String },

    #[error("Node {node} is not known")]
    UnknownNode { node: String },

    #[error("Graph topology is not valid: {}", .details.join("; "))]
    Topology { details: Vec<String> },

    #[error("Could not resolve properties: {}", .dirty.join(", "))]
    Unresolved { dirty: Vec<String> },

    #[error(
        "Edge {edge} disagrees on property `{prop}': source has {src_value}, destination has \
         {dst_value}"
    )]
    EdgeConflict {
        edge: String,
        prop: String,
        src_value: String,
        dst_value: String,
    },

    #[error("Action delivery exceeded {limit} iterations (last action `{key}')")]
    ActionIterationCap { limit: usize, key: String },

    #[error("Block {id} is already registered")]
    DuplicateBlock { id: String },

    #[error("Block {id} does not exist")]
    NoSuchBlock { id: String },

    #[error("A block factory for NOC ID 0x{noc_id:08X} on device type 0x{device_type:04X} is already registered")]
    DuplicateFactory { noc_id: u32, device_type: u16 },

    #[error("No block factory registered for NOC ID 0x{noc_id:08X}")]
    NoFactory { noc_id: u32 },

    #[error("{src} is not connectable to {dst}: {reason}")]
    NotConnectable {
        src: String,
        dst: String,
        reason: String,
    },
}

impl From<GraphError> for RnError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Prop(e) => e.into(),
            GraphError::Rn(e) => e,
            e @ (GraphError::Unresolved { .. } | GraphError::EdgeConflict { .. }) => {
                RnError::resolve(e.to_string())
            }
            e @ (GraphError::UnknownNode { .. }
            | GraphError::NoSuchBlock { .. }
            | GraphError::NoFactory { .. }) => RnError::lookup(e.to_string()),
            e @ GraphError::NotConnectable { .. } => RnError::routing(e.to_string()),
            e => RnError::runtime(e.to_string()),
        }
    }
}
