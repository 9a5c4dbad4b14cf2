//! rn-graph: the block graph of a device session.
//!
//! Contains:
//! - edge (graph edges and their hardware realization)
//! - graph (topology, commit/release, property propagation, action delivery)
//! - registry (block factories keyed by NOC ID)
//! - container (the live block controllers)
//! - topology (static fabric wiring)
//! - session (`RfnocGraph`: blocks, streamers, graph and endpoint routing together)
//! - snapshot (serializable session state for diagnostics)
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use rn_graph::{EdgeKind, GraphEdge, PropGraph};
//! use rn_props::{Node, NodeCore, ResSourceInfo};
//!
//! let mut nodes: BTreeMap<String, Box<dyn Node>> = BTreeMap::new();
//! for id in ["SRC", "DST"] {
//!     let mut core = NodeCore::new(id, 1, 1);
//!     core.register_property("rate", ResSourceInfo::input_edge(0), 1.0_f64).unwrap();
//!     core.register_property("rate", ResSourceInfo::output_edge(0), 1.0_f64).unwrap();
//!     core.init_props();
//!     nodes.insert(id.to_string(), Box::new(core));
//! }
//!
//! let mut graph = PropGraph::default();
//! graph
//!     .connect(&nodes, GraphEdge::new("SRC", 0, "DST", 0, EdgeKind::Dynamic))
//!     .unwrap();
//! graph.commit(&mut nodes).unwrap();
//! assert!(graph.is_committed());
//! ```

pub mod container;
pub mod edge;
pub mod error;
pub mod graph;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod topology;

pub use container::BlockContainer;
pub use edge::{EdgeKind, GraphEdge};
pub use error::{GraphError, GraphResult};
pub use graph::{ConnectOutcome, NodeArena, PropGraph, ResolveContext};
pub use registry::{ANY_DEVICE, BlockFactory, BlockRegistry, DEFAULT_MTU, MakeArgs};
pub use session::{ActiveConnection, HOST_DEVICE_ID, RfnocGraph, RouteInfo};
pub use snapshot::{EpidEntry, GraphSnapshot, NodeSnapshot, PropSnapshot};
pub use topology::{DeviceTopology, FabricPort, StaticLink};
