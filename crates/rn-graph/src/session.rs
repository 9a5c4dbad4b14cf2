//! A device session: blocks, streamers, the property graph, and the
//! endpoint routing that backs dynamic connections.

use std::collections::BTreeMap;
use std::sync::Arc;

use rn_config::{GraphSettings, SessionConfig};
use rn_core::{BlockId, DeviceId, RnError, SepAddr, SepId, SepInst};
use rn_props::{ActionRef, Node, PropType, ResSourceInfo};
use rn_xport::{EpidAllocator, MgmtPortal, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::container::BlockContainer;
use crate::edge::{EdgeKind, GraphEdge};
use crate::error::{GraphError, GraphResult};
use crate::graph::{ConnectOutcome, NodeArena, PropGraph, ResolveContext};
use crate::registry::{BlockRegistry, MakeArgs};
use crate::snapshot::GraphSnapshot;
use crate::topology::{DeviceTopology, FabricPort, StaticLink};

/// Device ID used for host-side stream endpoint addresses.
pub const HOST_DEVICE_ID: DeviceId = 0xFFFF;

/// Endpoint pair a dynamic or streaming connection is routed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub src_addr: SepAddr,
    pub src_epid: SepId,
    pub dst_addr: SepAddr,
    pub dst_epid: SepId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveConnection {
    pub edge: GraphEdge,
    /// Bytes per packet; never zero.
    pub pkt_size: usize,
    pub route: Option<RouteInfo>,
}

/// Blocks and streamers seen as one arena.
struct SessionArena<'a> {
    blocks: &'a mut BlockContainer,
    streamers: &'a mut BTreeMap<String, Box<dyn Node>>,
}

impl NodeArena for SessionArena<'_> {
    fn node(&self, id: &str) -> Option<&(dyn Node + 'static)> {
        self.blocks.node(id).or_else(|| self.streamers.node(id))
    }

    fn node_mut(&mut self, id: &str) -> Option<&mut (dyn Node + 'static)> {
        if let Some(block) = self.blocks.node_mut(id) {
            return Some(block);
        }
        self.streamers.node_mut(id)
    }
}

pub struct RfnocGraph {
    settings: GraphSettings,
    blocks: BlockContainer,
    streamers: BTreeMap<String, Box<dyn Node>>,
    graph: PropGraph,
    topology: DeviceTopology,
    epids: Arc<EpidAllocator>,
    mgmt: Arc<dyn MgmtPortal>,
    mgmt_xport: Arc<dyn Transport>,
    host_addrs: BTreeMap<(String, usize), SepAddr>,
    next_host_inst: SepInst,
    connections: Vec<ActiveConnection>,
}

impl RfnocGraph {
    pub fn new(
        config: &SessionConfig,
        topology: DeviceTopology,
        mgmt: Arc<dyn MgmtPortal>,
        mgmt_xport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            settings: config.graph.clone(),
            blocks: BlockContainer::new(),
            streamers: BTreeMap::new(),
            graph: PropGraph::new(&config.graph),
            topology,
            epids: Arc::new(EpidAllocator::from_config(&config.epid)),
            mgmt,
            mgmt_xport,
            host_addrs: BTreeMap::new(),
            next_host_inst: 0,
            connections: Vec::new(),
        }
    }

    fn parts(&mut self) -> (&mut PropGraph, SessionArena<'_>) {
        (
            &mut self.graph,
            SessionArena {
                blocks: &mut self.blocks,
                streamers: &mut self.streamers,
            },
        )
    }

    pub fn epid_allocator(&self) -> &Arc<EpidAllocator> {
        &self.epids
    }

    // ---- Blocks ----

    pub fn register_block(&mut self, id: BlockId, mut block: Box<dyn Node>) -> GraphResult<()> {
        block.core_mut().set_max_rounds(self.settings.max_node_rounds);
        self.blocks.register_block(id, block)
    }

    pub fn make_block(
        &mut self,
        registry: &BlockRegistry,
        device_type: u16,
        args: MakeArgs,
    ) -> GraphResult<BlockId> {
        let id = self.blocks.make_block(registry, device_type, args)?;
        self.blocks
            .get_block_mut(&id)?
            .core_mut()
            .set_max_rounds(self.settings.max_node_rounds);
        Ok(id)
    }

    pub fn find_blocks(&self, hint: &str) -> Vec<BlockId> {
        self.blocks.find_blocks(hint)
    }

    pub fn has_block(&self, id: &BlockId) -> bool {
        self.blocks.has_block(id)
    }

    pub fn get_block(&self, id: &BlockId) -> GraphResult<&(dyn Node + 'static)> {
        self.blocks.get_block(id)
    }

    pub fn get_block_mut(&mut self, id: &BlockId) -> GraphResult<&mut (dyn Node + 'static)> {
        self.blocks.get_block_mut(id)
    }

    pub fn get_block_as<T: Node>(&self, id: &BlockId) -> GraphResult<&T> {
        self.blocks.get_block_as(id)
    }

    pub fn get_block_as_mut<T: Node>(&mut self, id: &BlockId) -> GraphResult<&mut T> {
        self.blocks.get_block_as_mut(id)
    }

    /// Initialize every registered block once.
    pub fn init_props(&mut self) {
        self.blocks.init_props(self.settings.max_node_rounds);
    }

    /// Stop resolution and action delivery, then shut down every block and
    /// streamer once.
    pub fn shutdown(&mut self) {
        info!("shutting down session");
        self.graph.shutdown();
        self.blocks.shutdown();
        for streamer in self.streamers.values_mut() {
            streamer.shutdown();
        }
    }

    // ---- Block to block connections ----

    /// Connect two block ports. `pkt_size` 0 uses the configured default.
    pub fn connect(
        &mut self,
        src: &BlockId,
        src_port: usize,
        dst: &BlockId,
        dst_port: usize,
        pkt_size: usize,
    ) -> GraphResult<ConnectOutcome> {
        self.connect_blocks(src, src_port, dst, dst_port, pkt_size, true)
    }

    /// Like [`connect`](Self::connect), but properties only cross the edge in
    /// the backward sweep. Use this to close loops.
    pub fn connect_back_edge(
        &mut self,
        src: &BlockId,
        src_port: usize,
        dst: &BlockId,
        dst_port: usize,
        pkt_size: usize,
    ) -> GraphResult<ConnectOutcome> {
        self.connect_blocks(src, src_port, dst, dst_port, pkt_size, false)
    }

    fn connect_blocks(
        &mut self,
        src: &BlockId,
        src_port: usize,
        dst: &BlockId,
        dst_port: usize,
        pkt_size: usize,
        propagate: bool,
    ) -> GraphResult<ConnectOutcome> {
        for id in [src, dst] {
            if !self.blocks.has_block(id) {
                return Err(GraphError::NoSuchBlock { id: id.to_string() });
            }
        }
        let (kind, seps) = self.classify(src, src_port, dst, dst_port)?;
        let mut edge = GraphEdge::new(src.to_string(), src_port, dst.to_string(), dst_port, kind);
        edge.property_propagation_active = propagate;

        let (graph, arena) = self.parts();
        if graph.connect(&arena, edge.clone())? == ConnectOutcome::AlreadyConnected {
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        let route = match seps {
            Some((a, b)) => match self.setup_route(a, b) {
                Ok(route) => Some(route),
                Err(err) => {
                    self.graph.disconnect(&edge);
                    return Err(err);
                }
            },
            None => None,
        };
        info!(%edge, ?kind, "connected");
        self.finish_connect(edge, pkt_size, route)?;
        Ok(ConnectOutcome::Connected)
    }

    fn finish_connect(
        &mut self,
        edge: GraphEdge,
        pkt_size: usize,
        route: Option<RouteInfo>,
    ) -> GraphResult<()> {
        let pkt_size = if pkt_size == 0 {
            self.settings.default_pkt_size
        } else {
            pkt_size
        };
        let src = edge.src_blockid.clone();
        self.connections.push(ActiveConnection {
            edge: edge.clone(),
            pkt_size,
            route,
        });
        if self.graph.is_committed() {
            let (graph, mut arena) = self.parts();
            if let Err(err) = graph.resolve_all(&mut arena, ResolveContext::Init, &src) {
                warn!(%edge, %err, "resolution failed, removing edge");
                self.graph.disconnect(&edge);
                self.connections.pop();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Edge kind for a block-to-block connection, plus the endpoints to
    /// route between for dynamic edges.
    fn classify(
        &self,
        src: &BlockId,
        src_port: usize,
        dst: &BlockId,
        dst_port: usize,
    ) -> GraphResult<(EdgeKind, Option<(SepAddr, SepAddr)>)> {
        let src_fp = FabricPort::block(src.clone(), src_port);
        let dst_fp = FabricPort::block(dst.clone(), dst_port);
        let not_connectable = |reason: String| GraphError::NotConnectable {
            src: src_fp.to_string(),
            dst: dst_fp.to_string(),
            reason,
        };
        let downstream = self.topology.downstream_of(&src_fp);
        if downstream == Some(&dst_fp) {
            return Ok((EdgeKind::Static, None));
        }
        let src_sep = match downstream {
            Some(FabricPort::Sep { addr, .. }) => *addr,
            Some(other) => return Err(not_connectable(format!("source is statically wired to {other}"))),
            None => return Err(not_connectable("source is not wired to a stream endpoint".into())),
        };
        let dst_sep = match self.topology.upstream_of(&dst_fp) {
            Some(FabricPort::Sep { addr, .. }) => *addr,
            Some(other) => {
                return Err(not_connectable(format!("destination is statically fed by {other}")));
            }
            None => {
                return Err(not_connectable("destination is not wired to a stream endpoint".into()));
            }
        };
        Ok((EdgeKind::Dynamic, Some((src_sep, dst_sep))))
    }

    pub fn is_connectable(&self, src: &BlockId, src_port: usize, dst: &BlockId, dst_port: usize) -> bool {
        self.blocks.has_block(src)
            && self.blocks.has_block(dst)
            && self.classify(src, src_port, dst, dst_port).is_ok()
    }

    /// Bring up both device endpoints and route `a` to `b`.
    fn setup_route(&self, a: SepAddr, b: SepAddr) -> GraphResult<RouteInfo> {
        let src_epid = self.device_epid(a)?;
        let dst_epid = self.device_epid(b)?;
        self.mgmt
            .setup_remote_route(&*self.mgmt_xport, src_epid, dst_epid)
            .map_err(|e| routing_error(e, a, b))?;
        debug!(%a, %b, %src_epid, %dst_epid, "route set up");
        Ok(RouteInfo {
            src_addr: a,
            src_epid,
            dst_addr: b,
            dst_epid,
        })
    }

    fn device_epid(&self, addr: SepAddr) -> GraphResult<SepId> {
        self.epids
            .allocate_epid_with(addr, &*self.mgmt, &*self.mgmt_xport)
            .map_err(|e| routing_error(e, addr, addr))
    }

    /// Remove the connection between two block ports. Returns `false` if
    /// there was none.
    pub fn disconnect(
        &mut self,
        src: &BlockId,
        src_port: usize,
        dst: &BlockId,
        dst_port: usize,
    ) -> GraphResult<bool> {
        for id in [src, dst] {
            if !self.blocks.has_block(id) {
                return Err(GraphError::NoSuchBlock { id: id.to_string() });
            }
        }
        let probe = GraphEdge::new(src.to_string(), src_port, dst.to_string(), dst_port, EdgeKind::Dynamic);
        Ok(self.drop_connection(&probe))
    }

    fn drop_connection(&mut self, probe: &GraphEdge) -> bool {
        if !self.graph.disconnect(probe) {
            return false;
        }
        self.connections.retain(|c| !c.edge.same_ports(probe));
        info!(edge = %probe, "disconnected");
        true
    }

    pub fn enumerate_active_connections(&self) -> Vec<GraphEdge> {
        self.graph.enumerate_edges()
    }

    /// Connections with their packet size and routing.
    pub fn active_connections(&self) -> &[ActiveConnection] {
        &self.connections
    }

    pub fn enumerate_static_connections(&self) -> Vec<StaticLink> {
        self.topology.links.clone()
    }

    // ---- Streamers ----

    /// Take ownership of a streamer node and initialize its properties.
    pub fn add_streamer(&mut self, mut streamer: Box<dyn Node>) -> GraphResult<String> {
        let id = streamer.unique_id().to_string();
        let clashes_with_block = id
            .parse::<BlockId>()
            .is_ok_and(|bid| self.blocks.has_block(&bid));
        if clashes_with_block || self.streamers.contains_key(&id) {
            return Err(GraphError::DuplicateBlock { id });
        }
        let core = streamer.core_mut();
        core.set_max_rounds(self.settings.max_node_rounds);
        core.init_props();
        debug!(streamer = %id, "added streamer");
        self.streamers.insert(id.clone(), streamer);
        Ok(id)
    }

    pub fn streamer(&self, id: &str) -> GraphResult<&(dyn Node + 'static)> {
        self.streamers.node(id).ok_or_else(|| GraphError::UnknownNode {
            node: id.to_string(),
        })
    }

    pub fn streamer_as_mut<T: Node>(&mut self, id: &str) -> GraphResult<&mut T> {
        self.streamers
            .node_mut(id)
            .ok_or_else(|| GraphError::UnknownNode { node: id.to_string() })?
            .downcast_mut::<T>()
            .ok_or_else(|| RnError::lookup(format!("streamer {id} is not of the requested type")).into())
    }

    pub fn streamer_as<T: Node>(&self, id: &str) -> GraphResult<&T> {
        self.streamer(id)?
            .downcast_ref::<T>()
            .ok_or_else(|| RnError::lookup(format!("streamer {id} is not of the requested type")).into())
    }

    /// Stream `block:block_port` to the host through `streamer:strm_port`.
    pub fn connect_rx_streamer(
        &mut self,
        block: &BlockId,
        block_port: usize,
        streamer: &str,
        strm_port: usize,
    ) -> GraphResult<RouteInfo> {
        self.check_stream_ends(block, streamer)?;
        let block_fp = FabricPort::block(block.clone(), block_port);
        let Some(device_sep) = self.topology.downstream_of(&block_fp).and_then(FabricPort::sep_addr) else {
            return Err(GraphError::NotConnectable {
                src: block_fp.to_string(),
                dst: format!("{streamer}:{strm_port}"),
                reason: "block output is not wired to a stream endpoint".into(),
            });
        };
        let edge = GraphEdge::new(block.to_string(), block_port, streamer, strm_port, EdgeKind::RxStream);
        self.connect_stream(edge, device_sep, streamer, strm_port, true)
    }

    /// Stream from the host through `streamer:strm_port` into
    /// `block:block_port`.
    pub fn connect_tx_streamer(
        &mut self,
        streamer: &str,
        strm_port: usize,
        block: &BlockId,
        block_port: usize,
    ) -> GraphResult<RouteInfo> {
        self.check_stream_ends(block, streamer)?;
        let block_fp = FabricPort::block(block.clone(), block_port);
        let Some(device_sep) = self.topology.upstream_of(&block_fp).and_then(FabricPort::sep_addr) else {
            return Err(GraphError::NotConnectable {
                src: format!("{streamer}:{strm_port}"),
                dst: block_fp.to_string(),
                reason: "block input is not fed by a stream endpoint".into(),
            });
        };
        let edge = GraphEdge::new(streamer, strm_port, block.to_string(), block_port, EdgeKind::TxStream);
        self.connect_stream(edge, device_sep, streamer, strm_port, false)
    }

    fn check_stream_ends(&self, block: &BlockId, streamer: &str) -> GraphResult<()> {
        if !self.blocks.has_block(block) {
            return Err(GraphError::NoSuchBlock { id: block.to_string() });
        }
        if !self.streamers.contains_key(streamer) {
            return Err(GraphError::UnknownNode {
                node: streamer.to_string(),
            });
        }
        Ok(())
    }

    fn connect_stream(
        &mut self,
        edge: GraphEdge,
        device_sep: SepAddr,
        streamer: &str,
        strm_port: usize,
        rx: bool,
    ) -> GraphResult<RouteInfo> {
        let (graph, arena) = self.parts();
        if graph.connect(&arena, edge.clone())? == ConnectOutcome::AlreadyConnected {
            return self
                .connections
                .iter()
                .find(|c| c.edge == edge)
                .and_then(|c| c.route)
                .ok_or_else(|| RnError::runtime(format!("stream edge {edge} has no route")).into());
        }
        let route = match self.stream_route(device_sep, streamer, strm_port, rx) {
            Ok(route) => route,
            Err(err) => {
                self.graph.disconnect(&edge);
                return Err(err);
            }
        };
        info!(%edge, host = %route.src_addr, "connected streamer");
        self.finish_connect(edge, 0, Some(route))?;
        Ok(route)
    }

    /// Allocate the host endpoint for a streamer port and the device
    /// endpoint, then route between them in stream direction.
    fn stream_route(
        &mut self,
        device_sep: SepAddr,
        streamer: &str,
        strm_port: usize,
        rx: bool,
    ) -> GraphResult<RouteInfo> {
        let key = (streamer.to_string(), strm_port);
        let host_addr = match self.host_addrs.get(&key) {
            Some(addr) => *addr,
            None => {
                let addr = SepAddr::new(HOST_DEVICE_ID, self.next_host_inst);
                self.next_host_inst = self.next_host_inst.checked_add(1).ok_or_else(|| {
                    RnError::runtime("host stream endpoint instances exhausted")
                })?;
                self.host_addrs.insert(key, addr);
                addr
            }
        };
        let host_epid = self.epids.allocate_epid(host_addr)?;
        let device_epid = self.device_epid(device_sep)?;
        let route = if rx {
            RouteInfo {
                src_addr: device_sep,
                src_epid: device_epid,
                dst_addr: host_addr,
                dst_epid: host_epid,
            }
        } else {
            RouteInfo {
                src_addr: host_addr,
                src_epid: host_epid,
                dst_addr: device_sep,
                dst_epid: device_epid,
            }
        };
        self.mgmt
            .setup_remote_route(&*self.mgmt_xport, route.src_epid, route.dst_epid)
            .map_err(|e| routing_error(e, route.src_addr, route.dst_addr))?;
        Ok(route)
    }

    /// Disconnect every port of `streamer` and hand the node back.
    pub fn disconnect_streamer(&mut self, streamer: &str) -> GraphResult<Box<dyn Node>> {
        if !self.streamers.contains_key(streamer) {
            return Err(GraphError::UnknownNode {
                node: streamer.to_string(),
            });
        }
        for edge in self.graph.edges_of(streamer) {
            self.drop_connection(&edge);
        }
        self.graph.remove(streamer);
        self.host_addrs.retain(|(id, _), _| id != streamer);
        debug!(%streamer, "removed streamer");
        self.streamers
            .remove(streamer)
            .ok_or_else(|| GraphError::UnknownNode {
                node: streamer.to_string(),
            })
    }

    /// Disconnect one port of `streamer`. Returns `false` if it was not
    /// connected.
    pub fn disconnect_streamer_port(&mut self, streamer: &str, strm_port: usize) -> GraphResult<bool> {
        if !self.streamers.contains_key(streamer) {
            return Err(GraphError::UnknownNode {
                node: streamer.to_string(),
            });
        }
        let edge = self.graph.edges_of(streamer).into_iter().find(|e| {
            (e.dst_blockid == streamer && e.dst_port == strm_port)
                || (e.src_blockid == streamer && e.src_port == strm_port)
        });
        match edge {
            Some(edge) => Ok(self.drop_connection(&edge)),
            None => {
                warn!(%streamer, port = strm_port, "streamer port is not connected");
                Ok(false)
            }
        }
    }

    // ---- Properties and actions ----

    pub fn commit(&mut self) -> GraphResult<()> {
        let (graph, mut arena) = self.parts();
        graph.commit(&mut arena)
    }

    pub fn release(&mut self) {
        self.graph.release();
    }

    pub fn is_committed(&self) -> bool {
        self.graph.is_committed()
    }

    pub fn set_property<T: PropType>(
        &mut self,
        node: &str,
        id: &str,
        value: T,
        src: ResSourceInfo,
    ) -> GraphResult<()> {
        let (graph, mut arena) = self.parts();
        graph.set_property(&mut arena, node, id, src, value)
    }

    pub fn get_property<T: PropType>(&mut self, node: &str, id: &str, src: ResSourceInfo) -> GraphResult<T> {
        let (graph, mut arena) = self.parts();
        graph.get_property(&mut arena, node, id, src)
    }

    pub fn set_properties(&mut self, node: &str, assignments: &str, instance: usize) -> GraphResult<()> {
        let (graph, mut arena) = self.parts();
        graph.set_properties(&mut arena, node, assignments, instance)
    }

    pub fn post_action(&mut self, node: &str, src: ResSourceInfo, action: ActionRef) -> GraphResult<()> {
        let (graph, mut arena) = self.parts();
        graph.post_action(&mut arena, node, src, action)
    }

    /// Deliver actions a node queued on its own, e.g. from a data path
    /// event.
    pub fn flush_actions(&mut self, node: &str) -> GraphResult<()> {
        let (graph, mut arena) = self.parts();
        graph.flush_actions(&mut arena, node)
    }

    /// Edge properties currently disagreeing across an edge.
    pub fn edge_conflicts(&mut self) -> Vec<GraphError> {
        let (graph, arena) = self.parts();
        graph.edge_conflicts(&arena)
    }

    pub fn snapshot(&mut self) -> GraphSnapshot {
        let ids: Vec<String> = self
            .blocks
            .find_blocks("")
            .iter()
            .map(ToString::to_string)
            .chain(self.streamers.keys().cloned())
            .collect();
        let epids = self.epids.allocations();
        let connections = self.connections.clone();
        let (graph, arena) = self.parts();
        GraphSnapshot::capture(graph, &arena, ids, &connections, epids)
    }
}

fn routing_error(err: RnError, a: SepAddr, b: SepAddr) -> GraphError {
    match err {
        RnError::Timeout { .. } | RnError::Routing { .. } => err.into(),
        other => RnError::routing(format!("cannot route {a} -> {b}: {other}")).into(),
    }
}
