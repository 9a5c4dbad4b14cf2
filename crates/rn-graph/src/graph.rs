//! Property propagation and action delivery across connected nodes.
//!
//! The graph stores node IDs and edges only; nodes live in a [`NodeArena`]
//! owned by the caller. A node missing from the arena is treated as already
//! disconnected.
//!
//! Resolution sweeps the topologically sorted node list (forward edges
//! only), bouncing between both ends until nothing is dirty or the sweep cap
//! is reached. The first phase forwards edge properties along forward
//! edges, the second along back edges.

use std::collections::{BTreeMap, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use rn_config::GraphSettings;
use rn_props::{ActionRef, Node, PropType, Property, ResSourceInfo, SourceKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::edge::GraphEdge;
use crate::error::{GraphError, GraphResult};

/// Owner of the nodes the graph refers to by ID.
pub trait NodeArena {
    fn node(&self, id: &str) -> Option<&(dyn Node + 'static)>;

    fn node_mut(&mut self, id: &str) -> Option<&mut (dyn Node + 'static)>;
}

impl NodeArena for BTreeMap<String, Box<dyn Node>> {
    fn node(&self, id: &str) -> Option<&(dyn Node + 'static)> {
        self.get(id).map(|n| &**n)
    }

    fn node_mut(&mut self, id: &str) -> Option<&mut (dyn Node + 'static)> {
        self.get_mut(id).map(|n| &mut **n)
    }
}

/// Why a resolution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolveContext {
    /// Commit: sweep the full graph.
    Init,
    /// A property changed on one node: stop as soon as nothing is dirty.
    NodeProp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// The identical edge already existed; nothing changed.
    AlreadyConnected,
}

type QueuedAction = (String, ResSourceInfo, ActionRef);

#[derive(Debug)]
pub struct PropGraph {
    graph: StableDiGraph<String, GraphEdge>,
    index: HashMap<String, NodeIndex>,
    release_count: usize,
    shutdown: bool,
    max_sweeps: usize,
    max_action_iterations: usize,
}

impl Default for PropGraph {
    fn default() -> Self {
        Self::new(&GraphSettings::default())
    }
}

impl PropGraph {
    /// An empty graph. It starts released once; the first
    /// [`commit`](Self::commit) enables graph-wide resolution.
    pub fn new(settings: &GraphSettings) -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            release_count: 1,
            shutdown: false,
            max_sweeps: settings.max_graph_sweeps.max(1),
            max_action_iterations: settings.max_action_iterations.max(1),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.release_count == 0 && !self.shutdown
    }

    pub fn release_count(&self) -> usize {
        self.release_count
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Node IDs in insertion order.
    pub fn node_ids(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    pub fn enumerate_edges(&self) -> Vec<GraphEdge> {
        self.graph
            .edge_indices()
            .map(|e| self.graph[e].clone())
            .collect()
    }

    /// Edges touching `id`, incoming first.
    pub fn edges_of(&self, id: &str) -> Vec<GraphEdge> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .chain(self.graph.edges_directed(idx, Direction::Outgoing))
            .map(|e| e.weight().clone())
            .collect()
    }

    fn add_node(&mut self, id: &str) -> (NodeIndex, bool) {
        if let Some(&idx) = self.index.get(id) {
            return (idx, false);
        }
        let idx = self.graph.add_node(id.to_string());
        self.index.insert(id.to_string(), idx);
        (idx, true)
    }

    fn remove_index(&mut self, idx: NodeIndex) {
        if let Some(id) = self.graph.remove_node(idx) {
            debug!(node = %id, "removed node from graph");
            self.index.remove(&id);
        }
    }

    fn is_isolated(&self, idx: NodeIndex) -> bool {
        self.graph.neighbors_undirected(idx).next().is_none()
    }

    // ---- Topology ----

    /// Add `edge` between two nodes present in `arena`.
    ///
    /// Fails without changing the graph if either port is already in use by
    /// another edge or if the edge closes a cycle of forward edges.
    pub fn connect(&mut self, arena: &dyn NodeArena, edge: GraphEdge) -> GraphResult<ConnectOutcome> {
        for id in [&edge.src_blockid, &edge.dst_blockid] {
            if arena.node(id).is_none() {
                return Err(GraphError::UnknownNode { node: id.clone() });
            }
        }
        trace!(%edge, "connecting");

        if let Some(&src) = self.index.get(&edge.src_blockid) {
            for existing in self.graph.edges_directed(src, Direction::Outgoing) {
                let existing = existing.weight();
                if *existing == edge {
                    info!(%edge, "Ignoring repeated call to connect");
                    return Ok(ConnectOutcome::AlreadyConnected);
                }
                if existing.src_port != edge.src_port {
                    continue;
                }
                if existing.same_ports(&edge) {
                    error!(edge = %existing, "Caught attempt to modify properties of edge");
                    return Err(GraphError::EdgeModify {
                        edge: existing.to_string(),
                    });
                }
                error!(node = %existing.src_blockid, port = existing.src_port, "Attempting to reconnect output port");
                return Err(GraphError::OutputInUse {
                    node: existing.src_blockid.clone(),
                    port: existing.src_port,
                });
            }
        }
        if let Some(&dst) = self.index.get(&edge.dst_blockid) {
            let taken = self
                .graph
                .edges_directed(dst, Direction::Incoming)
                .any(|e| e.weight().dst_port == edge.dst_port);
            if taken {
                error!(node = %edge.dst_blockid, port = edge.dst_port, "Attempting to reconnect input port");
                return Err(GraphError::InputInUse {
                    node: edge.dst_blockid.clone(),
                    port: edge.dst_port,
                });
            }
        }

        let (src, src_new) = self.add_node(&edge.src_blockid);
        let (dst, dst_new) = self.add_node(&edge.dst_blockid);
        let edge_idx = self.graph.add_edge(src, dst, edge.clone());
        if self.topo_sorted().is_err() {
            error!(%edge, "Adding edge without disabling property_propagation_active will lead to unresolvable graph");
            self.graph.remove_edge(edge_idx);
            if dst_new {
                self.remove_index(dst);
            }
            if src_new {
                self.remove_index(src);
            }
            return Err(GraphError::Cycle {
                edge: edge.to_string(),
            });
        }
        Ok(ConnectOutcome::Connected)
    }

    /// Remove the edge matching `edge`'s ports. Nodes left without edges are
    /// dropped from the graph and resolve locally again.
    ///
    /// Returns `false` if no such edge existed.
    pub fn disconnect(&mut self, edge: &GraphEdge) -> bool {
        let (Some(&src), Some(&dst)) = (
            self.index.get(&edge.src_blockid),
            self.index.get(&edge.dst_blockid),
        ) else {
            return false;
        };
        trace!(%edge, "disconnecting");
        let found = self
            .graph
            .edges_directed(src, Direction::Outgoing)
            .find(|e| e.target() == dst && e.weight().same_ports(edge))
            .map(|e| e.id());
        let Some(edge_idx) = found else {
            return false;
        };
        self.graph.remove_edge(edge_idx);
        if self.is_isolated(src) {
            self.remove_index(src);
        }
        if src != dst && self.is_isolated(dst) {
            self.remove_index(dst);
        }
        true
    }

    /// Drop a node and all its edges.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.index.get(id).copied() {
            Some(idx) => {
                self.remove_index(idx);
                true
            }
            None => false,
        }
    }

    /// Nodes in topological order over forward edges.
    fn topo_sorted(&self) -> Result<Vec<NodeIndex>, String> {
        let mut forward: DiGraph<NodeIndex, ()> = DiGraph::new();
        let mut map = HashMap::new();
        for idx in self.graph.node_indices() {
            map.insert(idx, forward.add_node(idx));
        }
        for e in self.graph.edge_indices() {
            if self.graph[e].is_back_edge() {
                continue;
            }
            if let Some((a, b)) = self.graph.edge_endpoints(e) {
                forward.add_edge(map[&a], map[&b], ());
            }
        }
        toposort(&forward, None)
            .map(|order| order.into_iter().map(|i| forward[i]).collect())
            .map_err(|cycle| self.graph[forward[cycle.node_id()]].clone())
    }

    /// Ask every node whether it can run with its currently connected ports.
    pub fn check_topology(&self, arena: &dyn NodeArena) -> GraphResult<()> {
        let mut details = Vec::new();
        for idx in self.graph.node_indices() {
            let id = &self.graph[idx];
            let Some(node) = arena.node(id) else {
                continue;
            };
            let mut inputs: Vec<usize> = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .map(|e| e.weight().dst_port)
                .collect();
            let mut outputs: Vec<usize> = self
                .graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|e| e.weight().src_port)
                .collect();
            inputs.sort_unstable();
            outputs.sort_unstable();
            if !node.check_topology(&inputs, &outputs) {
                let core = node.core();
                let detail = format!(
                    "{id}: requested inputs {inputs:?} (valid: {}), outputs {outputs:?} (valid: {})",
                    core.num_input_ports(),
                    core.num_output_ports()
                );
                error!(node = %id, %detail, "Node cannot handle its current topology");
                details.push(detail);
            }
        }
        if details.is_empty() {
            Ok(())
        } else {
            Err(GraphError::Topology { details })
        }
    }

    // ---- Commit / release ----

    /// Undo one [`release`](Self::release). Once the count reaches zero the
    /// topology is checked and the whole graph resolved.
    pub fn commit(&mut self, arena: &mut dyn NodeArena) -> GraphResult<()> {
        if self.release_count > 0 {
            self.release_count -= 1;
        }
        if self.release_count != 0 || self.shutdown {
            return Ok(());
        }
        self.check_topology(&*arena)?;
        let Some(first) = self.graph.node_indices().next() else {
            return Ok(());
        };
        let first = self.graph[first].clone();
        self.resolve_all(arena, ResolveContext::Init, &first)
    }

    /// Suspend graph-wide resolution and action delivery.
    pub fn release(&mut self) {
        if !self.shutdown {
            self.release_count += 1;
        }
    }

    /// Permanently stop resolution and action delivery.
    pub fn shutdown(&mut self) {
        debug!("shutting down graph");
        self.shutdown = true;
        self.release_count = usize::MAX;
    }

    // ---- Resolution ----

    /// Resolve starting from `initial`. While released only `initial` is
    /// resolved.
    pub fn resolve_all(
        &self,
        arena: &mut dyn NodeArena,
        context: ResolveContext,
        initial: &str,
    ) -> GraphResult<()> {
        if self.graph.node_count() == 0 {
            return Ok(());
        }
        if self.shutdown {
            trace!("graph is shut down, skipping resolution");
            return Ok(());
        }
        let Some(&initial_idx) = self.index.get(initial) else {
            return Err(GraphError::UnknownNode {
                node: initial.to_string(),
            });
        };
        if self.release_count > 0 {
            trace!(node = initial, "graph is not committed, resolving node only");
            if let Some(node) = arena.node_mut(initial) {
                let core = node.core_mut();
                core.resolve_props()?;
                core.clean_props();
            }
            return Ok(());
        }
        self.sweep(arena, context, initial_idx, true)?;
        self.sweep(arena, context, initial_idx, false)
    }

    fn sweep(
        &self,
        arena: &mut dyn NodeArena,
        context: ResolveContext,
        initial: NodeIndex,
        forward_phase: bool,
    ) -> GraphResult<()> {
        let dirty = self.dirty_nodes(&*arena);
        if dirty.len() > 1 {
            debug!(count = dirty.len(), "more than one node is dirty before resolution");
        }
        let order = self.topo_sorted().map_err(|node| GraphError::Cycle {
            edge: format!("through {node}"),
        })?;
        let Some(mut pos) = order.iter().position(|&n| n == initial) else {
            return Err(GraphError::UnknownNode {
                node: self.graph[initial].clone(),
            });
        };
        trace!(phase = if forward_phase { "forward" } else { "backward" }, ?context, start = %self.graph[initial], "sweeping");

        let mut forward_dir = true;
        let mut iterations = 0;
        loop {
            let idx = order[pos];
            let id = &self.graph[idx];
            if let Some(node) = arena.node_mut(id) {
                if let Err(err) = node.core_mut().resolve_props() {
                    error!(node = %id, error = %err, "Failed to resolve properties");
                    return Err(err.into());
                }
            }
            self.forward_edge_props(arena, idx, forward_phase)?;
            if let Some(node) = arena.node_mut(id) {
                node.core_mut().clean_props();
            }

            if context == ResolveContext::NodeProp && self.dirty_nodes(&*arena).is_empty() {
                break;
            }

            if forward_dir {
                pos += 1;
                if pos == order.len() {
                    forward_dir = false;
                    pos -= 1;
                }
            }
            if !forward_dir {
                if order.len() > 1 {
                    pos -= 1;
                    if pos == 0 {
                        forward_dir = true;
                    }
                } else {
                    forward_dir = true;
                }
            }

            if forward_dir && order[pos] == initial {
                iterations += 1;
                if iterations >= self.max_sweeps || self.dirty_nodes(&*arena).is_empty() {
                    break;
                }
            }
        }

        let remaining = self.dirty_nodes(&*arena);
        if remaining.is_empty() {
            return Ok(());
        }
        if let Some(conflict) = self.diagnose_conflict(arena, &remaining) {
            error!(error = %conflict, "Could not resolve properties");
            return Err(conflict);
        }
        let dirty: Vec<String> = remaining
            .iter()
            .filter_map(|&idx| {
                let id = &self.graph[idx];
                arena.node(id).map(|node| {
                    node.core()
                        .dirty_props()
                        .iter()
                        .map(|p| format!("{id}: {}", p.describe()))
                        .collect::<Vec<_>>()
                })
            })
            .flatten()
            .collect();
        error!(dirty = ?dirty, "Could not resolve properties");
        Err(GraphError::Unresolved { dirty })
    }

    /// Push every edge property of `origin` to the neighbour on that edge,
    /// for edges whose direction matches the current phase.
    fn forward_edge_props(
        &self,
        arena: &mut dyn NodeArena,
        origin: NodeIndex,
        forward_phase: bool,
    ) -> GraphResult<()> {
        let Some(node) = arena.node(&self.graph[origin]) else {
            return Ok(());
        };
        let props: Vec<Property> = node.core().edge_props().into_iter().cloned().collect();
        for prop in &props {
            let Some((neighbour, edge)) = self.find_neighbour(origin, prop.src()) else {
                continue;
            };
            if edge.property_propagation_active != forward_phase {
                continue;
            }
            let port = if prop.src().kind == SourceKind::InputEdge {
                edge.src_port
            } else {
                edge.dst_port
            };
            let Some(target) = arena.node_mut(&self.graph[neighbour]) else {
                continue;
            };
            if target.core_mut().forward_edge_property(prop, port)? {
                trace!(prop = %prop.describe(), %edge, "forwarded edge property");
            }
        }
        Ok(())
    }

    /// Neighbour connected to `origin` on `port`, with the connecting edge.
    fn find_neighbour(&self, origin: NodeIndex, port: ResSourceInfo) -> Option<(NodeIndex, &GraphEdge)> {
        match port.kind {
            SourceKind::InputEdge => self
                .graph
                .edges_directed(origin, Direction::Incoming)
                .find(|e| e.weight().dst_port == port.instance)
                .map(|e| (e.source(), e.weight())),
            SourceKind::OutputEdge => self
                .graph
                .edges_directed(origin, Direction::Outgoing)
                .find(|e| e.weight().src_port == port.instance)
                .map(|e| (e.target(), e.weight())),
            _ => None,
        }
    }

    fn dirty_nodes(&self, arena: &dyn NodeArena) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                arena
                    .node(&self.graph[idx])
                    .is_some_and(|n| !n.core().dirty_props().is_empty())
            })
            .collect()
    }

    /// When the sweep cap is hit because two neighbours keep overwriting
    /// each other, the last forward made both ends equal. Let the dirty
    /// nodes resolve once more so each end shows what it insists on.
    fn diagnose_conflict(&self, arena: &mut dyn NodeArena, dirty: &[NodeIndex]) -> Option<GraphError> {
        for &idx in dirty {
            if let Some(node) = arena.node_mut(&self.graph[idx]) {
                if let Err(err) = node.core_mut().resolve_props() {
                    debug!(node = %self.graph[idx], error = %err, "re-resolution failed while diagnosing");
                }
            }
        }
        self.edge_conflicts(&*arena).into_iter().next()
    }

    /// Edge properties whose values differ between the two ends of an edge.
    pub fn edge_conflicts(&self, arena: &dyn NodeArena) -> Vec<GraphError> {
        let mut conflicts = Vec::new();
        for e in self.graph.edge_indices() {
            let edge = &self.graph[e];
            let (Some(src), Some(dst)) = (arena.node(&edge.src_blockid), arena.node(&edge.dst_blockid))
            else {
                continue;
            };
            let dst_props = dst.core().port_props(ResSourceInfo::input_edge(edge.dst_port));
            for sp in src.core().port_props(ResSourceInfo::output_edge(edge.src_port)) {
                let Some(dp) = dst_props.iter().find(|p| p.id() == sp.id()) else {
                    continue;
                };
                if let (Some(sv), Some(dv)) = (sp.value(), dp.value()) {
                    if sv != dv {
                        conflicts.push(GraphError::EdgeConflict {
                            edge: edge.to_string(),
                            prop: sp.id().to_string(),
                            src_value: sv.to_string(),
                            dst_value: dv.to_string(),
                        });
                    }
                }
            }
        }
        conflicts
    }

    // ---- Properties through the graph ----

    /// Write a property on `node` and resolve from there.
    pub fn set_property<T: PropType>(
        &self,
        arena: &mut dyn NodeArena,
        node: &str,
        id: &str,
        src: ResSourceInfo,
        value: T,
    ) -> GraphResult<()> {
        let Some(target) = arena.node_mut(node) else {
            return Err(GraphError::UnknownNode {
                node: node.to_string(),
            });
        };
        if !self.contains(node) {
            target.core_mut().set_property_at(id, value, src)?;
            return Ok(());
        }
        target.core_mut().write_property(id, src, value.into_value())?;
        self.resolve_all(arena, ResolveContext::NodeProp, node)
    }

    /// Resolve from `node`, then read.
    pub fn get_property<T: PropType>(
        &self,
        arena: &mut dyn NodeArena,
        node: &str,
        id: &str,
        src: ResSourceInfo,
    ) -> GraphResult<T> {
        if !self.contains(node) {
            let target = arena.node_mut(node).ok_or_else(|| GraphError::UnknownNode {
                node: node.to_string(),
            })?;
            return Ok(target.core_mut().get_property_at(id, src)?);
        }
        self.resolve_all(arena, ResolveContext::NodeProp, node)?;
        let target = arena.node(node).ok_or_else(|| GraphError::UnknownNode {
            node: node.to_string(),
        })?;
        Ok(target.core().peek_property(id, src)?)
    }

    /// `key=value,...` assignments on USER properties of `node`.
    pub fn set_properties(
        &self,
        arena: &mut dyn NodeArena,
        node: &str,
        assignments: &str,
        instance: usize,
    ) -> GraphResult<()> {
        let target = arena.node_mut(node).ok_or_else(|| GraphError::UnknownNode {
            node: node.to_string(),
        })?;
        target.core_mut().set_properties(assignments, instance)?;
        if self.contains(node) {
            self.resolve_all(arena, ResolveContext::NodeProp, node)?;
        }
        Ok(())
    }

    // ---- Actions ----

    /// Send `action` out of `src` on `node`.
    pub fn post_action(
        &self,
        arena: &mut dyn NodeArena,
        node: &str,
        src: ResSourceInfo,
        action: ActionRef,
    ) -> GraphResult<()> {
        self.deliver(arena, VecDeque::from([(node.to_string(), src, action)]))
    }

    /// Deliver actions `node` posted outside of an action handler.
    pub fn flush_actions(&self, arena: &mut dyn NodeArena, node: &str) -> GraphResult<()> {
        let target = arena.node_mut(node).ok_or_else(|| GraphError::UnknownNode {
            node: node.to_string(),
        })?;
        let queue = target
            .core_mut()
            .take_posted_actions()
            .into_iter()
            .map(|(src, action)| (node.to_string(), src, action))
            .collect();
        self.deliver(arena, queue)
    }

    fn deliver(&self, arena: &mut dyn NodeArena, mut queue: VecDeque<QueuedAction>) -> GraphResult<()> {
        if self.shutdown {
            debug!(dropped = queue.len(), "graph is shut down, dropping actions");
            return Ok(());
        }
        if self.release_count > 0 {
            warn!(dropped = queue.len(), "Action delivery is not possible before the graph is committed");
            return Ok(());
        }
        let mut iterations = 0;
        while let Some((origin, src, action)) = queue.pop_front() {
            iterations += 1;
            if iterations > self.max_action_iterations {
                error!(limit = self.max_action_iterations, key = %action.key, "Action delivery did not terminate");
                return Err(GraphError::ActionIterationCap {
                    limit: self.max_action_iterations,
                    key: action.key.clone(),
                });
            }
            let Some((recipient, port)) = self.action_recipient(&origin, src) else {
                warn!(key = %action.key, from = %origin, port = %src, "Cannot forward action, no neighbour found");
                continue;
            };
            let Some(node) = arena.node_mut(&recipient) else {
                warn!(key = %action.key, to = %recipient, "Dropping action for missing node");
                continue;
            };
            trace!(key = %action.key, id = action.id, from = %origin, to = %recipient, %port, "delivering action");
            let core = node.core_mut();
            core.receive_action(port, &action)?;
            queue.extend(
                core.take_posted_actions()
                    .into_iter()
                    .map(|(edge, next)| (recipient.clone(), edge, next)),
            );
        }
        Ok(())
    }

    /// Node and port receiving an action sent out of `src` on `origin`.
    fn action_recipient(&self, origin: &str, src: ResSourceInfo) -> Option<(String, ResSourceInfo)> {
        if src.kind == SourceKind::User {
            return Some((origin.to_string(), src));
        }
        let &idx = self.index.get(origin)?;
        let (neighbour, edge) = self.find_neighbour(idx, src)?;
        let port = match src.kind {
            SourceKind::InputEdge => ResSourceInfo::output_edge(edge.src_port),
            _ => ResSourceInfo::input_edge(edge.dst_port),
        };
        Some((self.graph[neighbour].clone(), port))
    }
}
