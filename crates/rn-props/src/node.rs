//! Per-node property and action engine.
//!
//! Every block and streamer embeds a [`NodeCore`]. It owns the node's
//! properties and resolvers, runs local resolution, injects edge properties
//! arriving from neighbours, and routes actions through handlers or the
//! node's forwarding policy. Delivery between nodes is the graph's job: the
//! node only queues outgoing actions in its outbox.

use core::fmt;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use rn_core::Time;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::action::{ActionCtx, ActionHandler, ActionRef};
use crate::error::{PropError, PropResult};
use crate::forwarding::{ForwardingMap, ForwardingPolicy, destinations};
use crate::property::{Access, PropType, PropValue, Property, ResSourceInfo, SourceKind, ValueType};
use crate::resolver::{PropId, ResolverCtx, ResolverEntry, run_resolution};

pub const DEFAULT_MAX_ROUNDS: usize = 32;
pub const PROP_KEY_TICK_RATE: &str = "tick_rate";
pub const PROP_KEY_MTU: &str = "mtu";

static NEXT_NODE_TAG: AtomicU32 = AtomicU32::new(1);

type CleanCallback = Box<dyn FnMut(&Property) + Send>;

/// Optional node roles the graph dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Carries a `tick_rate` edge property on every port, kept equal.
    TickAware,
    /// Carries an `mtu` edge property on every port.
    MtuAware,
    /// Forwards actions it has no handler for.
    ActionForwarding,
}

/// Graph-facing interface of a node. Implementors hand out their embedded
/// [`NodeCore`]; the remaining methods have sensible defaults.
pub trait Node: Any + Send {
    fn core(&self) -> &NodeCore;

    fn core_mut(&mut self) -> &mut NodeCore;

    fn unique_id(&self) -> &str {
        self.core().unique_id()
    }

    /// Whether the node can operate with the given ports connected.
    fn check_topology(&self, connected_inputs: &[usize], connected_outputs: &[usize]) -> bool {
        self.core().check_topology(connected_inputs, connected_outputs)
    }

    fn shutdown(&mut self) {
        debug!(node = self.unique_id(), "shutdown() not implemented");
    }
}

impl dyn Node {
    pub fn downcast_ref<T: Node>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Node>(&mut self) -> Option<&mut T> {
        (self as &mut dyn Any).downcast_mut::<T>()
    }
}

pub struct NodeCore {
    unique_id: String,
    tag: u32,
    num_inputs: usize,
    num_outputs: usize,
    capabilities: BTreeSet<Capability>,
    props: Vec<Property>,
    always_dirty: PropId,
    clean_callbacks: HashMap<usize, CleanCallback>,
    resolvers: Vec<ResolverEntry>,
    prop_fwd_policies: HashMap<String, ForwardingPolicy>,
    prop_fwd_map: ForwardingMap,
    action_fwd_policies: HashMap<String, ForwardingPolicy>,
    action_fwd_map: ForwardingMap,
    action_handlers: HashMap<String, ActionHandler>,
    cmd_times: Vec<Option<Time>>,
    mtu_limit: Option<usize>,
    mtu_policy_set: bool,
    max_rounds: usize,
    outbox: Vec<(ResSourceInfo, ActionRef)>,
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("unique_id", &self.unique_id)
            .field("num_inputs", &self.num_inputs)
            .field("num_outputs", &self.num_outputs)
            .field("capabilities", &self.capabilities)
            .field("props", &self.props.len())
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}

impl Node for NodeCore {
    fn core(&self) -> &NodeCore {
        self
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        self
    }
}

impl NodeCore {
    pub fn new(unique_id: impl Into<String>, num_inputs: usize, num_outputs: usize) -> Self {
        let tag = NEXT_NODE_TAG.fetch_add(1, Ordering::Relaxed);
        let default_policies =
            HashMap::from([(String::new(), ForwardingPolicy::OneToOne)]);
        Self {
            unique_id: unique_id.into(),
            tag,
            num_inputs,
            num_outputs,
            capabilities: BTreeSet::from([Capability::ActionForwarding]),
            props: vec![Property::always_dirty()],
            always_dirty: PropId { owner: tag, index: 0 },
            clean_callbacks: HashMap::new(),
            resolvers: Vec::new(),
            prop_fwd_policies: default_policies.clone(),
            prop_fwd_map: ForwardingMap::new(),
            action_fwd_policies: default_policies,
            action_fwd_map: ForwardingMap::new(),
            action_handlers: HashMap::new(),
            cmd_times: Vec::new(),
            mtu_limit: None,
            mtu_policy_set: false,
            max_rounds: DEFAULT_MAX_ROUNDS,
            outbox: Vec::new(),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn num_input_ports(&self) -> usize {
        self.num_inputs
    }

    pub fn num_output_ports(&self) -> usize {
        self.num_outputs
    }

    pub fn max_rounds(&self) -> usize {
        self.max_rounds
    }

    pub fn set_max_rounds(&mut self, rounds: usize) {
        self.max_rounds = rounds.max(1);
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.capabilities.iter().copied()
    }

    /// Enable or disable forwarding of unhandled actions.
    pub fn set_action_forwarding(&mut self, enabled: bool) {
        if enabled {
            self.capabilities.insert(Capability::ActionForwarding);
        } else {
            self.capabilities.remove(&Capability::ActionForwarding);
        }
    }

    /// The always-dirty sentinel; list it as a resolver input to run that
    /// resolver on every resolution.
    pub fn always_dirty(&self) -> PropId {
        self.always_dirty
    }

    pub fn has_port(&self, port: ResSourceInfo) -> bool {
        match port.kind {
            SourceKind::InputEdge => port.instance < self.num_inputs,
            SourceKind::OutputEdge => port.instance < self.num_outputs,
            _ => false,
        }
    }

    fn pid(&self, index: usize) -> PropId {
        PropId {
            owner: self.tag,
            index,
        }
    }

    fn find(&self, id: &str, src: ResSourceInfo) -> Option<usize> {
        self.props
            .iter()
            .position(|p| p.id() == id && p.src() == src)
    }

    fn lookup(&self, id: &str, src: ResSourceInfo) -> PropResult<usize> {
        self.find(id, src).ok_or_else(|| PropError::NotFound {
            node: self.unique_id.clone(),
            id: id.to_string(),
            src: src.to_string(),
        })
    }

    fn push_property(&mut self, prop: Property) -> PropResult<PropId> {
        if self.find(prop.id(), prop.src()).is_some() {
            return Err(PropError::DoubleRegistration {
                id: prop.id().to_string(),
                src: prop.src().to_string(),
            });
        }
        self.props.push(prop);
        Ok(self.pid(self.props.len() - 1))
    }

    // ---- Registration ----

    pub fn register_property<T: PropType>(
        &mut self,
        id: &str,
        src: ResSourceInfo,
        default: T,
    ) -> PropResult<PropId> {
        self.push_property(Property::new(id, src, default))
    }

    /// Register a property with no value; it becomes valid on first write.
    pub fn register_empty_property(
        &mut self,
        id: &str,
        src: ResSourceInfo,
        value_type: ValueType,
    ) -> PropResult<PropId> {
        self.push_property(Property::empty(id, src, value_type))
    }

    /// Register a property whose callback runs when it is cleaned while dirty.
    pub fn register_property_with_clean_callback<T, F>(
        &mut self,
        id: &str,
        src: ResSourceInfo,
        default: T,
        on_clean: F,
    ) -> PropResult<PropId>
    where
        T: PropType,
        F: FnMut(&Property) + Send + 'static,
    {
        let pid = self.register_property(id, src, default)?;
        self.clean_callbacks.insert(pid.index, Box::new(on_clean));
        Ok(pid)
    }

    /// Empty counterpart of [`Self::register_property_with_clean_callback`].
    pub fn register_empty_property_with_clean_callback<F>(
        &mut self,
        id: &str,
        src: ResSourceInfo,
        value_type: ValueType,
        on_clean: F,
    ) -> PropResult<PropId>
    where
        F: FnMut(&Property) + Send + 'static,
    {
        let pid = self.register_empty_property(id, src, value_type)?;
        self.clean_callbacks.insert(pid.index, Box::new(on_clean));
        Ok(pid)
    }

    pub fn prop_id(&self, id: &str, src: ResSourceInfo) -> PropResult<PropId> {
        Ok(self.pid(self.lookup(id, src)?))
    }

    fn check_registered(&self, pid: PropId, role: &'static str) -> PropResult<()> {
        if pid.owner != self.tag || pid.index >= self.props.len() {
            return Err(PropError::Unregistered {
                id: format!("#{}", pid.index),
                role,
            });
        }
        Ok(())
    }

    /// Add a resolver reading `inputs` and writing `outputs`. Both sets must
    /// be registered on this node.
    pub fn add_property_resolver<F>(
        &mut self,
        inputs: &[PropId],
        outputs: &[PropId],
        resolver: F,
    ) -> PropResult<()>
    where
        F: FnMut(&mut ResolverCtx<'_>) -> PropResult<()> + Send + 'static,
    {
        for &pid in inputs {
            self.check_registered(pid, "input")?;
        }
        for &pid in outputs {
            self.check_registered(pid, "output")?;
        }
        self.resolvers.push(ResolverEntry {
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            func: Box::new(resolver),
        });
        Ok(())
    }

    /// Register a `tick_rate` property on every port, kept equal across ports.
    pub fn enable_tick_rate(&mut self, tick_rate: f64) -> PropResult<()> {
        let ports = self.edge_ports();
        let ids = ports
            .iter()
            .map(|&port| self.register_property(PROP_KEY_TICK_RATE, port, tick_rate))
            .collect::<PropResult<Vec<_>>>()?;
        for &src in &ids {
            let others: Vec<PropId> = ids.iter().copied().filter(|&p| p != src).collect();
            if others.is_empty() {
                continue;
            }
            let outputs = others.clone();
            self.add_property_resolver(&[src], &outputs, move |ctx| {
                for &dst in &others {
                    ctx.forward(src, dst)?;
                }
                Ok(())
            })?;
        }
        self.capabilities.insert(Capability::TickAware);
        Ok(())
    }

    /// Register an `mtu` property on every port, clamped to `mtu`.
    pub fn enable_mtu(&mut self, mtu: usize) -> PropResult<()> {
        for port in self.edge_ports() {
            let pid = self.register_property(PROP_KEY_MTU, port, mtu)?;
            self.add_property_resolver(&[pid], &[pid], move |ctx| {
                let value: usize = ctx.get(pid)?;
                ctx.set(pid, value.min(mtu))
            })?;
        }
        self.mtu_limit = Some(mtu);
        self.capabilities.insert(Capability::MtuAware);
        Ok(())
    }

    /// Choose how MTU values travel between ports; the smaller value wins.
    /// May only be called once, and only on MTU-aware nodes.
    pub fn set_mtu_forwarding_policy(&mut self, policy: ForwardingPolicy) -> PropResult<()> {
        if !self.has_capability(Capability::MtuAware) {
            return Err(PropError::Policy {
                what: format!("{} does not track MTU", self.unique_id),
            });
        }
        if self.mtu_policy_set {
            return Err(PropError::Policy {
                what: "set_mtu_forwarding_policy() can only be called once".to_string(),
            });
        }
        if !matches!(
            policy,
            ForwardingPolicy::Drop
                | ForwardingPolicy::OneToOne
                | ForwardingPolicy::OneToAll
                | ForwardingPolicy::OneToFan
        ) {
            return Err(PropError::Policy {
                what: "MTU forwarding policy can only be Drop, OneToOne, OneToAll or OneToFan"
                    .to_string(),
            });
        }
        self.mtu_policy_set = true;

        for port in self.edge_ports() {
            let dests = destinations(
                policy,
                port,
                self.num_inputs,
                self.num_outputs,
                &self.prop_fwd_map,
                "mtu",
            )?;
            if dests.is_empty() {
                continue;
            }
            let src = self.prop_id(PROP_KEY_MTU, port)?;
            let outputs = dests
                .iter()
                .map(|&d| self.prop_id(PROP_KEY_MTU, d))
                .collect::<PropResult<Vec<_>>>()?;
            let targets = outputs.clone();
            self.add_property_resolver(&[src], &outputs, move |ctx| {
                let mtu: usize = ctx.get(src)?;
                for &dst in &targets {
                    let current: usize = ctx.get(dst)?;
                    ctx.set(dst, current.min(mtu))?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn mtu_limit(&self) -> Option<usize> {
        self.mtu_limit
    }

    fn edge_ports(&self) -> Vec<ResSourceInfo> {
        (0..self.num_inputs)
            .map(ResSourceInfo::input_edge)
            .chain((0..self.num_outputs).map(ResSourceInfo::output_edge))
            .collect()
    }

    // ---- Property access ----

    /// Write without resolving. Returns `true` if the value changed.
    pub fn write_property(
        &mut self,
        id: &str,
        src: ResSourceInfo,
        value: PropValue,
    ) -> PropResult<bool> {
        let idx = self.lookup(id, src)?;
        self.props[idx].write_unlocked(value)
    }

    /// Write a property and resolve this node.
    pub fn set_property_at<T: PropType>(
        &mut self,
        id: &str,
        value: T,
        src: ResSourceInfo,
    ) -> PropResult<()> {
        self.write_property(id, src, value.into_value())?;
        self.resolve_props()?;
        self.clean_props();
        Ok(())
    }

    pub fn set_property<T: PropType>(&mut self, id: &str, value: T, instance: usize) -> PropResult<()> {
        self.set_property_at(id, value, ResSourceInfo::user(instance))
    }

    /// Resolve pending changes, then read.
    pub fn get_property_at<T: PropType>(&mut self, id: &str, src: ResSourceInfo) -> PropResult<T> {
        let idx = self.lookup(id, src)?;
        self.resolve_props()?;
        self.clean_props();
        self.props[idx].get()
    }

    pub fn get_property<T: PropType>(&mut self, id: &str, instance: usize) -> PropResult<T> {
        self.get_property_at(id, ResSourceInfo::user(instance))
    }

    /// Read the current value without resolving.
    pub fn peek_property<T: PropType>(&self, id: &str, src: ResSourceInfo) -> PropResult<T> {
        self.props[self.lookup(id, src)?].get()
    }

    pub fn property(&self, id: &str, src: ResSourceInfo) -> Option<&Property> {
        self.find(id, src).map(|idx| &self.props[idx])
    }

    /// Set USER properties from `key=value` pairs separated by commas.
    ///
    /// `key:N=value` overrides the instance. Unknown keys are skipped.
    pub fn set_properties(&mut self, assignments: &str, instance: usize) -> PropResult<()> {
        for pair in assignments.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| PropError::Malformed {
                what: format!("`{pair}' is not of the form key=value"),
            })?;
            let key = key.trim();
            let (id, inst) = match key.split_once(':') {
                Some((id, inst)) => {
                    let inst = inst.trim().parse().map_err(|_| PropError::Malformed {
                        what: format!(
                            "property id `{id}' contains a malformed instance override"
                        ),
                    })?;
                    (id, inst)
                }
                None => (key, instance),
            };
            let src = ResSourceInfo::user(inst);
            let Some(idx) = self.find(id, src) else {
                warn!(
                    node = %self.unique_id,
                    property = id,
                    "set_properties() cannot set property: no such property"
                );
                continue;
            };
            let value_type = self.props[idx].value_type();
            let parsed = value_type.parse(value).ok_or_else(|| PropError::Malformed {
                what: format!("cannot parse `{value}' as {} for `{id}'", value_type.name()),
            })?;
            self.props[idx].write_unlocked(parsed)?;
        }
        self.resolve_props()?;
        self.clean_props();
        Ok(())
    }

    pub fn props(&self) -> impl Iterator<Item = &Property> {
        self.props.iter()
    }

    /// User IDs of the USER properties.
    pub fn property_ids(&self) -> Vec<&str> {
        self.props
            .iter()
            .filter(|p| p.src().kind == SourceKind::User)
            .map(Property::id)
            .collect()
    }

    /// Dirty properties, excluding framework-owned ones.
    pub fn dirty_props(&self) -> Vec<&Property> {
        self.props
            .iter()
            .filter(|p| p.is_dirty() && p.src().kind != SourceKind::Framework)
            .collect()
    }

    pub fn edge_props(&self) -> Vec<&Property> {
        self.props.iter().filter(|p| p.src().kind.is_edge()).collect()
    }

    /// Edge properties attached to one port.
    pub fn port_props(&self, port: ResSourceInfo) -> Vec<&Property> {
        self.props.iter().filter(|p| p.src() == port).collect()
    }

    // ---- Resolution ----

    pub fn resolve_props(&mut self) -> PropResult<()> {
        run_resolution(
            &self.unique_id,
            self.tag,
            &mut self.props,
            &mut self.resolvers,
            self.max_rounds,
        )
    }

    /// Run clean callbacks for dirty properties, then mark everything clean
    /// and read-only.
    pub fn clean_props(&mut self) {
        for (idx, prop) in self.props.iter_mut().enumerate() {
            if prop.is_valid() && prop.is_dirty() {
                if let Some(cb) = self.clean_callbacks.get_mut(&idx) {
                    cb(prop);
                }
            }
            prop.mark_clean();
            prop.set_access(Access::Ro);
        }
    }

    /// Run every resolver once with its outputs locked, then clean.
    ///
    /// Failures mean inconsistent defaults; they are logged, not returned.
    pub fn init_props(&mut self) {
        for resolver in self.resolvers.iter_mut() {
            for out in &resolver.outputs {
                self.props[out.index].set_access(Access::RwLocked);
            }
            let mut ctx = ResolverCtx::new(self.tag, &mut self.props);
            let result = (resolver.func)(&mut ctx);
            for out in &resolver.outputs {
                self.props[out.index].set_access(Access::Ro);
            }
            if let Err(err) = result {
                warn!(
                    node = %self.unique_id,
                    error = %err,
                    "failed to initialize node, most likely inconsistent default values"
                );
            }
        }
        self.clean_props();
    }

    /// Accept an edge property from a neighbour arriving on `port`.
    ///
    /// The local property lives on the opposite edge kind; unknown properties
    /// are injected first. Returns `true` if the local value changed or was
    /// created.
    pub fn forward_edge_property(&mut self, incoming: &Property, port: usize) -> PropResult<bool> {
        let src = incoming.src();
        if !src.kind.is_edge() {
            return Err(PropError::Policy {
                what: format!("cannot forward non-edge property {}", incoming.describe()),
            });
        }
        let Some(value) = incoming.value() else {
            trace!(node = %self.unique_id, property = %incoming.describe(), "skipped empty edge property");
            return Ok(false);
        };
        let local_src = ResSourceInfo::new(src.kind.invert_edge(), port);
        let (idx, injected) = match self.find(incoming.id(), local_src) {
            Some(idx) => (idx, false),
            None => {
                trace!(node = %self.unique_id, property = incoming.id(), "received unknown incoming edge property");
                (self.inject_edge_property(incoming, local_src)?.index, true)
            }
        };
        let changed = self.props[idx].write_unlocked(value.clone())?;
        Ok(changed || injected)
    }

    /// Create a local copy of `blueprint` at `src` and wire it through the
    /// node per the property forwarding policy.
    pub fn inject_edge_property(
        &mut self,
        blueprint: &Property,
        src: ResSourceInfo,
    ) -> PropResult<PropId> {
        if let Some(idx) = self.find(blueprint.id(), src) {
            return Ok(self.pid(idx));
        }
        let policy = self.prop_forwarding_policy(blueprint.id());
        let dests = destinations(
            policy,
            src,
            self.num_inputs,
            self.num_outputs,
            &self.prop_fwd_map,
            "prop",
        )?;
        let pid = self.push_property(blueprint.clone_to(src))?;
        for dst in dests {
            let dst_pid = self.inject_edge_property(blueprint, dst)?;
            self.add_property_resolver(&[pid], &[dst_pid], move |ctx| ctx.forward(pid, dst_pid))?;
        }
        Ok(pid)
    }

    fn prop_forwarding_policy(&self, id: &str) -> ForwardingPolicy {
        self.prop_fwd_policies
            .get(id)
            .or_else(|| self.prop_fwd_policies.get(""))
            .copied()
            .unwrap_or_default()
    }

    /// Set the forwarding policy for property `id`; `""` sets the default.
    pub fn set_prop_forwarding_policy(&mut self, policy: ForwardingPolicy, id: &str) {
        self.prop_fwd_policies.insert(id.to_string(), policy);
    }

    pub fn set_prop_forwarding_map(&mut self, map: ForwardingMap) {
        self.prop_fwd_map = map;
    }

    // ---- Actions ----

    /// Install the handler for actions with `key`, replacing any previous one.
    pub fn register_action_handler<F>(&mut self, key: &str, handler: F)
    where
        F: FnMut(&mut ActionCtx<'_>, ResSourceInfo, &ActionRef) -> PropResult<()> + Send + 'static,
    {
        self.action_handlers.insert(key.to_string(), Box::new(handler));
    }

    /// Set the forwarding policy for actions with `key`; `""` sets the default.
    pub fn set_action_forwarding_policy(&mut self, policy: ForwardingPolicy, key: &str) {
        self.action_fwd_policies.insert(key.to_string(), policy);
    }

    pub fn set_action_forwarding_map(&mut self, map: ForwardingMap) {
        self.action_fwd_map = map;
    }

    /// Queue an action for delivery out of `edge`.
    pub fn post_action(&mut self, edge: ResSourceInfo, action: ActionRef) {
        self.outbox.push((edge, action));
    }

    pub fn take_posted_actions(&mut self) -> Vec<(ResSourceInfo, ActionRef)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn discard_posted_actions(&mut self) {
        self.outbox.clear();
    }

    /// Handle an action arriving on `src`.
    pub fn receive_action(&mut self, src: ResSourceInfo, action: &ActionRef) -> PropResult<()> {
        if let Some(handler) = self.action_handlers.get_mut(&action.key) {
            let mut ctx = ActionCtx::new(&self.unique_id, &self.props, &mut self.outbox);
            return handler(&mut ctx, src, action);
        }

        if src.kind == SourceKind::User {
            trace!(node = %self.unique_id, key = %action.key, id = action.id, "dropping USER action");
            return Ok(());
        }
        if !self.has_capability(Capability::ActionForwarding) {
            trace!(node = %self.unique_id, key = %action.key, "node does not forward actions, dropping");
            return Ok(());
        }

        let policy = self
            .action_fwd_policies
            .get(&action.key)
            .or_else(|| self.action_fwd_policies.get(""))
            .copied()
            .unwrap_or_default();
        let dests = destinations(
            policy,
            src,
            self.num_inputs,
            self.num_outputs,
            &self.action_fwd_map,
            "action",
        )?;
        if dests.is_empty() {
            trace!(node = %self.unique_id, key = %action.key, ?policy, "dropping action");
        }
        for dst in dests {
            trace!(node = %self.unique_id, key = %action.key, to = %dst, "forwarding action");
            self.post_action(dst, action.clone());
        }
        Ok(())
    }

    // ---- Command time ----

    pub fn set_command_time(&mut self, time: Time, instance: usize) {
        if self.cmd_times.len() <= instance {
            self.cmd_times.resize(instance + 1, None);
        }
        self.cmd_times[instance] = Some(time);
    }

    /// `None` means "as soon as possible".
    pub fn get_command_time(&self, instance: usize) -> Option<Time> {
        self.cmd_times.get(instance).copied().flatten()
    }

    pub fn clear_command_time(&mut self, instance: usize) {
        if let Some(slot) = self.cmd_times.get_mut(instance) {
            *slot = None;
        }
    }

    pub fn check_topology(&self, connected_inputs: &[usize], connected_outputs: &[usize]) -> bool {
        connected_inputs.iter().all(|&p| p < self.num_inputs)
            && connected_outputs.iter().all(|&p| p < self.num_outputs)
    }
}
