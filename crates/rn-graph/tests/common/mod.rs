//! Mock nodes shared by the graph integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rn_core::{RnError, RnResult, SepAddr, SepId};
use rn_props::{
    ACTION_KEY_STREAM_CMD, ActionInfo, ActionRef, ForwardingMap, ForwardingPolicy, Node, NodeCore,
    ResSourceInfo, RxErrorCode, SourceKind,
};
use rn_xport::{MgmtPortal, Transport};

pub const MAX_DECIM: i64 = 512;
pub const DEFAULT_RATE: f64 = 1e9;

pub type Arena = BTreeMap<String, Box<dyn Node>>;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub fn arena<I>(nodes: I) -> Arena
where
    I: IntoIterator<Item = Box<dyn Node>>,
{
    nodes
        .into_iter()
        .map(|n| (n.unique_id().to_string(), n))
        .collect()
}

pub fn peek<T: rn_props::PropType>(arena: &Arena, node: &str, id: &str, src: ResSourceInfo) -> T {
    arena[node].core().peek_property(id, src).unwrap()
}

// ---- Radio ----

/// Full duplex radio with two master clock rates, 100e6 and 200e6. Both edge
/// rates are pinned to the master clock rate; RSSI is re-read on every
/// resolution.
pub struct MockRadio {
    core: NodeCore,
    pub rssi_count: Arc<AtomicUsize>,
    pub last_num_samps: Arc<AtomicU64>,
}

impl MockRadio {
    pub fn new(id: &str) -> Self {
        let rssi_count = Arc::new(AtomicUsize::new(0));
        let last_num_samps = Arc::new(AtomicU64::new(0));
        let mut core = NodeCore::new(id, 1, 1);
        let rate_in = core
            .register_property("samp_rate", ResSourceInfo::input_edge(0), 200e6)
            .unwrap();
        let rate_out = core
            .register_property("samp_rate", ResSourceInfo::output_edge(0), 200e6)
            .unwrap();
        let mcr = core
            .register_property("master_clock_rate", ResSourceInfo::user(0), 200e6)
            .unwrap();
        let rssi = core
            .register_property("rssi", ResSourceInfo::user(0), 0.0_f64)
            .unwrap();

        core.add_property_resolver(&[rate_in], &[rate_in], move |ctx| {
            let rate: f64 = ctx.get(mcr)?;
            ctx.set(rate_in, rate)
        })
        .unwrap();
        core.add_property_resolver(&[rate_out], &[rate_out], move |ctx| {
            let rate: f64 = ctx.get(mcr)?;
            ctx.set(rate_out, rate)
        })
        .unwrap();
        core.add_property_resolver(&[mcr], &[mcr, rate_in, rate_out], move |ctx| {
            let requested: f64 = ctx.get(mcr)?;
            let coerced = if requested > 150e6 { 200e6 } else { 100e6 };
            ctx.set(mcr, coerced)?;
            ctx.set(rate_in, coerced)?;
            ctx.set(rate_out, coerced)
        })
        .unwrap();
        let always_dirty = core.always_dirty();
        let count = Arc::clone(&rssi_count);
        core.add_property_resolver(&[always_dirty], &[rssi], move |ctx| {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.set(rssi, n as f64)
        })
        .unwrap();

        core.set_action_forwarding_policy(ForwardingPolicy::Drop, "");
        let last = Arc::clone(&last_num_samps);
        core.register_action_handler(ACTION_KEY_STREAM_CMD, move |_ctx, _src, action| {
            if let Some(cmd) = action.as_stream_cmd() {
                if cmd.is_finite() {
                    last.store(cmd.num_samps, Ordering::SeqCst);
                }
            }
            Ok(())
        });
        Self {
            core,
            rssi_count,
            last_num_samps,
        }
    }

    pub fn generate_overrun(&mut self, chan: usize) {
        self.core.post_action(
            ResSourceInfo::output_edge(chan),
            ActionInfo::rx_event(RxErrorCode::Overflow),
        );
    }
}

impl Node for MockRadio {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }
}

// ---- DDC ----

/// Even decimations or 1, up to [`MAX_DECIM`].
pub fn coerce_decim(requested: i64) -> i64 {
    if requested <= 1 {
        return 1;
    }
    (requested - requested % 2).min(MAX_DECIM)
}

/// Single channel DDC keeping input rate, output rate and decimation
/// consistent. Finite stream commands are scaled by the decimation.
pub fn mock_ddc(id: &str) -> NodeCore {
    let mut node = NodeCore::new(id, 1, 1);
    let rate_in = node
        .register_property("samp_rate", ResSourceInfo::input_edge(0), DEFAULT_RATE)
        .unwrap();
    let rate_out = node
        .register_property("samp_rate", ResSourceInfo::output_edge(0), DEFAULT_RATE)
        .unwrap();
    let decim = node
        .register_property("decim", ResSourceInfo::user(0), 1_i64)
        .unwrap();

    node.add_property_resolver(&[decim], &[decim, rate_out], move |ctx| {
        let d = coerce_decim(ctx.get(decim)?);
        ctx.set(decim, d)?;
        let rate: f64 = ctx.get(rate_in)?;
        ctx.set(rate_out, rate / d as f64)
    })
    .unwrap();
    node.add_property_resolver(&[rate_in], &[decim, rate_out], move |ctx| {
        let (rin, rout): (f64, f64) = (ctx.get(rate_in)?, ctx.get(rate_out)?);
        let d = coerce_decim((rin / rout) as i64);
        ctx.set(decim, d)?;
        ctx.set(rate_out, rin / d as f64)
    })
    .unwrap();
    node.add_property_resolver(&[rate_out], &[decim, rate_in], move |ctx| {
        let (rin, rout): (f64, f64) = (ctx.get(rate_in)?, ctx.get(rate_out)?);
        let d = coerce_decim((rin / rout) as i64);
        ctx.set(decim, d)?;
        ctx.set(rate_in, rout * d as f64)
    })
    .unwrap();

    node.register_action_handler(ACTION_KEY_STREAM_CMD, |ctx, src, action| {
        let decim: i64 = ctx.get_property("decim", ResSourceInfo::user(0))?;
        let Some(cmd) = action.as_stream_cmd() else {
            return Ok(());
        };
        let mut cmd = cmd.clone();
        if cmd.is_finite() {
            if src.kind == SourceKind::OutputEdge {
                cmd.num_samps *= decim as u64;
            } else {
                cmd.num_samps /= decim as u64;
            }
        }
        ctx.post_action(src.inverted(), ActionInfo::stream_cmd(cmd));
        Ok(())
    });
    node
}

// ---- Pass-through nodes ----

/// Forwards properties and actions port by port.
pub fn mock_fifo(id: &str, ports: usize) -> NodeCore {
    let mut node = NodeCore::new(id, ports, ports);
    node.set_prop_forwarding_policy(ForwardingPolicy::OneToOne, "");
    node.set_action_forwarding_policy(ForwardingPolicy::OneToOne, "");
    node
}

/// Drops everything unless a map is installed.
pub fn mock_router(id: &str, inputs: usize, outputs: usize, prop_map: Option<ForwardingMap>) -> NodeCore {
    let mut node = NodeCore::new(id, inputs, outputs);
    node.set_action_forwarding_policy(ForwardingPolicy::Drop, "");
    match prop_map {
        Some(map) => {
            node.set_prop_forwarding_policy(ForwardingPolicy::UseMap, "");
            node.set_prop_forwarding_map(map);
        }
        None => node.set_prop_forwarding_policy(ForwardingPolicy::Drop, ""),
    }
    node
}

/// Received actions per arrival edge.
pub type ActionLog = Arc<Mutex<Vec<(ResSourceInfo, ActionRef)>>>;

/// One integer edge property `prop` per port; logs actions keyed `action`.
pub struct MockEdgeNode {
    core: NodeCore,
    pub received: ActionLog,
}

impl MockEdgeNode {
    pub fn new(id: &str, inputs: usize, outputs: usize) -> Self {
        let mut core = NodeCore::new(id, inputs, outputs);
        core.set_action_forwarding_policy(ForwardingPolicy::OneToOne, "");
        for i in 0..inputs {
            core.register_property("prop", ResSourceInfo::input_edge(i), 0_i64)
                .unwrap();
        }
        for i in 0..outputs {
            core.register_property("prop", ResSourceInfo::output_edge(i), 0_i64)
                .unwrap();
        }
        let received: ActionLog = Arc::default();
        let log = Arc::clone(&received);
        core.register_action_handler("action", move |_ctx, src, action| {
            log.lock().unwrap().push((src, Arc::clone(action)));
            Ok(())
        });
        Self { core, received }
    }

    pub fn received_on(&self, src: ResSourceInfo) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == src)
            .count()
    }
}

impl Node for MockEdgeNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }
}

/// Sink for stream data; logs every action whose key is in `keys`.
pub struct MockTerminator {
    core: NodeCore,
    pub received: ActionLog,
}

impl MockTerminator {
    pub fn new(id: &str, ports: usize, keys: &[&str]) -> Self {
        let mut core = NodeCore::new(id, ports, ports);
        core.set_prop_forwarding_policy(ForwardingPolicy::Drop, "");
        core.set_action_forwarding_policy(ForwardingPolicy::Drop, "");
        let received: ActionLog = Arc::default();
        for key in keys {
            let log = Arc::clone(&received);
            core.register_action_handler(key, move |_ctx, src, action| {
                log.lock().unwrap().push((src, Arc::clone(action)));
                Ok(())
            });
        }
        Self { core, received }
    }
}

impl Node for MockTerminator {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }
}

/// A node whose output `type` is pinned to `value`.
pub fn pinned_type_source(id: &str, value: &str) -> NodeCore {
    let mut node = NodeCore::new(id, 0, 1);
    let ty = node
        .register_property("type", ResSourceInfo::output_edge(0), value.to_string())
        .unwrap();
    let value = value.to_string();
    node.add_property_resolver(&[ty], &[ty], move |ctx| ctx.set(ty, value.clone()))
        .unwrap();
    node
}

/// A node whose input `type` is pinned to `value`, or follows upstream if
/// `None`.
pub fn type_sink(id: &str, value: Option<&str>) -> NodeCore {
    let mut node = NodeCore::new(id, 1, 0);
    let ty = node
        .register_property(
            "type",
            ResSourceInfo::input_edge(0),
            value.unwrap_or("s8").to_string(),
        )
        .unwrap();
    if let Some(value) = value {
        let value = value.to_string();
        node.add_property_resolver(&[ty], &[ty], move |ctx| ctx.set(ty, value.clone()))
            .unwrap();
    }
    node
}

// ---- Management portal ----

/// Records handshakes and routes; optionally refuses one route.
#[derive(Default)]
pub struct CountingPortal {
    pub inits: Mutex<Vec<(SepAddr, SepId)>>,
    pub registers: AtomicUsize,
    pub routes: Mutex<Vec<(SepId, SepId)>>,
    pub refuse_routes: Mutex<bool>,
}

impl CountingPortal {
    pub fn inits_for(&self, addr: SepAddr) -> usize {
        self.inits
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| *a == addr)
            .count()
    }
}

impl MgmtPortal for CountingPortal {
    fn initialize_endpoint(&self, _: &dyn Transport, addr: SepAddr, epid: SepId) -> RnResult<()> {
        self.inits.lock().unwrap().push((addr, epid));
        Ok(())
    }

    fn register_endpoint(&self, _: SepAddr, _: SepId) -> RnResult<()> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn setup_remote_route(&self, _: &dyn Transport, src: SepId, dst: SepId) -> RnResult<()> {
        if *self.refuse_routes.lock().unwrap() {
            return Err(RnError::routing(format!("no path from {src} to {dst}")));
        }
        self.routes.lock().unwrap().push((src, dst));
        Ok(())
    }
}
