//! Stream terminators: the graph nodes standing in for host-side streamers.
//!
//! An [`RxStreamTerminator`] has one input port per channel and sits at the
//! end of a receive chain; a [`TxStreamTerminator`] has one output port per
//! channel and feeds a transmit chain. Both carry the per-channel edge
//! properties the data path needs and record what the device side resolves
//! them to.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use rn_core::{RnError, RnResult};
use rn_props::{
    ACTION_KEY_RX_EVENT, ACTION_KEY_STREAM_CMD, ACTION_KEY_TX_EVENT, ActionInfo, ActionPayload,
    ForwardingPolicy, Node, NodeCore, PROP_KEY_MTU, PROP_KEY_TICK_RATE, PropResult, Property,
    ResSourceInfo, RxErrorCode, SourceKind, StreamCmd, TxEventCode, ValueType,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

pub const PROP_KEY_TYPE: &str = "type";
pub const PROP_KEY_SAMP_RATE: &str = "samp_rate";
pub const PROP_KEY_SCALING: &str = "scaling";
pub const PROP_KEY_ATOMIC_ITEM_SIZE: &str = "atomic_item_size";

/// Bytes per sample of an over-the-wire format.
pub fn otw_item_size(format: &str) -> Option<usize> {
    match format {
        "fc32" => Some(8),
        "sc16" => Some(4),
        "sc12" => Some(3),
        "sc8" | "s16" => Some(2),
        "s8" => Some(1),
        _ => None,
    }
}

/// How a streamer is set up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamArgs {
    /// Over-the-wire sample format, e.g. `sc16`.
    pub otw_format: String,
    pub num_chans: usize,
    /// Largest frame the data transport can carry.
    pub max_mtu: usize,
}

impl StreamArgs {
    pub fn new(otw_format: impl Into<String>, num_chans: usize, max_mtu: usize) -> Self {
        Self {
            otw_format: otw_format.into(),
            num_chans,
            max_mtu,
        }
    }

    fn item_size(&self) -> RnResult<usize> {
        otw_item_size(&self.otw_format)
            .ok_or_else(|| RnError::value(format!("unsupported wire format `{}'", self.otw_format)))
    }
}

/// Resolved properties of one channel; `None` until the device side has
/// provided a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelParams {
    pub samp_rate: Option<f64>,
    pub scaling: Option<f64>,
    pub tick_rate: Option<f64>,
}

type SharedParams = Arc<Mutex<Vec<ChannelParams>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RxEventRecord {
    pub channel: usize,
    pub error_code: RxErrorCode,
    pub args: String,
}

/// Asynchronous message from a transmit chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAsyncMsg {
    pub channel: usize,
    pub event_code: TxEventCode,
    pub tsf: Option<u64>,
}

/// Register the per-channel edge properties on `port`.
fn register_channel(
    core: &mut NodeCore,
    port: ResSourceInfo,
    args: &StreamArgs,
    item_size: usize,
    params: &SharedParams,
) -> PropResult<()> {
    let chan = port.instance;

    let otw = args.otw_format.clone();
    let type_id = core.register_property(PROP_KEY_TYPE, port, otw.clone())?;
    core.add_property_resolver(&[type_id], &[type_id], move |ctx| {
        ctx.set(type_id, otw.clone())
    })?;

    let ais = core.register_property(PROP_KEY_ATOMIC_ITEM_SIZE, port, item_size)?;
    core.add_property_resolver(&[ais], &[ais], move |ctx| {
        let requested: usize = ctx.get(ais)?;
        ctx.set(ais, lcm(requested.max(1), item_size))
    })?;

    let recorders: [(&str, fn(&mut ChannelParams, f64)); 3] = [
        (PROP_KEY_SAMP_RATE, |p, v| p.samp_rate = Some(v)),
        (PROP_KEY_SCALING, |p, v| p.scaling = Some(v)),
        (PROP_KEY_TICK_RATE, |p, v| p.tick_rate = Some(v)),
    ];
    for (key, record) in recorders {
        let params = Arc::clone(params);
        core.register_empty_property_with_clean_callback(
            key,
            port,
            ValueType::Double,
            move |prop: &Property| {
                if let Ok(value) = prop.get::<f64>() {
                    let mut params = params.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(slot) = params.get_mut(chan) {
                        record(slot, value);
                    }
                }
            },
        )?;
    }
    Ok(())
}

fn lcm(a: usize, b: usize) -> usize {
    fn gcd(a: usize, b: usize) -> usize {
        if b == 0 { a } else { gcd(b, a % b) }
    }
    a / gcd(a, b) * b
}

/// Node shared by both terminator kinds.
fn build_core(
    unique_id: String,
    args: &StreamArgs,
    ports: impl Fn(usize) -> ResSourceInfo,
    num_inputs: usize,
    num_outputs: usize,
    params: &SharedParams,
) -> RnResult<NodeCore> {
    let item_size = args.item_size()?;
    if args.num_chans == 0 {
        return Err(RnError::value("a streamer needs at least one channel"));
    }
    let mut core = NodeCore::new(unique_id, num_inputs, num_outputs);
    core.set_prop_forwarding_policy(ForwardingPolicy::Drop, "");
    core.set_action_forwarding_policy(ForwardingPolicy::Drop, "");
    for chan in 0..args.num_chans {
        register_channel(&mut core, ports(chan), args, item_size, params)?;
    }
    core.enable_mtu(args.max_mtu)?;
    Ok(core)
}

fn channel_params(params: &SharedParams, chan: usize) -> Option<ChannelParams> {
    params
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(chan)
        .copied()
}

/// Receive-side terminator.
pub struct RxStreamTerminator {
    core: NodeCore,
    args: StreamArgs,
    params: SharedParams,
    events: Arc<Mutex<VecDeque<RxEventRecord>>>,
    shut_down: bool,
}

impl RxStreamTerminator {
    pub fn new(unique_id: impl Into<String>, args: StreamArgs) -> RnResult<Self> {
        let params: SharedParams = Arc::new(Mutex::new(vec![ChannelParams::default(); args.num_chans]));
        let mut core = build_core(
            unique_id.into(),
            &args,
            ResSourceInfo::input_edge,
            args.num_chans,
            0,
            &params,
        )?;

        let num_chans = args.num_chans;
        core.register_action_handler(ACTION_KEY_STREAM_CMD, move |ctx, src, action| {
            if src.kind != SourceKind::User {
                warn!(node = ctx.node_id(), %src, "stream command arriving from the device side, dropping");
                return Ok(());
            }
            if src.instance >= num_chans {
                warn!(node = ctx.node_id(), chan = src.instance, "stream command for an unknown channel");
                return Ok(());
            }
            trace!(node = ctx.node_id(), chan = src.instance, "issuing stream command");
            ctx.post_action(ResSourceInfo::input_edge(src.instance), Arc::clone(action));
            Ok(())
        });

        let events: Arc<Mutex<VecDeque<RxEventRecord>>> = Arc::default();
        let sink = Arc::clone(&events);
        core.register_action_handler(ACTION_KEY_RX_EVENT, move |ctx, src, action| {
            let ActionPayload::RxEvent { error_code, args } = &action.kind else {
                warn!(node = ctx.node_id(), id = action.id, "rx_event without an event payload");
                return Ok(());
            };
            debug!(node = ctx.node_id(), chan = src.instance, ?error_code, "rx event");
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(RxEventRecord {
                    channel: src.instance,
                    error_code: *error_code,
                    args: args.clone(),
                });
            Ok(())
        });

        Ok(Self {
            core,
            args,
            params,
            events,
            shut_down: false,
        })
    }

    pub fn args(&self) -> &StreamArgs {
        &self.args
    }

    pub fn num_channels(&self) -> usize {
        self.args.num_chans
    }

    pub fn channel(&self, chan: usize) -> Option<ChannelParams> {
        channel_params(&self.params, chan)
    }

    /// MTU agreed with the upstream block.
    pub fn mtu(&self, chan: usize) -> RnResult<usize> {
        Ok(self
            .core
            .peek_property(PROP_KEY_MTU, ResSourceInfo::input_edge(chan))?)
    }

    pub fn atomic_item_size(&self, chan: usize) -> RnResult<usize> {
        Ok(self
            .core
            .peek_property(PROP_KEY_ATOMIC_ITEM_SIZE, ResSourceInfo::input_edge(chan))?)
    }

    /// Queue a stream command for `chan`; it leaves once the graph flushes
    /// this node's actions.
    pub fn issue_stream_cmd(&mut self, chan: usize, cmd: StreamCmd) -> RnResult<()> {
        if chan >= self.args.num_chans {
            return Err(RnError::lookup(format!(
                "{} has no channel {chan}",
                self.core.unique_id()
            )));
        }
        self.core
            .post_action(ResSourceInfo::input_edge(chan), ActionInfo::stream_cmd(cmd));
        Ok(())
    }

    pub fn take_events(&self) -> Vec<RxEventRecord> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Node for RxStreamTerminator {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn shutdown(&mut self) {
        debug!(node = self.core.unique_id(), "rx streamer shut down");
        self.core.discard_posted_actions();
        self.shut_down = true;
    }
}

/// Transmit-side terminator.
pub struct TxStreamTerminator {
    core: NodeCore,
    args: StreamArgs,
    params: SharedParams,
    async_msgs: Arc<Mutex<VecDeque<TxAsyncMsg>>>,
    shut_down: bool,
}

impl TxStreamTerminator {
    pub fn new(unique_id: impl Into<String>, args: StreamArgs) -> RnResult<Self> {
        let params: SharedParams = Arc::new(Mutex::new(vec![ChannelParams::default(); args.num_chans]));
        let mut core = build_core(
            unique_id.into(),
            &args,
            ResSourceInfo::output_edge,
            0,
            args.num_chans,
            &params,
        )?;

        let async_msgs: Arc<Mutex<VecDeque<TxAsyncMsg>>> = Arc::default();
        let sink = Arc::clone(&async_msgs);
        core.register_action_handler(ACTION_KEY_TX_EVENT, move |ctx, src, action| {
            let ActionPayload::TxEvent { event_code, tsf } = action.kind else {
                warn!(node = ctx.node_id(), id = action.id, "tx_event without an event payload");
                return Ok(());
            };
            debug!(node = ctx.node_id(), chan = src.instance, ?event_code, "tx event");
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(TxAsyncMsg {
                    channel: src.instance,
                    event_code,
                    tsf,
                });
            Ok(())
        });

        Ok(Self {
            core,
            args,
            params,
            async_msgs,
            shut_down: false,
        })
    }

    pub fn args(&self) -> &StreamArgs {
        &self.args
    }

    pub fn num_channels(&self) -> usize {
        self.args.num_chans
    }

    pub fn channel(&self, chan: usize) -> Option<ChannelParams> {
        channel_params(&self.params, chan)
    }

    pub fn mtu(&self, chan: usize) -> RnResult<usize> {
        Ok(self
            .core
            .peek_property(PROP_KEY_MTU, ResSourceInfo::output_edge(chan))?)
    }

    pub fn atomic_item_size(&self, chan: usize) -> RnResult<usize> {
        Ok(self
            .core
            .peek_property(PROP_KEY_ATOMIC_ITEM_SIZE, ResSourceInfo::output_edge(chan))?)
    }

    /// Oldest pending async message, if any.
    pub fn recv_async_msg(&self) -> Option<TxAsyncMsg> {
        self.async_msgs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Node for TxStreamTerminator {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn shutdown(&mut self) {
        debug!(node = self.core.unique_id(), "tx streamer shut down");
        self.shut_down = true;
    }
}
