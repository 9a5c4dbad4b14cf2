//! Control-port endpoint: register peeks and pokes over control packets.
//!
//! Requests are credit-limited against the responder's command buffer. The
//! responder answers in request order, so a response for a newer request
//! means every older outstanding one was lost.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rn_config::CtrlSettings;
use rn_core::{ClockIface, RnError, RnResult, SepId, Time, to_ticks};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::ctrl_payload::{CtrlOpcode, CtrlPayload, CtrlStatus};

/// Words reserved in the responder's buffer per outstanding async message.
pub const ASYNC_MESSAGE_SIZE: usize = 6;

const SEQ_MODULUS: u8 = 64;

/// Transmits one control payload, failing if it cannot go out in time.
pub type SendFn = Arc<dyn Fn(&CtrlPayload, Duration) -> RnResult<()> + Send + Sync>;
/// Decides whether an async message `(address, data)` is acceptable.
pub type AsyncMsgValidator = Arc<dyn Fn(u32, &[u32]) -> bool + Send + Sync>;
/// Consumes an accepted async message `(address, data, timestamp)`.
pub type AsyncMsgHandler = Arc<dyn Fn(u32, &[u32], Option<u64>) -> RnResult<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct CtrlportParams {
    pub my_epid: SepId,
    pub local_port: u16,
    /// Responder command buffer size in 32-bit words.
    pub buff_capacity: usize,
    pub max_outstanding_async_msgs: usize,
    pub timeout: Duration,
    /// Used instead of `timeout` while a timed command is outstanding.
    pub massive_timeout: Duration,
}

impl CtrlportParams {
    pub fn from_config(my_epid: SepId, local_port: u16, cfg: &CtrlSettings) -> Self {
        Self {
            my_epid,
            local_port,
            buff_capacity: cfg.buff_capacity_words,
            max_outstanding_async_msgs: cfg.max_outstanding_async_msgs,
            timeout: cfg.timeout(),
            massive_timeout: cfg.massive_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrlportStats {
    pub ctrl_packets_sent: u64,
    pub ack_packets_received: u64,
    /// Words currently held in the responder's buffer.
    pub buffer_fullness: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RespStatus {
    Valid,
    Dropped,
    SizeErr,
}

#[derive(Debug)]
struct Pending {
    request: CtrlPayload,
    size: usize,
    /// Someone is blocked on the response.
    waiting: bool,
}

#[derive(Debug, Clone, Copy)]
struct Policy {
    timeout: Duration,
    force_acks: bool,
}

struct State {
    seq_num: u8,
    occupied: usize,
    pending: VecDeque<Pending>,
    responses: HashMap<u8, (CtrlPayload, RespStatus)>,
    policy: Policy,
    validator: Option<AsyncMsgValidator>,
    handler: Option<AsyncMsgHandler>,
    stats: CtrlportStats,
}

impl State {
    fn timed_in_queue(&self) -> bool {
        self.pending.iter().any(|p| p.request.timestamp.is_some())
    }

    fn release(&mut self, size: usize) {
        self.occupied = self.occupied.saturating_sub(size);
    }
}

pub struct CtrlportEndpoint {
    params: CtrlportParams,
    send_fn: SendFn,
    ctrl_clk: Arc<ClockIface>,
    timebase_clk: Arc<ClockIface>,
    /// Serializes sequence number assignment with transmission.
    send_lock: Mutex<()>,
    state: Mutex<State>,
    buff_free: Condvar,
    resp_ready: Condvar,
}

impl std::fmt::Debug for CtrlportEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrlportEndpoint")
            .field("params", &self.params)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl CtrlportEndpoint {
    pub fn new(
        send_fn: SendFn,
        params: CtrlportParams,
        ctrl_clk: Arc<ClockIface>,
        timebase_clk: Arc<ClockIface>,
    ) -> Self {
        let policy = Policy {
            timeout: params.timeout,
            force_acks: false,
        };
        Self {
            params,
            send_fn,
            ctrl_clk,
            timebase_clk,
            send_lock: Mutex::new(()),
            state: Mutex::new(State {
                seq_num: 0,
                occupied: 0,
                pending: VecDeque::new(),
                responses: HashMap::new(),
                policy,
                validator: None,
                handler: None,
                stats: CtrlportStats::default(),
            }),
            buff_free: Condvar::new(),
            resp_ready: Condvar::new(),
        }
    }

    pub fn my_epid(&self) -> SepId {
        self.params.my_epid
    }

    pub fn local_port(&self) -> u16 {
        self.params.local_port
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> CtrlportStats {
        let state = self.lock();
        CtrlportStats {
            buffer_fullness: state.occupied,
            ..state.stats
        }
    }

    /// Write one register.
    pub fn poke32(&self, addr: u32, data: u32, timestamp: Option<Time>, ack: bool) -> RnResult<()> {
        let sent = self.send_request(CtrlOpcode::Write, addr, vec![data], timestamp, ack)?;
        self.finish(sent)
    }

    /// Write several registers; only the first write is timed and only the
    /// last one is acknowledged.
    pub fn multi_poke32(
        &self,
        addrs: &[u32],
        data: &[u32],
        timestamp: Option<Time>,
        ack: bool,
    ) -> RnResult<()> {
        if addrs.len() != data.len() {
            return Err(RnError::value(format!(
                "multi_poke32: {} addresses but {} data words",
                addrs.len(),
                data.len()
            )));
        }
        let last = addrs.len().saturating_sub(1);
        for (i, (&addr, &word)) in addrs.iter().zip(data).enumerate() {
            let ts = if i == 0 { timestamp } else { None };
            self.poke32(addr, word, ts, ack && i == last)?;
        }
        Ok(())
    }

    /// Write consecutive registers starting at `first_addr`.
    pub fn block_poke32(
        &self,
        first_addr: u32,
        data: &[u32],
        timestamp: Option<Time>,
        ack: bool,
    ) -> RnResult<()> {
        let addrs: Vec<u32> = (0..data.len() as u32)
            .map(|i| first_addr.wrapping_add(4 * i))
            .collect();
        self.multi_poke32(&addrs, data, timestamp, ack)
    }

    /// Read one register; blocks until the response or the timeout.
    pub fn peek32(&self, addr: u32, timestamp: Option<Time>) -> RnResult<u32> {
        let (request, _) = self.send_request(CtrlOpcode::Read, addr, vec![0], timestamp, true)?;
        let response = self.wait_for_ack(&request)?;
        Ok(response.data[0])
    }

    pub fn block_peek32(
        &self,
        first_addr: u32,
        length: usize,
        timestamp: Option<Time>,
    ) -> RnResult<Vec<u32>> {
        (0..length as u32)
            .map(|i| {
                let ts = if i == 0 { timestamp } else { None };
                self.peek32(first_addr.wrapping_add(4 * i), ts)
            })
            .collect()
    }

    /// Have the responder poll `addr` until `(value & mask) == data` or
    /// `timeout` (in timebase time) elapses.
    pub fn poll32(
        &self,
        addr: u32,
        data: u32,
        mask: u32,
        timeout: Time,
        timestamp: Option<Time>,
        ack: bool,
    ) -> RnResult<()> {
        let ticks = self.ticks_u32(timeout)?;
        let sent = self.send_request(
            CtrlOpcode::Poll,
            addr,
            vec![data, mask, ticks],
            timestamp,
            ack,
        )?;
        self.finish(sent)
    }

    /// Delay execution of subsequent commands by `duration`.
    pub fn sleep(&self, duration: Time, ack: bool) -> RnResult<()> {
        let ticks = self.ticks_u32(duration)?;
        let sent = self.send_request(CtrlOpcode::Sleep, 0, vec![ticks], None, ack)?;
        self.finish(sent)
    }

    /// Apply a named policy with `key=value` arguments.
    ///
    /// Only `default` is supported: `timeout` (seconds) and `force_acks`.
    pub fn set_policy(&self, name: &str, args: &str) -> RnResult<()> {
        if name != "default" {
            return Err(RnError::value(format!(
                "control policy `{name}' is not implemented"
            )));
        }
        let mut policy = Policy {
            timeout: self.params.timeout,
            force_acks: false,
        };
        for arg in args.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| RnError::value(format!("malformed policy argument `{arg}'")))?;
            match key.trim() {
                "timeout" => {
                    let secs: f64 = value.trim().parse().map_err(|_| {
                        RnError::value(format!("invalid policy timeout `{value}'"))
                    })?;
                    policy.timeout = Duration::try_from_secs_f64(secs).map_err(|_| {
                        RnError::value(format!("invalid policy timeout `{value}'"))
                    })?;
                }
                "force_acks" => {
                    policy.force_acks = matches!(value.trim(), "1" | "true");
                }
                other => warn!(key = other, "ignoring unknown control policy argument"),
            }
        }
        debug!(
            epid = %self.params.my_epid,
            timeout_s = policy.timeout.as_secs_f64(),
            force_acks = policy.force_acks,
            "control policy updated"
        );
        self.lock().policy = policy;
        Ok(())
    }

    pub fn register_async_msg_validator(
        &self,
        validator: impl Fn(u32, &[u32]) -> bool + Send + Sync + 'static,
    ) {
        self.lock().validator = Some(Arc::new(validator));
    }

    pub fn register_async_msg_handler(
        &self,
        handler: impl Fn(u32, &[u32], Option<u64>) -> RnResult<()> + Send + Sync + 'static,
    ) {
        self.lock().handler = Some(Arc::new(handler));
    }

    /// Process one inbound control packet, response or request.
    ///
    /// Never fails: anomalies are logged and the packet discarded.
    pub fn handle_recv(&self, rx: &CtrlPayload) {
        if rx.is_ack {
            self.handle_response(rx);
        } else {
            self.handle_async_msg(rx);
        }
    }

    fn handle_response(&self, rx: &CtrlPayload) {
        let mut state = self.lock();
        state.stats.ack_packets_received += 1;
        let Some(front_seq) = state.pending.front().map(|p| p.request.seq_num) else {
            warn!(seq = rx.seq_num, addr = rx.address, "response with no outstanding request");
            return;
        };
        let behind = usize::from(rx.seq_num.wrapping_sub(front_seq) % SEQ_MODULUS);
        if behind >= usize::from(SEQ_MODULUS / 2) || behind >= state.pending.len() {
            warn!(
                seq = rx.seq_num,
                expected = front_seq,
                "discarding response with no matching request"
            );
            return;
        }
        for _ in 0..behind {
            if let Some(lost) = state.pending.pop_front() {
                warn!(
                    seq = lost.request.seq_num,
                    addr = lost.request.address,
                    "response dropped"
                );
                state.release(lost.size);
                if lost.waiting {
                    let mut resp = lost.request.clone();
                    resp.is_ack = true;
                    state
                        .responses
                        .insert(lost.request.seq_num, (resp, RespStatus::Dropped));
                }
            }
        }
        if let Some(req) = state.pending.pop_front() {
            state.release(req.size);
            let status = if req.size == rx.size_words() {
                RespStatus::Valid
            } else {
                RespStatus::SizeErr
            };
            trace!(seq = rx.seq_num, addr = rx.address, "response received");
            if req.waiting {
                state.responses.insert(rx.seq_num, (rx.clone(), status));
            }
        }
        drop(state);
        self.buff_free.notify_all();
        self.resp_ready.notify_all();
    }

    fn handle_async_msg(&self, rx: &CtrlPayload) {
        let (validator, handler, timeout) = {
            let state = self.lock();
            (
                state.validator.clone(),
                state.handler.clone(),
                state.policy.timeout,
            )
        };
        let status = if !matches!(rx.op_code, CtrlOpcode::Write | CtrlOpcode::BlockWrite) {
            error!(op = ?rx.op_code, "malformed async message: invalid opcode");
            CtrlStatus::CmdErr
        } else if rx.dst_port != self.params.local_port {
            error!(
                port = rx.dst_port,
                local_port = self.params.local_port,
                "malformed async message: invalid port"
            );
            CtrlStatus::CmdErr
        } else if rx.data.is_empty() {
            error!("malformed async message: no data");
            CtrlStatus::CmdErr
        } else if !validator.is_none_or(|v| v(rx.address, &rx.data)) {
            error!(addr = rx.address, "async message rejected by validator");
            CtrlStatus::CmdErr
        } else {
            CtrlStatus::Okay
        };

        // Space for async responses is reserved up front, no credits needed.
        let mut ack = rx.clone();
        ack.is_ack = true;
        ack.src_epid = self.params.my_epid;
        ack.status = status;
        if let Err(err) = (self.send_fn)(&ack, timeout) {
            error!(error = %err, "failed to acknowledge async message");
            return;
        }
        if status == CtrlStatus::Okay {
            if let Some(handler) = handler {
                if let Err(err) = handler(rx.address, &rx.data, rx.timestamp) {
                    error!(addr = rx.address, error = %err, "async message handler failed");
                }
            }
        }
    }

    fn ticks(&self, t: Time) -> RnResult<u64> {
        if !self.timebase_clk.is_running() {
            return Err(RnError::runtime(format!(
                "timebase clock `{}' is not running",
                self.timebase_clk.name()
            )));
        }
        Ok(to_ticks(t, self.timebase_clk.freq()))
    }

    /// Durations carried in a single payload word.
    fn ticks_u32(&self, t: Time) -> RnResult<u32> {
        let ticks = self.ticks(t)?;
        u32::try_from(ticks).map_err(|_| {
            RnError::value(format!(
                "duration of {ticks} timebase ticks does not fit in 32 bits"
            ))
        })
    }

    fn finish(&self, (request, waiting): (CtrlPayload, bool)) -> RnResult<()> {
        if waiting {
            self.wait_for_ack(&request)?;
        }
        Ok(())
    }

    fn send_request(
        &self,
        op_code: CtrlOpcode,
        address: u32,
        data: Vec<u32>,
        timestamp: Option<Time>,
        ack: bool,
    ) -> RnResult<(CtrlPayload, bool)> {
        if !self.ctrl_clk.is_running() {
            return Err(RnError::runtime(format!(
                "control clock `{}' is not running",
                self.ctrl_clk.name()
            )));
        }
        let timestamp = timestamp.map(|t| self.ticks(t)).transpose()?;

        let _sending = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.lock();
        let mut request = CtrlPayload::request(op_code, address, data);
        request.dst_port = self.params.local_port;
        request.src_port = self.params.local_port;
        request.src_epid = self.params.my_epid;
        request.seq_num = state.seq_num;
        request.timestamp = timestamp;

        let size = request.size_words();
        let limit = self
            .params
            .buff_capacity
            .saturating_sub(ASYNC_MESSAGE_SIZE * self.params.max_outstanding_async_msgs);
        if size > limit {
            return Err(RnError::value(format!(
                "control request of {size} words can never fit a {limit} word command buffer"
            )));
        }
        if state.occupied + size > limit {
            let timeout = if state.timed_in_queue() {
                self.params.massive_timeout
            } else {
                state.policy.timeout
            };
            let deadline = Instant::now() + timeout;
            while state.occupied + size > limit {
                let now = Instant::now();
                if now >= deadline {
                    return Err(RnError::timeout(
                        format!("waiting for space in command buffer for 0x{address:08X}"),
                        timeout,
                    ));
                }
                state = self
                    .buff_free
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }

        let waiting = ack || state.policy.force_acks;
        state.occupied += size;
        state.pending.push_back(Pending {
            request: request.clone(),
            size,
            waiting,
        });
        state.seq_num = (state.seq_num + 1) % SEQ_MODULUS;
        let send_timeout = state.policy.timeout;
        drop(state);

        // A synchronous responder may call back into `handle_recv` from here.
        if let Err(err) = (self.send_fn)(&request, send_timeout) {
            let mut state = self.lock();
            if let Some(pos) = state
                .pending
                .iter()
                .position(|p| p.request.seq_num == request.seq_num)
            {
                if let Some(p) = state.pending.remove(pos) {
                    state.release(p.size);
                }
            }
            drop(state);
            self.buff_free.notify_all();
            return Err(err);
        }
        self.lock().stats.ctrl_packets_sent += 1;
        Ok((request, waiting))
    }

    fn wait_for_ack(&self, request: &CtrlPayload) -> RnResult<CtrlPayload> {
        let mut state = self.lock();
        let timeout = if state.timed_in_queue() {
            self.params.massive_timeout
        } else {
            state.policy.timeout
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((resp, status)) = state.responses.remove(&request.seq_num) {
                if resp.op_code != request.op_code || resp.address != request.address {
                    warn!(
                        seq = resp.seq_num,
                        addr = resp.address,
                        "response does not match its request, discarding"
                    );
                } else {
                    drop(state);
                    return Self::check_response(request, resp, status);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                if let Some(p) = state
                    .pending
                    .iter_mut()
                    .find(|p| p.request.seq_num == request.seq_num)
                {
                    p.waiting = false;
                }
                return Err(RnError::timeout(
                    format!(
                        "waiting for ACK of {:?} at 0x{:08X}",
                        request.op_code, request.address
                    ),
                    timeout,
                ));
            }
            state = self
                .resp_ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn check_response(
        request: &CtrlPayload,
        resp: CtrlPayload,
        status: RespStatus,
    ) -> RnResult<CtrlPayload> {
        let addr = request.address;
        match resp.status {
            CtrlStatus::CmdErr => {
                return Err(RnError::op(format!(
                    "control operation at 0x{addr:08X} returned a failing status"
                )));
            }
            CtrlStatus::TsErr => {
                return Err(RnError::op(format!(
                    "control operation at 0x{addr:08X} returned a timestamp error"
                )));
            }
            CtrlStatus::Warning => {
                warn!(addr, "control operation completed with a warning");
            }
            CtrlStatus::Okay => {}
        }
        match status {
            RespStatus::Dropped => {
                return Err(RnError::op(format!(
                    "response for control operation at 0x{addr:08X} was dropped"
                )));
            }
            RespStatus::SizeErr => {
                return Err(RnError::op(format!(
                    "response for control operation at 0x{addr:08X} has the wrong size"
                )));
            }
            RespStatus::Valid => {}
        }
        if resp.data.is_empty() {
            return Err(RnError::op(format!(
                "control operation at 0x{addr:08X} returned a malformed response"
            )));
        }
        Ok(resp)
    }
}
