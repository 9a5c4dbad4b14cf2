//! Actions: one-shot messages travelling along graph edges.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::PropResult;
use crate::property::{PropType, Property, ResSourceInfo};

pub const ACTION_KEY_STREAM_CMD: &str = "stream_cmd";
pub const ACTION_KEY_RX_EVENT: &str = "rx_event";
pub const ACTION_KEY_TX_EVENT: &str = "tx_event";
pub const ACTION_KEY_RX_RESTART_REQ: &str = "restart_request";

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle; an action is forwarded unchanged from hop to hop.
pub type ActionRef = Arc<ActionInfo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMode {
    StartContinuous,
    StopContinuous,
    NumSampsAndDone,
    NumSampsAndMore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCmd {
    pub mode: StreamMode,
    pub num_samps: u64,
    pub stream_now: bool,
    /// Start time in timebase ticks when not streaming now.
    pub time_ticks: Option<u64>,
}

impl StreamCmd {
    pub fn new(mode: StreamMode) -> Self {
        Self {
            mode,
            num_samps: 0,
            stream_now: true,
            time_ticks: None,
        }
    }

    pub fn num_samps(mode: StreamMode, num_samps: u64) -> Self {
        Self {
            num_samps,
            ..Self::new(mode)
        }
    }

    /// True for the finite modes whose sample count scales with rate changes.
    pub fn is_finite(&self) -> bool {
        matches!(
            self.mode,
            StreamMode::NumSampsAndDone | StreamMode::NumSampsAndMore
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RxErrorCode {
    Timeout,
    LateCommand,
    BrokenChain,
    Overflow,
    Alignment,
    BadPacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxEventCode {
    BurstAck,
    Underflow,
    SeqError,
    TimeError,
    UnderflowInPacket,
    SeqErrorInBurst,
}

/// Typed part of an action; `Generic` carries only key, payload and args.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionPayload {
    Generic,
    StreamCmd(StreamCmd),
    RxEvent {
        error_code: RxErrorCode,
        args: String,
    },
    TxEvent {
        event_code: TxEventCode,
        tsf: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInfo {
    /// Unique, monotonically increasing across the process.
    pub id: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub args: BTreeMap<String, String>,
    pub kind: ActionPayload,
}

impl ActionInfo {
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_kind(key, ActionPayload::Generic)
    }

    pub fn with_kind(key: impl Into<String>, kind: ActionPayload) -> Self {
        Self {
            id: NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed),
            key: key.into(),
            payload: Vec::new(),
            args: BTreeMap::new(),
            kind,
        }
    }

    pub fn stream_cmd(cmd: StreamCmd) -> ActionRef {
        Arc::new(Self::with_kind(
            ACTION_KEY_STREAM_CMD,
            ActionPayload::StreamCmd(cmd),
        ))
    }

    pub fn rx_event(error_code: RxErrorCode) -> ActionRef {
        Arc::new(Self::with_kind(
            ACTION_KEY_RX_EVENT,
            ActionPayload::RxEvent {
                error_code,
                args: String::new(),
            },
        ))
    }

    pub fn tx_event(event_code: TxEventCode, tsf: Option<u64>) -> ActionRef {
        Arc::new(Self::with_kind(
            ACTION_KEY_TX_EVENT,
            ActionPayload::TxEvent { event_code, tsf },
        ))
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn as_stream_cmd(&self) -> Option<&StreamCmd> {
        match &self.kind {
            ActionPayload::StreamCmd(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn into_ref(self) -> ActionRef {
        Arc::new(self)
    }
}

pub type ActionHandler =
    Box<dyn FnMut(&mut ActionCtx<'_>, ResSourceInfo, &ActionRef) -> PropResult<()> + Send>;

/// What an action handler may touch: read access to the node's properties
/// and an outbox for follow-up actions.
pub struct ActionCtx<'a> {
    node_id: &'a str,
    props: &'a [Property],
    outbox: &'a mut Vec<(ResSourceInfo, ActionRef)>,
}

impl<'a> ActionCtx<'a> {
    pub(crate) fn new(
        node_id: &'a str,
        props: &'a [Property],
        outbox: &'a mut Vec<(ResSourceInfo, ActionRef)>,
    ) -> Self {
        Self {
            node_id,
            props,
            outbox,
        }
    }

    pub fn node_id(&self) -> &str {
        self.node_id
    }

    /// Read a property by ID and location.
    pub fn get_property<T: PropType>(&self, id: &str, src: ResSourceInfo) -> PropResult<T> {
        self.props
            .iter()
            .find(|p| p.id() == id && p.src() == src)
            .ok_or_else(|| crate::error::PropError::NotFound {
                node: self.node_id.to_string(),
                id: id.to_string(),
                src: src.to_string(),
            })?
            .get()
    }

    /// Send an action out of `edge` once the current handler returns.
    pub fn post_action(&mut self, edge: ResSourceInfo, action: ActionRef) {
        self.outbox.push((edge, action));
    }
}
