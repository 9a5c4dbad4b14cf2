//! rn-xport: everything between the graph and the wire.
//!
//! Contains:
//! - transport (framed packet transport interface + an in-memory loopback)
//! - mgmt (management portal interface)
//! - epid (endpoint ID allocator)
//! - ctrl_payload / ctrlport (register access over control packets)
//! - flow_ctrl (TX/RX credit accounting)

pub mod ctrl_payload;
pub mod ctrlport;
pub mod epid;
pub mod flow_ctrl;
pub mod mgmt;
pub mod transport;

pub use ctrl_payload::{CtrlOpcode, CtrlPayload, CtrlStatus};
pub use ctrlport::{
    AsyncMsgHandler, AsyncMsgValidator, CtrlportEndpoint, CtrlportParams, CtrlportStats, SendFn,
};
pub use epid::EpidAllocator;
pub use flow_ctrl::{
    FcCounts, RecvCountUpdate, RxFlowCtrlState, TxFlowCtrlSnapshot, TxFlowCtrlState,
};
pub use mgmt::MgmtPortal;
pub use transport::{LoopbackTransport, Transport};
