//! rn-stream: the host end of data streams.
//!
//! Contains:
//! - packet (data and flow-control frame encoding)
//! - terminator (RX/TX stream terminator graph nodes)
//! - xport (flow-controlled RX/TX data transports)

pub mod packet;
pub mod terminator;
pub mod xport;

pub use packet::{
    DataPacket, PacketError, StrcOpcode, StrcPacket, StreamPacket, StrsPacket, StrsStatus,
};
pub use terminator::{
    ChannelParams, PROP_KEY_ATOMIC_ITEM_SIZE, PROP_KEY_SAMP_RATE, PROP_KEY_SCALING, PROP_KEY_TYPE,
    RxEventRecord, RxStreamTerminator, StreamArgs, TxAsyncMsg, TxStreamTerminator, otw_item_size,
};
pub use xport::{RxDataXport, StreamEpids, TxDataXport};
