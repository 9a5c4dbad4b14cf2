//! Control packet payload as exchanged with a control-port endpoint.
//!
//! Framing into wire headers happens in the transport layer; this is the
//! decoded form.

use rn_core::SepId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CtrlOpcode {
    Sleep = 0,
    Write = 1,
    Read = 2,
    ReadWrite = 3,
    BlockWrite = 4,
    BlockRead = 5,
    Poll = 6,
}

/// Status reported by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CtrlStatus {
    #[default]
    Okay = 0,
    CmdErr = 1,
    TsErr = 2,
    Warning = 3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrlPayload {
    pub dst_port: u16,
    pub src_port: u16,
    /// 6 bits on the wire.
    pub seq_num: u8,
    /// Execution time in timebase ticks.
    pub timestamp: Option<u64>,
    /// Discriminates responses from requests.
    pub is_ack: bool,
    pub src_epid: SepId,
    pub address: u32,
    pub data: Vec<u32>,
    pub byte_enable: u8,
    pub op_code: CtrlOpcode,
    pub status: CtrlStatus,
}

impl CtrlPayload {
    /// A request with all bytes enabled and no timestamp.
    pub fn request(op_code: CtrlOpcode, address: u32, data: Vec<u32>) -> Self {
        Self {
            dst_port: 0,
            src_port: 0,
            seq_num: 0,
            timestamp: None,
            is_ack: false,
            src_epid: SepId::new(0),
            address,
            data,
            byte_enable: 0xF,
            op_code,
            status: CtrlStatus::Okay,
        }
    }

    /// Size in 32-bit words this payload occupies in the responder's buffer.
    pub fn size_words(&self) -> usize {
        2 + if self.timestamp.is_some() { 2 } else { 0 } + self.data.len()
    }

    /// The response to this request, addressed back to its sender.
    pub fn to_response(&self, src_epid: SepId, status: CtrlStatus) -> Self {
        Self {
            dst_port: self.src_port,
            src_port: self.dst_port,
            is_ack: true,
            src_epid,
            status,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counts_header_timestamp_and_data() {
        let mut p = CtrlPayload::request(CtrlOpcode::Write, 0x10, vec![1, 2, 3]);
        assert_eq!(p.size_words(), 5);
        p.timestamp = Some(1000);
        assert_eq!(p.size_words(), 7);
    }

    #[test]
    fn response_swaps_ports() {
        let mut p = CtrlPayload::request(CtrlOpcode::Read, 0x20, vec![0]);
        p.src_port = 3;
        p.dst_port = 7;
        p.seq_num = 9;
        let r = p.to_response(SepId::new(4), CtrlStatus::CmdErr);
        assert!(r.is_ack);
        assert_eq!((r.src_port, r.dst_port), (7, 3));
        assert_eq!(r.seq_num, 9);
        assert_eq!(r.status, CtrlStatus::CmdErr);
    }
}
