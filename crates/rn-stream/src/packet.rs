//! Stream packet framing.
//!
//! Every frame starts with an 8-byte little-endian header:
//!
//! | bytes | field                                   |
//! |-------|-----------------------------------------|
//! | 0     | packet type                             |
//! | 1     | flags (bit 0: end of burst, bit 1: has timestamp) |
//! | 2..4  | sequence number                         |
//! | 4..6  | destination EPID                        |
//! | 6..8  | total frame length in bytes             |
//!
//! Data frames carry an optional 8-byte timestamp followed by the samples.
//! Flow-control frames carry a fixed-size body.

use rn_core::{RnError, SepId};
use rn_xport::FcCounts;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HEADER_LEN: usize = 8;
/// Total size of a stream status frame.
pub const STRS_LEN: usize = HEADER_LEN + 40;
/// Total size of a stream command frame.
pub const STRC_LEN: usize = HEADER_LEN + 24;
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

const TYPE_DATA: u8 = 0x6;
const TYPE_DATA_TS: u8 = 0x7;
const TYPE_STRS: u8 = 0x2;
const TYPE_STRC: u8 = 0x3;

const FLAG_EOB: u8 = 0x1;
const FLAG_TS: u8 = 0x2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("frame truncated: {len} bytes, need {need}")]
    Truncated { len: usize, need: usize },

    #[error("frame length mismatch: header says {header}, got {actual}")]
    LengthMismatch { header: usize, actual: usize },

    #[error("frame too large: {len} bytes (max {MAX_FRAME_LEN})")]
    TooLarge { len: usize },

    #[error("unknown packet type {0:#x}")]
    UnknownType(u8),

    #[error("unknown stream command opcode {0}")]
    UnknownOpcode(u8),

    #[error("unknown stream status {0}")]
    UnknownStatus(u8),
}

impl From<PacketError> for RnError {
    fn from(err: PacketError) -> Self {
        match err {
            PacketError::TooLarge { .. } => RnError::value(err.to_string()),
            _ => RnError::transport(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrsStatus {
    Okay = 0,
    CmdErr = 1,
    SeqErr = 2,
    DataErr = 3,
    RouteErr = 4,
}

impl StrsStatus {
    fn from_u8(raw: u8) -> Result<Self, PacketError> {
        Ok(match raw {
            0 => Self::Okay,
            1 => Self::CmdErr,
            2 => Self::SeqErr,
            3 => Self::DataErr,
            4 => Self::RouteErr,
            other => return Err(PacketError::UnknownStatus(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrcOpcode {
    /// Sets the receiver's status cadence; answered with its capacity.
    Init = 0,
    Ping = 1,
    /// Carries the sender's transfer counts.
    Resync = 2,
}

impl StrcOpcode {
    fn from_u8(raw: u8) -> Result<Self, PacketError> {
        Ok(match raw {
            0 => Self::Init,
            1 => Self::Ping,
            2 => Self::Resync,
            other => return Err(PacketError::UnknownOpcode(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPacket {
    pub seq_num: u16,
    pub dst_epid: SepId,
    pub eob: bool,
    /// Timebase ticks of the first sample.
    pub timestamp: Option<u64>,
    pub payload: Vec<u8>,
}

/// Stream status: the receiver's buffer capacity and what it has consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrsPacket {
    pub seq_num: u16,
    pub dst_epid: SepId,
    pub src_epid: SepId,
    pub status: StrsStatus,
    pub capacity: FcCounts,
    pub xfer: FcCounts,
}

/// Stream command from the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrcPacket {
    pub seq_num: u16,
    pub dst_epid: SepId,
    pub src_epid: SepId,
    pub op: StrcOpcode,
    pub counts: FcCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamPacket {
    Data(DataPacket),
    Strs(StrsPacket),
    Strc(StrcPacket),
}

impl StreamPacket {
    pub fn dst_epid(&self) -> SepId {
        match self {
            Self::Data(p) => p.dst_epid,
            Self::Strs(p) => p.dst_epid,
            Self::Strc(p) => p.dst_epid,
        }
    }

    /// Size of the encoded frame.
    pub fn frame_len(&self) -> usize {
        match self {
            Self::Data(p) => HEADER_LEN + if p.timestamp.is_some() { 8 } else { 0 } + p.payload.len(),
            Self::Strs(_) => STRS_LEN,
            Self::Strc(_) => STRC_LEN,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let len = self.frame_len();
        if len > MAX_FRAME_LEN {
            return Err(PacketError::TooLarge { len });
        }
        let mut buf = Vec::with_capacity(len);
        match self {
            Self::Data(p) => {
                let (kind, mut flags) = match p.timestamp {
                    Some(_) => (TYPE_DATA_TS, FLAG_TS),
                    None => (TYPE_DATA, 0),
                };
                if p.eob {
                    flags |= FLAG_EOB;
                }
                put_header(&mut buf, kind, flags, p.seq_num, p.dst_epid, len);
                if let Some(ts) = p.timestamp {
                    buf.extend_from_slice(&ts.to_le_bytes());
                }
                buf.extend_from_slice(&p.payload);
            }
            Self::Strs(p) => {
                put_header(&mut buf, TYPE_STRS, 0, p.seq_num, p.dst_epid, len);
                buf.extend_from_slice(&p.src_epid.get().to_le_bytes());
                buf.push(p.status as u8);
                buf.extend_from_slice(&[0; 5]);
                put_counts(&mut buf, p.capacity);
                put_counts(&mut buf, p.xfer);
            }
            Self::Strc(p) => {
                put_header(&mut buf, TYPE_STRC, 0, p.seq_num, p.dst_epid, len);
                buf.extend_from_slice(&p.src_epid.get().to_le_bytes());
                buf.push(p.op as u8);
                buf.extend_from_slice(&[0; 5]);
                put_counts(&mut buf, p.counts);
            }
        }
        Ok(buf)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, PacketError> {
        need(frame, HEADER_LEN)?;
        let kind = frame[0];
        let flags = frame[1];
        let seq_num = le_u16(frame, 2);
        let dst_epid = SepId::new(le_u16(frame, 4));
        let header_len = le_u16(frame, 6) as usize;
        if header_len != frame.len() {
            return Err(PacketError::LengthMismatch {
                header: header_len,
                actual: frame.len(),
            });
        }

        match kind {
            TYPE_DATA | TYPE_DATA_TS => {
                let (timestamp, body) = if kind == TYPE_DATA_TS || flags & FLAG_TS != 0 {
                    need(frame, HEADER_LEN + 8)?;
                    (Some(le_u64(frame, HEADER_LEN)), HEADER_LEN + 8)
                } else {
                    (None, HEADER_LEN)
                };
                Ok(Self::Data(DataPacket {
                    seq_num,
                    dst_epid,
                    eob: flags & FLAG_EOB != 0,
                    timestamp,
                    payload: frame[body..].to_vec(),
                }))
            }
            TYPE_STRS => {
                need(frame, STRS_LEN)?;
                Ok(Self::Strs(StrsPacket {
                    seq_num,
                    dst_epid,
                    src_epid: SepId::new(le_u16(frame, HEADER_LEN)),
                    status: StrsStatus::from_u8(frame[HEADER_LEN + 2])?,
                    capacity: get_counts(frame, HEADER_LEN + 8),
                    xfer: get_counts(frame, HEADER_LEN + 24),
                }))
            }
            TYPE_STRC => {
                need(frame, STRC_LEN)?;
                Ok(Self::Strc(StrcPacket {
                    seq_num,
                    dst_epid,
                    src_epid: SepId::new(le_u16(frame, HEADER_LEN)),
                    op: StrcOpcode::from_u8(frame[HEADER_LEN + 2])?,
                    counts: get_counts(frame, HEADER_LEN + 8),
                }))
            }
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

fn need(frame: &[u8], need: usize) -> Result<(), PacketError> {
    if frame.len() < need {
        return Err(PacketError::Truncated {
            len: frame.len(),
            need,
        });
    }
    Ok(())
}

fn put_header(buf: &mut Vec<u8>, kind: u8, flags: u8, seq_num: u16, dst: SepId, len: usize) {
    buf.push(kind);
    buf.push(flags);
    buf.extend_from_slice(&seq_num.to_le_bytes());
    buf.extend_from_slice(&dst.get().to_le_bytes());
    buf.extend_from_slice(&(len as u16).to_le_bytes());
}

fn put_counts(buf: &mut Vec<u8>, counts: FcCounts) {
    buf.extend_from_slice(&counts.bytes.to_le_bytes());
    buf.extend_from_slice(&counts.packets.to_le_bytes());
}

fn get_counts(frame: &[u8], at: usize) -> FcCounts {
    FcCounts::new(le_u64(frame, at), le_u64(frame, at + 8))
}

fn le_u16(frame: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([frame[at], frame[at + 1]])
}

fn le_u64(frame: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&frame[at..at + 8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(payload: Vec<u8>, timestamp: Option<u64>) -> StreamPacket {
        StreamPacket::Data(DataPacket {
            seq_num: 0xBEEF,
            dst_epid: SepId::new(7),
            eob: true,
            timestamp,
            payload,
        })
    }

    #[test]
    fn data_frame_layout() {
        let frame = data(vec![1, 2, 3, 4], Some(0x0102)).encode().unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 8 + 4);
        assert_eq!(frame[0], TYPE_DATA_TS);
        assert_eq!(frame[1], FLAG_EOB | FLAG_TS);
        assert_eq!(&frame[2..4], &0xBEEF_u16.to_le_bytes());
        assert_eq!(&frame[4..6], &7_u16.to_le_bytes());
        assert_eq!(le_u16(&frame, 6) as usize, frame.len());
        assert_eq!(StreamPacket::decode(&frame).unwrap(), data(vec![1, 2, 3, 4], Some(0x0102)));
    }

    #[test]
    fn flow_control_frames_have_fixed_size() {
        let strs = StreamPacket::Strs(StrsPacket {
            seq_num: 1,
            dst_epid: SepId::new(2),
            src_epid: SepId::new(3),
            status: StrsStatus::SeqErr,
            capacity: FcCounts::new(4096, 32),
            xfer: FcCounts::new(100, 1),
        });
        let strc = StreamPacket::Strc(StrcPacket {
            seq_num: 9,
            dst_epid: SepId::new(3),
            src_epid: SepId::new(2),
            op: StrcOpcode::Resync,
            counts: FcCounts::new(u64::MAX, 5),
        });
        let strs_frame = strs.encode().unwrap();
        let strc_frame = strc.encode().unwrap();
        assert_eq!(strs_frame.len(), STRS_LEN);
        assert_eq!(strc_frame.len(), STRC_LEN);
        assert_eq!(StreamPacket::decode(&strs_frame).unwrap(), strs);
        assert_eq!(StreamPacket::decode(&strc_frame).unwrap(), strc);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert_eq!(
            StreamPacket::decode(&[0x6, 0, 0]),
            Err(PacketError::Truncated { len: 3, need: HEADER_LEN })
        );

        let mut frame = data(vec![0; 4], None).encode().unwrap();
        frame.push(0);
        assert!(matches!(
            StreamPacket::decode(&frame),
            Err(PacketError::LengthMismatch { header: 12, actual: 13 })
        ));

        let mut frame = data(vec![], None).encode().unwrap();
        frame[0] = 0xF;
        assert_eq!(StreamPacket::decode(&frame), Err(PacketError::UnknownType(0xF)));

        let err = data(vec![0; MAX_FRAME_LEN], None).encode().unwrap_err();
        assert!(matches!(err, PacketError::TooLarge { .. }));
        assert!(matches!(RnError::from(err), RnError::Value { .. }));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
                let _ = StreamPacket::decode(&bytes);
            }

            #[test]
            fn header_length_tracks_payload(len in 0usize..2048, ts in proptest::option::of(any::<u64>())) {
                let frame = data(vec![0xA5; len], ts).encode().unwrap();
                prop_assert_eq!(le_u16(&frame, 6) as usize, frame.len());
                let StreamPacket::Data(decoded) = StreamPacket::decode(&frame).unwrap() else {
                    panic!("not a data packet");
                };
                prop_assert_eq!(decoded.payload.len(), len);
                prop_assert_eq!(decoded.timestamp, ts);
            }
        }
    }
}
