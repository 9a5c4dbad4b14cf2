//! Flow-controlled data transports.
//!
//! A TX transport sends data frames only while the receiver has buffer
//! space and learns about freed space from stream status (STRS) frames. An
//! RX transport counts what it receives and consumes, answers stream
//! commands (STRC) and sends a status every `fc_freq` worth of data.
//! Anomalies on either side are logged and the offending frame dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rn_config::StreamSettings;
use rn_core::{RnError, RnResult, SepId};
use rn_xport::{FcCounts, RecvCountUpdate, RxFlowCtrlState, TxFlowCtrlSnapshot, TxFlowCtrlState, Transport};
use tracing::{debug, trace, warn};

use crate::packet::{
    DataPacket, STRC_LEN, StrcOpcode, StrcPacket, StreamPacket, StrsPacket, StrsStatus,
};

/// Both ends of a stream: `local` sends, `remote` is the peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEpids {
    pub local: SepId,
    pub remote: SepId,
}

impl StreamEpids {
    pub const fn new(local: SepId, remote: SepId) -> Self {
        Self { local, remote }
    }
}

pub struct TxDataXport {
    xport: Arc<dyn Transport>,
    epids: StreamEpids,
    fc: TxFlowCtrlState,
    seq_num: u16,
    strc_seq_num: u16,
    send_poll: Duration,
    max_frame: usize,
}

impl TxDataXport {
    /// Transport with a known receive capacity at the destination.
    pub fn new(
        xport: Arc<dyn Transport>,
        epids: StreamEpids,
        dest_capacity: FcCounts,
        max_frame: usize,
        settings: &StreamSettings,
    ) -> Self {
        debug!(
            src = %epids.local,
            dst = %epids.remote,
            capacity_bytes = dest_capacity.bytes,
            capacity_packets = dest_capacity.packets,
            "tx data transport created"
        );
        Self {
            xport,
            epids,
            fc: TxFlowCtrlState::new(dest_capacity),
            seq_num: 0,
            strc_seq_num: 0,
            send_poll: settings.send_poll(),
            max_frame,
        }
    }

    /// Initialize flow control with the destination: send an init command
    /// carrying the status cadence and wait for the status that reports
    /// its buffer capacity.
    pub fn connect(
        xport: Arc<dyn Transport>,
        epids: StreamEpids,
        max_frame: usize,
        settings: &StreamSettings,
        timeout: Duration,
    ) -> RnResult<Self> {
        let fc_freq = FcCounts::new(settings.fc_resp_freq_bytes, settings.fc_resp_freq_packets);
        let init = StreamPacket::Strc(StrcPacket {
            seq_num: 0,
            dst_epid: epids.remote,
            src_epid: epids.local,
            op: StrcOpcode::Init,
            counts: fc_freq,
        });
        xport.send(&init.encode()?, timeout)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(frame) = xport.recv(remaining)? else {
                return Err(RnError::timeout(
                    format!("waiting for stream status from {}", epids.remote),
                    timeout,
                ));
            };
            match StreamPacket::decode(&frame) {
                Ok(StreamPacket::Strs(strs)) if strs.dst_epid == epids.local => {
                    let mut tx = Self::new(xport, epids, strs.capacity, max_frame, settings);
                    tx.strc_seq_num = 1;
                    return Ok(tx);
                }
                Ok(other) => warn!(?other, "unexpected packet while initializing flow control"),
                Err(err) => warn!(error = %err, "dropping malformed frame"),
            }
        }
    }

    pub fn epids(&self) -> StreamEpids {
        self.epids
    }

    pub fn fc_snapshot(&self) -> TxFlowCtrlSnapshot {
        self.fc.snapshot()
    }

    /// Send one data frame.
    ///
    /// Returns `Ok(false)` if the destination did not free enough space
    /// before `timeout`; nothing was sent in that case.
    pub fn send(
        &mut self,
        payload: &[u8],
        eob: bool,
        timestamp: Option<u64>,
        timeout: Duration,
    ) -> RnResult<bool> {
        let packet = StreamPacket::Data(DataPacket {
            seq_num: self.seq_num,
            dst_epid: self.epids.remote,
            eob,
            timestamp,
            payload: payload.to_vec(),
        });
        let frame = packet.encode()?;
        if frame.len() > self.max_frame {
            return Err(RnError::value(format!(
                "frame of {} bytes exceeds the transport maximum of {}",
                frame.len(),
                self.max_frame
            )));
        }
        let size = frame.len() as u64;

        let deadline = Instant::now() + timeout;
        self.process_feedback(Duration::ZERO)?;
        while !self.fc.dest_has_space(size) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                trace!(bytes = size, in_flight = self.fc.buffer_fullness(), "no space at destination");
                return Ok(false);
            }
            self.process_feedback(remaining.min(self.send_poll))?;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.xport.send(&frame, remaining)?;
        self.fc.data_sent(size);
        self.seq_num = self.seq_num.wrapping_add(1);

        if self.fc.get_fc_resync_req_pending() && self.fc.dest_has_space(STRC_LEN as u64) {
            self.send_resync(remaining)?;
        }
        Ok(true)
    }

    fn send_resync(&mut self, timeout: Duration) -> RnResult<()> {
        let counts = self.fc.get_xfer_counts();
        let strc = StreamPacket::Strc(StrcPacket {
            seq_num: self.strc_seq_num,
            dst_epid: self.epids.remote,
            src_epid: self.epids.local,
            op: StrcOpcode::Resync,
            counts,
        });
        self.xport.send(&strc.encode()?, timeout)?;
        self.strc_seq_num = self.strc_seq_num.wrapping_add(1);
        self.fc.clear_fc_resync_req_pending();
        self.fc.data_sent(STRC_LEN as u64);
        trace!(bytes = counts.bytes, packets = counts.packets, "sent flow-control resync");
        Ok(())
    }

    /// Apply every status frame that arrives within `timeout`. Returns how
    /// many were applied.
    pub fn process_feedback(&mut self, timeout: Duration) -> RnResult<usize> {
        let mut applied = 0;
        let mut wait = timeout;
        while let Some(frame) = self.xport.recv(wait)? {
            wait = Duration::ZERO;
            match StreamPacket::decode(&frame) {
                Ok(StreamPacket::Strs(strs)) if strs.dst_epid == self.epids.local => {
                    if strs.status != StrsStatus::Okay {
                        warn!(status = ?strs.status, src = %strs.src_epid, "stream status reports an error");
                    }
                    if self.fc.update_dest_recv_count(strs.xfer) == RecvCountUpdate::Applied {
                        applied += 1;
                    }
                }
                Ok(other) => {
                    warn!(dst = %other.dst_epid(), "dropping unexpected packet on tx transport");
                }
                Err(err) => warn!(error = %err, "dropping malformed frame"),
            }
        }
        Ok(applied)
    }
}

pub struct RxDataXport {
    xport: Arc<dyn Transport>,
    epids: StreamEpids,
    fc: RxFlowCtrlState,
    capacity: FcCounts,
    fc_seq_num: u16,
    expected_seq: Option<u16>,
    seq_gaps: u64,
}

impl RxDataXport {
    /// `capacity` is what this side can buffer; it is reported to the
    /// sender in every status frame.
    pub fn new(
        xport: Arc<dyn Transport>,
        epids: StreamEpids,
        capacity: FcCounts,
        settings: &StreamSettings,
    ) -> Self {
        Self {
            xport,
            epids,
            fc: RxFlowCtrlState::new(FcCounts::new(
                settings.fc_resp_freq_bytes,
                settings.fc_resp_freq_packets,
            )),
            capacity,
            fc_seq_num: 0,
            expected_seq: None,
            seq_gaps: 0,
        }
    }

    pub fn epids(&self) -> StreamEpids {
        self.epids
    }

    pub fn fc_freq(&self) -> FcCounts {
        self.fc.fc_freq()
    }

    pub fn recv_counts(&self) -> FcCounts {
        self.fc.get_recv_counts()
    }

    pub fn xfer_counts(&self) -> FcCounts {
        self.fc.get_xfer_counts()
    }

    /// Data frames whose sequence number was not the expected one.
    pub fn seq_gaps(&self) -> u64 {
        self.seq_gaps
    }

    /// Receive the next data packet, handling flow-control traffic on the
    /// way. `Ok(None)` if no data arrived before `timeout`.
    pub fn recv(&mut self, timeout: Duration) -> RnResult<Option<DataPacket>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(frame) = self.xport.recv(remaining)? else {
                return Ok(None);
            };
            let size = frame.len() as u64;
            let packet = match StreamPacket::decode(&frame) {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(error = %err, "dropping malformed frame");
                    continue;
                }
            };
            if packet.dst_epid() != self.epids.local {
                warn!(dst = %packet.dst_epid(), local = %self.epids.local, "dropping packet for another endpoint");
                continue;
            }
            match packet {
                StreamPacket::Data(data) => {
                    self.fc.data_received(size);
                    self.check_seq(data.seq_num);
                    self.fc.xfer_done(size);
                    if self.fc.fc_resp_due() {
                        self.send_status(remaining)?;
                    }
                    return Ok(Some(data));
                }
                StreamPacket::Strc(strc) => self.handle_strc(strc, size, remaining)?,
                StreamPacket::Strs(_) => {
                    warn!("dropping stream status received on rx transport");
                }
            }
        }
    }

    fn handle_strc(&mut self, strc: StrcPacket, size: u64, timeout: Duration) -> RnResult<()> {
        match strc.op {
            StrcOpcode::Resync => {
                // Counts in the command exclude the command itself.
                self.fc.resynchronize(strc.counts);
                self.fc.data_received(size);
                self.fc.xfer_done(size);
                self.send_status(timeout)
            }
            StrcOpcode::Init => {
                debug!(
                    fc_bytes = strc.counts.bytes,
                    fc_packets = strc.counts.packets,
                    "flow control initialized by sender"
                );
                self.fc.initialize(strc.counts);
                self.send_status(timeout)?;
                self.fc.reset_counts();
                self.expected_seq = None;
                Ok(())
            }
            StrcOpcode::Ping => self.send_status(timeout),
        }
    }

    fn check_seq(&mut self, seq_num: u16) {
        if let Some(expected) = self.expected_seq {
            if expected != seq_num {
                self.seq_gaps += 1;
                warn!(expected, got = seq_num, "sequence gap on rx stream");
            }
        }
        self.expected_seq = Some(seq_num.wrapping_add(1));
    }

    fn send_status(&mut self, timeout: Duration) -> RnResult<()> {
        let strs = StreamPacket::Strs(StrsPacket {
            seq_num: self.fc_seq_num,
            dst_epid: self.epids.remote,
            src_epid: self.epids.local,
            status: StrsStatus::Okay,
            capacity: self.capacity,
            xfer: self.fc.get_xfer_counts(),
        });
        self.xport.send(&strs.encode()?, timeout)?;
        self.fc_seq_num = self.fc_seq_num.wrapping_add(1);
        self.fc.fc_resp_sent();
        Ok(())
    }
}
