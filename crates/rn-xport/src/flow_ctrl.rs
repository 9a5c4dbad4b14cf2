//! Flow-control credit accounting for data streams.
//!
//! Both sides only track cumulative byte/packet counts. The sender compares
//! what it has sent against what the receiver reports as received; the
//! receiver reports back every `fc_freq` worth of consumed data.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Byte and packet counts, used both as capacities and as cumulative
/// counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcCounts {
    pub bytes: u64,
    pub packets: u64,
}

impl FcCounts {
    pub const fn new(bytes: u64, packets: u64) -> Self {
        Self { bytes, packets }
    }
}

/// Outcome of feeding a receive count from a status packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvCountUpdate {
    Applied,
    /// At least one field went backwards; the update was ignored.
    Regressed,
}

/// Sender-side flow-control state for one channel.
///
/// `data_sent`/`dest_has_space` belong to the producer thread and
/// `update_dest_recv_count` to the feedback thread; the counters are atomics
/// so neither path takes a lock.
#[derive(Debug)]
pub struct TxFlowCtrlState {
    dest_capacity: FcCounts,
    xfer_bytes: AtomicU64,
    xfer_packets: AtomicU64,
    recv_bytes: AtomicU64,
    recv_packets: AtomicU64,
    last_resync_bytes: AtomicU64,
    resync_req: AtomicBool,
    regressions: AtomicU64,
}

/// Point-in-time copy of a [`TxFlowCtrlState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFlowCtrlSnapshot {
    pub dest_capacity: FcCounts,
    pub xfer: FcCounts,
    pub recv: FcCounts,
    pub last_resync_bytes: u64,
    pub resync_pending: bool,
    pub regressions: u64,
}

impl TxFlowCtrlSnapshot {
    pub fn bytes_in_flight(&self) -> u64 {
        self.xfer.bytes.saturating_sub(self.recv.bytes)
    }
}

impl TxFlowCtrlState {
    pub fn new(dest_capacity: FcCounts) -> Self {
        Self {
            dest_capacity,
            xfer_bytes: AtomicU64::new(0),
            xfer_packets: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
            recv_packets: AtomicU64::new(0),
            last_resync_bytes: AtomicU64::new(0),
            resync_req: AtomicBool::new(false),
            regressions: AtomicU64::new(0),
        }
    }

    pub fn dest_capacity(&self) -> FcCounts {
        self.dest_capacity
    }

    /// Bytes sent but not yet reported as received.
    pub fn buffer_fullness(&self) -> u64 {
        let xfer = self.xfer_bytes.load(Ordering::Acquire);
        let recv = self.recv_bytes.load(Ordering::Acquire);
        xfer.saturating_sub(recv)
    }

    /// True if a packet of `packet_size` bytes fits in the destination
    /// buffer. Never blocks.
    pub fn dest_has_space(&self, packet_size: u64) -> bool {
        self.dest_capacity
            .bytes
            .saturating_sub(self.buffer_fullness())
            >= packet_size
    }

    /// Count one sent packet of `packet_size` bytes.
    ///
    /// Requests a resync once a full destination buffer's worth has gone
    /// out since the last one.
    pub fn data_sent(&self, packet_size: u64) {
        let xfer = self.xfer_bytes.fetch_add(packet_size, Ordering::AcqRel) + packet_size;
        self.xfer_packets.fetch_add(1, Ordering::AcqRel);
        let since_resync = xfer.saturating_sub(self.last_resync_bytes.load(Ordering::Acquire));
        if since_resync >= self.dest_capacity.bytes {
            self.resync_req.store(true, Ordering::Release);
        }
    }

    /// Apply counts from a status packet. Counts must not go backwards.
    pub fn update_dest_recv_count(&self, counts: FcCounts) -> RecvCountUpdate {
        let bytes = self.recv_bytes.load(Ordering::Acquire);
        let packets = self.recv_packets.load(Ordering::Acquire);
        if counts.bytes < bytes || counts.packets < packets {
            self.regressions.fetch_add(1, Ordering::Relaxed);
            warn!(
                bytes = counts.bytes,
                packets = counts.packets,
                cached_bytes = bytes,
                cached_packets = packets,
                "ignoring regressing flow-control receive count"
            );
            return RecvCountUpdate::Regressed;
        }
        self.recv_packets.store(counts.packets, Ordering::Release);
        self.recv_bytes.store(counts.bytes, Ordering::Release);
        RecvCountUpdate::Applied
    }

    pub fn get_fc_resync_req_pending(&self) -> bool {
        self.resync_req.load(Ordering::Acquire)
    }

    /// Called once the resync packet is out.
    pub fn clear_fc_resync_req_pending(&self) {
        self.last_resync_bytes
            .store(self.xfer_bytes.load(Ordering::Acquire), Ordering::Release);
        self.resync_req.store(false, Ordering::Release);
    }

    pub fn get_xfer_counts(&self) -> FcCounts {
        FcCounts::new(
            self.xfer_bytes.load(Ordering::Acquire),
            self.xfer_packets.load(Ordering::Acquire),
        )
    }

    pub fn get_recv_counts(&self) -> FcCounts {
        FcCounts::new(
            self.recv_bytes.load(Ordering::Acquire),
            self.recv_packets.load(Ordering::Acquire),
        )
    }

    pub fn snapshot(&self) -> TxFlowCtrlSnapshot {
        TxFlowCtrlSnapshot {
            dest_capacity: self.dest_capacity,
            xfer: self.get_xfer_counts(),
            recv: self.get_recv_counts(),
            last_resync_bytes: self.last_resync_bytes.load(Ordering::Acquire),
            resync_pending: self.get_fc_resync_req_pending(),
            regressions: self.regressions.load(Ordering::Relaxed),
        }
    }
}

/// Receiver-side flow-control state for one channel.
///
/// Owned by the single thread that receives the stream.
#[derive(Debug, Clone, Default)]
pub struct RxFlowCtrlState {
    fc_freq: FcCounts,
    recv: FcCounts,
    xfer: FcCounts,
    last_fc_resp: FcCounts,
}

impl RxFlowCtrlState {
    /// `fc_freq`: send a status after this many bytes or packets have been
    /// consumed. A zero field never triggers.
    pub fn new(fc_freq: FcCounts) -> Self {
        Self {
            fc_freq,
            ..Self::default()
        }
    }

    /// Switch to the cadence requested by the sender.
    pub fn initialize(&mut self, fc_freq: FcCounts) {
        self.fc_freq = fc_freq;
    }

    pub fn fc_freq(&self) -> FcCounts {
        self.fc_freq
    }

    pub fn reset_counts(&mut self) {
        self.recv = FcCounts::default();
        self.xfer = FcCounts::default();
        self.last_fc_resp = FcCounts::default();
    }

    /// Align with the sender's transfer counts.
    ///
    /// Data the sender counted but this side never saw was lost on the
    /// link; it is counted as consumed so credits are returned.
    pub fn resynchronize(&mut self, counts: FcCounts) {
        if counts == self.recv {
            return;
        }
        let bytes_dropped = counts.bytes.saturating_sub(self.recv.bytes);
        let packets_dropped = counts.packets.saturating_sub(self.recv.packets);
        debug!(
            bytes_dropped,
            packets_dropped, "flow-control resync accounted for lost data"
        );
        self.xfer.bytes += bytes_dropped;
        self.xfer.packets += packets_dropped;
        self.recv = counts;
    }

    pub fn data_received(&mut self, bytes: u64) {
        self.recv.bytes += bytes;
        self.recv.packets += 1;
    }

    /// Count a received packet as consumed.
    pub fn xfer_done(&mut self, bytes: u64) {
        self.xfer.bytes += bytes;
        self.xfer.packets += 1;
    }

    pub fn fc_resp_due(&self) -> bool {
        let bytes = self.xfer.bytes - self.last_fc_resp.bytes.min(self.xfer.bytes);
        let packets = self.xfer.packets - self.last_fc_resp.packets.min(self.xfer.packets);
        (self.fc_freq.bytes > 0 && bytes >= self.fc_freq.bytes)
            || (self.fc_freq.packets > 0 && packets >= self.fc_freq.packets)
    }

    pub fn fc_resp_sent(&mut self) {
        self.last_fc_resp = self.xfer;
    }

    pub fn get_xfer_counts(&self) -> FcCounts {
        self.xfer
    }

    pub fn get_recv_counts(&self) -> FcCounts {
        self.recv
    }
}
