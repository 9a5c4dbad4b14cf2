use std::sync::Arc;
use std::time::Duration;

use rn_config::StreamSettings;
use rn_core::SepId;
use rn_stream::packet::{HEADER_LEN, STRC_LEN};
use rn_stream::{RxDataXport, StreamEpids, StreamPacket, TxDataXport};
use rn_xport::{FcCounts, LoopbackTransport, Transport};

const HOST: SepId = SepId::new(2);
const DEVICE: SepId = SepId::new(5);
const SHORT: Duration = Duration::from_millis(5);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn settings(fc_bytes: u64, fc_packets: u64) -> StreamSettings {
    StreamSettings {
        fc_resp_freq_bytes: fc_bytes,
        fc_resp_freq_packets: fc_packets,
        send_poll_us: 100,
    }
}

/// TX on the host, RX standing in for the device. The returned loopback
/// end is the device side of the link, for tampering with frames.
fn link(capacity: FcCounts, settings: &StreamSettings) -> (TxDataXport, RxDataXport, LoopbackTransport) {
    let (host, device) = LoopbackTransport::pair("data", 64);
    let tx = TxDataXport::new(
        Arc::new(host),
        StreamEpids::new(HOST, DEVICE),
        capacity,
        8000,
        settings,
    );
    let rx = RxDataXport::new(
        Arc::new(device.clone()),
        StreamEpids::new(DEVICE, HOST),
        capacity,
        settings,
    );
    (tx, rx, device)
}

#[test]
fn sender_waits_for_status() {
    init_logging();
    let settings = settings(0, 1);
    let frame = (HEADER_LEN + 100) as u64;
    let (mut tx, mut rx, _) = link(FcCounts::new(2 * frame, 8), &settings);
    let payload = [0x11_u8; 100];

    assert!(tx.send(&payload, false, None, SHORT).unwrap());
    assert!(tx.send(&payload, false, None, SHORT).unwrap());
    assert!(!tx.send(&payload, false, None, SHORT).unwrap());
    let snap = tx.fc_snapshot();
    assert_eq!(snap.xfer, FcCounts::new(2 * frame, 2));
    assert!(snap.resync_pending);

    // Each consumed packet triggers a status.
    let first = rx.recv(SHORT).unwrap().unwrap();
    assert_eq!(first.seq_num, 0);
    assert_eq!(first.payload, payload);
    assert_eq!(rx.recv(SHORT).unwrap().unwrap().seq_num, 1);

    // Space is back; the pending resync goes out right after the data.
    assert!(tx.send(&payload, true, Some(1234), SHORT).unwrap());
    let snap = tx.fc_snapshot();
    assert!(!snap.resync_pending);
    assert_eq!(snap.recv, FcCounts::new(2 * frame, 2));
    let ts_frame = frame + 8;
    assert_eq!(snap.xfer, FcCounts::new(2 * frame + ts_frame + STRC_LEN as u64, 4));

    let last = rx.recv(SHORT).unwrap().unwrap();
    assert!(last.eob);
    assert_eq!(last.timestamp, Some(1234));
    // The resync is consumed and answered, no more data.
    assert_eq!(rx.recv(SHORT).unwrap(), None);
    assert_eq!(rx.seq_gaps(), 0);

    tx.process_feedback(SHORT).unwrap();
    let snap = tx.fc_snapshot();
    assert_eq!(snap.recv, snap.xfer);
    assert_eq!(snap.bytes_in_flight(), 0);
}

#[test]
fn resync_accounts_for_lost_packets() {
    init_logging();
    let settings = settings(0, 1);
    let payload = [0_u8; 92];
    let frame = (HEADER_LEN + payload.len()) as u64;
    let (mut tx, mut rx, device_end) = link(FcCounts::new(3 * frame, 100), &settings);

    for _ in 0..3 {
        assert!(tx.send(&payload, false, None, SHORT).unwrap());
    }
    assert_eq!(rx.recv(SHORT).unwrap().unwrap().seq_num, 0);
    // Lose the second packet on the link.
    assert!(device_end.recv(SHORT).unwrap().is_some());
    assert_eq!(rx.recv(SHORT).unwrap().unwrap().seq_num, 2);
    assert_eq!(rx.seq_gaps(), 1);

    // Two packets acknowledged, one still counted as in flight.
    assert!(tx.send(&payload, false, None, SHORT).unwrap());
    let snap = tx.fc_snapshot();
    assert_eq!(snap.recv, FcCounts::new(2 * frame, 2));
    assert!(!snap.resync_pending);

    assert_eq!(rx.recv(SHORT).unwrap().unwrap().seq_num, 3);
    assert_eq!(rx.recv(SHORT).unwrap(), None);
    // The resync told the receiver about the lost packet.
    assert_eq!(rx.recv_counts(), FcCounts::new(4 * frame + STRC_LEN as u64, 5));
    assert_eq!(rx.xfer_counts(), rx.recv_counts());

    tx.process_feedback(SHORT).unwrap();
    assert_eq!(tx.fc_snapshot().bytes_in_flight(), 0);
}

#[test]
fn connect_learns_receiver_capacity() {
    init_logging();
    let settings = settings(4096, 0);
    let (host, device) = LoopbackTransport::pair("data", 8);
    let mut rx = RxDataXport::new(
        Arc::new(device),
        StreamEpids::new(DEVICE, HOST),
        FcCounts::new(32 * 1024, 64),
        &StreamSettings::default(),
    );

    std::thread::scope(|s| {
        let receiver = s.spawn(move || {
            let packet = rx.recv(Duration::from_secs(2)).unwrap();
            (packet, rx.fc_freq(), rx.recv_counts())
        });

        let mut tx = TxDataXport::connect(
            Arc::new(host),
            StreamEpids::new(HOST, DEVICE),
            8000,
            &settings,
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(tx.fc_snapshot().dest_capacity, FcCounts::new(32 * 1024, 64));
        assert!(tx.send(&[1, 2, 3, 4], false, None, Duration::from_secs(1)).unwrap());

        let (packet, fc_freq, recv) = receiver.join().unwrap();
        assert_eq!(packet.unwrap().payload, vec![1, 2, 3, 4]);
        assert_eq!(fc_freq, FcCounts::new(4096, 0));
        // Counts restart after initialization.
        assert_eq!(recv, FcCounts::new(HEADER_LEN as u64 + 4, 1));
    });
}

#[test]
fn connect_times_out_without_receiver() {
    init_logging();
    let (host, _device) = LoopbackTransport::pair("data", 8);
    let err = TxDataXport::connect(
        Arc::new(host),
        StreamEpids::new(HOST, DEVICE),
        8000,
        &settings(1, 0),
        Duration::from_millis(10),
    )
    .err()
    .unwrap();
    assert!(err.is_timeout());
}

#[test]
fn oversized_frames_are_refused() {
    let settings = settings(0, 1);
    let (host, _device) = LoopbackTransport::pair("data", 8);
    let mut tx = TxDataXport::new(
        Arc::new(host),
        StreamEpids::new(HOST, DEVICE),
        FcCounts::new(1 << 20, 1024),
        64,
        &settings,
    );
    assert!(tx.send(&[0; 64], false, None, SHORT).is_err());
    assert_eq!(tx.fc_snapshot().xfer, FcCounts::default());
}

#[test]
fn foreign_and_malformed_frames_are_dropped() {
    init_logging();
    let settings = settings(0, 1);
    let (host, device) = LoopbackTransport::pair("data", 8);
    let mut rx = RxDataXport::new(
        Arc::new(device),
        StreamEpids::new(DEVICE, HOST),
        FcCounts::new(4096, 16),
        &settings,
    );

    host.send(&[0xFF; 3], SHORT).unwrap();
    let foreign = StreamPacket::Data(rn_stream::DataPacket {
        seq_num: 0,
        dst_epid: SepId::new(99),
        eob: false,
        timestamp: None,
        payload: vec![7; 8],
    });
    host.send(&foreign.encode().unwrap(), SHORT).unwrap();

    assert_eq!(rx.recv(SHORT).unwrap(), None);
    assert_eq!(rx.recv_counts(), FcCounts::default());
    assert_eq!(host.pending(), 0);
}
