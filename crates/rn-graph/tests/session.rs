//! Session-level connect, routing and streamer handling.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::*;
use rn_config::SessionConfig;
use rn_core::{BlockId, RnError, SepAddr};
use rn_graph::{
    ConnectOutcome, DeviceTopology, EdgeKind, FabricPort, GraphError, GraphSnapshot,
    HOST_DEVICE_ID, RfnocGraph,
};
use rn_props::{ActionInfo, Node, ResSourceInfo, StreamCmd, StreamMode};
use rn_xport::{LoopbackTransport, MgmtPortal};

const SEP_DDC_OUT: SepAddr = SepAddr::new(0, 1);
const SEP_TX_IN: SepAddr = SepAddr::new(0, 2);

fn bid(s: &str) -> BlockId {
    s.parse().unwrap()
}

fn session(topology: DeviceTopology) -> (RfnocGraph, Arc<CountingPortal>) {
    let portal = Arc::new(CountingPortal::default());
    let (xport, _far) = LoopbackTransport::pair("mgmt", 16);
    let graph = RfnocGraph::new(
        &SessionConfig::default(),
        topology,
        Arc::clone(&portal) as Arc<dyn MgmtPortal>,
        Arc::new(xport),
    );
    (graph, portal)
}

/// RX radio statically feeding a DDC; the DDC output and the TX radio input
/// sit behind stream endpoints.
fn radio_ddc_topology() -> DeviceTopology {
    DeviceTopology::new()
        .with_link(
            FabricPort::block(bid("0/Radio#0"), 0),
            FabricPort::block(bid("0/DDC#0"), 0),
        )
        .with_link(FabricPort::block(bid("0/DDC#0"), 0), FabricPort::sep(SEP_DDC_OUT, 0))
        .with_link(FabricPort::sep(SEP_TX_IN, 0), FabricPort::block(bid("0/Radio#1"), 0))
}

struct RadioDdc {
    graph: RfnocGraph,
    portal: Arc<CountingPortal>,
    rx_num_samps: Arc<std::sync::atomic::AtomicU64>,
}

fn radio_ddc_session() -> RadioDdc {
    let (mut graph, portal) = session(radio_ddc_topology());
    let rx = MockRadio::new("0/Radio#0");
    let rx_num_samps = Arc::clone(&rx.last_num_samps);
    graph.register_block(bid("0/Radio#0"), Box::new(rx)).unwrap();
    graph
        .register_block(bid("0/DDC#0"), Box::new(mock_ddc("0/DDC#0")))
        .unwrap();
    graph
        .register_block(bid("0/Radio#1"), Box::new(MockRadio::new("0/Radio#1")))
        .unwrap();
    graph.init_props();
    RadioDdc {
        graph,
        portal,
        rx_num_samps,
    }
}

#[test]
fn static_and_dynamic_edges() {
    init_logging();
    let RadioDdc {
        mut graph, portal, ..
    } = radio_ddc_session();
    let (radio, ddc, tx) = (bid("0/Radio#0"), bid("0/DDC#0"), bid("0/Radio#1"));

    assert!(graph.is_connectable(&radio, 0, &ddc, 0));
    assert!(graph.is_connectable(&ddc, 0, &tx, 0));
    assert!(!graph.is_connectable(&radio, 0, &tx, 0));
    assert!(!graph.is_connectable(&tx, 0, &ddc, 0));

    graph.connect(&radio, 0, &ddc, 0, 0).unwrap();
    assert!(portal.inits.lock().unwrap().is_empty());
    graph.connect(&ddc, 0, &tx, 0, 4096).unwrap();
    assert_eq!(portal.inits_for(SEP_DDC_OUT), 1);
    assert_eq!(portal.inits_for(SEP_TX_IN), 1);
    assert_eq!(portal.routes.lock().unwrap().len(), 1);

    let conns = graph.active_connections();
    assert_eq!(conns.len(), 2);
    assert_eq!(conns[0].edge.edge, EdgeKind::Static);
    assert_eq!(conns[0].pkt_size, SessionConfig::default().graph.default_pkt_size);
    assert!(conns[0].route.is_none());
    assert_eq!(conns[1].edge.edge, EdgeKind::Dynamic);
    assert_eq!(conns[1].pkt_size, 4096);
    let route = conns[1].route.unwrap();
    assert_eq!((route.src_addr, route.dst_addr), (SEP_DDC_OUT, SEP_TX_IN));

    let err = graph.connect(&radio, 0, &tx, 0, 0).unwrap_err();
    assert!(matches!(err, GraphError::NotConnectable { .. }), "{err}");
    assert!(matches!(RnError::from(err), RnError::Routing { .. }));
    let err = graph.connect(&radio, 0, &bid("0/FFT#0"), 0, 0).unwrap_err();
    assert!(matches!(err, GraphError::NoSuchBlock { .. }));

    assert_eq!(graph.enumerate_static_connections().len(), 3);
    assert_eq!(graph.enumerate_active_connections().len(), 2);
}

#[test]
fn endpoints_are_initialized_once() {
    init_logging();
    let sep_a = SepAddr::new(0, 1);
    let sep_b = SepAddr::new(0, 2);
    let (x, y) = (bid("0/X#0"), bid("0/Y#0"));
    let topo = DeviceTopology::new()
        .with_link(FabricPort::block(x.clone(), 0), FabricPort::sep(sep_a, 0))
        .with_link(FabricPort::block(x.clone(), 1), FabricPort::sep(sep_a, 1))
        .with_link(FabricPort::sep(sep_b, 0), FabricPort::block(y.clone(), 0))
        .with_link(FabricPort::sep(sep_b, 1), FabricPort::block(y.clone(), 1));
    let (mut graph, portal) = session(topo);
    graph
        .register_block(x.clone(), Box::new(MockEdgeNode::new("0/X#0", 0, 2)))
        .unwrap();
    graph
        .register_block(y.clone(), Box::new(MockEdgeNode::new("0/Y#0", 2, 0)))
        .unwrap();
    graph.init_props();

    graph.connect(&x, 0, &y, 0, 0).unwrap();
    assert_eq!(portal.inits_for(sep_a), 1);
    assert_eq!(portal.inits_for(sep_b), 1);
    assert_eq!(portal.registers.load(Ordering::SeqCst), 0);

    graph.connect(&x, 1, &y, 1, 0).unwrap();
    assert_eq!(portal.inits_for(sep_a), 1);
    assert_eq!(portal.inits_for(sep_b), 1);
    assert_eq!(portal.registers.load(Ordering::SeqCst), 2);

    let routes = portal.routes.lock().unwrap().clone();
    assert_eq!(routes.len(), 2);
    assert_eq!(routes[0], routes[1]);
    let alloc = graph.epid_allocator();
    assert_eq!(alloc.allocated_count(), 2);
    assert_eq!(routes[0], (alloc.get_epid(sep_a).unwrap(), alloc.get_epid(sep_b).unwrap()));

    // Repeating a connect neither routes nor allocates.
    assert_eq!(
        graph.connect(&x, 1, &y, 1, 0).unwrap(),
        ConnectOutcome::AlreadyConnected
    );
    assert_eq!(portal.routes.lock().unwrap().len(), 2);
    graph.commit().unwrap();
}

#[test]
fn failed_route_leaves_no_edge() {
    init_logging();
    let RadioDdc {
        mut graph, portal, ..
    } = radio_ddc_session();
    let (ddc, tx) = (bid("0/DDC#0"), bid("0/Radio#1"));
    *portal.refuse_routes.lock().unwrap() = true;

    let err = graph.connect(&ddc, 0, &tx, 0, 0).unwrap_err();
    assert!(matches!(err, GraphError::Rn(RnError::Routing { .. })), "{err}");
    assert!(graph.enumerate_active_connections().is_empty());
    assert!(graph.active_connections().is_empty());

    *portal.refuse_routes.lock().unwrap() = false;
    graph.connect(&ddc, 0, &tx, 0, 0).unwrap();
    // The endpoints stayed allocated from the first attempt.
    assert_eq!(portal.inits_for(SEP_DDC_OUT), 1);
    assert_eq!(graph.enumerate_active_connections().len(), 1);
}

#[test]
fn conflicting_connect_on_committed_graph_is_rolled_back() {
    init_logging();
    let (src, dst) = (bid("0/Src#0"), bid("0/Dst#0"));
    let topology = DeviceTopology::new().with_link(
        FabricPort::block(src.clone(), 0),
        FabricPort::block(dst.clone(), 0),
    );
    let (mut graph, _) = session(topology);
    graph
        .register_block(src.clone(), Box::new(pinned_type_source("0/Src#0", "sc16")))
        .unwrap();
    graph
        .register_block(dst.clone(), Box::new(type_sink("0/Dst#0", Some("s8"))))
        .unwrap();
    graph.init_props();
    graph.commit().unwrap();

    let err = graph.connect(&src, 0, &dst, 0, 0).unwrap_err();
    assert!(
        matches!(err, GraphError::EdgeConflict { .. } | GraphError::Unresolved { .. }),
        "{err}"
    );
    assert!(graph.enumerate_active_connections().is_empty());
    assert!(graph.active_connections().is_empty());

    // Retrying reports the conflict again instead of a stale connection.
    assert!(graph.connect(&src, 0, &dst, 0, 0).is_err());
    assert!(graph.enumerate_active_connections().is_empty());
}

#[test]
fn session_resolves_through_all_edges() {
    init_logging();
    let RadioDdc { mut graph, .. } = radio_ddc_session();
    let (radio, ddc, tx) = (bid("0/Radio#0"), bid("0/DDC#0"), bid("0/Radio#1"));
    graph.connect(&radio, 0, &ddc, 0, 0).unwrap();
    graph.connect(&ddc, 0, &tx, 0, 0).unwrap();
    graph.commit().unwrap();
    assert!(graph.is_committed());

    let user = ResSourceInfo::user(0);
    graph
        .set_property("0/Radio#1", "master_clock_rate", 100e6, user)
        .unwrap();
    let decim: i64 = graph.get_property("0/DDC#0", "decim", user).unwrap();
    assert_eq!(decim, 2);

    graph
        .set_properties("0/Radio#1", "master_clock_rate=200e6", 0)
        .unwrap();
    let decim: i64 = graph.get_property("0/DDC#0", "decim", user).unwrap();
    assert_eq!(decim, 1);

    let err = graph.set_property("0/FFT#0", "fft_size", 256_i64, user).unwrap_err();
    assert!(matches!(err, GraphError::UnknownNode { .. }));
    assert!(graph.get_block_as::<MockRadio>(&radio).is_ok());
}

#[test]
fn rx_streamer_round_trip() {
    init_logging();
    let RadioDdc {
        mut graph,
        portal,
        rx_num_samps,
    } = radio_ddc_session();
    let (radio, ddc) = (bid("0/Radio#0"), bid("0/DDC#0"));
    graph.connect(&radio, 0, &ddc, 0, 0).unwrap();

    let id = graph
        .add_streamer(Box::new(MockTerminator::new("RxStreamer#0", 1, &[])))
        .unwrap();
    assert!(matches!(
        graph.add_streamer(Box::new(MockTerminator::new("RxStreamer#0", 1, &[]))),
        Err(GraphError::DuplicateBlock { .. })
    ));

    let route = graph.connect_rx_streamer(&ddc, 0, &id, 0).unwrap();
    assert_eq!(route.src_addr, SEP_DDC_OUT);
    assert_eq!(route.dst_addr, SepAddr::new(HOST_DEVICE_ID, 0));
    assert_eq!(portal.inits_for(SEP_DDC_OUT), 1);
    // The host side is not initialized through the portal.
    assert_eq!(portal.inits_for(route.dst_addr), 0);
    assert_eq!(graph.connect_rx_streamer(&ddc, 0, &id, 0).unwrap(), route);

    graph.commit().unwrap();
    graph
        .set_property("0/DDC#0", "decim", 8_i64, ResSourceInfo::user(0))
        .unwrap();
    let cmd = ActionInfo::stream_cmd(StreamCmd::num_samps(StreamMode::NumSampsAndDone, 10));
    graph.post_action(&id, ResSourceInfo::input_edge(0), cmd).unwrap();
    assert_eq!(rx_num_samps.load(Ordering::SeqCst), 80);

    let streamer = graph.disconnect_streamer(&id).unwrap();
    assert_eq!(streamer.unique_id(), "RxStreamer#0");
    assert_eq!(graph.active_connections().len(), 1);
    assert!(graph.streamer(&id).is_err());
}

#[test]
fn tx_streamer_port_disconnect() {
    init_logging();
    let RadioDdc { mut graph, .. } = radio_ddc_session();
    let tx = bid("0/Radio#1");
    let id = graph
        .add_streamer(Box::new(MockTerminator::new("TxStreamer#0", 1, &[])))
        .unwrap();

    let route = graph.connect_tx_streamer(&id, 0, &tx, 0).unwrap();
    assert_eq!(route.src_addr.device, HOST_DEVICE_ID);
    assert_eq!(route.dst_addr, SEP_TX_IN);
    let conn = &graph.active_connections()[0];
    assert_eq!(conn.edge.edge, EdgeKind::TxStream);
    assert_eq!(conn.edge.src_blockid, "TxStreamer#0");

    // Radio#0's output goes to the DDC, not to a stream endpoint.
    let err = graph
        .connect_rx_streamer(&bid("0/Radio#0"), 0, &id, 0)
        .unwrap_err();
    assert!(matches!(err, GraphError::NotConnectable { .. }), "{err}");

    assert!(graph.disconnect_streamer_port(&id, 0).unwrap());
    assert!(!graph.disconnect_streamer_port(&id, 0).unwrap());
    assert!(graph.active_connections().is_empty());
    assert!(graph.streamer_as::<MockTerminator>(&id).is_ok());
}

#[test]
fn snapshot_survives_json() {
    init_logging();
    let RadioDdc { mut graph, .. } = radio_ddc_session();
    let (radio, ddc, tx) = (bid("0/Radio#0"), bid("0/DDC#0"), bid("0/Radio#1"));
    graph.connect(&radio, 0, &ddc, 0, 0).unwrap();
    graph.connect(&ddc, 0, &tx, 0, 0).unwrap();
    graph.commit().unwrap();

    let snap = graph.snapshot();
    assert!(snap.committed);
    assert_eq!(snap.nodes.len(), 3);
    assert_eq!(snap.edges.len(), 2);
    assert_eq!(snap.epids.len(), 2);
    let ddc_snap = snap.node("0/DDC#0").unwrap();
    assert!(ddc_snap.in_graph);
    assert_eq!(ddc_snap.dirty().count(), 0);
    assert!(ddc_snap.properties.iter().any(|p| p.id == "decim"));

    let text = snap.to_json().unwrap();
    assert_eq!(GraphSnapshot::from_json(&text).unwrap(), snap);
}

#[test]
fn shutdown_reaches_every_node() {
    init_logging();
    let RadioDdc {
        mut graph,
        rx_num_samps,
        ..
    } = radio_ddc_session();
    let (radio, ddc) = (bid("0/Radio#0"), bid("0/DDC#0"));
    graph.connect(&radio, 0, &ddc, 0, 0).unwrap();
    graph.commit().unwrap();
    graph.shutdown();
    assert!(!graph.is_committed());

    let cmd = ActionInfo::stream_cmd(StreamCmd::num_samps(StreamMode::NumSampsAndDone, 10));
    graph
        .post_action("0/DDC#0", ResSourceInfo::input_edge(0), cmd)
        .unwrap();
    assert_eq!(rx_num_samps.load(Ordering::SeqCst), 0);
    let block = graph.get_block(&ddc).unwrap();
    assert_eq!(block.unique_id(), "0/DDC#0");
}
