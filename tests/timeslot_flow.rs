//! Full-stack timeslot flows against the scripted radio emulation:
//! connect, sync frames, payload exchange, CCA aborts, ARQ deadlines and
//! duplicate rejection.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};

use common::MockHal;
use wps::phy::regs::IrqEvents;
use wps::xlayer::XlayerNode;
use wps::{
    ConnectionConfig, ConnectionId, HeaderCfg, Wps, WpsNodeCfg, WpsStorage, main_timeslot,
};

const ADDR_A: u16 = 0xADDA;
const ADDR_B: u16 = 0xADDB;

/// ACK reception events of a TX exchange.
fn ack_events() -> IrqEvents {
    IrqEvents::AUTO_RX_END | IrqEvents::CRC_PASS | IrqEvents::ADDR_MATCH
}

/// Good frame reception events of an RX exchange.
fn rx_events() -> IrqEvents {
    IrqEvents::RX_END | IrqEvents::CRC_PASS | IrqEvents::ADDR_MATCH
}

macro_rules! storage {
    ($storage:ident) => {
        let mut tx_nodes = vec![XlayerNode::default(); 8];
        let mut rx_nodes = vec![XlayerNode::default(); 8];
        let mut rx_headers = vec![0u8; 8 * 40];
        let mut tx_arena = vec![0u8; 512];
        let mut rx_arena = vec![0u8; 512];
        let $storage = WpsStorage {
            tx_nodes: &mut tx_nodes,
            rx_nodes: &mut rx_nodes,
            rx_headers: &mut rx_headers,
            rx_header_block_size: 40,
            tx_arena: &mut tx_arena,
            rx_arena: &mut rx_arena,
        };
    };
}

fn node_cfg() -> WpsNodeCfg {
    WpsNodeCfg { local_address: ADDR_A, ..WpsNodeCfg::default() }
}

/// Drain every staged DMA completion.
fn pump(wps: &mut Wps<'_, MockHal>) {
    for _ in 0..64 {
        if wps.hal_mut().take_transfer_pending() {
            wps.transfer_complete();
        } else {
            return;
        }
    }
    panic!("phy never went quiet");
}

/// Deliver one radio interrupt with the staged events and FIFO bytes.
fn deliver(wps: &mut Wps<'_, MockHal>, events: IrqEvents, fifo: &[u8]) {
    wps.hal_mut().set_events(events.bits(), fifo);
    wps.hal_mut().advance_ticks(1_000);
    wps.radio_irq();
    pump(wps);
    wps.process_callback();
}

/// Bring a TX connection up: schedule, channels, header, connect.
fn setup_tx_node<'m>(
    storage: WpsStorage<'m>,
    cfg: &ConnectionConfig,
) -> (Wps<'m, MockHal>, ConnectionId) {
    let mut wps = Wps::new(MockHal::default(), node_cfg(), storage);
    wps.config_network_schedule(&[10_000, 10_000]).unwrap();
    wps.config_network_channel_sequence(&[0, 1]).unwrap();
    let conn = wps.create_connection(cfg).unwrap();
    wps.connection_set_timeslot(conn, &[main_timeslot(0), main_timeslot(1)]).unwrap();
    (wps, conn)
}

/// Run ACK-confirmed slots until the coordinator finished its post-connect
/// sync frames and real traffic flows.
fn warm_up(wps: &mut Wps<'_, MockHal>) {
    for _ in 0..4 {
        deliver(wps, ack_events(), &[0]);
    }
}

#[test]
fn tx_with_ack_delivers_payload_and_fires_success_callback() {
    static TX_SUCCESS: AtomicU32 = AtomicU32::new(0);
    fn on_tx_success(_: ConnectionId) {
        TX_SUCCESS.fetch_add(1, Ordering::SeqCst);
    }

    storage!(storage);
    let cfg = ConnectionConfig {
        source_address: ADDR_A,
        destination_address: ADDR_B,
        max_payload_size: 8,
        ..ConnectionConfig::default()
    };
    let (mut wps, conn) = setup_tx_node(storage, &cfg);
    wps.enable_ack(conn);
    wps.configure_header_connection(conn, HeaderCfg { main_connection: true, ..HeaderCfg::default() })
        .unwrap();
    wps.set_tx_success_callback(conn, on_tx_success);

    wps.connect().unwrap();
    pump(&mut wps);

    wps.send(conn, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    assert_eq!(wps.get_fifo_size(conn), 1);
    wps.hal_mut().tx_fifo.clear();

    // Sync frames run first; the payload follows once the link connects.
    for _ in 0..8 {
        deliver(&mut wps, ack_events(), &[0]);
        if TX_SUCCESS.load(Ordering::SeqCst) >= 1 {
            break;
        }
    }

    assert_eq!(TX_SUCCESS.load(Ordering::SeqCst), 1);
    let fifo = wps.hal_mut().tx_fifo.clone();
    assert!(
        fifo.windows(4).any(|w| w == [0xDE, 0xAD, 0xBE, 0xEF]),
        "payload never reached the radio FIFO"
    );
    assert_eq!(wps.get_fifo_size(conn), 0);
}

#[test]
fn cca_abort_keeps_frame_queued_and_counts_attempts() {
    static TX_FAIL: AtomicU32 = AtomicU32::new(0);
    fn on_tx_fail(_: ConnectionId) {
        TX_FAIL.fetch_add(1, Ordering::SeqCst);
    }

    storage!(storage);
    let cfg = ConnectionConfig {
        source_address: ADDR_A,
        destination_address: ADDR_B,
        max_payload_size: 8,
        ..ConnectionConfig::default()
    };
    let (mut wps, conn) = setup_tx_node(storage, &cfg);
    wps.enable_ack(conn);
    wps.enable_cca(conn, 40, 128, 3, wps::CcaAction::AbortTx, 2).unwrap();
    wps.configure_header_connection(conn, HeaderCfg { main_connection: true, ..HeaderCfg::default() })
        .unwrap();
    wps.set_tx_fail_callback(conn, on_tx_fail);

    wps.connect().unwrap();
    pump(&mut wps);
    warm_up(&mut wps);

    wps.send(conn, &[0x01, 0x02]).unwrap();
    // The slot staged before the send degenerated to a wakeup; the next
    // one carries the frame.
    deliver(&mut wps, IrqEvents::WAKEUP, &[]);

    // The radio reports three consumed CCA attempts and the fail flag.
    wps.hal_mut().regs[0] = 3;
    deliver(&mut wps, IrqEvents::CCA_FAIL, &[]);

    assert_eq!(TX_FAIL.load(Ordering::SeqCst), 1);
    assert_eq!(wps.get_fifo_size(conn), 1, "aborted frame must stay queued");
    assert_eq!(wps.get_phy_total_cca_fail_count(conn), 3);
    assert_eq!(wps.get_phy_total_cca_tx_fail_count(conn), 1);
}

#[test]
fn arq_retry_deadline_drops_frame_on_third_attempt() {
    static TX_FAIL: AtomicU32 = AtomicU32::new(0);
    static TX_DROP: AtomicU32 = AtomicU32::new(0);
    fn on_tx_fail(_: ConnectionId) {
        TX_FAIL.fetch_add(1, Ordering::SeqCst);
    }
    fn on_tx_drop(_: ConnectionId) {
        TX_DROP.fetch_add(1, Ordering::SeqCst);
    }

    storage!(storage);
    let cfg = ConnectionConfig {
        source_address: ADDR_A,
        destination_address: ADDR_B,
        max_payload_size: 8,
        ..ConnectionConfig::default()
    };
    let (mut wps, conn) = setup_tx_node(storage, &cfg);
    wps.enable_ack(conn);
    wps.configure_header_connection(conn, HeaderCfg { main_connection: true, ..HeaderCfg::default() })
        .unwrap();
    wps.enable_stop_and_wait_arq(conn, ADDR_A, 2, 0).unwrap();
    wps.set_tx_fail_callback(conn, on_tx_fail);
    wps.set_tx_drop_callback(conn, on_tx_drop);

    wps.connect().unwrap();
    pump(&mut wps);
    warm_up(&mut wps);

    wps.send(conn, &[0x42]).unwrap();
    // The slot staged before the send degenerated to a wakeup.
    deliver(&mut wps, IrqEvents::WAKEUP, &[]);
    assert_eq!(wps.get_fifo_size(conn), 1);

    // Two transmissions lose their acknowledge; the third attempt is
    // suppressed at preparation and the frame dropped.
    deliver(&mut wps, IrqEvents::TIMEOUT, &[]);
    assert_eq!(TX_FAIL.load(Ordering::SeqCst), 1);
    assert_eq!(wps.get_fifo_size(conn), 1);
    deliver(&mut wps, IrqEvents::TIMEOUT, &[]);
    assert_eq!(TX_FAIL.load(Ordering::SeqCst), 2);
    assert_eq!(TX_DROP.load(Ordering::SeqCst), 1);
    assert_eq!(wps.get_fifo_size(conn), 0);
    assert_eq!(wps.get_phy_total_pkt_dropped(conn), 1);
}

#[test]
fn rx_slot_delivers_payload_to_application() {
    static RX_SUCCESS: AtomicU32 = AtomicU32::new(0);
    fn on_rx_success(_: ConnectionId) {
        RX_SUCCESS.fetch_add(1, Ordering::SeqCst);
    }

    storage!(storage);
    let cfg = ConnectionConfig {
        source_address: ADDR_B,
        destination_address: ADDR_A,
        max_payload_size: 8,
        ..ConnectionConfig::default()
    };
    let (mut wps, conn) = setup_tx_node(storage, &cfg);
    wps.configure_header_connection(conn, HeaderCfg { main_connection: true, ..HeaderCfg::default() })
        .unwrap();
    wps.set_rx_success_callback(conn, on_rx_success);

    wps.connect().unwrap();
    pump(&mut wps);

    // Frame on the air: retry header, size byte (header + payload + 1),
    // header size, header, payload.
    let fifo = [0x00, 6, 1, 0x01, 0xDE, 0xAD, 0xBE, 0xEF];
    deliver(&mut wps, rx_events(), &fifo);

    assert_eq!(RX_SUCCESS.load(Ordering::SeqCst), 1);
    assert_eq!(wps.get_fifo_size(conn), 1);
    {
        let frame = wps.read(conn).unwrap();
        assert_eq!(frame.payload, &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
    wps.read_done(conn).unwrap();
    assert_eq!(wps.get_fifo_size(conn), 0);
}

#[test]
fn duplicate_sequence_bit_is_rejected_once() {
    static RX_SUCCESS: AtomicU32 = AtomicU32::new(0);
    fn on_rx_success(_: ConnectionId) {
        RX_SUCCESS.fetch_add(1, Ordering::SeqCst);
    }

    storage!(storage);
    let cfg = ConnectionConfig {
        source_address: ADDR_B,
        destination_address: ADDR_A,
        max_payload_size: 8,
        ..ConnectionConfig::default()
    };
    let (mut wps, conn) = setup_tx_node(storage, &cfg);
    wps.enable_ack(conn);
    wps.configure_header_connection(conn, HeaderCfg { main_connection: true, ..HeaderCfg::default() })
        .unwrap();
    wps.enable_stop_and_wait_arq(conn, ADDR_A, 0, 0).unwrap();
    wps.set_rx_success_callback(conn, on_rx_success);

    wps.connect().unwrap();
    pump(&mut wps);

    // Peer transmits with sequence bit set, then repeats the frame.
    let fifo = [0x80, 6, 1, 0x01, 0x11, 0x22, 0x33, 0x44];
    deliver(&mut wps, rx_events(), &fifo);
    deliver(&mut wps, rx_events(), &fifo);

    assert_eq!(RX_SUCCESS.load(Ordering::SeqCst), 1, "duplicate must not reach the app");
    assert_eq!(wps.get_arq_duplicate_count(conn), 1);
    assert_eq!(wps.get_fifo_size(conn), 1);

    // A toggled sequence bit is fresh traffic again.
    let fifo = [0x00, 6, 1, 0x01, 0x55, 0x66, 0x77, 0x88];
    deliver(&mut wps, rx_events(), &fifo);
    assert_eq!(RX_SUCCESS.load(Ordering::SeqCst), 2);
}

#[test]
fn empty_queue_without_auto_sync_degenerates_to_wakeup() {
    storage!(storage);
    let cfg = ConnectionConfig {
        source_address: ADDR_A,
        destination_address: ADDR_B,
        max_payload_size: 8,
        ..ConnectionConfig::default()
    };
    let (mut wps, conn) = setup_tx_node(storage, &cfg);
    wps.configure_header_connection(conn, HeaderCfg { main_connection: true, ..HeaderCfg::default() })
        .unwrap();

    wps.connect().unwrap();
    pump(&mut wps);

    for _ in 0..3 {
        wps.hal_mut().tx_fifo.clear();
        deliver(&mut wps, IrqEvents::WAKEUP, &[]);
        assert!(wps.hal_mut().tx_fifo.is_empty(), "wake-only slot must not touch the FIFO");
    }
    let _ = conn;
}

#[test]
fn auto_sync_sends_header_only_frames_on_empty_queue() {
    storage!(storage);
    let cfg = ConnectionConfig {
        source_address: ADDR_A,
        destination_address: ADDR_B,
        max_payload_size: 8,
        ..ConnectionConfig::default()
    };
    let (mut wps, conn) = setup_tx_node(storage, &cfg);
    wps.enable_ack(conn);
    wps.configure_header_connection(conn, HeaderCfg { main_connection: true, ..HeaderCfg::default() })
        .unwrap();
    wps.enable_auto_sync(conn);

    wps.connect().unwrap();
    pump(&mut wps);

    wps.hal_mut().tx_fifo.clear();
    deliver(&mut wps, ack_events(), &[0]);
    // The next slot stages a header-only sync frame.
    assert!(!wps.hal_mut().tx_fifo.is_empty(), "sync frame header missing from the FIFO");
}
