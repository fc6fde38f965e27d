//! Auto-reply flow: a main TX connection paired with a dedicated
//! auto-reply connection carrying payload back in the same timeslot.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};

use common::MockHal;
use wps::phy::regs::IrqEvents;
use wps::xlayer::XlayerNode;
use wps::{
    ConnectionConfig, ConnectionId, HeaderCfg, Wps, WpsNodeCfg, WpsStorage, auto_timeslot,
    main_timeslot,
};

const ADDR_A: u16 = 0xADDA;
const ADDR_B: u16 = 0xADDB;

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

fn deliver(wps: &mut Wps<'_, MockHal>, events: IrqEvents, fifo: &[u8]) {
    wps.hal_mut().set_events(events.bits(), fifo);
    wps.hal_mut().advance_ticks(1_000);
    wps.radio_irq();
    pump(wps);
    wps.process_callback();
}

#[test]
fn auto_reply_payload_reaches_the_auto_connection() {
    static TX_SUCCESS: AtomicU32 = AtomicU32::new(0);
    static AUTO_RX_SUCCESS: AtomicU32 = AtomicU32::new(0);
    fn on_tx_success(_: ConnectionId) {
        TX_SUCCESS.fetch_add(1, Ordering::SeqCst);
    }
    fn on_auto_rx_success(_: ConnectionId) {
        AUTO_RX_SUCCESS.fetch_add(1, Ordering::SeqCst);
    }

    let mut tx_nodes = vec![XlayerNode::default(); 8];
    let mut rx_nodes = vec![XlayerNode::default(); 8];
    let mut rx_headers = vec![0u8; 8 * 40];
    let mut tx_arena = vec![0u8; 512];
    let mut rx_arena = vec![0u8; 512];
    let storage = WpsStorage {
        tx_nodes: &mut tx_nodes,
        rx_nodes: &mut rx_nodes,
        rx_headers: &mut rx_headers,
        rx_header_block_size: 40,
        tx_arena: &mut tx_arena,
        rx_arena: &mut rx_arena,
    };

    let mut wps = Wps::new(
        MockHal::default(),
        WpsNodeCfg { local_address: ADDR_A, ..WpsNodeCfg::default() },
        storage,
    );
    wps.config_network_schedule(&[10_000, 10_000]).unwrap();
    wps.config_network_channel_sequence(&[0, 1]).unwrap();

    let main = wps
        .create_connection(&ConnectionConfig {
            source_address: ADDR_A,
            destination_address: ADDR_B,
            max_payload_size: 8,
            ..ConnectionConfig::default()
        })
        .unwrap();
    wps.connection_set_timeslot(main, &[main_timeslot(0), main_timeslot(1)]).unwrap();
    wps.configure_header_connection(main, HeaderCfg { main_connection: true, ..HeaderCfg::default() })
        .unwrap();
    wps.set_tx_success_callback(main, on_tx_success);

    let auto = wps
        .create_connection(&ConnectionConfig {
            source_address: ADDR_B,
            destination_address: ADDR_A,
            max_payload_size: 8,
            ..ConnectionConfig::default()
        })
        .unwrap();
    wps.connection_set_timeslot(auto, &[auto_timeslot(0), auto_timeslot(1)]).unwrap();
    wps.configure_header_connection(auto, HeaderCfg::default()).unwrap();
    wps.set_rx_success_callback(auto, on_auto_rx_success);

    wps.connect().unwrap();
    pump(&mut wps);

    wps.send(main, &[0xCA, 0xFE]).unwrap();

    // Header-only replies carry the link through the post-connect sync
    // frames; the paired auto reception reports a miss.
    let ack = IrqEvents::AUTO_RX_END | IrqEvents::CRC_PASS | IrqEvents::ADDR_MATCH;
    let mut got_reply = false;
    for _ in 0..8 {
        if TX_SUCCESS.load(Ordering::SeqCst) == 0 {
            deliver(&mut wps, ack, &[0]);
            continue;
        }
        // The payload frame is in flight: answer it with an auto-reply
        // carrying data. FIFO: frame size byte, header size, header,
        // payload.
        let reply = [4, 1, 0x80, 0x5A, 0xA5];
        deliver(&mut wps, ack, &reply);
        got_reply = true;
        break;
    }

    assert!(got_reply, "payload frame never went out");
    assert!(TX_SUCCESS.load(Ordering::SeqCst) >= 1);
    assert_eq!(AUTO_RX_SUCCESS.load(Ordering::SeqCst), 1);

    let frame = wps.read(auto).unwrap();
    assert_eq!(frame.payload, &[0x5A, 0xA5]);
    drop(frame);
    wps.read_done(auto).unwrap();
}
