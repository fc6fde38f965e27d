//! # Certification mode
//!
//! Regulatory test mode: headers and payloads are replaced by a fixed
//! alternating byte pattern and every retired frame immediately requeues
//! another, so the radio transmits continuously at maximum occupancy.
//! Acknowledges and the ARQ are forced off to keep the pattern clean.

use super::{MacCore, enqueue_tx_frame};
use crate::ConnectionId;
use crate::xlayer::{CircularData, NodePool};

const CERTIF_BYTE0: u8 = 0x6F;
const CERTIF_BYTE1: u8 = 0x0A;

/// Fill `header` with the certification pattern.
pub fn fill_header(header: &mut [u8]) {
    for (i, byte) in header.iter_mut().enumerate() {
        *byte = if i % 2 == 0 { CERTIF_BYTE0 } else { CERTIF_BYTE1 };
    }
}

/// Queue one certification frame on `conn_id`.
pub fn send(
    mac: &mut MacCore,
    conn_id: ConnectionId,
    tx_pool: &mut NodePool,
    tx_data: &mut CircularData,
    now: u64,
) {
    let payload_size = usize::from(mac.conn(conn_id).payload_size);
    let mut payload = [0u8; crate::config::RADIO_MAX_PACKET_SIZE];
    let even_header = mac.conn(conn_id).header_size % 2 == 0;
    for (i, byte) in payload.iter_mut().take(payload_size).enumerate() {
        // Keep the alternation continuous across the header boundary.
        let even = i % 2 == 0;
        *byte = if even == even_header { CERTIF_BYTE0 } else { CERTIF_BYTE1 };
    }
    let _ = enqueue_tx_frame(mac, tx_pool, tx_data, conn_id, &payload[..payload_size], now);
}

/// Switch every transmitting connection into certification mode and seed
/// the first frame of each.
pub fn init(mac: &mut MacCore, tx_pool: &mut NodePool, tx_data: &mut CircularData, now: u64) {
    mac.node_role = super::WpsRole::Coordinator;
    for idx in 0..mac.connections.len() {
        let conn_id = ConnectionId(idx as u8);
        let is_tx = {
            let conn = mac.conn(conn_id);
            conn.source_address == mac.local_address
        };
        if !is_tx {
            continue;
        }
        {
            let conn = mac.conn_mut(conn_id);
            conn.certification_mode_enabled = true;
            // Acknowledge interferes with guaranteed delivery of the
            // pattern stream.
            conn.ack_enable = false;
            conn.stop_and_wait_arq.disable();
        }
        send(mac, conn_id, tx_pool, tx_data, now);
    }
}
