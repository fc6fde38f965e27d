//! # Fragmentation
//!
//! Carries application frames larger than a connection's payload budget.
//! Every fragment starts with a transaction-control byte (three transfer
//! type bits plus a five-bit transaction id); the first fragment of a
//! transaction additionally carries the fragment index and the total
//! upper-layer frame size. Reassembly happens at read time straight out
//! of the connection's RX queue; an out-of-order or mis-typed fragment
//! drops the whole in-progress transaction with `FragmentError`.

use super::{MacCore, enqueue_tx_frame};
use crate::ConnectionId;
use crate::error::WpsError;
use crate::xlayer::{CircularData, NodePool};

/// Transaction ids wrap at 32 (five bits).
const MAX_TRANSACTION_ID: u8 = 32;

const TYPE_MASK: u8 = 0b0000_0111;
const FULL_FRAME: u8 = 0b000;
const NON_LAST_FRAGMENT: u8 = 0b010;
const LAST_FRAGMENT: u8 = 0b100;

/// Control byte size.
const CTRL_SIZE: usize = 1;
/// First fragment: control, fragment number, 16-bit total size.
const FIRST_FRAGMENT_OVERHEAD: usize = 4;
/// Middle and last fragments: control plus fragment number.
const FRAGMENT_OVERHEAD: usize = 2;

fn ctrl(transfer_type: u8, transaction_id: u8) -> u8 {
    (transfer_type & TYPE_MASK) | (transaction_id << 3)
}

/// Fragmentation state of one connection.
#[derive(Debug, Default, Clone)]
pub struct FragState {
    pub enabled: bool,
    transaction_id: u8,
}

impl FragState {
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    fn next_transaction(&mut self) -> u8 {
        let id = self.transaction_id;
        self.transaction_id = (self.transaction_id + 1) % MAX_TRANSACTION_ID;
        id
    }
}

/// Queue `payload`, splitting it when it exceeds the connection budget.
pub fn send(
    mac: &mut MacCore,
    tx_pool: &mut NodePool,
    tx_data: &mut CircularData,
    conn_id: ConnectionId,
    payload: &[u8],
    now: u64,
    frag: &mut FragState,
) -> Result<(), WpsError> {
    let budget = usize::from(mac.conn(conn_id).payload_size);
    let id = frag.next_transaction();
    let mut buf = [0u8; crate::config::RADIO_MAX_PACKET_SIZE];

    if payload.len() + CTRL_SIZE <= budget {
        buf[0] = ctrl(FULL_FRAME, id);
        buf[1..1 + payload.len()].copy_from_slice(payload);
        return enqueue_tx_frame(mac, tx_pool, tx_data, conn_id, &buf[..1 + payload.len()], now);
    }

    // Check the whole transaction fits the queue before sending anything.
    let chunk = budget - FRAGMENT_OVERHEAD;
    let first_chunk = budget - FIRST_FRAGMENT_OVERHEAD;
    let fragment_count = 1 + payload.len().saturating_sub(first_chunk).div_ceil(chunk);
    if fragment_count > usize::from(mac.conn(conn_id).xlayer_queue.free_space()) {
        return Err(WpsError::QueueFull);
    }

    let total = payload.len() as u16;
    let mut remaining = payload;
    let mut fragment_number = 0u8;

    let take = first_chunk.min(remaining.len());
    buf[0] = ctrl(NON_LAST_FRAGMENT, id);
    buf[1] = fragment_number;
    buf[2..4].copy_from_slice(&total.to_le_bytes());
    buf[FIRST_FRAGMENT_OVERHEAD..FIRST_FRAGMENT_OVERHEAD + take]
        .copy_from_slice(&remaining[..take]);
    enqueue_tx_frame(mac, tx_pool, tx_data, conn_id, &buf[..FIRST_FRAGMENT_OVERHEAD + take], now)?;
    remaining = &remaining[take..];

    while remaining.len() > chunk {
        fragment_number += 1;
        buf[0] = ctrl(NON_LAST_FRAGMENT, id);
        buf[1] = fragment_number;
        buf[FRAGMENT_OVERHEAD..FRAGMENT_OVERHEAD + chunk].copy_from_slice(&remaining[..chunk]);
        enqueue_tx_frame(mac, tx_pool, tx_data, conn_id, &buf[..FRAGMENT_OVERHEAD + chunk], now)?;
        remaining = &remaining[chunk..];
    }

    fragment_number += 1;
    buf[0] = ctrl(LAST_FRAGMENT, id);
    buf[1] = fragment_number;
    buf[FRAGMENT_OVERHEAD..FRAGMENT_OVERHEAD + remaining.len()].copy_from_slice(remaining);
    enqueue_tx_frame(mac, tx_pool, tx_data, conn_id, &buf[..FRAGMENT_OVERHEAD + remaining.len()], now)
}

/// Reassemble the transaction at the head of the RX queue into `out`.
///
/// Returns the reassembled size. Fragments are consumed as they are
/// copied; a malformed transaction is flushed and reported.
pub fn read(
    mac: &mut MacCore,
    rx_pool: &mut NodePool,
    rx_data: &mut CircularData,
    conn_id: ConnectionId,
    out: &mut [u8],
) -> Result<usize, WpsError> {
    let first = peek_payload(mac, rx_pool, rx_data, conn_id)?;
    let ctrl_byte = *first.first().ok_or(WpsError::FragmentError)?;

    match ctrl_byte & TYPE_MASK {
        FULL_FRAME => {
            let size = first.len() - CTRL_SIZE;
            if size > out.len() {
                return Err(WpsError::WrongRxSize);
            }
            out[..size].copy_from_slice(&first[CTRL_SIZE..]);
            pop_frame(mac, rx_pool, rx_data, conn_id);
            Ok(size)
        }
        NON_LAST_FRAGMENT => {
            if first.len() < FIRST_FRAGMENT_OVERHEAD || first[1] != 0 {
                flush_transaction(mac, rx_pool, rx_data, conn_id);
                return Err(WpsError::FragmentError);
            }
            let total = usize::from(u16::from_le_bytes([first[2], first[3]]));
            if total > out.len() {
                flush_transaction(mac, rx_pool, rx_data, conn_id);
                return Err(WpsError::WrongRxSize);
            }
            let take = first.len() - FIRST_FRAGMENT_OVERHEAD;
            out[..take].copy_from_slice(&first[FIRST_FRAGMENT_OVERHEAD..]);
            let mut filled = take;
            pop_frame(mac, rx_pool, rx_data, conn_id);

            loop {
                let next = match peek_payload(mac, rx_pool, rx_data, conn_id) {
                    Ok(next) => next,
                    Err(WpsError::QueueEmpty) => return Err(WpsError::FragmentError),
                    Err(e) => return Err(e),
                };
                let kind = next.first().map(|c| c & TYPE_MASK);
                match kind {
                    Some(NON_LAST_FRAGMENT) | Some(LAST_FRAGMENT)
                        if next.len() >= FRAGMENT_OVERHEAD =>
                    {
                        let chunk = next.len() - FRAGMENT_OVERHEAD;
                        if filled + chunk > total {
                            flush_transaction(mac, rx_pool, rx_data, conn_id);
                            return Err(WpsError::FragmentError);
                        }
                        out[filled..filled + chunk].copy_from_slice(&next[FRAGMENT_OVERHEAD..]);
                        filled += chunk;
                        let last = kind == Some(LAST_FRAGMENT);
                        pop_frame(mac, rx_pool, rx_data, conn_id);
                        if last {
                            return Ok(filled);
                        }
                    }
                    _ => {
                        flush_transaction(mac, rx_pool, rx_data, conn_id);
                        return Err(WpsError::FragmentError);
                    }
                }
            }
        }
        _ => {
            flush_transaction(mac, rx_pool, rx_data, conn_id);
            Err(WpsError::FragmentError)
        }
    }
}

/// Payload size the transaction at the queue head reassembles to.
pub fn read_size(
    mac: &mut MacCore,
    rx_pool: &mut NodePool,
    rx_data: &mut CircularData,
    conn_id: ConnectionId,
) -> Result<usize, WpsError> {
    let first = peek_payload(mac, rx_pool, rx_data, conn_id)?;
    let ctrl_byte = *first.first().ok_or(WpsError::FragmentError)?;
    match ctrl_byte & TYPE_MASK {
        FULL_FRAME => Ok(first.len() - CTRL_SIZE),
        NON_LAST_FRAGMENT if first.len() >= FIRST_FRAGMENT_OVERHEAD && first[1] == 0 => {
            Ok(usize::from(u16::from_le_bytes([first[2], first[3]])))
        }
        _ => {
            flush_transaction(mac, rx_pool, rx_data, conn_id);
            Err(WpsError::FragmentError)
        }
    }
}

fn peek_payload<'p>(
    mac: &MacCore,
    rx_pool: &'p mut NodePool,
    rx_data: &'p mut CircularData,
    conn_id: ConnectionId,
) -> Result<&'p [u8], WpsError> {
    let Some(node) = mac.conn(conn_id).xlayer_queue.peek() else {
        return Err(WpsError::QueueEmpty);
    };
    let frame = &rx_pool.node(node).xlayer.frame;
    let len = frame.payload_size();
    let begin = frame.payload_begin;
    match begin.kind {
        crate::xlayer::BufKind::RxArena => Ok(&rx_data.slice(begin.offset, len)[..]),
        _ => Err(WpsError::FragmentError),
    }
}

fn pop_frame(
    mac: &mut MacCore,
    rx_pool: &mut NodePool,
    rx_data: &mut CircularData,
    conn_id: ConnectionId,
) {
    let conn = &mut mac.connections[usize::from(conn_id.0)];
    let Some(node) = rx_pool.dequeue(&mut conn.xlayer_queue) else {
        return;
    };
    let frame = &mut rx_pool.node_mut(node).xlayer.frame;
    if frame.payload_memory.kind == crate::xlayer::BufKind::RxArena && frame.max_frame_size != 0 {
        rx_data.free(frame.payload_memory.offset, frame.max_frame_size);
    }
    frame.payload_memory = crate::xlayer::BufPtr::NULL;
    frame.max_frame_size = 0;
    rx_pool.free_node(node);
}

/// Drop queued fragments until the start of the next transaction.
fn flush_transaction(
    mac: &mut MacCore,
    rx_pool: &mut NodePool,
    rx_data: &mut CircularData,
    conn_id: ConnectionId,
) {
    while let Ok(payload) = peek_payload(mac, rx_pool, rx_data, conn_id) {
        let kind = payload.first().map(|c| c & TYPE_MASK);
        // A full frame or a fresh first fragment starts a new transaction.
        if kind == Some(FULL_FRAME)
            || (kind == Some(NON_LAST_FRAGMENT)
                && payload.len() >= FIRST_FRAGMENT_OVERHEAD
                && payload[1] == 0)
        {
            return;
        }
        pop_frame(mac, rx_pool, rx_data, conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::MacCore;
    use crate::mac::connection::{Connection, ConnectionCfg};
    use crate::xlayer::{BufKind, BufPtr, CircularData, NodePool, XlayerNode};

    extern crate std;

    fn mac_with_connection() -> MacCore {
        let mut mac = MacCore::new(0xAA);
        let cfg = ConnectionCfg {
            source_address: 0xAA,
            destination_address: 0xBB,
            fifo_size: 8,
            max_payload_size: 8,
            ..ConnectionCfg::default()
        };
        let _ = mac.connections.push(Connection::new(&cfg));
        mac
    }

    /// Stage a received fragment the way the MAC delivers frames: payload
    /// bytes in the RX arena, descriptor queued on the connection.
    fn push_rx_frame(
        mac: &mut MacCore,
        pool: &mut NodePool,
        arena: &mut CircularData,
        bytes: &[u8],
    ) {
        let node = pool.get_free_node().unwrap();
        let offset = arena.allocate(bytes.len() as u16).unwrap();
        arena.slice(offset, bytes.len() as u16).copy_from_slice(bytes);
        {
            let frame = &mut pool.node_mut(node).xlayer.frame;
            frame.payload_memory = BufPtr::new(BufKind::RxArena, offset);
            frame.payload_begin = frame.payload_memory;
            frame.payload_end = frame.payload_begin.add(bytes.len() as u16);
            frame.max_frame_size = bytes.len() as u16;
        }
        let conn = &mut mac.connections[0];
        assert!(pool.enqueue(&mut conn.xlayer_queue, node));
    }

    #[test]
    fn small_payload_travels_as_one_full_frame() {
        let mut nodes = std::vec![XlayerNode::default(); 8];
        let mut pool = NodePool::new(&mut nodes);
        let mut mem = std::vec![0u8; 256];
        let mut arena = CircularData::new(&mut mem);
        let mut mac = mac_with_connection();
        let mut frag = FragState::default();
        frag.enable();

        let conn = crate::ConnectionId(0);
        send(&mut mac, &mut pool, &mut arena, conn, &[1, 2, 3], 0, &mut frag).unwrap();
        assert_eq!(mac.conn(conn).xlayer_queue.size(), 1);

        let node = mac.conn(conn).xlayer_queue.peek().unwrap();
        let frame = &pool.node(node).xlayer.frame;
        let begin = frame.payload_begin;
        let len = frame.payload_size();
        let bytes = arena.slice(begin.offset, len);
        assert_eq!(bytes[0] & TYPE_MASK, FULL_FRAME);
        assert_eq!(&bytes[1..], &[1, 2, 3]);
    }

    #[test]
    fn large_payload_fragments_and_reassembles() {
        let mut tx_nodes = std::vec![XlayerNode::default(); 8];
        let mut tx_pool = NodePool::new(&mut tx_nodes);
        let mut tx_mem = std::vec![0u8; 256];
        let mut tx_arena = CircularData::new(&mut tx_mem);
        let mut mac = mac_with_connection();
        let mut frag = FragState::default();
        frag.enable();
        let conn = crate::ConnectionId(0);

        let payload: std::vec::Vec<u8> = (0u8..20).collect();
        send(&mut mac, &mut tx_pool, &mut tx_arena, conn, &payload, 0, &mut frag).unwrap();
        // Budget 8: first carries 4 bytes, middles 6, last the rest.
        assert_eq!(mac.conn(conn).xlayer_queue.size(), 4);

        // Replay the fragment payloads through the RX side.
        let mut fragments = std::vec::Vec::new();
        while let Some(node) = tx_pool.dequeue(&mut mac.connections[0].xlayer_queue) {
            let frame = &tx_pool.node(node).xlayer.frame;
            let bytes = tx_arena
                .slice_ref(frame.payload_begin.offset, frame.payload_size())
                .to_vec();
            fragments.push(bytes);
            tx_pool.free_node(node);
        }

        let mut rx_nodes = std::vec![XlayerNode::default(); 8];
        let mut rx_pool = NodePool::new(&mut rx_nodes);
        let mut rx_mem = std::vec![0u8; 256];
        let mut rx_arena = CircularData::new(&mut rx_mem);
        for bytes in &fragments {
            push_rx_frame(&mut mac, &mut rx_pool, &mut rx_arena, bytes);
        }

        assert_eq!(read_size(&mut mac, &mut rx_pool, &mut rx_arena, conn).unwrap(), 20);
        let mut out = [0u8; 64];
        let n = read(&mut mac, &mut rx_pool, &mut rx_arena, conn, &mut out).unwrap();
        assert_eq!(&out[..n], payload.as_slice());
        assert_eq!(mac.conn(conn).xlayer_queue.size(), 0);
    }

    #[test]
    fn out_of_order_fragment_is_flushed_with_error() {
        let mut rx_nodes = std::vec![XlayerNode::default(); 8];
        let mut rx_pool = NodePool::new(&mut rx_nodes);
        let mut rx_mem = std::vec![0u8; 256];
        let mut rx_arena = CircularData::new(&mut rx_mem);
        let mut mac = mac_with_connection();
        let conn = crate::ConnectionId(0);

        // A middle fragment with a non-zero index arrives first.
        push_rx_frame(&mut mac, &mut rx_pool, &mut rx_arena, &[ctrl(NON_LAST_FRAGMENT, 1), 2, 9, 9]);
        // Followed by the start of a fresh transaction.
        push_rx_frame(
            &mut mac,
            &mut rx_pool,
            &mut rx_arena,
            &[ctrl(FULL_FRAME, 2), 0xAB],
        );

        let mut out = [0u8; 16];
        assert_eq!(
            read(&mut mac, &mut rx_pool, &mut rx_arena, conn, &mut out),
            Err(WpsError::FragmentError)
        );
        // The malformed transaction is gone, the fresh one survives.
        let n = read(&mut mac, &mut rx_pool, &mut rx_arena, conn, &mut out).unwrap();
        assert_eq!(&out[..n], &[0xAB]);
    }

    #[test]
    fn oversized_reassembly_reports_wrong_rx_size() {
        let mut rx_nodes = std::vec![XlayerNode::default(); 8];
        let mut rx_pool = NodePool::new(&mut rx_nodes);
        let mut rx_mem = std::vec![0u8; 256];
        let mut rx_arena = CircularData::new(&mut rx_mem);
        let mut mac = mac_with_connection();
        let conn = crate::ConnectionId(0);

        let mut first = std::vec![ctrl(NON_LAST_FRAGMENT, 0), 0];
        first.extend_from_slice(&100u16.to_le_bytes());
        first.extend_from_slice(&[0; 4]);
        push_rx_frame(&mut mac, &mut rx_pool, &mut rx_arena, &first);

        let mut out = [0u8; 16];
        assert_eq!(
            read(&mut mac, &mut rx_pool, &mut rx_arena, conn, &mut out),
            Err(WpsError::WrongRxSize)
        );
    }
}
