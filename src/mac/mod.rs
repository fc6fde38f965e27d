//! # MAC layer and TDMA scheduler
//!
//! Drives one timeslot per radio wakeup: advances the schedule (honoring
//! per-connection throttle patterns), picks the highest-priority
//! connection with traffic, acquires or reserves a frame descriptor,
//! composes the link-protocol header and stages the PHY configuration.
//! After the PHY reports the exchange outcome, the MAC updates
//! synchronization and statistics, walks the ARQ / credit / connect-status
//! machines and defers the application callbacks.

#[cfg(feature = "certification")]
pub mod certification;
pub mod connection;
pub mod frag;

use heapless::Vec;

use crate::ConnectionId;
use crate::callback::{CallbackQueue, WpsCallback};
use crate::config::{
    HEADER_MAX_SIZE, MAX_CONNECTION_COUNT, PATTERN_THROTTLE_GRANULARITY, RADIO_MAX_PACKET_SIZE,
    SPI_BURST_PREFIX_SIZE,
};
use crate::error::{WpsError, WpsEvent};
use crate::link::channel_hopping::ChannelHopping;
use crate::link::ddcm::LinkDdcm;
use crate::link::protocol::FieldId;
use crate::link::rdo::LinkRdo;
use crate::link::scheduler::{Scheduler, SleepLvl, highest_priority_conn_index};
use crate::link::tdma_sync::TdmaSync;
use crate::phy::{PhyFrameCfg, PhyOutput};
use crate::request::{RequestQueue, ScheduleRatioCfg};
use crate::xlayer::{BufKind, BufPtr, CircularData, FrameOutcome, NodeIdx, NodePool, Xlayer};
use connection::{Connection, RangingMode};

/// Bit flagging an auto-reply timeslot in the header timeslot byte.
pub const BIT_AUTO_REPLY_TIMESLOT: u8 = 0x80;
/// Mask of the timeslot index in the header timeslot byte.
pub const TIMESLOT_VALUE_MASK: u8 = 0x7F;

/// Extra listening margin added to the expected frame start, in PLL
/// cycles, to absorb residual clock drift.
const RX_TIMEOUT_MARGIN_PLL: u32 = 256;
/// Radio power-up delay budgeted before each slot, in PLL cycles.
const POWER_UP_DELAY_PLL: u16 = 100;

/// Role of this node in the network.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WpsRole {
    /// Dictates the network timing.
    #[default]
    Coordinator,
    /// Follows the coordinator's timing.
    Node,
}

/// Reference to the frame descriptor a timeslot operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlayerRef {
    /// Node of the TX pool (frame bytes in the TX arena).
    TxNode(NodeIdx),
    /// Node of the RX pool (header in the node block, payload in the RX
    /// arena).
    RxNode(NodeIdx),
    /// The MAC's empty/sync TX frame backed by the scratch buffer.
    EmptyTx,
    /// The MAC's overrun RX frame backed by the scratch buffer.
    EmptyRx,
    /// The MAC's auto-reply frame for slots without a dedicated
    /// auto-reply connection.
    EmptyAutoReply,
}

/// MAC layer state.
pub struct MacCore {
    pub local_address: u16,
    pub syncing_address: u16,
    pub node_role: WpsRole,
    pub network_id: u8,
    pub connections: Vec<Connection, MAX_CONNECTION_COUNT>,
    pub scheduler: Scheduler,
    pub channel_hopping: ChannelHopping,
    pub tdma_sync: TdmaSync,
    pub link_rdo: LinkRdo,
    pub link_ddcm: LinkDdcm,
    pub fast_sync_enabled: bool,
    pub callback_queue: CallbackQueue,
    pub request_queue: RequestQueue,

    /* current timeslot working state */
    main_connection_idx: u8,
    auto_connection_idx: u8,
    main_ack_connection_idx: u8,
    pub main_conn: Option<ConnectionId>,
    pub auto_conn: Option<ConnectionId>,
    pub main_xlayer: XlayerRef,
    pub auto_xlayer: Option<XlayerRef>,
    pub rx_node: Option<NodeIdx>,
    pub channel_index: u8,
    /// Staged PHY configuration of the current slot.
    pub cfg: PhyFrameCfg,
    /// The next prepared slot runs in syncing (non-stop RX) mode.
    pub syncing_slot: bool,

    /* empty frame machinery */
    pub empty_frame_tx: Xlayer,
    pub empty_frame_rx: Xlayer,
    pub empty_auto_reply_frame: Xlayer,
    pub scratch_buffer: [u8; RADIO_MAX_PACKET_SIZE],
    pub auto_reply_buffer: [u8; HEADER_MAX_SIZE + 1],

    pub max_expected_header_size: u8,
    pub max_expected_payload_size: u8,
    pub preamble_len_bits: u32,
    pub syncword_len_bits: u32,

    delay_in_last_timeslot: bool,
    last_timeslot_delay: i32,
    /// Payload capacity of the connection the last received frame routed
    /// to; sizes the RX arena allocation.
    rx_alloc_payload_size: u8,
    pub disconnect_requested: bool,
    /// Stay synchronized but stop carrying application payloads.
    pub halted: bool,
    pub fatal_error: Option<WpsError>,
}

impl MacCore {
    pub fn new(local_address: u16) -> Self {
        Self {
            local_address,
            syncing_address: local_address,
            node_role: WpsRole::Coordinator,
            network_id: 0,
            connections: Vec::new(),
            scheduler: Scheduler::default(),
            channel_hopping: ChannelHopping::default(),
            tdma_sync: TdmaSync::default(),
            link_rdo: LinkRdo::default(),
            link_ddcm: LinkDdcm::default(),
            fast_sync_enabled: false,
            callback_queue: CallbackQueue::default(),
            request_queue: RequestQueue::default(),
            main_connection_idx: 0,
            auto_connection_idx: 0,
            main_ack_connection_idx: 0,
            main_conn: None,
            auto_conn: None,
            main_xlayer: XlayerRef::EmptyTx,
            auto_xlayer: None,
            rx_node: None,
            channel_index: 0,
            cfg: PhyFrameCfg::default(),
            syncing_slot: false,
            empty_frame_tx: Xlayer::default(),
            empty_frame_rx: Xlayer::default(),
            empty_auto_reply_frame: Xlayer::default(),
            scratch_buffer: [0u8; RADIO_MAX_PACKET_SIZE],
            auto_reply_buffer: [0u8; HEADER_MAX_SIZE + 1],
            max_expected_header_size: 0,
            max_expected_payload_size: 0,
            preamble_len_bits: 0,
            syncword_len_bits: 0,
            delay_in_last_timeslot: false,
            last_timeslot_delay: 0,
            rx_alloc_payload_size: 0,
            disconnect_requested: false,
            halted: false,
            fatal_error: None,
        }
    }

    pub fn conn(&self, id: ConnectionId) -> &Connection {
        &self.connections[usize::from(id.0)]
    }

    pub fn conn_mut(&mut self, id: ConnectionId) -> &mut Connection {
        &mut self.connections[usize::from(id.0)]
    }

    pub fn is_network_node(&self) -> bool {
        self.node_role == WpsRole::Node
    }

    fn is_synced(&self) -> bool {
        !self.is_network_node() || self.tdma_sync.is_slave_synced()
    }

    /// Reset the sync machinery after a crash or reconnect.
    pub fn reset(&mut self) {
        self.tdma_sync.reset();
        self.delay_in_last_timeslot = false;
        self.last_timeslot_delay = 0;
    }

    /// Every connection sends a sync frame again after a connect event.
    pub fn reset_connections_parameters(&mut self) {
        for conn in self.connections.iter_mut() {
            conn.first_tx_after_connect = true;
        }
    }

    fn enqueue_callback(&mut self, callback: Option<WpsCallback>, connection: ConnectionId) {
        self.callback_queue.enqueue(callback, connection);
    }

    fn raise_event(&mut self, connection: ConnectionId, event: WpsEvent, error: Option<WpsError>) {
        let cb = {
            let conn = self.conn_mut(connection);
            conn.wps_event = event;
            conn.wps_error = error;
            conn.evt_callback
        };
        self.enqueue_callback(cb, connection);
    }

    /* ------------------------------------------------------------------ */
    /* Frame routing and RX buffers                                        */
    /* ------------------------------------------------------------------ */

    /// Route a received frame to its connection using the timeslot and
    /// connection-id header fields. Called by the PHY before it pulls the
    /// payload, so the payload lands in the right connection's budget.
    pub fn route_received_frame(&mut self, is_main: bool, header: &[u8]) {
        let ts = self.scheduler.current_timeslot();
        let (candidates, proto_conn) = if is_main {
            (&ts.main_connections, ts.main_connections.first())
        } else {
            (&ts.auto_connections, ts.auto_connections.first())
        };
        let Some(&proto_conn) = proto_conn else {
            return;
        };

        let mut routed_idx = 0u8;
        if candidates.len() > 1 {
            // Locate the connection-id field in the shared slot layout.
            let proto = if is_main {
                &self.conn(proto_conn).link_protocol
            } else {
                &self.conn(proto_conn).auto_link_protocol
            };
            let mut offset = 0usize;
            for field in proto.fields() {
                if field.id == FieldId::ConnectionId {
                    if let Some(&value) = header.get(offset) {
                        routed_idx = value.min(candidates.len() as u8 - 1);
                    }
                    break;
                }
                offset += usize::from(field.size);
            }
        }

        let routed = candidates[usize::from(routed_idx)];
        if is_main {
            self.main_connection_idx = routed_idx;
            self.main_conn = Some(routed);
            self.scheduler.current_timeslot_mut().last_used_main_connection = routed_idx;
        } else {
            self.auto_connection_idx = routed_idx;
            self.auto_conn = Some(routed);
        }
        self.rx_alloc_payload_size = self.conn(routed).payload_size;
    }

    /// Payload capacity to reserve for the routed frame.
    pub fn rx_alloc_size(&self) -> u8 {
        self.rx_alloc_payload_size
    }

    /// Release an RX node together with its arena payload block.
    fn free_rx_node_with_data(&mut self, rx_pool: &mut NodePool, rx_data: &mut CircularData) {
        let Some(node) = self.rx_node.take() else {
            return;
        };
        let frame = &mut rx_pool.node_mut(node).xlayer.frame;
        if frame.payload_memory.kind == BufKind::RxArena && frame.max_frame_size != 0 {
            rx_data.free(frame.payload_memory.offset, frame.max_frame_size);
        }
        frame.payload_memory = BufPtr::NULL;
        frame.max_frame_size = 0;
        rx_pool.free_node(node);
    }

    /* ------------------------------------------------------------------ */
    /* Header composition and extraction                                   */
    /* ------------------------------------------------------------------ */

    /// Compose the header field values of `conn_id` into `out`.
    fn compose_header(&mut self, conn_id: ConnectionId, ack: bool, out: &mut [u8]) -> usize {
        let ts_num = self.scheduler.current_time_slot_num();
        let conn_idx = if ack { self.auto_connection_idx } else { self.main_connection_idx };
        let phases = self.cfg.phases_info;

        let conn = &self.connections[usize::from(conn_id.0)];
        let proto = if ack { &conn.auto_link_protocol } else { &conn.link_protocol };
        let mut offset = 0usize;
        for field in proto.fields() {
            let size = usize::from(field.size);
            match field.id {
                FieldId::TimeslotId => {
                    let mut value = ts_num & TIMESLOT_VALUE_MASK;
                    if ack {
                        value |= BIT_AUTO_REPLY_TIMESLOT;
                    }
                    out[offset] = value;
                }
                FieldId::ConnectionId => out[offset] = conn_idx,
                FieldId::RdoOffset => self.link_rdo.send_offset(&mut out[offset..offset + 2]),
                FieldId::CreditControl => {
                    out[offset] = conn.xlayer_queue.free_space().min(255) as u8;
                }
                FieldId::RangingPhases => {
                    let bytes = phases.unwrap_or_default().to_bytes();
                    out[offset..offset + bytes.len().min(size)]
                        .copy_from_slice(&bytes[..bytes.len().min(size)]);
                }
            }
            offset += size;
        }
        offset
    }

    /// Fill the header of a staged TX frame through the link protocol (or
    /// the certification pattern when the mode is active).
    pub fn fill_header(
        &mut self,
        conn_id: ConnectionId,
        frame_ref: XlayerRef,
        ack: bool,
        tx_pool: &mut NodePool,
        tx_data: &mut CircularData,
    ) {
        let header_size = {
            let conn = self.conn(conn_id);
            if ack { conn.ack_header_size } else { conn.header_size }
        };
        if header_size == 0 {
            return;
        }

        let mut bytes = [0u8; HEADER_MAX_SIZE];
        #[cfg(feature = "certification")]
        let composed = if self.conn(conn_id).certification_mode_enabled {
            certification::fill_header(&mut bytes[..usize::from(header_size)]);
            usize::from(header_size)
        } else {
            self.compose_header(conn_id, ack, &mut bytes)
        };
        #[cfg(not(feature = "certification"))]
        let composed = self.compose_header(conn_id, ack, &mut bytes);
        let n = composed.min(usize::from(header_size));

        // Position the header right before the payload and copy it in.
        match frame_ref {
            XlayerRef::TxNode(idx) => {
                let frame = &mut tx_pool.node_mut(idx).xlayer.frame;
                Self::position_header(frame, header_size);
                let begin = frame.header_begin;
                let dst = tx_data.slice(begin.offset, u16::from(header_size));
                dst[..n].copy_from_slice(&bytes[..n]);
            }
            XlayerRef::EmptyTx => {
                let frame = &mut self.empty_frame_tx.frame;
                Self::position_header(frame, header_size);
                let begin = frame.header_begin;
                let dst = &mut self.scratch_buffer[usize::from(begin.offset)..];
                dst[..n].copy_from_slice(&bytes[..n]);
            }
            XlayerRef::EmptyAutoReply => {
                let frame = &mut self.empty_auto_reply_frame.frame;
                Self::position_header(frame, header_size);
                let begin = frame.header_begin;
                let dst = &mut self.auto_reply_buffer[usize::from(begin.offset)..];
                dst[..n].copy_from_slice(&bytes[..n]);
            }
            XlayerRef::RxNode(_) | XlayerRef::EmptyRx => {}
        }
    }

    fn position_header(frame: &mut crate::xlayer::XlayerFrame, header_size: u8) {
        let size = u16::from(header_size);
        if frame.user_payload {
            frame.header_begin = frame.header_begin.sub(size);
        } else {
            // Header and payload share one contiguous block.
            frame.header_begin = frame.payload_begin.sub(size);
            frame.header_end = frame.header_begin.add(size);
        }
    }

    /// Extract the header fields of a received frame and feed the link
    /// modules. `header` excludes the radio size byte.
    fn extract_header_fields(&mut self, conn_id: ConnectionId, ack: bool, header: &[u8]) {
        let mut remote_phases = None;
        let mut credits = None;
        let mut rdo_bytes = None;

        {
            let conn = self.conn(conn_id);
            let proto = if ack { &conn.auto_link_protocol } else { &conn.link_protocol };
            let mut offset = 0usize;
            for field in proto.fields() {
                let size = usize::from(field.size);
                if header.len() < offset + size {
                    break;
                }
                match field.id {
                    FieldId::TimeslotId | FieldId::ConnectionId => {}
                    FieldId::RdoOffset => {
                        rdo_bytes = Some([header[offset], header[offset + 1]]);
                    }
                    FieldId::CreditControl => credits = Some(header[offset]),
                    FieldId::RangingPhases => {
                        remote_phases =
                            Some(crate::link::phase::PhaseInfo::from_bytes(&header[offset..]));
                    }
                }
                offset += size;
            }
        }

        if let Some(bytes) = rdo_bytes {
            self.link_rdo.set_offset(&bytes);
        }
        if let Some(credits) = credits {
            self.conn_mut(conn_id).credit_flow_ctrl.set_credits(credits);
        }
        if let Some(remote) = remote_phases {
            let local = self.cfg.phases_info.unwrap_or_default();
            let ready = self.conn_mut(conn_id).link_phase.push(local, remote);
            if ready {
                let cb = self.conn(conn_id).ranging_data_ready_callback;
                self.enqueue_callback(cb, conn_id);
            }
        }
    }

    /// Copy out the received header of `frame_ref`, skip the radio size
    /// byte, run the field extraction and advance the header iterator.
    fn extract_header(
        &mut self,
        conn_id: ConnectionId,
        frame_ref: XlayerRef,
        ack: bool,
        rx_pool: &mut NodePool,
    ) {
        let header_size = {
            let conn = self.conn(conn_id);
            if ack { conn.ack_header_size } else { conn.header_size }
        };

        let mut bytes = [0u8; HEADER_MAX_SIZE];
        let n = usize::from(header_size).min(HEADER_MAX_SIZE);
        match frame_ref {
            XlayerRef::RxNode(idx) => {
                {
                    let block = rx_pool.header_block(idx);
                    let avail = block.len().saturating_sub(1).min(n);
                    bytes[..avail].copy_from_slice(&block[1..1 + avail]);
                }
                let frame = &mut rx_pool.node_mut(idx).xlayer.frame;
                frame.header_begin = frame.header_memory.add(1 + header_size as u16);
            }
            XlayerRef::EmptyRx => {
                let avail = self.scratch_buffer.len().saturating_sub(1).min(n);
                let mut tmp = [0u8; HEADER_MAX_SIZE];
                tmp[..avail].copy_from_slice(&self.scratch_buffer[1..1 + avail]);
                bytes = tmp;
                let frame = &mut self.empty_frame_rx.frame;
                frame.header_begin = frame.header_memory.add(1 + header_size as u16);
            }
            XlayerRef::EmptyAutoReply => {
                let avail = self.auto_reply_buffer.len().saturating_sub(1).min(n);
                let mut tmp = [0u8; HEADER_MAX_SIZE];
                tmp[..avail].copy_from_slice(&self.auto_reply_buffer[1..1 + avail]);
                bytes = tmp;
                let frame = &mut self.empty_auto_reply_frame.frame;
                frame.header_begin = frame.header_memory.add(1 + header_size as u16);
            }
            XlayerRef::TxNode(_) | XlayerRef::EmptyTx => return,
        }

        self.extract_header_fields(conn_id, ack, &bytes[..n]);
    }

    /* ------------------------------------------------------------------ */
    /* Outcome processing                                                  */
    /* ------------------------------------------------------------------ */

    fn update_connect_status(
        &mut self,
        conn_id: ConnectionId,
        outcome: FrameOutcome,
        synced: bool,
        ack_enabled: bool,
    ) {
        let changed = self
            .conn_mut(conn_id)
            .connect_status
            .update(outcome, synced, ack_enabled);
        if changed {
            let connected = self.conn(conn_id).connect_status.is_connected();
            let event = if connected { WpsEvent::Connect } else { WpsEvent::Disconnect };
            self.raise_event(conn_id, event, None);
        }
    }

    /// Update TDMA sync from the outcome of the main exchange.
    pub fn update_sync(&mut self, main_outcome: FrameOutcome) {
        if self.syncing_slot {
            self.cfg.rx_wait_time = 0;
        }
        if !self.is_network_node() {
            return;
        }
        let Some(main) = self.main_conn else {
            return;
        };
        let cca = self.conn(main).cca.clone();
        if !self.tdma_sync.is_slave_synced() {
            self.tdma_sync.slave_find(
                main_outcome,
                self.cfg.rx_wait_time,
                &cca,
                self.cfg.rx_cca_retry_count,
            );
        } else if self.conn(main).source_address == self.syncing_address {
            self.tdma_sync.slave_adjust(
                main_outcome,
                self.cfg.rx_wait_time,
                &cca,
                self.cfg.rx_cca_retry_count,
            );
        }
    }

    /// Digest the reception (or miss) of the main frame.
    pub fn process_rx_main(
        &mut self,
        received: bool,
        rx_pool: &mut NodePool,
        rx_data: &mut CircularData,
    ) {
        let synced = self.is_synced();
        self.link_ddcm.pll_cycles_update(self.tdma_sync.sleep_cycles());

        let Some(main) = self.main_conn else {
            return;
        };
        let ack_enabled = self.conn(main).ack_enable;
        let outcome = self.xlayer_frame_outcome(self.main_xlayer, rx_pool, rx_pool);

        if !received {
            // None of the slot's connections got a frame.
            let ts_conns = self.scheduler.current_timeslot().main_connections.clone();
            for conn in ts_conns {
                self.update_connect_status(conn, outcome, synced, ack_enabled);
            }
            self.free_rx_node_with_data(rx_pool, rx_data);
            self.note_main_outcome(FrameOutcome::Lost, true);
            return;
        }

        // The routing done at payload time already picked the connection;
        // now pull the field values out of the header.
        self.extract_header(main, self.main_xlayer, false, rx_pool);
        let main = self.main_conn.unwrap_or(main);

        self.update_connect_status(main, FrameOutcome::Received, synced, ack_enabled);

        let seq = self.cfg.rx_seq_num;
        self.conn_mut(main).stop_and_wait_arq.update_rx_seq_num(seq);
        let duplicate = self.conn(main).stop_and_wait_arq.is_rx_frame_duplicate();
        let no_payload = self.xlayer_no_payload(self.main_xlayer, rx_pool);

        if duplicate && !no_payload {
            self.conn_mut(main).stop_and_wait_arq.incr_duplicate_count();
        }
        if no_payload || duplicate {
            // Internal (sync or repeated) frame, nothing for the app.
            self.free_rx_node_with_data(rx_pool, rx_data);
            self.note_main_outcome(FrameOutcome::Received, true);
            return;
        }

        self.note_main_outcome(FrameOutcome::Received, false);

        let Some(node) = self.rx_node.take() else {
            // The frame landed in the overrun scratch buffer.
            self.raise_event(main, WpsEvent::Error, Some(WpsError::RxOverrun));
            self.note_rx_overrun(main);
            return;
        };

        if self.conn(main).xlayer_queue.free_space() == 0 {
            self.rx_node = Some(node);
            self.free_rx_node_with_data(rx_pool, rx_data);
            self.raise_event(main, WpsEvent::Error, Some(WpsError::RxOverrun));
            self.note_rx_overrun(main);
            return;
        }

        #[cfg(feature = "stats")]
        {
            let bytes = rx_pool.node(node).xlayer.frame.payload_size() as u32;
            self.conn_mut(main).wps_stats.rx_byte_received += bytes;
        }
        let conn = &mut self.connections[usize::from(main.0)];
        rx_pool.enqueue(&mut conn.xlayer_queue, node);
        let cb = conn.rx_success_callback;
        self.enqueue_callback(cb, main);
    }

    /// Digest the reception (or miss) of the auto-reply frame.
    pub fn process_rx_auto(
        &mut self,
        received: bool,
        rx_pool: &mut NodePool,
        rx_data: &mut CircularData,
    ) {
        self.link_ddcm.pll_cycles_update(self.tdma_sync.sleep_cycles());
        let Some(auto_ref) = self.auto_xlayer else {
            return;
        };
        let Some(auto) = self.auto_conn else {
            // Acknowledge parsed for a main connection without an
            // auto-reply connection.
            if received {
                let main = self.main_ack_connection();
                if let Some(main) = main {
                    self.extract_header(main, auto_ref, true, rx_pool);
                }
            }
            return;
        };

        let outcome = self.xlayer_frame_outcome(auto_ref, rx_pool, rx_pool);

        if !received {
            let ts_conns = self.scheduler.current_timeslot().auto_connections.clone();
            for conn in ts_conns {
                self.update_connect_status(conn, outcome, true, true);
            }
            self.free_rx_node_with_data(rx_pool, rx_data);
            self.note_auto_outcome(outcome, true);
            return;
        }

        self.extract_header(auto, auto_ref, false, rx_pool);
        let auto = self.auto_conn.unwrap_or(auto);
        self.update_connect_status(auto, FrameOutcome::Received, true, false);

        let no_payload = self.xlayer_no_payload(auto_ref, rx_pool);
        if no_payload {
            self.free_rx_node_with_data(rx_pool, rx_data);
            self.note_auto_outcome(FrameOutcome::Received, true);
            return;
        }

        self.note_auto_outcome(FrameOutcome::Received, false);

        let Some(node) = self.rx_node.take() else {
            self.raise_event(auto, WpsEvent::Error, Some(WpsError::RxOverrun));
            self.note_rx_overrun(auto);
            return;
        };
        if self.conn(auto).xlayer_queue.free_space() == 0 {
            self.rx_node = Some(node);
            self.free_rx_node_with_data(rx_pool, rx_data);
            self.raise_event(auto, WpsEvent::Error, Some(WpsError::RxOverrun));
            self.note_rx_overrun(auto);
            return;
        }

        #[cfg(feature = "stats")]
        {
            let bytes = rx_pool.node(node).xlayer.frame.payload_size() as u32;
            self.conn_mut(auto).wps_stats.rx_byte_received += bytes;
        }
        let conn = &mut self.connections[usize::from(auto.0)];
        rx_pool.enqueue(&mut conn.xlayer_queue, node);
        let cb = conn.rx_success_callback;
        self.enqueue_callback(cb, auto);
    }

    /// Digest the outcome of a main transmission.
    pub fn process_tx_main(
        &mut self,
        sent_ack: bool,
        tx_pool: &mut NodePool,
        tx_data: &mut CircularData,
        now: u64,
    ) {
        let Some(main) = self.main_conn else {
            return;
        };
        let ack_enable = self.conn(main).ack_enable;
        let tx_success = sent_ack || !ack_enable;
        let outcome = self.xlayer_frame_outcome(self.main_xlayer, tx_pool, tx_pool);

        if tx_success {
            self.update_connect_status(main, FrameOutcome::SentAck, true, ack_enable);
            let cb = self.conn(main).tx_success_callback;
            self.enqueue_callback(cb, main);
            if self.conn(main).stop_and_wait_arq.is_enabled() {
                let conn = self.conn_mut(main);
                conn.stop_and_wait_arq.inc_seq_num();
                conn.credit_flow_ctrl.frame_ack_received();
            }
            self.note_tx_result(main, self.main_xlayer, tx_pool, true);
            self.send_done(main, tx_pool, tx_data, now);
        } else {
            let ts_conns = self.scheduler.current_timeslot().main_connections.clone();
            for conn in ts_conns {
                let ack = self.conn(conn).ack_enable;
                self.update_connect_status(conn, outcome, true, ack);
            }
            let cb = self.conn(main).tx_fail_callback;
            self.enqueue_callback(cb, main);
            self.note_tx_result(main, self.main_xlayer, tx_pool, false);
            // A CCA abort leaves the frame queued; an unacknowledged send
            // without ARQ is spent.
            if outcome != FrameOutcome::Wait && !self.conn(main).stop_and_wait_arq.is_enabled() {
                self.send_done(main, tx_pool, tx_data, now);
            }
        }

        self.note_cca(main, outcome);
        self.link_ddcm.pll_cycles_update(self.tdma_sync.sleep_cycles());
        self.link_ddcm
            .post_tx_update(self.cfg.cca_try_count, self.cfg.cca_retry_time, tx_success);
    }

    /// Digest the outcome of an empty (sync) main transmission.
    pub fn process_tx_main_empty(&mut self, sent_ack: bool) {
        let Some(main) = self.main_conn else {
            return;
        };
        let ts_conns = self.scheduler.current_timeslot().main_connections.clone();
        for conn in ts_conns {
            let ack = self.conn(conn).ack_enable;
            let outcome = if sent_ack { FrameOutcome::SentAck } else { FrameOutcome::SentAckLost };
            self.update_connect_status(conn, outcome, true, ack);
        }

        // The sync frame was acknowledged: real traffic may flow.
        if self.conn(main).first_tx_after_connect
            && self.node_role == WpsRole::Coordinator
            && self.conn(main).connect_status.is_connected()
        {
            self.conn_mut(main).first_tx_after_connect = false;
        }

        if sent_ack {
            self.conn_mut(main).stop_and_wait_arq.inc_seq_num();
        }

        self.link_ddcm.pll_cycles_update(self.tdma_sync.sleep_cycles());
    }

    /// Digest the outcome of an auto-reply transmission.
    pub fn process_tx_auto(
        &mut self,
        signal: PhyOutput,
        tx_pool: &mut NodePool,
        tx_data: &mut CircularData,
        now: u64,
    ) {
        let Some(auto) = self.auto_conn else {
            return;
        };
        let Some(auto_ref) = self.auto_xlayer else {
            return;
        };

        if signal == PhyOutput::FrameNotSent {
            let ts_conns = self.scheduler.current_timeslot().auto_connections.clone();
            for conn in ts_conns {
                self.update_connect_status(conn, FrameOutcome::Lost, true, false);
            }
            self.set_xlayer_outcome(auto_ref, tx_pool, FrameOutcome::Wait);
            let cb = self.conn(auto).tx_fail_callback;
            self.enqueue_callback(cb, auto);
            self.note_tx_result(auto, auto_ref, tx_pool, false);
        } else {
            self.update_connect_status(auto, FrameOutcome::SentAckLost, true, false);
            self.set_xlayer_outcome(auto_ref, tx_pool, FrameOutcome::SentAckLost);
            let cb = self.conn(auto).tx_success_callback;
            self.enqueue_callback(cb, auto);
            self.conn_mut(auto).credit_flow_ctrl.auto_frame_sent();
            self.note_tx_result(auto, auto_ref, tx_pool, true);
            self.send_done(auto, tx_pool, tx_data, now);
        }

        self.link_ddcm.pll_cycles_update(self.tdma_sync.sleep_cycles());
        self.link_ddcm.post_tx_update(
            self.cfg.cca_try_count,
            self.cfg.cca_retry_time,
            signal != PhyOutput::FrameNotSent,
        );
    }

    /// Digest the outcome of an empty auto-reply transmission.
    pub fn process_tx_auto_empty(&mut self, tx_pool: &mut NodePool) {
        let ts_conns = self.scheduler.current_timeslot().auto_connections.clone();
        for conn in ts_conns {
            self.update_connect_status(conn, FrameOutcome::SentAckLost, true, false);
        }
        if let Some(auto_ref) = self.auto_xlayer {
            self.set_xlayer_outcome(auto_ref, tx_pool, FrameOutcome::SentAckLost);
        }
        self.link_ddcm.pll_cycles_update(self.tdma_sync.sleep_cycles());
    }

    /* ------------------------------------------------------------------ */
    /* Timeslot preparation                                                */
    /* ------------------------------------------------------------------ */

    /// Whether this node transmits the main frame of the current slot.
    pub fn is_current_timeslot_tx(&self) -> bool {
        self.main_conn
            .map(|id| self.conn(id).is_tx(self.local_address))
            .unwrap_or(false)
    }

    /// Whether this node transmits the auto-reply of the current slot.
    pub fn is_current_auto_timeslot_tx(&self) -> bool {
        self.auto_conn
            .map(|id| self.conn(id).is_tx(self.local_address))
            .unwrap_or(false)
    }

    fn main_ack_connection(&self) -> Option<ConnectionId> {
        let ts = self.scheduler.current_timeslot();
        ts.main_connections
            .get(usize::from(self.main_ack_connection_idx))
            .copied()
    }

    /// Advance the schedule by one (or more, when throttled) slots and
    /// stage the frames of the new slot.
    pub fn process_next_timeslot(
        &mut self,
        tx_pool: &mut NodePool,
        rx_pool: &mut NodePool,
        tx_data: &mut CircularData,
        now: u64,
        connect_entry: bool,
    ) {
        self.scheduler.reset_sleep_time();
        let mut inc_count = self.scheduler.increment_time_slot();
        self.handle_link_throttle(&mut inc_count);
        self.channel_hopping.increment_sequence(inc_count);

        self.channel_index = self.channel_hopping.channel();
        self.main_connection_idx = 0;
        self.auto_connection_idx = 0;
        self.main_conn = self.scheduler.current_main_connection(0);
        self.auto_conn = self.scheduler.current_auto_connection(0);
        self.syncing_slot = false;
        self.rx_node = None;
        self.auto_xlayer = None;

        if self.is_current_timeslot_tx() {
            self.prepare_tx_main(tx_pool, tx_data, now, connect_entry);
        } else {
            self.prepare_rx_main(rx_pool, now, connect_entry);
        }

        if self.auto_conn.is_some() {
            if self.is_current_auto_timeslot_tx() {
                self.prepare_tx_auto(tx_pool, tx_data, now);
            } else {
                self.prepare_rx_auto(rx_pool);
            }
        } else if let Some(main) = self.main_conn {
            if self.conn(main).ack_frame_enable {
                if self.is_current_timeslot_tx() {
                    self.prepare_rx_empty_conn_auto(main);
                } else {
                    self.prepare_tx_empty_conn_auto();
                }
            }
        }
    }

    /// Walk the throttle patterns; a slot whose every main connection is
    /// disabled is skipped, and the skips count into the hop increment.
    fn handle_link_throttle(&mut self, inc_count: &mut u8) {
        let budget = self.scheduler.size() * PATTERN_THROTTLE_GRANULARITY;
        for _ in 0..budget.max(1) {
            let ts_main = self.scheduler.current_timeslot().main_connections.clone();
            let ts_auto = self.scheduler.current_timeslot().auto_connections.clone();
            for &conn_id in &ts_main {
                let conn = self.conn_mut(conn_id);
                conn.currently_enabled = true;
                if let Some(pattern) = conn.pattern.as_ref() {
                    if conn.pattern_total_count != 0 {
                        conn.pattern_count = (conn.pattern_count + 1) % conn.pattern_total_count;
                        conn.currently_enabled = pattern
                            .get(usize::from(conn.pattern_count))
                            .copied()
                            .unwrap_or(true);
                    }
                }
            }
            for &conn_id in &ts_auto {
                self.conn_mut(conn_id).currently_enabled = true;
            }

            let ts_enabled = ts_main.is_empty()
                || ts_main.iter().any(|&id| self.conn(id).currently_enabled);
            if ts_enabled {
                return;
            }
            *inc_count += self.scheduler.increment_time_slot();
        }
    }

    fn prepare_tx_main(
        &mut self,
        tx_pool: &mut NodePool,
        tx_data: &mut CircularData,
        now: u64,
        connect_entry: bool,
    ) {
        let next_channel = self.channel_hopping.channel();
        let rdo_value = i32::from(self.link_rdo.get_offset());
        let mut timeslot_delay: i32 = 0;
        let sleep_lvl = if connect_entry { SleepLvl::Idle } else { self.scheduler.current_sleep_lvl() };

        self.link_rdo.update_offset();

        if !self.is_network_node() {
            timeslot_delay += i32::from(self.link_ddcm.get_offset());
        }

        let ts_conns = self.scheduler.current_timeslot().main_connections.clone();
        for &conn_id in &ts_conns {
            let (arq_on, guaranteed, flush) = {
                let conn = self.conn(conn_id);
                (
                    conn.stop_and_wait_arq.is_enabled(),
                    conn.stop_and_wait_arq.is_guaranteed_delivery(),
                    conn.tx_flush,
                )
            };
            if arq_on && !guaranteed {
                self.flush_timeout_frames_before_sending(conn_id, tx_pool, tx_data, now);
            }
            if flush {
                self.flush_tx_frame(conn_id, tx_pool, tx_data, now);
            }
        }

        if ts_conns.len() > 1 {
            let priorities = self.scheduler.current_timeslot().main_priorities.clone();
            let idx = highest_priority_conn_index(&priorities, ts_conns.len(), |i| {
                self.conn(ts_conns[i]).xlayer_queue.size() > 0
            });
            self.main_connection_idx = idx;
            self.main_conn = self.scheduler.current_main_connection(idx);
        }

        let Some(main) = self.main_conn else {
            return;
        };

        self.main_xlayer = self.get_xlayer_for_tx_main(main, tx_pool, now);
        self.auto_xlayer = None;

        let headerless_empty = self.main_xlayer == XlayerRef::EmptyTx
            && self.empty_frame_tx.frame.header_memory.is_null();
        if headerless_empty {
            timeslot_delay += self.conn(main).empty_queue_max_delay;
        }
        if self.delay_in_last_timeslot {
            timeslot_delay -= self.last_timeslot_delay;
            self.delay_in_last_timeslot = false;
        }

        let cca = self.conn(main).cca.clone();
        let duration =
            timeslot_delay + self.scheduler.sleep_time() as i32 + rdo_value;
        self.tdma_sync.update_tx(duration, &cca, sleep_lvl);

        if headerless_empty {
            self.last_timeslot_delay = self.conn(main).empty_queue_max_delay;
            self.delay_in_last_timeslot = true;
        }

        if !self.conn(main).connect_status.is_connected() {
            // Link considered broken: maximize gain to improve the odds
            // of resyncing at range.
            let conn = self.conn_mut(main);
            for per_channel in conn.gain_loop.iter_mut() {
                for gain in per_channel.iter_mut() {
                    gain.reset_gain_index();
                }
            }
        }

        let payload_len = self.xlayer_payload_len(self.main_xlayer, tx_pool);
        self.config_tx(main, next_channel, payload_len, connect_entry);
    }

    fn prepare_rx_main(&mut self, rx_pool: &mut NodePool, now: u64, connect_entry: bool) {
        let mut next_channel = self.channel_hopping.channel();
        let rdo_value = i32::from(self.link_rdo.get_offset());
        let mut timeslot_delay: i32 = 0;
        let sleep_lvl = if connect_entry { SleepLvl::Idle } else { self.scheduler.current_sleep_lvl() };

        self.link_rdo.update_offset();
        let _ = now;

        if self.delay_in_last_timeslot {
            timeslot_delay -= self.last_timeslot_delay;
            self.delay_in_last_timeslot = false;
        }

        let Some(main) = self.main_conn else {
            return;
        };

        let cca = self.conn(main).cca.clone();
        let duration = timeslot_delay + self.scheduler.sleep_time() as i32 + rdo_value;
        self.tdma_sync.update_rx(duration, &cca, sleep_lvl);

        self.main_xlayer = self.get_xlayer_for_rx(main, rx_pool);
        self.auto_xlayer = None;

        if !self.tdma_sync.is_slave_synced()
            && self.node_role == WpsRole::Node
            && self.conn(main).source_address == self.syncing_address
            && self.fast_sync_enabled
        {
            self.syncing_slot = true;
            next_channel = self.channel_hopping.middle_channel_idx()
                % self.channel_hopping.sequence_size().max(1) as u8;
        }

        if !self.conn(main).connect_status.is_connected() {
            let conn = self.conn_mut(main);
            for per_channel in conn.gain_loop.iter_mut() {
                for gain in per_channel.iter_mut() {
                    gain.reset_gain_index();
                }
            }
        }

        self.config_rx(main, next_channel, connect_entry);
    }

    fn prepare_tx_auto(&mut self, tx_pool: &mut NodePool, tx_data: &mut CircularData, now: u64) {
        let ts_conns = self.scheduler.current_timeslot().auto_connections.clone();
        for &conn_id in &ts_conns {
            if self.conn(conn_id).tx_flush {
                self.flush_tx_frame(conn_id, tx_pool, tx_data, now);
            }
        }
        if ts_conns.len() > 1 {
            let priorities = self.scheduler.current_timeslot().auto_priorities.clone();
            let idx = highest_priority_conn_index(&priorities, ts_conns.len(), |i| {
                self.conn(ts_conns[i]).xlayer_queue.size() > 0
            });
            self.auto_connection_idx = idx;
            self.auto_conn = self.scheduler.current_auto_connection(idx);
        }
        let Some(auto) = self.auto_conn else {
            return;
        };
        self.auto_xlayer = Some(self.get_xlayer_for_tx_auto(auto, tx_pool, now));
    }

    fn prepare_rx_auto(&mut self, rx_pool: &mut NodePool) {
        let Some(auto) = self.auto_conn else {
            return;
        };
        self.auto_xlayer = Some(self.get_xlayer_for_rx(auto, rx_pool));
    }

    /// Stage a header-only acknowledge for a slot without an auto-reply
    /// connection, on behalf of the main connection that just received.
    fn prepare_tx_empty_conn_auto(&mut self) {
        self.main_ack_connection_idx =
            self.scheduler.current_timeslot().last_used_main_connection;
        let Some(main) = self.main_ack_connection() else {
            return;
        };
        let ack_header_size = self.conn(main).ack_header_size;
        let source_address = self.conn(main).destination_address;
        let destination_address = self.conn(main).source_address;
        let frame = &mut self.empty_auto_reply_frame.frame;
        let base = BufPtr::new(BufKind::AutoReply, 0).add(u16::from(ack_header_size));
        frame.header_memory = BufPtr::new(BufKind::AutoReply, 0);
        frame.header_memory_size = ack_header_size;
        frame.header_begin = base;
        frame.header_end = base;
        frame.payload_begin = base;
        frame.payload_end = base;
        frame.payload_memory = BufPtr::NULL;
        frame.payload_memory_size = 0;
        frame.user_payload = true;
        frame.source_address = source_address;
        frame.destination_address = destination_address;
        self.auto_xlayer = Some(XlayerRef::EmptyAutoReply);
    }

    /// Expect a header-only acknowledge for a slot without an auto-reply
    /// connection.
    fn prepare_rx_empty_conn_auto(&mut self, main: ConnectionId) {
        let ack_header_size = self.conn(main).ack_header_size;
        let source_address = self.conn(main).destination_address;
        let destination_address = self.conn(main).source_address;
        let frame = &mut self.empty_auto_reply_frame.frame;
        frame.header_memory = BufPtr::new(BufKind::AutoReply, 0);
        frame.header_memory_size = ack_header_size;
        frame.header_begin = frame.header_memory;
        frame.header_end = frame.header_memory;
        frame.payload_begin = frame.header_memory;
        frame.payload_end = frame.header_memory;
        frame.payload_memory = BufPtr::NULL;
        frame.payload_memory_size = 0;
        frame.user_payload = false;
        frame.source_address = source_address;
        frame.destination_address = destination_address;
        self.rx_node = None;
        self.auto_xlayer = Some(XlayerRef::EmptyAutoReply);
    }

    /* ------------------------------------------------------------------ */
    /* Frame acquisition                                                   */
    /* ------------------------------------------------------------------ */

    fn build_empty_tx_frame(&mut self, conn_id: ConnectionId, with_header: bool, now: u64) {
        let (header_size, source, destination) = {
            let conn = self.conn(conn_id);
            (conn.header_size, conn.source_address, conn.destination_address)
        };
        let frame = &mut self.empty_frame_tx.frame;
        if with_header {
            frame.header_memory = BufPtr::new(BufKind::Scratch, 0);
            frame.header_end = BufPtr::new(BufKind::Scratch, u16::from(header_size));
        } else {
            frame.header_memory = BufPtr::NULL;
            frame.header_end = BufPtr::NULL;
        }
        frame.header_begin = frame.header_end;
        frame.payload_begin = frame.header_end;
        frame.payload_end = frame.header_end;
        frame.payload_memory = BufPtr::NULL;
        frame.payload_memory_size = 0;
        frame.user_payload = true;
        frame.time_stamp = now;
        frame.source_address = source;
        frame.destination_address = destination;
        frame.frame_outcome = FrameOutcome::Wait;
    }

    /// Frame to transmit on the main connection of the slot: the pending
    /// application frame, a sync frame, or nothing but a wakeup.
    fn get_xlayer_for_tx_main(
        &mut self,
        conn_id: ConnectionId,
        tx_pool: &mut NodePool,
        now: u64,
    ) -> XlayerRef {
        let unsync = self.is_network_node() && !self.tdma_sync.is_slave_synced();
        let valid_credits = self.conn_mut(conn_id).credit_flow_ctrl.is_available();

        let node = if self.conn(conn_id).currently_enabled && valid_credits && !self.halted {
            self.conn(conn_id).xlayer_queue.peek()
        } else {
            None
        };

        // A coordinator that just connected syncs the peer with a header
        // frame before releasing real traffic.
        if self.conn(conn_id).first_tx_after_connect
            && node.is_some()
            && self.node_role == WpsRole::Coordinator
        {
            self.build_empty_tx_frame(conn_id, true, now);
            return XlayerRef::EmptyTx;
        }

        match node {
            Some(node) if !unsync => {
                let frame = &mut tx_pool.node_mut(node).xlayer.frame;
                frame.header_begin = frame.header_end;
                XlayerRef::TxNode(node)
            }
            _ => {
                let skipped_exceeded =
                    self.conn(conn_id).credit_flow_ctrl.is_skipped_frames_exceeded();
                let with_header =
                    (self.conn(conn_id).auto_sync_enable && !unsync) || skipped_exceeded;
                self.build_empty_tx_frame(conn_id, with_header, now);
                XlayerRef::EmptyTx
            }
        }
    }

    /// Frame to transmit on the auto-reply connection of the slot.
    fn get_xlayer_for_tx_auto(
        &mut self,
        conn_id: ConnectionId,
        tx_pool: &mut NodePool,
        now: u64,
    ) -> XlayerRef {
        let unsync = self.is_network_node() && !self.tdma_sync.is_slave_synced();
        let valid_credits = self.conn_mut(conn_id).credit_flow_ctrl.is_available();

        let node = if self.conn(conn_id).currently_enabled && valid_credits && !self.halted {
            self.conn(conn_id).xlayer_queue.peek()
        } else {
            None
        };

        match node {
            Some(node) if !unsync => {
                let frame = &mut tx_pool.node_mut(node).xlayer.frame;
                frame.header_begin = frame.header_end;
                XlayerRef::TxNode(node)
            }
            _ => {
                let force_empty = self.conn(conn_id).credit_flow_ctrl.is_enabled()
                    || self.conn(conn_id).ranging_mode != RangingMode::Disabled;
                let with_header =
                    (self.conn(conn_id).auto_sync_enable && !unsync) || force_empty;
                self.build_empty_tx_frame(conn_id, with_header, now);
                XlayerRef::EmptyTx
            }
        }
    }

    /// Frame descriptor to receive into; falls back to the overrun
    /// scratch frame when the pool is dry.
    fn get_xlayer_for_rx(&mut self, conn_id: ConnectionId, rx_pool: &mut NodePool) -> XlayerRef {
        let (payload_size, header_size, source, destination) = {
            let conn = self.conn(conn_id);
            (
                conn.payload_size,
                conn.header_size,
                conn.source_address,
                conn.destination_address,
            )
        };
        self.rx_alloc_payload_size = payload_size;
        self.rx_node = rx_pool.get_free_node();

        match self.rx_node {
            None => {
                let frame = &mut self.empty_frame_rx.frame;
                frame.header_memory = BufPtr::new(BufKind::Scratch, 0);
                frame.header_memory_size = header_size;
                frame.header_begin = frame.header_memory;
                frame.header_end = frame.header_memory;
                frame.payload_begin = BufPtr::new(
                    BufKind::Scratch,
                    u16::from(header_size) + 1,
                );
                frame.payload_end = frame.payload_begin;
                frame.payload_memory = BufPtr::NULL;
                frame.payload_memory_size = payload_size;
                frame.source_address = source;
                frame.destination_address = destination;
                frame.frame_outcome = FrameOutcome::Wait;
                XlayerRef::EmptyRx
            }
            Some(node) => {
                let frame = &mut rx_pool.node_mut(node).xlayer.frame;
                frame.header_memory = BufPtr::new(BufKind::NodeHeader(node), 0);
                frame.header_memory_size = header_size;
                frame.header_begin = frame.header_memory;
                frame.header_end = frame.header_memory;
                frame.payload_memory = BufPtr::NULL;
                frame.payload_memory_size = payload_size;
                frame.payload_begin = BufPtr::NULL;
                frame.payload_end = BufPtr::NULL;
                frame.max_frame_size = 0;
                frame.source_address = source;
                frame.destination_address = destination;
                frame.frame_outcome = FrameOutcome::Wait;
                XlayerRef::RxNode(node)
            }
        }
    }

    /* ------------------------------------------------------------------ */
    /* PHY configuration                                                   */
    /* ------------------------------------------------------------------ */

    fn config_common(&mut self, conn_id: ConnectionId, connect_entry: bool) {
        self.cfg.sleep_level = if connect_entry { SleepLvl::Idle } else { self.scheduler.current_sleep_lvl() };
        self.cfg.next_sleep_level = self.scheduler.next_sleep_lvl();
        self.cfg.sleep_time = self.tdma_sync.sleep_cycles();
        self.cfg.power_up_delay = POWER_UP_DELAY_PLL;
        self.cfg.expect_ack = self.conn(conn_id).ack_enable;
        self.cfg.certification_header_en = self.conn(conn_id).certification_mode_enabled;
        self.cfg.expected_header_size = self.max_expected_header_size;
        self.cfg.expected_payload_size = self.max_expected_payload_size;
        self.cfg.seq_num = self.conn(conn_id).stop_and_wait_arq.seq_num();
        self.cfg.phases_enabled = self.conn(conn_id).ranging_mode != RangingMode::Disabled;
        self.cfg.cca_try_count = 0;
        self.cfg.phases_info = None;

        let gain_channel = usize::from(self.channel_index)
            .min(self.conn(conn_id).gain_loop.len().saturating_sub(1));
        self.cfg.rx_gain = self.conn(conn_id).gain_loop[gain_channel][0].gain_value();
    }

    fn config_tx(
        &mut self,
        conn_id: ConnectionId,
        next_channel: u8,
        payload_size: u16,
        connect_entry: bool,
    ) {
        let (fallback_index, fallback_active) =
            self.conn(conn_id).link_fallback.get_index(payload_size.min(255) as u8);

        let cca_max_try_count = {
            let conn = self.conn(conn_id);
            if fallback_active
                && payload_size != 0
                && conn.link_fallback.is_configured()
                && conn.cca.fbk_try_count.len() > fallback_index
            {
                conn.cca.fbk_try_count[fallback_index]
            } else {
                conn.cca.max_try_count
            }
        };
        self.cfg.cca_threshold = if cca_max_try_count == 0 {
            crate::config::DISABLE_CCA_THRESHOLD
        } else {
            self.conn(conn_id).cca.threshold
        };

        let fb = (fallback_active && payload_size != 0).then_some(fallback_index);
        self.cfg.channel = self.conn(conn_id).rf_channel(next_channel, fb);

        // While disconnected, mute every transfer outside the lightest
        // sleep slots so resync attempts concentrate there.
        if !self.conn(conn_id).connect_status.is_connected()
            && self.scheduler.next_sleep_lvl() != self.scheduler.lightest_sleep_lvl()
        {
            self.cfg.channel = crate::phy::regs::RfChannel::default();
        }

        self.cfg.cca_retry_time = self.conn(conn_id).cca.retry_time_pll_cycles;
        self.cfg.cca_max_try_count = cca_max_try_count;
        self.cfg.cca_fail_action = self.conn(conn_id).cca.fail_action;
        self.cfg.cca_on_time = self.conn(conn_id).cca.on_time();
        self.cfg.rx_timeout = crate::phy::MAX_RX_TIMEOUT;
        self.config_common(conn_id, connect_entry);
    }

    fn config_rx(&mut self, conn_id: ConnectionId, next_channel: u8, connect_entry: bool) {
        let cca_max_try_count = self.conn(conn_id).cca.max_try_count;
        self.cfg.cca_threshold = if cca_max_try_count == 0 {
            crate::config::DISABLE_CCA_THRESHOLD
        } else {
            self.conn(conn_id).cca.threshold
        };

        self.cfg.channel = self.conn(conn_id).rf_channel(next_channel, None);
        if !self.conn(conn_id).connect_status.is_connected()
            && self.scheduler.next_sleep_lvl() != self.scheduler.lightest_sleep_lvl()
        {
            self.cfg.channel = crate::phy::regs::RfChannel::default();
        }

        self.cfg.cca_retry_time = self.conn(conn_id).cca.retry_time_pll_cycles;
        self.cfg.cca_max_try_count = cca_max_try_count;
        self.cfg.cca_fail_action = self.conn(conn_id).cca.fail_action;
        self.cfg.cca_on_time = self.conn(conn_id).cca.on_time();

        // Listening window: expected preamble position plus drift margin
        // once synced, the maximum while acquiring.
        self.cfg.rx_timeout = if self.is_synced() {
            let window = self.preamble_len_bits + self.syncword_len_bits + RX_TIMEOUT_MARGIN_PLL;
            window.min(u32::from(crate::phy::MAX_RX_TIMEOUT)) as u16
        } else {
            crate::phy::MAX_RX_TIMEOUT
        };
        self.config_common(conn_id, connect_entry);
    }

    /* ------------------------------------------------------------------ */
    /* Queue upkeep                                                        */
    /* ------------------------------------------------------------------ */

    /// Retire the frame at the head of the connection queue.
    pub fn send_done(
        &mut self,
        conn_id: ConnectionId,
        tx_pool: &mut NodePool,
        tx_data: &mut CircularData,
        now: u64,
    ) -> bool {
        let conn = &mut self.connections[usize::from(conn_id.0)];
        conn.tx_flush = false;
        let Some(node) = tx_pool.dequeue(&mut conn.xlayer_queue) else {
            return false;
        };
        {
            let frame = &mut tx_pool.node_mut(node).xlayer.frame;
            if frame.header_memory.kind == BufKind::TxArena && frame.max_frame_size != 0 {
                tx_data.free(frame.header_memory.offset, frame.max_frame_size);
            }
            frame.header_memory = BufPtr::NULL;
            frame.max_frame_size = 0;
        }
        tx_pool.free_node(node);

        #[cfg(feature = "certification")]
        if self.conn(conn_id).certification_mode_enabled {
            certification::send(self, conn_id, tx_pool, tx_data, now);
        }
        let _ = now;
        true
    }

    /// Drop every queued frame whose ARQ deadline has passed.
    fn flush_timeout_frames_before_sending(
        &mut self,
        conn_id: ConnectionId,
        tx_pool: &mut NodePool,
        tx_data: &mut CircularData,
        now: u64,
    ) {
        loop {
            let Some(node) = self.conn(conn_id).xlayer_queue.peek() else {
                return;
            };
            let (time_stamp, retry_count) = {
                let frame = &mut tx_pool.node_mut(node).xlayer.frame;
                let stats = (frame.time_stamp, frame.retry_count);
                frame.retry_count += 1;
                stats
            };
            let timeout = self
                .conn_mut(conn_id)
                .stop_and_wait_arq
                .is_frame_timeout(time_stamp, retry_count, now);
            if !timeout {
                return;
            }
            let cb = self.conn(conn_id).tx_drop_callback;
            self.enqueue_callback(cb, conn_id);
            self.note_tx_drop(conn_id);
            self.send_done(conn_id, tx_pool, tx_data, now);
        }
    }

    /// Drop the frame at the queue head on application request.
    fn flush_tx_frame(
        &mut self,
        conn_id: ConnectionId,
        tx_pool: &mut NodePool,
        tx_data: &mut CircularData,
        now: u64,
    ) {
        if self.conn(conn_id).xlayer_queue.peek().is_none() {
            self.conn_mut(conn_id).tx_flush = false;
            return;
        }
        let cb = self.conn(conn_id).tx_drop_callback;
        self.enqueue_callback(cb, conn_id);
        self.note_tx_drop(conn_id);
        self.send_done(conn_id, tx_pool, tx_data, now);
    }

    /// Apply a schedule-ratio request to its connection.
    pub fn apply_schedule_ratio(&mut self, conn_id: ConnectionId, cfg: &ScheduleRatioCfg) {
        let conn = self.conn_mut(conn_id);
        let Some(pattern) = conn.pattern.as_mut() else {
            return;
        };
        conn.active_ratio = cfg.active_ratio;
        conn.pattern_total_count = cfg.pattern_total_count.min(PATTERN_THROTTLE_GRANULARITY as u8);
        conn.pattern_count = cfg.pattern_current_count;
        pattern.clear();
        for &enabled in cfg.pattern.iter().take(usize::from(conn.pattern_total_count)) {
            let _ = pattern.push(enabled);
        }
    }

    /* ------------------------------------------------------------------ */
    /* Frame descriptor helpers                                            */
    /* ------------------------------------------------------------------ */

    pub fn xlayer_frame_outcome(
        &self,
        r: XlayerRef,
        tx_pool: &NodePool,
        rx_pool: &NodePool,
    ) -> FrameOutcome {
        match r {
            XlayerRef::TxNode(idx) => tx_pool.node(idx).xlayer.frame.frame_outcome,
            XlayerRef::RxNode(idx) => rx_pool.node(idx).xlayer.frame.frame_outcome,
            XlayerRef::EmptyTx => self.empty_frame_tx.frame.frame_outcome,
            XlayerRef::EmptyRx => self.empty_frame_rx.frame.frame_outcome,
            XlayerRef::EmptyAutoReply => self.empty_auto_reply_frame.frame.frame_outcome,
        }
    }

    fn set_xlayer_outcome(&mut self, r: XlayerRef, pool: &mut NodePool, outcome: FrameOutcome) {
        match r {
            XlayerRef::TxNode(idx) | XlayerRef::RxNode(idx) => {
                pool.node_mut(idx).xlayer.frame.frame_outcome = outcome;
            }
            XlayerRef::EmptyTx => self.empty_frame_tx.frame.frame_outcome = outcome,
            XlayerRef::EmptyRx => self.empty_frame_rx.frame.frame_outcome = outcome,
            XlayerRef::EmptyAutoReply => {
                self.empty_auto_reply_frame.frame.frame_outcome = outcome;
            }
        }
    }

    fn xlayer_no_payload(&self, r: XlayerRef, rx_pool: &NodePool) -> bool {
        let frame = match r {
            XlayerRef::RxNode(idx) => &rx_pool.node(idx).xlayer.frame,
            XlayerRef::EmptyRx => &self.empty_frame_rx.frame,
            XlayerRef::EmptyAutoReply => &self.empty_auto_reply_frame.frame,
            XlayerRef::TxNode(_) | XlayerRef::EmptyTx => return true,
        };
        frame.header_begin == frame.payload_end
    }

    fn xlayer_payload_len(&self, r: XlayerRef, tx_pool: &NodePool) -> u16 {
        match r {
            XlayerRef::TxNode(idx) => tx_pool.node(idx).xlayer.frame.payload_size(),
            XlayerRef::EmptyTx => self.empty_frame_tx.frame.payload_size(),
            _ => 0,
        }
    }

    /* ------------------------------------------------------------------ */
    /* Statistics                                                          */
    /* ------------------------------------------------------------------ */

    #[cfg(feature = "stats")]
    fn note_main_outcome(&mut self, outcome: FrameOutcome, empty: bool) {
        let (rssi, rnsi) = (self.cfg.rssi_raw, self.cfg.rnsi_raw);
        let channel_index = self.channel_index;
        if let Some(main) = self.main_conn {
            let conn = self.conn_mut(main);
            conn.lqi.update(outcome, rssi, rnsi);
            if !empty {
                conn.used_frame_lqi.update(outcome, rssi, rnsi);
                if outcome == FrameOutcome::Received {
                    conn.wps_stats.rx_received += 1;
                }
            }
            if outcome == FrameOutcome::Received {
                let gain_channel =
                    usize::from(channel_index).min(conn.gain_loop.len().saturating_sub(1));
                conn.gain_loop[gain_channel][0].update(rssi);
            }
        }
    }

    #[cfg(not(feature = "stats"))]
    fn note_main_outcome(&mut self, _outcome: FrameOutcome, _empty: bool) {}

    #[cfg(feature = "stats")]
    fn note_auto_outcome(&mut self, outcome: FrameOutcome, empty: bool) {
        let (rssi, rnsi) = (self.cfg.rssi_raw, self.cfg.rnsi_raw);
        if let Some(auto) = self.auto_conn {
            let conn = self.conn_mut(auto);
            conn.lqi.update(outcome, rssi, rnsi);
            if !empty {
                conn.used_frame_lqi.update(outcome, rssi, rnsi);
                if outcome == FrameOutcome::Received {
                    conn.wps_stats.rx_received += 1;
                }
            }
        }
    }

    #[cfg(not(feature = "stats"))]
    fn note_auto_outcome(&mut self, _outcome: FrameOutcome, _empty: bool) {}

    #[cfg(feature = "stats")]
    fn note_tx_result(
        &mut self,
        conn_id: ConnectionId,
        frame_ref: XlayerRef,
        tx_pool: &NodePool,
        success: bool,
    ) {
        let bytes = self.xlayer_payload_len(frame_ref, tx_pool) as u32;
        let outcome = self.xlayer_frame_outcome(frame_ref, tx_pool, tx_pool);
        let (rssi, rnsi) = (self.cfg.rssi_raw, self.cfg.rnsi_raw);
        let conn = self.conn_mut(conn_id);
        conn.lqi.update(outcome, rssi, rnsi);
        conn.used_frame_lqi.update(outcome, rssi, rnsi);
        if success {
            conn.wps_stats.tx_success += 1;
            conn.wps_stats.tx_byte_sent += bytes;
        } else {
            conn.wps_stats.tx_fail += 1;
        }
    }

    #[cfg(not(feature = "stats"))]
    fn note_tx_result(
        &mut self,
        _conn_id: ConnectionId,
        _frame_ref: XlayerRef,
        _tx_pool: &NodePool,
        _success: bool,
    ) {
    }

    fn note_tx_drop(&mut self, conn_id: ConnectionId) {
        let conn = self.conn_mut(conn_id);
        conn.total_pkt_dropped += 1;
        #[cfg(feature = "stats")]
        {
            conn.wps_stats.tx_drop += 1;
        }
    }

    fn note_rx_overrun(&mut self, conn_id: ConnectionId) {
        #[cfg(feature = "stats")]
        {
            self.conn_mut(conn_id).wps_stats.rx_overrun += 1;
        }
        let _ = conn_id;
    }

    fn note_cca(&mut self, conn_id: ConnectionId, outcome: FrameOutcome) {
        let tries = self.cfg.cca_try_count;
        let cca_enabled = self.cfg.cca_max_try_count != 0;
        let conn = self.conn_mut(conn_id);
        if !cca_enabled {
            return;
        }
        conn.total_cca_events += 1;
        conn.total_cca_fail_count += u32::from(tries);
        if outcome == FrameOutcome::Wait {
            conn.total_cca_tx_fail_count += 1;
            #[cfg(feature = "stats")]
            {
                conn.wps_stats.cca_tx_fail += 1;
            }
        } else {
            #[cfg(feature = "stats")]
            {
                conn.wps_stats.cca_pass += 1;
            }
        }
        #[cfg(feature = "stats")]
        {
            conn.wps_stats.cca_fail += u32::from(tries);
        }
    }
}

/// Total frame block size in the TX arena for a payload of `payload` and
/// a header of `header` bytes.
pub(crate) fn tx_frame_block_size(header: u8, payload: u8) -> u16 {
    SPI_BURST_PREFIX_SIZE as u16 + u16::from(header) + u16::from(payload)
}

/// Reserve a node and arena block for `payload` on `conn_id`, copy the
/// bytes in and queue the frame for the next timeslot.
pub(crate) fn enqueue_tx_frame(
    mac: &mut MacCore,
    tx_pool: &mut NodePool,
    tx_data: &mut CircularData,
    conn_id: ConnectionId,
    payload: &[u8],
    now: u64,
) -> Result<(), WpsError> {
    let (header_size, max_payload, source, destination) = {
        let conn = mac.conn(conn_id);
        (
            conn.header_size,
            conn.payload_size,
            conn.source_address,
            conn.destination_address,
        )
    };
    if payload.len() > usize::from(max_payload) {
        return Err(WpsError::WrongTxSize);
    }
    if mac.conn(conn_id).xlayer_queue.free_space() == 0 {
        return Err(WpsError::QueueFull);
    }
    let Some(node) = tx_pool.get_free_node() else {
        return Err(WpsError::QueueFull);
    };
    let block = tx_frame_block_size(header_size, payload.len() as u8);
    let Some(offset) = tx_data.allocate(block) else {
        tx_pool.free_node(node);
        return Err(WpsError::NotEnoughMemory);
    };

    let payload_offset = offset + SPI_BURST_PREFIX_SIZE as u16 + u16::from(header_size);
    tx_data.slice(payload_offset, payload.len() as u16).copy_from_slice(payload);

    {
        let frame = &mut tx_pool.node_mut(node).xlayer.frame;
        frame.source_address = source;
        frame.destination_address = destination;
        frame.header_memory = BufPtr::new(BufKind::TxArena, offset);
        frame.header_memory_size = header_size;
        frame.payload_memory = BufPtr::new(BufKind::TxArena, payload_offset);
        frame.payload_memory_size = payload.len() as u8;
        frame.payload_begin = BufPtr::new(BufKind::TxArena, payload_offset);
        frame.payload_end = frame.payload_begin.add(payload.len() as u16);
        frame.header_begin = frame.payload_begin;
        frame.header_end = frame.payload_begin;
        frame.max_frame_size = block;
        frame.retry_count = 0;
        frame.time_stamp = now;
        frame.frame_outcome = FrameOutcome::Wait;
        frame.user_payload = false;
    }

    let conn = &mut mac.connections[usize::from(conn_id.0)];
    if !tx_pool.enqueue(&mut conn.xlayer_queue, node) {
        tx_data.free(offset, block);
        tx_pool.free_node(node);
        return Err(WpsError::QueueFull);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::protocol::FieldId;
    use crate::mac::connection::ConnectionCfg;
    use crate::xlayer::XlayerNode;

    extern crate std;

    fn mac_with_connections(count: usize) -> MacCore {
        let mut mac = MacCore::new(0xAA);
        for i in 0..count {
            let cfg = ConnectionCfg {
                source_address: 0xAA,
                destination_address: 0xB0 + i as u16,
                fifo_size: 4,
                max_payload_size: 8 + i as u8,
                ..ConnectionCfg::default()
            };
            let _ = mac.connections.push(Connection::new(&cfg));
        }
        mac
    }

    fn proto_with_conn_id(conn: &mut Connection) {
        conn.link_protocol.add_field(FieldId::TimeslotId, 1).unwrap();
        conn.link_protocol.add_field(FieldId::ConnectionId, 1).unwrap();
        conn.header_size = conn.link_protocol.header_size();
    }

    #[test]
    fn received_frames_route_by_connection_id_field() {
        let mut mac = mac_with_connections(2);
        mac.scheduler.init(&[100]).unwrap();
        proto_with_conn_id(&mut mac.connections[0]);
        proto_with_conn_id(&mut mac.connections[1]);
        {
            let ts = mac.scheduler.current_timeslot_mut();
            let _ = ts.main_connections.push(ConnectionId(0));
            let _ = ts.main_connections.push(ConnectionId(1));
        }

        mac.route_received_frame(true, &[0x00, 0x01]);
        assert_eq!(mac.main_conn, Some(ConnectionId(1)));
        assert_eq!(mac.rx_alloc_size(), 9);
        assert_eq!(mac.scheduler.current_timeslot().last_used_main_connection, 1);

        mac.route_received_frame(true, &[0x00, 0x00]);
        assert_eq!(mac.main_conn, Some(ConnectionId(0)));
        assert_eq!(mac.rx_alloc_size(), 8);
    }

    #[test]
    fn header_compose_and_extract_round_trip() {
        let mut nodes = std::vec![XlayerNode::default(); 2];
        let mut tx_pool = NodePool::new(&mut nodes);
        let mut mem = std::vec![0u8; 64];
        let mut tx_data = CircularData::new(&mut mem);

        let mut sender = mac_with_connections(1);
        sender.scheduler.init(&[100]).unwrap();
        {
            let conn = &mut sender.connections[0];
            conn.link_protocol.add_field(FieldId::TimeslotId, 1).unwrap();
            conn.link_protocol.add_field(FieldId::RdoOffset, 2).unwrap();
            conn.link_protocol.add_field(FieldId::CreditControl, 1).unwrap();
            conn.header_size = conn.link_protocol.header_size();
        }
        sender.link_rdo.init(0x300, 1);
        sender.link_rdo.enable();
        for _ in 0..0x123 {
            sender.link_rdo.update_offset();
        }

        sender.build_empty_tx_frame(ConnectionId(0), true, 0);
        sender.fill_header(ConnectionId(0), XlayerRef::EmptyTx, false, &mut tx_pool, &mut tx_data);

        let header_size = usize::from(sender.connections[0].header_size);
        let mut header = [0u8; 8];
        header[..header_size].copy_from_slice(&sender.scratch_buffer[..header_size]);

        let mut receiver = mac_with_connections(1);
        receiver.scheduler.init(&[100]).unwrap();
        receiver.connections[0].link_protocol = sender.connections[0].link_protocol.clone();
        receiver.connections[0].credit_flow_ctrl.init(true, 0);
        receiver.link_rdo.init(0x300, 1);
        receiver.link_rdo.enable();
        receiver.extract_header_fields(ConnectionId(0), false, &header[..header_size]);

        assert_eq!(receiver.link_rdo.get_offset(), sender.link_rdo.get_offset());
        // The credit grant advertised the sender's free queue space.
        assert_eq!(receiver.connections[0].credit_flow_ctrl.credits_count(), 4);
    }

    #[test]
    fn throttled_slots_are_skipped_and_counted_into_the_hop() {
        let mut tx_nodes = std::vec![XlayerNode::default(); 4];
        let mut tx_pool = NodePool::new(&mut tx_nodes);
        let mut rx_nodes = std::vec![XlayerNode::default(); 4];
        let mut rx_pool = NodePool::new(&mut rx_nodes);
        let mut tx_mem = std::vec![0u8; 64];
        let mut tx_data = CircularData::new(&mut tx_mem);

        let mut mac = mac_with_connections(2);
        mac.scheduler.init(&[100, 100, 100]).unwrap();
        assert!(mac.channel_hopping.init(
            crate::link::channel_hopping::ChannelSequence::new(&[0, 1, 2]).unwrap(),
            false,
            0
        ));
        // Slot 1 hosts a connection that is throttled fully off.
        {
            let ts = mac.scheduler.timeslot_mut(1).unwrap();
            let _ = ts.main_connections.push(ConnectionId(0));
        }
        {
            let ts = mac.scheduler.timeslot_mut(2).unwrap();
            let _ = ts.main_connections.push(ConnectionId(1));
        }
        {
            let conn = &mut mac.connections[0];
            let mut pattern = heapless::Vec::new();
            for _ in 0..PATTERN_THROTTLE_GRANULARITY {
                let _ = pattern.push(false);
            }
            conn.pattern = Some(pattern);
            conn.pattern_total_count = PATTERN_THROTTLE_GRANULARITY as u8;
        }

        mac.process_next_timeslot(&mut tx_pool, &mut rx_pool, &mut tx_data, 0, false);

        // Slot 1 was skipped: the walk landed on slot 2 and the channel
        // hop advanced by two positions.
        assert_eq!(mac.scheduler.current_time_slot_num(), 2);
        assert_eq!(mac.channel_hopping.seq_index(), 2);
        assert_eq!(mac.main_conn, Some(ConnectionId(1)));
        // The skipped slot's duration still counts into the sleep time.
        assert_eq!(mac.scheduler.sleep_time(), 200);
    }

    #[test]
    fn schedule_ratio_request_replaces_the_pattern() {
        let mut mac = mac_with_connections(1);
        {
            let conn = &mut mac.connections[0];
            let mut pattern = heapless::Vec::new();
            for _ in 0..PATTERN_THROTTLE_GRANULARITY {
                let _ = pattern.push(true);
            }
            conn.pattern = Some(pattern);
            conn.pattern_total_count = PATTERN_THROTTLE_GRANULARITY as u8;
        }
        let mut pattern = [false; PATTERN_THROTTLE_GRANULARITY];
        pattern[0] = true;
        let cfg = crate::request::ScheduleRatioCfg {
            active_ratio: 50,
            pattern_total_count: 2,
            pattern_current_count: 0,
            pattern,
        };
        mac.apply_schedule_ratio(ConnectionId(0), &cfg);
        let conn = &mac.connections[0];
        assert_eq!(conn.active_ratio, 50);
        assert_eq!(conn.pattern_total_count, 2);
        assert_eq!(conn.pattern.as_ref().unwrap().as_slice(), &[true, false]);
    }
}
