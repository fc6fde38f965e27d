//! # Wireless protocol stack for short-range UWB transceivers
//!
//! TDMA-scheduled, hard-real-time MAC and PHY engine driving a single
//! SPI-attached UWB radio. The stack owns the timeslot schedule, channel
//! hopping, per-connection link protocols (stop-and-wait ARQ, credit flow
//! control, CCA, fallback, random datarate offset) and the cross-layer
//! frame queues; the board integration supplies the [`hal::WpsHal`]
//! facade and routes three interrupt entry points back into the stack:
//!
//! - [`Wps::radio_irq`] from the radio IRQ line (highest priority),
//! - [`Wps::transfer_complete`] from the SPI DMA complete interrupt
//!   (same priority as the radio IRQ),
//! - [`Wps::process_callback`] from a low-priority software interrupt
//!   raised through [`hal::WpsHal::context_switch_trigger`].
//!
//! ## Bring-up sequence
//!
//! 1. [`Wps::new`] with the HAL, node configuration and buffer storage.
//! 2. Configure the network: schedule, channel sequence, syncing address.
//! 3. [`Wps::create_connection`] and per-connection features (ACK, ARQ,
//!    CCA, throttling, fallback, credit flow control, callbacks), then
//!    [`Wps::connection_set_timeslot`] and
//!    [`Wps::configure_header_connection`].
//! 4. [`Wps::connect`]; exchange traffic with [`Wps::send`] /
//!    [`Wps::read`] / [`Wps::read_done`].

#![no_std]

#[cfg(test)]
extern crate std;

pub mod callback;
pub mod config;
pub mod error;
pub mod hal;
pub mod link;
pub mod mac;
pub mod phy;
pub mod request;
pub mod xlayer;

use callback::WpsCallback;
use error::{WpsError, WpsEvent};
use hal::WpsHal;
use link::cca::CcaFailAction;
use link::channel_hopping::ChannelSequence;
use link::connect_status::ConnectStatusCfg;
use link::phase::PhaseInfo;
use link::protocol::FieldId;
use link::rdo::RDO_FIELD_SIZE;
use link::scheduler::SleepLvl;
use link::tdma_sync::TdmaSyncCfg;
use mac::connection::{Connection, ConnectionCfg, TxReservation};
use mac::{MacCore, WpsRole, XlayerRef};
use phy::regs::RfChannel;
use phy::{PhyCore, PhyInput, PhyOutput, PhyRes, RegWriteCfg};
use request::{ScheduleRatioCfg, WpsRequest};
use xlayer::{BufKind, BufPtr, CircularData, NodePool, XlayerNode};

pub use error::{WpsError as Error, WpsEvent as Event};
pub use hal::{BlockingSpiHal, MultiRadioHal};
pub use link::cca::CcaFailAction as CcaAction;
pub use link::scheduler::SleepLvl as SleepLevel;
pub use mac::WpsRole as Role;
pub use mac::connection::{ConnectionCfg as ConnectionConfig, RangingMode};
pub use phy::RegWriteCfg as RegWriteConfig;
pub use phy::regs::{RfChannel as RfChannelCfg, RfChannelPattern};

/// Default radio syncword (`1D C1 A6 5E` over the air).
pub const DEFAULT_SYNCWORD: u32 = 0x5EA6_C11D;
/// Default radio CRC polynomial.
pub const DEFAULT_CRC_POLYNOMIAL: u32 = 0x8005;

/// Handle of a connection created with [`Wps::create_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionId(pub(crate) u8);

/// One timeslot assignment of a connection.
#[derive(Debug, Clone, Copy)]
pub struct TimeslotUse {
    pub index: u8,
    pub auto_reply: bool,
    /// Priority override for this slot; the connection priority applies
    /// otherwise.
    pub priority: Option<u8>,
}

/// Assign the main exchange of timeslot `index`.
pub fn main_timeslot(index: u8) -> TimeslotUse {
    TimeslotUse { index, auto_reply: false, priority: None }
}

/// Assign the auto-reply exchange of timeslot `index`.
pub fn auto_timeslot(index: u8) -> TimeslotUse {
    TimeslotUse { index, auto_reply: true, priority: None }
}

/// Header layout selection of a connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderCfg {
    /// Main connection (as opposed to an auto-reply connection).
    pub main_connection: bool,
    /// Carry the random datarate offset.
    pub rdo_enabled: bool,
    /// Ranging participation.
    pub ranging_mode: RangingMode,
    /// Carry the connection index for slots hosting several connections.
    pub connection_id: bool,
    /// Carry the credit flow control grant.
    pub credit_fc_enabled: bool,
}

/// Node-level configuration.
#[derive(Debug, Clone)]
pub struct WpsNodeCfg {
    pub role: WpsRole,
    pub local_address: u16,
    /// Preamble length, in bits.
    pub preamble_len_bits: u16,
    pub syncword: u32,
    /// Syncword length, in bits (8 or 32).
    pub syncword_len_bits: u16,
    pub crc_polynomial: u32,
    /// Default sleep depth between timeslots.
    pub sleep_lvl: SleepLvl,
    /// Default receiver gain.
    pub rx_gain: u8,
    pub tx_jitter_enabled: bool,
    /// Lost-frame time before a node declares itself unsynced, in PLL
    /// cycles.
    pub frame_lost_max_duration: u32,
}

impl Default for WpsNodeCfg {
    fn default() -> Self {
        Self {
            role: WpsRole::Coordinator,
            local_address: 0,
            preamble_len_bits: 64,
            syncword: DEFAULT_SYNCWORD,
            syncword_len_bits: 32,
            crc_polynomial: DEFAULT_CRC_POLYNOMIAL,
            sleep_lvl: SleepLvl::Idle,
            rx_gain: 0,
            tx_jitter_enabled: false,
            frame_lost_max_duration: 1_000_000,
        }
    }
}

/// Application-provided storage backing the frame queues and payload
/// arenas. All buffers must outlive the stack.
pub struct WpsStorage<'m> {
    pub tx_nodes: &'m mut [XlayerNode],
    pub rx_nodes: &'m mut [XlayerNode],
    /// Header blocks of the RX nodes, `rx_header_block_size` bytes each.
    pub rx_headers: &'m mut [u8],
    pub rx_header_block_size: u16,
    pub tx_arena: &'m mut [u8],
    pub rx_arena: &'m mut [u8],
}

/// Lifecycle state of the stack.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WpsState {
    /// Configured but not on the air.
    #[default]
    Idle,
    /// Schedule running.
    Connected,
}

/// A received frame borrowed from the RX queue; release it with
/// [`Wps::read_done`].
pub struct RxFrame<'a> {
    pub payload: &'a [u8],
}

/// The wireless protocol stack.
pub struct Wps<'m, H: WpsHal> {
    hal: H,
    mac: MacCore,
    phy: PhyCore,
    tx_pool: NodePool<'m>,
    rx_pool: NodePool<'m>,
    tx_data: CircularData<'m>,
    rx_data: CircularData<'m>,
    node_cfg: WpsNodeCfg,
    channel_sequence: Option<ChannelSequence>,
    random_channel_sequence_enabled: bool,
    state: WpsState,
}

impl<'m, H: WpsHal> Wps<'m, H> {
    /// Initialize the stack and bring up the radio registers.
    pub fn new(mut hal: H, cfg: WpsNodeCfg, storage: WpsStorage<'m>) -> Self {
        let mut mac = MacCore::new(cfg.local_address);
        mac.node_role = cfg.role;
        mac.preamble_len_bits = u32::from(cfg.preamble_len_bits);
        mac.syncword_len_bits = u32::from(cfg.syncword_len_bits);
        mac.tdma_sync.init(TdmaSyncCfg {
            sleep_lvl: cfg.sleep_lvl,
            syncword_len_bits: u32::from(cfg.syncword_len_bits),
            preamble_len_bits: u32::from(cfg.preamble_len_bits),
            frame_lost_max_duration: cfg.frame_lost_max_duration,
            tx_jitter_enabled: cfg.tx_jitter_enabled,
        });

        let mut phy = PhyCore::new(cfg.local_address);
        phy.init(
            &mut hal,
            cfg.syncword,
            cfg.syncword_len_bits,
            cfg.preamble_len_bits,
            cfg.crc_polynomial,
            cfg.sleep_lvl,
            cfg.rx_gain,
        );

        Self {
            hal,
            mac,
            phy,
            tx_pool: NodePool::new(storage.tx_nodes),
            rx_pool: NodePool::with_header_data(
                storage.rx_nodes,
                storage.rx_headers,
                storage.rx_header_block_size,
            ),
            tx_data: CircularData::new(storage.tx_arena),
            rx_data: CircularData::new(storage.rx_arena),
            node_cfg: cfg,
            channel_sequence: None,
            random_channel_sequence_enabled: false,
            state: WpsState::Idle,
        }
    }

    /* -------------------------------------------------------------- */
    /* Network configuration                                           */
    /* -------------------------------------------------------------- */

    /// Install the TDMA schedule from per-slot durations in PLL cycles.
    pub fn config_network_schedule(&mut self, durations_pll: &[u32]) -> Result<(), WpsError> {
        self.mac.scheduler.init(durations_pll)
    }

    /// Set the sleep depth entered after timeslot `index`.
    pub fn config_timeslot_sleep_lvl(&mut self, index: usize, lvl: SleepLvl) -> Result<(), WpsError> {
        let ts = self.mac.scheduler.timeslot_mut(index).ok_or(WpsError::NotEnoughMemory)?;
        ts.sleep_lvl = lvl;
        self.mac.scheduler.refresh_lightest_sleep_lvl();
        Ok(())
    }

    /// Install the channel hopping sequence.
    pub fn config_network_channel_sequence(&mut self, channels: &[u8]) -> Result<(), WpsError> {
        self.channel_sequence =
            Some(ChannelSequence::new(channels).ok_or(WpsError::ChannelSequenceInitError)?);
        Ok(())
    }

    pub fn enable_random_channel_sequence(&mut self) {
        self.random_channel_sequence_enabled = true;
    }

    pub fn disable_random_channel_sequence(&mut self) {
        self.random_channel_sequence_enabled = false;
    }

    /// Address of the device this node synchronizes on.
    pub fn set_syncing_address(&mut self, address: u16) {
        self.mac.syncing_address = address;
    }

    /// Concurrent network identifier; seeds the random channel sequence.
    pub fn set_network_id(&mut self, network_id: u8) {
        self.mac.network_id = network_id;
    }

    /// Non-stop RX before the first sync acquisition. Idle sleep only.
    pub fn enable_fast_sync(&mut self) {
        self.mac.fast_sync_enabled = true;
    }

    pub fn disable_fast_sync(&mut self) {
        self.mac.fast_sync_enabled = false;
    }

    /// Configure the random datarate offset.
    pub fn init_rdo(&mut self, rollover_value: u16, increment_step: u16) {
        self.mac.link_rdo.init(rollover_value, increment_step);
    }

    pub fn enable_rdo(&mut self) {
        self.mac.link_rdo.enable();
    }

    pub fn disable_rdo(&mut self) {
        self.mac.link_rdo.disable();
    }

    /// Enable the distributed desync concurrency mechanism.
    pub fn enable_ddcm(&mut self, max_timeslot_offset: u16, sync_loss_max_duration_pll: u32) {
        self.mac.link_ddcm.init(max_timeslot_offset, sync_loss_max_duration_pll);
    }

    pub fn disable_ddcm(&mut self) {
        self.mac.link_ddcm.disable();
    }

    /* -------------------------------------------------------------- */
    /* Connection lifecycle                                            */
    /* -------------------------------------------------------------- */

    /// Create a connection between two nodes.
    pub fn create_connection(&mut self, cfg: &ConnectionCfg) -> Result<ConnectionId, WpsError> {
        if cfg.fifo_size < config::MIN_QUEUE_SIZE as u16 || cfg.priority > config::MAX_CONN_PRIORITY
        {
            return Err(WpsError::NotEnoughMemory);
        }
        let id = ConnectionId(self.mac.connections.len() as u8);
        self.mac
            .connections
            .push(Connection::new(cfg))
            .map_err(|_| WpsError::NotEnoughMemory)?;
        let conn = self.mac.conn_mut(id);
        conn.connect_status.init(ConnectStatusCfg::default());
        Ok(id)
    }

    /// Tear a connection down: flush its queues, release its arena
    /// blocks and detach it from every timeslot. Only while disconnected.
    pub fn destroy_connection(&mut self, connection: ConnectionId) -> Result<(), WpsError> {
        if self.state == WpsState::Connected {
            return Err(WpsError::AlreadyConnected);
        }
        let is_tx = {
            let conn = self.mac.conn(connection);
            conn.is_tx(self.mac.local_address)
        };
        if let Some(reservation) = self.mac.conn_mut(connection).reservation.take() {
            self.rollback_reservation(connection, reservation);
        }
        let conn = &mut self.mac.connections[usize::from(connection.0)];
        let (pool, arena) = if is_tx {
            (&mut self.tx_pool, &mut self.tx_data)
        } else {
            (&mut self.rx_pool, &mut self.rx_data)
        };
        while let Some(node) = pool.dequeue(&mut conn.xlayer_queue) {
            let frame = &mut pool.node_mut(node).xlayer.frame;
            let block = if is_tx { frame.header_memory } else { frame.payload_memory };
            if !block.is_null() && frame.max_frame_size != 0 {
                arena.free(block.offset, frame.max_frame_size);
            }
            frame.header_memory = BufPtr::NULL;
            frame.payload_memory = BufPtr::NULL;
            frame.max_frame_size = 0;
            pool.free_node(node);
        }
        conn.currently_enabled = false;

        for ts_idx in 0..self.mac.scheduler.size() {
            let Some(ts) = self.mac.scheduler.timeslot_mut(ts_idx) else {
                continue;
            };
            let mut main = heapless::Vec::new();
            let mut main_prio = heapless::Vec::new();
            for (i, &id) in ts.main_connections.iter().enumerate() {
                if id != connection {
                    let _ = main.push(id);
                    let _ = main_prio.push(ts.main_priorities.get(i).copied().unwrap_or(0));
                }
            }
            ts.main_connections = main;
            ts.main_priorities = main_prio;

            let mut auto = heapless::Vec::new();
            let mut auto_prio = heapless::Vec::new();
            for (i, &id) in ts.auto_connections.iter().enumerate() {
                if id != connection {
                    let _ = auto.push(id);
                    let _ = auto_prio.push(ts.auto_priorities.get(i).copied().unwrap_or(0));
                }
            }
            ts.auto_connections = auto;
            ts.auto_priorities = auto_prio;
        }
        Ok(())
    }

    /// Attach `connection` to the listed timeslots.
    pub fn connection_set_timeslot(
        &mut self,
        connection: ConnectionId,
        slots: &[TimeslotUse],
    ) -> Result<(), WpsError> {
        let default_priority = self.mac.conn(connection).priority;
        for slot in slots {
            let ts = self
                .mac
                .scheduler
                .timeslot_mut(usize::from(slot.index))
                .ok_or(WpsError::NotEnoughMemory)?;
            let priority = slot.priority.unwrap_or(default_priority);
            if slot.auto_reply {
                ts.auto_connections
                    .push(connection)
                    .map_err(|_| WpsError::TimeslotConnLimitReached)?;
                let _ = ts.auto_priorities.push(priority);
            } else {
                ts.main_connections
                    .push(connection)
                    .map_err(|_| WpsError::TimeslotConnLimitReached)?;
                let _ = ts.main_priorities.push(priority);
            }
        }
        let seq_len = self.channel_sequence.as_ref().map(|s| s.sequence_size()).unwrap_or(0);
        self.mac.conn_mut(connection).max_channel_count = seq_len.max(1) as u8;
        Ok(())
    }

    /// Header size resulting from `cfg`, in bytes.
    pub fn get_connection_header_size(&self, cfg: HeaderCfg) -> u8 {
        let mut size = 1; // timeslot id
        if cfg.connection_id {
            size += 1;
        }
        if cfg.rdo_enabled {
            size += RDO_FIELD_SIZE;
        }
        if cfg.credit_fc_enabled {
            size += 1;
        }
        if cfg.ranging_mode != RangingMode::Disabled {
            size += PhaseInfo::FIELD_SIZE;
        }
        size
    }

    fn build_protocol(
        proto: &mut link::protocol::LinkProtocol,
        cfg: HeaderCfg,
    ) -> Result<(), WpsError> {
        proto.clear();
        proto.add_field(FieldId::TimeslotId, 1)?;
        if cfg.connection_id {
            proto.add_field(FieldId::ConnectionId, 1)?;
        }
        if cfg.rdo_enabled {
            proto.add_field(FieldId::RdoOffset, RDO_FIELD_SIZE)?;
        }
        if cfg.credit_fc_enabled {
            proto.add_field(FieldId::CreditControl, 1)?;
        }
        if cfg.ranging_mode != RangingMode::Disabled {
            proto.add_field(FieldId::RangingPhases, PhaseInfo::FIELD_SIZE)?;
        }
        Ok(())
    }

    /// Build the main header layout of `connection`. Call after every
    /// feature toggle that contributes a header field.
    pub fn configure_header_connection(
        &mut self,
        connection: ConnectionId,
        cfg: HeaderCfg,
    ) -> Result<(), WpsError> {
        let size = self.get_connection_header_size(cfg);
        let conn = self.mac.conn_mut(connection);
        Self::build_protocol(&mut conn.link_protocol, cfg)?;
        conn.header_size = size;
        Ok(())
    }

    /// Build the header layout of the automatically generated ACK frame
    /// used when no auto-reply connection shares the timeslot.
    pub fn configure_header_acknowledge(
        &mut self,
        connection: ConnectionId,
        cfg: HeaderCfg,
    ) -> Result<(), WpsError> {
        let size = self.get_connection_header_size(cfg);
        let conn = self.mac.conn_mut(connection);
        Self::build_protocol(&mut conn.auto_link_protocol, cfg)?;
        conn.ack_header_size = size;
        conn.ack_frame_enable = true;
        Ok(())
    }

    /// Program the RF channel table entry of `connection`.
    pub fn config_channel(
        &mut self,
        connection: ConnectionId,
        channel_idx: u8,
        cfg: &RfChannel,
    ) -> Result<(), WpsError> {
        let conn = self.mac.conn_mut(connection);
        let entry = conn
            .channel
            .get_mut(usize::from(channel_idx))
            .ok_or(WpsError::NotEnoughMemory)?;
        entry[0] = *cfg;
        Ok(())
    }

    /// Program a fallback RF channel table entry of `connection`.
    pub fn config_fallback_channel(
        &mut self,
        connection: ConnectionId,
        channel_idx: u8,
        fallback_idx: u8,
        cfg: &RfChannel,
    ) -> Result<(), WpsError> {
        let conn = self.mac.conn_mut(connection);
        while conn.fallback_channel.len() <= usize::from(fallback_idx) {
            let mut table = heapless::Vec::new();
            for _ in 0..config::MAX_CHANNEL_COUNT {
                let _ = table.push([RfChannel::default(); config::RADIO_COUNT]);
            }
            conn.fallback_channel
                .push(table)
                .map_err(|_| WpsError::NotEnoughMemory)?;
        }
        let table = &mut conn.fallback_channel[usize::from(fallback_idx)];
        let entry = table
            .get_mut(usize::from(channel_idx))
            .ok_or(WpsError::NotEnoughMemory)?;
        entry[0] = *cfg;
        Ok(())
    }

    /* -------------------------------------------------------------- */
    /* Feature toggles                                                 */
    /* -------------------------------------------------------------- */

    pub fn enable_ack(&mut self, connection: ConnectionId) {
        self.mac.conn_mut(connection).ack_enable = true;
    }

    pub fn disable_ack(&mut self, connection: ConnectionId) {
        self.mac.conn_mut(connection).ack_enable = false;
    }

    /// Enable the stop-and-wait ARQ. `retry` and `deadline_ticks` of zero
    /// select guaranteed delivery.
    pub fn enable_stop_and_wait_arq(
        &mut self,
        connection: ConnectionId,
        local_address: u16,
        retry: u16,
        deadline_ticks: u64,
    ) -> Result<(), WpsError> {
        let conn = self.mac.conn_mut(connection);
        if !conn.ack_enable {
            return Err(WpsError::AckDisabled);
        }
        // The two endpoints must seed opposite sequence bits so the first
        // frame is never flagged as a duplicate.
        let board_seq = local_address == conn.source_address;
        conn.stop_and_wait_arq.init(deadline_ticks, retry, board_seq, true);
        Ok(())
    }

    pub fn disable_stop_and_wait_arq(&mut self, connection: ConnectionId) {
        self.mac.conn_mut(connection).stop_and_wait_arq.disable();
    }

    /// Enable clear channel assessment before each transmission.
    pub fn enable_cca(
        &mut self,
        connection: ConnectionId,
        threshold: u8,
        retry_time_pll: u16,
        max_try_count: u8,
        fail_action: CcaFailAction,
        on_time_pll: u8,
    ) -> Result<(), WpsError> {
        if max_try_count == 0 || retry_time_pll == 0 {
            return Err(WpsError::InvalidCcaSettings);
        }
        self.mac.conn_mut(connection).cca.init(
            threshold,
            retry_time_pll,
            max_try_count,
            fail_action,
            on_time_pll,
        );
        Ok(())
    }

    pub fn disable_cca(&mut self, connection: ConnectionId) {
        self.mac.conn_mut(connection).cca.init(
            config::DISABLE_CCA_THRESHOLD,
            0,
            0,
            CcaFailAction::ForwardTx,
            0,
        );
    }

    /// Enable payload-size driven RF fallback. `thresholds` sorted
    /// ascending.
    pub fn enable_fallback(
        &mut self,
        connection: ConnectionId,
        thresholds: &[u8],
    ) -> Result<(), WpsError> {
        if !self.mac.conn_mut(connection).link_fallback.init(thresholds) {
            return Err(WpsError::NotEnoughMemory);
        }
        Ok(())
    }

    pub fn disable_fallback(&mut self, connection: ConnectionId) {
        let _ = self.mac.conn_mut(connection).link_fallback.init(&[]);
    }

    /// CCA attempt budget per fallback level.
    pub fn set_cca_fallback_try_counts(
        &mut self,
        connection: ConnectionId,
        try_counts: &[u8],
    ) -> Result<(), WpsError> {
        let conn = self.mac.conn_mut(connection);
        conn.cca.fbk_try_count.clear();
        conn.cca
            .fbk_try_count
            .extend_from_slice(try_counts)
            .map_err(|_| WpsError::NotEnoughMemory)
    }

    /// Accumulate ranging phase samples; the data-ready callback fires
    /// when `max_sample_count` samples are gathered.
    pub fn enable_phases_acquisition(
        &mut self,
        connection: ConnectionId,
        max_sample_count: u8,
    ) {
        self.mac.conn_mut(connection).link_phase.init(max_sample_count);
    }

    /// Enable credit flow control; requires acknowledges.
    pub fn enable_credit_flow_ctrl(
        &mut self,
        connection: ConnectionId,
        has_main_timeslot: bool,
    ) -> Result<(), WpsError> {
        let conn = self.mac.conn_mut(connection);
        if !conn.ack_enable && has_main_timeslot {
            return Err(WpsError::AckDisabled);
        }
        let initial = conn.xlayer_queue.max_size().min(255) as u8;
        conn.credit_flow_ctrl.init(true, initial);
        Ok(())
    }

    pub fn disable_credit_flow_ctrl(&mut self, connection: ConnectionId) {
        self.mac.conn_mut(connection).credit_flow_ctrl.init(false, 0);
    }

    /// Keep sync alive with header-only frames when the TX queue is empty.
    pub fn enable_auto_sync(&mut self, connection: ConnectionId) {
        self.mac.conn_mut(connection).auto_sync_enable = true;
    }

    pub fn disable_auto_sync(&mut self, connection: ConnectionId) {
        self.mac.conn_mut(connection).auto_sync_enable = false;
    }

    /// Pin the receiver gain instead of running the gain loop.
    pub fn disable_gain_loop(&mut self, connection: ConnectionId, rx_gain: u8) {
        let conn = self.mac.conn_mut(connection);
        for per_channel in conn.gain_loop.iter_mut() {
            for gain in per_channel.iter_mut() {
                gain.set_fixed_gain(rx_gain);
            }
        }
    }

    pub fn enable_gain_loop(&mut self, connection: ConnectionId) {
        let conn = self.mac.conn_mut(connection);
        for per_channel in conn.gain_loop.iter_mut() {
            for gain in per_channel.iter_mut() {
                gain.clear_fixed_gain();
            }
        }
    }

    /// Carry frames larger than the connection payload budget by
    /// splitting them into fragments.
    pub fn enable_fragmentation(&mut self, connection: ConnectionId) {
        self.mac.conn_mut(connection).frag.enable();
    }

    /// Allocate the throttle pattern of `connection` (initially always
    /// on).
    pub fn init_connection_throttle(&mut self, connection: ConnectionId) {
        let conn = self.mac.conn_mut(connection);
        let mut pattern = heapless::Vec::new();
        for _ in 0..config::PATTERN_THROTTLE_GRANULARITY {
            let _ = pattern.push(true);
        }
        conn.pattern = Some(pattern);
        conn.pattern_total_count = config::PATTERN_THROTTLE_GRANULARITY as u8;
        conn.pattern_count = 0;
    }

    /// Request a new active timeslot ratio; applied at the next PHY
    /// boundary.
    pub fn set_active_ratio(
        &mut self,
        connection: ConnectionId,
        ratio_percent: u8,
    ) -> Result<(), WpsError> {
        if self.mac.conn(connection).pattern.is_none() {
            return Err(WpsError::ConnThrottleNotInit);
        }
        let granularity = config::PATTERN_THROTTLE_GRANULARITY as u8;
        let on = u16::from(ratio_percent.min(100)) * u16::from(granularity) / 100;
        let on = on as u8;
        let g = gcd(u32::from(on.max(1)), u32::from(granularity)) as u8;
        let total = granularity / g;
        let on_reduced = on / g;

        let mut pattern = [false; config::PATTERN_THROTTLE_GRANULARITY];
        let mut acc = 0u16;
        for (i, slot) in pattern.iter_mut().enumerate().take(usize::from(total)) {
            let next = (i as u16 + 1) * u16::from(on_reduced) / u16::from(total);
            *slot = next != acc;
            acc = next;
        }

        let cfg = ScheduleRatioCfg {
            active_ratio: ratio_percent,
            pattern_total_count: total,
            pattern_current_count: 0,
            pattern,
        };
        if !self
            .mac
            .request_queue
            .enqueue(WpsRequest::ChangeScheduleRatio { connection, cfg })
        {
            return Err(WpsError::ScheduleRatioRequestQueueFull);
        }
        Ok(())
    }

    /* -------------------------------------------------------------- */
    /* Callbacks                                                       */
    /* -------------------------------------------------------------- */

    pub fn set_tx_success_callback(&mut self, connection: ConnectionId, cb: WpsCallback) {
        self.mac.conn_mut(connection).tx_success_callback = Some(cb);
    }

    pub fn set_tx_fail_callback(&mut self, connection: ConnectionId, cb: WpsCallback) {
        self.mac.conn_mut(connection).tx_fail_callback = Some(cb);
    }

    pub fn set_tx_drop_callback(&mut self, connection: ConnectionId, cb: WpsCallback) {
        self.mac.conn_mut(connection).tx_drop_callback = Some(cb);
    }

    pub fn set_rx_success_callback(&mut self, connection: ConnectionId, cb: WpsCallback) {
        self.mac.conn_mut(connection).rx_success_callback = Some(cb);
    }

    pub fn set_ranging_data_ready_callback(&mut self, connection: ConnectionId, cb: WpsCallback) {
        self.mac.conn_mut(connection).ranging_data_ready_callback = Some(cb);
    }

    pub fn set_event_callback(&mut self, connection: ConnectionId, cb: WpsCallback) {
        self.mac.conn_mut(connection).evt_callback = Some(cb);
    }

    /* -------------------------------------------------------------- */
    /* Lifecycle                                                       */
    /* -------------------------------------------------------------- */

    /// Join the network: start the radio timer and run the schedule.
    pub fn connect(&mut self) -> Result<(), WpsError> {
        if self.state == WpsState::Connected {
            return Err(WpsError::AlreadyConnected);
        }
        if !self.mac.scheduler.is_configured() {
            return Err(WpsError::NotInit);
        }
        let sequence = self
            .channel_sequence
            .clone()
            .ok_or(WpsError::ChannelSequenceNotInit)?;
        if !self.mac.channel_hopping.init(
            sequence,
            self.random_channel_sequence_enabled,
            self.mac.network_id,
        ) {
            return Err(WpsError::ChannelSequenceInitError);
        }

        // Size the RX expectations from the widest connection.
        let mut max_header = 0u8;
        let mut max_payload = 0u8;
        for conn in self.mac.connections.iter() {
            max_header = max_header.max(conn.header_size).max(conn.ack_header_size);
            max_payload = max_payload.max(conn.payload_size);
        }
        self.mac.max_expected_header_size = max_header;
        self.mac.max_expected_payload_size = max_payload;

        self.mac.reset();
        self.mac.scheduler.set_first_time_slot();
        self.mac.scheduler.refresh_lightest_sleep_lvl();
        self.mac.disconnect_requested = false;
        self.mac.fatal_error = None;

        self.phy.connect(&mut self.hal)?;
        self.state = WpsState::Connected;

        // Dispatch the connect signal: stage the first timeslot.
        self.mac.reset_connections_parameters();
        self.advance_timeslot(true);
        self.prepare_frame();
        self.run_phy();
        self.hal.context_switch_trigger();
        Ok(())
    }

    /// Leave the network at the next PHY boundary; poll
    /// [`Wps::state`] or the `Disconnect` event.
    pub fn disconnect(&mut self) -> Result<(), WpsError> {
        if self.state != WpsState::Connected {
            return Err(WpsError::AlreadyDisconnected);
        }
        if !self.mac.request_queue.enqueue(WpsRequest::Disconnect) {
            return Err(WpsError::RequestQueueFull);
        }
        Ok(())
    }

    /// Disconnect and reconnect after a crash.
    pub fn reset(&mut self) -> Result<(), WpsError> {
        if self.state == WpsState::Connected {
            self.phy.disconnect(&mut self.hal)?;
            self.state = WpsState::Idle;
        }
        self.connect()
    }

    /// Stay synchronized but stop carrying application payloads.
    pub fn halt(&mut self) {
        self.mac.halted = true;
    }

    pub fn resume(&mut self) {
        self.mac.halted = false;
    }

    pub fn state(&self) -> WpsState {
        self.state
    }

    /* -------------------------------------------------------------- */
    /* Traffic                                                         */
    /* -------------------------------------------------------------- */

    /// Reserve a zero-copy TX slot of `size` bytes; fill it and commit
    /// with [`Wps::send_reserved`].
    pub fn get_free_slot(
        &mut self,
        connection: ConnectionId,
        size: u8,
    ) -> Result<&mut [u8], WpsError> {
        let (header_size, max_payload) = {
            let conn = self.mac.conn(connection);
            (conn.header_size, conn.payload_size)
        };
        if size > max_payload {
            return Err(WpsError::WrongTxSize);
        }
        if self.mac.conn(connection).reservation.is_some() {
            return Err(WpsError::QueueFull);
        }
        if self.mac.conn(connection).xlayer_queue.free_space() == 0 {
            return Err(WpsError::QueueFull);
        }
        let Some(node) = self.tx_pool.get_free_node() else {
            return Err(WpsError::QueueFull);
        };
        let block = mac::tx_frame_block_size(header_size, size);
        let Some(offset) = self.tx_data.allocate(block) else {
            self.tx_pool.free_node(node);
            return Err(WpsError::NotEnoughMemory);
        };
        self.mac.conn_mut(connection).reservation = Some(TxReservation {
            node,
            mem_offset: offset,
            mem_len: block,
            payload_capacity: size,
        });
        let payload_offset = offset + config::SPI_BURST_PREFIX_SIZE as u16 + u16::from(header_size);
        Ok(self.tx_data.slice(payload_offset, u16::from(size)))
    }

    /// Commit a reservation made with [`Wps::get_free_slot`].
    pub fn send_reserved(&mut self, connection: ConnectionId, size: u8) -> Result<(), WpsError> {
        let Some(reservation) = self.mac.conn_mut(connection).reservation.take() else {
            return Err(WpsError::QueueEmpty);
        };
        if size > reservation.payload_capacity {
            self.rollback_reservation(connection, reservation);
            return Err(WpsError::WrongTxSize);
        }
        self.commit_reservation(connection, reservation, size)
    }

    /// Queue `payload` for transmission at the next available timeslot.
    pub fn send(&mut self, connection: ConnectionId, payload: &[u8]) -> Result<(), WpsError> {
        let now = self.hal.now_ticks();
        if let Some(reservation) = self.mac.conn_mut(connection).reservation.take() {
            if payload.len() > usize::from(reservation.payload_capacity) {
                self.rollback_reservation(connection, reservation);
                return Err(WpsError::WrongTxSize);
            }
            let header_size = self.mac.conn(connection).header_size;
            let payload_offset = reservation.mem_offset
                + config::SPI_BURST_PREFIX_SIZE as u16
                + u16::from(header_size);
            self.tx_data
                .slice(payload_offset, payload.len() as u16)
                .copy_from_slice(payload);
            return self.commit_reservation(connection, reservation, payload.len() as u8);
        }
        if self.mac.conn(connection).frag.enabled {
            let mut frag = self.mac.conn(connection).frag.clone();
            let result = mac::frag::send(
                &mut self.mac,
                &mut self.tx_pool,
                &mut self.tx_data,
                connection,
                payload,
                now,
                &mut frag,
            );
            self.mac.conn_mut(connection).frag = frag;
            return result;
        }
        mac::enqueue_tx_frame(
            &mut self.mac,
            &mut self.tx_pool,
            &mut self.tx_data,
            connection,
            payload,
            now,
        )
    }

    fn rollback_reservation(&mut self, _connection: ConnectionId, reservation: TxReservation) {
        self.tx_data.free(reservation.mem_offset, reservation.mem_len);
        self.tx_pool.free_node(reservation.node);
    }

    fn commit_reservation(
        &mut self,
        connection: ConnectionId,
        reservation: TxReservation,
        size: u8,
    ) -> Result<(), WpsError> {
        let now = self.hal.now_ticks();
        let (header_size, source, destination) = {
            let conn = self.mac.conn(connection);
            (conn.header_size, conn.source_address, conn.destination_address)
        };
        let payload_offset = reservation.mem_offset
            + config::SPI_BURST_PREFIX_SIZE as u16
            + u16::from(header_size);
        {
            let frame = &mut self.tx_pool.node_mut(reservation.node).xlayer.frame;
            frame.source_address = source;
            frame.destination_address = destination;
            frame.header_memory = BufPtr::new(BufKind::TxArena, reservation.mem_offset);
            frame.header_memory_size = header_size;
            frame.payload_memory = BufPtr::new(BufKind::TxArena, payload_offset);
            frame.payload_memory_size = size;
            frame.payload_begin = BufPtr::new(BufKind::TxArena, payload_offset);
            frame.payload_end = frame.payload_begin.add(u16::from(size));
            frame.header_begin = frame.payload_begin;
            frame.header_end = frame.payload_begin;
            frame.max_frame_size = reservation.mem_len;
            frame.retry_count = 0;
            frame.time_stamp = now;
            frame.frame_outcome = xlayer::FrameOutcome::Wait;
            frame.user_payload = false;
        }
        let conn = &mut self.mac.connections[usize::from(connection.0)];
        if !self.tx_pool.enqueue(&mut conn.xlayer_queue, reservation.node) {
            self.tx_data.free(reservation.mem_offset, reservation.mem_len);
            self.tx_pool.free_node(reservation.node);
            return Err(WpsError::QueueFull);
        }
        Ok(())
    }

    /// Borrow the payload of the oldest received frame.
    pub fn read(&mut self, connection: ConnectionId) -> Result<RxFrame<'_>, WpsError> {
        let Some(node) = self.mac.conn(connection).xlayer_queue.peek() else {
            return Err(WpsError::QueueEmpty);
        };
        let frame = &self.rx_pool.node(node).xlayer.frame;
        let len = frame.payload_size();
        let begin = frame.payload_begin;
        match begin.kind {
            BufKind::RxArena => Ok(RxFrame { payload: self.rx_data.slice_ref(begin.offset, len) }),
            _ => Err(WpsError::QueueEmpty),
        }
    }

    /// Payload size of the oldest received frame.
    pub fn get_read_payload_size(&mut self, connection: ConnectionId) -> Result<u16, WpsError> {
        if self.mac.conn(connection).frag.enabled {
            return mac::frag::read_size(
                &mut self.mac,
                &mut self.rx_pool,
                &mut self.rx_data,
                connection,
            )
            .map(|size| size as u16);
        }
        let Some(node) = self.mac.conn(connection).xlayer_queue.peek() else {
            return Err(WpsError::QueueEmpty);
        };
        Ok(self.rx_pool.node(node).xlayer.frame.payload_size())
    }

    /// Copy the oldest received frame (reassembling fragments when
    /// enabled) into `buffer` and release it.
    pub fn read_to_buffer(
        &mut self,
        connection: ConnectionId,
        buffer: &mut [u8],
    ) -> Result<u16, WpsError> {
        if self.mac.conn(connection).frag.enabled {
            return mac::frag::read(
                &mut self.mac,
                &mut self.rx_pool,
                &mut self.rx_data,
                connection,
                buffer,
            )
            .map(|size| size as u16);
        }
        let len = {
            let frame = self.read(connection)?;
            let len = frame.payload.len();
            if len > buffer.len() {
                return Err(WpsError::WrongRxSize);
            }
            buffer[..len].copy_from_slice(frame.payload);
            len
        };
        self.read_done(connection)?;
        Ok(len as u16)
    }

    /// Release the oldest received frame.
    pub fn read_done(&mut self, connection: ConnectionId) -> Result<(), WpsError> {
        let conn = &mut self.mac.connections[usize::from(connection.0)];
        let Some(node) = self.rx_pool.dequeue(&mut conn.xlayer_queue) else {
            return Err(WpsError::QueueEmpty);
        };
        let frame = &mut self.rx_pool.node_mut(node).xlayer.frame;
        if frame.payload_memory.kind == BufKind::RxArena && frame.max_frame_size != 0 {
            self.rx_data.free(frame.payload_memory.offset, frame.max_frame_size);
        }
        frame.payload_memory = BufPtr::NULL;
        frame.max_frame_size = 0;
        self.rx_pool.free_node(node);
        Ok(())
    }

    /// Frames currently queued on `connection`.
    pub fn get_fifo_size(&self, connection: ConnectionId) -> u16 {
        self.mac.conn(connection).xlayer_queue.size()
    }

    /// Remaining queue capacity of `connection`.
    pub fn get_fifo_free_space(&self, connection: ConnectionId) -> u16 {
        self.mac.conn(connection).xlayer_queue.free_space()
    }

    /* -------------------------------------------------------------- */
    /* Status and statistics                                           */
    /* -------------------------------------------------------------- */

    pub fn get_connect_status(&self, connection: ConnectionId) -> bool {
        self.mac.conn(connection).connect_status.is_connected()
    }

    pub fn get_event(&self, connection: ConnectionId) -> WpsEvent {
        self.mac.conn(connection).wps_event
    }

    pub fn get_error(&self, connection: ConnectionId) -> Option<WpsError> {
        self.mac.conn(connection).wps_error.or(self.mac.fatal_error)
    }

    pub fn get_phy_total_cca_events(&self, connection: ConnectionId) -> u32 {
        self.mac.conn(connection).total_cca_events
    }

    pub fn get_phy_total_cca_fail_count(&self, connection: ConnectionId) -> u32 {
        self.mac.conn(connection).total_cca_fail_count
    }

    pub fn get_phy_total_cca_tx_fail_count(&self, connection: ConnectionId) -> u32 {
        self.mac.conn(connection).total_cca_tx_fail_count
    }

    pub fn get_phy_total_pkt_dropped(&self, connection: ConnectionId) -> u32 {
        self.mac.conn(connection).total_pkt_dropped
    }

    /// Duplicate frames rejected by the stop-and-wait ARQ.
    pub fn get_arq_duplicate_count(&self, connection: ConnectionId) -> u32 {
        self.mac.conn(connection).stop_and_wait_arq.duplicate_count()
    }

    /// Retransmissions performed by the stop-and-wait ARQ.
    pub fn get_arq_retry_count(&self, connection: ConnectionId) -> u32 {
        self.mac.conn(connection).stop_and_wait_arq.retry_count()
    }

    /// Distinct channels in the configured hopping sequence.
    pub fn get_channel_count(&self) -> Result<u8, WpsError> {
        let seq = self
            .channel_sequence
            .as_ref()
            .ok_or(WpsError::ChannelSequenceNotInit)?;
        Ok(seq.channel_count() as u8)
    }

    #[cfg(feature = "stats")]
    pub fn connection_lqi(&self, connection: ConnectionId) -> &link::lqi::Lqi {
        &self.mac.conn(connection).lqi
    }

    #[cfg(feature = "stats")]
    pub fn connection_stats(&self, connection: ConnectionId) -> &link::lqi::WpsStats {
        &self.mac.conn(connection).wps_stats
    }

    /// Accumulated ranging phase samples (local, remote).
    pub fn read_phase(
        &self,
        connection: ConnectionId,
    ) -> Result<(&[PhaseInfo], &[PhaseInfo]), WpsError> {
        let conn = self.mac.conn(connection);
        if !conn.link_phase.is_ready() {
            return Err(WpsError::QueueEmpty);
        }
        Ok(conn.link_phase.samples())
    }

    pub fn read_phase_done(&mut self, connection: ConnectionId) {
        self.mac.conn_mut(connection).link_phase.read_done();
    }

    /* -------------------------------------------------------------- */
    /* Register requests                                               */
    /* -------------------------------------------------------------- */

    /// Queue a radio register write, applied between timeslots.
    pub fn request_write_register(
        &mut self,
        reg: u8,
        value: u16,
        cfg: RegWriteCfg,
    ) -> Result<(), WpsError> {
        if !self
            .mac
            .request_queue
            .enqueue(WpsRequest::WritePhyReg { reg, value, cfg })
        {
            return Err(WpsError::WriteRequestQueueFull);
        }
        Ok(())
    }

    /// Drop every periodic register overwrite.
    pub fn clear_write_register(&mut self) {
        self.phy.clear_write_register();
    }

    /// Queue a radio register read; poll
    /// [`Wps::read_register_result`] for the value.
    pub fn request_read_register(&mut self, reg: u8) -> Result<(), WpsError> {
        if !self.mac.request_queue.enqueue(WpsRequest::ReadPhyReg { reg }) {
            return Err(WpsError::ReadRequestQueueFull);
        }
        Ok(())
    }

    /// Completed register read, if any.
    pub fn read_register_result(&mut self) -> Option<u16> {
        self.phy.take_read_result()
    }

    /* -------------------------------------------------------------- */
    /* Interrupt entry points                                          */
    /* -------------------------------------------------------------- */

    /// Radio IRQ line fired. Call from the radio interrupt handler.
    pub fn radio_irq(&mut self) {
        if self.mac.disconnect_requested || self.state != WpsState::Connected {
            return;
        }
        self.phy.set_input_signal(PhyInput::RadioIrq);
        self.run_phy();
    }

    /// SPI DMA transfer completed. Call from the DMA interrupt handler.
    pub fn transfer_complete(&mut self) {
        if self.state != WpsState::Connected {
            return;
        }
        self.phy.set_input_signal(PhyInput::DmaCmplt);
        self.run_phy();
    }

    /// Drain the deferred callback queue. Call from the low-priority
    /// context-switch interrupt.
    pub fn process_callback(&mut self) {
        while let Some(item) = self.mac.callback_queue.dequeue() {
            (item.callback)(item.connection);
        }
    }

    /// Certification mode: continuous pattern transmission.
    #[cfg(feature = "certification")]
    pub fn enable_certification(&mut self) {
        let now = self.hal.now_ticks();
        mac::certification::init(&mut self.mac, &mut self.tx_pool, &mut self.tx_data, now);
    }

    /// Direct access to the HAL, for integrations that own the pins.
    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Node configuration the stack was initialized with.
    pub fn node_cfg(&self) -> &WpsNodeCfg {
        &self.node_cfg
    }

    /* -------------------------------------------------------------- */
    /* MAC <-> PHY orchestration                                       */
    /* -------------------------------------------------------------- */

    /// Run the PHY until it suspends, dispatching its signals to the MAC.
    fn run_phy(&mut self) {
        loop {
            let (main, auto) = {
                let mut res = PhyRes {
                    mac: &mut self.mac,
                    tx_pool: &mut self.tx_pool,
                    rx_pool: &mut self.rx_pool,
                    tx_data: &mut self.tx_data,
                    rx_data: &mut self.rx_data,
                };
                self.phy.process(&mut self.hal, &mut res)
            };
            match main {
                PhyOutput::Yield | PhyOutput::None | PhyOutput::PrepareDone => break,
                PhyOutput::ConfigComplete => {
                    self.process_pending_request();
                    self.hal.context_switch_trigger();
                    break;
                }
                PhyOutput::BlockingConfigDone => {
                    // The bus is quiet; drain a request and resume the
                    // chain, the next prepare is still queued.
                    self.process_pending_request();
                    if self.state != WpsState::Connected {
                        break;
                    }
                }
                PhyOutput::FrameSentAck
                | PhyOutput::FrameSentNack
                | PhyOutput::FrameReceived
                | PhyOutput::FrameMissed => {
                    self.process_frame_outcomes(main, auto);
                    if self.mac.disconnect_requested || self.state != WpsState::Connected {
                        break;
                    }
                    self.advance_timeslot(false);
                    self.prepare_frame();
                }
                PhyOutput::Connect => {
                    self.mac.reset_connections_parameters();
                    self.advance_timeslot(true);
                    self.prepare_frame();
                    self.hal.context_switch_trigger();
                }
                PhyOutput::FrameNotSent => break,
                PhyOutput::Error => {
                    self.mac.fatal_error = Some(WpsError::PhyCritical);
                    if let Some(main_conn) = self.mac.main_conn {
                        let cb = self.mac.conn(main_conn).evt_callback;
                        self.mac.conn_mut(main_conn).wps_error = Some(WpsError::PhyCritical);
                        self.mac.conn_mut(main_conn).wps_event = WpsEvent::Error;
                        self.mac.callback_queue.enqueue(cb, main_conn);
                        self.hal.context_switch_trigger();
                    }
                    break;
                }
            }
        }
    }

    /// Digest the main and auto-reply outcomes of the finished timeslot.
    fn process_frame_outcomes(&mut self, main: PhyOutput, auto: PhyOutput) {
        // Pull back the per-exchange results the PHY recorded.
        self.mac.cfg = self.phy.cfg.clone();
        let now = self.hal.now_ticks();

        match main {
            PhyOutput::FrameSentAck | PhyOutput::FrameSentNack => {
                if self.mac.main_xlayer == XlayerRef::EmptyTx {
                    self.mac.process_tx_main_empty(main == PhyOutput::FrameSentAck);
                } else {
                    self.mac.process_tx_main(
                        main == PhyOutput::FrameSentAck,
                        &mut self.tx_pool,
                        &mut self.tx_data,
                        now,
                    );
                }
            }
            PhyOutput::FrameReceived | PhyOutput::FrameMissed => {
                let outcome = self.mac.xlayer_frame_outcome(
                    self.mac.main_xlayer,
                    &self.tx_pool,
                    &self.rx_pool,
                );
                self.mac.update_sync(outcome);
                self.mac.process_rx_main(
                    main == PhyOutput::FrameReceived,
                    &mut self.rx_pool,
                    &mut self.rx_data,
                );
            }
            _ => {}
        }

        if let Some(auto_ref) = self.mac.auto_xlayer {
            match auto {
                PhyOutput::FrameSentAck | PhyOutput::FrameSentNack | PhyOutput::FrameNotSent => {
                    if auto_ref == XlayerRef::EmptyTx || auto_ref == XlayerRef::EmptyAutoReply {
                        self.mac.process_tx_auto_empty(&mut self.tx_pool);
                    } else {
                        self.mac.process_tx_auto(auto, &mut self.tx_pool, &mut self.tx_data, now);
                    }
                }
                PhyOutput::FrameReceived | PhyOutput::FrameMissed => {
                    self.mac.process_rx_auto(
                        auto == PhyOutput::FrameReceived,
                        &mut self.rx_pool,
                        &mut self.rx_data,
                    );
                }
                _ => {}
            }
        }
    }

    fn advance_timeslot(&mut self, connect_entry: bool) {
        let now = self.hal.now_ticks();
        self.mac.process_next_timeslot(
            &mut self.tx_pool,
            &mut self.rx_pool,
            &mut self.tx_data,
            now,
            connect_entry,
        );
    }

    /// Compose the staged headers and arm the PHY for the new slot.
    fn prepare_frame(&mut self) {
        if self.mac.is_current_timeslot_tx() {
            if let Some(main) = self.mac.main_conn {
                let has_header = !matches!(self.mac.main_xlayer, XlayerRef::EmptyTx)
                    || !self.mac.empty_frame_tx.frame.header_memory.is_null();
                if has_header {
                    let frame_ref = self.mac.main_xlayer;
                    self.mac
                        .fill_header(main, frame_ref, false, &mut self.tx_pool, &mut self.tx_data);
                }
            }
        } else if let Some(auto) = self.mac.auto_conn {
            if self.mac.is_current_auto_timeslot_tx() {
                if let Some(auto_ref) = self.mac.auto_xlayer {
                    let has_header = !matches!(auto_ref, XlayerRef::EmptyTx)
                        || !self.mac.empty_frame_tx.frame.header_memory.is_null();
                    if has_header {
                        self.mac.fill_header(
                            auto,
                            auto_ref,
                            false,
                            &mut self.tx_pool,
                            &mut self.tx_data,
                        );
                    }
                }
            }
        } else if let Some(auto_ref) = self.mac.auto_xlayer {
            // Header-only acknowledge for a slot without an auto-reply
            // connection.
            if auto_ref == XlayerRef::EmptyAutoReply && !self.mac.is_current_timeslot_tx() {
                if let Some(main) = self.mac.main_conn {
                    self.mac
                        .fill_header(main, auto_ref, true, &mut self.tx_pool, &mut self.tx_data);
                }
            }
        }

        let input = if self.mac.syncing_slot { PhyInput::Syncing } else { PhyInput::PrepareRadio };
        self.phy.set_input_signal(input);
        self.phy.set_main_xlayer(self.mac.main_xlayer, self.mac.cfg.clone());
        self.phy.set_auto_xlayer(self.mac.auto_xlayer);
    }

    /// Drain one pending application request at a PHY boundary.
    fn process_pending_request(&mut self) {
        let Some(request) = self.mac.request_queue.dequeue() else {
            return;
        };
        match request {
            WpsRequest::ChangeScheduleRatio { connection, cfg } => {
                self.mac.apply_schedule_ratio(connection, &cfg);
            }
            WpsRequest::WritePhyReg { reg, value, cfg } => {
                let _ = self.phy.write_register(reg, value, cfg);
            }
            WpsRequest::ReadPhyReg { reg } => {
                let _ = self.phy.read_register(reg);
            }
            WpsRequest::Disconnect => {
                let result = self.phy.disconnect(&mut self.hal);
                self.mac.disconnect_requested = true;
                self.state = WpsState::Idle;
                for idx in 0..self.mac.connections.len() {
                    let id = ConnectionId(idx as u8);
                    let cb = self.mac.conn(id).evt_callback;
                    self.mac.conn_mut(id).wps_event = WpsEvent::Disconnect;
                    if result.is_err() {
                        self.mac.conn_mut(id).wps_error = Some(WpsError::DisconnectTimeout);
                    }
                    self.mac.callback_queue.enqueue(cb, id);
                }
                self.hal.context_switch_trigger();
            }
        }
    }
}

/// Convert a duration in microseconds to PLL cycles.
pub fn us_to_pll_cycles(time_us: u32, pll_frequency_hz: u32) -> u32 {
    ((u64::from(time_us) * u64::from(pll_frequency_hz)) / 1_000_000) as u32
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn us_to_pll_cycle_conversion() {
        assert_eq!(us_to_pll_cycles(1_000, 20_480_000), 20_480);
        assert_eq!(us_to_pll_cycles(0, 20_480_000), 0);
    }

    #[test]
    fn gcd_reduces_ratios() {
        assert_eq!(gcd(10, 20), 10);
        assert_eq!(gcd(15, 20), 5);
        assert_eq!(gcd(0, 20), 20);
    }

    #[test]
    fn timeslot_helpers() {
        let main = main_timeslot(3);
        assert_eq!(main.index, 3);
        assert!(!main.auto_reply);
        let auto = auto_timeslot(4);
        assert!(auto.auto_reply);
    }
}
