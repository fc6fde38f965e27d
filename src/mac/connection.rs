//! # Connections
//!
//! A connection is a unidirectional link between two nodes. The direction
//! follows from the addresses: when the source address equals the local
//! address the node transmits on the connection, otherwise it receives.
//! Each connection bundles its queues, link-layer modules, RF channel
//! tables and application callbacks.

use heapless::Vec;

use crate::callback::WpsCallback;
use crate::config::{
    MAX_CHANNEL_COUNT, MAX_FALLBACK_LEVEL_COUNT, PATTERN_THROTTLE_GRANULARITY, RADIO_COUNT,
};
use crate::error::{WpsError, WpsEvent};
use crate::link::cca::LinkCca;
use crate::link::connect_status::LinkConnectStatus;
use crate::link::credit_flow_ctrl::CreditFlowCtrl;
use crate::link::fallback::LinkFallback;
use crate::link::gain_loop::GainLoop;
use crate::link::phase::LinkPhase;
use crate::link::protocol::LinkProtocol;
use crate::link::saw_arq::SawArq;
use crate::phy::regs::RfChannel;
use crate::xlayer::{NodeIdx, XlayerQueue};

#[cfg(feature = "stats")]
use crate::link::lqi::{Lqi, WpsStats};

/// Ranging participation of a connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RangingMode {
    #[default]
    Disabled,
    /// Initiator without a dedicated auto-reply connection.
    StandaloneInitiator,
    /// Responder without a dedicated auto-reply connection.
    StandaloneResponder,
    /// Initiator TX side of a main connection.
    InitiatorTx,
    /// Initiator RX side of an auto-reply connection.
    InitiatorRx,
    /// Responder TX side of an auto-reply connection.
    ResponderTx,
    /// Responder RX side of a main connection.
    ResponderRx,
}

/// Configuration handed to `create_connection`.
#[derive(Debug, Clone)]
pub struct ConnectionCfg {
    /// Transmitting node address.
    pub source_address: u16,
    /// Receiving node address.
    pub destination_address: u16,
    /// Frame queue depth.
    pub fifo_size: u16,
    /// Largest application payload of the connection, in bytes.
    pub max_payload_size: u8,
    /// Priority used when several connections share a timeslot.
    pub priority: u8,
    /// Ranging participation.
    pub ranging_mode: RangingMode,
    /// Delay budget granted to the application on an empty TX queue, in
    /// PLL cycles.
    pub empty_queue_max_delay: i32,
}

impl Default for ConnectionCfg {
    fn default() -> Self {
        Self {
            source_address: 0,
            destination_address: 0,
            fifo_size: 4,
            max_payload_size: 32,
            priority: 0,
            ranging_mode: RangingMode::Disabled,
            empty_queue_max_delay: 0,
        }
    }
}

/// Zero-copy TX reservation handed out by `get_free_slot`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxReservation {
    pub node: NodeIdx,
    /// Offset of the frame block in the TX arena.
    pub mem_offset: u16,
    /// Block length (SPI prefix, header, payload).
    pub mem_len: u16,
    /// Payload capacity the application asked for.
    pub payload_capacity: u8,
}

/// One connection of the node.
pub struct Connection {
    pub source_address: u16,
    pub destination_address: u16,
    /// Largest application payload of the connection.
    pub payload_size: u8,
    pub wps_event: WpsEvent,
    pub wps_error: Option<WpsError>,

    /* layer 2 */
    pub ack_enable: bool,
    /// Generate a header-only ACK frame when no auto-reply connection
    /// shares the timeslot.
    pub ack_frame_enable: bool,
    pub auto_sync_enable: bool,
    pub header_size: u8,
    pub ack_header_size: u8,
    pub empty_queue_max_delay: i32,
    pub link_protocol: LinkProtocol,
    pub auto_link_protocol: LinkProtocol,
    pub stop_and_wait_arq: SawArq,
    pub cca: LinkCca,
    pub link_fallback: LinkFallback,
    pub connect_status: LinkConnectStatus,
    pub priority: u8,
    pub certification_mode_enabled: bool,
    pub ranging_mode: RangingMode,
    pub link_phase: LinkPhase,
    pub credit_flow_ctrl: CreditFlowCtrl,
    /// Send a sync frame on the first slot after a connect event.
    pub first_tx_after_connect: bool,

    /* statistics */
    #[cfg(feature = "stats")]
    pub lqi: Lqi,
    #[cfg(feature = "stats")]
    pub used_frame_lqi: Lqi,
    #[cfg(feature = "stats")]
    pub wps_stats: WpsStats,
    pub total_cca_events: u32,
    pub total_cca_fail_count: u32,
    pub total_cca_tx_fail_count: u32,
    pub total_pkt_dropped: u32,

    /* link throttle */
    pub pattern_count: u8,
    pub active_ratio: u8,
    pub pattern_total_count: u8,
    pub currently_enabled: bool,
    pub pattern: Option<Vec<bool, PATTERN_THROTTLE_GRANULARITY>>,

    /// Gain loop state per channel and radio.
    pub gain_loop: [[GainLoop; RADIO_COUNT]; MAX_CHANNEL_COUNT],

    /* queues */
    /// Pending TX frames or delivered RX frames, per direction.
    pub xlayer_queue: XlayerQueue,
    pub(crate) reservation: Option<TxReservation>,

    /* layer 1 */
    pub channel: Vec<[RfChannel; RADIO_COUNT], MAX_CHANNEL_COUNT>,
    pub fallback_channel: Vec<Vec<[RfChannel; RADIO_COUNT], MAX_CHANNEL_COUNT>, MAX_FALLBACK_LEVEL_COUNT>,
    pub max_channel_count: u8,

    /* callbacks */
    pub tx_success_callback: Option<WpsCallback>,
    pub tx_fail_callback: Option<WpsCallback>,
    pub tx_drop_callback: Option<WpsCallback>,
    pub rx_success_callback: Option<WpsCallback>,
    pub ranging_data_ready_callback: Option<WpsCallback>,
    pub evt_callback: Option<WpsCallback>,

    /// Drop the frame at the queue head on the next timeslot.
    pub tx_flush: bool,

    /// Fragmentation state.
    pub frag: super::frag::FragState,
}

impl Connection {
    pub fn new(cfg: &ConnectionCfg) -> Self {
        let mut channel = Vec::new();
        for _ in 0..MAX_CHANNEL_COUNT {
            let _ = channel.push([RfChannel::default(); RADIO_COUNT]);
        }
        Self {
            source_address: cfg.source_address,
            destination_address: cfg.destination_address,
            payload_size: cfg.max_payload_size,
            wps_event: WpsEvent::None,
            wps_error: None,
            ack_enable: false,
            ack_frame_enable: false,
            auto_sync_enable: false,
            header_size: 0,
            ack_header_size: 0,
            empty_queue_max_delay: cfg.empty_queue_max_delay,
            link_protocol: LinkProtocol::default(),
            auto_link_protocol: LinkProtocol::default(),
            stop_and_wait_arq: SawArq::default(),
            cca: LinkCca::default(),
            link_fallback: LinkFallback::default(),
            connect_status: LinkConnectStatus::default(),
            priority: cfg.priority,
            certification_mode_enabled: false,
            ranging_mode: cfg.ranging_mode,
            link_phase: LinkPhase::default(),
            credit_flow_ctrl: CreditFlowCtrl::default(),
            first_tx_after_connect: true,
            #[cfg(feature = "stats")]
            lqi: Lqi::default(),
            #[cfg(feature = "stats")]
            used_frame_lqi: Lqi::default(),
            #[cfg(feature = "stats")]
            wps_stats: WpsStats::default(),
            total_cca_events: 0,
            total_cca_fail_count: 0,
            total_cca_tx_fail_count: 0,
            total_pkt_dropped: 0,
            pattern_count: 0,
            active_ratio: 100,
            pattern_total_count: 0,
            currently_enabled: true,
            pattern: None,
            gain_loop: [[GainLoop::default(); RADIO_COUNT]; MAX_CHANNEL_COUNT],
            xlayer_queue: XlayerQueue::new_transit(cfg.fifo_size),
            reservation: None,
            channel,
            fallback_channel: Vec::new(),
            max_channel_count: 0,
            tx_success_callback: None,
            tx_fail_callback: None,
            tx_drop_callback: None,
            rx_success_callback: None,
            ranging_data_ready_callback: None,
            evt_callback: None,
            tx_flush: false,
            frag: super::frag::FragState::default(),
        }
    }

    /// Whether this node transmits on the connection.
    pub fn is_tx(&self, local_address: u16) -> bool {
        self.source_address == local_address
    }

    /// RF channel of `channel_idx`, fallback table when a level applies.
    pub fn rf_channel(&self, channel_idx: u8, fallback_index: Option<usize>) -> RfChannel {
        let idx = usize::from(channel_idx).min(MAX_CHANNEL_COUNT - 1);
        if let Some(fb) = fallback_index {
            if let Some(table) = self.fallback_channel.get(fb) {
                if let Some(entry) = table.get(idx) {
                    return entry[0];
                }
            }
        }
        self.channel.get(idx).map(|entry| entry[0]).unwrap_or_default()
    }
}
