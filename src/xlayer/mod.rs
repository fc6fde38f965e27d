//! # Cross-layer frame descriptors
//!
//! An [`Xlayer`] is the frame descriptor threaded through the application
//! queues, the MAC and the PHY. Frame bytes live in one of a few fixed
//! storages (a node's header block, one of the circular payload arenas, or
//! a MAC scratch buffer); descriptors address them with [`BufPtr`] fat
//! offsets so a descriptor never dangles and never aliases.

pub mod circular_data;
pub mod queue;

pub use circular_data::CircularData;
pub use queue::{NodeIdx, NodePool, XlayerNode, XlayerQueue};

/// Outcome of the radio exchange a frame was part of.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameOutcome {
    /// Frame still waiting for its exchange (initial state, CCA abort).
    #[default]
    Wait,
    /// Frame sent and acknowledged.
    SentAck,
    /// Frame sent, acknowledge never arrived.
    SentAckLost,
    /// Frame sent, acknowledge arrived corrupted or misaddressed.
    SentAckRejected,
    /// Frame received.
    Received,
    /// Expected frame never arrived.
    Lost,
    /// Frame arrived corrupted or misaddressed.
    Rejected,
}

/// Storage a frame byte range lives in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufKind {
    /// No backing storage.
    #[default]
    None,
    /// The per-node header block of the given pool node.
    NodeHeader(NodeIdx),
    /// The TX circular payload arena.
    TxArena,
    /// The RX circular payload arena.
    RxArena,
    /// The MAC scratch buffer used for empty and overrun frames.
    Scratch,
    /// The MAC buffer used for auto-reply frames without a dedicated
    /// connection.
    AutoReply,
}

/// Offset into one of the frame storages.
///
/// Behaves like the byte iterators of a frame: it can be advanced and
/// rewound within its storage and compared for equality.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BufPtr {
    pub kind: BufKind,
    pub offset: u16,
}

impl BufPtr {
    pub const NULL: BufPtr = BufPtr { kind: BufKind::None, offset: 0 };

    pub fn new(kind: BufKind, offset: u16) -> Self {
        Self { kind, offset }
    }

    pub fn is_null(&self) -> bool {
        self.kind == BufKind::None
    }

    #[must_use]
    pub fn add(self, n: u16) -> Self {
        Self { kind: self.kind, offset: self.offset + n }
    }

    #[must_use]
    pub fn sub(self, n: u16) -> Self {
        Self { kind: self.kind, offset: self.offset.saturating_sub(n) }
    }

    /// Distance to `other`, which must live in the same storage.
    pub fn distance_to(&self, other: BufPtr) -> u16 {
        debug_assert_eq!(self.kind, other.kind);
        other.offset.saturating_sub(self.offset)
    }
}

/// Frame half of the cross-layer descriptor.
#[derive(Debug, Default, Clone)]
pub struct XlayerFrame {
    /// Transmitting node address.
    pub source_address: u16,
    /// Receiving node address.
    pub destination_address: u16,
    /// Backing storage of the header bytes (and of the whole frame when
    /// header and payload are contiguous).
    pub header_memory: BufPtr,
    /// Size of the header backing storage.
    pub header_memory_size: u8,
    /// Backing storage of the payload bytes when not contiguous with the
    /// header.
    pub payload_memory: BufPtr,
    /// Size of the payload backing storage.
    pub payload_memory_size: u8,
    /// First header byte.
    pub header_begin: BufPtr,
    /// One past the last header byte.
    pub header_end: BufPtr,
    /// First payload byte.
    pub payload_begin: BufPtr,
    /// One past the last payload byte.
    pub payload_end: BufPtr,
    /// Bytes reserved in the arena for this frame.
    pub max_frame_size: u16,
    /// Transmission attempts so far.
    pub retry_count: u16,
    /// Tick of enqueue, drives the ARQ time deadline.
    pub time_stamp: u64,
    /// Exchange outcome.
    pub frame_outcome: FrameOutcome,
    /// Header and payload live in separate storages and are written to the
    /// radio in two SPI bursts.
    pub user_payload: bool,
}

impl XlayerFrame {
    pub fn header_size(&self) -> u16 {
        self.header_begin.distance_to(self.header_end)
    }

    pub fn payload_size(&self) -> u16 {
        self.payload_begin.distance_to(self.payload_end)
    }
}

/// Per-exchange radio information attached to a frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct XlayerFrameCfg {
    /// Raw RSSI of the exchange.
    pub rssi_raw: u8,
    /// Raw RNSI of the exchange.
    pub rnsi_raw: u8,
    /// CCA attempts consumed by the exchange.
    pub cca_try_count: u8,
    /// Phase samples captured during a ranging exchange.
    pub phases_info: Option<crate::link::phase::PhaseInfo>,
}

/// Cross-layer frame descriptor.
#[derive(Debug, Default, Clone)]
pub struct Xlayer {
    pub frame: XlayerFrame,
    pub config: XlayerFrameCfg,
}
