//! Build-time configuration of the stack.
//!
//! These constants bound every statically allocated table in the stack.
//! They mirror what a board integration would tune for its memory budget.

/// Number of radios serviced by the stack.
pub const RADIO_COUNT: usize = 1;

/// Radio FIFO size in bytes.
pub const RADIO_FIFO_SIZE: usize = 128;

/// Size of the frame-size byte the radio prepends in its RX buffer.
pub const PAYLOAD_SIZE_BYTE_SIZE: usize = 1;

/// Largest frame the radio can carry, size byte included.
pub const RADIO_MAX_PACKET_SIZE: usize = 255;

/// Throttle pattern granularity (ratio denominator, 100 / value percent steps).
pub const PATTERN_THROTTLE_GRANULARITY: usize = 20;

/// CCA threshold value that disables the CCA block entirely.
pub const DISABLE_CCA_THRESHOLD: u8 = 0xFF;

/// Maximum number of connections hosted by a single timeslot.
pub const MAX_CONN_PER_TIMESLOT: usize = 3;

/// Maximum connection priority value.
pub const MAX_CONN_PRIORITY: u8 = (MAX_CONN_PER_TIMESLOT - 1) as u8;

/// Minimum number of nodes in a connection queue.
pub const MIN_QUEUE_SIZE: usize = 2;

/// Maximum number of connections a node can own.
pub const MAX_CONNECTION_COUNT: usize = 8;

/// Maximum number of timeslots in the schedule.
pub const MAX_TIMESLOT_COUNT: usize = 32;

/// Maximum channel hopping sequence length.
pub const MAX_CHANNEL_SEQUENCE_SIZE: usize = 16;

/// Maximum number of distinct RF channels per connection.
pub const MAX_CHANNEL_COUNT: usize = 8;

/// Maximum number of fallback threshold levels per connection.
pub const MAX_FALLBACK_LEVEL_COUNT: usize = 4;

/// Maximum number of fields in a link protocol header.
pub const MAX_PROTOCOL_FIELD_COUNT: usize = 6;

/// Largest header the link protocol can compose, in bytes.
pub const HEADER_MAX_SIZE: usize = 32;

/// Depth of the PHY state machine chain queue.
pub const PHY_STATE_QUEUE_SIZE: usize = 8;

/// Number of periodic register overwrites the PHY retains.
pub const PHY_OVERWRITE_REG_COUNT: usize = 8;

/// Depth of the application request queue.
pub const REQUEST_QUEUE_SIZE: usize = 8;

/// Depth of the deferred application callback queue.
pub const CALLBACK_QUEUE_SIZE: usize = 32;

/// Bytes reserved in front of a TX frame for the SPI burst command
/// (register byte plus header-size byte).
pub const SPI_BURST_PREFIX_SIZE: usize = 2;
