//! Compile-time sizing of the link layer
//!
//! These constants play the role the build-system configuration plays in a
//! full controller: every pool, queue and table in the crate is sized here
//! and nowhere else. All sizes are chosen for a small peripheral/central
//! with a handful of links; growing them costs static RAM only.

/// Maximum number of concurrent connections. Connection handles are indexes
/// into a table of this size.
pub const MAX_CONN: usize = 2;

/// Maximum number of outstanding entries in the LLL prepare pipeline
pub const EVENT_PIPELINE_MAX: usize = 4;

/// Number of RX PDU buffers shared by all connections
pub const PDU_RX_CNT: usize = 8 + 3;

/// Number of TX PDU buffers shared by all connections
pub const PDU_TX_CNT: usize = 8;

/// Size of the per-connection LLL TX queue (one slot spare to distinguish
/// full from empty)
pub const CONN_TX_QUEUE_CNT: usize = 4;

/// Capacity of the TX acknowledgement FIFO (one slot spare to distinguish
/// full from empty)
pub const TX_ACK_CNT: usize = PDU_TX_CNT + 1;

/// Largest data channel PDU payload carried by the RX/TX node pools
pub const PDU_DC_PAYLOAD_MAX: usize = 27;

/// Depth of each mayfly caller-to-callee FIFO
pub const MAYFLY_QUEUE_CNT: usize = 8;

/// Number of ticker operation slots per ticker user
pub const TICKER_USER_OPS: usize = 4;

/// Consecutive CRC failures tolerated within one connection event before
/// the event is closed early
pub const CRC_EXPIRE_RELOAD: u8 = 2;

/// Supervision-expire threshold (in connection events) below which
/// peripheral latency is overridden and every event is forced
pub const SUPERVISION_FORCE_THRESHOLD: u16 = 6;

/// LL procedure response timeout, microseconds (40 s)
pub const PROCEDURE_TIMEOUT_US: u32 = 40_000_000;

/// Local sleep clock accuracy in ppm, part of the window widening budget
pub const LOCAL_SCA_PPM: u32 = 50;

/// Radio time reserved per connection event, microseconds
pub const CONN_SLOT_US: u32 = 1250;

/// Connection establishment timeout, in connection events without a valid
/// reception before a new link counts as failed to establish
pub const CONNECT_EXPIRE_EVENTS: u16 = 6;
