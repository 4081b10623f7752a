//! Upper link layer: deferred-context pools, queues and the RX demux
//!
//! Everything the radio interrupt produces funnels through this module on
//! its way to the host: received PDUs and synthetic event outcomes travel
//! as [`NodeRx`] nodes through the `ULL_RX` queue into the high priority
//! demux, which consumes event-done nodes internally (feeding the
//! [connection done engine](conn)) and forwards the rest to the host-facing
//! `LL_RX` queue drained from thread context.
//!
//! The module also owns the two PDU buffer pools. TX buffers are acquired
//! by the host, submitted per connection and returned to the pool exactly
//! once through the acknowledgement path; RX buffers are acquired by the
//! radio interrupt, handed upwards with the received PDU and returned by
//! the host (or internally when the PDU is consumed by a control
//! procedure).

pub mod conn;

use crate::config::{EVENT_PIPELINE_MAX, MAX_CONN, PDU_DC_PAYLOAD_MAX, PDU_RX_CNT, PDU_TX_CNT};
use crate::context::{self, ContextId};
use crate::error::Error;
use crate::lll::conn::ConnDoneExtra;
use crate::mayfly::{self, Call};
use crate::mem::pool::{self, Pool};
use crate::mem::queue::Memq;
use crate::pdu::DC_HEADER_SIZE;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Size of one PDU buffer: data channel header plus the largest payload
pub const PDU_BUF_SIZE: usize = DC_HEADER_SIZE + PDU_DC_PAYLOAD_MAX;

/// Outbound PDU buffer node
pub struct NodeTxBuf {
    /// PDU octets, header first; the ARQ bits are filled at transmit time
    pub pdu: [u8; PDU_BUF_SIZE],
    /// The PDU is an LL control PDU
    pub is_ctrl: bool,
    /// Link to the following node of the per-connection composition list
    pub(crate) next: Option<pool::Ref>,
}

impl NodeTxBuf {
    /// Creates a zeroed buffer
    pub fn new() -> Self {
        Self {
            pdu: [0; PDU_BUF_SIZE],
            is_ctrl: false,
            next: None,
        }
    }
}

impl Default for NodeTxBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound PDU buffer node
pub struct NodeRxBuf {
    /// PDU octets, header first
    pub pdu: [u8; PDU_BUF_SIZE],
}

impl NodeRxBuf {
    /// Creates a zeroed buffer
    pub fn new() -> Self {
        Self {
            pdu: [0; PDU_BUF_SIZE],
        }
    }
}

impl Default for NodeRxBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool backing all outbound PDU buffers
pub static TX_POOL: Pool<NodeTxBuf, PDU_TX_CNT> = Pool::new();

/// Pool backing all inbound PDU buffers
pub static RX_POOL: Pool<NodeRxBuf, PDU_RX_CNT> = Pool::new();

/// One completed radio outcome or received PDU travelling towards the host
///
/// `EventDone` nodes are consumed by the demux and never reach the host;
/// every other variant ends up in the host-facing queue.
#[derive(Debug, Clone, Copy)]
pub enum NodeRx {
    /// A connection event completed
    EventDone {
        /// Connection the event belonged to
        handle: u16,
        /// Outcome summary consumed by the done engine
        extra: ConnDoneExtra,
    },
    /// A connection reached the link layer
    Connection {
        /// Handle of the new connection
        handle: u16,
    },
    /// A received data channel PDU
    DcPdu {
        /// Connection the PDU arrived on
        handle: u16,
        /// RX pool reference holding the PDU octets
        node: pool::Ref,
        /// Payload length in octets
        len: u8,
        /// The PDU is an LL control PDU
        is_ctrl: bool,
    },
    /// Connection parameters changed at the update instant
    ConnUpdate {
        /// Connection the update applied on
        handle: u16,
        /// Connection interval now in effect, 1.25 ms units
        interval: u16,
        /// Peripheral latency now in effect, connection events
        latency: u16,
        /// Supervision timeout now in effect, 10 ms units
        timeout: u16,
    },
    /// The connection ended
    Terminate {
        /// Handle that is no longer valid
        handle: u16,
        /// Reason code surfaced to the host
        reason: u8,
    },
    /// RSSI moved past the reporting threshold
    Rssi {
        /// Connection the sample belongs to
        handle: u16,
        /// Latest RSSI sample, dBm attenuation
        rssi: u8,
    },
}

// One done node per pipeline entry plus one PDU node per RX buffer can be
// in flight at once
const ULL_RX_CNT: usize = PDU_RX_CNT + EVENT_PIPELINE_MAX + MAX_CONN + 1;
const LL_RX_CNT: usize = PDU_RX_CNT + 4 * MAX_CONN + 1;

static ULL_RX: Memq<NodeRx, ULL_RX_CNT> = Memq::new();
static LL_RX: Memq<NodeRx, LL_RX_CNT> = Memq::new();

/// Hook waking the host thread when a node reaches the host-facing queue
///
/// On an RTOS this gives a semaphore the HCI thread pends on; the mocked
/// platform's tests install a counter or a no-op.
pub type RxWakeHook = fn();

static RX_WAKE: AtomicUsize = AtomicUsize::new(0);

/// Installs the host wake hook
pub(crate) fn init(rx_wake: RxWakeHook) {
    RX_WAKE.store(rx_wake as usize, Ordering::Relaxed);
}

/// Drops all upper link layer state
///
/// Used by `ll_reset`; buffers held by the host become stale.
pub(crate) fn reset() {
    conn::reset_all();
    crate::lll::conn::queues_reset();
    ULL_RX.reset();
    LL_RX.reset();
    TX_POOL.reset();
    RX_POOL.reset();
}

/// Tears the upper link layer down including the wake hook
///
/// This function is intended to be used between unit tests.
pub(crate) fn deinit() {
    RX_WAKE.store(0, Ordering::Relaxed);
    reset();
}

fn rx_wake() {
    let hook = RX_WAKE.load(Ordering::Relaxed);
    if hook != 0 {
        // Safety: the value was stored from a valid `RxWakeHook` in init()
        let hook: RxWakeHook = unsafe { core::mem::transmute(hook) };
        hook();
    }
}

/// Posts a node from the producing LLL context towards the demux
///
/// Fails with [`Error::NoMemory`] when the queue is full; the receive path
/// treats that as a nack condition and lets the peer retransmit.
pub(crate) fn rx_put(node: NodeRx) -> Result<(), Error> {
    ULL_RX.enqueue(node)?;

    let ret = mayfly::enqueue(context::current(), ContextId::UllHigh, Call::RxDemux);
    assert!(ret.is_ok());
    Ok(())
}

/// Posts the completion outcome of one connection event
///
/// The queue is sized to hold one done node per pipeline entry, so this
/// cannot legitimately fail.
pub(crate) fn event_done(handle: u16, extra: ConnDoneExtra) {
    let ret = rx_put(NodeRx::EventDone { handle, extra });
    assert!(ret.is_ok());
}

/// Appends a node to the host-facing queue and wakes the host
pub(crate) fn ll_rx_put(node: NodeRx) {
    let ret = LL_RX.enqueue(node);
    assert!(ret.is_ok());
    rx_wake();
}

pub(crate) fn ll_rx_peek() -> Option<NodeRx> {
    LL_RX.peek()
}

pub(crate) fn ll_rx_dequeue() -> Option<NodeRx> {
    LL_RX.dequeue()
}

/// Demultiplexes completed LLL work, run in the high priority context
///
/// Acknowledged TX nodes are routed first so the done engine observes the
/// settled acknowledgement state of the event it is about to account for.
pub fn rx_demux() {
    while let Some(ack) = crate::lll::conn::ack_dequeue() {
        conn::tx_ack(ack.handle, ack.node);
    }

    while let Some(node) = ULL_RX.peek() {
        match node {
            NodeRx::EventDone { handle, extra } => {
                ULL_RX.dequeue();
                conn::done(handle, &extra);
            }
            NodeRx::DcPdu {
                handle,
                node: buf,
                len,
                is_ctrl: true,
            } => {
                ULL_RX.dequeue();
                if !conn::rx_ctrl(handle, buf, len) {
                    // Not a procedure this engine runs; the host-side LLCP
                    // layer decodes it
                    ll_rx_put(NodeRx::DcPdu {
                        handle,
                        node: buf,
                        len,
                        is_ctrl: true,
                    });
                }
            }
            other => {
                ULL_RX.dequeue();
                ll_rx_put(other);
            }
        }

        while let Some(ack) = crate::lll::conn::ack_dequeue() {
            conn::tx_ack(ack.handle, ack.node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;
    use serial_test::serial;
    use std::sync::atomic::AtomicU32;

    static WAKES: AtomicU32 = AtomicU32::new(0);

    fn counting_wake() {
        WAKES.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    #[serial]
    fn test_ll_rx_put_wakes_host() {
        mayfly::deinit();
        deinit();
        init(counting_wake);
        WAKES.store(0, Ordering::Relaxed);

        let prev = context::enter(ContextId::UllHigh);
        ll_rx_put(NodeRx::Connection { handle: 0 });
        context::leave(prev);

        assert_eq!(WAKES.load(Ordering::Relaxed), 1);
        assert!(matches!(
            ll_rx_dequeue(),
            Some(NodeRx::Connection { handle: 0 })
        ));
        assert!(ll_rx_peek().is_none());

        deinit();
    }

    #[test]
    #[serial]
    fn test_rx_put_schedules_the_demux() {
        mayfly::deinit();
        deinit();
        init(counting_wake);

        let prev = context::enter(ContextId::Lll);
        rx_put(NodeRx::Connection { handle: 1 }).unwrap();
        context::leave(prev);

        // The demux forwards the node to the host queue
        mayfly::run(ContextId::UllHigh);
        assert!(matches!(
            ll_rx_dequeue(),
            Some(NodeRx::Connection { handle: 1 })
        ));

        deinit();
    }
}
