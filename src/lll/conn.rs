//! Connection event state machine, run in radio-interrupt context
//!
//! One connection event is a chain of TX/RX sub-exchanges separated by the
//! inter-frame spacing, which the radio capability enforces with its packet
//! timer; this module never busy-waits. The central transmits first in
//! every sub-exchange, the peripheral answers; the event continues while
//! either side signals more data and closes early on a bounded run of CRC
//! failures, on an acknowledged TERMINATE_IND, or when the receive window
//! closes without a packet.
//!
//! Acknowledgement follows the stop-and-wait ARQ of the link layer: a
//! received `nesn` differing from the local `sn` acknowledges the last
//! transmission; a received `sn` matching the local `nesn` carries new
//! data. Duplicates are not re-delivered but are still acknowledged by the
//! reply. When no RX buffer is available the local `nesn` is left alone,
//! which nacks the peer into retransmitting once buffers are back - pool
//! exhaustion costs airtime, never correctness.

use super::{EventKind, IsrTarget, PrepareParam};
use crate::config::{CRC_EXPIRE_RELOAD, PDU_DC_PAYLOAD_MAX};
use crate::context::ContextId;
use crate::hw::cntr::ticks_to_us;
use crate::hw::radio::Phy;
use crate::mayfly::{self, Call};
use crate::mem::fifo::Fifo;
use crate::mem::pool;
use crate::pdu::{CtrlPdu, DataHeader, Llid, DC_HEADER_SIZE};
use crate::ull;

/// Inter-frame spacing in microseconds
pub const TIFS_US: u16 = 150;
/// Active clock jitter budget in microseconds
pub const EVENT_JITTER_US: u32 = 16;
/// Preamble plus access address airtime on the 1M PHY
pub const PREAMBLE_TO_ADDR_US: u32 = 40;
/// RSSI samples accumulated before a report is considered
pub const RSSI_SAMPLE_COUNT: u8 = 10;
/// Minimum RSSI delta triggering a report
pub const RSSI_THRESHOLD: u8 = 4;

/// Number of data channels
const DATA_CHAN_COUNT: u8 = 37;

/// Connection role
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    /// Central: transmits first in every sub-exchange
    Central,
    /// Peripheral: receives the anchor packet, widens its window for drift
    Peripheral,
}

/// Window-widening and force state of the peripheral role
#[derive(Debug, Clone, Copy)]
pub struct PeriphTiming {
    /// Central's sleep clock accuracy category
    pub sca: u8,
    /// Widening accumulated per connection interval, microseconds
    pub ww_periodic_us: u32,
    /// Upper bound of the accumulated widening
    pub ww_max_us: u32,
    /// Widening accumulated since the last anchor, applied at prepare
    pub ww_prepare_us: u32,
    /// Widening in effect for the running event
    pub ww_event_us: u32,
    /// Transmit window size for the running event, microseconds
    pub win_size_event_us: u32,
    /// Pseudo-random bit sequence driving probabilistic forced wakes
    pub force_seq: u32,
}

impl PeriphTiming {
    pub(crate) const fn new() -> Self {
        Self {
            sca: 0,
            ww_periodic_us: 0,
            ww_max_us: 0,
            ww_prepare_us: 0,
            ww_event_us: 0,
            win_size_event_us: 0,
            force_seq: 0,
        }
    }
}

/// Per-event scratch state, valid between prepare and done
#[derive(Debug, Clone, Copy)]
pub struct EventScratch {
    /// Anchor reception was captured this event (peripheral)
    pub anchor_captured: bool,
    /// Observed start-to-address time of the anchor, microseconds
    pub start_to_address_actual_us: u32,
    /// Packet timer microsecond the radio was started at
    pub start_us: u32,
    /// Connection events elapsed into this occurrence (lazy + 1)
    pub elapsed: u16,
}

impl EventScratch {
    const fn new() -> Self {
        Self {
            anchor_captured: false,
            start_to_address_actual_us: 0,
            start_us: 0,
            elapsed: 0,
        }
    }
}

/// Interrupt-fast half of a connection context
///
/// Exclusively mutated from radio-interrupt context while a connection
/// event runs; the ULL half of the connection is in
/// [`ull::conn::Conn`](crate::ull::conn::Conn).
#[derive(Debug, Clone, Copy)]
pub struct LllConn {
    /// Connection handle (the pool slot index)
    pub handle: u16,
    /// Role of the local device on this link
    pub role: Role,
    /// Access address
    pub access_addr: [u8; 4],
    /// CRC initialization value
    pub crc_init: [u8; 3],
    /// Data channel map
    pub chan_map: [u8; 5],
    /// Number of used channels in the map
    pub chan_count: u8,
    /// Hop increment of channel selection algorithm #1
    pub chan_hop: u8,
    /// Last unmapped channel index
    pub chan_use: u8,
    /// Connection interval, 1.25 ms units
    pub interval: u16,
    /// Peripheral latency, connection events
    pub latency: u16,
    /// Connection event counter
    pub event_counter: u16,
    /// Latency accumulated by skipped prepares
    pub latency_prepare: u16,
    /// Latency in effect for the running event
    pub latency_event: u16,
    /// ARQ sequence number
    pub sn: bool,
    /// ARQ next expected sequence number
    pub nesn: bool,
    /// Last transmission was the empty PDU
    pub empty: bool,
    /// RX decryption enabled
    pub enc_rx: bool,
    /// TX encryption enabled
    pub enc_tx: bool,
    /// RX paused for an encryption procedure
    pub pause_rx: bool,
    /// TX paused for an encryption procedure
    pub pause_tx: bool,
    /// Consecutive CRC failures tolerated before the event closes
    pub crc_expire: u8,
    /// A valid CRC reception happened this event
    pub crc_valid: bool,
    /// Sub-exchanges completed this event
    pub trx_cnt: u8,
    /// Local TERMINATE_IND was transmitted and acknowledged
    pub terminate_acked: bool,
    /// Peer sent TERMINATE_IND with this reason
    pub terminate_reason_peer: Option<u8>,
    /// Latest RSSI sample
    pub rssi_latest: u8,
    /// RSSI value last reported to the host
    pub rssi_reported: u8,
    /// Samples accumulated since the last report
    pub rssi_sample_count: u8,
    /// RX buffer armed for the next reception
    pub rx_node: Option<pool::Ref>,
    /// Backing storage of the empty PDU
    pub empty_pdu: [u8; DC_HEADER_SIZE],
    /// Peripheral timing state
    pub periph: PeriphTiming,
    /// Per-event scratch
    pub event: EventScratch,
}

impl LllConn {
    pub(crate) fn new(handle: u16, role: Role) -> Self {
        Self {
            handle,
            role,
            access_addr: [0; 4],
            crc_init: [0; 3],
            chan_map: [0; 5],
            chan_count: 0,
            chan_hop: 0,
            chan_use: 0,
            interval: 0,
            latency: 0,
            event_counter: 0,
            latency_prepare: 0,
            latency_event: 0,
            sn: false,
            nesn: false,
            empty: false,
            enc_rx: false,
            enc_tx: false,
            pause_rx: false,
            pause_tx: false,
            crc_expire: CRC_EXPIRE_RELOAD,
            crc_valid: false,
            trx_cnt: 0,
            terminate_acked: false,
            terminate_reason_peer: None,
            rssi_latest: 0,
            rssi_reported: 0,
            rssi_sample_count: 0,
            rx_node: None,
            empty_pdu: [0; DC_HEADER_SIZE],
            periph: PeriphTiming::new(),
            event: EventScratch::new(),
        }
    }
}

/// Outcome summary of one connection event, consumed by the ULL done engine
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnDoneExtra {
    /// The occurrence actually reached the radio
    pub ran: bool,
    /// At least one valid-CRC reception happened
    pub crc_valid: bool,
    /// Sub-exchanges completed
    pub trx_cnt: u8,
    /// Connection events elapsed into this occurrence
    pub elapsed: u16,
    /// Anchor timing was captured (peripheral drift feedback available)
    pub anchor_captured: bool,
    /// Observed start-to-address time of the anchor, microseconds
    pub start_to_address_actual_us: u32,
    /// Window widening that was in effect, microseconds
    pub window_widening_event_us: u32,
}

/// Outcome for an occurrence that never reached the radio
pub(crate) fn done_extra_unrun(lazy: u16) -> ConnDoneExtra {
    ConnDoneExtra {
        ran: false,
        crc_valid: false,
        trx_cnt: 0,
        elapsed: lazy + 1,
        anchor_captured: false,
        start_to_address_actual_us: 0,
        window_widening_event_us: 0,
    }
}

/// Acknowledged TX node travelling from the ISR to the ULL ack path
#[derive(Debug, Clone, Copy)]
pub struct TxAck {
    /// Connection the acknowledgement belongs to
    pub handle: u16,
    /// The acknowledged TX node
    pub node: pool::Ref,
}

static ACK_FIFO: Fifo<TxAck, { crate::config::TX_ACK_CNT }> = Fifo::new();

static TX_Q: [crate::mem::queue::Memq<pool::Ref, { crate::config::CONN_TX_QUEUE_CNT }>;
    crate::config::MAX_CONN] = arr_macro::arr![crate::mem::queue::Memq::new(); 2];

/// Hands a TX node to the LLL half of a connection
///
/// Called from the high priority deferred context only.
pub(crate) fn tx_enqueue(handle: u16, node: pool::Ref) -> Result<(), crate::error::Error> {
    TX_Q[handle as usize].enqueue(node)
}

/// Number of TX nodes currently handed to the LLL half of a connection
pub fn tx_queued_count(handle: u16) -> usize {
    TX_Q[handle as usize].count()
}

/// Takes one acknowledged TX node, consumed by the ULL demux
pub(crate) fn ack_dequeue() -> Option<TxAck> {
    ACK_FIFO.dequeue()
}

/// Flushes the LLL TX queue of a released connection back to the caller
///
/// The LLL side of the connection is already disabled when this runs; the
/// queue's consumer role moves to the draining context and the queue is
/// left reset for the handle's next occupant.
pub(crate) fn tx_flush(handle: u16, mut f: impl FnMut(pool::Ref)) {
    let q = &TX_Q[handle as usize];
    q.consumer_rebind(crate::context::current());
    while let Some(node) = q.dequeue() {
        f(node);
    }
    q.reset();
}

/// Drops all per-connection LLL queues and the ack FIFO
///
/// Used by `ll_reset` and between unit tests.
pub(crate) fn queues_reset() {
    ACK_FIFO.reset();
    for q in TX_Q.iter() {
        q.reset();
    }
}

/// Channel selection algorithm #1: hop once per elapsed connection event,
/// then remap unused channels
fn chan_sel_1(lll: &mut LllConn, elapsed: u16) -> u8 {
    let unmapped = ((lll.chan_use as u32 + lll.chan_hop as u32 * elapsed as u32)
        % DATA_CHAN_COUNT as u32) as u8;
    lll.chan_use = unmapped;

    let in_map = |chan: u8| lll.chan_map[(chan >> 3) as usize] & (1 << (chan & 0x07)) != 0;

    if in_map(unmapped) {
        return unmapped;
    }

    // Remap onto the used channels, counting set bits up to the index
    let remap_idx = unmapped % lll.chan_count;
    let mut seen = 0;
    for chan in 0..DATA_CHAN_COUNT {
        if in_map(chan) {
            if seen == remap_idx {
                return chan;
            }
            seen += 1;
        }
    }

    // An empty channel map cannot reach an active connection
    unreachable!()
}

/// Event kickoff: the prepare callback of a connection event
pub(crate) fn event_start(param: &PrepareParam) {
    let EventKind::Conn { handle } = param.kind;
    let radio = super::radio();

    struct Setup {
        role: Role,
        aa: [u8; 4],
        crc_init: [u8; 3],
        chan: u8,
        ww_event_us: u32,
        win_size_us: u32,
    }

    let anchor_us = ticks_to_us(param.ticks_at_expire).wrapping_add(param.remainder_us);

    let setup = ull::conn::with_conn(handle, |conn| {
        let lll = &mut conn.lll;

        lll.latency_event = lll.latency_prepare + param.lazy;
        lll.latency_prepare = 0;
        let elapsed = lll.latency_event + 1;
        lll.event_counter = lll.event_counter.wrapping_add(elapsed);

        lll.crc_valid = false;
        lll.trx_cnt = 0;

        if lll.role == Role::Peripheral {
            // Widen the receive window for the drift accumulated since the
            // last anchor, bounded by half the interval
            let ww = lll
                .periph
                .ww_prepare_us
                .saturating_add(lll.periph.ww_periodic_us * elapsed as u32)
                .min(lll.periph.ww_max_us);
            lll.periph.ww_prepare_us = ww;
            lll.periph.ww_event_us = ww;
        }

        lll.event = EventScratch {
            anchor_captured: false,
            start_to_address_actual_us: 0,
            start_us: anchor_us.wrapping_sub(match lll.role {
                Role::Central => 0,
                Role::Peripheral => lll.periph.ww_event_us,
            }),
            elapsed,
        };

        Setup {
            role: lll.role,
            aa: lll.access_addr,
            crc_init: lll.crc_init,
            chan: chan_sel_1(lll, elapsed),
            ww_event_us: lll.periph.ww_event_us,
            win_size_us: lll.periph.win_size_event_us,
        }
    });

    let Ok(setup) = setup else {
        // The connection vanished between ticker expiry and dispatch
        super::curr_clear();
        ull::event_done(handle, done_extra_unrun(param.lazy));
        let ret = mayfly::enqueue(ContextId::Lll, ContextId::Lll, Call::LllResume);
        assert!(ret.is_ok());
        return;
    };

    defmt::trace!("conn {} event start, chan {}", handle, setup.chan);

    radio.phy_set(Phy::One);
    radio.pkt_configure((DC_HEADER_SIZE + PDU_DC_PAYLOAD_MAX) as u8);
    radio.aa_set(&setup.aa);
    radio.crc_configure(&setup.crc_init);
    radio.chan_set(setup.chan);
    radio.tmr_tifs_set(TIFS_US);

    match setup.role {
        Role::Central => {
            if !tx_setup(handle, radio) {
                event_close(handle);
                return;
            }
            radio.switch_complete_and_rx();
            radio.tmr_start(anchor_us);
        }
        Role::Peripheral => {
            if !rx_setup(handle, radio) {
                event_close(handle);
                return;
            }
            let hcto = setup
                .win_size_us
                .saturating_add(2 * setup.ww_event_us)
                .saturating_add(2 * EVENT_JITTER_US)
                .saturating_add(PREAMBLE_TO_ADDR_US);
            radio.tmr_hcto_set(hcto);
            radio.switch_complete_and_tx();
            radio.tmr_start(anchor_us.wrapping_sub(setup.ww_event_us));
        }
    }
}

/// Arms the transmitter with the head TX node or the empty PDU
///
/// Returns `false` when the connection context is gone.
fn tx_setup(handle: u16, radio: &dyn crate::hw::radio::traits::RadioOps) -> bool {
    let prepared = ull::conn::with_conn(handle, |conn| {
        let lll = &mut conn.lll;

        let head = if lll.pause_tx { None } else { TX_Q[handle as usize].peek() };

        let ptr = match head {
            Some(node) => {
                let md = TX_Q[handle as usize].count() > 1;
                let sn = lll.sn;
                let nesn = lll.nesn;

                let ptr = ull::TX_POOL
                    .with(node, |buf| {
                        let mut hdr = DataHeader::parse(&buf.pdu).unwrap();
                        hdr.sn = sn;
                        hdr.nesn = nesn;
                        hdr.md = md;
                        hdr.write(&mut buf.pdu);
                        buf.pdu.as_ptr()
                    })
                    .unwrap();

                lll.empty = false;
                ptr
            }
            None => {
                DataHeader::empty(lll.sn, lll.nesn).write(&mut lll.empty_pdu);
                lll.empty = true;
                lll.empty_pdu.as_ptr()
            }
        };

        radio.pkt_tx_set(ptr);
    });

    if prepared.is_err() {
        return false;
    }

    super::isr_target_set(IsrTarget::ConnTx { handle });
    true
}

/// Arms the receiver with the pending RX buffer, acquiring one if needed
///
/// Returns `false` when no buffer could be obtained; the caller closes the
/// event early and the next occurrence retries.
fn rx_setup(handle: u16, radio: &dyn crate::hw::radio::traits::RadioOps) -> bool {
    let armed = ull::conn::with_conn(handle, |conn| {
        let lll = &mut conn.lll;

        if lll.rx_node.is_none() {
            lll.rx_node = ull::RX_POOL.acquire(ull::NodeRxBuf::new()).ok();
        }

        match lll.rx_node {
            Some(node) => {
                let ptr = ull::RX_POOL.with(node, |buf| buf.pdu.as_mut_ptr()).unwrap();
                radio.pkt_rx_set(ptr);
                true
            }
            None => false,
        }
    });

    if armed != Ok(true) {
        return false;
    }

    super::isr_target_set(IsrTarget::ConnRx { handle });
    true
}

/// TX-complete ISR: turn the link around into reception
pub(crate) fn isr_tx(handle: u16) {
    let radio = super::radio();
    radio.status_reset();

    if !rx_setup(handle, radio) {
        event_close(handle);
        return;
    }

    let hcto = TIFS_US as u32 + 2 * EVENT_JITTER_US + PREAMBLE_TO_ADDR_US;
    radio.tmr_hcto_set(hcto);
    radio.switch_complete_and_tx();
    radio.rssi_measure();
}

/// RX-complete ISR: ARQ processing and the continue/close decision
pub(crate) fn isr_rx(handle: u16) {
    let radio = super::radio();

    let trx_done = radio.is_done();
    let crc_ok = trx_done && radio.crc_is_valid();
    let rssi_ready = trx_done && radio.rssi_is_ready();
    let rssi = if rssi_ready { radio.rssi_get() } else { 0 };
    let end_us = radio.tmr_end_get();
    radio.status_reset();

    if !trx_done {
        // Nothing received before the window closed
        event_close(handle);
        return;
    }

    enum Next {
        Reply,
        Close,
    }

    let next = ull::conn::with_conn(handle, |conn| {
        let lll = &mut conn.lll;

        if !crc_ok {
            // The tolerance spans events; only a valid reception reloads it
            lll.crc_expire = lll.crc_expire.saturating_sub(1);
            if lll.crc_expire == 0 {
                return Next::Close;
            }
            // Keep the event alive; the unchanged ARQ bits of the reply
            // request a retransmission
            return Next::Reply;
        }

        lll.crc_expire = CRC_EXPIRE_RELOAD;
        lll.crc_valid = true;
        lll.trx_cnt = lll.trx_cnt.saturating_add(1);

        if rssi_ready {
            lll.rssi_latest = rssi;
            lll.rssi_sample_count = lll.rssi_sample_count.saturating_add(1);
        }

        if lll.role == Role::Peripheral && !lll.event.anchor_captured {
            lll.event.anchor_captured = true;
            lll.event.start_to_address_actual_us = end_us.wrapping_sub(lll.event.start_us);
        }

        let rx_node = lll.rx_node.expect("rx completed without an armed buffer");
        let hdr = ull::RX_POOL
            .with(rx_node, |buf| DataHeader::parse(&buf.pdu))
            .unwrap();

        let hdr = match hdr {
            Ok(hdr) if (hdr.len as usize) <= PDU_DC_PAYLOAD_MAX => hdr,
            _ => {
                // Undecodable header or impossible length: treat like a
                // CRC hit
                lll.crc_expire = lll.crc_expire.saturating_sub(1);
                return if lll.crc_expire == 0 {
                    Next::Close
                } else {
                    Next::Reply
                };
            }
        };

        // Peer acknowledged our last transmission
        if hdr.nesn != lll.sn {
            lll.sn = !lll.sn;

            if !lll.empty {
                if let Some(node) = TX_Q[handle as usize].peek() {
                    let is_terminate = ull::TX_POOL
                        .with(node, |buf| {
                            buf.is_ctrl && CtrlPdu::is_terminate_ind(&buf.pdu[DC_HEADER_SIZE..])
                        })
                        .unwrap_or(false);

                    TX_Q[handle as usize].dequeue();
                    let ret = ACK_FIFO.enqueue(TxAck { handle, node });
                    assert!(ret.is_ok());

                    if is_terminate {
                        lll.terminate_acked = true;
                    }
                }
            }
        }

        // New data from the peer
        if hdr.sn == lll.nesn {
            if hdr.len == 0 {
                // Empty PDU: acknowledge, nothing to deliver
                lll.nesn = !lll.nesn;
            } else {
                let forwarded = ull::rx_put(ull::NodeRx::DcPdu {
                    handle,
                    node: rx_node,
                    len: hdr.len,
                    is_ctrl: hdr.llid == Llid::Control,
                });

                match forwarded {
                    Ok(()) => {
                        lll.nesn = !lll.nesn;
                        lll.rx_node = None;

                        if hdr.llid == Llid::Control {
                            let reason = ull::RX_POOL
                                .with(rx_node, |buf| {
                                    match CtrlPdu::parse(&buf.pdu[DC_HEADER_SIZE..]) {
                                        Ok(CtrlPdu::TerminateInd { error_code }) => {
                                            Some(error_code)
                                        }
                                        _ => None,
                                    }
                                })
                                .unwrap_or(None);

                            if let Some(reason) = reason {
                                lll.terminate_reason_peer = Some(reason);
                                return Next::Close;
                            }
                        }
                    }
                    Err(_) => {
                        // RX queue full: leave nesn alone so the peer
                        // retransmits into the next event
                    }
                }
            }
        }

        if lll.terminate_acked {
            return Next::Close;
        }

        let more_tx = !lll.pause_tx && TX_Q[handle as usize].peek().is_some();
        if hdr.md || more_tx {
            Next::Reply
        } else if lll.role == Role::Peripheral {
            // The peripheral always answers the sub-exchange it received
            Next::Reply
        } else {
            Next::Close
        }
    });

    match next {
        Ok(Next::Reply) => {
            if !tx_setup(handle, radio) {
                event_close(handle);
                return;
            }
            radio.switch_complete_and_rx();
        }
        Ok(Next::Close) | Err(_) => event_close(handle),
    }
}

/// Abort entry: tears the radio down mid-event
pub(crate) fn abort_current(handle: u16) {
    let radio = super::radio();
    super::isr_target_set(IsrTarget::ConnAbort { handle });
    radio.disable();
}

/// Radio-disabled ISR of an aborted event
pub(crate) fn isr_abort(handle: u16) {
    let radio = super::radio();
    radio.status_reset();
    event_close(handle);
}

/// Common event teardown: stop timers, post the done event, flush the next
/// prepare
fn event_close(handle: u16) {
    let radio = super::radio();
    radio.tmr_stop();
    radio.disable();
    radio.status_reset();

    let extra = ull::conn::with_conn(handle, |conn| {
        let lll = &mut conn.lll;

        if lll.event.anchor_captured {
            // Fresh anchor: the accumulated widening is consumed
            lll.periph.ww_prepare_us = 0;
        }

        ConnDoneExtra {
            ran: true,
            crc_valid: lll.crc_valid,
            trx_cnt: lll.trx_cnt,
            elapsed: lll.event.elapsed,
            anchor_captured: lll.event.anchor_captured,
            start_to_address_actual_us: lll.event.start_to_address_actual_us,
            window_widening_event_us: lll.periph.ww_event_us,
        }
    })
    .unwrap_or_else(|_| done_extra_unrun(0));

    super::curr_clear();
    ull::event_done(handle, extra);

    // Arm whatever the pipeline holds next
    let ret = mayfly::enqueue(ContextId::Lll, ContextId::Lll, Call::LllResume);
    assert!(ret.is_ok());
}
