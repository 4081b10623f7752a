//! Connection manager and the per-event done engine
//!
//! The manager owns the fixed slot table of connection contexts; the
//! connection handle is the slot index, which is the contract the HCI
//! layer above relies on. Every deferred-context touch of a connection
//! goes through this module: the done engine consuming event outcomes,
//! the TX composition splicing control PDUs ahead of queued data, the
//! acknowledgement path and the teardown sequence.
//!
//! The done engine runs the timeout countdowns in units of elapsed
//! connection events, in strict priority order: terminate handling,
//! connection establishment, supervision, procedure response. Reaching
//! any of them is a normal terminal transition of the connection, never
//! an error path: the host learns through a `Terminate` node and the
//! resources funnel through the deferred release.

use super::{NodeRx, NodeTxBuf, RX_POOL, TX_POOL};
use crate::config::{
    CONNECT_EXPIRE_EVENTS, CONN_SLOT_US, LOCAL_SCA_PPM, MAX_CONN, PDU_TX_CNT,
    PROCEDURE_TIMEOUT_US, SUPERVISION_FORCE_THRESHOLD,
};
use crate::context::{self, ContextId};
use crate::crit_sect;
use crate::error::Error;
use crate::hw::cntr::{us_to_ticks, Ticks};
use crate::lll;
use crate::lll::conn::{
    ConnDoneExtra, LllConn, Role, EVENT_JITTER_US, PREAMBLE_TO_ADDR_US, RSSI_SAMPLE_COUNT,
    RSSI_THRESHOLD, TIFS_US,
};
use crate::mayfly::{self, Call};
use crate::mem::fifo::Fifo;
use crate::mem::pool;
use crate::mutex::Mutex;
use crate::pdu::{reason, ConnectInd, CtrlPdu, DC_HEADER_SIZE};
use crate::ticker::{self, ExpireInfo, ExpiryAction, OpDone};

/// Sleep clock accuracy categories in ppm, indexed by the SCA field
const SCA_PPM: [u32; 8] = [500, 250, 150, 100, 75, 50, 30, 20];

/// Transmit window delay of a new connection, microseconds
const WIN_DELAY_US: u32 = 1250;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    /// CONNECT_IND exchanged, no valid packet received yet
    Connecting,
    /// At least one valid exchange happened
    Connected,
    /// Teardown started, waiting for outstanding prepares to retire
    Releasing,
}

/// Connection parameter set taking effect at an instant
#[derive(Debug, Clone, Copy)]
struct PendingUpdate {
    win_offset: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
    instant: u16,
}

/// ULL half of a connection context
///
/// The interrupt-fast half lives in the embedded
/// [`LllConn`](crate::lll::conn::LllConn); everything else is only touched
/// from the deferred contexts and from thread-context commands.
pub struct Conn {
    pub(crate) lll: LllConn,
    state: State,
    interval_us: u32,
    connect_expire: u16,
    supervision_reload: u16,
    supervision_expire: u16,
    procedure_reload: u16,
    procedure_expire: u16,
    terminate_reason: u8,
    pending_update: Option<PendingUpdate>,
    tx_head: Option<pool::Ref>,
    tx_ctrl_last: Option<pool::Ref>,
    tx_tail: Option<pool::Ref>,
    prepares_outstanding: u8,
    lazy_pushed: u16,
    slot_ticks: Ticks,
}

impl Conn {
    fn new(handle: u16, role: Role) -> Self {
        Self {
            lll: LllConn::new(handle, role),
            state: State::Connecting,
            interval_us: 0,
            connect_expire: CONNECT_EXPIRE_EVENTS,
            supervision_reload: 0,
            supervision_expire: 0,
            procedure_reload: 0,
            procedure_expire: 0,
            terminate_reason: reason::LOCAL_HOST_TERM,
            pending_update: None,
            tx_head: None,
            tx_ctrl_last: None,
            tx_tail: None,
            prepares_outstanding: 0,
            lazy_pushed: 0,
            slot_ticks: 0,
        }
    }
}

const CONN_NONE: Option<Conn> = None;

static CONNS: Mutex<[Option<Conn>; MAX_CONN]> = Mutex::new([CONN_NONE; MAX_CONN]);

/// Host-submitted TX nodes awaiting distribution onto their connections
static TX_PENDING: Fifo<(u16, pool::Ref), { PDU_TX_CNT + 1 }> = Fifo::new();

fn conn_ticker_id(handle: u16) -> u8 {
    ticker::TICKER_ID_CONN_BASE + handle as u8
}

fn events_for(duration_us: u64, interval_us: u32) -> u16 {
    ((duration_us + interval_us as u64 - 1) / interval_us as u64) as u16
}

/// Runs `f` with exclusive access to the connection context of `handle`
pub(crate) fn with_conn<R>(handle: u16, f: impl FnOnce(&mut Conn) -> R) -> Result<R, Error> {
    crit_sect::locked(|cs| {
        let mut slots = CONNS.borrow_mut(cs);
        let conn = slots
            .get_mut(handle as usize)
            .ok_or(Error::UnknownHandle)?
            .as_mut()
            .ok_or(Error::UnknownHandle)?;
        Ok(f(conn))
    })
}

/// Allocates a connection slot, returning the handle (the slot index)
pub fn acquire(role: Role) -> Result<u16, Error> {
    crit_sect::locked(|cs| {
        let mut slots = CONNS.borrow_mut(cs);
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Conn::new(idx as u16, role));
                return Ok(idx as u16);
            }
        }
        Err(Error::NoMemory)
    })
}

/// Frees a connection slot that never went on air
///
/// A live connection tears down through the terminate path instead;
/// releasing one reports [`Error::InvalidState`].
pub fn release(handle: u16) -> Result<(), Error> {
    crit_sect::locked(|cs| {
        let mut slots = CONNS.borrow_mut(cs);
        let slot = slots
            .get_mut(handle as usize)
            .ok_or(Error::UnknownHandle)?;
        match slot {
            Some(conn) if conn.prepares_outstanding == 0 => {
                *slot = None;
                Ok(())
            }
            Some(_) => Err(Error::InvalidState),
            None => Err(Error::UnknownHandle),
        }
    })
}

/// Checks whether a handle currently owns a connection slot
pub fn handle_active(handle: u16) -> bool {
    crit_sect::locked(|cs| {
        CONNS
            .borrow(cs)
            .get(handle as usize)
            .map_or(false, |slot| slot.is_some())
    })
}

/// Drops every connection slot and the pending TX FIFO
///
/// Used by `ll_reset`; tickers and LLL state are reset by the caller.
pub(crate) fn reset_all() {
    TX_PENDING.reset();
    crit_sect::locked(|cs| *CONNS.borrow_mut(cs) = [CONN_NONE; MAX_CONN]);
}

/// Creates a peripheral connection from an accepted CONNECT_IND
///
/// Called from the high priority deferred context by the advertising role
/// once the CONNECT_IND exchange completed; `ticks_at_anchor` is the tick
/// the exchange ended at. Emits the `Connection` node towards the host and
/// starts the connection ticker at the transmit window.
pub fn setup_peripheral(ci: &ConnectInd, ticks_at_anchor: Ticks) -> Result<u16, Error> {
    setup(ci, ticks_at_anchor, Role::Peripheral)
}

/// Creates a central connection from a transmitted CONNECT_IND
///
/// The initiating role picked the anchor; the central transmits first in
/// every event and needs no window widening.
pub fn setup_central(ci: &ConnectInd, ticks_at_anchor: Ticks) -> Result<u16, Error> {
    setup(ci, ticks_at_anchor, Role::Central)
}

fn setup(ci: &ConnectInd, ticks_at_anchor: Ticks, role: Role) -> Result<u16, Error> {
    if ci.interval == 0 || !(5..=16).contains(&ci.hop) {
        return Err(Error::InvalidParam);
    }
    let chan_count = ci.chan_count();
    if chan_count < 2 {
        return Err(Error::InvalidParam);
    }

    let handle = acquire(role)?;
    let interval_us = ci.interval as u32 * 1250;

    let setup_done = with_conn(handle, |conn| {
        let lll = &mut conn.lll;
        lll.access_addr = ci.access_addr;
        lll.crc_init = ci.crc_init;
        lll.chan_map = ci.chan_map;
        lll.chan_count = chan_count;
        lll.chan_hop = ci.hop;
        lll.interval = ci.interval;
        lll.latency = ci.latency;

        if role == Role::Peripheral {
            let ppm = SCA_PPM[(ci.sca & 0x07) as usize] + LOCAL_SCA_PPM;
            lll.periph.sca = ci.sca;
            lll.periph.ww_periodic_us = ((ppm as u64 * interval_us as u64) / 1_000_000) as u32;
            lll.periph.ww_max_us = (interval_us >> 1).saturating_sub(TIFS_US as u32);
            lll.periph.win_size_event_us = ci.win_size as u32 * 1250;

            let seed = u32::from_le_bytes(ci.access_addr);
            lll.periph.force_seq = if seed == 0 { 1 } else { seed };
        }

        conn.interval_us = interval_us;
        conn.supervision_reload = events_for(ci.timeout as u64 * 10_000, interval_us);
        conn.procedure_reload = events_for(PROCEDURE_TIMEOUT_US as u64, interval_us);
        conn.connect_expire = CONNECT_EXPIRE_EVENTS;
        conn.slot_ticks = us_to_ticks(CONN_SLOT_US);
        conn.slot_ticks
    });
    let slot_ticks = match setup_done {
        Ok(t) => t,
        Err(e) => return Err(e),
    };

    defmt::info!("conn {} setup, interval {} us", handle, interval_us);
    super::ll_rx_put(NodeRx::Connection { handle });

    let status = ticker::start(
        context::current(),
        conn_ticker_id(handle),
        ticks_at_anchor,
        WIN_DELAY_US + ci.win_offset as u32 * 1250,
        interval_us,
        0,
        slot_ticks,
        ExpiryAction::ConnPrepare { handle },
        OpDone::AssertSuccess,
    );
    assert_eq!(status, ticker::Status::Busy);

    Ok(handle)
}

/// Ticker expiry of a connection node: posts the prepare into LLL context
pub(crate) fn ticker_expired(handle: u16, info: ExpireInfo) {
    let post = with_conn(handle, |conn| {
        if conn.state == State::Releasing {
            return false;
        }
        conn.prepares_outstanding += 1;
        true
    })
    .unwrap_or(false);

    if !post {
        return;
    }

    let param = lll::PrepareParam {
        ticks_at_expire: info.ticks_at_expire,
        remainder_us: info.remainder_us,
        lazy: info.lazy,
        kind: lll::EventKind::Conn { handle },
    };
    let ret = mayfly::enqueue(ContextId::UllHigh, ContextId::Lll, Call::LllPrepare(param));
    assert!(ret.is_ok());
}

struct DoneActions {
    cleanup: Option<u8>,
    free: bool,
    push: Option<(Ticks, Ticks, Option<u16>, bool)>,
    update: Option<PendingUpdate>,
    rssi: Option<u8>,
}

/// Accounts one completed connection event, run in the high priority
/// context by the RX demux
pub(crate) fn done(handle: u16, extra: &ConnDoneExtra) {
    let actions = with_conn(handle, |conn| {
        let mut act = DoneActions {
            cleanup: None,
            free: false,
            push: None,
            update: None,
            rssi: None,
        };

        conn.prepares_outstanding = conn.prepares_outstanding.saturating_sub(1);

        if conn.state == State::Releasing {
            act.free = conn.prepares_outstanding == 0;
            return act;
        }

        if !extra.ran {
            // The occurrence never reached the radio; the next prepare
            // catches the event counter and the channel hop up
            conn.lll.latency_prepare += extra.elapsed;
            return act;
        }

        // Terminate outranks every countdown
        if conn.lll.terminate_acked {
            act.cleanup = Some(conn.terminate_reason);
            return act;
        }
        if let Some(peer_reason) = conn.lll.terminate_reason_peer {
            act.cleanup = Some(peer_reason);
            return act;
        }

        // Establishment and supervision countdowns, in elapsed events
        if extra.crc_valid {
            if conn.state == State::Connecting {
                conn.state = State::Connected;
                conn.connect_expire = 0;
                // The transmit window only applies until the first anchor
                conn.lll.periph.win_size_event_us = 0;
            }
            conn.supervision_expire = conn.supervision_reload;
        } else if conn.state == State::Connecting {
            if conn.connect_expire > extra.elapsed {
                conn.connect_expire -= extra.elapsed;
            } else {
                act.cleanup = Some(reason::CONN_FAILED_TO_ESTABLISH);
                return act;
            }
        } else if conn.supervision_expire > extra.elapsed {
            conn.supervision_expire -= extra.elapsed;
        } else {
            act.cleanup = Some(reason::CONN_TIMEOUT);
            return act;
        }

        // Procedure response timeout
        if conn.procedure_expire != 0 {
            if conn.procedure_expire > extra.elapsed {
                conn.procedure_expire -= extra.elapsed;
            } else {
                act.cleanup = Some(reason::LL_RESP_TIMEOUT);
                return act;
            }
        }

        // Parameter update at its instant
        if let Some(upd) = conn.pending_update {
            let to_instant = upd.instant.wrapping_sub(conn.lll.event_counter);
            if to_instant == 0 || to_instant > 0x7FFF {
                conn.pending_update = None;
                apply_update(conn, &upd);
                act.update = Some(upd);
            }
        }

        if act.update.is_none() {
            // Force and lazy recomputation
            let mut force = false;
            let mut lazy = None;

            if conn.state == State::Connected
                && conn.supervision_expire <= SUPERVISION_FORCE_THRESHOLD
            {
                // Near the deadline every event counts; break the latency
                force = true;
                if conn.lazy_pushed != 0 {
                    conn.lazy_pushed = 0;
                    lazy = Some(0);
                }
            } else if conn.state == State::Connected && conn.lll.role == Role::Peripheral {
                if conn.lazy_pushed != conn.lll.latency {
                    conn.lazy_pushed = conn.lll.latency;
                    lazy = Some(conn.lll.latency);
                }

                // Rotate the access-address-seeded bit sequence; a set bit
                // forces a wake, bounding drift accumulation across long
                // latency runs
                conn.lll.periph.force_seq = conn.lll.periph.force_seq.rotate_right(1);
                force = conn.lll.latency != 0 && (conn.lll.periph.force_seq & 1) != 0;
            }

            // Window widening drift feedback from the anchor observation
            let mut drift_plus = 0;
            let mut drift_minus = 0;
            if conn.lll.role == Role::Peripheral && extra.anchor_captured {
                let expected =
                    extra.window_widening_event_us + EVENT_JITTER_US + PREAMBLE_TO_ADDR_US;
                let actual = extra.start_to_address_actual_us;
                if actual >= expected {
                    drift_plus = us_to_ticks(actual - expected);
                } else {
                    drift_minus = us_to_ticks(expected - actual);
                }
            }

            if drift_plus != 0 || drift_minus != 0 || lazy.is_some() || force {
                act.push = Some((drift_plus, drift_minus, lazy, force));
            }
        }

        // RSSI reporting once enough samples accumulated
        if conn.lll.rssi_sample_count >= RSSI_SAMPLE_COUNT {
            conn.lll.rssi_sample_count = 0;
            if conn.lll.rssi_latest.abs_diff(conn.lll.rssi_reported) >= RSSI_THRESHOLD {
                conn.lll.rssi_reported = conn.lll.rssi_latest;
                act.rssi = Some(conn.lll.rssi_latest);
            }
        }

        act
    });

    let Ok(act) = actions else { return };

    if act.free {
        free_resources(handle);
        return;
    }
    if let Some(reason_code) = act.cleanup {
        cleanup_start(handle, reason_code);
        return;
    }

    if let Some(upd) = act.update {
        restart_ticker(handle, &upd);
        super::ll_rx_put(NodeRx::ConnUpdate {
            handle,
            interval: upd.interval,
            latency: upd.latency,
            timeout: upd.timeout,
        });
    } else if let Some((drift_plus, drift_minus, lazy, force)) = act.push {
        ticker::update(
            ContextId::UllHigh,
            conn_ticker_id(handle),
            drift_plus,
            drift_minus,
            lazy,
            force,
            OpDone::None,
        );
    }

    if let Some(rssi) = act.rssi {
        super::ll_rx_put(NodeRx::Rssi { handle, rssi });
    }

    tx_lll_flush(handle);
}

fn apply_update(conn: &mut Conn, upd: &PendingUpdate) {
    let interval_us = upd.interval as u32 * 1250;

    conn.interval_us = interval_us;
    conn.supervision_reload = events_for(upd.timeout as u64 * 10_000, interval_us);
    conn.supervision_expire = conn.supervision_reload;
    conn.procedure_reload = events_for(PROCEDURE_TIMEOUT_US as u64, interval_us);
    conn.procedure_expire = 0;
    conn.lazy_pushed = upd.latency;

    conn.lll.interval = upd.interval;
    conn.lll.latency = upd.latency;

    if conn.lll.role == Role::Peripheral {
        let ppm = SCA_PPM[(conn.lll.periph.sca & 0x07) as usize] + LOCAL_SCA_PPM;
        conn.lll.periph.ww_periodic_us = ((ppm as u64 * interval_us as u64) / 1_000_000) as u32;
        conn.lll.periph.ww_max_us = (interval_us >> 1).saturating_sub(TIFS_US as u32);
    }
}

/// Re-times the connection ticker for an applied parameter update
///
/// The new timing anchors at the already-scheduled next occurrence plus
/// the update's transmit window offset.
fn restart_ticker(handle: u16, upd: &PendingUpdate) {
    let id = conn_ticker_id(handle);
    let anchor = ticker::next_expiry(id).unwrap_or_else(ticker::ticks_now);

    let params = with_conn(handle, |conn| {
        (conn.interval_us, conn.lll.latency, conn.slot_ticks)
    });
    let Ok((interval_us, latency, slot_ticks)) = params else {
        return;
    };

    ticker::stop(ContextId::UllHigh, id, OpDone::None);
    let status = ticker::start(
        ContextId::UllHigh,
        id,
        anchor,
        WIN_DELAY_US + upd.win_offset as u32 * 1250,
        interval_us,
        latency,
        slot_ticks,
        ExpiryAction::ConnPrepare { handle },
        OpDone::AssertSuccess,
    );
    assert_eq!(status, ticker::Status::Busy);
}

/// Starts the terminal teardown: the host learns first, then the ticker
/// stop completion funnels the resource release into the deferred flush
fn cleanup_start(handle: u16, reason_code: u8) {
    let started = with_conn(handle, |conn| {
        if conn.state == State::Releasing {
            return false;
        }
        conn.state = State::Releasing;
        true
    })
    .unwrap_or(false);
    if !started {
        return;
    }

    defmt::info!("conn {} terminated, reason {=u8:x}", handle, reason_code);
    super::ll_rx_put(NodeRx::Terminate {
        handle,
        reason: reason_code,
    });

    let status = ticker::stop(
        ContextId::UllHigh,
        conn_ticker_id(handle),
        OpDone::ConnStopped { handle },
    );
    assert_eq!(status, ticker::Status::Busy);
}

/// Deferred tail of the teardown, run after the connection ticker stopped
///
/// The LLL side is aborted; every retired prepare reports back through the
/// done path and the last one frees the slot. With nothing outstanding the
/// slot is freed immediately.
pub(crate) fn release_deferred(handle: u16) {
    let ret = mayfly::enqueue(ContextId::UllHigh, ContextId::Lll, Call::LllDisable { handle });
    assert!(ret.is_ok());

    let free = with_conn(handle, |conn| conn.prepares_outstanding == 0).unwrap_or(false);
    if free {
        free_resources(handle);
    }
}

fn free_resources(handle: u16) {
    let conn = crit_sect::locked(|cs| {
        CONNS
            .borrow_mut(cs)
            .get_mut(handle as usize)
            .and_then(|slot| slot.take())
    });
    let Some(conn) = conn else { return };

    // TX nodes already handed to the LLL half
    lll::conn::tx_flush(handle, |node| {
        let ret = TX_POOL.release(node);
        assert!(ret.is_ok());
    });

    // TX nodes still in the composition list
    let mut cursor = conn.tx_head;
    while let Some(node) = cursor {
        cursor = TX_POOL.with(node, |buf| buf.next).unwrap_or(None);
        let ret = TX_POOL.release(node);
        assert!(ret.is_ok());
    }

    // The armed RX buffer
    if let Some(node) = conn.lll.rx_node {
        let ret = RX_POOL.release(node);
        assert!(ret.is_ok());
    }
}

/// Submits a filled TX node for distribution onto its connection
///
/// Callable from thread context; the node reaches the connection's
/// composition list in the next high priority demux run.
pub(crate) fn tx_submit(handle: u16, node: pool::Ref) -> Result<(), Error> {
    TX_PENDING.enqueue((handle, node))?;

    let ret = mayfly::enqueue(context::current(), ContextId::UllHigh, Call::TxDemux);
    assert!(ret.is_ok());
    Ok(())
}

/// Distributes host-submitted TX nodes, run in the high priority context
pub(crate) fn tx_demux() {
    while let Some((handle, node)) = TX_PENDING.dequeue() {
        let queued = with_conn(handle, |conn| {
            let is_ctrl = TX_POOL.with(node, |buf| buf.is_ctrl).unwrap_or(false);
            if is_ctrl {
                tx_list_push_ctrl(conn, node);
            } else {
                tx_list_push_data(conn, node);
            }
        });

        match queued {
            Ok(()) => tx_lll_flush(handle),
            Err(_) => {
                // The connection went away; hand the buffer back
                let _ = TX_POOL.release(node);
            }
        }
    }
}

/// Appends a data PDU at the composition list tail
fn tx_list_push_data(conn: &mut Conn, node: pool::Ref) {
    let ret = TX_POOL.with(node, |buf| buf.next = None);
    assert!(ret.is_ok());

    match conn.tx_tail {
        Some(tail) => {
            let ret = TX_POOL.with(tail, |buf| buf.next = Some(node));
            assert!(ret.is_ok());
        }
        None => conn.tx_head = Some(node),
    }
    conn.tx_tail = Some(node);
}

/// Splices a control PDU behind the pending control run, ahead of queued
/// data
///
/// Nodes already handed to the LLL half are in flight and keep their
/// position; only data still waiting in the composition list is overtaken,
/// so procedures are never starved behind a data backlog while in-order
/// delivery within each class holds.
fn tx_list_push_ctrl(conn: &mut Conn, node: pool::Ref) {
    match conn.tx_ctrl_last {
        Some(last) => {
            let following = TX_POOL.with(last, |buf| buf.next).unwrap_or(None);
            let ret = TX_POOL.with(node, |buf| buf.next = following);
            assert!(ret.is_ok());
            let ret = TX_POOL.with(last, |buf| buf.next = Some(node));
            assert!(ret.is_ok());
            if conn.tx_tail == Some(last) {
                conn.tx_tail = Some(node);
            }
        }
        None => {
            let ret = TX_POOL.with(node, |buf| buf.next = conn.tx_head);
            assert!(ret.is_ok());
            if conn.tx_head.is_none() {
                conn.tx_tail = Some(node);
            }
            conn.tx_head = Some(node);
        }
    }
    conn.tx_ctrl_last = Some(node);
}

/// Moves composition list heads into the connection's LLL queue while it
/// has room
pub(crate) fn tx_lll_flush(handle: u16) {
    loop {
        let moved = with_conn(handle, |conn| {
            let Some(node) = conn.tx_head else {
                return false;
            };
            if lll::conn::tx_enqueue(handle, node).is_err() {
                // LLL queue full; the next acknowledgement frees a slot
                return false;
            }

            let next = TX_POOL
                .with(node, |buf| {
                    let next = buf.next;
                    buf.next = None;
                    next
                })
                .unwrap_or(None);
            conn.tx_head = next;
            if conn.tx_ctrl_last == Some(node) {
                conn.tx_ctrl_last = None;
            }
            if conn.tx_tail == Some(node) {
                conn.tx_tail = None;
            }
            true
        });

        if moved != Ok(true) {
            return;
        }
    }
}

/// Routes one acknowledged TX node back to its pool
///
/// Procedure completion is tracked elsewhere (the terminate flag in the
/// LLL half, the update instant in the done engine); the acknowledgement
/// itself only returns the buffer, exactly once.
pub(crate) fn tx_ack(handle: u16, node: pool::Ref) {
    let ret = TX_POOL.release(node);
    assert!(ret.is_ok());

    tx_lll_flush(handle);
}

/// Consumes a received control PDU the engine itself reacts to
///
/// Returns whether the node was consumed (and its buffer released);
/// anything else passes through to the host opaque.
pub(crate) fn rx_ctrl(handle: u16, node: pool::Ref, len: u8) -> bool {
    let end = (DC_HEADER_SIZE + len as usize).min(super::PDU_BUF_SIZE);
    let parsed = RX_POOL
        .with(node, |buf| CtrlPdu::parse(&buf.pdu[DC_HEADER_SIZE..end]))
        .unwrap_or(Err(Error::StaleRef));

    match parsed {
        Ok(CtrlPdu::ConnUpdateInd {
            win_offset,
            interval,
            latency,
            timeout,
            instant,
            ..
        }) => {
            let _ = with_conn(handle, |conn| {
                if conn.lll.role == Role::Peripheral && interval != 0 {
                    conn.pending_update = Some(PendingUpdate {
                        win_offset,
                        interval,
                        latency,
                        timeout,
                        instant,
                    });
                }
            });
            let ret = RX_POOL.release(node);
            assert!(ret.is_ok());
            true
        }
        Ok(CtrlPdu::TerminateInd { .. }) => {
            // The receive path latched the reason; the done engine acts
            let ret = RX_POOL.release(node);
            assert!(ret.is_ok());
            true
        }
        Err(_) => false,
    }
}

/// Queues a TERMINATE_IND on the connection
///
/// `error_code` travels to the peer; the local host sees the connection
/// end with the local-host reason once the PDU is acknowledged.
pub(crate) fn terminate_send(handle: u16, error_code: u8) -> Result<(), Error> {
    let reload = with_conn(handle, |conn| conn.procedure_reload)?;

    let node = TX_POOL.acquire(NodeTxBuf::new())?;
    let ret = TX_POOL.with(node, |buf| {
        buf.is_ctrl = true;
        CtrlPdu::TerminateInd { error_code }.write(&mut buf.pdu);
    });
    assert!(ret.is_ok());

    let marked = with_conn(handle, |conn| {
        conn.terminate_reason = reason::LOCAL_HOST_TERM;
        conn.procedure_expire = reload;
    });
    if marked.is_err() {
        let _ = TX_POOL.release(node);
        return Err(Error::UnknownHandle);
    }

    if let Err(e) = tx_submit(handle, node) {
        let _ = TX_POOL.release(node);
        return Err(e);
    }
    Ok(())
}

/// Starts a connection parameter update procedure (central only)
///
/// The new parameters take effect at an instant a few events ahead; both
/// sides apply them in their done engines and the host learns through a
/// `ConnUpdate` node.
pub(crate) fn conn_update_send(
    handle: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
) -> Result<(), Error> {
    if interval == 0 {
        return Err(Error::InvalidParam);
    }

    let (role, event_counter, curr_latency, busy, reload) = with_conn(handle, |conn| {
        (
            conn.lll.role,
            conn.lll.event_counter,
            conn.lll.latency,
            conn.pending_update.is_some(),
            conn.procedure_reload,
        )
    })?;

    if role != Role::Central {
        return Err(Error::InvalidState);
    }
    if busy {
        return Err(Error::WouldBlock);
    }

    let instant = event_counter.wrapping_add(curr_latency).wrapping_add(6);
    let pdu = CtrlPdu::ConnUpdateInd {
        win_size: 1,
        win_offset: 0,
        interval,
        latency,
        timeout,
        instant,
    };

    let node = TX_POOL.acquire(NodeTxBuf::new())?;
    let ret = TX_POOL.with(node, |buf| {
        buf.is_ctrl = true;
        pdu.write(&mut buf.pdu);
    });
    assert!(ret.is_ok());

    let marked = with_conn(handle, |conn| {
        conn.pending_update = Some(PendingUpdate {
            win_offset: 0,
            interval,
            latency,
            timeout,
            instant,
        });
        conn.procedure_expire = reload;
    });
    if marked.is_err() {
        let _ = TX_POOL.release(node);
        return Err(Error::UnknownHandle);
    }

    if let Err(e) = tx_submit(handle, node) {
        let _ = TX_POOL.release(node);
        return Err(e);
    }
    Ok(())
}

/// Reads the latest RSSI sample of a connection
pub(crate) fn rssi_value(handle: u16) -> Result<u8, Error> {
    with_conn(handle, |conn| conn.lll.rssi_latest)
}

/// Overrides the supervision countdown of a connection
///
/// This function is intended to be used by unit tests.
#[doc(hidden)]
pub fn supervision_expire_set(handle: u16, events: u16) -> Result<(), Error> {
    with_conn(handle, |conn| conn.supervision_expire = events)
}
