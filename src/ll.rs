//! Host-facing command and event surface of the link layer
//!
//! The HCI layer above this crate drives the link layer exclusively
//! through this module, from ordinary thread context: initialization and
//! reset, submitting outbound PDU buffers keyed by connection handle,
//! draining the typed RX event queue, and the few connection commands the
//! event engine implements itself. The wake hook registered at
//! [`init`] signals the host thread whenever a node reaches the RX queue,
//! so the host never polls.

use crate::context::{self, ContextId};
use crate::error::Error;
use crate::hw::cntr::traits::CompareCounter;
use crate::hw::radio::traits::RadioOps;
use crate::mayfly::{self, Call, SchedHook};
use crate::mem::pool;
use crate::pdu::{DataHeader, Llid, DC_HEADER_SIZE};
use crate::ull::{self, NodeRx, NodeTxBuf, RxWakeHook, TX_POOL};
use crate::{lll, ticker};

/// Initializes the link layer with its hardware capabilities and hooks
///
/// `sched` pends the software interrupt backing a deferred context;
/// `rx_wake` wakes the host thread when an RX node is available. Both are
/// platform glue outside this crate.
pub fn init(
    cntr: &'static dyn CompareCounter,
    radio: &'static dyn RadioOps,
    sched: SchedHook,
    rx_wake: RxWakeHook,
) -> Result<(), Error> {
    mayfly::init(sched);
    ull::init(rx_wake);
    ticker::init(cntr)?;
    lll::init(radio);
    Ok(())
}

/// Reinitializes all link layer state
///
/// Connections, queued PDUs and timing obligations are dropped without
/// notifying peers; the host considers every handle gone. Buffers the host
/// still holds become stale.
pub fn reset() {
    ticker::reset();
    lll::reset();
    ull::reset();
}

/// Tears the link layer down completely
///
/// This function is intended to be used between unit tests.
#[doc(hidden)]
pub fn deinit() {
    ticker::deinit();
    lll::deinit();
    ull::deinit();
    mayfly::deinit();
}

/// Returns the oldest host-bound event without consuming it
pub fn rx_get() -> Option<NodeRx> {
    ull::ll_rx_peek()
}

/// Consumes the oldest host-bound event
///
/// The host processes the node obtained from [`rx_get`] first and
/// dequeues afterwards, leaving the producer side free to append
/// meanwhile.
pub fn rx_dequeue() -> Option<NodeRx> {
    ull::ll_rx_dequeue()
}

/// Returns the PDU buffer of a consumed RX node to its pool
///
/// Nodes without a buffer (synthetic events) need no release and accept
/// this call as a no-op.
pub fn rx_mem_release(node: &NodeRx) -> Result<(), Error> {
    match node {
        NodeRx::DcPdu { node, .. } => ull::RX_POOL.release(*node),
        _ => Ok(()),
    }
}

/// Acquires a TX buffer for an outbound PDU
pub fn tx_mem_acquire() -> Result<pool::Ref, Error> {
    TX_POOL.acquire(NodeTxBuf::new())
}

/// Fills an acquired TX buffer with a PDU
///
/// The ARQ and more-data bits of the header are owned by the link layer
/// and filled at transmit time.
pub fn tx_mem_write(node: pool::Ref, llid: Llid, payload: &[u8]) -> Result<(), Error> {
    if payload.len() > crate::config::PDU_DC_PAYLOAD_MAX {
        return Err(Error::InvalidParam);
    }

    TX_POOL.with(node, |buf| {
        buf.is_ctrl = llid == Llid::Control;
        DataHeader {
            llid,
            nesn: false,
            sn: false,
            md: false,
            len: payload.len() as u8,
        }
        .write(&mut buf.pdu);
        buf.pdu[DC_HEADER_SIZE..DC_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    })
}

/// Returns an unsubmitted TX buffer to its pool
pub fn tx_mem_release(node: pool::Ref) -> Result<(), Error> {
    TX_POOL.release(node)
}

/// Submits a filled TX buffer for transmission on a connection
///
/// Ownership of the buffer passes to the link layer; it returns to the
/// pool once the peer acknowledged the PDU.
pub fn tx_mem_enqueue(handle: u16, node: pool::Ref) -> Result<(), Error> {
    if !ull::conn::handle_active(handle) {
        return Err(Error::UnknownHandle);
    }
    ull::conn::tx_submit(handle, node)
}

/// Starts the local terminate procedure on a connection
///
/// `error_code` travels to the peer in the TERMINATE_IND; the local host
/// sees the connection end with the local-host reason once the PDU is
/// acknowledged.
pub fn terminate_ind_send(handle: u16, error_code: u8) -> Result<(), Error> {
    ull::conn::terminate_send(handle, error_code)
}

/// Starts a connection parameter update procedure (central only)
pub fn conn_update(handle: u16, interval: u16, latency: u16, timeout: u16) -> Result<(), Error> {
    ull::conn::conn_update_send(handle, interval, latency, timeout)
}

/// Reads the latest RSSI sample of a connection, as dBm attenuation
pub fn rssi_get(handle: u16) -> Result<u8, Error> {
    ull::conn::rssi_value(handle)
}

/// Aborts the ongoing and queued radio activity of a connection
///
/// The connection itself stays up and resumes at its next occurrence.
pub fn radio_state_abort(handle: u16) -> Result<(), Error> {
    if !ull::conn::handle_active(handle) {
        return Err(Error::UnknownHandle);
    }
    mayfly::enqueue(context::current(), ContextId::Lll, Call::LllDisable { handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PDU_RX_CNT, PDU_TX_CNT};
    use crate::hw::cntr::mock_cntr::MockCntr;
    use crate::hw::radio::mock_radio::MockRadio;
    use crate::lll::conn::Role;
    use crate::pdu::{reason, ConnectInd, CtrlPdu};
    use crate::ull::conn as conn_mgr;
    use serial_test::serial;

    static CNTR: MockCntr = MockCntr;
    static RADIO: MockRadio = MockRadio;

    fn sched(_ctx: ContextId) {}
    fn wake() {}

    fn fixture() {
        deinit();
        MockCntr::reset();
        MockRadio::reset_mock();
        context::leave(ContextId::Thread);
        init(&CNTR, &RADIO, sched, wake).unwrap();
    }

    fn pump() {
        for _ in 0..8 {
            mayfly::run(ContextId::Lll);
            mayfly::run(ContextId::UllHigh);
            mayfly::run(ContextId::UllLow);
        }
    }

    fn connect_ind() -> ConnectInd {
        ConnectInd {
            access_addr: [0x71, 0x22, 0x93, 0xAC],
            crc_init: [0x12, 0x34, 0x56],
            win_size: 1,
            win_offset: 0,
            interval: 40, // 50 ms
            latency: 0,
            timeout: 100, // 1 s, 20 events
            chan_map: [0xFF, 0xFF, 0xFF, 0xFF, 0x1F],
            hop: 7,
            sca: 0,
        }
    }

    fn setup(role: Role) -> u16 {
        let prev = context::enter(ContextId::UllHigh);
        let handle = match role {
            Role::Peripheral => conn_mgr::setup_peripheral(&connect_ind(), 0).unwrap(),
            Role::Central => conn_mgr::setup_central(&connect_ind(), 0).unwrap(),
        };
        context::leave(prev);
        pump();

        assert!(matches!(rx_dequeue(), Some(NodeRx::Connection { .. })));
        handle
    }

    /// Advances the mocked counter to the connection's next expiry and
    /// pumps the prepare into the LLL
    fn run_to_event(handle: u16) {
        let at = ticker::next_expiry(ticker::TICKER_ID_CONN_BASE + handle as u8).unwrap();
        MockCntr::set_now(at);
        ticker::compare_isr();
        pump();
    }

    fn empty_pdu(sn: bool, nesn: bool, md: bool) -> [u8; 2] {
        let mut pdu = [0u8; 2];
        DataHeader {
            llid: Llid::DataContinue,
            nesn,
            sn,
            md,
            len: 0,
        }
        .write(&mut pdu);
        pdu
    }

    fn data_pdu(sn: bool, nesn: bool, md: bool, payload: &[u8]) -> std::vec::Vec<u8> {
        let mut pdu = std::vec![0u8; DC_HEADER_SIZE + payload.len()];
        DataHeader {
            llid: Llid::DataStart,
            nesn,
            sn,
            md,
            len: payload.len() as u8,
        }
        .write(&mut pdu);
        pdu[DC_HEADER_SIZE..].copy_from_slice(payload);
        pdu
    }

    /// Ideal peer of a peripheral under test; both ARQ bits flip after
    /// every completed exchange
    struct Peer {
        sn: bool,
        nesn: bool,
    }

    impl Peer {
        fn new() -> Self {
            Self {
                sn: false,
                nesn: false,
            }
        }

        fn pdu(&self) -> [u8; 2] {
            empty_pdu(self.sn, self.nesn, false)
        }

        fn advance(&mut self) {
            self.sn = !self.sn;
            self.nesn = !self.nesn;
        }
    }

    /// Runs one peripheral connection event receiving `pdu`, answering
    /// once and closing on the following receive timeout
    fn periph_event(handle: u16, pdu: &[u8], crc_ok: bool) {
        run_to_event(handle);
        MockRadio::complete_rx(pdu, crc_ok);
        lll::radio_isr();
        MockRadio::complete_tx();
        lll::radio_isr();
        MockRadio::timeout_rx();
        lll::radio_isr();
        pump();
    }

    /// Runs one peripheral connection event in which nothing is received
    fn periph_event_missed(handle: u16) {
        run_to_event(handle);
        MockRadio::timeout_rx();
        lll::radio_isr();
        pump();
    }

    #[test]
    #[serial]
    fn test_crc_runs_and_supervision_timeout_end_to_end() {
        fixture();
        let handle = setup(Role::Peripheral);
        let mut peer = Peer::new();

        // Three valid exchanges keep the supervision countdown at reload
        for _ in 0..3 {
            periph_event(handle, &peer.pdu(), true);
            peer.advance();
            assert!(conn_mgr::handle_active(handle));
        }

        // First CRC failure: the tolerance counts down, the event closes
        // without a valid exchange
        periph_event(handle, &peer.pdu(), false);
        assert!(conn_mgr::handle_active(handle));

        // Second CRC failure exhausts the tolerance; the event closes
        // early without a reply
        run_to_event(handle);
        MockRadio::complete_rx(&peer.pdu(), false);
        lll::radio_isr();
        pump();
        assert!(conn_mgr::handle_active(handle));

        // Drive the countdown to its edge; one more silent event ends it
        conn_mgr::supervision_expire_set(handle, 1).unwrap();
        periph_event_missed(handle);

        let mut terminated = None;
        while let Some(node) = rx_dequeue() {
            if let NodeRx::Terminate { handle, reason } = node {
                terminated = Some((handle, reason));
            }
        }
        assert_eq!(terminated, Some((handle, reason::CONN_TIMEOUT)));
        assert!(!conn_mgr::handle_active(handle));

        // The slot is reusable right away
        assert_eq!(conn_mgr::acquire(Role::Peripheral).unwrap(), handle);
    }

    #[test]
    #[serial]
    fn test_central_data_round_trip_acks_once() {
        fixture();
        let handle = setup(Role::Central);

        let node = tx_mem_acquire().unwrap();
        tx_mem_write(node, Llid::DataStart, &[0xAA, 0xBB]).unwrap();
        tx_mem_enqueue(handle, node).unwrap();
        pump();

        run_to_event(handle);
        MockRadio::complete_tx();
        lll::radio_isr();

        // The peer acknowledges with an empty PDU
        MockRadio::complete_rx(&empty_pdu(false, true, false), true);
        lll::radio_isr();
        pump();

        // The transmitted PDU carried the payload with fresh ARQ bits
        let (pdu, len) = MockRadio::tx_get(0);
        let hdr = DataHeader::parse(&pdu[..len]).unwrap();
        assert_eq!(hdr.llid, Llid::DataStart);
        assert!(!hdr.sn);
        assert!(!hdr.nesn);
        assert_eq!(hdr.len, 2);
        assert_eq!(&pdu[DC_HEADER_SIZE..len], &[0xAA, 0xBB]);

        // Acknowledged exactly once: the buffer is back in the pool
        assert_eq!(TX_POOL.free_count(), PDU_TX_CNT);
        assert!(conn_mgr::handle_active(handle));
    }

    #[test]
    #[serial]
    fn test_unacknowledged_pdu_is_retransmitted() {
        fixture();
        let handle = setup(Role::Central);

        let node = tx_mem_acquire().unwrap();
        tx_mem_write(node, Llid::DataStart, &[0x42]).unwrap();
        tx_mem_enqueue(handle, node).unwrap();
        pump();

        run_to_event(handle);
        MockRadio::complete_tx();
        lll::radio_isr();

        // The peer answers without acknowledging (nesn unchanged), so the
        // same PDU goes out again within the event
        MockRadio::complete_rx(&empty_pdu(false, false, false), true);
        lll::radio_isr();
        MockRadio::complete_tx();
        lll::radio_isr();

        // Now the acknowledgement arrives
        MockRadio::complete_rx(&empty_pdu(true, true, false), true);
        lll::radio_isr();
        pump();

        assert_eq!(MockRadio::tx_count(), 2);
        let (first, first_len) = MockRadio::tx_get(0);
        let (second, second_len) = MockRadio::tx_get(1);
        assert_eq!(&first[DC_HEADER_SIZE..first_len], &[0x42]);
        assert_eq!(&second[DC_HEADER_SIZE..second_len], &[0x42]);

        // The retransmission acknowledged the peer's empty PDU
        let hdr = DataHeader::parse(&second[..second_len]).unwrap();
        assert!(hdr.nesn);
        assert!(!hdr.sn);

        assert_eq!(TX_POOL.free_count(), PDU_TX_CNT);
    }

    #[test]
    #[serial]
    fn test_duplicate_reception_is_delivered_once() {
        fixture();
        let handle = setup(Role::Peripheral);

        run_to_event(handle);
        MockRadio::complete_rx(&data_pdu(false, false, true, &[0x10, 0x20]), true);
        lll::radio_isr();
        MockRadio::complete_tx();
        lll::radio_isr();

        // The peer missed the acknowledgement and repeats the same PDU
        MockRadio::complete_rx(&data_pdu(false, false, false, &[0x10, 0x20]), true);
        lll::radio_isr();
        MockRadio::complete_tx();
        lll::radio_isr();
        MockRadio::timeout_rx();
        lll::radio_isr();
        pump();

        let mut delivered = 0;
        while let Some(node) = rx_dequeue() {
            if let NodeRx::DcPdu { len, .. } = node {
                assert_eq!(len, 2);
                delivered += 1;
                rx_mem_release(&node).unwrap();
            }
        }
        assert_eq!(delivered, 1);
        assert_eq!(ull::RX_POOL.free_count(), PDU_RX_CNT - 1);

        // The buffer still armed for the next reception is the one missing
        assert!(conn_mgr::handle_active(handle));
    }

    #[test]
    #[serial]
    fn test_local_terminate_completes_on_ack() {
        fixture();
        let handle = setup(Role::Central);

        terminate_ind_send(handle, reason::REMOTE_USER_TERM).unwrap();
        pump();

        run_to_event(handle);
        MockRadio::complete_tx();
        lll::radio_isr();
        MockRadio::complete_rx(&empty_pdu(false, true, false), true);
        lll::radio_isr();
        pump();

        // The transmitted control PDU was the TERMINATE_IND
        let (pdu, len) = MockRadio::tx_get(0);
        let hdr = DataHeader::parse(&pdu[..len]).unwrap();
        assert_eq!(hdr.llid, Llid::Control);
        assert!(CtrlPdu::is_terminate_ind(&pdu[DC_HEADER_SIZE..len]));

        let mut terminated = None;
        while let Some(node) = rx_dequeue() {
            if let NodeRx::Terminate { reason, .. } = node {
                terminated = Some(reason);
            }
        }
        assert_eq!(terminated, Some(reason::LOCAL_HOST_TERM));
        assert!(!conn_mgr::handle_active(handle));
        assert_eq!(TX_POOL.free_count(), PDU_TX_CNT);
    }

    #[test]
    #[serial]
    fn test_peer_terminate_ends_the_connection() {
        fixture();
        let handle = setup(Role::Peripheral);

        let mut pdu = [0u8; 4];
        CtrlPdu::TerminateInd {
            error_code: reason::REMOTE_USER_TERM,
        }
        .write(&mut pdu);

        run_to_event(handle);
        MockRadio::complete_rx(&pdu, true);
        lll::radio_isr();
        pump();

        let mut terminated = None;
        while let Some(node) = rx_dequeue() {
            if let NodeRx::Terminate { reason, .. } = node {
                terminated = Some(reason);
            }
        }
        assert_eq!(terminated, Some(reason::REMOTE_USER_TERM));
        assert!(!conn_mgr::handle_active(handle));

        // The control PDU was consumed internally; no RX buffer leaked
        // beyond the one re-armed for the closed event
        assert!(ull::RX_POOL.free_count() >= PDU_RX_CNT - 1);
    }

    #[test]
    #[serial]
    fn test_anchor_drift_feeds_the_ticker() {
        fixture();
        let handle = setup(Role::Peripheral);

        let id = ticker::TICKER_ID_CONN_BASE + handle as u8;
        let before = ticker::next_expiry(id).unwrap();
        let peer = Peer::new();

        periph_event(handle, &peer.pdu(), true);

        // interval 50 ms = 1638 ticks; the mock delivers the anchor 100 us
        // after the radio start while 83 us were expected, one tick late
        let after = ticker::next_expiry(id).unwrap();
        assert_eq!(after, before + 1638 + 1);
    }

    #[test]
    #[serial]
    fn test_tx_pool_survives_repeated_rounds() {
        fixture();
        let handle = setup(Role::Central);
        let mut nesn = true;

        for round in 0..5u8 {
            let node = tx_mem_acquire().unwrap();
            tx_mem_write(node, Llid::DataStart, &[round]).unwrap();
            tx_mem_enqueue(handle, node).unwrap();
            pump();

            run_to_event(handle);
            MockRadio::complete_tx();
            lll::radio_isr();
            MockRadio::complete_rx(&empty_pdu(round % 2 == 1, nesn, false), true);
            lll::radio_isr();
            pump();

            assert_eq!(TX_POOL.free_count(), PDU_TX_CNT);
            nesn = !nesn;
        }

        assert_eq!(MockRadio::tx_count(), 5);
    }

    #[test]
    #[serial]
    fn test_reset_drops_all_connections() {
        fixture();
        let handle = setup(Role::Peripheral);
        assert!(conn_mgr::handle_active(handle));

        reset();

        assert!(!conn_mgr::handle_active(handle));
        assert!(rx_dequeue().is_none());
        assert_eq!(TX_POOL.free_count(), PDU_TX_CNT);
        assert_eq!(ull::RX_POOL.free_count(), PDU_RX_CNT);
        assert_eq!(
            ticker::next_expiry(ticker::TICKER_ID_CONN_BASE + handle as u8),
            None
        );
    }

    #[test]
    #[serial]
    fn test_commands_on_unknown_handle_fail() {
        fixture();

        assert_eq!(
            terminate_ind_send(0, reason::REMOTE_USER_TERM),
            Err(Error::UnknownHandle)
        );
        assert_eq!(conn_update(0, 40, 0, 100), Err(Error::UnknownHandle));
        assert_eq!(rssi_get(0), Err(Error::UnknownHandle));
        assert_eq!(radio_state_abort(0), Err(Error::UnknownHandle));

        let node = tx_mem_acquire().unwrap();
        assert_eq!(tx_mem_enqueue(0, node), Err(Error::UnknownHandle));
        tx_mem_release(node).unwrap();
    }

    #[test]
    #[serial]
    fn test_conn_update_on_peripheral_is_refused() {
        fixture();
        let handle = setup(Role::Peripheral);

        assert_eq!(conn_update(handle, 24, 0, 100), Err(Error::InvalidState));
    }

    #[test]
    #[serial]
    fn test_rssi_follows_received_packets() {
        fixture();
        let handle = setup(Role::Peripheral);
        let peer = Peer::new();

        MockRadio::rssi_set(55);
        periph_event(handle, &peer.pdu(), true);

        assert_eq!(rssi_get(handle).unwrap(), 55);
    }

    #[test]
    #[serial]
    fn test_arq_delivers_each_pdu_once_despite_crc_noise() {
        fixture();
        let handle = setup(Role::Peripheral);

        // The peer offers one numbered PDU per event and repeats it until
        // the reply acknowledges it; every third reception is corrupted
        let mut peer_sn = false;
        let mut peer_nesn = false;
        let mut payload = 0u8;
        let mut delivered = std::vec::Vec::new();

        for k in 0..12u32 {
            let crc_ok = k % 3 != 2;
            periph_event(
                handle,
                &data_pdu(peer_sn, peer_nesn, false, &[payload]),
                crc_ok,
            );

            while let Some(node) = rx_dequeue() {
                if let NodeRx::DcPdu { len, node: buf, .. } = node {
                    assert_eq!(len, 1);
                    delivered
                        .push(ull::RX_POOL.with(buf, |b| b.pdu[DC_HEADER_SIZE]).unwrap());
                    rx_mem_release(&node).unwrap();
                }
            }

            if crc_ok {
                // The reply acknowledged the PDU and carried an empty PDU
                // of its own; the ideal peer advances both sequence bits
                peer_sn = !peer_sn;
                peer_nesn = !peer_nesn;
                payload += 1;
            }
        }

        let expected: std::vec::Vec<u8> = (0..8).collect();
        assert_eq!(delivered, expected);
        assert!(conn_mgr::handle_active(handle));
        assert_eq!(ull::RX_POOL.free_count(), PDU_RX_CNT - 1);
    }

    #[test]
    #[serial]
    fn test_due_queued_event_preempts_running_one() {
        fixture();
        let h0 = setup(Role::Peripheral);

        // Second link five window units later on its own access address
        let ci1 = ConnectInd {
            access_addr: [0xDE, 0xAD, 0xBE, 0xEF],
            win_offset: 4,
            ..connect_ind()
        };
        let prev = context::enter(ContextId::UllHigh);
        let h1 = conn_mgr::setup_peripheral(&ci1, 0).unwrap();
        context::leave(prev);
        pump();
        assert!(matches!(rx_dequeue(), Some(NodeRx::Connection { .. })));

        // The first link's event starts and sits waiting for its anchor
        run_to_event(h0);
        assert_eq!(MockRadio::aa_get(), connect_ind().access_addr);

        // The second link's expiry queues behind the running event; the
        // preempt timeout aborts the running one at the newcomer's due time
        run_to_event(h1);
        assert_eq!(MockRadio::disable_count(), 1);

        // The aborted event winds down and the queued one takes the radio
        lll::radio_isr();
        pump();
        assert_eq!(MockRadio::aa_get(), ci1.access_addr);

        let peer = Peer::new();
        MockRadio::complete_rx(&peer.pdu(), true);
        lll::radio_isr();
        MockRadio::complete_tx();
        lll::radio_isr();
        MockRadio::timeout_rx();
        lll::radio_isr();
        pump();

        // The displaced link lost the occurrence, not the connection
        assert!(conn_mgr::handle_active(h0));
        assert!(conn_mgr::handle_active(h1));
    }
}
