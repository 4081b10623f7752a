//! Scripted radio capability for host tests
//!
//! The mock records the sequencing calls of the connection event engine and
//! lets a test play the role of the radio hardware: completing a
//! transmission, delivering a received PDU with a chosen CRC verdict, or
//! closing a receive window empty. After steering the mock the test calls
//! the link layer ISR entry itself, exactly like the radio IRQ would.

#[cfg(not(feature = "mocked_platform"))]
compile_error!("MockRadio cannot be used on real hardware");

use super::traits::RadioOps;
use super::Phy;
use crate::crit_sect;
use crate::mutex::Mutex;
use crate::pdu::DC_HEADER_SIZE;

const TX_LOG_CNT: usize = 16;
const TX_LOG_PDU_MAX: usize = 48;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum Turnaround {
    None,
    ToTx,
    ToRx,
}

struct MockState {
    phy: Phy,
    max_len: u8,
    aa: [u8; 4],
    crc_init: [u8; 3],
    chan: u8,
    tx_ptr: Option<*const u8>,
    rx_ptr: Option<*mut u8>,
    tifs_us: u16,
    hcto_us: u32,
    start_at_us: Option<u32>,
    end_us: u32,
    turnaround: Turnaround,
    is_done: bool,
    crc_ok: bool,
    rssi_pending: bool,
    rssi: u8,
    disable_count: u32,
    tx_log: [([u8; TX_LOG_PDU_MAX], u8); TX_LOG_CNT],
    tx_cnt: usize,
}

// Safety: the mock is only ever used in single-threaded host tests which
// impersonate every execution context themselves
unsafe impl Send for MockState {}

const STATE_INIT: MockState = MockState {
    phy: Phy::One,
    max_len: 0,
    aa: [0; 4],
    crc_init: [0; 3],
    chan: 0,
    tx_ptr: None,
    rx_ptr: None,
    tifs_us: 0,
    hcto_us: 0,
    start_at_us: None,
    end_us: 0,
    turnaround: Turnaround::None,
    is_done: false,
    crc_ok: false,
    rssi_pending: false,
    rssi: 0,
    disable_count: 0,
    tx_log: [([0; TX_LOG_PDU_MAX], 0); TX_LOG_CNT],
    tx_cnt: 0,
};

static STATE: Mutex<MockState> = Mutex::new(STATE_INIT);

fn with_state<F, R>(func: F) -> R
where
    F: FnOnce(&mut MockState) -> R,
{
    crit_sect::locked(|cs| func(&mut STATE.borrow_mut(cs)))
}

/// Phantom object used to access the mocked radio singleton
pub struct MockRadio;

impl MockRadio {
    /// Reset module
    ///
    /// This function is intended to be used between unit tests
    #[doc(hidden)]
    pub fn reset_mock() {
        with_state(|s| *s = STATE_INIT);
    }

    /// Returns a phantom object accessing the mocked radio singleton
    pub fn new() -> Self {
        Self
    }

    /// Completes the ongoing transmission: captures the PDU handed over
    /// with `pkt_tx_set` into the TX log and latches a clean completion
    ///
    /// The test is expected to call the link layer radio ISR afterwards.
    pub fn complete_tx() {
        with_state(|s| {
            let ptr = s.tx_ptr.expect("no TX buffer armed");
            let mut pdu = [0u8; TX_LOG_PDU_MAX];

            // Safety: the engine armed this buffer for hardware access and
            // does not touch it until the completion ISR runs
            let len = unsafe { DC_HEADER_SIZE + *ptr.add(1) as usize };
            let len = len.min(TX_LOG_PDU_MAX);
            for (i, byte) in pdu.iter_mut().enumerate().take(len) {
                *byte = unsafe { *ptr.add(i) };
            }

            assert!(s.tx_cnt < TX_LOG_CNT);
            s.tx_log[s.tx_cnt] = (pdu, len as u8);
            s.tx_cnt += 1;

            s.is_done = true;
            s.end_us = s.end_us.wrapping_add(100);
        });
    }

    /// Completes the ongoing reception with the passed PDU and CRC verdict
    ///
    /// The test is expected to call the link layer radio ISR afterwards.
    pub fn complete_rx(pdu: &[u8], crc_ok: bool) {
        with_state(|s| {
            let ptr = s.rx_ptr.expect("no RX buffer armed");

            // Safety: the engine armed this buffer for hardware access and
            // does not touch it until the completion ISR runs
            for (i, byte) in pdu.iter().enumerate() {
                unsafe { *ptr.add(i) = *byte };
            }

            s.is_done = true;
            s.crc_ok = crc_ok;
            s.rssi_pending = true;
            s.end_us = s.end_us.wrapping_add(100);
        });
    }

    /// Closes the ongoing receive window without any reception
    pub fn timeout_rx() {
        with_state(|s| {
            s.is_done = false;
            s.crc_ok = false;
        });
    }

    /// Sets the RSSI sample delivered with subsequent receptions
    pub fn rssi_set(rssi: u8) {
        with_state(|s| s.rssi = rssi);
    }

    /// Number of PDUs captured by [`complete_tx`](MockRadio::complete_tx)
    pub fn tx_count() -> usize {
        with_state(|s| s.tx_cnt)
    }

    /// Returns a captured TX PDU by index
    pub fn tx_get(idx: usize) -> ([u8; TX_LOG_PDU_MAX], usize) {
        with_state(|s| {
            assert!(idx < s.tx_cnt);
            let (pdu, len) = s.tx_log[idx];
            (pdu, len as usize)
        })
    }

    /// Data channel the engine tuned to last
    pub fn chan_get() -> u8 {
        with_state(|s| s.chan)
    }

    /// Access address the engine configured last
    pub fn aa_get() -> [u8; 4] {
        with_state(|s| s.aa)
    }

    /// Number of `disable` calls since the last reset
    pub fn disable_count() -> u32 {
        with_state(|s| s.disable_count)
    }

    /// Absolute start time the engine armed last, if any
    pub fn start_at_get() -> Option<u32> {
        with_state(|s| s.start_at_us)
    }

    /// Inter-frame spacing the engine programmed last
    pub fn tifs_get() -> u16 {
        with_state(|s| s.tifs_us)
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioOps for MockRadio {
    fn reset(&self) {
        with_state(|s| {
            s.tx_ptr = None;
            s.rx_ptr = None;
            s.turnaround = Turnaround::None;
            s.is_done = false;
            s.crc_ok = false;
        });
    }

    fn phy_set(&self, phy: Phy) {
        with_state(|s| s.phy = phy);
    }

    fn pkt_configure(&self, max_len: u8) {
        with_state(|s| s.max_len = max_len);
    }

    fn aa_set(&self, aa: &[u8; 4]) {
        with_state(|s| s.aa = *aa);
    }

    fn crc_configure(&self, crc_init: &[u8; 3]) {
        with_state(|s| s.crc_init = *crc_init);
    }

    fn chan_set(&self, chan: u8) {
        with_state(|s| s.chan = chan);
    }

    fn pkt_tx_set(&self, pdu: *const u8) {
        with_state(|s| s.tx_ptr = Some(pdu));
    }

    fn pkt_rx_set(&self, pdu: *mut u8) {
        with_state(|s| s.rx_ptr = Some(pdu));
    }

    fn tmr_start(&self, at_us: u32) {
        with_state(|s| {
            s.start_at_us = Some(at_us);
            s.end_us = at_us;
        });
    }

    fn tmr_tifs_set(&self, us: u16) {
        with_state(|s| s.tifs_us = us);
    }

    fn tmr_hcto_set(&self, us: u32) {
        with_state(|s| s.hcto_us = us);
    }

    fn tmr_end_get(&self) -> u32 {
        with_state(|s| s.end_us)
    }

    fn tmr_stop(&self) {
        with_state(|s| s.start_at_us = None);
    }

    fn switch_complete_and_tx(&self) {
        with_state(|s| s.turnaround = Turnaround::ToTx);
    }

    fn switch_complete_and_rx(&self) {
        with_state(|s| s.turnaround = Turnaround::ToRx);
    }

    fn disable(&self) {
        with_state(|s| {
            s.disable_count += 1;
            s.turnaround = Turnaround::None;
        });
    }

    fn is_done(&self) -> bool {
        with_state(|s| s.is_done)
    }

    fn crc_is_valid(&self) -> bool {
        with_state(|s| s.crc_ok)
    }

    fn rssi_measure(&self) {
        with_state(|s| s.rssi_pending = true);
    }

    fn rssi_is_ready(&self) -> bool {
        with_state(|s| s.rssi_pending)
    }

    fn rssi_get(&self) -> u8 {
        with_state(|s| {
            s.rssi_pending = false;
            s.rssi
        })
    }

    fn status_reset(&self) {
        with_state(|s| {
            s.is_done = false;
            s.crc_ok = false;
        });
    }
}
