//! Traits required from a portable radio capability

use super::Phy;

/// Defines the radio operations sequenced by the connection event engine
///
/// The implementation owns the RADIO peripheral (or a vendor radio driver)
/// and the packet timer hardware behind it. This crate only calls the
/// operations in the order dictated by the connection event state machine
/// and reads the completion state back in its ISR handlers.
///
/// # Buffer handoff
///
/// `pkt_tx_set` and `pkt_rx_set` pass raw pointers because the buffer is
/// handed to hardware (or to the mock's injection path) and accessed after
/// the setting call returns. The caller guarantees the buffer outlives the
/// radio operation and that no other context touches it until the matching
/// completion ISR ran. Buffers come from the link layer's static pools, so
/// the lifetime requirement holds by construction.
pub trait RadioOps: Sync {
    /// Resets the radio into the disabled state, dropping any ongoing
    /// operation
    fn reset(&self);

    /// Selects the PHY for the next operations
    fn phy_set(&self, phy: Phy);

    /// Configures the packet layout for data channel PDUs with the passed
    /// maximum payload length
    fn pkt_configure(&self, max_len: u8);

    /// Sets the access address used for TX and RX
    fn aa_set(&self, aa: &[u8; 4]);

    /// Seeds the CRC engine with the connection's CRC init value
    fn crc_configure(&self, crc_init: &[u8; 3]);

    /// Tunes to the passed data channel (frequency and whitening)
    fn chan_set(&self, chan: u8);

    /// Hands a PDU buffer to the transmitter
    fn pkt_tx_set(&self, pdu: *const u8);

    /// Hands a PDU buffer to the receiver
    fn pkt_rx_set(&self, pdu: *mut u8);

    /// Starts the armed operation at the passed absolute microsecond of the
    /// packet timer
    fn tmr_start(&self, at_us: u32);

    /// Programs the inter-frame spacing applied by the automatic turnaround
    fn tmr_tifs_set(&self, us: u16);

    /// Programs the header-complete timeout closing a receive window
    fn tmr_hcto_set(&self, us: u32);

    /// Returns the packet-end capture of the last completed operation in
    /// packet timer microseconds
    fn tmr_end_get(&self) -> u32;

    /// Stops the packet timer at the end of the event
    fn tmr_stop(&self);

    /// Arms the automatic turnaround: after the current operation completes
    /// the radio switches to TX once the IFS elapsed
    fn switch_complete_and_tx(&self);

    /// Arms the automatic turnaround: after the current operation completes
    /// the radio switches to RX once the IFS elapsed
    fn switch_complete_and_rx(&self);

    /// Disables the radio, triggering the completion path of the ongoing
    /// operation
    fn disable(&self);

    /// Checks whether the last operation ran to completion
    fn is_done(&self) -> bool;

    /// Checks whether the CRC of the last received packet was valid
    fn crc_is_valid(&self) -> bool;

    /// Starts an RSSI measurement for the ongoing reception
    fn rssi_measure(&self);

    /// Checks whether an RSSI sample is available
    fn rssi_is_ready(&self) -> bool;

    /// Returns the last RSSI sample, as a positive dBm attenuation value
    fn rssi_get(&self) -> u8;

    /// Clears latched status and events after an ISR handled them
    fn status_reset(&self);
}
