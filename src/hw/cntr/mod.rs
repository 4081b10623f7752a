//! Tick counter abstraction used by the ticker
//!
//! The counter runs at 32768 Hz and wraps at a platform-specific width:
//! the nRF RTC peripherals count 24 bits, the mocked counter keeps the full
//! 32-bit range so wraparound arithmetic gets exercised in tests. All tick
//! comparisons in the crate go through [`ticks_diff`] and [`ticks_is_after`]
//! which handle the wrap by signed-difference comparison instead of raw
//! ordering.

pub mod traits;

#[cfg(feature = "mocked_platform")]
pub mod mock_cntr;
#[cfg(feature = "nrf52840")]
pub mod rtc_cntr;

/// Value of the tick counter
pub type Ticks = u32;

/// Counter bit width mask
#[cfg(feature = "nrf52840")]
pub const CNTR_MASK: u32 = 0x00FF_FFFF;
/// Counter bit width mask
#[cfg(not(feature = "nrf52840"))]
pub const CNTR_MASK: u32 = 0xFFFF_FFFF;

/// Most significant counter bit, set in a difference when the subtrahend is
/// in the future
#[cfg(feature = "nrf52840")]
pub const CNTR_MSBIT: u32 = 1 << 23;
/// Most significant counter bit, set in a difference when the subtrahend is
/// in the future
#[cfg(not(feature = "nrf52840"))]
pub const CNTR_MSBIT: u32 = 1 << 31;

/// Counter frequency in Hz
pub const CNTR_HZ: u32 = 32_768;

/// Converts microseconds to ticks, rounding up
pub fn us_to_ticks(us: u32) -> Ticks {
    (((us as u64) * (CNTR_HZ as u64) + 999_999) / 1_000_000) as Ticks & CNTR_MASK
}

/// Converts ticks to microseconds, rounding down
pub fn ticks_to_us(ticks: Ticks) -> u32 {
    (((ticks as u64) * 1_000_000) / (CNTR_HZ as u64)) as u32
}

/// Wraparound-safe `now - old` in ticks
pub fn ticks_diff(now: Ticks, old: Ticks) -> Ticks {
    now.wrapping_sub(old) & CNTR_MASK
}

/// Checks whether tick `a` is strictly after tick `b`, assuming they are
/// less than half the counter range apart
pub fn ticks_is_after(a: Ticks, b: Ticks) -> bool {
    let diff = ticks_diff(a, b);
    diff != 0 && (diff & CNTR_MSBIT) == 0
}
