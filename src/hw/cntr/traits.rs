//! Traits required from a portable tick counter object

use super::Ticks;
use crate::error::Error;

#[cfg(test)]
use mockall::*;

/// Defines functions required from the counter peripheral backing the ticker
///
/// Modules implementing this trait are expected to use a low power counter
/// (an RTC on nRF SoCs) running at 32768 Hz with at least one compare
/// channel. The compare event must be routed to
/// [`ticker::compare_isr`](crate::ticker::compare_isr) by the platform's
/// IRQ glue.
#[cfg_attr(test, automock)]
pub trait CompareCounter: Sync {
    /// Starts the counter
    ///
    /// After this call the counter value is monotonically increasing
    /// (modulo the platform counter width).
    fn start(&self) -> Result<(), Error>;

    /// Stops the counter
    ///
    /// Used by `ll_reset` only; a stopped counter keeps its value.
    fn stop(&self) -> Result<(), Error>;

    /// Reads the current counter value
    fn now(&self) -> Ticks;

    /// Arms the compare channel to fire at the passed absolute tick
    ///
    /// A previously armed compare value is overwritten. A tick that already
    /// passed does not fire; the ticker re-checks the counter after arming
    /// and schedules itself directly when it lost that race.
    fn compare_set(&self, at: Ticks) -> Result<(), Error>;

    /// Disarms the compare channel
    fn compare_clear(&self);
}
