//! Manually advanced counter for host tests
//!
//! Tests own time: they set or advance the counter value and learn whether
//! the armed compare value was crossed, then impersonate the compare IRQ by
//! calling into the ticker themselves.

#[cfg(not(feature = "mocked_platform"))]
compile_error!("MockCntr cannot be used on real hardware");

use super::traits::CompareCounter;
use super::{ticks_diff, Ticks, CNTR_MASK};
use crate::crit_sect;
use crate::error::Error;
use crate::mutex::Mutex;

struct MockState {
    running: bool,
    now: Ticks,
    compare: Option<Ticks>,
}

static STATE: Mutex<MockState> = Mutex::new(MockState {
    running: false,
    now: 0,
    compare: None,
});

/// Phantom object used to access the mocked counter singleton
pub struct MockCntr;

impl MockCntr {
    /// Reset module
    ///
    /// This function is intended to be used between unit tests
    #[doc(hidden)]
    pub fn reset() {
        crit_sect::locked(|cs| {
            let mut state = STATE.borrow_mut(cs);
            state.running = false;
            state.now = 0;
            state.compare = None;
        });
    }

    /// Returns a phantom object accessing the mocked counter singleton
    pub fn new() -> Self {
        Self
    }

    /// Forces the counter to the passed value
    pub fn set_now(ticks: Ticks) {
        crit_sect::locked(|cs| STATE.borrow_mut(cs).now = ticks & CNTR_MASK);
    }

    /// Advances the counter, reporting whether the armed compare value was
    /// crossed in the advanced window
    ///
    /// When `true` is returned the test is expected to act as the compare
    /// IRQ and call [`ticker::compare_isr`](crate::ticker::compare_isr).
    pub fn advance(ticks: Ticks) -> bool {
        crit_sect::locked(|cs| {
            let mut state = STATE.borrow_mut(cs);
            let old = state.now;
            state.now = old.wrapping_add(ticks) & CNTR_MASK;

            match state.compare {
                Some(at) => {
                    let fired = ticks_diff(at, old).wrapping_sub(1) < ticks;
                    if fired {
                        state.compare = None;
                    }
                    fired
                }
                None => false,
            }
        })
    }

    /// Returns the currently armed compare value, if any
    pub fn compare_get() -> Option<Ticks> {
        crit_sect::locked(|cs| STATE.borrow(cs).compare)
    }
}

impl Default for MockCntr {
    fn default() -> Self {
        Self::new()
    }
}

impl CompareCounter for MockCntr {
    fn start(&self) -> Result<(), Error> {
        crit_sect::locked(|cs| STATE.borrow_mut(cs).running = true);
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        crit_sect::locked(|cs| STATE.borrow_mut(cs).running = false);
        Ok(())
    }

    fn now(&self) -> Ticks {
        crit_sect::locked(|cs| STATE.borrow(cs).now)
    }

    fn compare_set(&self, at: Ticks) -> Result<(), Error> {
        crit_sect::locked(|cs| STATE.borrow_mut(cs).compare = Some(at & CNTR_MASK));
        Ok(())
    }

    fn compare_clear(&self) {
        crit_sect::locked(|cs| STATE.borrow_mut(cs).compare = None);
    }
}
