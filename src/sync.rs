//! Minimal wake primitive for the one context allowed to block
//!
//! Thread context occasionally has to wait for the deferred contexts to
//! finish something: a queued ticker operation completing, or a connection
//! event being torn down. Interrupt and deferred contexts never block; they
//! signal. The primitive is a single flag the waiter spins on - on Cortex-M
//! the spin loop hint lowers to WFE-friendly code, and on the mocked
//! platform the signalling side always runs before the wait starts because
//! tests pump the contexts themselves.

use core::sync::atomic::{AtomicBool, Ordering};

/// One-shot binary signal
pub struct Signal {
    raised: AtomicBool,
}

impl Signal {
    /// Creates a lowered signal
    pub const fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
        }
    }

    /// Raises the signal, releasing a pending or future waiter
    ///
    /// Callable from any context.
    pub fn give(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Waits for the signal and lowers it again
    ///
    /// Must only be called from thread context.
    pub fn take(&self) {
        while self
            .raised
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Lowers the signal without waiting
    ///
    /// This function is intended to be used between unit tests.
    #[doc(hidden)]
    pub fn reset(&self) {
        self.raised.store(false, Ordering::Relaxed);
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_after_give() {
        let sig = Signal::new();
        sig.give();
        sig.take();

        // The signal auto-lowers; a second give is needed for a second take
        sig.give();
        sig.take();
    }

    #[test]
    fn test_reset_lowers() {
        let sig = Signal::new();
        sig.give();
        sig.reset();

        sig.give();
        sig.take();
    }
}
