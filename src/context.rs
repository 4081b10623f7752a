//! Execution context identities
//!
//! The link layer runs in four statically prioritized execution contexts.
//! On hardware each context is an IRQ priority level (radio IRQ, two
//! software IRQs) plus thread mode; on the mocked platform the test harness
//! marks the context it is about to drive.
//!
//! The identities serve two purposes: they index the mayfly caller/callee
//! queues, and in debug builds they back the single-producer/single-consumer
//! ownership checks of the lock-free queues in [`mem`](crate::mem).

use core::sync::atomic::{AtomicU8, Ordering};

/// One of the statically prioritized execution contexts
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum ContextId {
    /// Radio interrupt context, the highest priority
    Lll = 0,
    /// High priority deferred context
    UllHigh = 1,
    /// Low priority deferred context
    UllLow = 2,
    /// Ordinary thread context, the only context allowed to block
    Thread = 3,
}

/// Number of execution contexts
pub const CONTEXT_COUNT: usize = 4;

impl ContextId {
    /// All contexts, highest priority first
    pub const ALL: [ContextId; CONTEXT_COUNT] = [
        ContextId::Lll,
        ContextId::UllHigh,
        ContextId::UllLow,
        ContextId::Thread,
    ];

    fn from_u8(id: u8) -> ContextId {
        match id {
            0 => ContextId::Lll,
            1 => ContextId::UllHigh,
            2 => ContextId::UllLow,
            _ => ContextId::Thread,
        }
    }
}

impl defmt::Format for ContextId {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            ContextId::Lll => defmt::write!(fmt, "LLL"),
            ContextId::UllHigh => defmt::write!(fmt, "ULL_HIGH"),
            ContextId::UllLow => defmt::write!(fmt, "ULL_LOW"),
            ContextId::Thread => defmt::write!(fmt, "THREAD"),
        }
    }
}

static CURRENT: AtomicU8 = AtomicU8::new(ContextId::Thread as u8);

/// Marks the context the caller is entering, returning the previous one
///
/// Called by the mayfly drain loop and by the IRQ entry stubs. The mocked
/// platform's tests call it directly to impersonate a context.
pub fn enter(id: ContextId) -> ContextId {
    ContextId::from_u8(CURRENT.swap(id as u8, Ordering::Relaxed))
}

/// Restores a context marker previously returned by [`enter`]
pub fn leave(id: ContextId) {
    CURRENT.store(id as u8, Ordering::Relaxed);
}

/// Returns the context the caller currently executes in
pub fn current() -> ContextId {
    ContextId::from_u8(CURRENT.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_enter_returns_previous_context() {
        leave(ContextId::Thread);

        let prev = enter(ContextId::UllHigh);
        assert_eq!(prev, ContextId::Thread);
        assert_eq!(current(), ContextId::UllHigh);

        leave(prev);
        assert_eq!(current(), ContextId::Thread);
    }

    #[test]
    #[serial]
    fn test_nested_contexts_unwind() {
        leave(ContextId::Thread);

        let outer = enter(ContextId::UllLow);
        let inner = enter(ContextId::Lll);
        assert_eq!(inner, ContextId::UllLow);

        leave(inner);
        assert_eq!(current(), ContextId::UllLow);
        leave(outer);
        assert_eq!(current(), ContextId::Thread);
    }
}
