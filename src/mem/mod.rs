//! Heapless memory management primitives
//!
//! Everything that looks dynamic in the link layer is backed by the three
//! structures in this module:
//!
//! * [`pool::Pool`] - a fixed slot arena handing out generation-checked
//!   references instead of pointers
//! * [`fifo::Fifo`] - a lock-free index-based ring for small copyable
//!   elements crossing context boundaries
//! * [`queue::Memq`] - a lock-free queue with the peek-then-dequeue
//!   consumer contract used for node handoff between contexts
//!
//! None of them ever blocks or grows; exhaustion is reported to the caller
//! as a first-class condition and handled by deferring work to the next
//! radio event.
//!
//! The FIFO and the queue are safe only under single-producer /
//! single-consumer discipline, one execution context per side. Debug builds
//! record the first producer and consumer [context](crate::context) of each
//! instance and assert that no other context ever touches that side.

pub mod fifo;
pub mod pool;
pub mod queue;

use crate::context::{self, ContextId};
use core::sync::atomic::{AtomicU8, Ordering};

const OWNER_UNBOUND: u8 = 0xFF;

/// Debug-build record of which context owns one side of a SPSC structure
pub(crate) struct OwnerTag {
    id: AtomicU8,
}

impl OwnerTag {
    pub(crate) const fn new() -> Self {
        Self {
            id: AtomicU8::new(OWNER_UNBOUND),
        }
    }

    /// Binds the tag to the current context on first use, asserts identity
    /// afterwards
    #[inline]
    pub(crate) fn check(&self) {
        if cfg!(debug_assertions) {
            let current = context::current() as u8;
            match self
                .id
                .compare_exchange(OWNER_UNBOUND, current, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => (),
                Err(owner) => {
                    debug_assert_eq!(owner, current, "SPSC side used from two contexts")
                }
            }
        }
    }

    /// Forgets the binding, allowing a new owner (used by reset paths)
    pub(crate) fn unbind(&self) {
        self.id.store(OWNER_UNBOUND, Ordering::Relaxed);
    }

    /// Rebinds the tag to an explicit context
    pub(crate) fn bind(&self, id: ContextId) {
        self.id.store(id as u8, Ordering::Relaxed);
    }
}
