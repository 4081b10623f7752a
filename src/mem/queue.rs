//! Lock-free SPSC node queue with the peek-then-dequeue consumer contract
//!
//! This is the queue used to hand nodes between execution contexts: the
//! radio interrupt enqueues RX nodes for the high priority deferred
//! context, the deferred context enqueues completed nodes for the thread
//! context, and the TX path hands nodes the opposite way.
//!
//! The consumer always inspects the head with [`peek`](Memq::peek) and only
//! commits with [`dequeue`](Memq::dequeue) after the node has been fully
//! processed, so the producer side is never blocked and a consumer
//! interrupted mid-processing leaves the queue consistent.

use super::OwnerTag;
use crate::context::ContextId;
use crate::error::Error;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

/// SPSC node queue of up to `N - 1` elements of copyable `T`; one slot
/// stays empty to tell a full queue from an empty one
pub struct Memq<T: Copy, const N: usize> {
    head: AtomicUsize,
    tail: AtomicUsize,
    links: [UnsafeCell<MaybeUninit<T>>; N],
    producer: OwnerTag,
    consumer: OwnerTag,
}

// Safety: same argument as for `fifo::Fifo` - disjoint index ownership plus
// acquire/release ordering on the indexes.
unsafe impl<T: Copy + Send, const N: usize> Sync for Memq<T, N> {}

impl<T: Copy, const N: usize> Memq<T, N> {
    #[allow(clippy::declare_interior_mutable_const)]
    const LINK_INIT: UnsafeCell<MaybeUninit<T>> = UnsafeCell::new(MaybeUninit::uninit());

    /// Creates an empty queue
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            links: [Self::LINK_INIT; N],
            producer: OwnerTag::new(),
            consumer: OwnerTag::new(),
        }
    }

    /// Appends a node at the tail
    ///
    /// Fails with [`Error::NoMemory`] when the queue is full; the caller is
    /// expected to retry at its next scheduling opportunity.
    pub fn enqueue(&self, node: T) -> Result<(), Error> {
        self.producer.check();

        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % N;

        if next == self.head.load(Ordering::Acquire) {
            return Err(Error::NoMemory);
        }

        // Safety: the slot at `tail` is invisible to the consumer until the
        // release store below
        unsafe { (*self.links[tail].get()).write(node) };

        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Returns the head node without consuming it
    pub fn peek(&self) -> Option<T> {
        self.consumer.check();

        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        // Safety: `head != tail` proves the producer published this slot
        Some(unsafe { (*self.links[head].get()).assume_init() })
    }

    /// Removes the head node
    ///
    /// Must only be called after [`peek`](Memq::peek) returned the node and
    /// the caller finished processing it.
    pub fn dequeue(&self) -> Option<T> {
        let node = self.peek()?;

        let head = self.head.load(Ordering::Relaxed);
        self.head.store((head + 1) % N, Ordering::Release);

        Some(node)
    }

    /// Checks whether the queue holds no nodes
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::Relaxed)
    }

    /// Number of nodes currently queued
    pub fn count(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        (tail + N - head) % N
    }

    /// Hands the consumer side over to the passed context
    ///
    /// Teardown paths drain a queue after its consuming context was
    /// disabled; the debug ownership record follows the new consumer.
    pub(crate) fn consumer_rebind(&self, id: ContextId) {
        self.consumer.bind(id);
    }

    /// Empties the queue and forgets the producer/consumer bindings
    ///
    /// This function is intended to be used by `ll_reset` and between unit
    /// tests.
    pub fn reset(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.producer.unbind();
        self.consumer.unbind();
    }
}
