//! Lock-free index-based SPSC ring
//!
//! The ring holds up to `S - 1` elements; one slot always stays empty to
//! tell a full ring from an empty one without a shared counter. The
//! producer only writes `last`, the consumer only writes `first`, so no
//! atomicity beyond single-word loads and stores is required as long as the
//! single-producer/single-consumer discipline holds.
//!
//! Used where small copyable values cross a context boundary: free-buffer
//! distribution, the TX acknowledgement path, ticker operation slots.

use super::OwnerTag;
use crate::error::Error;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

/// SPSC ring of `S - 1` elements of copyable `T`
pub struct Fifo<T: Copy, const S: usize> {
    first: AtomicUsize,
    last: AtomicUsize,
    buf: [UnsafeCell<MaybeUninit<T>>; S],
    producer: OwnerTag,
    consumer: OwnerTag,
}

// Safety: the producer context exclusively writes slots between `last` and
// `first - 1`, the consumer context exclusively reads slots between `first`
// and `last - 1`; the acquire/release pairs on the index atomics order the
// slot contents between the two contexts.
unsafe impl<T: Copy + Send, const S: usize> Sync for Fifo<T, S> {}

impl<T: Copy, const S: usize> Fifo<T, S> {
    #[allow(clippy::declare_interior_mutable_const)]
    const CELL_INIT: UnsafeCell<MaybeUninit<T>> = UnsafeCell::new(MaybeUninit::uninit());

    /// Creates an empty ring
    pub const fn new() -> Self {
        Self {
            first: AtomicUsize::new(0),
            last: AtomicUsize::new(0),
            buf: [Self::CELL_INIT; S],
            producer: OwnerTag::new(),
            consumer: OwnerTag::new(),
        }
    }

    /// Appends an element, failing with [`Error::NoMemory`] when full
    pub fn enqueue(&self, item: T) -> Result<(), Error> {
        self.producer.check();

        let last = self.last.load(Ordering::Relaxed);
        let next = (last + 1) % S;

        if next == self.first.load(Ordering::Acquire) {
            return Err(Error::NoMemory);
        }

        // Safety: the slot at `last` is outside the consumer's window until
        // the store to `last` below publishes it
        unsafe { (*self.buf[last].get()).write(item) };

        self.last.store(next, Ordering::Release);
        Ok(())
    }

    /// Returns the oldest element without consuming it
    pub fn peek(&self) -> Option<T> {
        self.consumer.check();

        let first = self.first.load(Ordering::Relaxed);
        if first == self.last.load(Ordering::Acquire) {
            return None;
        }

        // Safety: `first != last` proves the slot was published by the
        // producer's release store
        Some(unsafe { (*self.buf[first].get()).assume_init() })
    }

    /// Removes and returns the oldest element
    pub fn dequeue(&self) -> Option<T> {
        let item = self.peek()?;

        let first = self.first.load(Ordering::Relaxed);
        self.first.store((first + 1) % S, Ordering::Release);

        Some(item)
    }

    /// Number of elements currently queued
    pub fn count(&self) -> usize {
        let first = self.first.load(Ordering::Relaxed);
        let last = self.last.load(Ordering::Relaxed);
        (last + S - first) % S
    }

    /// Number of free element slots
    pub fn available(&self) -> usize {
        S - 1 - self.count()
    }

    /// Checks whether the ring holds no elements
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Empties the ring and forgets the producer/consumer bindings
    ///
    /// This function is intended to be used by `ll_reset` and between unit
    /// tests.
    pub fn reset(&self) {
        self.first.store(0, Ordering::Relaxed);
        self.last.store(0, Ordering::Relaxed);
        self.producer.unbind();
        self.consumer.unbind();
    }
}

// The tests share the process-wide context marker through the ownership
// tags, so they are serialized like every other context-sensitive test
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_enqueue_and_dequeue_in_order() {
        let fifo: Fifo<u32, 4> = Fifo::new();

        fifo.enqueue(1).unwrap();
        fifo.enqueue(2).unwrap();
        fifo.enqueue(3).unwrap();

        assert_eq!(fifo.dequeue(), Some(1));
        assert_eq!(fifo.dequeue(), Some(2));
        assert_eq!(fifo.dequeue(), Some(3));
        assert_eq!(fifo.dequeue(), None);
    }

    #[test]
    #[serial]
    fn test_enqueue_to_full_ring_fails_cleanly() {
        let fifo: Fifo<u32, 4> = Fifo::new();

        fifo.enqueue(1).unwrap();
        fifo.enqueue(2).unwrap();
        fifo.enqueue(3).unwrap();

        assert_eq!(fifo.enqueue(4), Err(Error::NoMemory));
        assert_eq!(fifo.count(), 3);
        assert_eq!(fifo.dequeue(), Some(1));
        fifo.enqueue(4).unwrap();
        assert_eq!(fifo.count(), 3);
    }

    #[test]
    #[serial]
    fn test_peek_does_not_consume() {
        let fifo: Fifo<u32, 4> = Fifo::new();

        fifo.enqueue(9).unwrap();
        assert_eq!(fifo.peek(), Some(9));
        assert_eq!(fifo.peek(), Some(9));
        assert_eq!(fifo.dequeue(), Some(9));
        assert_eq!(fifo.peek(), None);
    }

    #[test]
    #[serial]
    fn test_wraparound_preserves_order() {
        let fifo: Fifo<u32, 3> = Fifo::new();

        for round in 0..10u32 {
            fifo.enqueue(round * 2).unwrap();
            fifo.enqueue(round * 2 + 1).unwrap();
            assert_eq!(fifo.dequeue(), Some(round * 2));
            assert_eq!(fifo.dequeue(), Some(round * 2 + 1));
        }
        assert!(fifo.is_empty());
    }

    #[test]
    #[serial]
    fn test_available_accounting() {
        let fifo: Fifo<u8, 5> = Fifo::new();

        assert_eq!(fifo.available(), 4);
        fifo.enqueue(0).unwrap();
        assert_eq!(fifo.available(), 3);
        fifo.reset();
        assert_eq!(fifo.available(), 4);
    }
}
