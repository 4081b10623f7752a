//! Fixed-capacity slot pool with generation-checked references
//!
//! The pool partitions its storage into `N` slots at compile time. A
//! successful [`acquire`](Pool::acquire) returns a small copyable
//! [`Ref`] - slot index plus a generation counter. Every later access
//! checks the generation, so a reference kept across a release of its slot
//! is rejected instead of silently aliasing the slot's next occupant.
//!
//! Acquire and release are O(1) and never block. An exhausted pool reports
//! [`Error::NoMemory`]; callers defer their work to the next opportunity.

use crate::error::Error;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Reference to an acquired pool slot
///
/// The reference is `Copy` and crosses execution contexts freely; only the
/// context currently owning the referenced object may access it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Ref {
    idx: u8,
    gen: u8,
}

impl Ref {
    /// Slot index of this reference
    ///
    /// Indexes are stable for the lifetime of the acquisition and are used
    /// where an external contract requires a plain integer (connection
    /// handles).
    pub fn idx(&self) -> usize {
        self.idx as usize
    }
}

impl defmt::Format for Ref {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Ref({}.{})", self.idx, self.gen);
    }
}

struct Slot<T> {
    taken: AtomicBool,
    gen: AtomicU8,
    item: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed slot arena for `N` instances of `T`
pub struct Pool<T, const N: usize> {
    slots: [Slot<T>; N],
}

// Safety: slot ownership is arbitrated by the `taken` atomics; an acquired
// slot is accessed by exactly one context at a time (the owner discipline
// documented on `with`). The generation check turns stale accesses into
// errors instead of races.
unsafe impl<T: Send, const N: usize> Sync for Pool<T, N> {}

impl<T, const N: usize> Pool<T, N> {
    const SLOT_INIT: Slot<T> = Slot {
        taken: AtomicBool::new(false),
        gen: AtomicU8::new(0),
        item: UnsafeCell::new(MaybeUninit::uninit()),
    };

    /// Creates an empty pool
    pub const fn new() -> Self {
        Self {
            slots: [Self::SLOT_INIT; N],
        }
    }

    /// Acquires a free slot and moves `init` into it
    ///
    /// Returns [`Error::NoMemory`] when all slots are taken.
    pub fn acquire(&self, init: T) -> Result<Ref, Error> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .taken
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // Safety: the CAS above makes this context the sole owner
                // of the slot until release
                unsafe { (*slot.item.get()).write(init) };

                return Ok(Ref {
                    idx: idx as u8,
                    gen: slot.gen.load(Ordering::Relaxed),
                });
            }
        }

        Err(Error::NoMemory)
    }

    /// Releases an acquired slot
    ///
    /// The slot's generation is advanced so all outstanding copies of the
    /// reference become stale. Releasing a stale reference reports
    /// [`Error::StaleRef`].
    pub fn release(&self, r: Ref) -> Result<(), Error> {
        let slot = self.slot(r)?;

        // Safety: the generation check in slot() proved `r` is the live
        // acquisition of this slot; the caller is its sole owner
        unsafe { (*slot.item.get()).assume_init_drop() };

        slot.gen.fetch_add(1, Ordering::Relaxed);
        let was_taken = slot.taken.swap(false, Ordering::Release);
        assert!(was_taken);

        Ok(())
    }

    /// Runs `f` with exclusive access to the referenced item
    ///
    /// The pool does not track which context owns an acquired slot; callers
    /// must uphold the one-owner-at-a-time discipline (the same discipline
    /// the `taken` flag enforces at acquire time). Cross-context handoff of
    /// a [`Ref`] must happen through one of the SPSC queues.
    pub fn with<R>(&self, r: Ref, f: impl FnOnce(&mut T) -> R) -> Result<R, Error> {
        let slot = self.slot(r)?;

        // Safety: generation checked; exclusive access guaranteed by the
        // owner discipline documented above
        let item = unsafe { (*slot.item.get()).assume_init_mut() };

        Ok(f(item))
    }

    /// Number of slots currently free
    pub fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.taken.load(Ordering::Relaxed))
            .count()
    }

    /// Checks whether the referenced slot is still the live acquisition
    pub fn is_live(&self, r: Ref) -> bool {
        self.slot(r).is_ok()
    }

    /// Releases every slot regardless of outstanding references
    ///
    /// This function is intended to be used by `ll_reset` and between unit
    /// tests.
    pub fn reset(&self) {
        for slot in self.slots.iter() {
            if slot.taken.swap(false, Ordering::Release) {
                // Safety: the slot was taken, so it holds an initialized
                // item nobody will access again (all refs become stale)
                unsafe { (*slot.item.get()).assume_init_drop() };
                slot.gen.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn slot(&self, r: Ref) -> Result<&Slot<T>, Error> {
        let slot = self.slots.get(r.idx as usize).ok_or(Error::NotFound)?;

        if !slot.taken.load(Ordering::Acquire) || slot.gen.load(Ordering::Relaxed) != r.gen {
            return Err(Error::StaleRef);
        }

        Ok(slot)
    }
}
