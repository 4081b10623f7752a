//! Critical sections protecting data shared with link layer IRQs
//!
//! On hardware all relevant IRQs are blocked by disabling interrupts globally.
//! On the mocked platform tests run single-threaded and drive each execution
//! context explicitly, so the critical section degenerates to a plain call.

// TODO: Block only the IRQs which can touch link layer data (RADIO, RTC, SWIs)
//       instead of disabling all interrupts

/// Token proving that the holder executes inside a critical section
pub struct CriticalSection<'a> {
    #[cfg(not(feature = "mocked_platform"))]
    _internal_cs: &'a cortex_m::interrupt::CriticalSection,
    #[cfg(feature = "mocked_platform")]
    _internal_cs: core::marker::PhantomData<&'a ()>,
}

/// Runs the passed closure inside a critical section
///
/// The closure gets a [`CriticalSection`] token which can be used to borrow
/// data from [`Mutex`](crate::mutex::Mutex) instances.
pub fn locked<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    #[cfg(not(feature = "mocked_platform"))]
    {
        cortex_m::interrupt::free(|cs| f(&CriticalSection { _internal_cs: cs }))
    }

    #[cfg(feature = "mocked_platform")]
    {
        f(&CriticalSection {
            _internal_cs: core::marker::PhantomData,
        })
    }
}
