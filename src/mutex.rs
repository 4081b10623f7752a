//! Mutex ensuring that access to variables shared with link layer IRQs is mutually exclusive
//!
//! This mutex requires proof of disabled IRQs provided by the `CriticalSection`'s lock.
//! It is a borrow guard, not a blocking lock: no execution context ever waits on it.

use crate::crit_sect::CriticalSection;
use core::cell::{Ref, RefCell, RefMut};

// TODO: create Mutexes for specific IRQs, or lists of IRQs like radio + counter
/// Wraps a variable which is accessible from an IRQ
pub struct Mutex<T>(RefCell<T>);

impl<T> Mutex<T> {
    /// Creates new wrapper for a variable accessible from an IRQ
    ///
    /// # Example
    ///
    /// ```
    /// use nrf_ble_ll::mutex::Mutex;
    ///
    /// static EVENT_PENDING: Mutex<bool> = Mutex::new(false);
    /// ```
    pub const fn new(value: T) -> Mutex<T> {
        Self(RefCell::new(value))
    }

    /// Borrows Mutex's internal variable with mutually exclusive access
    ///
    /// # Example
    ///
    /// ```
    /// use nrf_ble_ll::crit_sect;
    /// use nrf_ble_ll::mutex::Mutex;
    ///
    /// static EVENT_COUNTER: Mutex<u16> = Mutex::new(15);
    ///
    /// crit_sect::locked(|cs_token| {
    ///   assert_eq!(*EVENT_COUNTER.borrow(cs_token), 15);
    /// });
    /// ```
    pub fn borrow<'cs>(&'cs self, _cs: &'cs CriticalSection) -> Ref<'cs, T> {
        self.0.borrow()
    }

    /// Mutably borrows Mutex's internal variable with mutually exclusive access
    ///
    /// # Example
    ///
    /// ```
    /// use nrf_ble_ll::crit_sect;
    /// use nrf_ble_ll::mutex::Mutex;
    ///
    /// static EVENT_PENDING: Mutex<bool> = Mutex::new(false);
    ///
    /// crit_sect::locked(|cs_token| {
    ///   *EVENT_PENDING.borrow_mut(cs_token) = true;
    /// });
    /// ```
    pub fn borrow_mut<'cs>(&'cs self, _cs: &'cs CriticalSection) -> RefMut<'cs, T> {
        self.0.borrow_mut()
    }
}

// Safety: Mutex is Sync assuming the contained type is Send and the CriticalSection module
// prevents concurrent access to Mutex from multiple contexts. This assumption is verified
// run-time by the RefCell used inside the mutex.
unsafe impl<T> Sync for Mutex<T> where T: Send {}
