//! Tick counter implementation using the RTC0 peripheral of nRF52840

#[cfg(not(feature = "nrf52840"))]
compile_error!("RtcCntr requires the nrf52840 platform");

use super::traits::CompareCounter;
use super::{Ticks, CNTR_MASK};
use crate::error::Error;
use core::ops::Deref;

use nrf52840_hal::pac::rtc0;
type RtcRegisterBlock = rtc0::RegisterBlock;

// RTC Periph Wrapper
// Allows overriding the RTC peripheral memory space with arbitrary memory
// (like an array) when this module is compiled into host-side tests of an
// external crate.
struct RtcPeriphWrapper {
    ptr: *const RtcRegisterBlock,
}

impl RtcPeriphWrapper {
    pub fn new(rtc: &RtcRegisterBlock) -> Self {
        RtcPeriphWrapper { ptr: rtc }
    }
}

impl Deref for RtcPeriphWrapper {
    type Target = RtcRegisterBlock;
    fn deref(&self) -> &Self::Target {
        // Safety: the pointer was created from a reference to a static
        // peripheral block and stays valid for the lifetime of the chip
        unsafe { &*self.ptr }
    }
}

// Safety: register accesses of this peripheral are single-word reads and
// writes; the ticker serializes all mutating calls through its job context
unsafe impl Send for RtcPeriphWrapper {}
unsafe impl Sync for RtcPeriphWrapper {}

/// Tick counter running on RTC0
pub struct RtcCntr {
    rtc: RtcPeriphWrapper,
}

impl RtcCntr {
    /// Creates a new counter wrapping the passed RTC peripheral
    ///
    /// The LFCLK must be running before the counter is started; this module
    /// does not manage the clock source.
    pub fn new(rtc: &RtcRegisterBlock) -> Self {
        let cntr = Self {
            rtc: RtcPeriphWrapper::new(rtc),
        };

        // Run at the full 32768 Hz resolution
        cntr.rtc.prescaler.write(|w| unsafe { w.prescaler().bits(0) });

        cntr
    }

    fn compare_event_clear(&self) {
        self.rtc.events_compare[0].write(|w| w.events_compare().clear_bit());
    }
}

impl CompareCounter for RtcCntr {
    fn start(&self) -> Result<(), Error> {
        self.rtc.tasks_start.write(|w| w.tasks_start().set_bit());
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        self.rtc.tasks_stop.write(|w| w.tasks_stop().set_bit());
        Ok(())
    }

    fn now(&self) -> Ticks {
        self.rtc.counter.read().counter().bits() & CNTR_MASK
    }

    fn compare_set(&self, at: Ticks) -> Result<(), Error> {
        self.compare_event_clear();
        self.rtc.cc[0].write(|w| unsafe { w.compare().bits(at & CNTR_MASK) });
        self.rtc.intenset.write(|w| w.compare0().set_bit());
        Ok(())
    }

    fn compare_clear(&self) {
        self.rtc.intenclr.write(|w| w.compare0().set_bit());
        self.compare_event_clear();
    }
}
