#![cfg_attr(not(any(test, doctest)), no_std)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::missing_doc_code_examples)]

//! Bluetooth Low Energy link layer for Nordic nRF SoCs.
//!
//! The crate implements the connection event engine of a BLE controller,
//! split the way the real-time budget dictates: the lower link layer
//! ([`lll`]) drives the radio from interrupt context, the upper link layer
//! ([`ull`]) runs per-connection timeouts, queues and teardown from two
//! deferred software contexts, and the [`ticker`] multiplexes every timing
//! obligation onto one low power counter. The contexts communicate only
//! through the [`mayfly`] deferred-call queues and the lock-free
//! structures in [`mem`]; nothing in the crate takes a blocking lock.
//!
//! The layers above and below are consumed as capabilities: the HCI layer
//! drives the thin command surface in [`ll`], and the radio and counter
//! peripherals are traits in [`hw`] implemented by the platform (or by
//! mocks on the host, where all unit tests run).

#[cfg(not(any(feature = "mocked_platform", feature = "nrf52840")))]
compile_error!("One platform must be enabled as a build feature");

#[cfg(all(feature = "mocked_platform", feature = "nrf52840"))]
compile_error!("Cannot enable multiple platforms simultaneously (mocked and nrf52840)");

#[cfg(all(test, not(feature = "mocked_platform")))]
compile_error!("For tests \"mocked_platform\" feature shall be selected");

pub mod config;
pub mod context;
pub mod crit_sect;
pub mod hw;
pub mod ll;
pub mod lll;
pub mod mayfly;
pub mod mem;
pub mod mutex;
pub mod pdu;
pub mod sync;
pub mod ticker;
pub mod ull;

/// Defines errors reported by this crate
pub mod error;
