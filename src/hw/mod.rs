//! Hardware capabilities consumed by the link layer
//!
//! The link layer never touches peripheral registers directly. It consumes
//! two opaque capabilities:
//!
//! * [`cntr`] - the monotonically increasing tick counter with one compare
//!   trigger, consumed exclusively by the [ticker](crate::ticker)
//! * [`radio`] - the radio sequencing capability driven by the
//!   [connection LLL](crate::lll::conn)
//!
//! Each capability is a trait plus per-platform implementations selected by
//! build features, following the layout of the peripherals in the radio
//! driver this crate grew from.

pub mod cntr;
pub mod radio;
