//! Radio sequencing capability consumed by the connection LLL
//!
//! The link layer does not own a radio driver; it sequences calls into an
//! opaque capability implementing [`traits::RadioOps`] and reacts to the
//! completion events the platform routes into
//! [`lll::radio_isr`](crate::lll::radio_isr). On the mocked platform the
//! capability is a scripted [`mock_radio::MockRadio`] the unit tests steer
//! packet by packet.

pub mod traits;

#[cfg(feature = "mocked_platform")]
pub mod mock_radio;

/// Radio PHY selection for a connection event
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Phy {
    /// LE 1M, the only PHY mandatory for every controller
    #[default]
    One,
    /// LE 2M
    Two,
}

impl defmt::Format for Phy {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Phy::One => defmt::write!(fmt, "1M"),
            Phy::Two => defmt::write!(fmt, "2M"),
        }
    }
}
