//! Data channel PDU layout
//!
//! Only the fields the connection event engine touches are modeled: the
//! two-byte data channel header with its ARQ bits, the control PDUs the
//! engine itself originates or reacts to (TERMINATE_IND, CONN_UPDATE_IND)
//! and the CONNECT_IND parameter block handed over by the advertising or
//! initiating role. All other control PDU payloads pass through the engine
//! opaque.

use crate::error::Error;
use core::convert::TryFrom;

/// Size of the data channel PDU header
pub const DC_HEADER_SIZE: usize = 2;

const LLID_MASK: u8 = 0b0000_0011;
const NESN_BIT: u8 = 0b0000_0100;
const SN_BIT: u8 = 0b0000_1000;
const MD_BIT: u8 = 0b0001_0000;

const LEN_OFFSET: usize = 1;
const PAYLOAD_OFFSET: usize = DC_HEADER_SIZE;

/// Size of the CONNECT_IND parameter block (LLData)
pub const CONNECT_IND_LLDATA_SIZE: usize = 22;

/// Connection terminate reason codes surfaced to the host
pub mod reason {
    /// Connection timeout (supervision timeout)
    pub const CONN_TIMEOUT: u8 = 0x08;
    /// Remote user terminated connection
    pub const REMOTE_USER_TERM: u8 = 0x13;
    /// Connection terminated by local host
    pub const LOCAL_HOST_TERM: u8 = 0x16;
    /// LMP/LL response timeout
    pub const LL_RESP_TIMEOUT: u8 = 0x22;
    /// Connection failed to be established
    pub const CONN_FAILED_TO_ESTABLISH: u8 = 0x3E;
}

/// LLID field of the data channel PDU header
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Llid {
    /// Continuation fragment of an L2CAP message, or an empty PDU
    DataContinue,
    /// Start of an L2CAP message or a complete L2CAP message
    DataStart,
    /// LL control PDU
    Control,
}

impl TryFrom<u8> for Llid {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self, Error> {
        match bits & LLID_MASK {
            0b01 => Ok(Llid::DataContinue),
            0b10 => Ok(Llid::DataStart),
            0b11 => Ok(Llid::Control),
            _ => Err(Error::InvalidParam),
        }
    }
}

impl Llid {
    fn bits(self) -> u8 {
        match self {
            Llid::DataContinue => 0b01,
            Llid::DataStart => 0b10,
            Llid::Control => 0b11,
        }
    }
}

/// Decoded data channel PDU header
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DataHeader {
    /// PDU type within the data channel
    pub llid: Llid,
    /// Next expected sequence number bit
    pub nesn: bool,
    /// Sequence number bit
    pub sn: bool,
    /// More data bit
    pub md: bool,
    /// Payload length in octets
    pub len: u8,
}

impl DataHeader {
    /// Decodes the header from the first two octets of a PDU buffer
    pub fn parse(pdu: &[u8]) -> Result<Self, Error> {
        if pdu.len() < DC_HEADER_SIZE {
            return Err(Error::InvalidParam);
        }

        Ok(Self {
            llid: Llid::try_from(pdu[0])?,
            nesn: pdu[0] & NESN_BIT != 0,
            sn: pdu[0] & SN_BIT != 0,
            md: pdu[0] & MD_BIT != 0,
            len: pdu[LEN_OFFSET],
        })
    }

    /// Encodes the header into the first two octets of a PDU buffer
    pub fn write(&self, pdu: &mut [u8]) {
        pdu[0] = self.llid.bits()
            | if self.nesn { NESN_BIT } else { 0 }
            | if self.sn { SN_BIT } else { 0 }
            | if self.md { MD_BIT } else { 0 };
        pdu[LEN_OFFSET] = self.len;
    }

    /// Builds an empty PDU header carrying only the ARQ bits
    pub fn empty(sn: bool, nesn: bool) -> Self {
        Self {
            llid: Llid::DataContinue,
            nesn,
            sn,
            md: false,
            len: 0,
        }
    }
}

impl defmt::Format for DataHeader {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "DC(sn={} nesn={} md={} len={})",
            self.sn as u8,
            self.nesn as u8,
            self.md as u8,
            self.len
        );
    }
}

/// Control PDUs the connection event engine understands
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CtrlPdu {
    /// LL_CONNECTION_UPDATE_IND
    ConnUpdateInd {
        /// Transmit window size, 1.25 ms units
        win_size: u8,
        /// Transmit window offset, 1.25 ms units
        win_offset: u16,
        /// New connection interval, 1.25 ms units
        interval: u16,
        /// New peripheral latency, in connection events
        latency: u16,
        /// New supervision timeout, 10 ms units
        timeout: u16,
        /// Connection event count at which the new parameters apply
        instant: u16,
    },
    /// LL_TERMINATE_IND
    TerminateInd {
        /// Reason the sender closes the connection
        error_code: u8,
    },
}

const CTRL_OPCODE_CONN_UPDATE_IND: u8 = 0x00;
const CTRL_OPCODE_TERMINATE_IND: u8 = 0x02;

impl CtrlPdu {
    /// Decodes a control PDU payload (the octets following the header)
    ///
    /// Control PDUs not originated or consumed by the event engine report
    /// [`Error::NotFound`] and pass through opaque.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.is_empty() {
            return Err(Error::InvalidParam);
        }

        match payload[0] {
            CTRL_OPCODE_CONN_UPDATE_IND => {
                if payload.len() < 12 {
                    return Err(Error::InvalidParam);
                }
                Ok(CtrlPdu::ConnUpdateInd {
                    win_size: payload[1],
                    win_offset: u16::from_le_bytes([payload[2], payload[3]]),
                    interval: u16::from_le_bytes([payload[4], payload[5]]),
                    latency: u16::from_le_bytes([payload[6], payload[7]]),
                    timeout: u16::from_le_bytes([payload[8], payload[9]]),
                    instant: u16::from_le_bytes([payload[10], payload[11]]),
                })
            }
            CTRL_OPCODE_TERMINATE_IND => {
                if payload.len() < 2 {
                    return Err(Error::InvalidParam);
                }
                Ok(CtrlPdu::TerminateInd {
                    error_code: payload[1],
                })
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Encodes this control PDU into `pdu` (header plus payload), returning
    /// the payload length written
    pub fn write(&self, pdu: &mut [u8]) -> u8 {
        let payload = &mut pdu[PAYLOAD_OFFSET..];

        let len = match self {
            CtrlPdu::ConnUpdateInd {
                win_size,
                win_offset,
                interval,
                latency,
                timeout,
                instant,
            } => {
                payload[0] = CTRL_OPCODE_CONN_UPDATE_IND;
                payload[1] = *win_size;
                payload[2..4].copy_from_slice(&win_offset.to_le_bytes());
                payload[4..6].copy_from_slice(&interval.to_le_bytes());
                payload[6..8].copy_from_slice(&latency.to_le_bytes());
                payload[8..10].copy_from_slice(&timeout.to_le_bytes());
                payload[10..12].copy_from_slice(&instant.to_le_bytes());
                12
            }
            CtrlPdu::TerminateInd { error_code } => {
                payload[0] = CTRL_OPCODE_TERMINATE_IND;
                payload[1] = *error_code;
                2
            }
        };

        DataHeader {
            llid: Llid::Control,
            nesn: false,
            sn: false,
            md: false,
            len,
        }
        .write(pdu);

        len
    }

    /// Checks whether a ctrl payload is a TERMINATE_IND without fully
    /// decoding it
    pub fn is_terminate_ind(payload: &[u8]) -> bool {
        !payload.is_empty() && payload[0] == CTRL_OPCODE_TERMINATE_IND
    }
}

/// CONNECT_IND parameters relevant to the connection event engine
///
/// The advertising/initiating role (outside this crate) receives or builds
/// the PDU; the engine consumes the decoded block.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectInd {
    /// Access address of the new connection
    pub access_addr: [u8; 4],
    /// CRC initialization value
    pub crc_init: [u8; 3],
    /// Transmit window size, 1.25 ms units
    pub win_size: u8,
    /// Transmit window offset, 1.25 ms units
    pub win_offset: u16,
    /// Connection interval, 1.25 ms units
    pub interval: u16,
    /// Peripheral latency, in connection events
    pub latency: u16,
    /// Supervision timeout, 10 ms units
    pub timeout: u16,
    /// Data channel map, 37 valid bits
    pub chan_map: [u8; 5],
    /// Hop increment, 5 .. 16
    pub hop: u8,
    /// Central's sleep clock accuracy category, 0 .. 7
    pub sca: u8,
}

impl ConnectInd {
    /// Decodes the LLData block of a CONNECT_IND PDU
    pub fn parse(lldata: &[u8]) -> Result<Self, Error> {
        if lldata.len() < CONNECT_IND_LLDATA_SIZE {
            return Err(Error::InvalidParam);
        }

        let hop_sca = lldata[21];

        Ok(Self {
            access_addr: [lldata[0], lldata[1], lldata[2], lldata[3]],
            crc_init: [lldata[4], lldata[5], lldata[6]],
            win_size: lldata[7],
            win_offset: u16::from_le_bytes([lldata[8], lldata[9]]),
            interval: u16::from_le_bytes([lldata[10], lldata[11]]),
            latency: u16::from_le_bytes([lldata[12], lldata[13]]),
            timeout: u16::from_le_bytes([lldata[14], lldata[15]]),
            chan_map: [
                lldata[16], lldata[17], lldata[18], lldata[19], lldata[20],
            ],
            hop: hop_sca & 0x1F,
            sca: (hop_sca >> 5) & 0x07,
        })
    }

    /// Number of data channels enabled in the channel map
    pub fn chan_count(&self) -> u8 {
        self.chan_map
            .iter()
            .map(|octet| octet.count_ones() as u8)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_header_roundtrip() {
        let hdr = DataHeader {
            llid: Llid::DataStart,
            nesn: true,
            sn: false,
            md: true,
            len: 27,
        };

        let mut pdu = [0u8; DC_HEADER_SIZE];
        hdr.write(&mut pdu);
        assert_eq!(DataHeader::parse(&pdu).unwrap(), hdr);
    }

    #[test]
    fn test_empty_pdu_header() {
        let hdr = DataHeader::empty(true, true);
        assert_eq!(hdr.llid, Llid::DataContinue);
        assert_eq!(hdr.len, 0);
        assert!(!hdr.md);
    }

    #[test]
    fn test_invalid_llid_rejected() {
        let pdu = [0b0000_0000u8, 0];
        assert_eq!(DataHeader::parse(&pdu), Err(Error::InvalidParam));
    }

    #[test]
    fn test_terminate_ind_roundtrip() {
        let ctrl = CtrlPdu::TerminateInd {
            error_code: reason::REMOTE_USER_TERM,
        };

        let mut pdu = [0u8; 8];
        let len = ctrl.write(&mut pdu);
        assert_eq!(len, 2);

        let hdr = DataHeader::parse(&pdu).unwrap();
        assert_eq!(hdr.llid, Llid::Control);
        assert_eq!(hdr.len, 2);
        assert!(CtrlPdu::is_terminate_ind(&pdu[DC_HEADER_SIZE..]));
        assert_eq!(CtrlPdu::parse(&pdu[DC_HEADER_SIZE..]).unwrap(), ctrl);
    }

    #[test]
    fn test_conn_update_ind_roundtrip() {
        let ctrl = CtrlPdu::ConnUpdateInd {
            win_size: 1,
            win_offset: 2,
            interval: 40,
            latency: 3,
            timeout: 100,
            instant: 0x1234,
        };

        let mut pdu = [0u8; 16];
        let len = ctrl.write(&mut pdu);
        assert_eq!(len, 12);
        assert_eq!(CtrlPdu::parse(&pdu[DC_HEADER_SIZE..]).unwrap(), ctrl);
    }

    #[test]
    fn test_unknown_ctrl_opcode_passes_through() {
        // LL_CHANNEL_MAP_IND is not consumed by the event engine
        let payload = [0x01u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(CtrlPdu::parse(&payload), Err(Error::NotFound));
    }

    #[test]
    fn test_connect_ind_parse() {
        let mut lldata = [0u8; CONNECT_IND_LLDATA_SIZE];
        lldata[0..4].copy_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        lldata[4..7].copy_from_slice(&[0xAA, 0xBB, 0xCC]);
        lldata[7] = 2; // win_size
        lldata[8..10].copy_from_slice(&5u16.to_le_bytes());
        lldata[10..12].copy_from_slice(&40u16.to_le_bytes());
        lldata[12..14].copy_from_slice(&1u16.to_le_bytes());
        lldata[14..16].copy_from_slice(&200u16.to_le_bytes());
        lldata[16..21].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);
        lldata[21] = (1 << 5) | 9; // sca 1, hop 9

        let ci = ConnectInd::parse(&lldata).unwrap();
        assert_eq!(ci.access_addr, [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(ci.interval, 40);
        assert_eq!(ci.timeout, 200);
        assert_eq!(ci.hop, 9);
        assert_eq!(ci.sca, 1);
        assert_eq!(ci.chan_count(), 37);
    }
}
