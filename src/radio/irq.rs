//! # SX126x Interrupt Status Decoding
//!
//! The SX126x reports radio events through a 16-bit interrupt register. Only the
//! low ten bits carry events; everything above bit 9 is reserved and ignored here.
//!
//! ## Bit Assignments
//!
//! The layout is fixed by the chip and must never be renumbered:
//! ```text
//! Bit 15-10: Reserved (ignored)
//! Bit 9:  TimeoutRxOrTx - RX or TX operation timed out
//! Bit 8:  CadDetected - Channel Activity Detection triggered
//! Bit 7:  CadDone - Channel Activity Detection completed
//! Bit 6:  CrcError - CRC validation failed
//! Bit 5:  HeaderError - Packet header validation failed
//! Bit 4:  HeaderValid - Valid packet header received
//! Bit 3:  SyncWordValid - Valid sync word detected
//! Bit 2:  PreambleDetected - Preamble pattern detected
//! Bit 1:  RxDone - Packet reception completed
//! Bit 0:  TxDone - Packet transmission completed
//! ```
//!
//! ## Example
//!
//! ```rust
//! use sx126x_ctl::radio::irq::{StatusDecoder, StatusFlag, StatusFlags};
//!
//! let flags = StatusDecoder::decode(0b01_1000_0000);
//! assert_eq!(flags, StatusFlags::CAD_DONE | StatusFlags::CAD_DETECTED);
//! assert_eq!(flags.to_string(), "CadDone | CadDetected");
//! assert_eq!(flags.iter_flags().collect::<Vec<_>>(), [StatusFlag::CadDone, StatusFlag::CadDetected]);
//! ```

use bitflags::bitflags;
use std::fmt;

/// Mask of the bits that carry events.
pub const STATUS_MASK: u16 = 0x03FF;

/// A single named interrupt event
///
/// The discriminant is the bit position in the status register.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatusFlag {
    /// Transmission completed successfully
    TxDone = 0,
    /// Reception completed (packet received)
    RxDone = 1,
    /// Preamble pattern detected during reception
    PreambleDetected = 2,
    /// Valid sync word detected
    SyncWordValid = 3,
    /// Valid packet header received (LoRa explicit header)
    HeaderValid = 4,
    /// Packet header validation failed
    HeaderError = 5,
    /// CRC validation failed on received packet
    CrcError = 6,
    /// Channel Activity Detection scan completed
    CadDone = 7,
    /// Channel activity detected during CAD scan
    CadDetected = 8,
    /// RX or TX operation timed out
    TimeoutRxOrTx = 9,
}

impl StatusFlag {
    /// Every flag, in bit order.
    pub const ALL: [StatusFlag; 10] = [
        StatusFlag::TxDone,
        StatusFlag::RxDone,
        StatusFlag::PreambleDetected,
        StatusFlag::SyncWordValid,
        StatusFlag::HeaderValid,
        StatusFlag::HeaderError,
        StatusFlag::CrcError,
        StatusFlag::CadDone,
        StatusFlag::CadDetected,
        StatusFlag::TimeoutRxOrTx,
    ];

    /// Bit position in the status register
    pub const fn bit(self) -> u8 {
        self as u8
    }

    /// Register mask for this flag
    pub const fn mask(self) -> u16 {
        1 << (self as u8)
    }

    /// Stable display name
    pub const fn name(self) -> &'static str {
        match self {
            StatusFlag::TxDone => "TxDone",
            StatusFlag::RxDone => "RxDone",
            StatusFlag::PreambleDetected => "PreambleDetected",
            StatusFlag::SyncWordValid => "SyncWordValid",
            StatusFlag::HeaderValid => "HeaderValid",
            StatusFlag::HeaderError => "HeaderError",
            StatusFlag::CrcError => "CrcError",
            StatusFlag::CadDone => "CadDone",
            StatusFlag::CadDetected => "CadDetected",
            StatusFlag::TimeoutRxOrTx => "TimeoutRxOrTx",
        }
    }
}

impl fmt::Display for StatusFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Set of interrupt events decoded from the status register
    ///
    /// Also used as the IRQ routing mask for `SetDioIrqParams`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StatusFlags: u16 {
        const TX_DONE = 1 << 0;
        const RX_DONE = 1 << 1;
        const PREAMBLE_DETECTED = 1 << 2;
        const SYNC_WORD_VALID = 1 << 3;
        const HEADER_VALID = 1 << 4;
        const HEADER_ERROR = 1 << 5;
        const CRC_ERROR = 1 << 6;
        const CAD_DONE = 1 << 7;
        const CAD_DETECTED = 1 << 8;
        const TIMEOUT = 1 << 9;
    }
}

impl StatusFlags {
    /// Whether the named flag is set
    pub fn has(self, flag: StatusFlag) -> bool {
        self.bits() & flag.mask() != 0
    }

    /// Iterate over the set flags in ascending bit order
    pub fn iter_flags(self) -> impl Iterator<Item = StatusFlag> {
        StatusFlag::ALL.into_iter().filter(move |flag| self.has(*flag))
    }

    pub fn tx_done(self) -> bool {
        self.contains(Self::TX_DONE)
    }

    pub fn rx_done(self) -> bool {
        self.contains(Self::RX_DONE)
    }

    pub fn crc_error(self) -> bool {
        self.contains(Self::CRC_ERROR)
    }

    pub fn header_error(self) -> bool {
        self.contains(Self::HEADER_ERROR)
    }

    pub fn cad_done(self) -> bool {
        self.contains(Self::CAD_DONE)
    }

    pub fn cad_detected(self) -> bool {
        self.contains(Self::CAD_DETECTED)
    }

    pub fn timeout(self) -> bool {
        self.contains(Self::TIMEOUT)
    }
}

impl From<StatusFlag> for StatusFlags {
    fn from(flag: StatusFlag) -> Self {
        StatusFlags::from_bits_truncate(flag.mask())
    }
}

impl FromIterator<StatusFlag> for StatusFlags {
    fn from_iter<I: IntoIterator<Item = StatusFlag>>(iter: I) -> Self {
        iter.into_iter()
            .fold(StatusFlags::empty(), |acc, flag| acc | StatusFlags::from(flag))
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        for (i, flag) in self.iter_flags().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(flag.name())?;
        }
        Ok(())
    }
}

/// Interprets raw status register values
pub struct StatusDecoder;

impl StatusDecoder {
    /// Decode a raw status value into the set of events it reports.
    ///
    /// Total over `u16`: reserved bits above bit 9 are dropped.
    pub fn decode(raw: u16) -> StatusFlags {
        StatusFlags::from_bits_truncate(raw & STATUS_MASK)
    }

    /// Decode the two big-endian bytes returned by `GetIrqStatus`
    pub fn decode_bytes(bytes: [u8; 2]) -> StatusFlags {
        Self::decode(u16::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_bits_map_to_named_flags() {
        assert_eq!(StatusDecoder::decode(0x0001), StatusFlags::TX_DONE);
        assert_eq!(StatusDecoder::decode(0x0002), StatusFlags::RX_DONE);
        assert_eq!(StatusDecoder::decode(0x0080), StatusFlags::CAD_DONE);
        assert_eq!(StatusDecoder::decode(0x0100), StatusFlags::CAD_DETECTED);

        for flag in StatusFlag::ALL {
            let decoded = StatusDecoder::decode(1 << flag.bit());
            assert_eq!(decoded.iter_flags().collect::<Vec<_>>(), vec![flag]);
        }
    }

    #[test]
    fn test_combined_vectors() {
        // bits 0 and 7
        let flags = StatusDecoder::decode(0b00_1000_0001);
        assert_eq!(flags, StatusFlags::TX_DONE | StatusFlags::CAD_DONE);

        // bits 1 and 8
        let flags = StatusDecoder::decode(0b01_0000_0010);
        assert_eq!(flags, StatusFlags::RX_DONE | StatusFlags::CAD_DETECTED);

        // bits 0, 1, 7, 8
        let flags = StatusDecoder::decode(0b01_1000_0011);
        assert_eq!(
            flags.iter_flags().collect::<Vec<_>>(),
            vec![
                StatusFlag::TxDone,
                StatusFlag::RxDone,
                StatusFlag::CadDone,
                StatusFlag::CadDetected
            ]
        );

        // bits 7 and 8 only (a CAD detection)
        assert_eq!(StatusDecoder::decode(0x0180).to_string(), "CadDone | CadDetected");
    }

    #[test]
    fn test_reserved_bits_ignored() {
        assert_eq!(StatusDecoder::decode(0xFC00), StatusFlags::empty());
        assert_eq!(StatusDecoder::decode(0xFFFF), StatusFlags::all());
        assert_eq!(StatusDecoder::decode(0x8402), StatusFlags::RX_DONE);
    }

    #[test]
    fn test_decode_bytes_is_big_endian() {
        assert_eq!(StatusDecoder::decode_bytes([0x01, 0x00]), StatusFlags::CAD_DETECTED);
        assert_eq!(StatusDecoder::decode_bytes([0x02, 0x01]), StatusFlags::TIMEOUT | StatusFlags::TX_DONE);
    }

    #[test]
    fn test_display() {
        assert_eq!(StatusFlags::empty().to_string(), "-");
        assert_eq!(
            StatusDecoder::decode(0x0241).to_string(),
            "TxDone | CrcError | TimeoutRxOrTx"
        );
    }

    #[test]
    fn test_flag_masks_match_bitflags() {
        for flag in StatusFlag::ALL {
            assert_eq!(StatusFlags::from(flag).bits(), flag.mask());
        }
        let all: StatusFlags = StatusFlag::ALL.into_iter().collect();
        assert_eq!(all, StatusFlags::all());
    }

    proptest! {
        #[test]
        fn prop_decode_reports_exactly_the_set_bits(raw in any::<u16>()) {
            let flags = StatusDecoder::decode(raw);
            for flag in StatusFlag::ALL {
                prop_assert_eq!(flags.has(flag), raw & flag.mask() != 0);
            }
            prop_assert_eq!(flags.bits(), raw & STATUS_MASK);
        }
    }
}
