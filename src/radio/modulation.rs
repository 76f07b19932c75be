//! # SX126x Modulation and Packet Configuration
//!
//! Parameter sets for the two modems of the SX126x, expressed as tagged unions so a
//! LoRa parameter can never be paired with an FSK field:
//!
//! - [`ModemParameters`]: `SetModulationParams` payload (LoRa or FSK)
//! - [`PacketParameters`]: `SetPacketParams` payload (LoRa or FSK)
//!
//! Every type here encodes to the exact bytes the chip expects, and validation
//! happens before any byte is produced.
//!
//! ## Packet Structure
//!
//! ```text
//! ┌───────────┐ ┌────────────┐ ┌────────┐ ┌────────────┐ ┌───────┐
//! │ Preamble  │ │ Sync Word  │ │ Header │ │  Payload   │ │ CRC   │
//! │ (var len) │ │ (0-8 bytes)│ │ (opt.) │ │ (0-255 B)  │ │(0-2B) │
//! └───────────┘ └────────────┘ └────────┘ └────────────┘ └───────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use sx126x_ctl::radio::modulation::*;
//!
//! let modem = LoRaModulation::new(SpreadingFactor::SF7, LoRaBandwidth::BW125, CodingRate::CR4_5);
//! let packet = LoRaPacket::default();
//! let toa = lora_airtime_ms(&modem, &packet, 15);
//! assert!((toa - 50.432).abs() < 0.001);
//! ```

use crate::error::ConfigError;
use crate::radio::commands::XTAL_FREQ_HZ;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Modem selected on the chip (`SetPacketType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    LoRa,
    Fsk,
}

impl Protocol {
    /// `SetPacketType` argument
    pub const fn packet_type_code(self) -> u8 {
        match self {
            Protocol::Fsk => 0x00,
            Protocol::LoRa => 0x01,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::LoRa => f.write_str("LoRa"),
            Protocol::Fsk => f.write_str("FSK"),
        }
    }
}

/// Spreading Factor (SF) for LoRa (Table 13-47)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpreadingFactor {
    SF5 = 0x05,
    SF6 = 0x06,
    SF7 = 0x07,
    SF8 = 0x08,
    SF9 = 0x09,
    SF10 = 0x0A,
    SF11 = 0x0B,
    SF12 = 0x0C,
}

impl SpreadingFactor {
    pub const fn value(self) -> u8 {
        self as u8
    }

    pub fn from_value(sf: u8) -> Option<Self> {
        Some(match sf {
            5 => Self::SF5,
            6 => Self::SF6,
            7 => Self::SF7,
            8 => Self::SF8,
            9 => Self::SF9,
            10 => Self::SF10,
            11 => Self::SF11,
            12 => Self::SF12,
            _ => return None,
        })
    }
}

/// Bandwidth for LoRa (Table 13-48)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoRaBandwidth {
    BW7_8 = 0x00,  // 7.8 kHz
    BW10_4 = 0x08, // 10.4 kHz
    BW15_6 = 0x01, // 15.6 kHz
    BW20_8 = 0x09, // 20.8 kHz
    BW31_2 = 0x02, // 31.25 kHz
    BW41_7 = 0x0A, // 41.7 kHz
    BW62_5 = 0x03, // 62.5 kHz
    BW125 = 0x04,  // 125 kHz
    BW250 = 0x05,  // 250 kHz
    BW500 = 0x06,  // 500 kHz
}

impl LoRaBandwidth {
    /// Register code
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn hz(self) -> u32 {
        match self {
            Self::BW7_8 => 7_800,
            Self::BW10_4 => 10_400,
            Self::BW15_6 => 15_600,
            Self::BW20_8 => 20_800,
            Self::BW31_2 => 31_250,
            Self::BW41_7 => 41_700,
            Self::BW62_5 => 62_500,
            Self::BW125 => 125_000,
            Self::BW250 => 250_000,
            Self::BW500 => 500_000,
        }
    }

    pub fn from_hz(hz: u32) -> Option<Self> {
        Some(match hz {
            7_800 => Self::BW7_8,
            10_400 => Self::BW10_4,
            15_600 => Self::BW15_6,
            20_800 => Self::BW20_8,
            31_250 => Self::BW31_2,
            41_700 => Self::BW41_7,
            62_500 => Self::BW62_5,
            125_000 => Self::BW125,
            250_000 => Self::BW250,
            500_000 => Self::BW500,
            _ => return None,
        })
    }
}

/// Coding Rate (CR) for LoRa (Table 13-49)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodingRate {
    CR4_5 = 0x01,
    CR4_6 = 0x02,
    CR4_7 = 0x03,
    CR4_8 = 0x04,
}

impl CodingRate {
    /// Register value, 1..=4
    pub const fn index(self) -> u8 {
        self as u8
    }

    /// Denominator of the 4/x ratio
    pub const fn denominator(self) -> u8 {
        self as u8 + 4
    }

    pub fn from_index(cr: u8) -> Option<Self> {
        Some(match cr {
            1 => Self::CR4_5,
            2 => Self::CR4_6,
            3 => Self::CR4_7,
            4 => Self::CR4_8,
            _ => return None,
        })
    }

    pub fn from_denominator(denominator: u8) -> Option<Self> {
        denominator.checked_sub(4).and_then(Self::from_index)
    }
}

/// Symbol time above which low data rate optimisation is mandatory
const LDRO_SYMBOL_TIME_MS: f64 = 16.38;

/// LoRa modulation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoRaModulation {
    pub sf: SpreadingFactor,
    pub bw: LoRaBandwidth,
    pub cr: CodingRate,
    /// Low data rate optimisation; `None` selects it from the symbol time
    pub ldro: Option<bool>,
}

impl LoRaModulation {
    pub fn new(sf: SpreadingFactor, bw: LoRaBandwidth, cr: CodingRate) -> Self {
        Self { sf, bw, cr, ldro: None }
    }

    /// Symbol duration `2^SF / BW` in milliseconds
    pub fn symbol_time_ms(&self) -> f64 {
        f64::from(1u32 << self.sf.value()) * 1000.0 / f64::from(self.bw.hz())
    }

    pub fn ldro_enabled(&self) -> bool {
        self.ldro
            .unwrap_or_else(|| self.symbol_time_ms() >= LDRO_SYMBOL_TIME_MS)
    }

    /// `SetModulationParams` payload: `[SF, BW, CR, LDRO]`
    pub fn encode(&self) -> [u8; 4] {
        [
            self.sf.value(),
            self.bw.code(),
            self.cr.index(),
            u8::from(self.ldro_enabled()),
        ]
    }
}

impl Default for LoRaModulation {
    fn default() -> Self {
        Self::new(SpreadingFactor::SF7, LoRaBandwidth::BW125, CodingRate::CR4_5)
    }
}

/// FSK receiver bandwidths (DSB, Hz) and their register codes
const FSK_BANDWIDTHS: [(u32, u8); 21] = [
    (4_800, 0x1F),
    (5_800, 0x17),
    (7_300, 0x0F),
    (9_700, 0x1E),
    (11_700, 0x16),
    (14_600, 0x0E),
    (19_500, 0x1D),
    (23_400, 0x15),
    (29_300, 0x0D),
    (39_000, 0x1C),
    (46_900, 0x14),
    (58_600, 0x0C),
    (78_200, 0x1B),
    (93_800, 0x13),
    (117_300, 0x0B),
    (156_200, 0x1A),
    (187_200, 0x12),
    (234_300, 0x0A),
    (312_000, 0x19),
    (373_600, 0x11),
    (467_000, 0x09),
];

/// FSK receiver bandwidth, one of the chip's fixed filter settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FskBandwidth {
    hz: u32,
    code: u8,
}

impl FskBandwidth {
    /// Look up an exact filter bandwidth
    pub fn from_hz(hz: u32) -> Option<Self> {
        FSK_BANDWIDTHS
            .iter()
            .find(|(bw, _)| *bw == hz)
            .map(|&(hz, code)| Self { hz, code })
    }

    /// Narrowest filter at least `hz` wide
    pub fn at_least(hz: u32) -> Option<Self> {
        FSK_BANDWIDTHS
            .iter()
            .find(|(bw, _)| *bw >= hz)
            .map(|&(hz, code)| Self { hz, code })
    }

    pub const fn hz(self) -> u32 {
        self.hz
    }

    pub const fn code(self) -> u8 {
        self.code
    }
}

/// Gaussian filter applied to the FSK modulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PulseShape {
    None,
    Bt03,
    Bt05,
    Bt07,
    Bt1,
}

impl PulseShape {
    pub const fn code(self) -> u8 {
        match self {
            PulseShape::None => 0x00,
            PulseShape::Bt03 => 0x08,
            PulseShape::Bt05 => 0x09,
            PulseShape::Bt07 => 0x0A,
            PulseShape::Bt1 => 0x0B,
        }
    }
}

/// FSK modulation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FskModulation {
    /// 600 bps to 300 kbps
    pub bitrate_bps: u32,
    /// 600 Hz to 200 kHz
    pub fdev_hz: u32,
    pub bandwidth: FskBandwidth,
    pub pulse_shape: PulseShape,
}

impl FskModulation {
    pub const BITRATE_RANGE: std::ops::RangeInclusive<u32> = 600..=300_000;
    pub const FDEV_RANGE: std::ops::RangeInclusive<u32> = 600..=200_000;

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !Self::BITRATE_RANGE.contains(&self.bitrate_bps) {
            return Err(ConfigError::InvalidParameter(format!(
                "FSK bitrate {} bps outside {}..={}",
                self.bitrate_bps,
                Self::BITRATE_RANGE.start(),
                Self::BITRATE_RANGE.end()
            )));
        }
        if !Self::FDEV_RANGE.contains(&self.fdev_hz) {
            return Err(ConfigError::InvalidParameter(format!(
                "FSK frequency deviation {} Hz outside {}..={}",
                self.fdev_hz,
                Self::FDEV_RANGE.start(),
                Self::FDEV_RANGE.end()
            )));
        }
        Ok(())
    }

    /// `32 * Fxtal / bitrate`
    pub fn bitrate_register(&self) -> u32 {
        (32 * XTAL_FREQ_HZ / u64::from(self.bitrate_bps.max(1))) as u32
    }

    /// `fdev * 2^25 / Fxtal`
    pub fn fdev_register(&self) -> u32 {
        ((u64::from(self.fdev_hz) << 25) / XTAL_FREQ_HZ) as u32
    }

    /// `SetModulationParams` payload
    pub fn encode(&self) -> Result<[u8; 8], ConfigError> {
        self.validate()?;
        let br = self.bitrate_register().to_be_bytes();
        let fdev = self.fdev_register().to_be_bytes();
        Ok([
            br[1],
            br[2],
            br[3],
            self.pulse_shape.code(),
            self.bandwidth.code(),
            fdev[1],
            fdev[2],
            fdev[3],
        ])
    }
}

/// Complete modulation parameter set for the radio
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModemParameters {
    LoRa(LoRaModulation),
    Fsk(FskModulation),
}

impl ModemParameters {
    pub fn protocol(&self) -> Protocol {
        match self {
            ModemParameters::LoRa(_) => Protocol::LoRa,
            ModemParameters::Fsk(_) => Protocol::Fsk,
        }
    }

    /// Validated `SetModulationParams` payload
    pub fn encode(&self) -> Result<Vec<u8>, ConfigError> {
        match self {
            ModemParameters::LoRa(m) => Ok(m.encode().to_vec()),
            ModemParameters::Fsk(m) => Ok(m.encode()?.to_vec()),
        }
    }
}

/// LoRa header mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderType {
    /// Length, coding rate and CRC presence sent in the header
    Explicit,
    /// Fixed length agreed by both ends
    Implicit,
}

impl HeaderType {
    pub const fn code(self) -> u8 {
        match self {
            HeaderType::Explicit => 0x00,
            HeaderType::Implicit => 0x01,
        }
    }
}

/// Public LoRa network sync word
pub const LORA_SYNC_WORD_PUBLIC: u16 = 0x3444;
/// Private LoRa network sync word
pub const LORA_SYNC_WORD_PRIVATE: u16 = 0x1424;

/// LoRa packet parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoRaPacket {
    pub header_type: HeaderType,
    /// Preamble length in symbols
    pub preamble_length: u16,
    pub payload_length: u8,
    pub crc_enabled: bool,
    pub sync_word: u16,
    pub invert_iq: bool,
}

impl Default for LoRaPacket {
    fn default() -> Self {
        Self {
            header_type: HeaderType::Explicit,
            preamble_length: 12,
            payload_length: 15,
            crc_enabled: true,
            sync_word: LORA_SYNC_WORD_PUBLIC,
            invert_iq: false,
        }
    }
}

impl LoRaPacket {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.header_type == HeaderType::Implicit && self.payload_length == 0 {
            return Err(ConfigError::InvalidPacketShape(
                "implicit header requires a non-zero payload length".into(),
            ));
        }
        Ok(())
    }

    /// `SetPacketParams` payload: `[preamble (2), header, length, crc, iq]`
    pub fn encode(&self) -> Result<[u8; 6], ConfigError> {
        self.validate()?;
        let [pre_hi, pre_lo] = self.preamble_length.to_be_bytes();
        Ok([
            pre_hi,
            pre_lo,
            self.header_type.code(),
            self.payload_length,
            u8::from(self.crc_enabled),
            u8::from(self.invert_iq),
        ])
    }
}

/// FSK preamble detector length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreambleDetector {
    Off,
    Bits8,
    Bits16,
    Bits24,
    Bits32,
}

impl PreambleDetector {
    pub const fn code(self) -> u8 {
        match self {
            PreambleDetector::Off => 0x00,
            PreambleDetector::Bits8 => 0x04,
            PreambleDetector::Bits16 => 0x05,
            PreambleDetector::Bits24 => 0x06,
            PreambleDetector::Bits32 => 0x07,
        }
    }

    /// From a detector length in bits, `0` meaning off
    pub fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::Off,
            8 => Self::Bits8,
            16 => Self::Bits16,
            24 => Self::Bits24,
            32 => Self::Bits32,
            _ => return None,
        })
    }
}

/// FSK node address filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressComparator {
    Off,
    Node,
    NodeAndBroadcast,
}

impl AddressComparator {
    pub const fn code(self) -> u8 {
        match self {
            AddressComparator::Off => 0x00,
            AddressComparator::Node => 0x01,
            AddressComparator::NodeAndBroadcast => 0x02,
        }
    }
}

/// FSK length field presence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FskPacketType {
    /// Known length, no length byte
    Fixed,
    /// Length byte after the sync word
    Variable,
}

impl FskPacketType {
    pub const fn code(self) -> u8 {
        match self {
            FskPacketType::Fixed => 0x00,
            FskPacketType::Variable => 0x01,
        }
    }
}

/// FSK CRC setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FskCrc {
    Off,
    Crc1Byte,
    Crc2Byte,
    Crc1ByteInv,
    Crc2ByteInv,
}

impl FskCrc {
    pub const fn code(self) -> u8 {
        match self {
            FskCrc::Off => 0x01,
            FskCrc::Crc1Byte => 0x00,
            FskCrc::Crc2Byte => 0x02,
            FskCrc::Crc1ByteInv => 0x04,
            FskCrc::Crc2ByteInv => 0x06,
        }
    }

    pub const fn len_bytes(self) -> usize {
        match self {
            FskCrc::Off => 0,
            FskCrc::Crc1Byte | FskCrc::Crc1ByteInv => 1,
            FskCrc::Crc2Byte | FskCrc::Crc2ByteInv => 2,
        }
    }
}

/// Longest FSK sync word the chip holds
pub const FSK_SYNC_WORD_MAX_BITS: u8 = 64;

/// FSK packet parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FskPacket {
    /// Preamble length in bits
    pub preamble_length: u16,
    pub preamble_detector: PreambleDetector,
    /// Sync word length in bits
    pub sync_word_length: u8,
    pub address_comparator: AddressComparator,
    pub packet_type: FskPacketType,
    pub payload_length: u8,
    pub crc_type: FskCrc,
    pub whitening: bool,
}

impl Default for FskPacket {
    fn default() -> Self {
        Self {
            preamble_length: 32,
            preamble_detector: PreambleDetector::Bits8,
            sync_word_length: 32,
            address_comparator: AddressComparator::Off,
            packet_type: FskPacketType::Variable,
            payload_length: 15,
            crc_type: FskCrc::Crc2Byte,
            whitening: true,
        }
    }
}

impl FskPacket {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_word_length > FSK_SYNC_WORD_MAX_BITS {
            return Err(ConfigError::InvalidPacketShape(format!(
                "sync word of {} bits exceeds {} bits",
                self.sync_word_length, FSK_SYNC_WORD_MAX_BITS
            )));
        }
        if self.packet_type == FskPacketType::Fixed && self.payload_length == 0 {
            return Err(ConfigError::InvalidPacketShape(
                "fixed-length packets require a non-zero payload length".into(),
            ));
        }
        Ok(())
    }

    /// `SetPacketParams` payload
    pub fn encode(&self) -> Result<[u8; 9], ConfigError> {
        self.validate()?;
        let [pre_hi, pre_lo] = self.preamble_length.to_be_bytes();
        Ok([
            pre_hi,
            pre_lo,
            self.preamble_detector.code(),
            self.sync_word_length,
            self.address_comparator.code(),
            self.packet_type.code(),
            self.payload_length,
            self.crc_type.code(),
            u8::from(self.whitening),
        ])
    }
}

/// Packet structure configuration parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketParameters {
    LoRa(LoRaPacket),
    Fsk(FskPacket),
}

impl PacketParameters {
    pub fn protocol(&self) -> Protocol {
        match self {
            PacketParameters::LoRa(_) => Protocol::LoRa,
            PacketParameters::Fsk(_) => Protocol::Fsk,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            PacketParameters::LoRa(p) => p.validate(),
            PacketParameters::Fsk(p) => p.validate(),
        }
    }

    /// Validated `SetPacketParams` payload
    pub fn encode(&self) -> Result<Vec<u8>, ConfigError> {
        match self {
            PacketParameters::LoRa(p) => Ok(p.encode()?.to_vec()),
            PacketParameters::Fsk(p) => Ok(p.encode()?.to_vec()),
        }
    }

    pub fn payload_length(&self) -> u8 {
        match self {
            PacketParameters::LoRa(p) => p.payload_length,
            PacketParameters::Fsk(p) => p.payload_length,
        }
    }

    /// Whether the receiver relies on a configured length rather than a header
    pub fn is_fixed_length(&self) -> bool {
        match self {
            PacketParameters::LoRa(p) => p.header_type == HeaderType::Implicit,
            PacketParameters::Fsk(p) => p.packet_type == FskPacketType::Fixed,
        }
    }

    /// Same framing with a different payload length
    pub fn with_payload_length(mut self, len: u8) -> Self {
        match &mut self {
            PacketParameters::LoRa(p) => p.payload_length = len,
            PacketParameters::Fsk(p) => p.payload_length = len,
        }
        self
    }
}

/// LoRa time on air in milliseconds (SX126x datasheet 6.1.4)
///
/// ```text
/// Tsym = 2^SF / BW
/// Npre = preamble + 4.25            (SF >= 7)
///      = preamble + 6.25            (SF5, SF6)
/// Npay = 8 + max(ceil((8PL + 16CRC - 4SF + K + 20H) / (4(SF - 2DE))), 0) * (CR + 4)
///        K = 8 for SF >= 7, 0 for SF5/SF6 (divisor 4SF)
///        H = 1 for explicit header
/// ToA  = (Npre + Npay) * Tsym
/// ```
pub fn lora_airtime_ms(modem: &LoRaModulation, packet: &LoRaPacket, payload_len: usize) -> f64 {
    let sf = i64::from(modem.sf.value());
    let low_sf = sf < 7;
    let de = i64::from(modem.ldro_enabled() && !low_sf);
    let crc = i64::from(packet.crc_enabled);
    let explicit = i64::from(packet.header_type == HeaderType::Explicit);

    let preamble_symbols =
        f64::from(packet.preamble_length) + if low_sf { 6.25 } else { 4.25 };

    let k = if low_sf { 0 } else { 8 };
    let numerator = 8 * payload_len as i64 + 16 * crc - 4 * sf + k + 20 * explicit;
    let denominator = if low_sf { 4 * sf } else { 4 * (sf - 2 * de) };
    let blocks = if numerator > 0 {
        (numerator + denominator - 1) / denominator
    } else {
        0
    };
    let payload_symbols = 8 + blocks * i64::from(modem.cr.denominator());

    (preamble_symbols + payload_symbols as f64) * modem.symbol_time_ms()
}

/// FSK time on air in milliseconds
///
/// `(preamble + sync + 8 * (payload + length byte + CRC)) / bitrate`
pub fn fsk_airtime_ms(modem: &FskModulation, packet: &FskPacket, payload_len: usize) -> f64 {
    let header_bytes = match packet.packet_type {
        FskPacketType::Variable => 1,
        FskPacketType::Fixed => 0,
    };
    let address_bytes = usize::from(packet.address_comparator != AddressComparator::Off);
    let bits = usize::from(packet.preamble_length)
        + usize::from(packet.sync_word_length)
        + 8 * (payload_len + header_bytes + address_bytes + packet.crc_type.len_bytes());
    bits as f64 * 1000.0 / f64::from(modem.bitrate_bps.max(1))
}

/// Time on air for a matched modem/packet pair, `None` if the protocols differ
pub fn airtime_ms(
    modem: &ModemParameters,
    packet: &PacketParameters,
    payload_len: usize,
) -> Option<f64> {
    match (modem, packet) {
        (ModemParameters::LoRa(m), PacketParameters::LoRa(p)) => {
            Some(lora_airtime_ms(m, p, payload_len))
        }
        (ModemParameters::Fsk(m), PacketParameters::Fsk(p)) => {
            Some(fsk_airtime_ms(m, p, payload_len))
        }
        _ => None,
    }
}
