//! # Radio Configuration Files
//!
//! JSON schema for describing one transceiver: wiring (`pins`), modem
//! (`modem_cfg`), framing (`packet_cfg`) and channel activity detection
//! (`cad_cfg`). Every field has a default, so a file only needs the values it
//! changes:
//!
//! ```json
//! {
//!   "pins":      { "reset": 22, "txen": -1, "rxen": 5 },
//!   "modem_cfg": { "frequency": 915000000, "spreading_factor": 9 },
//!   "cad_cfg":   { "cadSymbolNum": 4, "cadExitMode": 1, "cadTimeout": 64000 }
//! }
//! ```
//!
//! The file structs stay close to the file format (plain integers, negative
//! pins for "not connected"). The `to_*` conversions produce validated core
//! types and report problems as [`ConfigError`].

use crate::error::ConfigError;
use crate::radio::cad::{CadExitMode, CadParameters, CadSymbols, CAD_TIMEOUT_MAX};
use crate::radio::hal::Hal;
use crate::radio::modem::ModemConfigurator;
use crate::radio::modulation::{
    AddressComparator, CodingRate, FskBandwidth, FskCrc, FskModulation, FskPacket, FskPacketType,
    HeaderType, LoRaBandwidth, LoRaModulation, LoRaPacket, ModemParameters, PacketParameters,
    PreambleDetector, Protocol, PulseShape, SpreadingFactor, LORA_SYNC_WORD_PUBLIC,
};
use crate::radio::packet::PacketConfigurator;
use crate::radio::session::{PaProfile, RadioIdentity, RadioSession, RxGain};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// `modem_cfg.protocol` value for LoRa
pub const PROTOCOL_LORA: u8 = 0;
/// `modem_cfg.protocol` value for FSK
pub const PROTOCOL_FSK: u8 = 1;

/// Complete configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub pins: PinConfig,
    pub modem_cfg: ModemConfig,
    pub packet_cfg: PacketConfig,
    pub cad_cfg: CadConfig,
}

/// Bus and GPIO wiring, BCM numbering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    pub bus_id: u8,
    pub cs_id: u8,
    pub reset: i32,
    pub busy: i32,
    pub irq: i32,
    /// Negative when the module has no TX enable line
    pub txen: i32,
    /// Negative when the module has no RX enable line
    pub rxen: i32,
    /// Let DIO2 drive the antenna switch
    pub dio2_rf_switch: bool,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            bus_id: 0,
            cs_id: 0,
            reset: 18,
            busy: 20,
            irq: 16,
            txen: 6,
            rxen: -1,
            dio2_rf_switch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    /// 0 LoRa, 1 FSK
    pub protocol: u8,
    pub frequency: u32,
    /// TX power in dBm
    pub power: i8,
    pub pa: PaProfile,
    pub rx_gain: RxGain,

    pub spreading_factor: u8,
    /// LoRa bandwidth in Hz
    pub bandwidth: u32,
    /// Coding rate as an index or a denominator
    ///
    /// `1`..=`4` select 4/5..4/8 and `5`..=`8` select 4/5..4/8 as well, so `4`
    /// means 4/8 while `5` means 4/5.
    pub coding_rate: u8,
    /// Force low data rate optimisation on or off
    pub ldro: Option<bool>,

    pub bitrate: u32,
    pub fdev: u32,
    /// FSK receiver bandwidth in Hz
    pub fsk_bandwidth: u32,
    pub pulse_shape: PulseShape,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL_LORA,
            frequency: 868_000_000,
            power: 22,
            pa: PaProfile::Sx1262,
            rx_gain: RxGain::Boosted,
            spreading_factor: 7,
            bandwidth: 125_000,
            coding_rate: 1,
            ldro: None,
            bitrate: 50_000,
            fdev: 25_000,
            fsk_bandwidth: 117_300,
            pulse_shape: PulseShape::Bt05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketConfig {
    pub header_type: HeaderType,
    /// LoRa preamble in symbols
    pub preamble_length: u16,
    pub payload_length: u8,
    pub crc: bool,
    pub sync_word: u16,
    pub invert_iq: bool,

    /// FSK preamble in bits
    pub fsk_preamble_length: u16,
    /// Preamble detector length in bits, 0 disables it
    pub preamble_detector: u8,
    pub sync_word_length: u8,
    pub address_comparator: AddressComparator,
    pub packet_type: FskPacketType,
    pub crc_type: FskCrc,
    pub whitening: bool,
}

impl Default for PacketConfig {
    fn default() -> Self {
        let lora = LoRaPacket::default();
        let fsk = FskPacket::default();
        Self {
            header_type: lora.header_type,
            preamble_length: lora.preamble_length,
            payload_length: lora.payload_length,
            crc: lora.crc_enabled,
            sync_word: LORA_SYNC_WORD_PUBLIC,
            invert_iq: lora.invert_iq,
            fsk_preamble_length: fsk.preamble_length,
            preamble_detector: 8,
            sync_word_length: fsk.sync_word_length,
            address_comparator: fsk.address_comparator,
            packet_type: fsk.packet_type,
            crc_type: fsk.crc_type,
            whitening: fsk.whitening,
        }
    }
}

/// CAD settings, keyed the way existing CAD configuration files name them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CadConfig {
    /// Symbols per CAD cycle: 1, 2, 4, 8 or 16
    pub cad_symbol_num: u8,
    pub cad_det_peak: u8,
    pub cad_det_min: u8,
    /// 0 exit to standby, 1 exit to RX
    pub cad_exit_mode: u8,
    /// RX timeout after detection, 15.625 µs steps
    pub cad_timeout: u32,
}

impl Default for CadConfig {
    fn default() -> Self {
        let params = CadParameters::default();
        Self {
            cad_symbol_num: params.symbol_count.count(),
            cad_det_peak: params.detection_peak,
            cad_det_min: params.detection_min,
            cad_exit_mode: params.exit_mode as u8,
            cad_timeout: params.timeout_steps,
        }
    }
}

/// Values given on the command line, applied over the file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub frequency: Option<u32>,
    pub spreading_factor: Option<u8>,
    pub bandwidth: Option<u32>,
    pub coding_rate: Option<u8>,
    pub power: Option<i8>,
    pub protocol: Option<u8>,
}

impl RadioConfig {
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        let modem = &mut self.modem_cfg;
        if let Some(hz) = overrides.frequency {
            modem.frequency = hz;
        }
        if let Some(sf) = overrides.spreading_factor {
            modem.spreading_factor = sf;
        }
        if let Some(bw) = overrides.bandwidth {
            modem.bandwidth = bw;
        }
        if let Some(cr) = overrides.coding_rate {
            modem.coding_rate = cr;
        }
        if let Some(dbm) = overrides.power {
            modem.power = dbm;
        }
        if let Some(protocol) = overrides.protocol {
            modem.protocol = protocol;
        }
    }

    pub fn protocol(&self) -> Result<Protocol, ConfigError> {
        match self.modem_cfg.protocol {
            PROTOCOL_LORA => Ok(Protocol::LoRa),
            PROTOCOL_FSK => Ok(Protocol::Fsk),
            other => Err(ConfigError::InvalidParameter(format!(
                "protocol {other}, expected {PROTOCOL_LORA} (LoRa) or {PROTOCOL_FSK} (FSK)"
            ))),
        }
    }

    pub fn to_identity(&self) -> Result<RadioIdentity, ConfigError> {
        let pins = &self.pins;
        Ok(RadioIdentity {
            bus_id: pins.bus_id,
            cs_id: pins.cs_id,
            reset_pin: required_pin("reset", pins.reset)?,
            busy_pin: required_pin("busy", pins.busy)?,
            irq_pin: required_pin("irq", pins.irq)?,
            txen_pin: optional_pin("txen", pins.txen)?,
            rxen_pin: optional_pin("rxen", pins.rxen)?,
            protocol: self.protocol()?,
        })
    }

    pub fn to_modem_parameters(&self) -> Result<ModemParameters, ConfigError> {
        let m = &self.modem_cfg;
        match self.protocol()? {
            Protocol::LoRa => {
                let sf = SpreadingFactor::from_value(m.spreading_factor).ok_or_else(|| {
                    ConfigError::InvalidParameter(format!(
                        "spreading factor {} outside 5-12",
                        m.spreading_factor
                    ))
                })?;
                let bw = LoRaBandwidth::from_hz(m.bandwidth).ok_or_else(|| {
                    ConfigError::InvalidParameter(format!("unsupported LoRa bandwidth {} Hz", m.bandwidth))
                })?;
                let cr = CodingRate::from_index(m.coding_rate)
                    .or_else(|| CodingRate::from_denominator(m.coding_rate))
                    .ok_or_else(|| {
                        ConfigError::InvalidParameter(format!("coding rate {}", m.coding_rate))
                    })?;
                Ok(ModemParameters::LoRa(LoRaModulation {
                    ldro: m.ldro,
                    ..LoRaModulation::new(sf, bw, cr)
                }))
            }
            Protocol::Fsk => {
                let bandwidth = FskBandwidth::from_hz(m.fsk_bandwidth).ok_or_else(|| {
                    ConfigError::InvalidParameter(format!(
                        "unsupported FSK bandwidth {} Hz",
                        m.fsk_bandwidth
                    ))
                })?;
                let fsk = FskModulation {
                    bitrate_bps: m.bitrate,
                    fdev_hz: m.fdev,
                    bandwidth,
                    pulse_shape: m.pulse_shape,
                };
                fsk.validate()?;
                Ok(ModemParameters::Fsk(fsk))
            }
        }
    }

    pub fn to_packet_parameters(&self) -> Result<PacketParameters, ConfigError> {
        let p = &self.packet_cfg;
        let params = match self.protocol()? {
            Protocol::LoRa => PacketParameters::LoRa(LoRaPacket {
                header_type: p.header_type,
                preamble_length: p.preamble_length,
                payload_length: p.payload_length,
                crc_enabled: p.crc,
                sync_word: p.sync_word,
                invert_iq: p.invert_iq,
            }),
            Protocol::Fsk => {
                let preamble_detector =
                    PreambleDetector::from_bits(p.preamble_detector).ok_or_else(|| {
                        ConfigError::InvalidParameter(format!(
                            "preamble detector of {} bits",
                            p.preamble_detector
                        ))
                    })?;
                PacketParameters::Fsk(FskPacket {
                    preamble_length: p.fsk_preamble_length,
                    preamble_detector,
                    sync_word_length: p.sync_word_length,
                    address_comparator: p.address_comparator,
                    packet_type: p.packet_type,
                    payload_length: p.payload_length,
                    crc_type: p.crc_type,
                    whitening: p.whitening,
                })
            }
        };
        params.validate()?;
        Ok(params)
    }

    pub fn to_cad_parameters(&self) -> Result<CadParameters, ConfigError> {
        let c = &self.cad_cfg;
        let symbol_count = CadSymbols::from_count(c.cad_symbol_num).ok_or_else(|| {
            ConfigError::InvalidParameter(format!(
                "cadSymbolNum {}, expected 1, 2, 4, 8 or 16",
                c.cad_symbol_num
            ))
        })?;
        let exit_mode = CadExitMode::from_code(c.cad_exit_mode).ok_or_else(|| {
            ConfigError::InvalidParameter(format!("cadExitMode {}", c.cad_exit_mode))
        })?;
        if c.cad_timeout > CAD_TIMEOUT_MAX {
            return Err(ConfigError::InvalidParameter(format!(
                "cadTimeout {} exceeds 0x{CAD_TIMEOUT_MAX:06X}",
                c.cad_timeout
            )));
        }
        Ok(CadParameters {
            symbol_count,
            detection_peak: c.cad_det_peak,
            detection_min: c.cad_det_min,
            exit_mode,
            timeout_steps: c.cad_timeout,
        })
    }

    /// Bring a fresh session to the configured state: RF switch, frequency,
    /// gains, modem and packet framing
    ///
    /// Everything is converted and validated before the first write.
    pub fn apply_to<H: Hal + 'static>(
        &self,
        session: &mut RadioSession<H>,
    ) -> Result<(), ConfigError> {
        let modem = self.to_modem_parameters()?;
        let packet = self.to_packet_parameters()?;

        if self.pins.dio2_rf_switch {
            session.set_dio2_rf_switch()?;
        }
        session.set_frequency(self.modem_cfg.frequency)?;
        session.set_rx_gain(self.modem_cfg.rx_gain)?;
        session.set_tx_power(self.modem_cfg.power, self.modem_cfg.pa)?;
        ModemConfigurator::apply(session, modem)?;
        PacketConfigurator::apply(session, packet)?;
        Ok(())
    }
}

fn required_pin(name: &str, pin: i32) -> Result<u8, ConfigError> {
    optional_pin(name, pin)?
        .ok_or_else(|| ConfigError::InvalidParameter(format!("{name} pin must be connected")))
}

fn optional_pin(name: &str, pin: i32) -> Result<Option<u8>, ConfigError> {
    if pin < 0 {
        return Ok(None);
    }
    u8::try_from(pin)
        .map(Some)
        .map_err(|_| ConfigError::InvalidParameter(format!("{name} pin {pin} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_match_example_wiring() {
        let config = RadioConfig::default();
        let identity = config.to_identity().unwrap();
        assert_eq!(identity, RadioIdentity::default());

        assert_eq!(
            config.to_modem_parameters().unwrap(),
            ModemParameters::LoRa(LoRaModulation::default())
        );
        assert_eq!(
            config.to_packet_parameters().unwrap(),
            PacketParameters::LoRa(LoRaPacket::default())
        );
        assert_eq!(config.to_cad_parameters().unwrap(), CadParameters::default());
    }

    #[test]
    fn test_partial_file() {
        let json = r#"{
            "pins": { "txen": -1, "rxen": 5 },
            "modem_cfg": { "frequency": 915000000, "spreading_factor": 9, "coding_rate": 5 },
            "cad_cfg": { "cadSymbolNum": 4, "cadDetPeak": 23, "cadExitMode": 1, "cadTimeout": 64000 }
        }"#;
        let config = RadioConfig::from_json_str(json).unwrap();

        let identity = config.to_identity().unwrap();
        assert_eq!(identity.txen_pin, None);
        assert_eq!(identity.rxen_pin, Some(5));
        assert_eq!(identity.reset_pin, 18);

        match config.to_modem_parameters().unwrap() {
            ModemParameters::LoRa(m) => {
                assert_eq!(m.sf, SpreadingFactor::SF9);
                assert_eq!(m.cr, CodingRate::CR4_5);
            }
            other => panic!("unexpected {other:?}"),
        }

        let cad = config.to_cad_parameters().unwrap();
        assert_eq!(cad.symbol_count, CadSymbols::Four);
        assert_eq!(cad.detection_peak, 23);
        assert_eq!(cad.exit_mode, CadExitMode::ExitToRx);
        assert_eq!(cad.timeout_steps, 64_000);
    }

    #[test]
    fn test_fsk_conversion() {
        let json = r#"{ "modem_cfg": { "protocol": 1, "pulse_shape": "bt1" },
                        "packet_cfg": { "packet_type": "fixed", "crc_type": "crc1_byte" } }"#;
        let config = RadioConfig::from_json_str(json).unwrap();
        assert_eq!(config.protocol().unwrap(), Protocol::Fsk);

        match config.to_modem_parameters().unwrap() {
            ModemParameters::Fsk(m) => {
                assert_eq!(m.bitrate_bps, 50_000);
                assert_eq!(m.bandwidth.hz(), 117_300);
                assert_eq!(m.pulse_shape, PulseShape::Bt1);
            }
            other => panic!("unexpected {other:?}"),
        }
        match config.to_packet_parameters().unwrap() {
            PacketParameters::Fsk(p) => {
                assert_eq!(p.preamble_length, 32);
                assert_eq!(p.preamble_detector, PreambleDetector::Bits8);
                assert_eq!(p.packet_type, FskPacketType::Fixed);
                assert_eq!(p.crc_type, FskCrc::Crc1Byte);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_values() {
        let mut config = RadioConfig::default();
        config.modem_cfg.spreading_factor = 13;
        assert!(matches!(
            config.to_modem_parameters(),
            Err(ConfigError::InvalidParameter(_))
        ));

        let mut config = RadioConfig::default();
        config.modem_cfg.protocol = 2;
        assert!(config.to_identity().is_err());

        let mut config = RadioConfig::default();
        config.pins.busy = -1;
        assert!(config.to_identity().is_err());

        let mut config = RadioConfig::default();
        config.cad_cfg.cad_symbol_num = 3;
        assert!(config.to_cad_parameters().is_err());
        config.cad_cfg.cad_symbol_num = 2;
        config.cad_cfg.cad_timeout = CAD_TIMEOUT_MAX + 1;
        assert!(config.to_cad_parameters().is_err());

        let mut config = RadioConfig::default();
        config.packet_cfg.header_type = HeaderType::Implicit;
        config.packet_cfg.payload_length = 0;
        assert!(matches!(
            config.to_packet_parameters(),
            Err(ConfigError::InvalidPacketShape(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = RadioConfig::default();
        config.apply_overrides(&ConfigOverrides {
            frequency: Some(433_000_000),
            spreading_factor: Some(12),
            power: Some(14),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.modem_cfg.frequency, 433_000_000);
        assert_eq!(config.modem_cfg.spreading_factor, 12);
        assert_eq!(config.modem_cfg.power, 14);
        assert_eq!(config.modem_cfg.bandwidth, 125_000);
    }

    #[test]
    fn test_coding_rate_forms() {
        let cases = [
            (1, CodingRate::CR4_5),
            (4, CodingRate::CR4_8),
            (5, CodingRate::CR4_5),
            (8, CodingRate::CR4_8),
        ];
        for (value, expected) in cases {
            let mut config = RadioConfig::default();
            config.modem_cfg.coding_rate = value;
            match config.to_modem_parameters().unwrap() {
                ModemParameters::LoRa(m) => assert_eq!(m.cr, expected, "coding_rate {value}"),
                other => panic!("expected LoRa, got {other:?}"),
            }
        }

        let mut config = RadioConfig::default();
        config.modem_cfg.coding_rate = 9;
        assert!(matches!(
            config.to_modem_parameters(),
            Err(ConfigError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let mut config = RadioConfig::default();
        config.modem_cfg.frequency = 433_500_000;
        config.pins.rxen = 12;
        config.save_to_file(file.path()).unwrap();

        let loaded = RadioConfig::from_path(file.path()).unwrap();
        assert_eq!(loaded, config);

        let text = fs::read_to_string(file.path()).unwrap();
        assert!(text.contains("\"cadSymbolNum\""));
        assert!(text.contains("\"pa\": \"sx1262\""));
    }

    #[test]
    fn test_malformed_file() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "{ \"pins\": ").unwrap();
        let err = RadioConfig::from_path(file.path()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
