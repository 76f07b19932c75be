use std::fs;
use sx126x_ctl::radio::commands::{opcode, register};
use sx126x_ctl::radio::hal::MockHal;
use sx126x_ctl::radio::modem::ModemConfigurator;
use sx126x_ctl::radio::modulation::*;
use sx126x_ctl::radio::packet::PacketConfigurator;
use sx126x_ctl::radio::session::{RadioIdentity, RadioSession};
use sx126x_ctl::{ConfigError, RadioConfig, RadioError};
use tempfile::tempdir;

#[test]
fn test_protocol_mismatch_writes_nothing() {
    let mock = MockHal::new();
    let mut session = RadioSession::begin(mock.clone(), RadioIdentity::default()).unwrap();
    mock.clear_ops();

    let fsk = ModemParameters::Fsk(FskModulation {
        bitrate_bps: 50_000,
        fdev_hz: 25_000,
        bandwidth: FskBandwidth::from_hz(117_300).unwrap(),
        pulse_shape: PulseShape::Bt05,
    });
    let err = ModemConfigurator::apply(&mut session, fsk).unwrap_err();
    assert_eq!(
        err,
        ConfigError::ProtocolMismatch {
            expected: Protocol::LoRa,
            found: Protocol::Fsk
        }
    );

    let err = PacketConfigurator::apply(&mut session, PacketParameters::Fsk(FskPacket::default()))
        .unwrap_err();
    assert!(matches!(err, ConfigError::ProtocolMismatch { .. }));

    assert_eq!(mock.op_count(), 0);
    assert!(session.modem().is_none());
    assert!(session.packet().is_none());
}

#[test]
fn test_implicit_header_without_length_rejected() {
    let mock = MockHal::new();
    let mut session = RadioSession::begin(mock.clone(), RadioIdentity::default()).unwrap();
    mock.clear_ops();

    let packet = LoRaPacket {
        header_type: HeaderType::Implicit,
        payload_length: 0,
        ..LoRaPacket::default()
    };
    let err = PacketConfigurator::apply(&mut session, PacketParameters::LoRa(packet)).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidPacketShape(_)));
    assert_eq!(mock.op_count(), 0);
}

#[test]
fn test_fsk_sync_word_too_long_rejected() {
    let mock = MockHal::new();
    let identity = RadioIdentity {
        protocol: Protocol::Fsk,
        ..RadioIdentity::default()
    };
    let mut session = RadioSession::begin(mock.clone(), identity).unwrap();
    mock.clear_ops();

    let packet = FskPacket {
        sync_word_length: 72,
        ..FskPacket::default()
    };
    let err = PacketConfigurator::apply(&mut session, PacketParameters::Fsk(packet)).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidPacketShape(_)));
    assert_eq!(mock.op_count(), 0);
}

#[test]
fn test_default_config_applied_to_session() {
    let mock = MockHal::new();
    let config = RadioConfig::default();
    let mut session = RadioSession::begin(mock.clone(), config.to_identity().unwrap()).unwrap();
    config.apply_to(&mut session).unwrap();

    assert_eq!(mock.last_command(opcode::SET_DIO2_AS_RF_SWITCH_CTRL), Some(vec![0x01]));
    assert_eq!(mock.last_command(opcode::CALIBRATE_IMAGE), Some(vec![0xD7, 0xDB]));
    assert_eq!(
        mock.last_command(opcode::SET_RF_FREQUENCY),
        Some(vec![0x36, 0x40, 0x00, 0x00])
    );
    assert_eq!(mock.register_writes(register::RX_GAIN), vec![vec![0x96]]);
    assert_eq!(mock.last_command(opcode::SET_PA_CONFIG), Some(vec![0x04, 0x07, 0x00, 0x01]));
    assert_eq!(mock.last_command(opcode::SET_TX_PARAMS), Some(vec![22, 0x04]));
    assert_eq!(
        mock.last_command(opcode::SET_MODULATION_PARAMS),
        Some(vec![0x07, 0x04, 0x01, 0x00])
    );
    assert_eq!(
        mock.last_command(opcode::SET_PACKET_PARAMS),
        Some(vec![0x00, 0x0C, 0x00, 0x0F, 0x01, 0x00])
    );
    assert_eq!(mock.register_writes(register::LORA_SYNC_WORD), vec![vec![0x34, 0x44]]);

    assert_eq!(session.frequency_hz(), Some(868_000_000));
    assert_eq!(session.tx_power_dbm(), Some(22));
}

#[test]
fn test_config_file_drives_fsk_session() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fsk.json");
    fs::write(
        &path,
        r#"{
            "pins": { "txen": -1, "rxen": 5, "dio2_rf_switch": false },
            "modem_cfg": { "protocol": 1, "frequency": 433000000, "power": 14, "pa": "sx1268",
                           "rx_gain": "power_saving", "bitrate": 4800, "fdev": 5000,
                           "fsk_bandwidth": 23400, "pulse_shape": "none" },
            "packet_cfg": { "payload_length": 32, "crc_type": "off", "whitening": false }
        }"#,
    )
    .unwrap();

    let config = RadioConfig::from_path(&path).unwrap();
    let identity = config.to_identity().unwrap();
    assert_eq!(identity.protocol, Protocol::Fsk);

    let mock = MockHal::new();
    let mut session = RadioSession::begin(mock.clone(), identity).unwrap();
    config.apply_to(&mut session).unwrap();

    assert_eq!(mock.last_command(opcode::SET_PACKET_TYPE), Some(vec![0x00]));
    assert!(mock.commands(opcode::SET_DIO2_AS_RF_SWITCH_CTRL).is_empty());
    assert_eq!(mock.last_command(opcode::CALIBRATE_IMAGE), Some(vec![0x6B, 0x6F]));
    assert_eq!(mock.register_writes(register::RX_GAIN), vec![vec![0x94]]);
    assert!(matches!(session.modem(), Some(ModemParameters::Fsk(m)) if m.bitrate_bps == 4800));
    assert!(matches!(
        session.packet(),
        Some(PacketParameters::Fsk(p)) if p.payload_length == 32 && p.crc_type == FskCrc::Off
    ));
}

#[test]
fn test_invalid_config_leaves_chip_untouched() {
    let mock = MockHal::new();
    let mut config = RadioConfig::default();
    config.modem_cfg.bandwidth = 100_000;

    let mut session = RadioSession::begin(mock.clone(), config.to_identity().unwrap()).unwrap();
    mock.clear_ops();
    let err = config.apply_to(&mut session).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidParameter(_)));
    assert_eq!(mock.op_count(), 0);
}

#[test]
fn test_failed_sync_word_keeps_previous_framing() {
    let mock = MockHal::new();
    let mut session = RadioSession::begin(mock.clone(), RadioIdentity::default()).unwrap();
    PacketConfigurator::apply(&mut session, PacketParameters::LoRa(LoRaPacket::default())).unwrap();
    mock.clear_ops();

    mock.fail_register(Some(register::LORA_SYNC_WORD));
    let implicit = LoRaPacket {
        header_type: HeaderType::Implicit,
        payload_length: 40,
        ..LoRaPacket::default()
    };
    let err = PacketConfigurator::apply(&mut session, PacketParameters::LoRa(implicit)).unwrap_err();
    assert!(matches!(err, ConfigError::Radio(RadioError::RegisterWriteFailure(_))));

    assert!(mock.commands(opcode::SET_PACKET_PARAMS).is_empty());
    assert!(mock.register_writes(register::IQ_POLARITY).is_empty());
    assert_eq!(session.packet(), Some(&PacketParameters::LoRa(LoRaPacket::default())));
}

#[test]
fn test_failed_framing_restores_registers() {
    let mock = MockHal::new();
    let mut session = RadioSession::begin(mock.clone(), RadioIdentity::default()).unwrap();
    PacketConfigurator::apply(&mut session, PacketParameters::LoRa(LoRaPacket::default())).unwrap();
    mock.clear_ops();

    mock.fail_command(Some(opcode::SET_PACKET_PARAMS));
    let private = LoRaPacket {
        sync_word: LORA_SYNC_WORD_PRIVATE,
        invert_iq: true,
        ..LoRaPacket::default()
    };
    let err = PacketConfigurator::apply(&mut session, PacketParameters::LoRa(private)).unwrap_err();
    assert!(matches!(err, ConfigError::Radio(RadioError::RegisterWriteFailure(_))));

    assert_eq!(
        mock.register_writes(register::LORA_SYNC_WORD),
        vec![vec![0x14, 0x24], vec![0x34, 0x44]]
    );
    assert_eq!(mock.register_writes(register::IQ_POLARITY), vec![vec![0x00], vec![0x04]]);
    assert_eq!(session.packet(), Some(&PacketParameters::LoRa(LoRaPacket::default())));

    mock.fail_command(None);
    PacketConfigurator::apply(&mut session, PacketParameters::LoRa(private)).unwrap();
    assert_eq!(session.packet(), Some(&PacketParameters::LoRa(private)));
}
