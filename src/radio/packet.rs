//! Packet framing configuration
//!
//! [`PacketConfigurator::apply`] writes `SetPacketParams` for the session's modem.
//! For LoRa it also applies the inverted-IQ register fix (datasheet 15.4) and the
//! sync word. Those registers are written first and restored if a later write
//! fails, so a failed `apply` leaves the chip on its previous packet setup. The
//! sync word can be changed later on its own with
//! [`PacketConfigurator::set_sync_word`].

use crate::error::{ConfigError, RadioError};
use crate::radio::commands::{opcode, register};
use crate::radio::hal::Hal;
use crate::radio::modulation::{PacketParameters, Protocol, FSK_SYNC_WORD_MAX_BITS};
use crate::radio::session::RadioSession;

/// Bit 2 of the IQ polarity register is cleared for inverted IQ
const IQ_POLARITY_STANDARD_BIT: u8 = 0x04;

/// Applies packet framing parameters
pub struct PacketConfigurator;

impl PacketConfigurator {
    pub fn apply<H: Hal + 'static>(
        session: &mut RadioSession<H>,
        params: PacketParameters,
    ) -> Result<(), ConfigError> {
        check_protocol(session, params.protocol())?;
        let payload = params.encode()?;

        match params {
            PacketParameters::LoRa(p) => {
                session.with_hal(|hal| {
                    let mut iq = [0u8; 1];
                    hal.read_register(register::IQ_POLARITY, &mut iq)
                        .map_err(RadioError::RegisterReadFailure)?;
                    let mut sync = [0u8; 2];
                    hal.read_register(register::LORA_SYNC_WORD, &mut sync)
                        .map_err(RadioError::RegisterReadFailure)?;
                    let new_iq = if p.invert_iq {
                        iq[0] & !IQ_POLARITY_STANDARD_BIT
                    } else {
                        iq[0] | IQ_POLARITY_STANDARD_BIT
                    };

                    // Framing goes last so the chip never carries it without its registers
                    hal.write_register(register::LORA_SYNC_WORD, &p.sync_word.to_be_bytes())
                        .map_err(RadioError::RegisterWriteFailure)?;
                    if let Err(e) = hal.write_register(register::IQ_POLARITY, &[new_iq]) {
                        restore_registers(hal, &[(register::LORA_SYNC_WORD, &sync[..])]);
                        return Err(RadioError::RegisterWriteFailure(e));
                    }
                    if let Err(e) = hal.write_command(opcode::SET_PACKET_PARAMS, &payload) {
                        restore_registers(
                            hal,
                            &[(register::IQ_POLARITY, &iq[..]), (register::LORA_SYNC_WORD, &sync[..])],
                        );
                        return Err(RadioError::RegisterWriteFailure(e));
                    }
                    Ok(())
                })?;
                log::info!(
                    "LoRa packet: {:?} header, preamble {}, payload {}, CRC {}, sync 0x{:04X}{}",
                    p.header_type,
                    p.preamble_length,
                    p.payload_length,
                    if p.crc_enabled { "on" } else { "off" },
                    p.sync_word,
                    if p.invert_iq { ", IQ inverted" } else { "" }
                );
            }
            PacketParameters::Fsk(p) => {
                session.command(opcode::SET_PACKET_PARAMS, &payload)?;
                log::info!(
                    "FSK packet: preamble {} bits, sync {} bits, {:?}, payload {}, CRC {:?}, whitening {}",
                    p.preamble_length,
                    p.sync_word_length,
                    p.packet_type,
                    p.payload_length,
                    p.crc_type,
                    if p.whitening { "on" } else { "off" }
                );
            }
        }

        session.set_packet(params);
        Ok(())
    }

    /// Change the LoRa sync word (network selection) without touching framing
    pub fn set_sync_word<H: Hal + 'static>(
        session: &mut RadioSession<H>,
        word: u16,
    ) -> Result<(), ConfigError> {
        check_protocol(session, Protocol::LoRa)?;
        session.write_register(register::LORA_SYNC_WORD, &word.to_be_bytes())?;
        if let Some(PacketParameters::LoRa(mut p)) = session.packet().copied() {
            p.sync_word = word;
            session.set_packet(PacketParameters::LoRa(p));
        }
        log::info!("LoRa sync word set to 0x{word:04X}");
        Ok(())
    }

    /// Write the FSK sync word, up to 8 bytes
    pub fn set_fsk_sync_word<H: Hal + 'static>(
        session: &mut RadioSession<H>,
        word: &[u8],
    ) -> Result<(), ConfigError> {
        check_protocol(session, Protocol::Fsk)?;
        let max_bytes = usize::from(FSK_SYNC_WORD_MAX_BITS / 8);
        if word.len() > max_bytes {
            return Err(ConfigError::InvalidPacketShape(format!(
                "FSK sync word of {} bytes exceeds {max_bytes} bytes",
                word.len()
            )));
        }
        session.write_register(register::FSK_SYNC_WORD, word)?;
        log::info!("FSK sync word set to {word:02X?}");
        Ok(())
    }
}

/// Put back register values read before a failed update
fn restore_registers<H: Hal>(hal: &mut H, saved: &[(u16, &[u8])]) {
    for (addr, data) in saved {
        if let Err(e) = hal.write_register(*addr, data) {
            log::warn!("Restoring register 0x{addr:04X} failed: {e}");
        }
    }
}

fn check_protocol<H: Hal + 'static>(
    session: &RadioSession<H>,
    found: Protocol,
) -> Result<(), ConfigError> {
    if session.protocol() != found {
        return Err(ConfigError::ProtocolMismatch {
            expected: session.protocol(),
            found,
        });
    }
    Ok(())
}
