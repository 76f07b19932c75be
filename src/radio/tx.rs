//! # Continuous Transmit
//!
//! Each call to [`TxContinuousController::transmit`] sends one packet made of the
//! caller's payload followed by a counter byte, then blocks until `TxDone` or the
//! configured timeout. The repeat interval belongs to the caller.
//!
//! ```text
//! WriteBuffer ─► SetPacketParams (length) ─► ClearIrq ─► TXEN ─► SetTx ─► wait TxDone
//! ```

use crate::error::RadioError;
use crate::radio::commands::opcode;
use crate::radio::hal::Hal;
use crate::radio::irq::{StatusFlags, STATUS_MASK};
use crate::radio::modulation::airtime_ms;
use crate::radio::session::{OperatingMode, RadioSession, RfPath};
use std::time::{Duration, Instant};

pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest packet, payload plus counter byte
pub const MAX_PACKET_LEN: usize = 255;

/// Timing of one transmitted packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxStats {
    /// Time on air computed from the modem and packet parameters
    pub airtime_ms: f64,
    pub data_rate_bytes_per_sec: f64,
    /// Bytes on air, counter included
    pub packet_len: usize,
    pub counter: u8,
}

/// Sends packets and tracks the counter byte
#[derive(Debug, Clone)]
pub struct TxContinuousController {
    timeout: Duration,
    counter: u8,
}

impl Default for TxContinuousController {
    fn default() -> Self {
        Self::new()
    }
}

impl TxContinuousController {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TX_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout, counter: 0 }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Counter byte the next `send_next` will use
    pub fn counter(&self) -> u8 {
        self.counter
    }

    /// Send `payload` followed by the next counter byte
    ///
    /// The counter advances whether or not the packet completes.
    pub fn send_next<H: Hal + 'static>(
        &mut self,
        session: &mut RadioSession<H>,
        payload: &[u8],
    ) -> Result<TxStats, RadioError> {
        let counter = self.counter;
        self.counter = counter.wrapping_add(1);
        self.transmit(session, payload, counter)
    }

    /// Send one packet and block until it is on air or the timeout passes
    pub fn transmit<H: Hal + 'static>(
        &self,
        session: &mut RadioSession<H>,
        payload: &[u8],
        counter: u8,
    ) -> Result<TxStats, RadioError> {
        let modem = *session
            .modem()
            .ok_or(RadioError::NotConfigured("modem parameters"))?;
        let packet = *session
            .packet()
            .ok_or(RadioError::NotConfigured("packet parameters"))?;

        let len = payload.len() + 1;
        if len > MAX_PACKET_LEN {
            return Err(RadioError::PayloadTooLong {
                len,
                max: MAX_PACKET_LEN,
            });
        }
        let configured = usize::from(packet.payload_length());
        if packet.is_fixed_length() && len != configured {
            return Err(RadioError::PayloadLengthMismatch {
                len,
                expected: configured,
            });
        }
        let airtime = airtime_ms(&modem, &packet, len)
            .ok_or(RadioError::NotConfigured("packet parameters for the active modem"))?;

        let mut buffer = Vec::with_capacity(len + 1);
        buffer.push(0x00); // FIFO offset
        buffer.extend_from_slice(payload);
        buffer.push(counter);
        session.command(opcode::WRITE_BUFFER, &buffer)?;

        if configured != len {
            let updated = packet.with_payload_length(len as u8);
            let encoded = updated
                .encode()
                .map_err(|_| RadioError::PayloadLengthMismatch { len, expected: configured })?;
            session.command(opcode::SET_PACKET_PARAMS, &encoded)?;
            session.set_packet(updated);
        }

        session.command(opcode::CLEAR_IRQ_STATUS, &STATUS_MASK.to_be_bytes())?;
        session.take_latched(StatusFlags::TX_DONE | StatusFlags::TIMEOUT);
        session.set_rf_path(RfPath::Tx)?;

        session.set_mode(OperatingMode::Tx);
        let started = Instant::now();
        // timeout 0: no chip-side timeout, the host deadline applies
        if let Err(e) = session.command(opcode::SET_TX, &[0x00, 0x00, 0x00]) {
            session.set_mode(OperatingMode::Standby);
            return Err(e);
        }

        let outcome = session.wait_for(StatusFlags::TX_DONE | StatusFlags::TIMEOUT, self.timeout);
        if let Err(RadioError::SessionClosed) = outcome {
            return Err(RadioError::SessionClosed);
        }
        if let Err(e) = session.set_rf_path(RfPath::Off) {
            log::warn!("RF switch off after TX failed: {e}");
        }

        match outcome? {
            Some(flags) if flags.tx_done() => {
                let stats = TxStats {
                    airtime_ms: airtime,
                    data_rate_bytes_per_sec: len as f64 * 1000.0 / airtime,
                    packet_len: len,
                    counter,
                };
                log::info!(
                    "Transmitted {len} bytes (counter {counter}) in {:.2} ms, {:.2} byte/s",
                    stats.airtime_ms,
                    stats.data_rate_bytes_per_sec
                );
                Ok(stats)
            }
            _ => {
                let waited_ms = started.elapsed().as_millis() as u64;
                log::warn!("TX timeout after {waited_ms} ms");
                session.set_mode(OperatingMode::Standby);
                if let Err(e) = session.command(opcode::SET_STANDBY, &[0x00]) {
                    log::warn!("Standby after TX timeout failed: {e}");
                }
                Err(RadioError::TxTimeout { waited_ms })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::hal::MockHal;
    use crate::radio::modem::ModemConfigurator;
    use crate::radio::modulation::*;
    use crate::radio::packet::PacketConfigurator;
    use crate::radio::session::RadioIdentity;

    fn configured_session(mock: &MockHal, packet: LoRaPacket) -> RadioSession<MockHal> {
        let mut session = RadioSession::begin(mock.clone(), RadioIdentity::default()).unwrap();
        ModemConfigurator::apply(&mut session, ModemParameters::LoRa(LoRaModulation::default())).unwrap();
        PacketConfigurator::apply(&mut session, PacketParameters::LoRa(packet)).unwrap();
        session
    }

    #[test]
    fn test_transmit_frames_payload_and_counter() {
        let mock = MockHal::new();
        let mut session = configured_session(&mock, LoRaPacket::default());
        let tx = TxContinuousController::new();

        let stats = tx.transmit(&mut session, b"HeLoRa World!\0", 7).unwrap();
        let mut expected = vec![0x00];
        expected.extend_from_slice(b"HeLoRa World!\0");
        expected.push(7);
        assert_eq!(mock.last_command(opcode::WRITE_BUFFER), Some(expected));
        assert_eq!(mock.last_command(opcode::SET_TX), Some(vec![0, 0, 0]));

        assert_eq!(stats.packet_len, 15);
        assert!((stats.airtime_ms - 50.432).abs() < 1e-9);
        assert!((stats.data_rate_bytes_per_sec - 297.43).abs() < 0.01);
        assert_eq!(session.mode(), OperatingMode::Standby);
    }

    #[test]
    fn test_length_update_for_explicit_header() {
        let mock = MockHal::new();
        let mut session = configured_session(&mock, LoRaPacket::default());
        let tx = TxContinuousController::new();

        tx.transmit(&mut session, b"hi", 0).unwrap();
        assert_eq!(
            mock.last_command(opcode::SET_PACKET_PARAMS),
            Some(vec![0x00, 0x0C, 0x00, 0x03, 0x01, 0x00])
        );
        assert_eq!(session.packet().map(|p| p.payload_length()), Some(3));
    }

    #[test]
    fn test_implicit_header_requires_exact_length() {
        let mock = MockHal::new();
        let packet = LoRaPacket {
            header_type: HeaderType::Implicit,
            payload_length: 4,
            ..LoRaPacket::default()
        };
        let mut session = configured_session(&mock, packet);
        let tx = TxContinuousController::new();
        mock.clear_ops();

        let err = tx.transmit(&mut session, b"hello", 0).unwrap_err();
        assert_eq!(err, RadioError::PayloadLengthMismatch { len: 6, expected: 4 });
        assert_eq!(mock.write_count(), 0);

        tx.transmit(&mut session, b"abc", 0).unwrap();
    }

    #[test]
    fn test_payload_too_long() {
        let mock = MockHal::new();
        let mut session = configured_session(&mock, LoRaPacket::default());
        let tx = TxContinuousController::new();
        let err = tx.transmit(&mut session, &[0u8; 255], 0).unwrap_err();
        assert_eq!(err, RadioError::PayloadTooLong { len: 256, max: 255 });
    }

    #[test]
    fn test_requires_configuration() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock, RadioIdentity::default()).unwrap();
        let tx = TxContinuousController::new();
        assert_eq!(
            tx.transmit(&mut session, b"x", 0),
            Err(RadioError::NotConfigured("modem parameters"))
        );
    }
}
