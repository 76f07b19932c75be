//! Modulation configuration
//!
//! Applies a [`ModemParameters`] set to a session in a single `SetModulationParams`
//! write. All fields are validated and encoded before anything is sent, so a
//! rejected parameter set leaves the chip untouched.

use crate::error::ConfigError;
use crate::radio::commands::opcode;
use crate::radio::hal::Hal;
use crate::radio::modulation::ModemParameters;
use crate::radio::session::RadioSession;

/// Applies modulation parameters
pub struct ModemConfigurator;

impl ModemConfigurator {
    pub fn apply<H: Hal + 'static>(
        session: &mut RadioSession<H>,
        params: ModemParameters,
    ) -> Result<(), ConfigError> {
        if params.protocol() != session.protocol() {
            return Err(ConfigError::ProtocolMismatch {
                expected: session.protocol(),
                found: params.protocol(),
            });
        }

        let payload = params.encode()?;
        session.command(opcode::SET_MODULATION_PARAMS, &payload)?;
        session.set_modem(params);

        match params {
            ModemParameters::LoRa(m) => log::info!(
                "LoRa modem: SF{}, BW {} Hz, CR 4/{}, LDRO {}",
                m.sf.value(),
                m.bw.hz(),
                m.cr.denominator(),
                if m.ldro_enabled() { "on" } else { "off" }
            ),
            ModemParameters::Fsk(m) => log::info!(
                "FSK modem: {} bps, fdev {} Hz, RX BW {} Hz, {:?}",
                m.bitrate_bps,
                m.fdev_hz,
                m.bandwidth.hz(),
                m.pulse_shape
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::hal::MockHal;
    use crate::radio::modulation::*;
    use crate::radio::session::RadioIdentity;

    #[test]
    fn test_lora_single_write() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock.clone(), RadioIdentity::default()).unwrap();
        mock.clear_ops();

        let params = ModemParameters::LoRa(LoRaModulation::new(
            SpreadingFactor::SF12,
            LoRaBandwidth::BW125,
            CodingRate::CR4_5,
        ));
        ModemConfigurator::apply(&mut session, params).unwrap();

        assert_eq!(mock.write_count(), 1);
        assert_eq!(
            mock.last_command(opcode::SET_MODULATION_PARAMS),
            Some(vec![0x0C, 0x04, 0x01, 0x01])
        );
        assert_eq!(session.modem(), Some(&params));
    }

    #[test]
    fn test_invalid_fsk_rejected_before_write() {
        let mock = MockHal::new();
        let identity = RadioIdentity {
            protocol: Protocol::Fsk,
            ..RadioIdentity::default()
        };
        let mut session = RadioSession::begin(mock.clone(), identity).unwrap();
        mock.clear_ops();

        let params = ModemParameters::Fsk(FskModulation {
            bitrate_bps: 100,
            fdev_hz: 5_000,
            bandwidth: FskBandwidth::from_hz(23_400).unwrap(),
            pulse_shape: PulseShape::Bt1,
        });
        let err = ModemConfigurator::apply(&mut session, params).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter(_)));
        assert_eq!(mock.write_count(), 0);
        assert!(session.modem().is_none());
    }
}
