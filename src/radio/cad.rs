//! Channel Activity Detection (CAD) for LoRa
//!
//! A CAD cycle listens for a few symbols and reports whether LoRa preamble energy
//! is present. The controller is a small state machine on top of a session:
//!
//! ```text
//! Idle ──configure──► Armed ──run──► Sensing ──IRQ──► Done{Detected | NotDetected | TimedOut}
//!                       ▲                                  │
//!                       └──────────────run─────────────────┘
//! ```
//!
//! Detection thresholds follow AN1200.48. With [`CadExitMode::ExitToRx`] the chip
//! enters RX on its own after a detection; the controller only configures that
//! behaviour and reports the event.

use crate::error::{ConfigError, RadioError};
use crate::radio::commands::opcode;
use crate::radio::hal::Hal;
use crate::radio::irq::{StatusFlags, STATUS_MASK};
use crate::radio::modulation::{LoRaBandwidth, LoRaModulation, Protocol, SpreadingFactor};
use crate::radio::session::{OperatingMode, RadioSession, RfPath};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest timeout the 24-bit `SetCadParams` field holds
pub const CAD_TIMEOUT_MAX: u32 = 0x00FF_FFFF;

/// Number of symbols a CAD cycle listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CadSymbols {
    One = 1,
    Two = 2,
    Four = 4,
    Eight = 8,
    Sixteen = 16,
}

impl CadSymbols {
    pub fn from_count(count: u8) -> Option<Self> {
        Some(match count {
            1 => Self::One,
            2 => Self::Two,
            4 => Self::Four,
            8 => Self::Eight,
            16 => Self::Sixteen,
            _ => return None,
        })
    }

    pub const fn count(self) -> u8 {
        self as u8
    }

    /// `SetCadParams` symbol code
    pub const fn code(self) -> u8 {
        match self {
            Self::One => 0x00,
            Self::Two => 0x01,
            Self::Four => 0x02,
            Self::Eight => 0x03,
            Self::Sixteen => 0x04,
        }
    }
}

/// CAD exit modes determining radio behavior after detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CadExitMode {
    /// Return to standby after CAD
    ExitOnly = 0x00,
    /// Switch to RX if activity detected
    ExitToRx = 0x01,
}

impl CadExitMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::ExitOnly),
            1 => Some(Self::ExitToRx),
            _ => None,
        }
    }
}

/// Channel Activity Detection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadParameters {
    pub symbol_count: CadSymbols,

    /// Peak detection threshold (18-30)
    /// Higher values reduce false positives but may miss weak signals
    pub detection_peak: u8,

    /// Minimum detection threshold (8-15)
    pub detection_min: u8,

    pub exit_mode: CadExitMode,

    /// RX timeout after a detection in `ExitToRx` mode, in 15.625 µs steps
    pub timeout_steps: u32,
}

impl Default for CadParameters {
    /// SF7/BW125 values
    fn default() -> Self {
        Self {
            symbol_count: CadSymbols::Two,
            detection_peak: 22,
            detection_min: 10,
            exit_mode: CadExitMode::ExitOnly,
            timeout_steps: 0,
        }
    }
}

impl CadParameters {
    /// Returns optimal CAD parameters based on AN1200.48 empirical data
    pub fn optimal(sf: SpreadingFactor, bw: LoRaBandwidth) -> Self {
        use CadSymbols::*;
        use SpreadingFactor::*;

        let (symbol_count, detection_peak, detection_min) = match bw {
            // Table 1: BW125
            LoRaBandwidth::BW125 => match sf {
                SF5 | SF6 | SF7 | SF8 | SF9 => (Two, 22, 10),
                SF10 | SF11 => (Four, 21, 10),
                SF12 => (Eight, 20, 10),
            },

            // Table 43: BW500
            LoRaBandwidth::BW500 => match sf {
                SF5 | SF6 => (Four, 22, 10),
                SF7 | SF8 | SF9 => (Four, 21, 10),
                SF10 | SF11 => (Eight, 20, 10),
                SF12 => (Sixteen, 19, 10),
            },

            LoRaBandwidth::BW250 => match sf {
                SF5 | SF6 | SF7 => (Two, 22, 10),
                SF8 | SF9 | SF10 | SF11 => (Four, 21, 10),
                SF12 => (Eight, 20, 10),
            },

            // Narrow bandwidths: more symbols needed for accuracy
            LoRaBandwidth::BW62_5 | LoRaBandwidth::BW41_7 | LoRaBandwidth::BW31_2 => match sf {
                SF5 | SF6 | SF7 | SF8 | SF9 => (Four, 22, 10),
                SF10 | SF11 => (Eight, 21, 10),
                SF12 => (Sixteen, 20, 10),
            },

            LoRaBandwidth::BW20_8
            | LoRaBandwidth::BW15_6
            | LoRaBandwidth::BW10_4
            | LoRaBandwidth::BW7_8 => match sf {
                SF5 | SF6 | SF7 | SF8 | SF9 => (Eight, 22, 10),
                SF10 | SF11 => (Sixteen, 21, 10),
                SF12 => (Sixteen, 20, 10),
            },
        };

        Self {
            symbol_count,
            detection_peak,
            detection_min,
            ..Self::default()
        }
    }

    pub fn with_exit_mode(mut self, exit_mode: CadExitMode, timeout_steps: u32) -> Self {
        self.exit_mode = exit_mode;
        self.timeout_steps = timeout_steps;
        self
    }

    /// `SetCadParams` payload: `[symbols, peak, min, exit, timeout (3)]`
    pub fn encode(&self) -> Result<[u8; 7], ConfigError> {
        if self.timeout_steps > CAD_TIMEOUT_MAX {
            return Err(ConfigError::InvalidParameter(format!(
                "CAD timeout {} exceeds 0x{CAD_TIMEOUT_MAX:06X}",
                self.timeout_steps
            )));
        }
        let timeout = self.timeout_steps.to_be_bytes();
        Ok([
            self.symbol_count.code(),
            self.detection_peak,
            self.detection_min,
            self.exit_mode as u8,
            timeout[1],
            timeout[2],
            timeout[3],
        ])
    }

    /// Approximate length of one CAD cycle
    pub fn duration_ms(&self, modem: &LoRaModulation) -> u32 {
        let duration = f64::from(self.symbol_count.count()) * modem.symbol_time_ms();
        duration.ceil() as u32
    }
}

/// Result of one CAD cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CadOutcome {
    Detected,
    NotDetected,
    /// `TimeoutRxOrTx` fired without `CadDone`
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadState {
    Idle,
    Armed,
    Sensing,
    Done(CadOutcome),
}

/// CAD detection statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CadStats {
    pub total_cad_operations: u32,
    pub activity_detected: u32,
    pub channel_clear: u32,
    pub timeouts: u32,
}

impl CadStats {
    pub fn record(&mut self, outcome: CadOutcome) {
        self.total_cad_operations += 1;
        match outcome {
            CadOutcome::Detected => self.activity_detected += 1,
            CadOutcome::NotDetected => self.channel_clear += 1,
            CadOutcome::TimedOut => self.timeouts += 1,
        }
    }

    /// Gets the detection rate (0.0 to 1.0)
    pub fn detection_rate(&self) -> f32 {
        if self.total_cad_operations == 0 {
            0.0
        } else {
            self.activity_detected as f32 / self.total_cad_operations as f32
        }
    }
}

/// Configures and runs CAD cycles
#[derive(Debug)]
pub struct CadController {
    state: CadState,
    params: Option<CadParameters>,
    stats: CadStats,
}

impl Default for CadController {
    fn default() -> Self {
        Self::new()
    }
}

impl CadController {
    pub fn new() -> Self {
        Self {
            state: CadState::Idle,
            params: None,
            stats: CadStats::default(),
        }
    }

    pub fn state(&self) -> CadState {
        self.state
    }

    pub fn params(&self) -> Option<&CadParameters> {
        self.params.as_ref()
    }

    pub fn stats(&self) -> &CadStats {
        &self.stats
    }

    /// Write CAD parameters. Does not start sensing.
    pub fn configure<H: Hal + 'static>(
        &mut self,
        session: &mut RadioSession<H>,
        params: CadParameters,
    ) -> Result<(), ConfigError> {
        if session.protocol() != Protocol::LoRa {
            return Err(ConfigError::ProtocolMismatch {
                expected: session.protocol(),
                found: Protocol::LoRa,
            });
        }
        let payload = params.encode()?;
        session.command(opcode::SET_CAD_PARAMS, &payload)?;
        session.set_cad_exit_to_rx(params.exit_mode == CadExitMode::ExitToRx);

        self.params = Some(params);
        self.state = CadState::Armed;
        log::debug!(
            "CAD configured: {} symbols, peak={}, min={}, mode={:?}, timeout={}",
            params.symbol_count.count(),
            params.detection_peak,
            params.detection_min,
            params.exit_mode,
            params.timeout_steps
        );
        Ok(())
    }

    /// Start one CAD cycle and return immediately
    ///
    /// Completion arrives through the IRQ as `CadDone`/`CadDetected`.
    pub fn run<H: Hal + 'static>(&mut self, session: &mut RadioSession<H>) -> Result<(), RadioError> {
        if self.state == CadState::Idle {
            return Err(RadioError::CadNotArmed);
        }

        session.command(opcode::CLEAR_IRQ_STATUS, &STATUS_MASK.to_be_bytes())?;
        session.take_latched(Self::completion_flags());
        session.set_rf_path(RfPath::Rx)?;

        session.set_mode(OperatingMode::Cad);
        if let Err(e) = session.command(opcode::SET_CAD, &[]) {
            session.set_mode(OperatingMode::Standby);
            return Err(e);
        }
        self.state = CadState::Sensing;
        log::debug!("CAD started");
        Ok(())
    }

    fn completion_flags() -> StatusFlags {
        StatusFlags::CAD_DONE | StatusFlags::CAD_DETECTED | StatusFlags::TIMEOUT
    }

    /// Feed decoded interrupt flags; returns the outcome once sensing finishes
    pub fn on_status(&mut self, flags: StatusFlags) -> Option<CadOutcome> {
        if self.state != CadState::Sensing {
            return None;
        }
        let outcome = if flags.cad_done() {
            if flags.cad_detected() {
                CadOutcome::Detected
            } else {
                CadOutcome::NotDetected
            }
        } else if flags.timeout() {
            CadOutcome::TimedOut
        } else {
            return None;
        };

        self.state = CadState::Done(outcome);
        self.stats.record(outcome);
        match outcome {
            CadOutcome::Detected => log::info!("CAD: activity detected"),
            CadOutcome::NotDetected => log::debug!("CAD: channel clear"),
            CadOutcome::TimedOut => log::warn!("CAD: timed out"),
        }
        Some(outcome)
    }

    /// Block until the running cycle finishes or `timeout` passes
    ///
    /// `Ok(None)` means the host-side wait expired; the cycle may still finish.
    pub fn wait_outcome<H: Hal + 'static>(
        &mut self,
        session: &mut RadioSession<H>,
        timeout: Duration,
    ) -> Result<Option<CadOutcome>, RadioError> {
        match self.state {
            CadState::Done(outcome) => return Ok(Some(outcome)),
            CadState::Idle => return Err(RadioError::CadNotArmed),
            CadState::Armed => return Ok(None),
            CadState::Sensing => {}
        }
        match session.wait_for(StatusFlags::CAD_DONE | StatusFlags::TIMEOUT, timeout)? {
            Some(flags) => Ok(self.on_status(flags)),
            None => Ok(None),
        }
    }
}
