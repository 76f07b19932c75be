//! # sx126x-ctl - Configuration and Control for SX126x Transceivers
//!
//! The sx126x-ctl crate drives Semtech SX1261/SX1262/SX1268 radios in LoRa or
//! FSK mode over a pluggable transport. It covers the control layer that sits
//! between an application and the chip's command interface.
//!
//! ## Features
//!
//! - Session lifecycle with a guaranteed single release of the transport
//! - Modem, packet, sync word, frequency, PA and RX gain configuration
//! - Continuous transmit with a packet counter and airtime statistics
//! - Continuous receive, pulled through a FIFO reader or pushed to a handler
//! - Channel Activity Detection with AN1200.48 threshold presets
//! - IRQ status decoding and event dispatch from a worker thread
//! - JSON configuration files
//! - Raspberry Pi transport over `rppal` (feature `raspberry-pi`)
//!
//! ## Usage
//!
//! ```rust
//! use sx126x_ctl::radio::hal::MockHal;
//! use sx126x_ctl::{RadioConfig, RadioSession};
//!
//! let config = RadioConfig::default();
//! let mut session = RadioSession::begin(MockHal::new(), config.to_identity()?)?;
//! config.apply_to(&mut session)?;
//! assert_eq!(session.frequency_hz(), Some(868_000_000));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod radio;

pub use crate::config::RadioConfig;
pub use crate::error::{ConfigError, RadioError};
pub use crate::logging::{init_logger, log_info};

pub use radio::cad::{CadController, CadOutcome, CadParameters};
pub use radio::hal::{Hal, HalError};
pub use radio::irq::{StatusDecoder, StatusFlag, StatusFlags};
pub use radio::modem::ModemConfigurator;
pub use radio::modulation::{ModemParameters, PacketParameters, Protocol};
pub use radio::packet::PacketConfigurator;
pub use radio::rx::{ReceivedFrame, RxContinuousController};
pub use radio::session::{RadioEvent, RadioIdentity, RadioSession, SessionHandle};
pub use radio::tx::{TxContinuousController, TxStats};
