//! # SX126x Radio Control
//!
//! Configuration and operating-mode control for Semtech SX126x transceivers in
//! LoRa or FSK mode.
//!
//! ## Module Organization
//!
//! - `hal`: transport trait plus mock and Raspberry Pi implementations
//! - `commands`: opcodes and register addresses
//! - `irq`: IRQ status decoding
//! - `modulation`: modem and packet parameter types, airtime
//! - `session`: lifecycle, RF front end and IRQ dispatch
//! - `modem` / `packet`: parameter configurators
//! - `cad`, `rx`, `tx`: operating modes
//!
//! ## Usage Example
//!
//! ```rust
//! use sx126x_ctl::radio::hal::MockHal;
//! use sx126x_ctl::radio::modem::ModemConfigurator;
//! use sx126x_ctl::radio::modulation::{LoRaModulation, LoRaPacket, ModemParameters, PacketParameters};
//! use sx126x_ctl::radio::packet::PacketConfigurator;
//! use sx126x_ctl::radio::session::{RadioIdentity, RadioSession};
//! use sx126x_ctl::radio::tx::TxContinuousController;
//!
//! let mut session = RadioSession::begin(MockHal::new(), RadioIdentity::default())?;
//! session.set_frequency(868_000_000)?;
//! ModemConfigurator::apply(&mut session, ModemParameters::LoRa(LoRaModulation::default()))?;
//! PacketConfigurator::apply(&mut session, PacketParameters::LoRa(LoRaPacket::default()))?;
//!
//! let mut tx = TxContinuousController::new();
//! let stats = tx.send_next(&mut session, b"HeLoRa World!\0")?;
//! assert_eq!(stats.packet_len, 15);
//! session.end();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cad;
pub mod commands;
pub mod hal;
pub mod irq;
pub mod modem;
pub mod modulation;
pub mod packet;
pub mod rx;
pub mod session;
pub mod tx;

pub use irq::{StatusDecoder, StatusFlag, StatusFlags};
pub use session::{RadioEvent, RadioIdentity, RadioSession, SessionHandle};
