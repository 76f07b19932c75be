//! # Hardware Abstraction Layer for Radio Hardware
//!
//! This module defines the transport trait the control layer is written against.
//! The core never assumes a bus technology: it needs a command/register
//! read-write primitive, BUSY and IRQ line waits, and a reset pulse.
//!
//! ## Implementations
//!
//! - [`mock::MockHal`]: recording transport for tests and dry runs
//! - `raspberry_pi::RaspberryPiHal`: SPI + GPIO through `rppal` (feature `raspberry-pi`)

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during HAL operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    #[error("SPI communication error")]
    Spi,

    #[error("GPIO operation error")]
    Gpio,

    #[error("Register access error")]
    Register,

    #[error("Timeout waiting for operation")]
    Timeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Hardware Abstraction Layer trait for SX126x radio control
///
/// Implementations must be `Send`: the session moves the transport behind a
/// lock that is shared with the IRQ worker thread.
pub trait Hal: Send {
    /// Write a command with optional data to the radio
    fn write_command(&mut self, opcode: u8, data: &[u8]) -> Result<(), HalError>;

    /// Issue a command with `args` and read the response into `buf`
    ///
    /// The status byte the chip clocks out before the response is not
    /// included in `buf`.
    fn read_command(&mut self, opcode: u8, args: &[u8], buf: &mut [u8]) -> Result<(), HalError>;

    /// Write data to a radio register
    fn write_register(&mut self, addr: u16, data: &[u8]) -> Result<(), HalError>;

    /// Read data from a radio register
    fn read_register(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), HalError>;

    /// Block until the BUSY line is low, or fail with [`HalError::Timeout`]
    fn wait_busy(&mut self, timeout: Duration) -> Result<(), HalError>;

    /// Block until the IRQ line is asserted or `timeout` passes
    ///
    /// Returns `true` if the line is asserted.
    fn wait_irq(&mut self, timeout: Duration) -> Result<bool, HalError>;

    /// Pulse the reset line
    fn reset(&mut self) -> Result<(), HalError>;

    /// Drive an output pin (TX/RX enable lines)
    fn gpio_write(&mut self, pin: u8, value: bool) -> Result<(), HalError>;

    /// Release bus and pin bindings
    fn release(&mut self) -> Result<(), HalError> {
        Ok(())
    }
}

pub mod mock;

// Platform implementations
#[cfg(feature = "raspberry-pi")]
pub mod raspberry_pi;

pub use mock::{MockHal, MockOp};

#[cfg(feature = "raspberry-pi")]
pub use raspberry_pi::{RaspberryPiHal, RpiHalError};
