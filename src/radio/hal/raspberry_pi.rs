//! # Raspberry Pi HAL Implementation
//!
//! SPI and GPIO transport for SX126x modules wired to a Raspberry Pi 4 or 5,
//! built on `rppal`.
//!
//! ## Hardware Setup
//!
//! SPI must be enabled in `/boot/config.txt` (`dtparam=spi=on`). Bus and chip
//! select come from the [`RadioIdentity`]:
//! - **SPI0**: `/dev/spidev0.0`, `/dev/spidev0.1`
//! - **SPI1**: `/dev/spidev1.0`, `/dev/spidev1.1`, `/dev/spidev1.2`
//!
//! ### Control Pins (BCM numbering, defaults of the example wiring)
//! ```text
//! BCM GPIO │ SX126x Pin │ Function
//! ─────────┼────────────┼──────────────────────────
//! GPIO 18  │ NRESET     │ Reset (output, active low)
//! GPIO 20  │ BUSY       │ Status (input)
//! GPIO 16  │ DIO1       │ Interrupt (input, rising edge)
//! GPIO 6   │ TXEN       │ RF switch TX path (optional)
//! -        │ RXEN       │ RF switch RX path (optional)
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use sx126x_ctl::radio::hal::RaspberryPiHal;
//! use sx126x_ctl::radio::session::{RadioIdentity, RadioSession};
//!
//! let identity = RadioIdentity::default();
//! let hal = RaspberryPiHal::from_identity(&identity)?;
//! let session = RadioSession::begin(hal, identity)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::radio::commands::opcode;
use crate::radio::hal::{Hal, HalError};
use crate::radio::session::RadioIdentity;
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use rppal::spi::{Bus, Error as SpiError, Mode, SlaveSelect, Spi};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const WRITE_REGISTER: u8 = 0x0D;
const READ_REGISTER: u8 = 0x1D;
const NOP: u8 = 0x00;

/// BUSY wait applied before every SPI transaction
const TRANSACTION_BUSY_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors specific to Raspberry Pi HAL implementation
#[derive(Error, Debug)]
pub enum RpiHalError {
    /// SPI bus initialization failed
    #[error("SPI initialization failed: {0}")]
    SpiInit(#[from] SpiError),
    /// GPIO initialization failed
    #[error("GPIO initialization failed: {0}")]
    GpioInit(#[from] rppal::gpio::Error),
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<RpiHalError> for HalError {
    fn from(err: RpiHalError) -> Self {
        match err {
            RpiHalError::SpiInit(_) => HalError::Spi,
            RpiHalError::GpioInit(_) => HalError::Gpio,
            RpiHalError::InvalidConfig(msg) => HalError::InvalidConfig(msg),
        }
    }
}

/// Raspberry Pi transport for one SX126x
pub struct RaspberryPiHal {
    spi: Spi,
    busy: InputPin,
    irq: InputPin,
    reset: OutputPin,
    /// TXEN/RXEN outputs, keyed by BCM number
    outputs: Vec<(u8, OutputPin)>,
    bus_info: String,
}

impl RaspberryPiHal {
    /// Open the SPI device and pins named by `identity`
    pub fn from_identity(identity: &RadioIdentity) -> Result<Self, RpiHalError> {
        RaspberryPiHalBuilder::from_identity(identity).build()
    }

    fn open(builder: &RaspberryPiHalBuilder) -> Result<Self, RpiHalError> {
        let bus = match builder.bus_id {
            0 => Bus::Spi0,
            1 => Bus::Spi1,
            2 => Bus::Spi2,
            3 => Bus::Spi3,
            4 => Bus::Spi4,
            5 => Bus::Spi5,
            6 => Bus::Spi6,
            other => {
                return Err(RpiHalError::InvalidConfig(format!("Invalid SPI bus {other}")))
            }
        };
        let slave_select = match builder.cs_id {
            0 => SlaveSelect::Ss0,
            1 => SlaveSelect::Ss1,
            2 => SlaveSelect::Ss2,
            other => {
                return Err(RpiHalError::InvalidConfig(format!("Invalid chip select {other}")))
            }
        };

        let spi = Spi::new(bus, slave_select, builder.spi_speed, Mode::Mode0)?;
        let bus_info = format!("SPI{}.{}", builder.bus_id, builder.cs_id);

        let gpio = Gpio::new()?;
        let busy = gpio.get(builder.busy_pin)?.into_input();
        let mut irq = gpio.get(builder.irq_pin)?.into_input();
        irq.set_interrupt(Trigger::RisingEdge)?;
        // active low, idle high
        let reset = gpio.get(builder.reset_pin)?.into_output_high();

        let mut outputs = Vec::new();
        for pin in [builder.txen_pin, builder.rxen_pin].into_iter().flatten() {
            outputs.push((pin, gpio.get(pin)?.into_output_low()));
        }

        log::info!("Raspberry Pi HAL initialized:");
        log::info!("  SPI: {bus_info} at {} Hz", builder.spi_speed);
        log::info!("  RESET: GPIO {}", builder.reset_pin);
        log::info!("  BUSY: GPIO {}", builder.busy_pin);
        log::info!("  IRQ: GPIO {}", builder.irq_pin);
        if let Some(pin) = builder.txen_pin {
            log::info!("  TXEN: GPIO {pin}");
        }
        if let Some(pin) = builder.rxen_pin {
            log::info!("  RXEN: GPIO {pin}");
        }

        Ok(Self {
            spi,
            busy,
            irq,
            reset,
            outputs,
            bus_info,
        })
    }

    pub fn bus_info(&self) -> &str {
        &self.bus_info
    }

    fn transfer(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), HalError> {
        self.wait_busy(TRANSACTION_BUSY_TIMEOUT)?;
        self.spi.transfer(read, write).map_err(|e| {
            log::error!("SPI transfer failed: {e}");
            HalError::Spi
        })?;
        Ok(())
    }

    fn write(&mut self, write: &[u8]) -> Result<(), HalError> {
        self.wait_busy(TRANSACTION_BUSY_TIMEOUT)?;
        self.spi.write(write).map_err(|e| {
            log::error!("SPI write failed: {e}");
            HalError::Spi
        })?;
        Ok(())
    }
}

impl Hal for RaspberryPiHal {
    fn write_command(&mut self, opcode: u8, data: &[u8]) -> Result<(), HalError> {
        let mut cmd_buf = Vec::with_capacity(1 + data.len());
        cmd_buf.push(opcode);
        cmd_buf.extend_from_slice(data);
        self.write(&cmd_buf)?;
        log::trace!("SPI write command 0x{opcode:02X}, {} bytes", data.len());
        Ok(())
    }

    fn read_command(&mut self, op: u8, args: &[u8], buf: &mut [u8]) -> Result<(), HalError> {
        // GetStatus answers on the byte right after the opcode
        let skip = if op == opcode::GET_STATUS {
            1
        } else {
            2 + args.len()
        };
        let mut cmd_buf = Vec::with_capacity(skip + buf.len());
        cmd_buf.push(op);
        cmd_buf.extend_from_slice(args);
        cmd_buf.resize(skip + buf.len(), NOP);

        let mut read_buf = vec![0u8; cmd_buf.len()];
        self.transfer(&cmd_buf, &mut read_buf)?;
        buf.copy_from_slice(&read_buf[skip..]);
        log::trace!("SPI read command 0x{op:02X}, {} bytes", buf.len());
        Ok(())
    }

    fn write_register(&mut self, addr: u16, data: &[u8]) -> Result<(), HalError> {
        let [msb, lsb] = addr.to_be_bytes();
        let mut cmd_buf = Vec::with_capacity(3 + data.len());
        cmd_buf.extend_from_slice(&[WRITE_REGISTER, msb, lsb]);
        cmd_buf.extend_from_slice(data);
        self.write(&cmd_buf).map_err(|_| HalError::Register)?;
        log::trace!("Register write 0x{addr:04X}, {} bytes", data.len());
        Ok(())
    }

    fn read_register(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), HalError> {
        let [msb, lsb] = addr.to_be_bytes();
        let mut cmd_buf = vec![READ_REGISTER, msb, lsb, NOP];
        cmd_buf.resize(4 + buf.len(), NOP);

        let mut read_buf = vec![0u8; cmd_buf.len()];
        self.transfer(&cmd_buf, &mut read_buf)
            .map_err(|_| HalError::Register)?;
        buf.copy_from_slice(&read_buf[4..]);
        log::trace!("Register read 0x{addr:04X}, {} bytes", buf.len());
        Ok(())
    }

    fn wait_busy(&mut self, timeout: Duration) -> Result<(), HalError> {
        let start = Instant::now();
        while self.busy.read() == Level::High {
            if start.elapsed() >= timeout {
                log::warn!("BUSY pin timeout after {}ms", timeout.as_millis());
                return Err(HalError::Timeout);
            }
            thread::sleep(Duration::from_micros(10));
        }
        Ok(())
    }

    fn wait_irq(&mut self, timeout: Duration) -> Result<bool, HalError> {
        if self.irq.is_high() {
            return Ok(true);
        }
        match self.irq.poll_interrupt(true, Some(timeout)) {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => {
                log::error!("IRQ poll failed: {e}");
                Err(HalError::Gpio)
            }
        }
    }

    fn reset(&mut self) -> Result<(), HalError> {
        log::debug!("Performing hardware reset of SX126x");
        self.reset.set_low();
        thread::sleep(Duration::from_millis(1));
        self.reset.set_high();
        thread::sleep(Duration::from_millis(10));
        Ok(())
    }

    fn gpio_write(&mut self, pin: u8, value: bool) -> Result<(), HalError> {
        match self.outputs.iter_mut().find(|(p, _)| *p == pin) {
            Some((_, out)) => {
                out.write(if value { Level::High } else { Level::Low });
                Ok(())
            }
            None => {
                log::warn!("GPIO write to unconfigured pin {pin}");
                Err(HalError::Gpio)
            }
        }
    }

    fn release(&mut self) -> Result<(), HalError> {
        for (_, out) in &mut self.outputs {
            out.set_low();
        }
        self.irq.clear_interrupt().map_err(|e| {
            log::warn!("Clearing IRQ interrupt failed: {e}");
            HalError::Gpio
        })?;
        log::debug!("Released {}", self.bus_info);
        Ok(())
    }
}

/// Builder for Raspberry Pi HAL configuration
///
/// Validates the pin assignment before any device is opened.
#[derive(Debug, Clone)]
pub struct RaspberryPiHalBuilder {
    bus_id: u8,
    cs_id: u8,
    spi_speed: u32,
    reset_pin: u8,
    busy_pin: u8,
    irq_pin: u8,
    txen_pin: Option<u8>,
    rxen_pin: Option<u8>,
}

impl Default for RaspberryPiHalBuilder {
    fn default() -> Self {
        Self::from_identity(&RadioIdentity::default())
    }
}

impl RaspberryPiHalBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_identity(identity: &RadioIdentity) -> Self {
        Self {
            bus_id: identity.bus_id,
            cs_id: identity.cs_id,
            spi_speed: 8_000_000, // safe for SX126x
            reset_pin: identity.reset_pin,
            busy_pin: identity.busy_pin,
            irq_pin: identity.irq_pin,
            txen_pin: identity.txen_pin,
            rxen_pin: identity.rxen_pin,
        }
    }

    /// Set the SPI clock speed in Hz (max 16 MHz for SX126x)
    pub fn spi_speed(mut self, speed: u32) -> Self {
        self.spi_speed = speed;
        self
    }

    pub fn validate(&self) -> Result<(), RpiHalError> {
        if self.bus_id > 6 {
            return Err(RpiHalError::InvalidConfig(format!(
                "Invalid SPI bus {}, only 0-6 supported",
                self.bus_id
            )));
        }
        if self.cs_id > 2 {
            return Err(RpiHalError::InvalidConfig(format!(
                "Invalid chip select {}, only 0-2 supported",
                self.cs_id
            )));
        }
        if self.spi_speed == 0 || self.spi_speed > 16_000_000 {
            return Err(RpiHalError::InvalidConfig(format!(
                "Invalid SPI speed {} Hz, must be 1-16000000",
                self.spi_speed
            )));
        }

        let mut pins = vec![self.reset_pin, self.busy_pin, self.irq_pin];
        pins.extend(self.txen_pin);
        pins.extend(self.rxen_pin);
        if let Some(&pin) = pins.iter().find(|&&pin| pin > 27) {
            return Err(RpiHalError::InvalidConfig(format!(
                "GPIO {pin} is not on the 40-pin header"
            )));
        }
        pins.sort_unstable();
        if let Some(pair) = pins.windows(2).find(|w| w[0] == w[1]) {
            return Err(RpiHalError::InvalidConfig(format!(
                "GPIO {} assigned twice",
                pair[0]
            )));
        }
        Ok(())
    }

    pub fn build(self) -> Result<RaspberryPiHal, RpiHalError> {
        self.validate()?;
        RaspberryPiHal::open(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_follow_identity() {
        let builder = RaspberryPiHalBuilder::new();
        assert_eq!(builder.bus_id, 0);
        assert_eq!(builder.cs_id, 0);
        assert_eq!(builder.reset_pin, 18);
        assert_eq!(builder.busy_pin, 20);
        assert_eq!(builder.irq_pin, 16);
        assert_eq!(builder.txen_pin, Some(6));
        assert_eq!(builder.rxen_pin, None);
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_bad_assignments() {
        let identity = RadioIdentity {
            busy_pin: 16,
            ..RadioIdentity::default()
        };
        let err = RaspberryPiHalBuilder::from_identity(&identity).validate().unwrap_err();
        assert!(err.to_string().contains("GPIO 16 assigned twice"));

        let identity = RadioIdentity {
            cs_id: 3,
            ..RadioIdentity::default()
        };
        assert!(RaspberryPiHalBuilder::from_identity(&identity).validate().is_err());

        let builder = RaspberryPiHalBuilder::new().spi_speed(20_000_000);
        assert!(matches!(builder.build(), Err(RpiHalError::InvalidConfig(_))));
    }

    #[test]
    fn test_error_conversion() {
        let err: HalError = RpiHalError::InvalidConfig("x".into()).into();
        assert_eq!(err, HalError::InvalidConfig("x".into()));
    }
}
