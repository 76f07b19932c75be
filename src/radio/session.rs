//! # Radio Session
//!
//! A [`RadioSession`] owns one transceiver from `begin` to `end`: the transport,
//! the pin assignment, the cached configuration and the event sink that receives
//! interrupt-driven events.
//!
//! ## Lifecycle
//!
//! ```text
//! begin ──► configure (modem, packet, power, ...) ──► run (CAD | RX | TX) ──► end
//!   │                                                                       ▲
//!   └── failure: transport released, no session value ───────────────────────┘
//! ```
//!
//! `end` releases the transport at most once, whether it is reached from a normal
//! exit, a [`SessionHandle`] on another thread (signal handler, IRQ handler) or
//! `Drop`. Operations issued after `end` fail with [`RadioError::SessionClosed`],
//! and any thread blocked in a TX or CAD wait is woken with the same error.
//!
//! ## Interrupt servicing
//!
//! [`RadioSession::service_irq`] waits for the IRQ line, reads and clears the
//! status register, publishes the decoded flags to blocked waiters and forwards a
//! [`RadioEvent`] to the registered handler. The handler runs with neither the
//! transport lock nor the handler slot held, so it may end the session or
//! replace or clear itself. In push mode a dedicated worker thread services the line;
//! otherwise blocking waits service it themselves in short slices.

use crate::error::RadioError;
use crate::radio::cad::CadOutcome;
use crate::radio::commands::{opcode, register, XTAL_FREQ_HZ};
use crate::radio::hal::{Hal, HalError};
use crate::radio::irq::{StatusDecoder, StatusFlags, STATUS_MASK};
use crate::radio::modulation::{ModemParameters, PacketParameters, Protocol};
use crate::radio::rx::{self, ReceivedFrame};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest single wait on the IRQ line while a caller polls
pub const IRQ_POLL_SLICE: Duration = Duration::from_millis(10);

/// IRQ wait used by the worker thread
const WORKER_SLICE: Duration = Duration::from_millis(50);

/// Bound on the BUSY wait after the reset pulse
const BEGIN_BUSY_TIMEOUT: Duration = Duration::from_millis(100);

const STANDBY_RC: u8 = 0x00;
const RAMP_200_US: u8 = 0x04;

// Chip modes reported in GetStatus bits 6:4
const CHIP_MODE_STBY_RC: u8 = 0x2;
const CHIP_MODE_STBY_XOSC: u8 = 0x3;

/// Image calibration bands: (low Hz, high Hz, CalibrateImage arguments)
const IMAGE_CALIBRATION_BANDS: [(u32, u32, [u8; 2]); 5] = [
    (430_000_000, 440_000_000, [0x6B, 0x6F]),
    (470_000_000, 510_000_000, [0x75, 0x81]),
    (779_000_000, 787_000_000, [0xC1, 0xC5]),
    (863_000_000, 870_000_000, [0xD7, 0xDB]),
    (902_000_000, 928_000_000, [0xE1, 0xE9]),
];

/// Lock a mutex, recovering the value if a handler panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bus, pin and modem assignment of one transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioIdentity {
    pub bus_id: u8,
    pub cs_id: u8,
    pub reset_pin: u8,
    pub busy_pin: u8,
    pub irq_pin: u8,
    pub txen_pin: Option<u8>,
    pub rxen_pin: Option<u8>,
    pub protocol: Protocol,
}

impl Default for RadioIdentity {
    fn default() -> Self {
        Self {
            bus_id: 0,
            cs_id: 0,
            reset_pin: 18,
            busy_pin: 20,
            irq_pin: 16,
            txen_pin: Some(6),
            rxen_pin: None,
            protocol: Protocol::LoRa,
        }
    }
}

/// Receiver gain setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RxGain {
    /// Lower current, lower sensitivity
    PowerSaving,
    /// About +3 dB sensitivity at higher current
    Boosted,
}

impl RxGain {
    pub const fn register_value(self) -> u8 {
        match self {
            RxGain::PowerSaving => 0x94,
            RxGain::Boosted => 0x96,
        }
    }
}

/// Power amplifier variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaProfile {
    /// Low power PA, up to +15 dBm
    Sx1261,
    /// High power PA, up to +22 dBm
    Sx1262,
    /// High power PA, up to +22 dBm
    Sx1268,
}

/// Bytes for `SetPaConfig` plus the companion settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaSettings {
    pub duty_cycle: u8,
    pub hp_max: u8,
    pub device_sel: u8,
    pub ocp: u8,
    /// Power written to `SetTxParams`
    pub power_dbm: i8,
}

impl PaProfile {
    /// Optimal PA settings for the requested output power (datasheet table 13-21)
    pub fn settings(self, dbm: i8) -> PaSettings {
        match self {
            PaProfile::Sx1261 => {
                let power_dbm = dbm.clamp(-17, 15);
                let (duty_cycle, hp_max) = match power_dbm {
                    15 => (0x06, 0x00),
                    14 => (0x04, 0x00),
                    _ => (0x01, 0x00),
                };
                PaSettings {
                    duty_cycle,
                    hp_max,
                    device_sel: 0x01,
                    ocp: 0x18,
                    power_dbm,
                }
            }
            PaProfile::Sx1262 | PaProfile::Sx1268 => {
                let power_dbm = dbm.clamp(-9, 22);
                let (duty_cycle, hp_max) = match power_dbm {
                    22 => (0x04, 0x07),
                    20..=21 => (0x03, 0x05),
                    17..=19 => (0x02, 0x03),
                    _ => (0x02, 0x02),
                };
                PaSettings {
                    duty_cycle,
                    hp_max,
                    device_sel: 0x00,
                    ocp: 0x38,
                    power_dbm,
                }
            }
        }
    }
}

/// Which external RF switch path is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfPath {
    Tx,
    Rx,
    Off,
}

/// What the chip was last told to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Standby,
    Rx,
    Tx,
    Cad,
}

/// Event delivered to the registered handler
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// A packet was received
    Frame(ReceivedFrame),
    /// An RX window closed without a packet
    RxTimeout(StatusFlags),
    /// A CAD cycle finished
    Cad(CadOutcome),
    /// Servicing an interrupt failed
    Fault(RadioError),
    /// Any other interrupt, e.g. a lone `PreambleDetected`
    Status(StatusFlags),
}

/// Registered receive handler
pub type EventHandler = Box<dyn FnMut(RadioEvent) + Send>;

/// Slot contents; shared so a call can run with the slot unlocked
type SharedHandler = Arc<Mutex<EventHandler>>;

#[derive(Debug, Default)]
struct Latch {
    flags: StatusFlags,
    closed: bool,
}

/// State shared between the session, its handles and the IRQ worker
struct SessionCore<H: Hal> {
    identity: RadioIdentity,
    hal: Mutex<Option<H>>,
    ending: AtomicBool,
    latch: Mutex<Latch>,
    latch_cv: Condvar,
    sink: Mutex<Option<SharedHandler>>,
    has_sink: AtomicBool,
    mode: Mutex<OperatingMode>,
    cad_exit_to_rx: AtomicBool,
    worker_running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<H: Hal> SessionCore<H> {
    fn with_hal<R>(&self, f: impl FnOnce(&mut H) -> Result<R, RadioError>) -> Result<R, RadioError> {
        if self.ending.load(Ordering::Acquire) {
            return Err(RadioError::SessionClosed);
        }
        let mut guard = lock(&self.hal);
        match guard.as_mut() {
            Some(hal) => f(hal),
            None => Err(RadioError::SessionClosed),
        }
    }

    fn service_irq(&self, slice: Duration) -> Result<Option<StatusFlags>, RadioError> {
        let (flags, event) = self.with_hal(|hal| {
            if !hal.wait_irq(slice).map_err(RadioError::RegisterReadFailure)? {
                return Ok(None);
            }
            let mut raw = [0u8; 2];
            hal.read_command(opcode::GET_IRQ_STATUS, &[], &mut raw)
                .map_err(RadioError::RegisterReadFailure)?;
            let flags = StatusDecoder::decode_bytes(raw);
            if flags.is_empty() {
                return Ok(None);
            }
            hal.write_command(opcode::CLEAR_IRQ_STATUS, &flags.bits().to_be_bytes())
                .map_err(RadioError::RegisterWriteFailure)?;
            log::debug!("IRQ: {flags}");
            let event = self.classify(hal, flags);
            Ok(Some((flags, event)))
        })?
        .map_or((None, None), |(flags, event)| (Some(flags), event));

        if let Some(flags) = flags {
            self.publish(flags);
        }
        if let Some(event) = event {
            self.dispatch(event);
        }
        Ok(flags)
    }

    /// Decide which event an interrupt produces, reading the frame if needed
    fn classify(&self, hal: &mut H, flags: StatusFlags) -> Option<RadioEvent> {
        let mut mode = lock(&self.mode);

        if flags.tx_done() {
            *mode = OperatingMode::Standby;
            return None;
        }

        if flags.cad_done() {
            let detected = flags.cad_detected();
            *mode = if detected && self.cad_exit_to_rx.load(Ordering::Acquire) {
                OperatingMode::Rx
            } else {
                OperatingMode::Standby
            };
            let outcome = if detected {
                CadOutcome::Detected
            } else {
                CadOutcome::NotDetected
            };
            return Some(RadioEvent::Cad(outcome));
        }

        if flags.timeout() && *mode == OperatingMode::Cad {
            *mode = OperatingMode::Standby;
            log::warn!("CAD timed out without CadDone");
            return Some(RadioEvent::Cad(CadOutcome::TimedOut));
        }

        if flags.rx_done() {
            // Without a handler the frame stays in the FIFO for the pull reader
            if *mode != OperatingMode::Rx || !self.has_sink.load(Ordering::Acquire) {
                return None;
            }
            drop(mode);
            if flags.crc_error() || flags.header_error() {
                log::warn!("Received packet with errors: {flags}");
            }
            return Some(match rx::read_frame(hal, self.identity.protocol, flags) {
                Ok(frame) => RadioEvent::Frame(frame),
                Err(e) => {
                    log::warn!("Failed to read received frame: {e}");
                    RadioEvent::Fault(e)
                }
            });
        }

        if flags.timeout() && *mode == OperatingMode::Rx {
            // only single RX (after CAD) times out; the chip is back in standby
            *mode = OperatingMode::Standby;
            return Some(RadioEvent::RxTimeout(flags));
        }

        Some(RadioEvent::Status(flags))
    }

    fn publish(&self, flags: StatusFlags) {
        let mut latch = lock(&self.latch);
        latch.flags |= flags;
        self.latch_cv.notify_all();
    }

    fn dispatch(&self, event: RadioEvent) {
        // The handler may replace or clear the slot, so it is called with the slot unlocked
        let handler = lock(&self.sink).clone();
        match handler {
            Some(handler) => {
                let mut handler = lock(&handler);
                (*handler)(event)
            }
            None => log::debug!("No handler registered, dropping {event:?}"),
        }
    }

    fn take_latched(&self, mask: StatusFlags) -> StatusFlags {
        let mut latch = lock(&self.latch);
        let hit = latch.flags & mask;
        latch.flags.remove(mask);
        hit
    }

    /// Block until one of `wanted` is latched, the deadline passes or the session closes
    fn wait_for(&self, wanted: StatusFlags, timeout: Duration) -> Result<Option<StatusFlags>, RadioError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut latch = lock(&self.latch);
            if latch.closed {
                return Err(RadioError::SessionClosed);
            }
            if latch.flags.intersects(wanted) {
                let hit = latch.flags;
                latch.flags.remove(wanted);
                return Ok(Some(hit));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = deadline - now;

            if self.worker_running.load(Ordering::Acquire) {
                let _ = self
                    .latch_cv
                    .wait_timeout(latch, remaining.min(WORKER_SLICE * 2))
                    .unwrap_or_else(PoisonError::into_inner);
            } else {
                drop(latch);
                self.service_irq(remaining.min(IRQ_POLL_SLICE))?;
            }
        }
    }

    fn irq_worker(&self) {
        log::debug!("IRQ worker started");
        while self.worker_running.load(Ordering::Acquire) && !self.ending.load(Ordering::Acquire) {
            match self.service_irq(WORKER_SLICE) {
                Ok(_) => {}
                Err(RadioError::SessionClosed) => break,
                Err(e) => {
                    log::warn!("IRQ servicing failed: {e}");
                    self.dispatch(RadioEvent::Fault(e));
                    thread::sleep(WORKER_SLICE);
                }
            }
        }
        self.worker_running.store(false, Ordering::Release);
        log::debug!("IRQ worker stopped");
    }

    fn rf_path(&self, hal: &mut H, path: RfPath) -> Result<(), HalError> {
        let (tx, rx) = match path {
            RfPath::Tx => (true, false),
            RfPath::Rx => (false, true),
            RfPath::Off => (false, false),
        };
        if let Some(pin) = self.identity.txen_pin {
            hal.gpio_write(pin, tx)?;
        }
        if let Some(pin) = self.identity.rxen_pin {
            hal.gpio_write(pin, rx)?;
        }
        Ok(())
    }

    /// Release everything exactly once
    fn shutdown(&self) {
        if self.ending.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(mut hal) = lock(&self.hal).take() {
            if let Err(e) = hal.write_command(opcode::SET_STANDBY, &[STANDBY_RC]) {
                log::warn!("Standby on shutdown failed: {e}");
            }
            if let Err(e) = self.rf_path(&mut hal, RfPath::Off) {
                log::warn!("RF switch off on shutdown failed: {e}");
            }
            if let Err(e) = hal.release() {
                log::warn!("Transport release failed: {e}");
            }
        }
        *lock(&self.mode) = OperatingMode::Standby;

        *lock(&self.sink) = None;
        self.has_sink.store(false, Ordering::Release);

        {
            let mut latch = lock(&self.latch);
            latch.closed = true;
            self.latch_cv.notify_all();
        }

        self.stop_worker();
        log::info!("Radio session ended");
    }

    /// Stop the IRQ worker and wait for it to exit
    fn stop_worker(&self) {
        self.worker_running.store(false, Ordering::Release);
        if let Some(worker) = lock(&self.worker).take() {
            // A handler may end the session from the worker itself
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                log::warn!("IRQ worker panicked");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.ending.load(Ordering::Acquire)
    }

    fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut latch = lock(&self.latch);
        while !latch.closed {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            latch = self
                .latch_cv
                .wait_timeout(latch, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Operations a [`SessionHandle`] can perform without knowing the transport type
trait SessionControl: Send + Sync {
    fn end(&self);
    fn is_closed(&self) -> bool;
    fn wait_closed(&self, timeout: Duration) -> bool;
}

impl<H: Hal + 'static> SessionControl for SessionCore<H> {
    fn end(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        SessionCore::is_closed(self)
    }

    fn wait_closed(&self, timeout: Duration) -> bool {
        SessionCore::wait_closed(self, timeout)
    }
}

/// Cloneable handle for ending a session from another thread
#[derive(Clone)]
pub struct SessionHandle {
    core: Arc<dyn SessionControl>,
}

impl SessionHandle {
    /// End the session. Later calls do nothing.
    pub fn end(&self) {
        self.core.end();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Block until the session is ended or `timeout` passes
    ///
    /// Returns `true` if the session is closed.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        self.core.wait_closed(timeout)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An active SX126x session
pub struct RadioSession<H: Hal + 'static> {
    core: Arc<SessionCore<H>>,
    modem: Option<ModemParameters>,
    packet: Option<PacketParameters>,
    frequency_hz: Option<u32>,
    calibrated_band: Option<usize>,
    tx_power_dbm: Option<i8>,
}

impl<H: Hal + 'static> RadioSession<H> {
    /// Bring the chip into standby and select the identity's modem
    ///
    /// On failure the transport is released and no session exists.
    pub fn begin(mut hal: H, identity: RadioIdentity) -> Result<Self, RadioError> {
        if let Err(reason) = Self::bring_up(&mut hal, &identity) {
            log::warn!("Radio begin failed: {reason}");
            if let Err(e) = hal.release() {
                log::warn!("Transport release failed: {e}");
            }
            return Err(RadioError::BeginFailure(reason));
        }

        log::info!(
            "Radio started on SPI{}.{} ({}), reset={} busy={} irq={}",
            identity.bus_id,
            identity.cs_id,
            identity.protocol,
            identity.reset_pin,
            identity.busy_pin,
            identity.irq_pin
        );

        let core = SessionCore {
            identity,
            hal: Mutex::new(Some(hal)),
            ending: AtomicBool::new(false),
            latch: Mutex::new(Latch::default()),
            latch_cv: Condvar::new(),
            sink: Mutex::new(None),
            has_sink: AtomicBool::new(false),
            mode: Mutex::new(OperatingMode::Standby),
            cad_exit_to_rx: AtomicBool::new(false),
            worker_running: AtomicBool::new(false),
            worker: Mutex::new(None),
        };

        Ok(Self {
            core: Arc::new(core),
            modem: None,
            packet: None,
            frequency_hz: None,
            calibrated_band: None,
            tx_power_dbm: None,
        })
    }

    fn bring_up(hal: &mut H, identity: &RadioIdentity) -> Result<(), String> {
        hal.reset().map_err(|e| format!("reset pulse failed: {e}"))?;
        hal.wait_busy(BEGIN_BUSY_TIMEOUT)
            .map_err(|e| format!("BUSY did not clear after reset: {e}"))?;
        hal.write_command(opcode::SET_STANDBY, &[STANDBY_RC])
            .map_err(|e| format!("SetStandby failed: {e}"))?;

        let mut status = [0u8; 1];
        hal.read_command(opcode::GET_STATUS, &[], &mut status)
            .map_err(|e| format!("GetStatus failed: {e}"))?;
        let chip_mode = (status[0] >> 4) & 0x07;
        if chip_mode != CHIP_MODE_STBY_RC && chip_mode != CHIP_MODE_STBY_XOSC {
            return Err(format!(
                "chip not in standby (status 0x{:02X}, mode {chip_mode})",
                status[0]
            ));
        }

        let irq_mask = STATUS_MASK.to_be_bytes();
        let setup: [(u8, &[u8]); 4] = [
            (opcode::SET_PACKET_TYPE, &[identity.protocol.packet_type_code()]),
            (opcode::SET_BUFFER_BASE_ADDRESS, &[0x00, 0x00]),
            // every source on DIO1, nothing on DIO2/DIO3
            (
                opcode::SET_DIO_IRQ_PARAMS,
                &[irq_mask[0], irq_mask[1], irq_mask[0], irq_mask[1], 0, 0, 0, 0],
            ),
            (opcode::CLEAR_IRQ_STATUS, &[irq_mask[0], irq_mask[1]]),
        ];
        for (op, data) in setup {
            hal.write_command(op, data)
                .map_err(|e| format!("setup command 0x{op:02X} failed: {e}"))?;
        }

        for pin in [identity.txen_pin, identity.rxen_pin].into_iter().flatten() {
            hal.gpio_write(pin, false)
                .map_err(|e| format!("RF switch pin {pin}: {e}"))?;
        }
        Ok(())
    }

    pub fn identity(&self) -> &RadioIdentity {
        &self.core.identity
    }

    pub fn protocol(&self) -> Protocol {
        self.core.identity.protocol
    }

    /// Active modulation parameters, if applied
    pub fn modem(&self) -> Option<&ModemParameters> {
        self.modem.as_ref()
    }

    /// Active packet parameters, if applied
    pub fn packet(&self) -> Option<&PacketParameters> {
        self.packet.as_ref()
    }

    pub fn frequency_hz(&self) -> Option<u32> {
        self.frequency_hz
    }

    pub fn tx_power_dbm(&self) -> Option<i8> {
        self.tx_power_dbm
    }

    pub fn mode(&self) -> OperatingMode {
        *lock(&self.core.mode)
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            core: self.core.clone(),
        }
    }

    /// Set the carrier frequency, recalibrating the image rejection on band change
    pub fn set_frequency(&mut self, hz: u32) -> Result<(), RadioError> {
        let band = IMAGE_CALIBRATION_BANDS
            .iter()
            .position(|(lo, hi, _)| (*lo..=*hi).contains(&hz));

        if let Some(idx) = band.filter(|idx| Some(*idx) != self.calibrated_band) {
            self.command(opcode::CALIBRATE_IMAGE, &IMAGE_CALIBRATION_BANDS[idx].2)?;
            self.calibrated_band = Some(idx);
        }

        let rf_freq = ((u64::from(hz) << 25) / XTAL_FREQ_HZ) as u32;
        self.command(opcode::SET_RF_FREQUENCY, &rf_freq.to_be_bytes())?;
        self.frequency_hz = Some(hz);
        log::info!("Frequency set to {:.3} MHz", f64::from(hz) / 1e6);
        Ok(())
    }

    pub fn set_rx_gain(&mut self, gain: RxGain) -> Result<(), RadioError> {
        self.write_register(register::RX_GAIN, &[gain.register_value()])?;
        log::info!("RX gain: {gain:?}");
        Ok(())
    }

    /// Configure the PA for `dbm` and return the power actually applied
    pub fn set_tx_power(&mut self, dbm: i8, pa: PaProfile) -> Result<i8, RadioError> {
        let pa_settings = pa.settings(dbm);
        self.command(
            opcode::SET_PA_CONFIG,
            &[pa_settings.duty_cycle, pa_settings.hp_max, pa_settings.device_sel, 0x01],
        )?;
        self.write_register(register::OCP, &[pa_settings.ocp])?;
        self.command(
            opcode::SET_TX_PARAMS,
            &[pa_settings.power_dbm as u8, RAMP_200_US],
        )?;
        self.tx_power_dbm = Some(pa_settings.power_dbm);
        if pa_settings.power_dbm != dbm {
            log::warn!("TX power {dbm} dBm clamped to {} dBm for {pa:?}", pa_settings.power_dbm);
        }
        log::info!("TX power {} dBm ({pa:?})", pa_settings.power_dbm);
        Ok(pa_settings.power_dbm)
    }

    /// Let DIO2 drive the RF switch
    pub fn set_dio2_rf_switch(&mut self) -> Result<(), RadioError> {
        self.command(opcode::SET_DIO2_AS_RF_SWITCH_CTRL, &[0x01])
    }

    /// Drive the TXEN/RXEN lines, where wired
    pub fn set_rf_path(&mut self, path: RfPath) -> Result<(), RadioError> {
        let core = &self.core;
        core.with_hal(|hal| core.rf_path(hal, path).map_err(RadioError::RegisterWriteFailure))
    }

    /// Register the single event handler, replacing any previous one
    ///
    /// A call already in progress finishes with the old handler.
    pub fn on_receive<F>(&mut self, handler: F) -> Result<(), RadioError>
    where
        F: FnMut(RadioEvent) + Send + 'static,
    {
        if self.is_closed() {
            return Err(RadioError::SessionClosed);
        }
        *lock(&self.core.sink) = Some(Arc::new(Mutex::new(Box::new(handler))));
        self.core.has_sink.store(true, Ordering::Release);
        Ok(())
    }

    pub fn clear_receive_handler(&mut self) {
        *lock(&self.core.sink) = None;
        self.core.has_sink.store(false, Ordering::Release);
    }

    pub fn has_receive_handler(&self) -> bool {
        self.core.has_sink.load(Ordering::Acquire)
    }

    /// Wait up to `slice` for one interrupt and handle it
    ///
    /// Returns the decoded flags, or `None` if the line stayed quiet.
    pub fn service_irq(&self, slice: Duration) -> Result<Option<StatusFlags>, RadioError> {
        self.core.service_irq(slice)
    }

    /// Release the transport. Later calls do nothing.
    pub fn end(&mut self) {
        self.core.shutdown();
    }

    pub(crate) fn command(&self, op: u8, data: &[u8]) -> Result<(), RadioError> {
        self.core.with_hal(|hal| {
            hal.write_command(op, data)
                .map_err(RadioError::RegisterWriteFailure)
        })
    }

    pub(crate) fn read(&self, op: u8, args: &[u8], buf: &mut [u8]) -> Result<(), RadioError> {
        self.core.with_hal(|hal| {
            hal.read_command(op, args, buf)
                .map_err(RadioError::RegisterReadFailure)
        })
    }

    pub(crate) fn write_register(&self, addr: u16, data: &[u8]) -> Result<(), RadioError> {
        self.core.with_hal(|hal| {
            hal.write_register(addr, data)
                .map_err(RadioError::RegisterWriteFailure)
        })
    }

    /// Run several transport operations under one lock
    pub(crate) fn with_hal<R>(
        &self,
        f: impl FnOnce(&mut H) -> Result<R, RadioError>,
    ) -> Result<R, RadioError> {
        self.core.with_hal(f)
    }

    pub(crate) fn set_mode(&self, mode: OperatingMode) {
        *lock(&self.core.mode) = mode;
    }

    pub(crate) fn set_cad_exit_to_rx(&self, enabled: bool) {
        self.core.cad_exit_to_rx.store(enabled, Ordering::Release);
    }

    pub(crate) fn set_modem(&mut self, modem: ModemParameters) {
        self.modem = Some(modem);
    }

    pub(crate) fn set_packet(&mut self, packet: PacketParameters) {
        self.packet = Some(packet);
    }

    /// Clear and return latched flags in `mask`
    pub(crate) fn take_latched(&self, mask: StatusFlags) -> StatusFlags {
        self.core.take_latched(mask)
    }

    pub(crate) fn wait_for(
        &self,
        wanted: StatusFlags,
        timeout: Duration,
    ) -> Result<Option<StatusFlags>, RadioError> {
        self.core.wait_for(wanted, timeout)
    }

    /// Start the IRQ worker thread if it is not running
    ///
    /// Returns `false` if the thread could not be spawned; blocking waits then
    /// keep servicing the line themselves.
    pub(crate) fn spawn_irq_worker(&self) -> Result<bool, RadioError> {
        if self.is_closed() {
            return Err(RadioError::SessionClosed);
        }
        if self.core.worker_running.swap(true, Ordering::AcqRel) {
            return Ok(true);
        }
        let core = Arc::clone(&self.core);
        match thread::Builder::new()
            .name("sx126x-irq".into())
            .spawn(move || core.irq_worker())
        {
            Ok(worker) => {
                *lock(&self.core.worker) = Some(worker);
                Ok(true)
            }
            Err(e) => {
                self.core.worker_running.store(false, Ordering::Release);
                log::warn!("Could not start IRQ worker: {e}");
                Ok(false)
            }
        }
    }

    /// Stop the IRQ worker; blocking waits go back to servicing the line themselves
    pub(crate) fn stop_irq_worker(&self) {
        self.core.stop_worker();
    }

    pub fn irq_worker_running(&self) -> bool {
        self.core.worker_running.load(Ordering::Acquire)
    }
}

impl<H: Hal + 'static> Drop for RadioSession<H> {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

impl<H: Hal + 'static> std::fmt::Debug for RadioSession<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioSession")
            .field("identity", &self.core.identity)
            .field("modem", &self.modem)
            .field("packet", &self.packet)
            .field("frequency_hz", &self.frequency_hz)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::hal::{MockHal, MockOp};

    fn lora_identity() -> RadioIdentity {
        RadioIdentity::default()
    }

    #[test]
    fn test_begin_sequence() {
        let mock = MockHal::new();
        let session = RadioSession::begin(mock.clone(), lora_identity()).unwrap();
        assert_eq!(session.mode(), OperatingMode::Standby);

        let ops = mock.ops();
        assert_eq!(ops[0], MockOp::Reset);
        assert_eq!(ops[1], MockOp::WaitBusy);
        assert_eq!(mock.commands(opcode::SET_STANDBY), vec![vec![0x00]]);
        assert_eq!(mock.commands(opcode::SET_PACKET_TYPE), vec![vec![0x01]]);
        assert_eq!(
            mock.commands(opcode::SET_DIO_IRQ_PARAMS),
            vec![vec![0x03, 0xFF, 0x03, 0xFF, 0, 0, 0, 0]]
        );
        // TXEN driven low, RXEN not wired
        assert!(ops.contains(&MockOp::Gpio { pin: 6, value: false }));
    }

    #[test]
    fn test_begin_fails_when_busy_stuck() {
        let mock = MockHal::new();
        mock.set_busy_stuck(true);
        let err = RadioSession::begin(mock.clone(), lora_identity()).unwrap_err();
        assert!(matches!(err, RadioError::BeginFailure(_)));
        assert!(!err.is_recoverable());
        assert_eq!(mock.release_count(), 1);
    }

    #[test]
    fn test_begin_fails_when_not_in_standby() {
        let mock = MockHal::new();
        mock.set_status_byte(0x00);
        let err = RadioSession::begin(mock.clone(), lora_identity()).unwrap_err();
        assert!(matches!(err, RadioError::BeginFailure(ref msg) if msg.contains("standby")));
    }

    #[test]
    fn test_frequency_register_and_calibration() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock.clone(), lora_identity()).unwrap();

        session.set_frequency(868_000_000).unwrap();
        // 868e6 * 2^25 / 32e6 = 910163968 = 0x36400000
        assert_eq!(
            mock.last_command(opcode::SET_RF_FREQUENCY),
            Some(vec![0x36, 0x40, 0x00, 0x00])
        );
        assert_eq!(mock.commands(opcode::CALIBRATE_IMAGE), vec![vec![0xD7, 0xDB]]);

        // Same band: no recalibration
        session.set_frequency(869_525_000).unwrap();
        assert_eq!(mock.commands(opcode::CALIBRATE_IMAGE).len(), 1);

        session.set_frequency(915_000_000).unwrap();
        assert_eq!(mock.last_command(opcode::CALIBRATE_IMAGE), Some(vec![0xE1, 0xE9]));
        assert_eq!(session.frequency_hz(), Some(915_000_000));
    }

    #[test]
    fn test_tx_power_table() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock.clone(), lora_identity()).unwrap();

        assert_eq!(session.set_tx_power(22, PaProfile::Sx1262).unwrap(), 22);
        assert_eq!(mock.last_command(opcode::SET_PA_CONFIG), Some(vec![0x04, 0x07, 0x00, 0x01]));
        assert_eq!(mock.last_command(opcode::SET_TX_PARAMS), Some(vec![22, 0x04]));
        assert_eq!(mock.register_writes(register::OCP), vec![vec![0x38]]);

        assert_eq!(session.set_tx_power(20, PaProfile::Sx1262).unwrap(), 20);
        assert_eq!(mock.last_command(opcode::SET_PA_CONFIG), Some(vec![0x03, 0x05, 0x00, 0x01]));

        assert_eq!(session.set_tx_power(30, PaProfile::Sx1261).unwrap(), 15);
        assert_eq!(mock.last_command(opcode::SET_PA_CONFIG), Some(vec![0x06, 0x00, 0x01, 0x01]));
        assert_eq!(mock.last_command(opcode::SET_TX_PARAMS), Some(vec![15, 0x04]));
    }

    #[test]
    fn test_rx_gain_and_rf_switch() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock.clone(), lora_identity()).unwrap();
        session.set_rx_gain(RxGain::Boosted).unwrap();
        session.set_rx_gain(RxGain::PowerSaving).unwrap();
        assert_eq!(mock.register_writes(register::RX_GAIN), vec![vec![0x96], vec![0x94]]);

        session.set_dio2_rf_switch().unwrap();
        assert_eq!(mock.commands(opcode::SET_DIO2_AS_RF_SWITCH_CTRL), vec![vec![0x01]]);

        mock.clear_ops();
        session.set_rf_path(RfPath::Tx).unwrap();
        assert_eq!(mock.ops(), vec![MockOp::Gpio { pin: 6, value: true }]);
    }

    #[test]
    fn test_write_failure_keeps_session_usable() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock.clone(), lora_identity()).unwrap();
        mock.fail_register(Some(register::RX_GAIN));
        let err = session.set_rx_gain(RxGain::Boosted).unwrap_err();
        assert_eq!(err, RadioError::RegisterWriteFailure(HalError::Register));

        mock.fail_register(None);
        session.set_rx_gain(RxGain::Boosted).unwrap();
    }

    #[test]
    fn test_end_is_idempotent() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock.clone(), lora_identity()).unwrap();
        session.end();
        assert!(session.is_closed());
        let after_first = mock.op_count();
        assert_eq!(mock.release_count(), 1);

        session.end();
        session.handle().end();
        drop(session);
        assert_eq!(mock.op_count(), after_first);
        assert_eq!(mock.release_count(), 1);
    }

    #[test]
    fn test_operations_after_end_fail() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock.clone(), lora_identity()).unwrap();
        session.end();
        assert_eq!(session.set_frequency(868_000_000), Err(RadioError::SessionClosed));
        assert_eq!(session.set_rx_gain(RxGain::Boosted), Err(RadioError::SessionClosed));
        assert_eq!(session.on_receive(|_| {}), Err(RadioError::SessionClosed));
        assert_eq!(session.service_irq(IRQ_POLL_SLICE), Err(RadioError::SessionClosed));
    }

    #[test]
    fn test_unsolicited_irq_dispatched_as_status() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock.clone(), lora_identity()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        session
            .on_receive(move |event| sink.lock().unwrap().push(event))
            .unwrap();

        mock.queue_irq(0x0004);
        let flags = session.service_irq(IRQ_POLL_SLICE).unwrap();
        assert_eq!(flags, Some(StatusFlags::PREAMBLE_DETECTED));
        assert_eq!(
            *events.lock().unwrap(),
            vec![RadioEvent::Status(StatusFlags::PREAMBLE_DETECTED)]
        );
        // cleared after reading
        assert_eq!(mock.pending_irq(), 0);
        assert_eq!(mock.last_command(opcode::CLEAR_IRQ_STATUS), Some(vec![0x00, 0x04]));
    }

    #[test]
    fn test_handler_replaced() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock.clone(), lora_identity()).unwrap();
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));

        let counter = first.clone();
        session.on_receive(move |_| *counter.lock().unwrap() += 1).unwrap();
        let counter = second.clone();
        session.on_receive(move |_| *counter.lock().unwrap() += 1).unwrap();

        mock.queue_irq(0x0008);
        session.service_irq(IRQ_POLL_SLICE).unwrap();
        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);

        session.clear_receive_handler();
        assert!(!session.has_receive_handler());
    }

    #[test]
    fn test_handler_can_end_session() {
        let mock = MockHal::new();
        let mut session = RadioSession::begin(mock.clone(), lora_identity()).unwrap();
        let handle = session.handle();
        session.on_receive(move |_| handle.end()).unwrap();

        mock.queue_irq(0x0004);
        session.service_irq(IRQ_POLL_SLICE).unwrap();
        assert!(session.is_closed());
        assert!(session.handle().wait_closed(Duration::from_millis(1)));
        assert_eq!(mock.release_count(), 1);
    }
}
