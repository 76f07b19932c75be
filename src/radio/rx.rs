//! # Continuous Receive
//!
//! [`RxContinuousController::start`] puts the chip in continuous RX. Frames then
//! arrive one of two ways:
//!
//! - **Push**: a handler is registered with [`RadioSession::on_receive`]. An IRQ
//!   worker thread reads each frame and hands it over as [`RadioEvent::Frame`].
//! - **Pull**: no handler. The caller polls with [`RxContinuousController::poll`] /
//!   [`RxContinuousController::receive_frame`] and reads the FIFO byte by byte.
//!
//! Every frame ends with a counter byte appended by the sender.
//!
//! [`RadioEvent::Frame`]: crate::radio::session::RadioEvent::Frame

use crate::error::RadioError;
use crate::radio::commands::{opcode, RX_CONTINUOUS};
use crate::radio::hal::Hal;
use crate::radio::irq::{StatusDecoder, StatusFlags, STATUS_MASK};
use crate::radio::modulation::Protocol;
use crate::radio::session::{OperatingMode, RadioSession, RfPath};

/// A received packet
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    /// Payload without the trailing counter byte
    pub payload: Vec<u8>,
    /// Counter byte appended by the sender
    pub counter: u8,
    pub rssi_dbm: f32,
    pub snr_db: f32,
    /// Interrupt flags reported with the packet
    pub status: StatusFlags,
}

impl ReceivedFrame {
    /// Payload as text, trailing NULs trimmed
    pub fn message(&self) -> String {
        let end = self
            .payload
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }

    /// Whether the chip flagged a CRC or header error
    pub fn has_errors(&self) -> bool {
        self.status.crc_error() || self.status.header_error()
    }

    fn from_bytes(mut data: Vec<u8>, signal: (f32, f32), status: StatusFlags) -> Option<Self> {
        let counter = data.pop()?;
        Some(Self {
            payload: data,
            counter,
            rssi_dbm: signal.0,
            snr_db: signal.1,
            status,
        })
    }
}

/// RSSI and SNR from `GetPacketStatus`
pub fn signal_quality(protocol: Protocol, status: [u8; 3]) -> (f32, f32) {
    match protocol {
        // [RssiPkt, SnrPkt, SignalRssiPkt]
        Protocol::LoRa => (
            -f32::from(status[0]) / 2.0,
            f32::from(status[1] as i8) / 4.0,
        ),
        // [RxStatus, RssiSync, RssiAvg]
        Protocol::Fsk => (-f32::from(status[2]) / 2.0, 0.0),
    }
}

/// Read a complete frame while holding the transport
pub(crate) fn read_frame<H: Hal>(
    hal: &mut H,
    protocol: Protocol,
    status: StatusFlags,
) -> Result<ReceivedFrame, RadioError> {
    let mut buffer_status = [0u8; 2];
    hal.read_command(opcode::GET_RX_BUFFER_STATUS, &[], &mut buffer_status)
        .map_err(RadioError::RegisterReadFailure)?;
    let [len, start] = buffer_status;
    if len == 0 {
        return Err(RadioError::FifoUnderrun {
            requested: 1,
            remaining: 0,
        });
    }

    let mut data = vec![0u8; usize::from(len)];
    hal.read_command(opcode::READ_BUFFER, &[start], &mut data)
        .map_err(RadioError::RegisterReadFailure)?;

    let mut packet_status = [0u8; 3];
    hal.read_command(opcode::GET_PACKET_STATUS, &[], &mut packet_status)
        .map_err(RadioError::RegisterReadFailure)?;

    ReceivedFrame::from_bytes(data, signal_quality(protocol, packet_status), status).ok_or(
        RadioError::FifoUnderrun {
            requested: 1,
            remaining: 0,
        },
    )
}

/// Cursor over the current frame in the FIFO
#[derive(Debug, Clone, Copy)]
struct FifoReader {
    start: u8,
    len: usize,
    offset: u8,
    remaining: usize,
    status: StatusFlags,
}

/// Drives continuous reception
#[derive(Debug, Default)]
pub struct RxContinuousController {
    reader: Option<FifoReader>,
    push: bool,
}

impl RxContinuousController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm continuous RX. Does not block.
    pub fn start<H: Hal + 'static>(&mut self, session: &mut RadioSession<H>) -> Result<(), RadioError> {
        if session.modem().is_none() {
            return Err(RadioError::NotConfigured("modem parameters"));
        }

        session.set_rf_path(RfPath::Rx)?;
        session.command(opcode::CLEAR_IRQ_STATUS, &STATUS_MASK.to_be_bytes())?;
        session.take_latched(StatusFlags::all());
        self.reader = None;

        session.set_mode(OperatingMode::Rx);
        let timeout = RX_CONTINUOUS.to_be_bytes();
        if let Err(e) = session.command(opcode::SET_RX, &timeout[1..]) {
            session.set_mode(OperatingMode::Standby);
            return Err(e);
        }

        self.push = session.has_receive_handler() && session.spawn_irq_worker()?;
        log::info!(
            "Continuous RX started ({} mode)",
            if self.push { "push" } else { "pull" }
        );
        Ok(())
    }

    /// Return to standby and stop push delivery
    pub fn stop<H: Hal + 'static>(&mut self, session: &mut RadioSession<H>) -> Result<(), RadioError> {
        if self.push {
            session.stop_irq_worker();
            self.push = false;
        }
        session.command(opcode::SET_STANDBY, &[0x00])?;
        session.set_mode(OperatingMode::Standby);
        session.set_rf_path(RfPath::Off)?;
        self.reader = None;
        Ok(())
    }

    /// Whether frames go to the registered handler
    pub fn is_push(&self) -> bool {
        self.push
    }

    /// Bytes of the current frame not yet read
    pub fn available(&self) -> usize {
        self.reader.map_or(0, |r| r.remaining)
    }

    /// Flags reported with the current frame
    pub fn frame_status(&self) -> Option<StatusFlags> {
        self.reader.map(|r| r.status)
    }

    /// Check for a completed frame and return the bytes available to read
    ///
    /// Always 0 in push mode.
    pub fn poll<H: Hal + 'static>(&mut self, session: &mut RadioSession<H>) -> Result<usize, RadioError> {
        if self.push {
            return Ok(0);
        }
        if self.available() > 0 {
            return Ok(self.available());
        }
        Ok(self.open_frame(session)?.map_or(0, |r| r.remaining))
    }

    fn open_frame<H: Hal + 'static>(
        &mut self,
        session: &mut RadioSession<H>,
    ) -> Result<Option<FifoReader>, RadioError> {
        let latched = session.take_latched(StatusFlags::all());
        let mut raw = [0u8; 2];
        session.read(opcode::GET_IRQ_STATUS, &[], &mut raw)?;
        let pending = StatusDecoder::decode_bytes(raw);
        if !pending.is_empty() {
            session.command(opcode::CLEAR_IRQ_STATUS, &pending.bits().to_be_bytes())?;
        }

        let status = latched | pending;
        if !status.rx_done() {
            return Ok(None);
        }
        if status.crc_error() || status.header_error() {
            log::warn!("Received packet with errors: {status}");
        }

        let mut buffer_status = [0u8; 2];
        session.read(opcode::GET_RX_BUFFER_STATUS, &[], &mut buffer_status)?;
        let [len, start] = buffer_status;
        let reader = FifoReader {
            start,
            len: usize::from(len),
            offset: start,
            remaining: usize::from(len),
            status,
        };
        log::debug!("Frame of {len} bytes at FIFO offset {start}");
        self.reader = Some(reader);
        Ok(Some(reader))
    }

    /// Read exactly `buf.len()` bytes of the current frame
    ///
    /// Fails with `FifoUnderrun` before touching the transport if fewer bytes remain.
    pub fn read_into<H: Hal + 'static>(
        &mut self,
        session: &mut RadioSession<H>,
        buf: &mut [u8],
    ) -> Result<(), RadioError> {
        let remaining = self.available();
        if buf.len() > remaining {
            log::warn!("FIFO underrun: {} requested, {remaining} left", buf.len());
            return Err(RadioError::FifoUnderrun {
                requested: buf.len(),
                remaining,
            });
        }
        if buf.is_empty() {
            return Ok(());
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };
        session.read(opcode::READ_BUFFER, &[reader.offset], buf)?;
        reader.offset = reader.offset.wrapping_add(buf.len() as u8);
        reader.remaining -= buf.len();
        Ok(())
    }

    pub fn read_byte<H: Hal + 'static>(&mut self, session: &mut RadioSession<H>) -> Result<u8, RadioError> {
        let mut byte = [0u8; 1];
        self.read_into(session, &mut byte)?;
        Ok(byte[0])
    }

    /// Pull the next complete frame, if one is buffered
    ///
    /// Returns `None` in push mode or when no frame has completed. A frame that
    /// was partly read through [`read_byte`](Self::read_byte) or
    /// [`read_into`](Self::read_into) is returned whole, read again from its start.
    pub fn receive_frame<H: Hal + 'static>(
        &mut self,
        session: &mut RadioSession<H>,
    ) -> Result<Option<ReceivedFrame>, RadioError> {
        if self.push {
            return Ok(None);
        }
        let mut reader = match self.reader.filter(|r| r.remaining > 0) {
            Some(reader) => reader,
            None => match self.open_frame(session)? {
                Some(reader) => reader,
                None => return Ok(None),
            },
        };
        if reader.remaining == 0 {
            self.reader = None;
            return Err(RadioError::FifoUnderrun {
                requested: 1,
                remaining: 0,
            });
        }
        if reader.remaining < reader.len {
            log::debug!(
                "Rewinding frame at FIFO offset {}, {} of {} bytes already read",
                reader.start,
                reader.len - reader.remaining,
                reader.len
            );
            reader.offset = reader.start;
            reader.remaining = reader.len;
            self.reader = Some(reader);
        }

        let mut payload = vec![0u8; reader.remaining - 1];
        self.read_into(session, &mut payload)?;
        let counter = self.read_byte(session)?;

        let mut packet_status = [0u8; 3];
        session.read(opcode::GET_PACKET_STATUS, &[], &mut packet_status)?;
        let (rssi_dbm, snr_db) = signal_quality(session.protocol(), packet_status);
        self.reader = None;

        Ok(Some(ReceivedFrame {
            payload,
            counter,
            rssi_dbm,
            snr_db,
            status: reader.status,
        }))
    }
}
