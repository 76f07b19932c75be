//! Mock transport implementation for testing
//!
//! `MockHal` records every operation issued by the control layer and simulates
//! just enough of the chip to drive the full begin → configure → run flow without
//! hardware: scripted interrupt events, an RX FIFO, packet status bytes and a
//! BUSY line that can be made to hang.
//!
//! Clones share state, so a test can keep one clone for inspection after moving
//! the other into a session.

use crate::radio::commands::opcode;
use crate::radio::hal::{Hal, HalError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// One recorded transport operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Command { opcode: u8, data: Vec<u8> },
    WriteRegister { addr: u16, data: Vec<u8> },
    ReadCommand { opcode: u8, args: Vec<u8>, len: usize },
    ReadRegister { addr: u16, len: usize },
    WaitBusy,
    Reset,
    Gpio { pin: u8, value: bool },
    Release,
}

impl MockOp {
    /// Whether this operation changes chip or pin state
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            MockOp::Command { .. } | MockOp::WriteRegister { .. } | MockOp::Gpio { .. } | MockOp::Reset
        )
    }
}

#[derive(Debug)]
struct MockState {
    ops: Vec<MockOp>,
    registers: HashMap<u16, u8>,
    /// Events that become pending one at a time
    irq_events: VecDeque<u16>,
    /// Current IRQ register value
    pending_irq: u16,
    /// Raise TxDone whenever SetTx is issued
    auto_tx_done: bool,
    rx_buffer: Vec<u8>,
    rx_start: u8,
    rx_len: u8,
    packet_status: [u8; 3],
    status_byte: u8,
    busy_stuck: bool,
    fail_opcode: Option<u8>,
    fail_register: Option<u16>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            ops: Vec::new(),
            registers: HashMap::new(),
            irq_events: VecDeque::new(),
            pending_irq: 0,
            auto_tx_done: true,
            rx_buffer: Vec::new(),
            rx_start: 0,
            rx_len: 0,
            packet_status: [0; 3],
            // chip mode STBY_RC in bits 6:4
            status_byte: 0x22,
            busy_stuck: false,
            fail_opcode: None,
            fail_register: None,
        }
    }
}

/// Recording transport that simulates an SX126x
#[derive(Debug, Clone, Default)]
pub struct MockHal {
    state: Arc<Mutex<MockState>>,
}

impl MockHal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an interrupt status value to be raised on a later IRQ wait
    pub fn queue_irq(&self, status: u16) {
        self.state().irq_events.push_back(status);
    }

    /// Load `payload` into the RX FIFO at `start` and raise RxDone
    pub fn queue_rx_frame(&self, start: u8, payload: &[u8]) {
        let mut state = self.state();
        let start_idx = start as usize;
        if state.rx_buffer.len() < start_idx + payload.len() {
            state.rx_buffer.resize(start_idx + payload.len(), 0);
        }
        state.rx_buffer[start_idx..start_idx + payload.len()].copy_from_slice(payload);
        state.rx_start = start;
        state.rx_len = payload.len() as u8;
        state.irq_events.push_back(0x0002);
    }

    /// Bytes returned by `GetPacketStatus`
    pub fn set_packet_status(&self, status: [u8; 3]) {
        self.state().packet_status = status;
    }

    /// Status byte returned by `GetStatus`
    pub fn set_status_byte(&self, status: u8) {
        self.state().status_byte = status;
    }

    /// Make every BUSY wait time out
    pub fn set_busy_stuck(&self, stuck: bool) {
        self.state().busy_stuck = stuck;
    }

    /// Raise TxDone automatically after SetTx (default on)
    pub fn set_auto_tx_done(&self, enabled: bool) {
        self.state().auto_tx_done = enabled;
    }

    /// Fail every command with this opcode
    pub fn fail_command(&self, opcode: Option<u8>) {
        self.state().fail_opcode = opcode;
    }

    /// Fail every write to this register
    pub fn fail_register(&self, addr: Option<u16>) {
        self.state().fail_register = addr;
    }

    /// All recorded operations
    pub fn ops(&self) -> Vec<MockOp> {
        self.state().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    /// Total number of recorded operations
    pub fn op_count(&self) -> usize {
        self.state().ops.len()
    }

    /// Number of operations that changed chip or pin state
    pub fn write_count(&self) -> usize {
        self.state().ops.iter().filter(|op| op.is_write()).count()
    }

    /// Payloads of every command issued with `opcode`, in order
    pub fn commands(&self, opcode: u8) -> Vec<Vec<u8>> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                MockOp::Command { opcode: o, data } if *o == opcode => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Payload of the most recent command with `opcode`
    pub fn last_command(&self, opcode: u8) -> Option<Vec<u8>> {
        self.commands(opcode).pop()
    }

    /// Data of every write to `addr`, in order
    pub fn register_writes(&self, addr: u16) -> Vec<Vec<u8>> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                MockOp::WriteRegister { addr: a, data } if *a == addr => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Total bytes requested through `ReadBuffer`
    pub fn fifo_bytes_read(&self) -> usize {
        self.state()
            .ops
            .iter()
            .map(|op| match op {
                MockOp::ReadCommand { opcode: o, len, .. } if *o == opcode::READ_BUFFER => *len,
                _ => 0,
            })
            .sum()
    }

    pub fn release_count(&self) -> usize {
        self.state().ops.iter().filter(|op| **op == MockOp::Release).count()
    }

    /// Current simulated IRQ register value
    pub fn pending_irq(&self) -> u16 {
        self.state().pending_irq
    }

    fn promote_event(state: &mut MockState) -> bool {
        if state.pending_irq != 0 {
            return true;
        }
        match state.irq_events.pop_front() {
            Some(event) => {
                state.pending_irq |= event;
                true
            }
            None => false,
        }
    }
}

impl Hal for MockHal {
    fn write_command(&mut self, opcode: u8, data: &[u8]) -> Result<(), HalError> {
        let mut state = self.state();
        if state.fail_opcode == Some(opcode) {
            return Err(HalError::Spi);
        }
        state.ops.push(MockOp::Command {
            opcode,
            data: data.to_vec(),
        });
        match opcode {
            opcode::CLEAR_IRQ_STATUS if data.len() == 2 => {
                let mask = u16::from_be_bytes([data[0], data[1]]);
                state.pending_irq &= !mask;
            }
            opcode::SET_TX if state.auto_tx_done => {
                state.irq_events.push_back(0x0001);
            }
            _ => {}
        }
        Ok(())
    }

    fn read_command(&mut self, opcode: u8, args: &[u8], buf: &mut [u8]) -> Result<(), HalError> {
        let mut state = self.state();
        state.ops.push(MockOp::ReadCommand {
            opcode,
            args: args.to_vec(),
            len: buf.len(),
        });
        buf.fill(0);
        match opcode {
            opcode::GET_STATUS => {
                if let Some(b) = buf.first_mut() {
                    *b = state.status_byte;
                }
            }
            opcode::GET_IRQ_STATUS => {
                Self::promote_event(&mut state);
                let bytes = state.pending_irq.to_be_bytes();
                for (dst, src) in buf.iter_mut().zip(bytes) {
                    *dst = src;
                }
            }
            opcode::GET_RX_BUFFER_STATUS => {
                let status = [state.rx_len, state.rx_start];
                for (dst, src) in buf.iter_mut().zip(status) {
                    *dst = src;
                }
            }
            opcode::GET_PACKET_STATUS => {
                let status = state.packet_status;
                for (dst, src) in buf.iter_mut().zip(status) {
                    *dst = src;
                }
            }
            opcode::READ_BUFFER => {
                let offset = args.first().copied().unwrap_or(0) as usize;
                for (i, dst) in buf.iter_mut().enumerate() {
                    *dst = state.rx_buffer.get(offset + i).copied().unwrap_or(0);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn write_register(&mut self, addr: u16, data: &[u8]) -> Result<(), HalError> {
        let mut state = self.state();
        if state.fail_register == Some(addr) {
            return Err(HalError::Register);
        }
        state.ops.push(MockOp::WriteRegister {
            addr,
            data: data.to_vec(),
        });
        for (i, byte) in data.iter().enumerate() {
            state.registers.insert(addr + i as u16, *byte);
        }
        Ok(())
    }

    fn read_register(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), HalError> {
        let mut state = self.state();
        state.ops.push(MockOp::ReadRegister {
            addr,
            len: buf.len(),
        });
        for (i, dst) in buf.iter_mut().enumerate() {
            *dst = state.registers.get(&(addr + i as u16)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn wait_busy(&mut self, _timeout: Duration) -> Result<(), HalError> {
        let mut state = self.state();
        state.ops.push(MockOp::WaitBusy);
        if state.busy_stuck {
            Err(HalError::Timeout)
        } else {
            Ok(())
        }
    }

    fn wait_irq(&mut self, timeout: Duration) -> Result<bool, HalError> {
        if Self::promote_event(&mut self.state()) {
            return Ok(true);
        }
        // Nothing scripted: behave like a quiet IRQ line
        thread::sleep(timeout);
        Ok(Self::promote_event(&mut self.state()))
    }

    fn reset(&mut self) -> Result<(), HalError> {
        self.state().ops.push(MockOp::Reset);
        Ok(())
    }

    fn gpio_write(&mut self, pin: u8, value: bool) -> Result<(), HalError> {
        self.state().ops.push(MockOp::Gpio { pin, value });
        Ok(())
    }

    fn release(&mut self) -> Result<(), HalError> {
        self.state().ops.push(MockOp::Release);
        Ok(())
    }
}
