//! Scripted radio emulation for the integration tests.
//!
//! `MockHal` interprets the SPI traffic the stack generates: register
//! reads and writes land in a shadow register file, FIFO bursts move
//! bytes between the test-provided FIFO queues, and "non-blocking"
//! transfers complete synchronously while latching a pending-completion
//! flag the test drains through `Wps::transfer_complete`.

use std::collections::VecDeque;
use std::convert::Infallible;

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use wps::hal::WpsHal;

const REG_WRITE: u8 = 0x80;
const REG_BURST: u8 = 0x40;
const REG_ADDR_MASK: u8 = 0x3F;

const REG8_ACTIONS: u8 = 0x00;
const REG8_POWER_STATE: u8 = 0x01;
const REG8_FIFOS: u8 = 0x02;
const REG16_IRQ: u8 = 0x04;

const ACTION_SLEEP: u8 = 0x10;
const POWER_AWAKE: u8 = 0x01;

/// Infallible test pin.
pub struct DummyPin(pub bool);

impl ErrorType for DummyPin {
    type Error = Infallible;
}

impl OutputPin for DummyPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0 = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0 = true;
        Ok(())
    }
}

impl InputPin for DummyPin {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.0)
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.0)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Burst {
    FifoRead,
    FifoWrite,
}

/// Radio emulation behind the HAL facade.
pub struct MockHal {
    pub regs: [u16; 64],
    pub power_state: u8,
    /// Latched IRQ flags, cleared by the stack's IRQ register read.
    pub irq_flags: u16,
    /// Bytes the stack wrote to the radio TX FIFO.
    pub tx_fifo: Vec<u8>,
    /// Bytes the radio hands out on FIFO reads.
    pub rx_fifo: VecDeque<u8>,
    burst: Option<Burst>,
    transfer_pending: bool,
    pub callback_pending: bool,
    pub reset: DummyPin,
    pub irq: DummyPin,
    ticks: u64,
}

impl Default for MockHal {
    fn default() -> Self {
        Self {
            regs: [0u16; 64],
            power_state: POWER_AWAKE,
            irq_flags: 0,
            tx_fifo: Vec::new(),
            rx_fifo: VecDeque::new(),
            burst: None,
            transfer_pending: false,
            callback_pending: false,
            reset: DummyPin(false),
            irq: DummyPin(false),
            ticks: 0,
        }
    }
}

impl MockHal {
    pub fn take_transfer_pending(&mut self) -> bool {
        std::mem::take(&mut self.transfer_pending)
    }

    /// Stage the radio events of the next interrupt.
    pub fn set_events(&mut self, irq_flags: u16, fifo: &[u8]) {
        self.irq_flags = irq_flags;
        self.rx_fifo.clear();
        self.rx_fifo.extend(fifo.iter().copied());
    }

    pub fn advance_ticks(&mut self, ticks: u64) {
        self.ticks += ticks;
    }

    fn is_reg8(addr: u8) -> bool {
        matches!(addr, REG8_ACTIONS | REG8_POWER_STATE | REG8_FIFOS)
    }

    fn write8(&mut self, addr: u8, value: u8) {
        if addr == REG8_ACTIONS {
            if value == 0 {
                self.power_state |= POWER_AWAKE;
            } else if value & ACTION_SLEEP != 0 {
                self.power_state = 0;
            }
        }
        self.regs[usize::from(addr)] =
            (self.regs[usize::from(addr)] & 0xFF00) | u16::from(value);
    }

    fn read8(&mut self, addr: u8) -> u8 {
        match addr {
            REG8_POWER_STATE => self.power_state,
            REG8_FIFOS => self.rx_fifo.pop_front().unwrap_or(0),
            _ => self.regs[usize::from(addr)] as u8,
        }
    }

    fn read16(&mut self, addr: u8) -> u16 {
        if addr == REG16_IRQ {
            return std::mem::take(&mut self.irq_flags);
        }
        self.regs[usize::from(addr)]
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) {
        match self.burst {
            Some(Burst::FifoRead) => {
                for byte in rx.iter_mut() {
                    *byte = self.rx_fifo.pop_front().unwrap_or(0);
                }
                return;
            }
            Some(Burst::FifoWrite) => {
                self.tx_fifo.extend_from_slice(tx);
                return;
            }
            None => {}
        }

        let mut i = 0;
        while i < tx.len() {
            let cmd = tx[i];
            let addr = cmd & REG_ADDR_MASK;
            let write = cmd & REG_WRITE != 0;
            let burst = cmd & REG_BURST != 0;

            if burst && addr == REG8_FIFOS {
                if write {
                    self.tx_fifo.extend_from_slice(&tx[i + 1..]);
                    self.burst = Some(Burst::FifoWrite);
                } else {
                    for j in i + 1..rx.len() {
                        rx[j] = self.rx_fifo.pop_front().unwrap_or(0);
                    }
                    self.burst = Some(Burst::FifoRead);
                }
                return;
            }
            if burst {
                // Burst write over consecutive 16-bit registers.
                let mut reg = addr;
                let mut k = i + 1;
                while k + 1 < tx.len() {
                    self.regs[usize::from(reg)] = u16::from_le_bytes([tx[k], tx[k + 1]]);
                    reg += 1;
                    k += 2;
                }
                return;
            }

            if Self::is_reg8(addr) {
                if write {
                    self.write8(addr, tx.get(i + 1).copied().unwrap_or(0));
                } else {
                    let value = self.read8(addr);
                    if let Some(slot) = rx.get_mut(i + 1) {
                        *slot = value;
                    }
                }
                i += 2;
            } else {
                if write {
                    let lo = tx.get(i + 1).copied().unwrap_or(0);
                    let hi = tx.get(i + 2).copied().unwrap_or(0);
                    self.regs[usize::from(addr)] = u16::from_le_bytes([lo, hi]);
                } else {
                    let value = self.read16(addr);
                    let bytes = value.to_le_bytes();
                    if let Some(slot) = rx.get_mut(i + 1) {
                        *slot = bytes[0];
                    }
                    if let Some(slot) = rx.get_mut(i + 2) {
                        *slot = bytes[1];
                    }
                }
                i += 3;
            }
        }
    }
}

impl WpsHal for MockHal {
    type ResetPin = DummyPin;
    type IrqPin = DummyPin;

    fn spi_transfer_blocking(&mut self, tx: &[u8], rx: &mut [u8]) {
        self.transfer(tx, rx);
    }

    fn spi_transfer_non_blocking(&mut self, tx: &[u8], rx: &mut [u8]) {
        self.transfer(tx, rx);
        self.transfer_pending = true;
    }

    fn is_spi_busy(&mut self) -> bool {
        false
    }

    fn set_cs(&mut self) {
        self.burst = None;
    }

    fn reset_cs(&mut self) {}

    fn reset_pin(&mut self) -> &mut DummyPin {
        &mut self.reset
    }

    fn irq_pin(&mut self) -> &mut DummyPin {
        &mut self.irq
    }

    fn enable_radio_irq(&mut self) {}

    fn disable_radio_irq(&mut self) {}

    fn enable_dma_irq(&mut self) {}

    fn disable_dma_irq(&mut self) {}

    fn radio_context_switch(&mut self) {}

    fn context_switch_trigger(&mut self) {
        self.callback_pending = true;
    }

    fn now_ticks(&self) -> u64 {
        self.ticks
    }

    fn tick_frequency_hz(&self) -> u32 {
        1_000_000
    }
}
