//! # Platform facade
//!
//! The stack drives a single SPI-attached radio through this facade. The
//! board integration provides the SPI transport, the chip-select and reset
//! lines, the radio IRQ line, interrupt gating and the tick source. The
//! facade is a compile-time dependency only; there is no runtime
//! polymorphism.
//!
//! Contract:
//! - `spi_transfer_blocking` returns only once the transfer completed.
//! - `spi_transfer_non_blocking` starts a DMA transfer and returns
//!   immediately; completion must be reported by invoking
//!   [`Wps::transfer_complete`](crate::Wps::transfer_complete) from the DMA
//!   interrupt.
//! - All IRQ enable/disable methods are idempotent.
//! - `radio_context_switch` raises the radio IRQ line in software so the
//!   pending chain resumes even when the hardware edge was missed.
//! - `context_switch_trigger` raises the low-priority software interrupt
//!   that drains the callback queue through
//!   [`Wps::process_callback`](crate::Wps::process_callback).

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;

/// Low-level platform operations consumed by the stack.
pub trait WpsHal {
    /// Radio reset line.
    type ResetPin: OutputPin;
    /// Radio IRQ line.
    type IrqPin: InputPin;

    /// Transfer `tx` while capturing `rx`, blocking until completion.
    fn spi_transfer_blocking(&mut self, tx: &[u8], rx: &mut [u8]);

    /// Start a DMA transfer of `tx` while capturing `rx` and return
    /// immediately. The DMA complete interrupt must call
    /// [`Wps::transfer_complete`](crate::Wps::transfer_complete).
    fn spi_transfer_non_blocking(&mut self, tx: &[u8], rx: &mut [u8]);

    /// Whether a SPI transfer is still in flight.
    fn is_spi_busy(&mut self) -> bool;

    /// Drive chip select high (release the radio bus).
    fn set_cs(&mut self);

    /// Drive chip select low (address the radio).
    fn reset_cs(&mut self);

    /// Access the radio reset line.
    fn reset_pin(&mut self) -> &mut Self::ResetPin;

    /// Access the radio IRQ line.
    fn irq_pin(&mut self) -> &mut Self::IrqPin;

    /// Sample the radio IRQ line.
    fn read_irq_pin(&mut self) -> bool {
        self.irq_pin().is_high().unwrap_or(false)
    }

    /// Unmask the radio IRQ line interrupt.
    fn enable_radio_irq(&mut self);

    /// Mask the radio IRQ line interrupt.
    fn disable_radio_irq(&mut self);

    /// Unmask the SPI DMA complete interrupt.
    fn enable_dma_irq(&mut self);

    /// Mask the SPI DMA complete interrupt.
    fn disable_dma_irq(&mut self);

    /// Software-trigger the radio IRQ path.
    fn radio_context_switch(&mut self);

    /// Software-trigger the low-priority callback interrupt.
    fn context_switch_trigger(&mut self);

    /// Free-running tick counter.
    fn now_ticks(&self) -> u64;

    /// Tick counter frequency, in hertz.
    fn tick_frequency_hz(&self) -> u32;
}

/// Capability hooks for the dual-radio variant.
///
/// A single-radio integration keeps the no-op defaults; a dual-radio board
/// implements them over its shared synchronization timer.
pub trait MultiRadioHal {
    /// Start the shared multi-radio timer.
    fn timer_start(&mut self) {}
    /// Stop the shared multi-radio timer.
    fn timer_stop(&mut self) {}
    /// Program the shared timer period, in PLL cycles.
    fn set_timer_period(&mut self, _pll_cycles: u32) {}
    /// Select which radio the following SPI traffic addresses.
    fn select_radio(&mut self, _radio_idx: usize) {}
}

/// [`WpsHal`] adapter over a blocking [`SpiBus`] and `embedded-hal` pins.
///
/// The "non-blocking" transfer completes synchronously and latches a
/// pending-completion flag; the integration drains it with
/// [`take_transfer_pending`](BlockingSpiHal::take_transfer_pending) and then
/// invokes [`Wps::transfer_complete`](crate::Wps::transfer_complete).
/// Useful for bring-up on targets without SPI DMA and for host-side testing.
pub struct BlockingSpiHal<SPI, CS, RST, IRQ> {
    spi: SPI,
    cs: CS,
    reset: RST,
    irq: IRQ,
    tick_frequency_hz: u32,
    transfer_pending: bool,
    context_switch_pending: bool,
    callback_pending: bool,
    ticks: u64,
}

impl<SPI, CS, RST, IRQ> BlockingSpiHal<SPI, CS, RST, IRQ>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    RST: OutputPin,
    IRQ: InputPin,
{
    pub fn new(spi: SPI, cs: CS, reset: RST, irq: IRQ, tick_frequency_hz: u32) -> Self {
        Self {
            spi,
            cs,
            reset,
            irq,
            tick_frequency_hz,
            transfer_pending: false,
            context_switch_pending: false,
            callback_pending: false,
            ticks: 0,
        }
    }

    /// Take the pending DMA-complete notification, if any.
    pub fn take_transfer_pending(&mut self) -> bool {
        core::mem::take(&mut self.transfer_pending)
    }

    /// Take the pending software radio IRQ, if any.
    pub fn take_context_switch_pending(&mut self) -> bool {
        core::mem::take(&mut self.context_switch_pending)
    }

    /// Take the pending callback trigger, if any.
    pub fn take_callback_pending(&mut self) -> bool {
        core::mem::take(&mut self.callback_pending)
    }

    /// Advance the software tick counter.
    pub fn advance_ticks(&mut self, ticks: u64) {
        self.ticks = self.ticks.wrapping_add(ticks);
    }
}

impl<SPI, CS, RST, IRQ> WpsHal for BlockingSpiHal<SPI, CS, RST, IRQ>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    RST: OutputPin,
    IRQ: InputPin,
{
    type ResetPin = RST;
    type IrqPin = IRQ;

    fn spi_transfer_blocking(&mut self, tx: &[u8], rx: &mut [u8]) {
        let n = tx.len().min(rx.len());
        let _ = self.spi.transfer(&mut rx[..n], &tx[..n]);
        if tx.len() > n {
            let _ = self.spi.write(&tx[n..]);
        }
    }

    fn spi_transfer_non_blocking(&mut self, tx: &[u8], rx: &mut [u8]) {
        self.spi_transfer_blocking(tx, rx);
        self.transfer_pending = true;
    }

    fn is_spi_busy(&mut self) -> bool {
        false
    }

    fn set_cs(&mut self) {
        let _ = self.cs.set_high();
    }

    fn reset_cs(&mut self) {
        let _ = self.cs.set_low();
    }

    fn reset_pin(&mut self) -> &mut RST {
        &mut self.reset
    }

    fn irq_pin(&mut self) -> &mut IRQ {
        &mut self.irq
    }

    fn enable_radio_irq(&mut self) {}

    fn disable_radio_irq(&mut self) {}

    fn enable_dma_irq(&mut self) {}

    fn disable_dma_irq(&mut self) {}

    fn radio_context_switch(&mut self) {
        self.context_switch_pending = true;
    }

    fn context_switch_trigger(&mut self) {
        self.callback_pending = true;
    }

    fn now_ticks(&self) -> u64 {
        self.ticks
    }

    fn tick_frequency_hz(&self) -> u32 {
        self.tick_frequency_hz
    }
}

impl<SPI, CS, RST, IRQ> MultiRadioHal for BlockingSpiHal<SPI, CS, RST, IRQ> {}
