//! # PHY state machine
//!
//! Cooperative, IRQ-driven driver of the radio. Work is organized in short
//! chains of state steps; a chain ends with an `End` step that pops the
//! next chain from an eight-deep queue. Steps run in radio-IRQ or
//! DMA-complete context and never block on anything but the SPI busy flag:
//! a step that starts a DMA transfer yields, and the completion interrupt
//! resumes the chain at the following step. A `CloseSpi` step entered
//! before the previous transfer finished rewinds itself and yields again.
//!
//! The MAC feeds the PHY an input signal plus the frame descriptors of the
//! timeslot; the PHY answers with output signals describing the exchange
//! outcome.

pub mod regs;
pub mod transfer;

use heapless::{Deque, Vec};

use crate::config::{
    DISABLE_CCA_THRESHOLD, PAYLOAD_SIZE_BYTE_SIZE, PHY_OVERWRITE_REG_COUNT, PHY_STATE_QUEUE_SIZE,
    RADIO_MAX_PACKET_SIZE, SPI_BURST_PREFIX_SIZE,
};
use crate::error::WpsError;
use crate::hal::WpsHal;
use crate::link::cca::CcaFailAction;
use crate::link::phase::PhaseInfo;
use crate::link::scheduler::SleepLvl;
use crate::mac::{MacCore, XlayerRef};
use crate::xlayer::{BufKind, BufPtr, CircularData, FrameOutcome, NodePool};
use regs::{Actions, IrqEvents, PowerState, RfChannel, RfChannelPattern};
use transfer::{FillHeaderXfer, RadioCfgXfer, ReadEventsXfer, ReadInfoXfer};

/// Size byte the radio prepends to saved frames.
const HDR_SIZE_SIZE: u8 = PAYLOAD_SIZE_BYTE_SIZE as u8;
/// Bytes the radio saves for a header-only acknowledge (size and retry
/// header fields).
const RX_SAVED_BYTE_COUNT: u8 = 2;
/// Largest programmable RX timeout, in PLL cycles.
pub const MAX_RX_TIMEOUT: u16 = 0x1FFF;
/// Sleep period programmed while hunting for sync.
const FAST_SYNC_IDLE_SLEEP_VAL: u32 = 0xFFFF;
/// RX timeout programmed while hunting for sync.
const FAST_SYNC_IDLE_TIMEOUT_VAL: u16 = 0xFFFF - 8;
/// Bound on the power-state polling loops of connect and disconnect.
const POWER_STATE_POLL_BUDGET: u32 = 100_000;

/// Signals fed into the PHY.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PhyInput {
    #[default]
    None,
    /// A timeslot is staged; configure the radio for it.
    PrepareRadio,
    /// Enter non-stop RX to hunt for the first sync frame.
    Syncing,
    /// The radio IRQ line fired.
    RadioIrq,
    /// The SPI DMA transfer completed.
    DmaCmplt,
}

/// Signals the PHY reports to the MAC.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PhyOutput {
    #[default]
    None,
    /// The timeslot configuration was staged for transfer.
    PrepareDone,
    /// The radio is configured and armed; requests may run.
    ConfigComplete,
    /// A blocking register access finished.
    BlockingConfigDone,
    /// Frame sent and acknowledged.
    FrameSentAck,
    /// Frame sent without (or with a failed) acknowledge.
    FrameSentNack,
    /// A frame arrived.
    FrameReceived,
    /// The expected frame never arrived.
    FrameMissed,
    /// The staged auto-reply was never sent.
    FrameNotSent,
    /// The chain is waiting for an interrupt.
    Yield,
    /// The radio connected to the network.
    Connect,
    /// The state machine received a signal it cannot handle.
    Error,
}

impl PhyOutput {
    /// Whether the MAC must be told about this signal.
    pub fn notifies_mac(self) -> bool {
        matches!(
            self,
            Self::ConfigComplete
                | Self::BlockingConfigDone
                | Self::FrameSentAck
                | Self::FrameSentNack
                | Self::FrameReceived
                | Self::FrameMissed
                | Self::Connect
                | Self::Error
        )
    }
}

/// Periodic or one-shot register write configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegWriteCfg {
    /// Applied once between timeslots.
    WriteOnce,
    /// Re-applied before every frame preparation.
    WritePeriodic,
}

#[derive(Debug, Clone, Copy)]
struct RegWrite {
    reg: u8,
    value: u16,
}

/// Per-timeslot radio configuration staged by the MAC.
#[derive(Debug, Clone)]
pub struct PhyFrameCfg {
    /// Spectral pattern and frame configuration of the slot's channel.
    pub channel: RfChannel,
    pub cca_threshold: u8,
    pub cca_retry_time: u16,
    pub cca_max_try_count: u8,
    pub cca_fail_action: CcaFailAction,
    pub cca_on_time: u8,
    /// CCA attempts consumed, written back by the PHY.
    pub cca_try_count: u8,
    /// Sleep period leading into the slot, in PLL cycles.
    pub sleep_time: u32,
    /// Radio power-up delay, in PLL cycles.
    pub power_up_delay: u16,
    /// RX listening window, in PLL cycles.
    pub rx_timeout: u16,
    pub sleep_level: SleepLvl,
    pub next_sleep_level: SleepLvl,
    pub expect_ack: bool,
    pub certification_header_en: bool,
    pub expected_header_size: u8,
    pub expected_payload_size: u8,
    /// ARQ sequence bit to carry in the retry header.
    pub seq_num: bool,
    /// Receiver gain override for the slot.
    pub rx_gain: u8,
    /// Capture ranging phases for this exchange.
    pub phases_enabled: bool,
    /* written back by the PHY */
    pub rx_wait_time: u16,
    pub rx_cca_retry_count: u8,
    pub rx_seq_num: bool,
    pub rssi_raw: u8,
    pub rnsi_raw: u8,
    pub phases_info: Option<PhaseInfo>,
}

impl Default for PhyFrameCfg {
    fn default() -> Self {
        Self {
            channel: RfChannel::default(),
            cca_threshold: DISABLE_CCA_THRESHOLD,
            cca_retry_time: 0,
            cca_max_try_count: 0,
            cca_fail_action: CcaFailAction::AbortTx,
            cca_on_time: 0,
            cca_try_count: 0,
            sleep_time: 0,
            power_up_delay: 0,
            rx_timeout: MAX_RX_TIMEOUT,
            sleep_level: SleepLvl::Idle,
            next_sleep_level: SleepLvl::Idle,
            expect_ack: false,
            certification_header_en: false,
            expected_header_size: 0,
            expected_payload_size: 0,
            seq_num: false,
            rx_gain: 0,
            phases_enabled: false,
            rx_wait_time: 0,
            rx_cca_retry_count: 0,
            rx_seq_num: false,
            rssi_raw: 0,
            rnsi_raw: 0,
            phases_info: None,
        }
    }
}

/// Borrowed stack resources the PHY needs while processing.
pub struct PhyRes<'r, 'm> {
    pub mac: &'r mut MacCore,
    pub tx_pool: &'r mut NodePool<'m>,
    pub rx_pool: &'r mut NodePool<'m>,
    pub tx_data: &'r mut CircularData<'m>,
    pub rx_data: &'r mut CircularData<'m>,
}

/// State functions of the chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    PreparePhy,
    SetConfig,
    SetHeader,
    SetPayload,
    SetHeaderAndPayload,
    EnableRadioIrq,
    CheckRadioIrq,
    ReadEvents,
    ReadEventsSyncing,
    ProcessEventTx,
    ProcessEventRx,
    GetFrameHeader,
    GetAutoReplyHeader,
    GetPayload,
    CloseSpi,
    TransferRegister,
    OverwriteRegisters,
    End,
    Idle,
}

/// Fixed step chains of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
    Prepare,
    SetConfig,
    SetHeader,
    SetPayload,
    SetHeaderAndPayload,
    WaitTx,
    WaitRx,
    GetFrameHeader,
    GetAutoReplyHeader,
    GetPayload,
    NewFrame,
    Syncing,
    WaitToSendAutoReply,
    TransferRegister,
    OverwriteRegisters,
    Idle,
}

impl Chain {
    fn steps(self) -> &'static [Step] {
        match self {
            Chain::Prepare => &[Step::PreparePhy, Step::End],
            Chain::SetConfig => &[Step::SetConfig, Step::CloseSpi, Step::End],
            Chain::SetHeader => &[Step::CloseSpi, Step::SetHeader, Step::End],
            Chain::SetPayload => &[Step::SetPayload, Step::End],
            Chain::SetHeaderAndPayload => &[Step::CloseSpi, Step::SetHeaderAndPayload, Step::End],
            Chain::WaitTx => &[
                Step::CloseSpi,
                Step::EnableRadioIrq,
                Step::ReadEvents,
                Step::CloseSpi,
                Step::ProcessEventTx,
                Step::End,
            ],
            Chain::WaitRx => &[
                Step::CloseSpi,
                Step::EnableRadioIrq,
                Step::ReadEvents,
                Step::CloseSpi,
                Step::ProcessEventRx,
                Step::End,
            ],
            Chain::GetFrameHeader => &[Step::CloseSpi, Step::GetFrameHeader, Step::End],
            Chain::GetAutoReplyHeader => &[Step::CloseSpi, Step::GetAutoReplyHeader, Step::End],
            Chain::GetPayload => &[Step::GetPayload, Step::End],
            Chain::NewFrame => &[Step::CloseSpi, Step::End],
            Chain::Syncing => &[
                Step::ReadEventsSyncing,
                Step::CloseSpi,
                Step::ProcessEventRx,
                Step::End,
            ],
            Chain::WaitToSendAutoReply => &[Step::CheckRadioIrq, Step::End],
            Chain::TransferRegister => &[Step::TransferRegister, Step::End],
            Chain::OverwriteRegisters => &[Step::OverwriteRegisters, Step::End],
            Chain::Idle => &[Step::Idle],
        }
    }
}

enum Flow {
    Continue,
    Suspend,
}

/// PHY driver of one radio.
pub struct PhyCore {
    local_address: u16,
    current_chain: Chain,
    step: u8,
    next_chains: Deque<Chain, PHY_STATE_QUEUE_SIZE>,
    input_signal: PhyInput,
    signal_main: PhyOutput,
    signal_auto: PhyOutput,
    pub xlayer_main: XlayerRef,
    pub xlayer_auto: Option<XlayerRef>,
    pub cfg: PhyFrameCfg,
    radio_cfg: RadioCfgXfer,
    read_events: ReadEventsXfer,
    read_info: ReadInfoXfer,
    fill_header: FillHeaderXfer,
    spi_dummy: [u8; RADIO_MAX_PACKET_SIZE],
    /// Header size of the frame being pulled from the radio.
    rx_header_size: u8,
    /// Frame size (size byte removed) of the frame being pulled.
    rx_frame_size: u8,
    /// The staged auto-reply is still leaving the radio.
    wait_for_ack_tx: bool,
    write_request: Option<RegWrite>,
    read_request: Option<u8>,
    read_result: Option<u16>,
    overwrite_regs: Vec<RegWrite, PHY_OVERWRITE_REG_COUNT>,
}

impl PhyCore {
    pub fn new(local_address: u16) -> Self {
        Self {
            local_address,
            current_chain: Chain::Idle,
            step: 0,
            next_chains: Deque::new(),
            input_signal: PhyInput::None,
            signal_main: PhyOutput::None,
            signal_auto: PhyOutput::None,
            xlayer_main: XlayerRef::EmptyTx,
            xlayer_auto: None,
            cfg: PhyFrameCfg::default(),
            radio_cfg: RadioCfgXfer::default(),
            read_events: ReadEventsXfer::default(),
            read_info: ReadInfoXfer::default(),
            fill_header: FillHeaderXfer::default(),
            spi_dummy: [0u8; RADIO_MAX_PACKET_SIZE],
            rx_header_size: 0,
            rx_frame_size: 0,
            wait_for_ack_tx: false,
            write_request: None,
            read_request: None,
            read_result: None,
            overwrite_regs: Vec::new(),
        }
    }

    pub fn set_local_address(&mut self, address: u16) {
        self.local_address = address;
    }

    /// One-time radio bring-up: syncword, CRC polynomial, preamble,
    /// packet sizes, address match and the startup quirks of the chip.
    pub fn init<H: WpsHal>(
        &mut self,
        hal: &mut H,
        syncword: u32,
        syncword_length_bits: u16,
        preamble_len_bits: u16,
        crc_polynomial: u32,
        sleep_lvl: SleepLvl,
        rx_gain: u8,
    ) {
        write_reg16(hal, regs::REG16_IRQ, 0x0000);

        write_reg16(hal, regs::REG16_SYNCWORD_15_0, syncword as u16);
        write_reg16(hal, regs::REG16_SYNCWORD_31_16, (syncword >> 16) as u16);

        write_reg16(hal, regs::REG16_CRC_15_1, crc_polynomial as u16);
        write_reg16(hal, regs::REG16_CRC_30_16, (crc_polynomial >> 15) as u16);

        write_reg16(hal, regs::REG16_PREAMB_SWLEN, syncword_length_bits | (preamble_len_bits << 4));

        write_reg16(
            hal,
            regs::REG16_RX_TX_SIZEREG,
            regs::rx_tx_size(RADIO_MAX_PACKET_SIZE as u8 - 1, RADIO_MAX_PACKET_SIZE as u8 - 1),
        );

        write_reg16(hal, regs::REG16_RXADDRESS, self.local_address);

        write_reg16(
            hal,
            regs::REG16_TIMERCFG_SLEEPCFG,
            sleep_depth_bits(sleep_lvl) | regs::SLPTIMEO | regs::SLPTXEND | regs::SLPRXEND,
        );

        write_reg8(hal, regs::REG8_ACTIONS, (Actions::FLUSH_TX | Actions::FLUSH_RX).bits());

        write_reg16(
            hal,
            regs::REG16_IRQ,
            (IrqEvents::RX_END | IrqEvents::TIMEOUT | IrqEvents::TX_END).bits(),
        );

        write_reg16(hal, regs::REG16_PRELUDE, regs::PRELUDE_OPT);

        // The radio must run one regular TX after power up to function.
        write_reg16(hal, regs::REG16_FRAMEPROC_PHASEDATA, 0x0000);
        write_reg8(hal, regs::REG8_ACTIONS, Actions::START_TX.bits());

        // SAVECRC is the only way to have the radio sleep on a timeout
        // event; without it double timeout IRQs show up.
        write_reg16(
            hal,
            regs::REG16_FRAMECFG_SAVETOBUF,
            regs::DEFAULT_PACKET_CONFIGURATION | regs::SAVECRC,
        );

        write_reg16(hal, regs::REG16_RF_GAIN_MANUGAIN, u16::from(rx_gain));

        // The FIFO-busy interrupt can trigger while the TX FIFO is written
        // as the transmitter wakes up.
        write_reg16(hal, regs::REG16_IRQTIME, regs::IRQTIME_DISABUFI);

        let _ = read_reg16(hal, regs::REG16_IRQ);
    }

    /// Program the long-sleep autowake window and arm the state machine.
    /// The caller dispatches the resulting `Connect` signal to the MAC.
    pub fn connect<H: WpsHal>(&mut self, hal: &mut H) -> Result<(), WpsError> {
        let mut budget = POWER_STATE_POLL_BUDGET;
        loop {
            write_reg8(hal, regs::REG8_ACTIONS, 0x00);
            let pwr = PowerState::from_bits_truncate(read_reg8(hal, regs::REG8_POWER_STATE));
            if pwr.contains(PowerState::AWAKE) {
                break;
            }
            budget -= 1;
            if budget == 0 {
                return Err(WpsError::DisconnectTimeout);
            }
        }

        write_reg16(hal, regs::REG16_SLPPERIOD_PWRUPDLAY, 0x00FF);
        write_reg16(hal, regs::REG16_SLPPERIOD_15_0, 0xFFFF);
        write_reg16(
            hal,
            regs::REG16_TIMERCFG_SLEEPCFG,
            sleep_depth_bits(SleepLvl::Idle)
                | regs::SLPTIMEO
                | regs::SLPTXEND
                | regs::SLPRXEND
                | regs::AUTOWAKE,
        );

        write_reg8(
            hal,
            regs::REG8_ACTIONS,
            (Actions::FLUSH_TX | Actions::FLUSH_RX | Actions::INIT_TIMER | Actions::SLEEP).bits(),
        );
        write_reg16(hal, regs::REG16_TIMELIMIT_BIASDELAY, regs::timeout_raw(0xFFFF));
        let _ = read_reg16(hal, regs::REG16_IRQ);

        hal.enable_radio_irq();
        hal.enable_dma_irq();

        self.step = 0;
        self.current_chain = Chain::Prepare;
        while self.next_chains.pop_front().is_some() {}
        self.signal_main = PhyOutput::Connect;
        self.signal_auto = PhyOutput::None;
        Ok(())
    }

    /// Wake the radio, then put it in deep sleep and wait until the power
    /// state reports full power down.
    pub fn disconnect<H: WpsHal>(&mut self, hal: &mut H) -> Result<(), WpsError> {
        let mut budget = POWER_STATE_POLL_BUDGET;
        while hal.is_spi_busy() {
            budget -= 1;
            if budget == 0 {
                return Err(WpsError::DisconnectTimeout);
            }
        }
        hal.set_cs();
        hal.disable_dma_irq();
        hal.disable_radio_irq();

        // Reset the timer configuration so AUTOWAKE stops holding the
        // radio asleep.
        write_reg16(hal, regs::REG16_TIMERCFG_SLEEPCFG, 0);

        let mut budget = POWER_STATE_POLL_BUDGET;
        loop {
            write_reg8(hal, regs::REG8_ACTIONS, 0x00);
            let pwr = PowerState::from_bits_truncate(read_reg8(hal, regs::REG8_POWER_STATE));
            if pwr.contains(PowerState::AWAKE) {
                break;
            }
            budget -= 1;
            if budget == 0 {
                return Err(WpsError::DisconnectTimeout);
            }
        }

        write_reg16(hal, regs::REG16_TIMERCFG_SLEEPCFG, sleep_depth_bits(SleepLvl::Deep));
        write_reg8(hal, regs::REG8_ACTIONS, Actions::SLEEP.bits());

        let mut budget = POWER_STATE_POLL_BUDGET;
        loop {
            let pwr = read_reg8(hal, regs::REG8_POWER_STATE);
            if pwr == 0 {
                break;
            }
            budget -= 1;
            if budget == 0 {
                return Err(WpsError::DisconnectTimeout);
            }
        }

        self.current_chain = Chain::Idle;
        self.step = 0;
        while self.next_chains.pop_front().is_some() {}
        self.signal_main = PhyOutput::None;
        Ok(())
    }

    pub fn set_input_signal(&mut self, signal: PhyInput) {
        self.input_signal = signal;
    }

    pub fn set_main_xlayer(&mut self, xlayer: XlayerRef, cfg: PhyFrameCfg) {
        self.xlayer_main = xlayer;
        self.cfg = cfg;
    }

    pub fn set_auto_xlayer(&mut self, xlayer: Option<XlayerRef>) {
        self.xlayer_auto = xlayer;
    }

    pub fn main_signal(&self) -> PhyOutput {
        self.signal_main
    }

    pub fn auto_signal(&self) -> PhyOutput {
        self.signal_auto
    }

    /// Queue a one-shot or periodic register write.
    pub fn write_register(&mut self, reg: u8, value: u16, cfg: RegWriteCfg) -> Result<(), WpsError> {
        match cfg {
            RegWriteCfg::WriteOnce => {
                if self.write_request.is_some() {
                    return Err(WpsError::WriteRequestQueueFull);
                }
                self.write_request = Some(RegWrite { reg, value });
                self.enqueue_chain(Chain::TransferRegister);
                Ok(())
            }
            RegWriteCfg::WritePeriodic => {
                if let Some(slot) = self.overwrite_regs.iter_mut().find(|w| w.reg == reg) {
                    slot.value = value;
                    return Ok(());
                }
                self.overwrite_regs
                    .push(RegWrite { reg, value })
                    .map(|_| ())
                    .map_err(|_| WpsError::WriteRequestQueueFull)
            }
        }
    }

    /// Drop every periodic register overwrite.
    pub fn clear_write_register(&mut self) {
        self.overwrite_regs.clear();
    }

    /// Queue a register read; the value lands in
    /// [`take_read_result`](Self::take_read_result).
    pub fn read_register(&mut self, reg: u8) -> Result<(), WpsError> {
        if self.read_request.is_some() {
            return Err(WpsError::ReadRequestQueueFull);
        }
        self.read_request = Some(reg);
        self.enqueue_chain(Chain::TransferRegister);
        Ok(())
    }

    /// Completed register read, if any.
    pub fn take_read_result(&mut self) -> Option<u16> {
        self.read_result.take()
    }

    /// Run the state machine until it suspends or raises a MAC-notify
    /// signal. The caller dispatches notify signals and re-invokes.
    pub fn process<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> (PhyOutput, PhyOutput) {
        self.signal_main = PhyOutput::None;
        loop {
            let steps = self.current_chain.steps();
            let step = steps[usize::from(self.step).min(steps.len() - 1)];
            self.step += 1;
            let flow = self.exec(step, hal, res);
            if matches!(flow, Flow::Suspend) {
                break;
            }
            if self.signal_main.notifies_mac() {
                break;
            }
        }
        (self.signal_main, self.signal_auto)
    }

    fn exec<H: WpsHal>(&mut self, step: Step, hal: &mut H, res: &mut PhyRes) -> Flow {
        match step {
            Step::PreparePhy => self.prepare_phy(hal, res),
            Step::SetConfig => self.set_config(hal),
            Step::SetHeader => self.set_header(hal, res),
            Step::SetPayload => self.set_payload(hal, res),
            Step::SetHeaderAndPayload => self.set_header_and_payload(hal, res),
            Step::EnableRadioIrq => self.enable_radio_irq(hal),
            Step::CheckRadioIrq => self.check_radio_irq(hal),
            Step::ReadEvents => self.read_events(hal),
            Step::ReadEventsSyncing => self.read_events_syncing(hal),
            Step::ProcessEventTx => self.process_event_tx(hal, res),
            Step::ProcessEventRx => self.process_event_rx(hal, res),
            Step::GetFrameHeader => self.get_frame_header(hal, res),
            Step::GetAutoReplyHeader => self.get_auto_reply_header(hal, res),
            Step::GetPayload => self.get_payload(hal, res),
            Step::CloseSpi => self.close_spi(hal),
            Step::TransferRegister => self.transfer_register(hal),
            Step::OverwriteRegisters => self.overwrite_registers(hal),
            Step::End => self.end(),
            Step::Idle => {
                self.step = 0;
                Flow::Suspend
            }
        }
    }

    fn enqueue_chain(&mut self, chain: Chain) {
        let _ = self.next_chains.push_back(chain);
    }

    fn end(&mut self) -> Flow {
        self.step = 0;
        self.current_chain = self.next_chains.pop_front().unwrap_or(Chain::Idle);
        Flow::Continue
    }

    fn close_spi<H: WpsHal>(&mut self, hal: &mut H) -> Flow {
        if self.input_signal != PhyInput::DmaCmplt || hal.is_spi_busy() {
            self.step -= 1;
            self.signal_main = PhyOutput::Yield;
            return Flow::Suspend;
        }
        hal.set_cs();
        Flow::Continue
    }

    fn prepare_phy<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> Flow {
        if self.input_signal == PhyInput::Syncing {
            self.enqueue_chain(Chain::Syncing);
            self.prepare_syncing(hal, res);
            self.signal_main = PhyOutput::Yield;
            return Flow::Suspend;
        }
        self.enqueue_chain(Chain::SetConfig);
        if !self.overwrite_regs.is_empty() {
            self.enqueue_chain(Chain::OverwriteRegisters);
        }
        self.prepare_radio(res);
        Flow::Continue
    }

    fn prepare_radio(&mut self, res: &mut PhyRes) {
        self.signal_auto = PhyOutput::None;
        self.wait_for_ack_tx = false;

        let pattern = self.cfg.channel.reg_pattern;
        self.radio_cfg.set_channel(&pattern);
        self.radio_cfg.set_actions(Actions::empty());
        self.radio_cfg.set_phy_0_1(0);
        self.radio_cfg.set_retry_hdr(self.cfg.seq_num);

        if self.main_is_tx(res) {
            self.prepare_radio_tx(res);
        } else {
            self.prepare_radio_rx(res);
        }

        self.radio_cfg.set_sleep_period(self.cfg.sleep_time, self.cfg.power_up_delay);
        self.radio_cfg.set_rf_gain(self.cfg.rx_gain);
        self.radio_cfg.or_actions(Actions::SLEEP);
        self.radio_cfg.or_phy_0_1(self.cfg.channel.frame_cfg_bits);
    }

    fn prepare_radio_tx(&mut self, res: &mut PhyRes) {
        let main = res.resolve(self.xlayer_main);
        let tx_payload_size = main.frame.payload_size() as u8;
        let header_size = main.frame.header_size() as u8;
        let destination = main.frame.destination_address;
        let source = main.frame.source_address;
        let user_payload = main.frame.user_payload;

        self.radio_cfg.set_timercfg_sleepcfg(
            sleep_depth_bits(self.cfg.next_sleep_level)
                | regs::SLPTIMEO
                | regs::SLPTXEND
                | regs::SLPRXEND
                | regs::AUTOWAKE,
        );

        let mut rx_packet_size;
        if let Some(auto) = self.xlayer_auto {
            // A dedicated auto-reply connection answers this frame.
            let auto = res.resolve(auto);
            let auto_total =
                u16::from(auto.frame.payload_memory_size) + u16::from(auto.frame.header_memory_size);
            rx_packet_size =
                if auto_total == 0 { RX_SAVED_BYTE_COUNT } else { auto_total as u8 + HDR_SIZE_SIZE };
            self.radio_cfg.or_phy_0_1(regs::EXPECT_REPLY);
            self.set_events_for_tx_with_ack();
        } else if self.cfg.expect_ack {
            rx_packet_size = RX_SAVED_BYTE_COUNT;
            self.radio_cfg.or_phy_0_1(regs::EXPECT_REPLY);
            self.set_events_for_tx_with_ack();
        } else {
            rx_packet_size = 0;
            self.set_events_for_tx_without_ack();
        }

        if header_size == 0 && !self.cfg.certification_header_en {
            // Nothing to say this slot: wake the timing chain only.
            rx_packet_size = 0;
            self.radio_cfg.set_cca_thres_gain(regs::cca_threshold(0));
            if matches!(self.cfg.sleep_level, SleepLvl::Idle | SleepLvl::IdleNoWakeonce) {
                self.radio_cfg.set_actions(Actions::FLUSH_TX | Actions::FLUSH_RX);
                self.set_events_for_wakeup_only();
            } else {
                // In shallow sleep the WAKEUP interrupt is unreliable;
                // send an empty muted frame instead.
                self.radio_cfg
                    .set_actions(Actions::FLUSH_TX | Actions::FLUSH_RX | Actions::START_TX);
                self.radio_cfg.set_phy_0_1(0);
                self.set_events_for_empty_tx();
            }
        } else {
            self.radio_cfg
                .set_actions(Actions::FLUSH_TX | Actions::FLUSH_RX | Actions::START_TX);
            if self.cfg.cca_threshold == DISABLE_CCA_THRESHOLD {
                self.radio_cfg.set_cca_thres_gain(regs::cca_threshold(0));
            } else {
                self.radio_cfg.set_cca_thres_gain(regs::cca_threshold(self.cfg.cca_threshold));
            }
        }

        let tx_packet_size =
            if header_size + tx_payload_size == 0 { 0 } else { header_size + tx_payload_size + HDR_SIZE_SIZE };
        self.radio_cfg.set_rx_tx_size(tx_packet_size, rx_packet_size);
        self.radio_cfg.set_frameproc(0);
        self.radio_cfg.set_rx_timeout(MAX_RX_TIMEOUT);

        let tx_anyway = self.cfg.cca_fail_action == CcaFailAction::ForwardTx;
        self.radio_cfg.set_cca_settings(regs::cca_settings(
            regs::cca_interval_raw(self.cfg.cca_retry_time),
            self.cfg.cca_max_try_count,
            self.cfg.cca_on_time,
            tx_anyway,
        ));

        self.radio_cfg.set_tx_address(destination);
        self.radio_cfg.set_rx_address(source);

        self.enqueue_tx_prepare_frame_chains(header_size, tx_payload_size, user_payload);
        self.enqueue_chain(Chain::WaitTx);
    }

    fn prepare_radio_rx(&mut self, res: &mut PhyRes) {
        self.radio_cfg.set_timercfg_sleepcfg(
            sleep_depth_bits(self.cfg.next_sleep_level)
                | regs::SLPTIMEO
                | regs::SLPTXEND
                | regs::SLPRXEND
                | regs::AUTOWAKE,
        );

        let main = res.resolve(self.xlayer_main);
        let main_rx_size = u16::from(main.frame.payload_memory_size)
            + u16::from(main.frame.header_memory_size)
            + u16::from(HDR_SIZE_SIZE);
        let main_source = main.frame.source_address;

        let tx_address;
        if let Some(auto) = self.xlayer_auto {
            // This node replies in the same slot; preload the reply.
            let auto = res.resolve(auto);
            let payload_size = auto.frame.payload_size() as u8;
            let header_size = auto.frame.header_size() as u8;
            let user_payload = auto.frame.user_payload;
            tx_address = auto.frame.destination_address;
            let tx_packet_size =
                if header_size + payload_size == 0 { 0 } else { header_size + payload_size + HDR_SIZE_SIZE };
            self.radio_cfg.set_frameproc(regs::RX_MODE | regs::REPLY_TX_EN);
            self.radio_cfg.or_phy_0_1(regs::EXPECT_REPLY);
            self.radio_cfg.set_rx_tx_size(tx_packet_size, main_rx_size as u8);
            self.set_events_for_rx();
            self.enqueue_tx_prepare_frame_chains(header_size, payload_size, user_payload);
            self.enqueue_chain(Chain::WaitRx);
        } else if self.cfg.expect_ack {
            // The radio generates a header-only acknowledge by itself.
            tx_address = main_source;
            self.radio_cfg.set_frameproc(regs::RX_MODE | regs::REPLY_TX_EN);
            self.radio_cfg.or_phy_0_1(regs::EXPECT_REPLY);
            self.radio_cfg.set_rx_tx_size(0, main_rx_size as u8);
            self.set_events_for_rx();
            self.enqueue_chain(Chain::WaitRx);
        } else {
            tx_address = main_source;
            self.radio_cfg.set_frameproc(regs::RX_MODE);
            self.radio_cfg.set_rx_tx_size(0, main_rx_size as u8);
            self.set_events_for_rx();
            self.enqueue_chain(Chain::WaitRx);
        }

        self.radio_cfg.set_tx_address(tx_address);
        self.radio_cfg.set_rx_address(self.local_address);
        self.radio_cfg.set_rx_timeout(self.cfg.rx_timeout);
        self.radio_cfg.set_cca_thres_gain(regs::cca_threshold(0));
        self.radio_cfg.set_actions(Actions::FLUSH_TX | Actions::FLUSH_RX);
    }

    fn enqueue_tx_prepare_frame_chains(&mut self, header_size: u8, payload_size: u8, user_payload: bool) {
        // A payload living in its own storage goes out in two bursts,
        // otherwise header and payload share one contiguous transfer.
        if user_payload {
            if header_size + payload_size != 0 {
                self.enqueue_chain(Chain::SetHeader);
            }
            if payload_size != 0 {
                self.enqueue_chain(Chain::SetPayload);
            }
        } else if header_size + payload_size != 0 {
            self.enqueue_chain(Chain::SetHeaderAndPayload);
        }
    }

    fn set_config<H: WpsHal>(&mut self, hal: &mut H) -> Flow {
        // Some sleep level transitions misbehave while the sequencer is
        // running; wait for PROC_ON to clear before changing depth.
        let lvl = self.cfg.sleep_level;
        let next = self.cfg.next_sleep_level;
        if (lvl != SleepLvl::Idle && next == SleepLvl::Idle)
            || (lvl == SleepLvl::Shallow && next == SleepLvl::Deep)
            || (lvl == SleepLvl::Deep && next == SleepLvl::Shallow)
        {
            let mut budget = POWER_STATE_POLL_BUDGET;
            while PowerState::from_bits_truncate(read_reg8(hal, regs::REG8_POWER_STATE))
                .contains(PowerState::PROC_ON)
            {
                budget -= 1;
                if budget == 0 {
                    break;
                }
            }
        }

        let mut timercfg = self.radio_cfg.timercfg_sleepcfg();
        if lvl == SleepLvl::Idle && next != SleepLvl::Idle {
            // Switching from chip clock to XTAL timer: resync on wake.
            timercfg |= regs::SYNWAKUP;
        }
        write_reg16(hal, regs::REG16_TIMERCFG_SLEEPCFG, timercfg);

        self.signal_main = PhyOutput::PrepareDone;
        hal.reset_cs();
        let (tx, rx) = (self.radio_cfg.as_bytes(), &mut self.spi_dummy[..transfer::RADIO_CFG_XFER_SIZE]);
        hal.spi_transfer_non_blocking(tx, rx);
        Flow::Continue
    }

    fn set_header<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> Flow {
        let frame_ref = if self.main_is_tx(res) { self.xlayer_main } else { self.xlayer_auto.unwrap_or(self.xlayer_main) };
        let (begin, len) = {
            let frame = &res.resolve(frame_ref).frame;
            (frame.header_begin, frame.header_size())
        };

        hal.disable_radio_irq();
        self.signal_main = PhyOutput::Yield;

        let header = res.slice(begin, len);
        let tx = self.fill_header.fill(header);
        hal.reset_cs();
        hal.spi_transfer_non_blocking(tx, &mut self.spi_dummy[..tx.len()]);
        Flow::Suspend
    }

    fn set_payload<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> Flow {
        if self.input_signal != PhyInput::DmaCmplt {
            self.signal_main = PhyOutput::Error;
            return Flow::Suspend;
        }
        let frame_ref = if self.main_is_tx(res) { self.xlayer_main } else { self.xlayer_auto.unwrap_or(self.xlayer_main) };
        let (begin, len) = {
            let frame = &res.resolve(frame_ref).frame;
            (frame.payload_begin, frame.payload_size())
        };

        self.signal_main = PhyOutput::Yield;
        let payload = res.slice(begin, len);
        hal.spi_transfer_non_blocking(payload, &mut self.spi_dummy[..payload.len()]);
        Flow::Suspend
    }

    fn set_header_and_payload<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> Flow {
        if self.input_signal != PhyInput::DmaCmplt {
            self.signal_main = PhyOutput::Error;
            return Flow::Suspend;
        }
        let frame_ref = if self.main_is_tx(res) { self.xlayer_main } else { self.xlayer_auto.unwrap_or(self.xlayer_main) };

        hal.disable_radio_irq();
        self.signal_main = PhyOutput::Yield;

        let (burst_begin, burst_len, header_size) = {
            let frame = &res.resolve(frame_ref).frame;
            let header_size = frame.header_size();
            let payload_size = frame.payload_size();
            (
                frame.header_begin.sub(SPI_BURST_PREFIX_SIZE as u16),
                header_size + payload_size + SPI_BURST_PREFIX_SIZE as u16,
                header_size as u8,
            )
        };

        // The burst command and header-size byte prefix the frame bytes
        // in the same contiguous block.
        let burst = res.slice_mut(burst_begin, burst_len);
        burst[0] = regs::REG_WRITE_BURST | regs::REG8_FIFOS;
        burst[1] = header_size;
        hal.reset_cs();
        let rx = &mut self.spi_dummy[..burst.len()];
        hal.spi_transfer_non_blocking(burst, rx);
        Flow::Suspend
    }

    fn enable_radio_irq<H: WpsHal>(&mut self, hal: &mut H) -> Flow {
        if self.input_signal != PhyInput::DmaCmplt {
            self.signal_main = PhyOutput::Error;
            return Flow::Suspend;
        }
        self.signal_main = PhyOutput::ConfigComplete;
        hal.enable_radio_irq();

        // The rising edge may have come while the IRQ was masked.
        if hal.read_irq_pin() {
            let events = self.read_events.irq();
            if events.rx_lost() && self.read_events.pwr_status().contains(PowerState::RX_EN) {
                // A stale RX timeout with the receiver still armed: just
                // clear the pending flags.
                let _ = read_reg16(hal, regs::REG16_IRQ);
            } else {
                hal.radio_context_switch();
            }
        }
        Flow::Continue
    }

    fn check_radio_irq<H: WpsHal>(&mut self, hal: &mut H) -> Flow {
        hal.enable_radio_irq();
        if !hal.read_irq_pin() {
            // Auto-reply still in the air.
            self.signal_main = PhyOutput::Yield;
            return Flow::Suspend;
        }
        Flow::Continue
    }

    fn read_events<H: WpsHal>(&mut self, hal: &mut H) -> Flow {
        if self.input_signal != PhyInput::RadioIrq {
            self.signal_main = PhyOutput::Error;
            return Flow::Suspend;
        }
        self.signal_main = PhyOutput::Yield;
        hal.reset_cs();
        let out: [u8; transfer::READ_EVENTS_XFER_SIZE] =
            self.read_events.out_bytes().try_into().unwrap_or([0; transfer::READ_EVENTS_XFER_SIZE]);
        hal.spi_transfer_non_blocking(&out, self.read_events.in_bytes_mut());
        Flow::Suspend
    }

    fn read_events_syncing<H: WpsHal>(&mut self, hal: &mut H) -> Flow {
        if self.input_signal != PhyInput::RadioIrq {
            self.signal_main = PhyOutput::Error;
            return Flow::Suspend;
        }
        write_reg16(
            hal,
            regs::REG16_TIMERCFG_SLEEPCFG,
            regs::SLPDEPTH_WAKEONCE
                | regs::SLPTIMEO
                | regs::SLPTXEND
                | regs::SLPRXEND
                | regs::AUTOWAKE,
        );
        self.signal_main = PhyOutput::Yield;
        hal.reset_cs();
        let out: [u8; transfer::READ_EVENTS_XFER_SIZE] =
            self.read_events.out_bytes().try_into().unwrap_or([0; transfer::READ_EVENTS_XFER_SIZE]);
        hal.spi_transfer_non_blocking(&out, self.read_events.in_bytes_mut());
        Flow::Suspend
    }

    fn process_event_tx<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> Flow {
        if self.input_signal != PhyInput::DmaCmplt {
            self.signal_main = PhyOutput::Error;
            return Flow::Suspend;
        }

        self.cfg.cca_try_count = self.read_events.cca_try_count();
        let irq = self.read_events.irq();

        if irq.contains(IrqEvents::CCA_FAIL) {
            // Every CCA attempt failed; the frame never left.
            self.signal_main = PhyOutput::FrameSentNack;
            res.resolve(self.xlayer_main).frame.frame_outcome = FrameOutcome::Wait;
            self.enqueue_chain(Chain::Prepare);
            Flow::Continue
        } else if irq.rx_good_auto_reply() {
            res.resolve(self.xlayer_main).frame.frame_outcome = FrameOutcome::SentAck;
            if let Some(auto) = self.xlayer_auto {
                res.resolve(auto).frame.frame_outcome = FrameOutcome::Received;
            }
            self.handle_good_auto_reply(hal)
        } else if irq.rx_lost() {
            res.resolve(self.xlayer_main).frame.frame_outcome = FrameOutcome::SentAckLost;
            if let Some(auto) = self.xlayer_auto {
                res.resolve(auto).frame.frame_outcome = FrameOutcome::Lost;
            }
            self.signal_main = PhyOutput::FrameSentNack;
            self.signal_auto = PhyOutput::FrameMissed;
            self.enqueue_chain(Chain::Prepare);
            Flow::Continue
        } else if irq.rx_rejected_auto_reply() {
            res.resolve(self.xlayer_main).frame.frame_outcome = FrameOutcome::SentAckRejected;
            if let Some(auto) = self.xlayer_auto {
                res.resolve(auto).frame.frame_outcome = FrameOutcome::Rejected;
            }
            self.signal_main = PhyOutput::FrameSentNack;
            self.signal_auto = PhyOutput::FrameMissed;
            self.enqueue_chain(Chain::Prepare);
            Flow::Continue
        } else if irq.tx_complete() {
            // Sent without any acknowledge expected: no confirmation.
            self.signal_main = PhyOutput::FrameSentNack;
            self.signal_auto = PhyOutput::FrameMissed;
            res.resolve(self.xlayer_main).frame.frame_outcome = FrameOutcome::SentAckLost;
            if let Some(auto) = self.xlayer_auto {
                res.resolve(auto).frame.frame_outcome = FrameOutcome::Lost;
            }
            self.enqueue_chain(Chain::Prepare);
            Flow::Continue
        } else if irq.contains(IrqEvents::WAKEUP) {
            self.signal_main = PhyOutput::FrameSentNack;
            self.signal_auto = PhyOutput::FrameMissed;
            res.resolve(self.xlayer_main).frame.frame_outcome = FrameOutcome::Wait;
            if let Some(auto) = self.xlayer_auto {
                res.resolve(auto).frame.frame_outcome = FrameOutcome::Lost;
            }
            self.enqueue_chain(Chain::Prepare);
            Flow::Continue
        } else {
            self.signal_main = PhyOutput::Error;
            Flow::Suspend
        }
    }

    fn process_event_rx<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> Flow {
        if self.input_signal != PhyInput::DmaCmplt {
            self.signal_main = PhyOutput::Error;
            return Flow::Suspend;
        }

        let irq = self.read_events.irq();

        if irq.rx_good() {
            if let Some(auto) = self.xlayer_auto {
                res.resolve(auto).frame.frame_outcome = FrameOutcome::SentAck;
            }
            res.resolve(self.xlayer_main).frame.frame_outcome = FrameOutcome::Received;
            self.handle_good_frame(hal, res)
        } else if irq.rx_lost() {
            // When a timeout races the receiver still being armed, clear
            // the pending IRQs and wait for RX to actually turn off; the
            // interrupts get re-enabled further down the chain.
            if self.read_events.pwr_status().contains(PowerState::RX_EN) {
                hal.disable_radio_irq();
                let mut budget = POWER_STATE_POLL_BUDGET;
                while PowerState::from_bits_truncate(read_reg8(hal, regs::REG8_POWER_STATE))
                    .contains(PowerState::RX_EN)
                {
                    budget -= 1;
                    if budget == 0 {
                        break;
                    }
                }
            }
            if let Some(auto) = self.xlayer_auto {
                res.resolve(auto).frame.frame_outcome = FrameOutcome::SentAckLost;
            }
            res.resolve(self.xlayer_main).frame.frame_outcome = FrameOutcome::Lost;
            self.signal_auto = if self.xlayer_auto.is_some() {
                PhyOutput::FrameNotSent
            } else {
                PhyOutput::FrameSentNack
            };
            self.signal_main = PhyOutput::FrameMissed;
            self.enqueue_chain(Chain::Prepare);
            Flow::Continue
        } else if irq.rx_rejected() {
            if let Some(auto) = self.xlayer_auto {
                res.resolve(auto).frame.frame_outcome = FrameOutcome::SentAckRejected;
            }
            res.resolve(self.xlayer_main).frame.frame_outcome = FrameOutcome::Rejected;
            self.signal_auto = if self.xlayer_auto.is_some() {
                PhyOutput::FrameNotSent
            } else {
                PhyOutput::FrameSentNack
            };
            self.signal_main = PhyOutput::FrameMissed;
            self.enqueue_chain(Chain::Prepare);
            Flow::Continue
        } else {
            self.signal_main = PhyOutput::Error;
            Flow::Suspend
        }
    }

    /// Good main frame: pull the retry header, then the reception info.
    fn handle_good_frame<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> Flow {
        self.signal_main = PhyOutput::Yield;

        if let Some(auto) = self.xlayer_auto {
            let auto_is_tx = self.auto_is_tx(res, auto);
            let irq = self.read_events.irq();
            if auto_is_tx && !irq.contains(IrqEvents::BROADCAST) {
                self.wait_for_ack_tx = true;
                if !irq.tx_complete_auto_reply() {
                    // Wait for the auto-reply to finish transmitting.
                    write_reg16(hal, regs::REG16_IRQ, IrqEvents::AUTO_TX_END.bits());
                    hal.disable_radio_irq();
                } else {
                    self.wait_for_ack_tx = false;
                }
                self.signal_auto = PhyOutput::FrameSentNack;
            }
        }

        let retry_hdr = read_reg8(hal, regs::REG8_FIFOS);
        self.cfg.rx_cca_retry_count = retry_hdr & regs::RETRYHDR_CCA_MASK;
        self.cfg.rx_seq_num = retry_hdr & regs::RETRYHDR_SEQ != 0;

        hal.reset_cs();
        let out: [u8; transfer::READ_INFO_XFER_SIZE] =
            self.read_info.out_bytes().try_into().unwrap_or([0; transfer::READ_INFO_XFER_SIZE]);
        hal.spi_transfer_non_blocking(&out, self.read_info.in_bytes_mut());
        self.enqueue_chain(Chain::GetFrameHeader);
        Flow::Suspend
    }

    /// Good acknowledge: pull the reception info of the auto-reply.
    fn handle_good_auto_reply<H: WpsHal>(&mut self, hal: &mut H) -> Flow {
        self.signal_main = PhyOutput::Yield;
        hal.reset_cs();
        let out: [u8; transfer::READ_INFO_XFER_SIZE] =
            self.read_info.out_bytes().try_into().unwrap_or([0; transfer::READ_INFO_XFER_SIZE]);
        hal.spi_transfer_non_blocking(&out, self.read_info.in_bytes_mut());
        self.enqueue_chain(Chain::GetAutoReplyHeader);
        Flow::Suspend
    }

    fn get_frame_header<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> Flow {
        if self.input_signal != PhyInput::DmaCmplt {
            self.signal_main = PhyOutput::Error;
            return Flow::Suspend;
        }

        let expected_frame_size =
            self.cfg.expected_header_size + self.cfg.expected_payload_size + HDR_SIZE_SIZE;

        self.cfg.rx_wait_time = self.read_info.rx_wait_time();
        self.cfg.rssi_raw = self.read_info.rssi_raw();
        self.cfg.rnsi_raw = self.read_info.rnsi_raw();
        if self.cfg.phases_enabled {
            self.cfg.phases_info = Some(self.read_info.phases());
        }

        let frame_size = self.read_info.frame_size();
        if frame_size == 0 || frame_size > expected_frame_size {
            let main = res.resolve(self.xlayer_main);
            main.frame.payload_end = main.frame.header_begin;
            self.signal_auto = PhyOutput::FrameSentNack;
            self.signal_main = PhyOutput::FrameMissed;
            self.enqueue_chain(Chain::Prepare);
            return Flow::Continue;
        }

        self.rx_frame_size = frame_size - HDR_SIZE_SIZE;
        self.rx_header_size = self.read_info.header_size();
        if self.rx_header_size > self.cfg.expected_header_size {
            let main = res.resolve(self.xlayer_main);
            main.frame.payload_end = main.frame.header_begin;
            self.signal_auto = PhyOutput::FrameSentNack;
            self.signal_main = PhyOutput::FrameMissed;
            self.enqueue_chain(Chain::Prepare);
            return Flow::Continue;
        }

        self.signal_main = PhyOutput::Yield;

        let (header_dst, dst_len) = {
            let main = res.resolve(self.xlayer_main);
            main.frame.header_begin = main.frame.header_memory;
            main.frame.payload_end = main
                .frame
                .header_memory
                .add(u16::from(self.rx_header_size) + u16::from(HDR_SIZE_SIZE));
            (
                main.frame.header_memory,
                u16::from(self.rx_header_size) + u16::from(HDR_SIZE_SIZE),
            )
        };

        self.spi_dummy[0] = regs::REG_READ_BURST | regs::REG8_FIFOS;
        let dst = res.slice_mut(header_dst, dst_len);
        hal.reset_cs();
        hal.spi_transfer_non_blocking(&self.spi_dummy[..dst.len()], dst);

        self.enqueue_chain(Chain::GetPayload);
        self.enqueue_chain(Chain::Prepare);
        Flow::Suspend
    }

    fn get_auto_reply_header<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> Flow {
        if self.input_signal != PhyInput::DmaCmplt {
            self.signal_main = PhyOutput::Error;
            return Flow::Suspend;
        }

        self.cfg.rssi_raw = self.read_info.rssi_raw();
        self.cfg.rnsi_raw = self.read_info.rnsi_raw();
        if self.cfg.phases_enabled {
            self.cfg.phases_info = Some(self.read_info.phases());
        }

        let frame_size = self.read_info.frame_size();
        if frame_size == 0 {
            // Header-only acknowledge generated by the radio itself.
            self.signal_main = PhyOutput::FrameSentAck;
            self.signal_auto = PhyOutput::FrameMissed;
            self.enqueue_chain(Chain::Prepare);
            return Flow::Continue;
        }

        let Some(auto_ref) = self.xlayer_auto else {
            self.signal_main = PhyOutput::FrameSentAck;
            self.signal_auto = PhyOutput::FrameMissed;
            self.enqueue_chain(Chain::Prepare);
            return Flow::Continue;
        };

        self.rx_frame_size = frame_size - HDR_SIZE_SIZE;
        self.rx_header_size = self.read_info.header_size();
        self.signal_main = PhyOutput::Yield;

        let (header_dst, dst_len) = {
            let auto = res.resolve(auto_ref);
            auto.frame.header_begin = auto.frame.header_memory;
            auto.frame.payload_end = auto
                .frame
                .header_memory
                .add(u16::from(self.rx_header_size) + u16::from(HDR_SIZE_SIZE));
            (
                auto.frame.header_memory,
                u16::from(self.rx_header_size) + u16::from(HDR_SIZE_SIZE),
            )
        };

        self.spi_dummy[0] = regs::REG_READ_BURST | regs::REG8_FIFOS;
        let dst = res.slice_mut(header_dst, dst_len);
        hal.reset_cs();
        hal.spi_transfer_non_blocking(&self.spi_dummy[..dst.len()], dst);

        self.enqueue_chain(Chain::GetPayload);
        self.enqueue_chain(Chain::Prepare);
        Flow::Suspend
    }

    fn get_payload<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) -> Flow {
        if self.input_signal != PhyInput::DmaCmplt {
            self.signal_main = PhyOutput::Error;
            return Flow::Suspend;
        }

        let payload_size = self.rx_frame_size.saturating_sub(self.rx_header_size);
        let main_is_tx = self.main_is_tx(res);
        let frame_ref = if main_is_tx { self.xlayer_auto.unwrap_or(self.xlayer_main) } else { self.xlayer_main };

        if main_is_tx {
            self.signal_auto = PhyOutput::FrameReceived;
        } else {
            self.signal_main = PhyOutput::FrameReceived;
        }

        // Let the MAC route the frame to its connection and hand out
        // payload storage from the right arena.
        let (header_mem, header_size) = {
            let frame = &res.resolve(frame_ref).frame;
            (frame.header_memory, self.rx_header_size)
        };
        {
            let mut header = [0u8; crate::config::HEADER_MAX_SIZE];
            let n = usize::from(header_size).min(header.len());
            let src = res.slice(header_mem.add(1), n as u16);
            let n = n.min(src.len());
            header[..n].copy_from_slice(&src[..n]);
            res.mac.route_received_frame(!main_is_tx, &header[..n]);
        }
        res.alloc_rx_payload(frame_ref, payload_size);

        let (payload_begin, ok) = {
            let frame = &res.resolve(frame_ref).frame;
            (frame.payload_begin, !frame.payload_begin.is_null())
        };

        if payload_size == 0 {
            hal.set_cs();
        } else if ok {
            {
                let frame = &mut res.resolve(frame_ref).frame;
                frame.payload_end = payload_begin.add(u16::from(payload_size));
            }
            self.spi_dummy[0] = 0;
            let dst = res.slice_mut(payload_begin, u16::from(payload_size));
            hal.spi_transfer_non_blocking(&self.spi_dummy[..dst.len()], dst);
            self.enqueue_chain(Chain::NewFrame);
        } else {
            // Another connection of the slot owns the node and no space
            // is left; the bytes stay in the radio FIFO.
            hal.set_cs();
        }

        if let Some(auto) = self.xlayer_auto {
            if self.auto_is_tx(res, auto) && self.wait_for_ack_tx {
                self.enqueue_chain(Chain::WaitToSendAutoReply);
            } else if main_is_tx {
                self.signal_main = PhyOutput::FrameSentAck;
            }
        }
        Flow::Continue
    }

    fn transfer_register<H: WpsHal>(&mut self, hal: &mut H) -> Flow {
        if let Some(request) = self.write_request.take() {
            while hal.is_spi_busy() {}
            hal.set_cs();
            write_reg16(hal, request.reg | regs::REG_WRITE, request.value);
        } else if let Some(reg) = self.read_request.take() {
            while hal.is_spi_busy() {}
            hal.set_cs();
            self.read_result = Some(read_reg16(hal, reg));
        }
        self.signal_main = PhyOutput::BlockingConfigDone;
        Flow::Continue
    }

    fn overwrite_registers<H: WpsHal>(&mut self, hal: &mut H) -> Flow {
        hal.set_cs();
        for i in 0..self.overwrite_regs.len() {
            let request = self.overwrite_regs[i];
            write_reg16(hal, request.reg | regs::REG_WRITE, request.value);
        }
        Flow::Continue
    }

    /// Configure non-stop RX on the sync channel; used before the first
    /// sync acquisition.
    fn prepare_syncing<H: WpsHal>(&mut self, hal: &mut H, res: &mut PhyRes) {
        let source = res.resolve(self.xlayer_main).frame.source_address;

        self.cfg.sleep_level = SleepLvl::Idle;

        write_reg16(
            hal,
            regs::REG16_RX_TX_SIZEREG,
            regs::rx_tx_size(0, RADIO_MAX_PACKET_SIZE as u8 - 1),
        );
        write_reg16(hal, regs::REG16_TXADDRESS, source);
        write_reg16(hal, regs::REG16_RXADDRESS, self.local_address);
        write_reg16(hal, regs::REG16_CCA_THRES_GAIN, regs::cca_threshold(0));

        let mut autoreply_settings = 0;
        if self.cfg.expect_ack {
            autoreply_settings = regs::EXPECT_REPLY;
            write_reg16(hal, regs::REG16_FRAMEPROC_PHASEDATA, regs::RX_MODE | regs::REPLY_TX_EN);
        } else {
            write_reg16(hal, regs::REG16_FRAMEPROC_PHASEDATA, regs::RX_MODE);
        }

        write_reg16(
            hal,
            regs::REG16_PHY_0_1,
            self.cfg.channel.frame_cfg_bits | autoreply_settings,
        );

        write_reg16(hal, regs::REG16_IRQ, IrqEvents::RX_END.bits());

        write_reg16(
            hal,
            regs::REG16_TIMERCFG_SLEEPCFG,
            sleep_depth_bits(SleepLvl::IdleNoWakeonce)
                | regs::AUTOWAKE
                | regs::SLPTIMEO
                | regs::SLPTXEND
                | regs::SLPRXEND
                | regs::SYNRXSTA,
        );

        // Longest idle sleep and timeout: the radio restarts RX on its own
        // until a frame lands.
        write_reg16(
            hal,
            regs::REG16_SLPPERIOD_PWRUPDLAY,
            (regs::power_up_delay_raw(self.cfg.power_up_delay) << 8) | 0x00FF,
        );
        write_reg16(hal, regs::REG16_SLPPERIOD_15_0, FAST_SYNC_IDLE_SLEEP_VAL as u16);
        write_reg16(hal, regs::REG16_TIMELIMIT_BIASDELAY, regs::timeout_raw(FAST_SYNC_IDLE_TIMEOUT_VAL));

        write_reg8(
            hal,
            regs::REG8_ACTIONS,
            (Actions::FLUSH_TX | Actions::FLUSH_RX | Actions::SLEEP).bits(),
        );

        write_reg16(hal, regs::REG16_RF_GAIN_MANUGAIN, regs::MANUGAIN_DEFAULT);

        let pattern = self.cfg.channel.reg_pattern;
        write_reg16(hal, regs::REG16_IF_BASEBAND_GAIN_LNA, pattern.if_baseband_gain_lna);
        write_reg16(hal, regs::REG16_RXBANDFRE_CFG1FREQ, pattern.rxbandfre_cfg1freq);
        write_reg16(hal, regs::REG16_CFG2FREQ_CFG3FREQ, pattern.cfg2freq_cfg3freq);
        write_reg16(hal, regs::REG16_CFG_WIDTHS_TXPWR_RANDPULSE, pattern.cfg_widths_txpwr_randpulse);
        write_reg16(hal, regs::REG16_TX_PULSE_POS, pattern.tx_pulse_pos);

        hal.enable_radio_irq();
    }

    fn set_events_for_tx_with_ack(&mut self) {
        self.radio_cfg
            .set_irq_enable(IrqEvents::AUTO_RX_END | IrqEvents::TIMEOUT | IrqEvents::CCA_FAIL);
    }

    fn set_events_for_tx_without_ack(&mut self) {
        self.radio_cfg.set_irq_enable(IrqEvents::TX_END | IrqEvents::CCA_FAIL);
    }

    fn set_events_for_rx(&mut self) {
        self.radio_cfg.set_irq_enable(IrqEvents::RX_END | IrqEvents::TIMEOUT);
    }

    fn set_events_for_wakeup_only(&mut self) {
        self.radio_cfg.set_irq_enable(IrqEvents::WAKEUP);
    }

    fn set_events_for_empty_tx(&mut self) {
        // Mute the transfer: no spectral content, only the TX end event.
        self.radio_cfg.set_channel(&RfChannelPattern::default());
        self.radio_cfg.set_irq_enable(IrqEvents::TX_END);
    }

    fn main_is_tx(&self, res: &mut PhyRes) -> bool {
        res.resolve(self.xlayer_main).frame.destination_address != self.local_address
    }

    fn auto_is_tx(&self, res: &mut PhyRes, auto: XlayerRef) -> bool {
        res.resolve(auto).frame.destination_address != self.local_address
    }
}

/// Sleep depth bits of a sleep level.
fn sleep_depth_bits(lvl: SleepLvl) -> u16 {
    match lvl {
        SleepLvl::Idle | SleepLvl::IdleNoWakeonce => 0b00,
        SleepLvl::Shallow => 0b01,
        SleepLvl::Deep => 0b10,
    }
}

/// Blocking 8-bit register write.
pub fn write_reg8<H: WpsHal>(hal: &mut H, reg: u8, value: u8) {
    let tx = [reg | regs::REG_WRITE, value];
    let mut rx = [0u8; 2];
    while hal.is_spi_busy() {}
    hal.set_cs();
    hal.reset_cs();
    hal.spi_transfer_blocking(&tx, &mut rx);
    hal.set_cs();
}

/// Blocking 16-bit register write.
pub fn write_reg16<H: WpsHal>(hal: &mut H, reg: u8, value: u16) {
    let bytes = value.to_le_bytes();
    let tx = [reg | regs::REG_WRITE, bytes[0], bytes[1]];
    let mut rx = [0u8; 3];
    while hal.is_spi_busy() {}
    hal.set_cs();
    hal.reset_cs();
    hal.spi_transfer_blocking(&tx, &mut rx);
    hal.set_cs();
}

/// Blocking 8-bit register read.
pub fn read_reg8<H: WpsHal>(hal: &mut H, reg: u8) -> u8 {
    let tx = [reg & !regs::REG_WRITE, 0];
    let mut rx = [0u8; 2];
    while hal.is_spi_busy() {}
    hal.set_cs();
    hal.reset_cs();
    hal.spi_transfer_blocking(&tx, &mut rx);
    hal.set_cs();
    rx[1]
}

/// Blocking 16-bit register read.
pub fn read_reg16<H: WpsHal>(hal: &mut H, reg: u8) -> u16 {
    let tx = [reg & !regs::REG_WRITE, 0, 0];
    let mut rx = [0u8; 3];
    while hal.is_spi_busy() {}
    hal.set_cs();
    hal.reset_cs();
    hal.spi_transfer_blocking(&tx, &mut rx);
    hal.set_cs();
    u16::from_le_bytes([rx[1], rx[2]])
}

impl<'r, 'm> PhyRes<'r, 'm> {
    /// Resolve a frame descriptor reference.
    pub fn resolve(&mut self, r: XlayerRef) -> &mut crate::xlayer::Xlayer {
        match r {
            XlayerRef::TxNode(idx) => &mut self.tx_pool.node_mut(idx).xlayer,
            XlayerRef::RxNode(idx) => &mut self.rx_pool.node_mut(idx).xlayer,
            XlayerRef::EmptyTx => &mut self.mac.empty_frame_tx,
            XlayerRef::EmptyRx => &mut self.mac.empty_frame_rx,
            XlayerRef::EmptyAutoReply => &mut self.mac.empty_auto_reply_frame,
        }
    }

    /// Resolve a byte range for reading.
    pub fn slice(&mut self, ptr: BufPtr, len: u16) -> &[u8] {
        self.slice_mut(ptr, len)
    }

    /// Resolve a byte range for writing.
    pub fn slice_mut(&mut self, ptr: BufPtr, len: u16) -> &mut [u8] {
        let offset = usize::from(ptr.offset);
        let len = usize::from(len);
        match ptr.kind {
            BufKind::NodeHeader(idx) => {
                let block = self.rx_pool.header_block(idx);
                let end = (offset + len).min(block.len());
                &mut block[offset.min(end)..end]
            }
            BufKind::TxArena => self.tx_data.slice(ptr.offset, len as u16),
            BufKind::RxArena => self.rx_data.slice(ptr.offset, len as u16),
            BufKind::Scratch => {
                let end = (offset + len).min(self.mac.scratch_buffer.len());
                &mut self.mac.scratch_buffer[offset.min(end)..end]
            }
            BufKind::AutoReply => {
                let end = (offset + len).min(self.mac.auto_reply_buffer.len());
                &mut self.mac.auto_reply_buffer[offset.min(end)..end]
            }
            BufKind::None => &mut [],
        }
    }

    /// Hand the frame payload storage from the RX arena.
    fn alloc_rx_payload(&mut self, frame_ref: XlayerRef, required: u8) {
        let is_node = matches!(frame_ref, XlayerRef::RxNode(_));
        if !is_node || required == 0 {
            return;
        }
        let max = self.mac.rx_alloc_size();
        if required > max {
            let frame = &mut self.resolve(frame_ref).frame;
            frame.payload_memory = BufPtr::NULL;
            frame.payload_begin = BufPtr::NULL;
            return;
        }
        // Reserve the full connection payload size so later frames can
        // always reuse the block.
        let required = max;
        let allocated = self.rx_data.allocate(u16::from(required));
        let frame = &mut self.resolve(frame_ref).frame;
        match allocated {
            Some(offset) => {
                let ptr = BufPtr::new(BufKind::RxArena, offset);
                frame.payload_memory = ptr;
                frame.payload_begin = ptr;
                frame.max_frame_size = u16::from(required);
            }
            None => {
                frame.payload_memory = BufPtr::NULL;
                frame.payload_begin = BufPtr::NULL;
            }
        }
    }
}
