//! # Radio register map
//!
//! Opaque register addresses and bit assignments of the UWB transceiver.
//! The spectral content of the channel registers comes from the
//! calibration blob and is never interpreted here; only the control and
//! event registers have modeled semantics.
//!
//! The register interface is little-endian: the low byte of a 16-bit
//! register is clocked first.

use bitflags::bitflags;

/// Write flag OR-ed into an address byte.
pub const REG_WRITE: u8 = 0x80;
/// Burst flag OR-ed into an address byte; the transfer auto-increments.
pub const REG_BURST: u8 = 0x40;
/// Burst write to consecutive registers or the FIFO.
pub const REG_WRITE_BURST: u8 = REG_WRITE | REG_BURST;
/// Burst read from consecutive registers or the FIFO.
pub const REG_READ_BURST: u8 = REG_BURST;

/* 8-bit registers */
/// One-shot action strobes.
pub const REG8_ACTIONS: u8 = 0x00;
/// Radio power state, read only.
pub const REG8_POWER_STATE: u8 = 0x01;
/// TX/RX FIFO window.
pub const REG8_FIFOS: u8 = 0x02;

/* 16-bit registers */
/// IRQ enables on write, latched flags on read (read clears).
pub const REG16_IRQ: u8 = 0x04;
/// Secondary IRQ timing controls.
pub const REG16_IRQTIME: u8 = 0x05;
/// Timer configuration and sleep depth.
pub const REG16_TIMERCFG_SLEEPCFG: u8 = 0x06;
/// Sleep period bits 15:0.
pub const REG16_SLPPERIOD_15_0: u8 = 0x07;
/// Sleep period bits 23:16 plus power-up delay.
pub const REG16_SLPPERIOD_PWRUPDLAY: u8 = 0x08;
/// RX timeout and bias delay.
pub const REG16_TIMELIMIT_BIASDELAY: u8 = 0x09;
/// TX and RX packet sizes.
pub const REG16_RX_TX_SIZEREG: u8 = 0x0A;
/// Local address match register.
pub const REG16_RXADDRESS: u8 = 0x0B;
/// Destination address register.
pub const REG16_TXADDRESS: u8 = 0x0C;
/// Modulation, FEC, chip repetition and auto-reply expectations.
pub const REG16_PHY_0_1: u8 = 0x0D;
/// Frame processing mode and phase data capture.
pub const REG16_FRAMEPROC_PHASEDATA: u8 = 0x0E;
/// Retry header byte latched into the next TX frame.
pub const REG16_RETRYHDR: u8 = 0x0F;
/// CCA interval, retries and on-time.
pub const REG16_CCA_SETTINGS: u8 = 0x10;
/// CCA threshold and gain.
pub const REG16_CCA_THRES_GAIN: u8 = 0x11;
/// IF and baseband gain, LNA setting (calibration value).
pub const REG16_IF_BASEBAND_GAIN_LNA: u8 = 0x12;
/// RX band frequency configuration (calibration value).
pub const REG16_RXBANDFRE_CFG1FREQ: u8 = 0x13;
/// Frequency configuration words 2 and 3 (calibration value).
pub const REG16_CFG2FREQ_CFG3FREQ: u8 = 0x14;
/// Pulse widths, TX power and pulse randomization (calibration value).
pub const REG16_CFG_WIDTHS_TXPWR_RANDPULSE: u8 = 0x15;
/// TX pulse positions (calibration value).
pub const REG16_TX_PULSE_POS: u8 = 0x16;
/// Manual RF gain override.
pub const REG16_RF_GAIN_MANUGAIN: u8 = 0x17;
/// RX wait time before syncword lock.
pub const REG16_RXTIME: u8 = 0x18;
/// RSSI and RNSI of the last reception.
pub const REG16_RSSI_RNSI: u8 = 0x19;
/// Ranging phase samples 1 and 2.
pub const REG16_PHASE_1_2: u8 = 0x1A;
/// Ranging phase samples 3 and 4.
pub const REG16_PHASE_3_4: u8 = 0x1B;
/// Packet save-to-buffer configuration.
pub const REG16_FRAMECFG_SAVETOBUF: u8 = 0x1C;
/// Preamble length and syncword length.
pub const REG16_PREAMB_SWLEN: u8 = 0x1D;
/// Undocumented startup sequence register.
pub const REG16_PRELUDE: u8 = 0x1E;
/// Syncword bits 15:0.
pub const REG16_SYNCWORD_15_0: u8 = 0x30;
/// Syncword bits 31:16.
pub const REG16_SYNCWORD_31_16: u8 = 0x31;
/// CRC polynomial bits 15:1.
pub const REG16_CRC_15_1: u8 = 0x32;
/// CRC polynomial bits 30:16.
pub const REG16_CRC_30_16: u8 = 0x33;

/// Recommended value of [`REG16_PRELUDE`].
pub const PRELUDE_OPT: u16 = 0x5AA5;
/// Packet save configuration baseline: save size and retry header bytes.
pub const DEFAULT_PACKET_CONFIGURATION: u16 = 0x0003;
/// Save the CRC status into the buffer; required for sleep-on-timeout.
pub const SAVECRC: u16 = 0x0010;
/// Save phase data into the buffer.
pub const SAVEPHS: u16 = 0x0020;
/// Default manual gain configuration.
pub const MANUGAIN_DEFAULT: u16 = 0x0100;

bitflags! {
    /// Action strobes of [`REG8_ACTIONS`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Actions: u8 {
        const FLUSH_TX = 0x01;
        const FLUSH_RX = 0x02;
        const START_TX = 0x04;
        const INIT_TIMER = 0x08;
        const SLEEP = 0x10;
    }
}

/// CCA try counter reported in the low nibble of the actions readback.
pub const ACTIONS_TXRETRIES_MASK: u8 = 0x0F;

bitflags! {
    /// IRQ enables (write) and latched flags (read) of [`REG16_IRQ`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct IrqEvents: u16 {
        const RX_END = 0x0001;
        const TX_END = 0x0002;
        const TIMEOUT = 0x0004;
        const CCA_FAIL = 0x0008;
        const AUTO_RX_END = 0x0010;
        const AUTO_TX_END = 0x0020;
        const WAKEUP = 0x0040;
        const CRC_PASS = 0x0080;
        const ADDR_MATCH = 0x0100;
        const BROADCAST = 0x0200;
        const TX_UNDERFLOW = 0x0400;
        const NEW_PACKET = 0x0800;
    }
}

impl IrqEvents {
    /// Transmission finished without a reception or timeout racing it.
    pub fn tx_complete(self) -> bool {
        (self.contains(Self::TX_END) && !self.contains(Self::RX_END) && !self.contains(Self::TIMEOUT))
            || self.contains(Self::TX_UNDERFLOW)
    }

    /// Auto-reply transmission finished. `NEW_PACKET` fires during the
    /// reception itself, so only the TX end flag matters here.
    pub fn tx_complete_auto_reply(self) -> bool {
        (self.contains(Self::TX_END) && !self.contains(Self::TIMEOUT))
            || self.contains(Self::TX_UNDERFLOW)
    }

    /// A frame for us passed CRC.
    pub fn rx_good(self) -> bool {
        self.contains(Self::RX_END)
            && self.contains(Self::CRC_PASS)
            && (self.contains(Self::ADDR_MATCH) || self.contains(Self::BROADCAST))
    }

    /// An auto-reply for us passed CRC.
    pub fn rx_good_auto_reply(self) -> bool {
        self.contains(Self::AUTO_RX_END)
            && self.contains(Self::CRC_PASS)
            && (self.contains(Self::ADDR_MATCH) || self.contains(Self::BROADCAST))
    }

    /// A frame ended but failed CRC or address match.
    pub fn rx_rejected(self) -> bool {
        self.contains(Self::RX_END)
            && (!self.contains(Self::CRC_PASS)
                || !(self.contains(Self::ADDR_MATCH) || self.contains(Self::BROADCAST)))
    }

    /// An auto-reply ended but failed CRC or address match.
    pub fn rx_rejected_auto_reply(self) -> bool {
        self.contains(Self::AUTO_RX_END)
            && (!self.contains(Self::CRC_PASS)
                || !(self.contains(Self::ADDR_MATCH) || self.contains(Self::BROADCAST)))
    }

    /// The listening window elapsed without a frame.
    pub fn rx_lost(self) -> bool {
        self.contains(Self::TIMEOUT) && !self.contains(Self::RX_END)
    }
}

bitflags! {
    /// Power state byte of [`REG8_POWER_STATE`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PowerState: u8 {
        const AWAKE = 0x01;
        const RX_EN = 0x02;
        const TX_EN = 0x04;
        const PROC_ON = 0x08;
    }
}

/* REG16_TIMERCFG_SLEEPCFG fields */
/// Sleep depth field mask (low two bits).
pub const SLPDEPTH_MASK: u16 = 0x0003;
/// Wake-once shallow depth used to fire a one-shot TX.
pub const SLPDEPTH_WAKEONCE: u16 = 0x0001;
/// Go to sleep on timeout.
pub const SLPTIMEO: u16 = 0x0004;
/// Go to sleep on TX end.
pub const SLPTXEND: u16 = 0x0008;
/// Go to sleep on RX end.
pub const SLPRXEND: u16 = 0x0010;
/// Wake autonomously at the end of the sleep period.
pub const AUTOWAKE: u16 = 0x0020;
/// Resynchronize the wake timer on wake up.
pub const SYNWAKUP: u16 = 0x0040;
/// Start RX immediately on wake.
pub const SYNRXSTA: u16 = 0x0080;

/// Disable the FIFO-busy interrupt; it can misfire while the TX FIFO is
/// written as the transmitter wakes.
pub const IRQTIME_DISABUFI: u16 = 0x0001;

/* REG16_PHY_0_1 fields */
/// Expect an auto-reply after this frame.
pub const EXPECT_REPLY: u16 = 0x0001;
/// Address the auto-reply with the received source address.
pub const REPLY_ADDR_RX: u16 = 0x0002;
/// Receive mode.
pub const RX_MODE: u16 = 0x0004;
/// Enable auto-reply transmission after a good reception.
pub const REPLY_TX_EN: u16 = 0x0008;

/* REG16_CCA_SETTINGS fields */
/// Keep receiving the packet that tripped the energy detector.
pub const CCA_IGNORE_PKT: u16 = 0x0010;
/// Transmit anyway once every CCA attempt failed.
pub const CCA_TX_ANYWAY: u16 = 0x0020;

/// Retry header: sequence bit carried to the peer.
pub const RETRYHDR_SEQ: u8 = 0x80;
/// Retry header: CCA attempt count of the transmitter.
pub const RETRYHDR_CCA_MASK: u8 = 0x0F;

/// Compose the CCA settings register.
pub fn cca_settings(retry_interval_raw: u16, max_retry: u8, on_time: u8, tx_anyway: bool) -> u16 {
    let mut value = ((retry_interval_raw & 0x3F) << 10)
        | (u16::from(max_retry & 0x0F) << 6)
        | CCA_IGNORE_PKT
        | (u16::from(on_time & 0x03) << 2);
    if tx_anyway {
        value |= CCA_TX_ANYWAY;
    }
    value
}

/// Compose the CCA threshold register; gain bits stay zero.
pub fn cca_threshold(threshold: u8) -> u16 {
    u16::from(threshold) << 8
}

/// Compose the packet size register.
pub fn rx_tx_size(tx_size: u8, rx_size: u8) -> u16 {
    (u16::from(tx_size) << 8) | u16::from(rx_size)
}

/// Scale a CCA retry interval from PLL cycles to the register step.
pub fn cca_interval_raw(pll_cycles: u16) -> u16 {
    pll_cycles >> 4
}

/// Scale an RX timeout from PLL cycles to the register step.
pub fn timeout_raw(pll_cycles: u16) -> u16 {
    pll_cycles >> 3
}

/// Scale a power-up delay from PLL cycles to the register step.
pub fn power_up_delay_raw(pll_cycles: u16) -> u16 {
    (pll_cycles >> 4) & 0x00FF
}

/// Spectral register pattern of one RF channel, produced by calibration
/// and consumed verbatim.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RfChannelPattern {
    pub if_baseband_gain_lna: u16,
    pub rxbandfre_cfg1freq: u16,
    pub cfg2freq_cfg3freq: u16,
    pub cfg_widths_txpwr_randpulse: u16,
    pub tx_pulse_pos: u16,
}

/// RF channel description: the spectral pattern plus the opaque frame
/// configuration bits (modulation, FEC, chip repetition).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RfChannel {
    pub reg_pattern: RfChannelPattern,
    /// Opaque modulation / FEC / chip repetition bits OR-ed into PHY_0_1.
    pub frame_cfg_bits: u16,
}
