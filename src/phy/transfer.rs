//! # SPI transaction images
//!
//! Pre-composed byte images of the DMA bursts the PHY exchanges with the
//! radio each timeslot. Every image is a fixed byte array with the
//! register address bytes baked in at construction; the typed setters and
//! accessors only touch the value positions. Sizes are asserted at
//! compile time since the DMA engine moves the raw bytes.

use super::regs::{self, IrqEvents, PowerState};
use crate::config::{HEADER_MAX_SIZE, SPI_BURST_PREFIX_SIZE};
use crate::link::phase::PhaseInfo;

/// One byte of address, one byte echoed back per value byte.
const REG8_WRITE_LEN: usize = 2;
const REG16_WRITE_LEN: usize = 3;
const REG8_READ_LEN: usize = 2;
const REG16_READ_LEN: usize = 3;

/* Radio configuration burst */

const CFG_ACTIONS: usize = 0;
const CFG_RX_ADDRESS: usize = CFG_ACTIONS + REG8_WRITE_LEN;
const CFG_TX_ADDRESS: usize = CFG_RX_ADDRESS + REG16_WRITE_LEN;
const CFG_RX_TX_SIZE: usize = CFG_TX_ADDRESS + REG16_WRITE_LEN;
const CFG_PHY_0_1: usize = CFG_RX_TX_SIZE + REG16_WRITE_LEN;
const CFG_IRQ: usize = CFG_PHY_0_1 + REG16_WRITE_LEN;
const CFG_SLPPERIOD_15_0: usize = CFG_IRQ + REG16_WRITE_LEN;
const CFG_SLPPERIOD_PWRUP: usize = CFG_SLPPERIOD_15_0 + REG16_WRITE_LEN;
const CFG_TIMELIMIT: usize = CFG_SLPPERIOD_PWRUP + REG16_WRITE_LEN;
const CFG_FRAMEPROC: usize = CFG_TIMELIMIT + REG16_WRITE_LEN;
const CFG_RF_GAIN: usize = CFG_FRAMEPROC + REG16_WRITE_LEN;
const CFG_RETRYHDR: usize = CFG_RF_GAIN + REG16_WRITE_LEN;
/// Burst covering CCA settings, CCA threshold and the five spectral
/// registers, which sit at consecutive addresses.
const CFG_BURST: usize = CFG_RETRYHDR + REG16_WRITE_LEN;
const CFG_BURST_VALUES: usize = 7 * 2;
/// Total image size.
pub const RADIO_CFG_XFER_SIZE: usize = CFG_BURST + 1 + CFG_BURST_VALUES;

const _: () = assert!(RADIO_CFG_XFER_SIZE == 50);

/// Full radio configuration written in one DMA burst at the start of a
/// timeslot.
pub struct RadioCfgXfer {
    buf: [u8; RADIO_CFG_XFER_SIZE],
    /// Sleep configuration written through a dedicated register access
    /// right before the burst; see `PhyCore::set_config`.
    timercfg: u16,
}

impl Default for RadioCfgXfer {
    fn default() -> Self {
        let mut buf = [0u8; RADIO_CFG_XFER_SIZE];
        buf[CFG_ACTIONS] = regs::REG_WRITE | regs::REG8_ACTIONS;
        buf[CFG_RX_ADDRESS] = regs::REG_WRITE | regs::REG16_RXADDRESS;
        buf[CFG_TX_ADDRESS] = regs::REG_WRITE | regs::REG16_TXADDRESS;
        buf[CFG_RX_TX_SIZE] = regs::REG_WRITE | regs::REG16_RX_TX_SIZEREG;
        buf[CFG_PHY_0_1] = regs::REG_WRITE | regs::REG16_PHY_0_1;
        buf[CFG_IRQ] = regs::REG_WRITE | regs::REG16_IRQ;
        buf[CFG_SLPPERIOD_15_0] = regs::REG_WRITE | regs::REG16_SLPPERIOD_15_0;
        buf[CFG_SLPPERIOD_PWRUP] = regs::REG_WRITE | regs::REG16_SLPPERIOD_PWRUPDLAY;
        buf[CFG_TIMELIMIT] = regs::REG_WRITE | regs::REG16_TIMELIMIT_BIASDELAY;
        buf[CFG_FRAMEPROC] = regs::REG_WRITE | regs::REG16_FRAMEPROC_PHASEDATA;
        buf[CFG_RF_GAIN] = regs::REG_WRITE | regs::REG16_RF_GAIN_MANUGAIN;
        buf[CFG_RETRYHDR] = regs::REG_WRITE | regs::REG16_RETRYHDR;
        buf[CFG_BURST] = regs::REG_WRITE_BURST | regs::REG16_CCA_SETTINGS;
        Self { buf, timercfg: 0 }
    }
}

impl RadioCfgXfer {
    fn put16(&mut self, at: usize, value: u16) {
        self.buf[at + 1..at + 3].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_actions(&mut self, actions: regs::Actions) {
        self.buf[CFG_ACTIONS + 1] = actions.bits();
    }

    pub fn actions(&self) -> regs::Actions {
        regs::Actions::from_bits_truncate(self.buf[CFG_ACTIONS + 1])
    }

    pub fn or_actions(&mut self, actions: regs::Actions) {
        self.buf[CFG_ACTIONS + 1] |= actions.bits();
    }

    pub fn set_rx_address(&mut self, address: u16) {
        self.put16(CFG_RX_ADDRESS, address);
    }

    pub fn set_tx_address(&mut self, address: u16) {
        self.put16(CFG_TX_ADDRESS, address);
    }

    pub fn set_rx_tx_size(&mut self, tx_size: u8, rx_size: u8) {
        self.put16(CFG_RX_TX_SIZE, regs::rx_tx_size(tx_size, rx_size));
    }

    pub fn set_phy_0_1(&mut self, value: u16) {
        self.put16(CFG_PHY_0_1, value);
    }

    pub fn or_phy_0_1(&mut self, value: u16) {
        let current = u16::from_le_bytes([self.buf[CFG_PHY_0_1 + 1], self.buf[CFG_PHY_0_1 + 2]]);
        self.put16(CFG_PHY_0_1, current | value);
    }

    pub fn set_irq_enable(&mut self, events: IrqEvents) {
        self.put16(CFG_IRQ, events.bits());
    }

    pub fn set_sleep_period(&mut self, pll_cycles: u32, power_up_delay: u16) {
        self.put16(CFG_SLPPERIOD_15_0, pll_cycles as u16);
        self.put16(
            CFG_SLPPERIOD_PWRUP,
            ((pll_cycles >> 16) as u16 & 0x00FF) | (regs::power_up_delay_raw(power_up_delay) << 8),
        );
    }

    pub fn set_rx_timeout(&mut self, pll_cycles: u16) {
        self.put16(CFG_TIMELIMIT, regs::timeout_raw(pll_cycles));
    }

    pub fn set_frameproc(&mut self, value: u16) {
        self.put16(CFG_FRAMEPROC, value);
    }

    pub fn set_timercfg_sleepcfg(&mut self, value: u16) {
        // The sleep configuration travels outside the burst; keep the
        // value for the dedicated register write issued by `set_config`.
        self.timercfg = value;
    }

    pub fn set_rf_gain(&mut self, gain: u8) {
        self.put16(CFG_RF_GAIN, regs::MANUGAIN_DEFAULT | u16::from(gain));
    }

    pub fn set_retry_hdr(&mut self, seq_num: bool) {
        let value = if seq_num { u16::from(regs::RETRYHDR_SEQ) } else { 0 };
        self.put16(CFG_RETRYHDR, value);
    }

    pub fn set_cca_settings(&mut self, value: u16) {
        self.put16(CFG_BURST, value);
    }

    pub fn set_cca_thres_gain(&mut self, value: u16) {
        self.put16(CFG_BURST + 2, value);
    }

    pub fn set_channel(&mut self, pattern: &regs::RfChannelPattern) {
        self.put16(CFG_BURST + 4, pattern.if_baseband_gain_lna);
        self.put16(CFG_BURST + 6, pattern.rxbandfre_cfg1freq);
        self.put16(CFG_BURST + 8, pattern.cfg2freq_cfg3freq);
        self.put16(CFG_BURST + 10, pattern.cfg_widths_txpwr_randpulse);
        self.put16(CFG_BURST + 12, pattern.tx_pulse_pos);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

// The sleep configuration needs its own field; see `set_timercfg_sleepcfg`.
impl RadioCfgXfer {
    pub fn timercfg_sleepcfg(&self) -> u16 {
        self.timercfg
    }
}

/* Read events burst */

const EVT_PWR_STATUS: usize = 0;
const EVT_IRQ: usize = EVT_PWR_STATUS + REG8_READ_LEN;
const EVT_ACTIONS: usize = EVT_IRQ + REG16_READ_LEN;
const EVT_SET_ACTIONS: usize = EVT_ACTIONS + REG8_READ_LEN;
const EVT_SET_IRQ: usize = EVT_SET_ACTIONS + REG8_WRITE_LEN;
pub const READ_EVENTS_XFER_SIZE: usize = EVT_SET_IRQ + REG16_WRITE_LEN;

const _: () = assert!(READ_EVENTS_XFER_SIZE == 12);

/// IRQ flag and power-status readout issued after every radio interrupt.
///
/// Besides reading the state it puts the radio back to sleep and masks
/// all IRQ sources so a failed reception cannot retrigger.
pub struct ReadEventsXfer {
    out: [u8; READ_EVENTS_XFER_SIZE],
    inp: [u8; READ_EVENTS_XFER_SIZE],
}

impl Default for ReadEventsXfer {
    fn default() -> Self {
        let mut out = [0u8; READ_EVENTS_XFER_SIZE];
        out[EVT_PWR_STATUS] = regs::REG8_POWER_STATE;
        out[EVT_IRQ] = regs::REG16_IRQ;
        out[EVT_ACTIONS] = regs::REG8_ACTIONS;
        out[EVT_SET_ACTIONS] = regs::REG_WRITE | regs::REG8_ACTIONS;
        out[EVT_SET_ACTIONS + 1] = regs::Actions::SLEEP.bits();
        out[EVT_SET_IRQ] = regs::REG_WRITE | regs::REG16_IRQ;
        Self { out, inp: [0u8; READ_EVENTS_XFER_SIZE] }
    }
}

impl ReadEventsXfer {
    pub fn out_bytes(&self) -> &[u8] {
        &self.out
    }

    pub fn in_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.inp
    }

    pub fn pwr_status(&self) -> PowerState {
        PowerState::from_bits_truncate(self.inp[EVT_PWR_STATUS + 1])
    }

    pub fn irq(&self) -> IrqEvents {
        IrqEvents::from_bits_truncate(u16::from_le_bytes([
            self.inp[EVT_IRQ + 1],
            self.inp[EVT_IRQ + 2],
        ]))
    }

    /// CCA attempts the radio consumed for the last transmission.
    pub fn cca_try_count(&self) -> u8 {
        self.inp[EVT_ACTIONS + 1] & regs::ACTIONS_TXRETRIES_MASK
    }
}

/* Reception info burst */

const INFO_FRAME_SIZE: usize = 0;
const INFO_HEADER_SIZE: usize = INFO_FRAME_SIZE + REG8_READ_LEN;
const INFO_RXTIME: usize = INFO_HEADER_SIZE + REG8_READ_LEN;
const INFO_RSSI_RNSI: usize = INFO_RXTIME + REG16_READ_LEN;
const INFO_PHASE_1_2: usize = INFO_RSSI_RNSI + REG16_READ_LEN;
const INFO_PHASE_3_4: usize = INFO_PHASE_1_2 + REG16_READ_LEN;
pub const READ_INFO_XFER_SIZE: usize = INFO_PHASE_3_4 + REG16_READ_LEN;

const _: () = assert!(READ_INFO_XFER_SIZE == 16);

/// Post-reception information: saved frame and header sizes from the
/// FIFO, syncword wait time, RSSI/RNSI and ranging phases.
pub struct ReadInfoXfer {
    out: [u8; READ_INFO_XFER_SIZE],
    inp: [u8; READ_INFO_XFER_SIZE],
}

impl Default for ReadInfoXfer {
    fn default() -> Self {
        let mut out = [0u8; READ_INFO_XFER_SIZE];
        out[INFO_FRAME_SIZE] = regs::REG8_FIFOS;
        out[INFO_HEADER_SIZE] = regs::REG8_FIFOS;
        out[INFO_RXTIME] = regs::REG16_RXTIME;
        out[INFO_RSSI_RNSI] = regs::REG16_RSSI_RNSI;
        out[INFO_PHASE_1_2] = regs::REG16_PHASE_1_2;
        out[INFO_PHASE_3_4] = regs::REG16_PHASE_3_4;
        Self { out, inp: [0u8; READ_INFO_XFER_SIZE] }
    }
}

impl ReadInfoXfer {
    pub fn out_bytes(&self) -> &[u8] {
        &self.out
    }

    pub fn in_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.inp
    }

    /// Saved frame size, size byte included.
    pub fn frame_size(&self) -> u8 {
        self.inp[INFO_FRAME_SIZE + 1]
    }

    /// Saved header size.
    pub fn header_size(&self) -> u8 {
        self.inp[INFO_HEADER_SIZE + 1]
    }

    /// PLL cycles the receiver waited before the syncword locked.
    pub fn rx_wait_time(&self) -> u16 {
        u16::from_le_bytes([self.inp[INFO_RXTIME + 1], self.inp[INFO_RXTIME + 2]])
    }

    pub fn rssi_raw(&self) -> u8 {
        self.inp[INFO_RSSI_RNSI + 1]
    }

    pub fn rnsi_raw(&self) -> u8 {
        self.inp[INFO_RSSI_RNSI + 2]
    }

    pub fn phases(&self) -> PhaseInfo {
        PhaseInfo {
            phase1: self.inp[INFO_PHASE_1_2 + 1],
            phase2: self.inp[INFO_PHASE_1_2 + 2],
            phase3: self.inp[INFO_PHASE_3_4 + 1],
            phase4: self.inp[INFO_PHASE_3_4 + 2],
            rx_waited: self.rx_wait_time(),
        }
    }
}

/* Header fill burst */

pub const FILL_HEADER_XFER_SIZE: usize = SPI_BURST_PREFIX_SIZE + HEADER_MAX_SIZE;

/// TX FIFO header burst: burst command, header size byte, header bytes.
pub struct FillHeaderXfer {
    buf: [u8; FILL_HEADER_XFER_SIZE],
}

impl Default for FillHeaderXfer {
    fn default() -> Self {
        let mut buf = [0u8; FILL_HEADER_XFER_SIZE];
        buf[0] = regs::REG_WRITE_BURST | regs::REG8_FIFOS;
        Self { buf }
    }
}

impl FillHeaderXfer {
    /// Stage `header` and return the bytes to clock out.
    pub fn fill(&mut self, header: &[u8]) -> &[u8] {
        let len = header.len().min(HEADER_MAX_SIZE);
        self.buf[1] = len as u8;
        self.buf[2..2 + len].copy_from_slice(&header[..len]);
        &self.buf[..SPI_BURST_PREFIX_SIZE + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_cfg_layout_is_stable() {
        let mut cfg = RadioCfgXfer::default();
        cfg.set_actions(regs::Actions::FLUSH_TX | regs::Actions::START_TX);
        cfg.set_rx_address(0x1234);
        cfg.set_rx_tx_size(10, 20);
        let bytes = cfg.as_bytes();
        assert_eq!(bytes[CFG_ACTIONS], regs::REG_WRITE | regs::REG8_ACTIONS);
        assert_eq!(bytes[CFG_ACTIONS + 1], 0x05);
        assert_eq!(&bytes[CFG_RX_ADDRESS + 1..CFG_RX_ADDRESS + 3], &[0x34, 0x12]);
        assert_eq!(&bytes[CFG_RX_TX_SIZE + 1..CFG_RX_TX_SIZE + 3], &[20, 10]);
        assert_eq!(bytes[CFG_BURST], regs::REG_WRITE_BURST | regs::REG16_CCA_SETTINGS);
    }

    #[test]
    fn read_events_decodes_flags() {
        let mut xfer = ReadEventsXfer::default();
        let flags = (IrqEvents::RX_END | IrqEvents::CRC_PASS | IrqEvents::ADDR_MATCH).bits();
        xfer.in_bytes_mut()[EVT_IRQ + 1..EVT_IRQ + 3].copy_from_slice(&flags.to_le_bytes());
        xfer.in_bytes_mut()[EVT_PWR_STATUS + 1] = PowerState::AWAKE.bits();
        xfer.in_bytes_mut()[EVT_ACTIONS + 1] = 0x23;
        assert!(xfer.irq().rx_good());
        assert!(xfer.pwr_status().contains(PowerState::AWAKE));
        assert_eq!(xfer.cca_try_count(), 3);
    }

    #[test]
    fn fill_header_prefixes_burst_command_and_size() {
        let mut xfer = FillHeaderXfer::default();
        let bytes = xfer.fill(&[0xDE, 0xAD]);
        assert_eq!(bytes, &[regs::REG_WRITE_BURST | regs::REG8_FIFOS, 2, 0xDE, 0xAD]);
    }
}
