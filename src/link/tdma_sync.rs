//! # TDMA synchronization
//!
//! Frame-level time synchronization of a network node against the
//! coordinator's transmissions. While `Syncing`, every good reception on
//! the syncing address re-anchors the slot timing; after a couple of
//! corroborating receptions the node declares itself `Synced` and from
//! then on only applies small clamped drift corrections. Missed frames
//! accumulate lost time; exceeding the configured maximum drops the node
//! back to `Syncing`.
//!
//! All times are PLL cycles. The radio reports `rx_wait_time`, the time it
//! listened before the syncword locked; the expected value is the RX setup
//! time plus any CCA retry delay the transmitter consumed, so the
//! difference is the local clock drift over one frame interval.

use super::cca::LinkCca;
use super::scheduler::SleepLvl;
use crate::xlayer::FrameOutcome;

/// PLL cycles consumed by the radio PLL startup on wake.
pub const SYNC_PLL_STARTUP_CYCLES: u32 = 0x60;
/// PLL cycles between radio wake and RX readiness.
pub const SYNC_RX_SETUP_PLL_CYCLES: u32 = 147;
/// Good receptions in a row before declaring sync.
const SYNC_CORROBORATION_COUNT: u8 = 2;
/// Largest per-frame drift correction applied while synced.
const MAX_DRIFT_ADJUST_PLL: i32 = 64;

/// Synchronization state of a network node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncState {
    #[default]
    Syncing,
    Synced,
}

/// Sync configuration captured at init.
#[derive(Debug, Default, Clone, Copy)]
pub struct TdmaSyncCfg {
    /// Sleep depth used between sync frames.
    pub sleep_lvl: SleepLvl,
    /// Syncword length, in bits.
    pub syncword_len_bits: u32,
    /// Preamble length, in bits.
    pub preamble_len_bits: u32,
    /// Lost time before the node falls back to `Syncing`.
    pub frame_lost_max_duration: u32,
    /// Alternate the TX instant by one cycle to whiten the spectrum.
    pub tx_jitter_enabled: bool,
}

/// TDMA synchronization module.
#[derive(Debug, Default)]
pub struct TdmaSync {
    cfg: TdmaSyncCfg,
    state: SyncState,
    /// Sleep period programmed for the next interval.
    sleep_cycles: u32,
    /// Measured offset against the remote transmitter.
    slave_offset: i32,
    /// Accumulated time without a sync frame.
    frame_lost_duration: u32,
    corroboration: u8,
    jitter_phase: bool,
}

impl TdmaSync {
    pub fn init(&mut self, cfg: TdmaSyncCfg) {
        *self = Self { cfg, ..Self::default() };
    }

    pub fn reset(&mut self) {
        self.frame_lost_duration = 0;
        self.slave_offset = 0;
        self.corroboration = 0;
        self.state = SyncState::Syncing;
    }

    pub fn is_slave_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    pub fn sleep_cycles(&self) -> u32 {
        self.sleep_cycles
    }

    pub fn frame_lost_duration(&self) -> u32 {
        self.frame_lost_duration
    }

    /// Program the sleep period leading into a TX timeslot.
    ///
    /// `duration` is the schedule time to span (slot durations plus RDO and
    /// DDCM adjustments); the PLL startup time is paid on wake and the CCA
    /// window is budgeted before the slot boundary.
    pub fn update_tx(&mut self, duration: i32, cca: &LinkCca, _sleep_lvl: SleepLvl) {
        let mut cycles = duration - SYNC_PLL_STARTUP_CYCLES as i32 - cca.max_additional_delay() as i32;
        if self.cfg.tx_jitter_enabled {
            self.jitter_phase = !self.jitter_phase;
            cycles += if self.jitter_phase { 1 } else { -1 };
        }
        self.sleep_cycles = cycles.max(0) as u32;
    }

    /// Program the sleep period leading into an RX timeslot.
    ///
    /// The receiver wakes early by the RX setup time plus half the
    /// preamble so a drifted transmitter still lands inside the listening
    /// window; any pending slave offset correction is consumed here.
    pub fn update_rx(&mut self, duration: i32, _cca: &LinkCca, _sleep_lvl: SleepLvl) {
        let early = SYNC_RX_SETUP_PLL_CYCLES as i32 + (self.cfg.preamble_len_bits / 2) as i32;
        let cycles = duration - early + self.slave_offset;
        self.slave_offset = 0;
        self.sleep_cycles = cycles.max(0) as u32;
    }

    /// Blind sync acquisition: anchor on any good reception from the
    /// syncing address and corroborate before declaring sync.
    pub fn slave_find(
        &mut self,
        outcome: FrameOutcome,
        rx_wait_time: u16,
        cca: &LinkCca,
        rx_cca_retry_count: u8,
    ) {
        if outcome == FrameOutcome::Received {
            self.slave_offset = self.measured_drift(rx_wait_time, cca, rx_cca_retry_count);
            self.corroboration += 1;
            if self.corroboration >= SYNC_CORROBORATION_COUNT {
                self.state = SyncState::Synced;
                self.frame_lost_duration = 0;
            }
        } else {
            self.corroboration = 0;
        }
    }

    /// Tracking adjustment while synced: clamp the measured drift and fold
    /// it into the next sleep period. Missed frames accumulate lost time
    /// until the node gives up and drops back to `Syncing`.
    pub fn slave_adjust(
        &mut self,
        outcome: FrameOutcome,
        rx_wait_time: u16,
        cca: &LinkCca,
        rx_cca_retry_count: u8,
    ) {
        if outcome == FrameOutcome::Received {
            let drift = self
                .measured_drift(rx_wait_time, cca, rx_cca_retry_count)
                .clamp(-MAX_DRIFT_ADJUST_PLL, MAX_DRIFT_ADJUST_PLL);
            self.slave_offset = drift;
            self.frame_lost_duration = 0;
        } else {
            self.frame_lost_duration = self.frame_lost_duration.saturating_add(self.sleep_cycles);
            if self.frame_lost_duration > self.cfg.frame_lost_max_duration {
                self.state = SyncState::Syncing;
                self.corroboration = 0;
            }
        }
    }

    /// Drift of the incoming frame against the expected syncword instant.
    fn measured_drift(&self, rx_wait_time: u16, cca: &LinkCca, rx_cca_retry_count: u8) -> i32 {
        let cca_delay = u32::from(rx_cca_retry_count) * u32::from(cca.retry_time_pll_cycles);
        i32::from(rx_wait_time) - SYNC_RX_SETUP_PLL_CYCLES as i32 - cca_delay as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synced_module(frame_lost_max: u32) -> TdmaSync {
        let mut sync = TdmaSync::default();
        sync.init(TdmaSyncCfg {
            preamble_len_bits: 64,
            syncword_len_bits: 32,
            frame_lost_max_duration: frame_lost_max,
            ..TdmaSyncCfg::default()
        });
        let cca = LinkCca::default();
        sync.slave_find(FrameOutcome::Received, 147, &cca, 0);
        sync.slave_find(FrameOutcome::Received, 147, &cca, 0);
        assert!(sync.is_slave_synced());
        sync
    }

    #[test]
    fn sync_needs_corroboration() {
        let mut sync = TdmaSync::default();
        sync.init(TdmaSyncCfg::default());
        let cca = LinkCca::default();
        sync.slave_find(FrameOutcome::Received, 147, &cca, 0);
        assert!(!sync.is_slave_synced());
        sync.slave_find(FrameOutcome::Lost, 0, &cca, 0);
        sync.slave_find(FrameOutcome::Received, 147, &cca, 0);
        // The loss reset the corroboration run.
        assert!(!sync.is_slave_synced());
        sync.slave_find(FrameOutcome::Received, 147, &cca, 0);
        assert!(sync.is_slave_synced());
    }

    #[test]
    fn drift_is_clamped_while_synced() {
        let mut sync = synced_module(10_000);
        let cca = LinkCca::default();
        sync.slave_adjust(FrameOutcome::Received, 147 + 500, &cca, 0);
        sync.update_rx(10_000, &cca, SleepLvl::Idle);
        let with_drift = sync.sleep_cycles();
        sync.slave_adjust(FrameOutcome::Received, 147, &cca, 0);
        sync.update_rx(10_000, &cca, SleepLvl::Idle);
        let without_drift = sync.sleep_cycles();
        assert_eq!(with_drift - without_drift, MAX_DRIFT_ADJUST_PLL as u32);
    }

    #[test]
    fn lost_frames_accumulate_until_unsync() {
        let mut sync = synced_module(1_000);
        let cca = LinkCca::default();
        sync.update_rx(600, &cca, SleepLvl::Idle);
        sync.slave_adjust(FrameOutcome::Lost, 0, &cca, 0);
        assert!(sync.is_slave_synced());
        sync.slave_adjust(FrameOutcome::Lost, 0, &cca, 0);
        sync.slave_adjust(FrameOutcome::Lost, 0, &cca, 0);
        assert!(!sync.is_slave_synced());
    }

    #[test]
    fn cca_retries_of_the_sender_do_not_count_as_drift() {
        let mut sync = synced_module(10_000);
        let mut cca = LinkCca::default();
        cca.init(40, 100, 3, crate::link::cca::CcaFailAction::AbortTx, 2);
        // Frame arrived late by exactly two CCA retry intervals.
        sync.slave_adjust(FrameOutcome::Received, 147 + 200, &cca, 2);
        sync.update_rx(10_000, &cca, SleepLvl::Idle);
        let adjusted = sync.sleep_cycles();
        sync.slave_adjust(FrameOutcome::Received, 147, &cca, 0);
        sync.update_rx(10_000, &cca, SleepLvl::Idle);
        assert_eq!(adjusted, sync.sleep_cycles());
    }

    #[test]
    fn tx_jitter_alternates_by_one_cycle() {
        let mut sync = TdmaSync::default();
        sync.init(TdmaSyncCfg { tx_jitter_enabled: true, ..TdmaSyncCfg::default() });
        let cca = LinkCca::default();
        sync.update_tx(10_000, &cca, SleepLvl::Idle);
        let a = sync.sleep_cycles();
        sync.update_tx(10_000, &cca, SleepLvl::Idle);
        let b = sync.sleep_cycles();
        assert_eq!(a.abs_diff(b), 2);
    }
}
