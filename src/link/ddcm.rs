//! # Distributed desync concurrency mechanism
//!
//! When two unsynchronized networks share a schedule period their
//! timeslots can collide persistently. The coordinator watches how long
//! its transmissions have gone unacknowledged; once the configured
//! sync-loss duration is exceeded it applies a pseudo-random per-timeslot
//! offset so the colliding schedules walk away from each other.

/// Distributed desync state.
#[derive(Debug, Default)]
pub struct LinkDdcm {
    enabled: bool,
    /// Largest offset applied to one timeslot, in PLL cycles.
    max_timeslot_offset: u16,
    /// Unacknowledged time before the offset kicks in, in PLL cycles.
    sync_loss_max_duration_pll: u32,
    sync_loss_duration: u32,
    offset: u16,
    lfsr: u16,
}

impl LinkDdcm {
    pub fn init(&mut self, max_timeslot_offset: u16, sync_loss_max_duration_pll: u32) {
        *self = Self {
            enabled: true,
            max_timeslot_offset,
            sync_loss_max_duration_pll,
            lfsr: 0xACE1,
            ..Self::default()
        };
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.offset = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Account the elapsed interval while the link shows no progress.
    pub fn pll_cycles_update(&mut self, sleep_cycles: u32) {
        if self.enabled {
            self.sync_loss_duration = self.sync_loss_duration.saturating_add(sleep_cycles);
        }
    }

    /// Digest the outcome of a transmission.
    ///
    /// An acknowledged frame clears the lost-time account and the offset.
    /// An unacknowledged frame past the tolerated duration draws a new
    /// pseudo-random offset; CCA retries already displace the frame by
    /// themselves and are deducted from the draw.
    pub fn post_tx_update(&mut self, cca_try_count: u8, cca_retry_time: u16, tx_success: bool) {
        if !self.enabled {
            return;
        }
        if tx_success {
            self.sync_loss_duration = 0;
            self.offset = 0;
            return;
        }
        if self.sync_loss_duration > self.sync_loss_max_duration_pll && self.max_timeslot_offset != 0 {
            let cca_displacement = u16::from(cca_try_count).saturating_mul(cca_retry_time);
            let draw = self.next_rand() % self.max_timeslot_offset;
            self.offset = draw.saturating_sub(cca_displacement);
        }
    }

    /// Offset to add to the next timeslot, in PLL cycles.
    pub fn get_offset(&self) -> u16 {
        if self.enabled { self.offset } else { 0 }
    }

    fn next_rand(&mut self) -> u16 {
        // 16-bit Fibonacci LFSR, taps 16,14,13,11.
        let bit = (self.lfsr ^ (self.lfsr >> 2) ^ (self.lfsr >> 3) ^ (self.lfsr >> 5)) & 1;
        self.lfsr = (self.lfsr >> 1) | (bit << 15);
        self.lfsr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_appears_only_after_sustained_loss() {
        let mut ddcm = LinkDdcm::default();
        ddcm.init(128, 1_000);
        ddcm.pll_cycles_update(500);
        ddcm.post_tx_update(0, 0, false);
        assert_eq!(ddcm.get_offset(), 0);
        ddcm.pll_cycles_update(600);
        ddcm.post_tx_update(0, 0, false);
        assert!(ddcm.get_offset() < 128);
    }

    #[test]
    fn success_clears_offset_and_account() {
        let mut ddcm = LinkDdcm::default();
        ddcm.init(128, 100);
        ddcm.pll_cycles_update(1_000);
        ddcm.post_tx_update(0, 0, false);
        ddcm.post_tx_update(0, 0, true);
        assert_eq!(ddcm.get_offset(), 0);
        ddcm.post_tx_update(0, 0, false);
        // The account restarted from zero.
        assert_eq!(ddcm.get_offset(), 0);
    }

    #[test]
    fn disabled_module_reports_zero() {
        let mut ddcm = LinkDdcm::default();
        ddcm.init(128, 0);
        ddcm.pll_cycles_update(1_000);
        ddcm.post_tx_update(0, 0, false);
        ddcm.disable();
        assert_eq!(ddcm.get_offset(), 0);
    }
}
