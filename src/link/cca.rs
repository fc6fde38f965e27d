//! # Clear channel assessment
//!
//! Parameter block for the radio's energy-detection test before TX. The
//! radio retries autonomously at `retry_time_pll_cycles` intervals up to
//! `max_try_count` attempts; on exhaustion it either aborts the frame or
//! transmits anyway, per the configured fail action.

use heapless::Vec;

use crate::config::{DISABLE_CCA_THRESHOLD, MAX_FALLBACK_LEVEL_COUNT};

/// Action the radio takes once every CCA attempt failed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcaFailAction {
    /// Abort the transmission; the frame stays queued.
    #[default]
    AbortTx,
    /// Transmit anyway.
    ForwardTx,
}

/// CCA parameter block of one connection.
#[derive(Debug, Clone)]
pub struct LinkCca {
    /// Energy threshold; [`DISABLE_CCA_THRESHOLD`] disables the block.
    pub threshold: u8,
    /// Delay between attempts, in PLL cycles.
    pub retry_time_pll_cycles: u16,
    /// Attempts per frame.
    pub max_try_count: u8,
    /// Attempts per frame while a fallback level is active.
    pub fbk_try_count: Vec<u8, MAX_FALLBACK_LEVEL_COUNT>,
    /// What to do when every attempt failed.
    pub fail_action: CcaFailAction,
    /// Energy integration window, in PLL cycles.
    pub on_time_pll_cycles: u8,
    pub enabled: bool,
}

impl Default for LinkCca {
    fn default() -> Self {
        Self {
            threshold: DISABLE_CCA_THRESHOLD,
            retry_time_pll_cycles: 0,
            max_try_count: 0,
            fbk_try_count: Vec::new(),
            fail_action: CcaFailAction::default(),
            on_time_pll_cycles: 0,
            enabled: false,
        }
    }
}

impl LinkCca {
    pub fn init(
        &mut self,
        threshold: u8,
        retry_time_pll_cycles: u16,
        max_try_count: u8,
        fail_action: CcaFailAction,
        on_time_pll_cycles: u8,
    ) {
        self.threshold = threshold;
        self.retry_time_pll_cycles = retry_time_pll_cycles;
        self.max_try_count = max_try_count;
        self.fail_action = fail_action;
        self.on_time_pll_cycles = on_time_pll_cycles;
        self.enabled = max_try_count != 0 && threshold != DISABLE_CCA_THRESHOLD;
    }

    /// Worst-case time the CCA block can hold a transmission, in PLL cycles.
    pub fn max_additional_delay(&self) -> u32 {
        if !self.enabled {
            return 0;
        }
        u32::from(self.retry_time_pll_cycles) * u32::from(self.max_try_count.saturating_sub(1))
    }

    pub fn on_time(&self) -> u8 {
        self.on_time_pll_cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_threshold_disables_block() {
        let mut cca = LinkCca::default();
        cca.init(DISABLE_CCA_THRESHOLD, 10, 3, CcaFailAction::AbortTx, 2);
        assert!(!cca.enabled);
        assert_eq!(cca.max_additional_delay(), 0);
    }

    #[test]
    fn additional_delay_counts_retries_after_the_first() {
        let mut cca = LinkCca::default();
        cca.init(40, 10, 3, CcaFailAction::AbortTx, 2);
        assert!(cca.enabled);
        assert_eq!(cca.max_additional_delay(), 20);
    }
}
