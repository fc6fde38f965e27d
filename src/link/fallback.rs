//! # Fallback
//!
//! Payload-size driven selection of alternate RF settings. Thresholds are
//! sorted in ascending order; the module picks the tightest threshold that
//! still covers the payload, and reports whether fallback applies at all.

use heapless::Vec;

use crate::config::MAX_FALLBACK_LEVEL_COUNT;

/// Fallback threshold table of one connection.
#[derive(Debug, Default, Clone)]
pub struct LinkFallback {
    threshold: Vec<u8, MAX_FALLBACK_LEVEL_COUNT>,
}

impl LinkFallback {
    /// Install the threshold table, sorted ascending.
    pub fn init(&mut self, threshold: &[u8]) -> bool {
        self.threshold.clear();
        self.threshold.extend_from_slice(threshold).is_ok()
    }

    pub fn is_configured(&self) -> bool {
        !self.threshold.is_empty()
    }

    pub fn threshold_count(&self) -> usize {
        self.threshold.len()
    }

    /// Index of the fallback level covering `payload_size`, and whether
    /// fallback is active for it. A payload larger than every threshold is
    /// carried with the nominal settings.
    pub fn get_index(&self, payload_size: u8) -> (usize, bool) {
        for (i, &threshold) in self.threshold.iter().enumerate() {
            if payload_size <= threshold {
                return (i, true);
            }
        }
        (0, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tightest_covering_threshold_is_selected() {
        let mut fallback = LinkFallback::default();
        assert!(fallback.init(&[10, 20, 30]));
        assert_eq!(fallback.get_index(25), (2, true));
        assert_eq!(fallback.get_index(15), (1, true));
        assert_eq!(fallback.get_index(31), (0, false));
        assert_eq!(fallback.get_index(5), (0, true));
        assert_eq!(fallback.get_index(10), (0, true));
        assert_eq!(fallback.get_index(30), (2, true));
    }

    #[test]
    fn unconfigured_table_is_inactive() {
        let fallback = LinkFallback::default();
        assert_eq!(fallback.get_index(0), (0, false));
    }
}
