//! # Connect status
//!
//! Hysteretic per-connection link state. A run of good outcomes flips the
//! connection to connected, a run of bad outcomes (or losing sync) flips
//! it to disconnected; single events never toggle the state back and
//! forth. The update reports transitions so the MAC can emit a connect or
//! disconnect event exactly once per change.

use crate::xlayer::FrameOutcome;

/// Consecutive good outcomes before declaring the link connected.
pub const CONNECT_COUNT_DEFAULT: u8 = 2;
/// Consecutive bad outcomes before declaring the link disconnected.
pub const DISCONNECT_COUNT_DEFAULT: u8 = 5;

/// Link state of one connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectStatus {
    Connected,
    #[default]
    Disconnected,
}

/// Hysteresis thresholds.
#[derive(Debug, Clone, Copy)]
pub struct ConnectStatusCfg {
    /// Good outcomes in a row required to connect.
    pub connect_count: u8,
    /// Bad outcomes in a row required to disconnect.
    pub disconnect_count: u8,
}

impl Default for ConnectStatusCfg {
    fn default() -> Self {
        Self { connect_count: CONNECT_COUNT_DEFAULT, disconnect_count: DISCONNECT_COUNT_DEFAULT }
    }
}

/// Hysteretic connect-status machine.
#[derive(Debug, Default, Clone)]
pub struct LinkConnectStatus {
    pub status: ConnectStatus,
    cfg: ConnectStatusCfg,
    good_count: u8,
    bad_count: u8,
}

impl LinkConnectStatus {
    pub fn init(&mut self, cfg: ConnectStatusCfg) {
        *self = Self { cfg, ..Self::default() };
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectStatus::Connected
    }

    /// Feed one frame outcome. Returns `true` when the status changed.
    ///
    /// An unsynced node counts as a bad outcome regardless of the frame;
    /// a sent frame without acknowledge enabled cannot prove the peer
    /// heard it, so it neither helps nor harms.
    pub fn update(&mut self, outcome: FrameOutcome, synced: bool, ack_enabled: bool) -> bool {
        let good = synced
            && match outcome {
                FrameOutcome::SentAck | FrameOutcome::Received => true,
                FrameOutcome::SentAckLost if !ack_enabled => return false,
                _ => false,
            };

        if good {
            self.bad_count = 0;
            self.good_count = self.good_count.saturating_add(1);
            if self.status == ConnectStatus::Disconnected && self.good_count >= self.cfg.connect_count {
                self.status = ConnectStatus::Connected;
                return true;
            }
        } else {
            self.good_count = 0;
            self.bad_count = self.bad_count.saturating_add(1);
            if self.status == ConnectStatus::Connected && self.bad_count >= self.cfg.disconnect_count {
                self.status = ConnectStatus::Disconnected;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> LinkConnectStatus {
        let mut s = LinkConnectStatus::default();
        s.init(ConnectStatusCfg::default());
        s
    }

    #[test]
    fn connects_after_run_of_good_outcomes() {
        let mut s = status();
        assert!(!s.update(FrameOutcome::Received, true, true));
        assert!(s.update(FrameOutcome::Received, true, true));
        assert!(s.is_connected());
    }

    #[test]
    fn single_loss_does_not_disconnect() {
        let mut s = status();
        s.update(FrameOutcome::Received, true, true);
        s.update(FrameOutcome::Received, true, true);
        assert!(!s.update(FrameOutcome::Lost, true, true));
        assert!(s.is_connected());
    }

    #[test]
    fn run_of_losses_disconnects_once() {
        let mut s = status();
        s.update(FrameOutcome::Received, true, true);
        s.update(FrameOutcome::Received, true, true);
        let mut transitions = 0;
        for _ in 0..DISCONNECT_COUNT_DEFAULT + 2 {
            if s.update(FrameOutcome::Lost, true, true) {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
        assert!(!s.is_connected());
    }

    #[test]
    fn unsync_counts_as_failure() {
        let mut s = status();
        s.update(FrameOutcome::Received, true, true);
        s.update(FrameOutcome::Received, true, true);
        for _ in 0..DISCONNECT_COUNT_DEFAULT {
            s.update(FrameOutcome::Received, false, true);
        }
        assert!(!s.is_connected());
    }

    #[test]
    fn unconfirmed_send_is_neutral() {
        let mut s = status();
        s.update(FrameOutcome::Received, true, true);
        s.update(FrameOutcome::Received, true, true);
        for _ in 0..DISCONNECT_COUNT_DEFAULT + 1 {
            s.update(FrameOutcome::SentAckLost, true, false);
        }
        assert!(s.is_connected());
    }
}
