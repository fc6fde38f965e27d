//! Link quality indicator: per-connection running counters and signal
//! accumulators, updated by the MAC after each timeslot outcome.

use crate::xlayer::FrameOutcome;

/// Link quality statistics.
#[derive(Debug, Default, Clone)]
pub struct Lqi {
    sent_count: u32,
    ack_count: u32,
    nack_count: u32,
    received_count: u32,
    lost_count: u32,
    rejected_count: u32,
    rssi_total: u64,
    rnsi_total: u64,
    rssi_rnsi_sample_count: u32,
}

impl Lqi {
    /// Feed one frame outcome with its raw signal readings.
    pub fn update(&mut self, outcome: FrameOutcome, rssi_raw: u8, rnsi_raw: u8) {
        match outcome {
            FrameOutcome::SentAck => {
                self.sent_count += 1;
                self.ack_count += 1;
            }
            FrameOutcome::SentAckLost | FrameOutcome::SentAckRejected => {
                self.sent_count += 1;
                self.nack_count += 1;
            }
            FrameOutcome::Received => {
                self.received_count += 1;
                self.rssi_total += u64::from(rssi_raw);
                self.rnsi_total += u64::from(rnsi_raw);
                self.rssi_rnsi_sample_count += 1;
            }
            FrameOutcome::Lost => self.lost_count += 1,
            FrameOutcome::Rejected => self.rejected_count += 1,
            FrameOutcome::Wait => {}
        }
    }

    pub fn sent_count(&self) -> u32 {
        self.sent_count
    }

    pub fn ack_count(&self) -> u32 {
        self.ack_count
    }

    pub fn nack_count(&self) -> u32 {
        self.nack_count
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn lost_count(&self) -> u32 {
        self.lost_count
    }

    pub fn rejected_count(&self) -> u32 {
        self.rejected_count
    }

    /// Average raw RSSI over the received frames, zero without samples.
    pub fn rssi_avg_raw(&self) -> u8 {
        if self.rssi_rnsi_sample_count == 0 {
            0
        } else {
            (self.rssi_total / u64::from(self.rssi_rnsi_sample_count)) as u8
        }
    }

    /// Average raw RNSI over the received frames, zero without samples.
    pub fn rnsi_avg_raw(&self) -> u8 {
        if self.rssi_rnsi_sample_count == 0 {
            0
        } else {
            (self.rnsi_total / u64::from(self.rssi_rnsi_sample_count)) as u8
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-connection traffic statistics.
#[derive(Debug, Default, Clone)]
pub struct WpsStats {
    /// Payloads sent.
    pub tx_success: u32,
    /// Bytes sent.
    pub tx_byte_sent: u32,
    /// Payloads dropped by the ARQ deadline or an explicit flush.
    pub tx_drop: u32,
    /// Payload transmissions that failed.
    pub tx_fail: u32,
    /// Payloads received.
    pub rx_received: u32,
    /// Bytes received.
    pub rx_byte_received: u32,
    /// Payloads dropped for lack of a free RX node.
    pub rx_overrun: u32,
    /// Exchanges where one of the CCA attempts passed.
    pub cca_pass: u32,
    /// Exchanges aborted because every CCA attempt failed.
    pub cca_tx_fail: u32,
    /// Individual CCA attempt failures.
    pub cca_fail: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_counters() {
        let mut lqi = Lqi::default();
        lqi.update(FrameOutcome::SentAck, 0, 0);
        lqi.update(FrameOutcome::SentAckLost, 0, 0);
        lqi.update(FrameOutcome::Received, 40, 60);
        lqi.update(FrameOutcome::Received, 60, 20);
        lqi.update(FrameOutcome::Lost, 0, 0);
        lqi.update(FrameOutcome::Rejected, 0, 0);
        assert_eq!(lqi.sent_count(), 2);
        assert_eq!(lqi.ack_count(), 1);
        assert_eq!(lqi.nack_count(), 1);
        assert_eq!(lqi.received_count(), 1 + 1);
        assert_eq!(lqi.lost_count(), 1);
        assert_eq!(lqi.rejected_count(), 1);
        assert_eq!(lqi.rssi_avg_raw(), 50);
        assert_eq!(lqi.rnsi_avg_raw(), 40);
    }
}
