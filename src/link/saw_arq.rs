//! # Stop-and-wait ARQ
//!
//! One-bit sequence numbering with duplicate detection on receive and a
//! double deadline (time to live in ticks, time to live in retries) on
//! transmit. Setting both deadlines to zero selects guaranteed delivery:
//! a frame is retried forever.

/// Stop-and-wait ARQ state of one connection.
#[derive(Debug, Default, Clone)]
pub struct SawArq {
    /// Time to live of a frame, in ticks. Zero disables the time deadline.
    ttl_tick: u64,
    /// Time to live of a frame, in retries. Zero disables the retry deadline.
    ttl_retries: u16,
    /// One-bit sequence number.
    seq_num: bool,
    /// Last received frame repeated the local sequence bit.
    duplicate: bool,
    /// Duplicates seen so far.
    duplicate_count: u32,
    /// Retransmissions performed so far.
    retry_count: u32,
    enable: bool,
}

impl SawArq {
    pub fn init(&mut self, ttl_tick: u64, ttl_retries: u16, init_board_seq: bool, enable: bool) {
        self.ttl_tick = ttl_tick;
        self.ttl_retries = ttl_retries;
        self.seq_num = init_board_seq;
        self.duplicate = false;
        self.duplicate_count = 0;
        self.retry_count = 0;
        self.enable = enable;
    }

    pub fn is_enabled(&self) -> bool {
        self.enable
    }

    pub fn disable(&mut self) {
        self.enable = false;
    }

    /// Both deadlines at zero: the frame is never dropped.
    pub fn is_guaranteed_delivery(&self) -> bool {
        self.ttl_tick == 0 && self.ttl_retries == 0
    }

    /// Whether the frame stamped at `time_stamp` with `retry_count`
    /// attempts is past its deadline at `current_time`.
    ///
    /// With the module disabled every frame reports timed out, so nothing
    /// is ever held for retransmission.
    pub fn is_frame_timeout(&mut self, time_stamp: u64, retry_count: u16, current_time: u64) -> bool {
        if !self.enable {
            return true;
        }

        let delta_t = current_time.wrapping_sub(time_stamp);
        let time_timeout = self.ttl_tick != 0 && delta_t >= self.ttl_tick;
        let retries_timeout = self.ttl_retries != 0 && retry_count >= self.ttl_retries;
        let timeout = time_timeout || retries_timeout;

        if retry_count > 0 && !timeout {
            self.retry_count += 1;
        }
        timeout
    }

    pub fn seq_num(&self) -> bool {
        self.seq_num
    }

    pub fn inc_seq_num(&mut self) {
        self.seq_num = !self.seq_num;
    }

    /// Record the sequence bit of a received frame and flag duplication.
    pub fn update_rx_seq_num(&mut self, seq_num: bool) {
        self.duplicate = seq_num == self.seq_num;
        self.seq_num = seq_num;
    }

    pub fn is_rx_frame_duplicate(&self) -> bool {
        self.enable && self.duplicate
    }

    pub fn incr_duplicate_count(&mut self) {
        self.duplicate_count += 1;
    }

    pub fn duplicate_count(&self) -> u32 {
        self.duplicate_count
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn reset_stats(&mut self) {
        self.retry_count = 0;
        self.duplicate_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(ttl_tick: u64, ttl_retries: u16) -> SawArq {
        let mut arq = SawArq::default();
        arq.init(ttl_tick, ttl_retries, false, true);
        arq
    }

    #[test]
    fn guaranteed_delivery_never_times_out() {
        let mut arq = enabled(0, 0);
        assert!(arq.is_guaranteed_delivery());
        assert!(!arq.is_frame_timeout(0, u16::MAX, u64::MAX));
    }

    #[test]
    fn retry_deadline() {
        let mut arq = enabled(0, 2);
        assert!(!arq.is_frame_timeout(0, 0, 100));
        assert!(!arq.is_frame_timeout(0, 1, 100));
        assert!(arq.is_frame_timeout(0, 2, 100));
    }

    #[test]
    fn time_deadline() {
        let mut arq = enabled(50, 0);
        assert!(!arq.is_frame_timeout(100, 0, 149));
        assert!(arq.is_frame_timeout(100, 0, 150));
    }

    #[test]
    fn retry_statistic_counts_surviving_retries() {
        let mut arq = enabled(0, 10);
        arq.is_frame_timeout(0, 0, 0);
        assert_eq!(arq.retry_count(), 0);
        arq.is_frame_timeout(0, 1, 0);
        arq.is_frame_timeout(0, 2, 0);
        assert_eq!(arq.retry_count(), 2);
    }

    #[test]
    fn disabled_module_times_out_everything_and_never_duplicates() {
        let mut arq = SawArq::default();
        arq.init(0, 0, false, false);
        assert!(arq.is_frame_timeout(0, 0, 0));
        arq.update_rx_seq_num(false);
        assert!(!arq.is_rx_frame_duplicate());
    }

    #[test]
    fn duplicate_detection_on_repeated_seq_bit() {
        let mut arq = enabled(0, 0);
        arq.update_rx_seq_num(true);
        assert!(!arq.is_rx_frame_duplicate());
        arq.update_rx_seq_num(true);
        assert!(arq.is_rx_frame_duplicate());
        arq.incr_duplicate_count();
        assert_eq!(arq.duplicate_count(), 1);
        arq.update_rx_seq_num(false);
        assert!(!arq.is_rx_frame_duplicate());
    }
}
