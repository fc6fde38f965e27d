//! # Random datarate offset
//!
//! Coexisting networks sharing the band drift apart by exchanging a small
//! per-timeslot sleep offset. The transmitting side sends its counter in
//! the header; the receiving side adopts it, so both apply the same jitter
//! to the TDMA period. The counter rolls over at a configured value and
//! the wire form is two big-endian bytes.

/// Rollover applied when the configured target is zero.
const DEFAULT_ROLLOVER: u16 = 15;

/// Size of the RDO header field, in bytes.
pub const RDO_FIELD_SIZE: u8 = 2;

/// Random datarate offset state.
#[derive(Debug, Default, Clone)]
pub struct LinkRdo {
    offset: u16,
    rollover_n: u16,
    increment_step: u16,
    enabled: bool,
}

impl LinkRdo {
    /// `target_rollover_value` of zero selects the default rollover;
    /// `target_increment_step` is the number of timeslots between offset
    /// increments (zero behaves as one).
    pub fn init(&mut self, target_rollover_value: u16, target_increment_step: u16) {
        self.offset = 0;
        self.enabled = false;
        self.increment_step = if target_increment_step != 0 { target_increment_step } else { 1 };
        let rollover = if target_rollover_value == 0 { DEFAULT_ROLLOVER } else { target_rollover_value };
        self.rollover_n = rollover * self.increment_step;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Write the current offset into an outgoing header field.
    pub fn send_offset(&self, buffer: &mut [u8]) {
        buffer[..2].copy_from_slice(&self.offset.to_be_bytes());
    }

    /// Adopt the offset carried by a received header field.
    pub fn set_offset(&mut self, buffer: &[u8]) {
        self.offset = u16::from_be_bytes([buffer[0], buffer[1]]);
    }

    /// Current offset in PLL cycles; zero while disabled.
    pub fn get_offset(&self) -> u16 {
        if self.enabled { self.offset / self.increment_step } else { 0 }
    }

    /// Advance the counter by one timeslot.
    pub fn update_offset(&mut self) {
        self.offset = if self.rollover_n != 0 { (self.offset + 1) % self.rollover_n } else { 0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_set_round_trips() {
        let mut tx = LinkRdo::default();
        tx.init(8, 1);
        tx.enable();
        for _ in 0..5 {
            tx.update_offset();
        }
        let mut field = [0u8; 2];
        tx.send_offset(&mut field);

        let mut rx = LinkRdo::default();
        rx.init(8, 1);
        rx.enable();
        rx.set_offset(&field);
        assert_eq!(rx.get_offset(), tx.get_offset());
    }

    #[test]
    fn wire_form_is_big_endian() {
        let mut rdo = LinkRdo::default();
        rdo.init(0x300, 1);
        rdo.enable();
        for _ in 0..0x102 {
            rdo.update_offset();
        }
        let mut field = [0u8; 2];
        rdo.send_offset(&mut field);
        assert_eq!(field, [0x01, 0x02]);
    }

    #[test]
    fn offset_rolls_over() {
        let mut rdo = LinkRdo::default();
        rdo.init(8, 1);
        rdo.enable();
        for step in 0..16u16 {
            assert_eq!(rdo.get_offset(), step % 8);
            rdo.update_offset();
        }
    }

    #[test]
    fn disabled_module_reports_zero() {
        let mut rdo = LinkRdo::default();
        rdo.init(8, 1);
        rdo.update_offset();
        assert_eq!(rdo.get_offset(), 0);
    }

    #[test]
    fn increment_step_scales_pll_offset() {
        let mut rdo = LinkRdo::default();
        rdo.init(4, 3);
        rdo.enable();
        // Three updates per PLL-cycle step.
        for _ in 0..3 {
            rdo.update_offset();
        }
        assert_eq!(rdo.get_offset(), 1);
        // Rollover at 4 * 3 raw counts.
        for _ in 0..9 {
            rdo.update_offset();
        }
        assert_eq!(rdo.get_offset(), 0);
    }

    #[test]
    fn zero_rollover_selects_default() {
        let mut rdo = LinkRdo::default();
        rdo.init(0, 1);
        rdo.enable();
        for _ in 0..DEFAULT_ROLLOVER {
            rdo.update_offset();
        }
        assert_eq!(rdo.get_offset(), 0);
    }
}
