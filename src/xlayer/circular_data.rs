//! # Circular payload arena
//!
//! Byte arena backing the frame payloads of one traffic direction.
//! Allocation hands out contiguous runs, wrapping to the buffer start when
//! the tail run is too short; release happens in FIFO order, with a single
//! allowed rollback of the most recent allocation (used when a duplicate
//! frame is dropped before it ever leaves the MAC).
//!
//! The arena is only touched from the radio IRQ priority, so it carries no
//! critical section of its own.

/// Circular byte arena with FIFO release and one-deep rollback.
#[derive(Debug)]
pub struct CircularData<'a> {
    buffer: &'a mut [u8],
    head: u16,
    tail: u16,
    last_head: u16,
}

impl<'a> CircularData<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        debug_assert!(buffer.len() <= u16::MAX as usize);
        Self { buffer, head: 0, tail: 0, last_head: 0 }
    }

    pub fn buffer_size(&self) -> u16 {
        self.buffer.len() as u16
    }

    /// Reserve a contiguous run of `required` bytes and return its offset.
    ///
    /// When the run between `head` and the buffer end is too short, the
    /// allocation skips to the buffer start instead.
    pub fn allocate(&mut self, required: u16) -> Option<u16> {
        let size = self.buffer_size();
        let mut last_head = self.head;
        let offset = if self.head >= self.tail {
            let free_to_end = size - self.head;
            let free_from_begin = self.tail;
            if free_to_end >= required {
                Some(self.head)
            } else if free_from_begin >= required {
                last_head = 0;
                Some(0)
            } else {
                None
            }
        } else {
            let free_middle = self.tail - self.head;
            if free_middle >= required { Some(self.head) } else { None }
        };

        if offset.is_some() {
            self.last_head = last_head;
            self.head = last_head + required;
        }
        offset
    }

    /// Release `len` bytes starting at `offset`.
    ///
    /// Either rolls back the most recent allocation (`offset == last_head`)
    /// or releases the current tail run in FIFO order. Returns the number
    /// of bytes released; `0` signals an ordering bug in the caller.
    pub fn free(&mut self, offset: u16, len: u16) -> u16 {
        if len == 0 {
            return 0;
        }

        // Rollback of the most recent allocation (duplicate frame removal).
        if self.last_head == offset {
            self.head = self.last_head;
            return len;
        }

        let mut tail = self.tail;
        if tail + len > self.buffer_size() {
            tail = 0;
        }
        if offset != tail {
            return 0;
        }
        self.tail = tail + len;
        len
    }

    /// View of a reserved run.
    pub fn slice(&mut self, offset: u16, len: u16) -> &mut [u8] {
        &mut self.buffer[offset as usize..(offset + len) as usize]
    }

    pub fn slice_ref(&self, offset: u16, len: u16) -> &[u8] {
        &self.buffer[offset as usize..(offset + len) as usize]
    }

    /// Drop every allocation.
    pub fn flush(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> u16 {
        if self.tail <= self.head {
            self.head - self.tail
        } else {
            self.buffer_size() - (self.tail - self.head)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_exact_span_succeeds_one_more_fails() {
        let mut mem = [0u8; 32];
        let mut arena = CircularData::new(&mut mem);
        assert!(arena.allocate(32).is_some());
        assert_eq!(arena.allocate(1), None);
    }

    #[test]
    fn fifo_free_advances_tail() {
        let mut mem = [0u8; 32];
        let mut arena = CircularData::new(&mut mem);
        let a = arena.allocate(8).unwrap();
        let b = arena.allocate(8).unwrap();
        assert_eq!(arena.free(a, 8), 8);
        assert_eq!(arena.free(b, 8), 8);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn out_of_order_free_is_rejected() {
        let mut mem = [0u8; 32];
        let mut arena = CircularData::new(&mut mem);
        let _a = arena.allocate(8).unwrap();
        let b = arena.allocate(8).unwrap();
        // `b` is neither the tail run nor the most recent head.
        arena.allocate(4).unwrap();
        assert_eq!(arena.free(b, 8), 0);
    }

    #[test]
    fn rollback_of_most_recent_allocation() {
        let mut mem = [0u8; 32];
        let mut arena = CircularData::new(&mut mem);
        let a = arena.allocate(8).unwrap();
        let b = arena.allocate(8).unwrap();
        let used = arena.used();
        assert_eq!(arena.free(b, 8), 8);
        assert_eq!(arena.used(), used - 8);
        // The rolled-back span is immediately reusable.
        assert_eq!(arena.allocate(8), Some(b));
        // FIFO ordering still holds from the tail.
        assert_eq!(arena.free(a, 8), 8);
    }

    #[test]
    fn wrap_skips_to_buffer_start() {
        let mut mem = [0u8; 32];
        let mut arena = CircularData::new(&mut mem);
        let a = arena.allocate(12).unwrap();
        let b = arena.allocate(12).unwrap();
        assert_eq!(arena.free(a, 12), 12);
        // head = 24, tail = 12: the 8-byte run at the end cannot hold 10
        // bytes, the allocation must skip to the buffer start.
        let c = arena.allocate(10).unwrap();
        assert_eq!(c, 0);
        assert_eq!(arena.free(b, 12), 12);
    }

    #[test]
    fn used_matches_occupancy_invariant() {
        let mut mem = [0u8; 16];
        let mut arena = CircularData::new(&mut mem);
        assert_eq!(arena.used(), 0);
        let a = arena.allocate(6).unwrap();
        assert_eq!(arena.used(), 6);
        let _b = arena.allocate(6).unwrap();
        assert_eq!(arena.used(), 12);
        arena.free(a, 6);
        assert_eq!(arena.used(), 6);
    }
}
