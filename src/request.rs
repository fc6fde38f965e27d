//! # Application request queue
//!
//! Requests issued by the application are queued here and drained by the
//! MAC at the `ConfigComplete` and `BlockingConfigDone` boundaries, when
//! the radio is configured and the SPI bus is quiet.

use heapless::spsc::Queue;

use crate::ConnectionId;
use crate::config::{PATTERN_THROTTLE_GRANULARITY, REQUEST_QUEUE_SIZE};
use crate::phy::RegWriteCfg;

/// Throttle pattern replacement for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleRatioCfg {
    /// Active timeslot ratio, in percent.
    pub active_ratio: u8,
    /// Number of pattern entries in use.
    pub pattern_total_count: u8,
    /// Pattern index to resume from.
    pub pattern_current_count: u8,
    /// Enabled flag per pattern slot.
    pub pattern: [bool; PATTERN_THROTTLE_GRANULARITY],
}

/// One application request.
#[derive(Debug, Clone, Copy)]
pub enum WpsRequest {
    /// Apply a new throttle pattern to a connection.
    ChangeScheduleRatio {
        connection: ConnectionId,
        cfg: ScheduleRatioCfg,
    },
    /// Write a radio register (single radio only).
    WritePhyReg { reg: u8, value: u16, cfg: RegWriteCfg },
    /// Read a radio register (single radio only).
    ReadPhyReg { reg: u8 },
    /// Leave the network at the next PHY boundary.
    Disconnect,
}

/// SP/SC queue of pending requests.
pub struct RequestQueue {
    queue: Queue<WpsRequest, REQUEST_QUEUE_SIZE>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self { queue: Queue::new() }
    }
}

impl RequestQueue {
    pub fn enqueue(&mut self, request: WpsRequest) -> bool {
        self.queue.enqueue(request).is_ok()
    }

    pub fn dequeue(&mut self) -> Option<WpsRequest> {
        self.queue.dequeue()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_dequeue_restores_empty_state() {
        let mut q = RequestQueue::default();
        assert!(q.enqueue(WpsRequest::Disconnect));
        assert!(matches!(q.dequeue(), Some(WpsRequest::Disconnect)));
        assert!(q.dequeue().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_rejects() {
        let mut q = RequestQueue::default();
        let mut accepted = 0;
        for _ in 0..REQUEST_QUEUE_SIZE + 2 {
            if q.enqueue(WpsRequest::Disconnect) {
                accepted += 1;
            }
        }
        // An spsc queue of capacity N stores N - 1 items.
        assert_eq!(accepted, REQUEST_QUEUE_SIZE - 1);
    }
}
