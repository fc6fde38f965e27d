//! # Deferred callback queue
//!
//! Application callbacks never run in radio context: the MAC pushes them
//! here at radio-IRQ priority and triggers the low-priority context-switch
//! interrupt, whose handler drains the queue through
//! [`Wps::process_callback`](crate::Wps::process_callback). Single
//! producer, single consumer, lock free.

use heapless::spsc::Queue;

use crate::ConnectionId;
use crate::config::CALLBACK_QUEUE_SIZE;

/// Application callback attached to a connection event.
pub type WpsCallback = fn(ConnectionId);

/// One deferred callback invocation.
#[derive(Debug, Clone, Copy)]
pub struct CallbackItem {
    pub callback: WpsCallback,
    pub connection: ConnectionId,
}

/// SP/SC queue of deferred callbacks.
pub struct CallbackQueue {
    queue: Queue<CallbackItem, CALLBACK_QUEUE_SIZE>,
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self { queue: Queue::new() }
    }
}

impl CallbackQueue {
    /// Defer `callback`; silently dropped when the queue is full, the
    /// application sized it too small for its traffic.
    pub fn enqueue(&mut self, callback: Option<WpsCallback>, connection: ConnectionId) {
        if let Some(callback) = callback {
            let _ = self.queue.enqueue(CallbackItem { callback, connection });
        }
    }

    pub fn dequeue(&mut self) -> Option<CallbackItem> {
        self.queue.dequeue()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: ConnectionId) {}

    #[test]
    fn fifo_order() {
        let mut q = CallbackQueue::default();
        q.enqueue(Some(nop), ConnectionId(0));
        q.enqueue(Some(nop), ConnectionId(1));
        assert_eq!(q.dequeue().unwrap().connection, ConnectionId(0));
        assert_eq!(q.dequeue().unwrap().connection, ConnectionId(1));
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn missing_callback_is_not_enqueued() {
        let mut q = CallbackQueue::default();
        q.enqueue(None, ConnectionId(0));
        assert!(q.is_empty());
    }
}
