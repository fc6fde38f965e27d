//! # Node queue management
//!
//! Frame descriptors are pre-allocated in a [`NodePool`] and move between
//! the pool's free queue and the connections' transit queues without ever
//! touching a heap. Nodes are addressed by [`NodeIdx`] handles and carry a
//! `copy_count` refcount; a node only returns to its pool once the last
//! reference frees it. Every queue mutation runs inside a critical section
//! so producers at application priority and consumers in the radio IRQ can
//! share a queue.

use super::Xlayer;

/// Handle of a node inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeIdx(pub u16);

/// One pre-allocated frame descriptor.
#[derive(Debug, Default, Clone)]
pub struct XlayerNode {
    pub xlayer: Xlayer,
    next: Option<u16>,
    copy_count: u8,
}

/// Singly linked head/tail queue of pool nodes.
///
/// Two forms exist: the pool's *free* queue (pre-populated at init) and
/// *transit* queues (initially empty, bounded by `max_size`).
#[derive(Debug, Default, Clone)]
pub struct XlayerQueue {
    head: Option<u16>,
    tail: Option<u16>,
    size: u16,
    max_size: u16,
    is_free_queue: bool,
}

impl XlayerQueue {
    /// Initialize an empty transit queue.
    pub fn new_transit(max_size: u16) -> Self {
        Self { head: None, tail: None, size: 0, max_size, is_free_queue: false }
    }

    pub fn size(&self) -> u16 {
        critical_section::with(|_| self.size)
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    pub fn free_space(&self) -> u16 {
        self.max_size - self.size()
    }

    /// Non-consuming look at the head node.
    pub fn peek(&self) -> Option<NodeIdx> {
        critical_section::with(|_| {
            if self.is_free_queue { None } else { self.head.map(NodeIdx) }
        })
    }
}

/// Pool of pre-allocated nodes plus their shared free queue.
///
/// `header_mem` is carved into one fixed block per node so a receive frame
/// always has header storage without going through the payload arena.
pub struct NodePool<'a> {
    nodes: &'a mut [XlayerNode],
    header_mem: &'a mut [u8],
    header_block_size: u16,
    free: XlayerQueue,
}

impl<'a> NodePool<'a> {
    /// Lay the nodes out back to back and populate the free queue.
    pub fn new(nodes: &'a mut [XlayerNode]) -> Self {
        Self::with_header_data(nodes, &mut [], 0)
    }

    /// Same as [`new`](Self::new), additionally assigning each node a
    /// `header_block_size`-byte block of `header_mem`.
    pub fn with_header_data(
        nodes: &'a mut [XlayerNode],
        header_mem: &'a mut [u8],
        header_block_size: u16,
    ) -> Self {
        let num_nodes = nodes.len() as u16;
        debug_assert!(header_mem.len() >= header_block_size as usize * nodes.len());

        for (i, node) in nodes.iter_mut().enumerate() {
            let i = i as u16;
            node.next = if i + 1 < num_nodes { Some(i + 1) } else { None };
            node.copy_count = 1;
            node.xlayer = Xlayer::default();
            node.xlayer.frame.header_memory_size = header_block_size as u8;
        }

        let free = XlayerQueue {
            head: if num_nodes > 0 { Some(0) } else { None },
            tail: if num_nodes > 0 { Some(num_nodes - 1) } else { None },
            size: num_nodes,
            max_size: num_nodes,
            is_free_queue: true,
        };

        Self { nodes, header_mem, header_block_size, free }
    }

    pub fn node(&self, idx: NodeIdx) -> &XlayerNode {
        &self.nodes[idx.0 as usize]
    }

    pub fn node_mut(&mut self, idx: NodeIdx) -> &mut XlayerNode {
        &mut self.nodes[idx.0 as usize]
    }

    /// The per-node header block assigned at init.
    pub fn header_block(&mut self, idx: NodeIdx) -> &mut [u8] {
        let begin = idx.0 as usize * self.header_block_size as usize;
        let end = begin + self.header_block_size as usize;
        &mut self.header_mem[begin..end]
    }

    pub fn header_block_size(&self) -> u16 {
        self.header_block_size
    }

    pub fn free_queue_size(&self) -> u16 {
        self.free.size()
    }

    /// Take a node from the free queue.
    pub fn get_free_node(&mut self) -> Option<NodeIdx> {
        critical_section::with(|_| Self::dequeue_raw(self.nodes, &mut self.free))
    }

    /// Release one reference on `idx`; the node returns to the free queue
    /// once the last reference is gone.
    pub fn free_node(&mut self, idx: NodeIdx) {
        critical_section::with(|_| {
            let node = &mut self.nodes[idx.0 as usize];
            if node.copy_count == 1 {
                Self::enqueue_raw(self.nodes, &mut self.free, idx);
            } else {
                node.copy_count -= 1;
            }
        });
    }

    /// Register an extra reference on `idx`.
    pub fn inc_copy_count(&mut self, idx: NodeIdx) {
        critical_section::with(|_| {
            self.nodes[idx.0 as usize].copy_count += 1;
        });
    }

    /// Append `idx` to `queue`. Fails when the queue is at capacity.
    pub fn enqueue(&mut self, queue: &mut XlayerQueue, idx: NodeIdx) -> bool {
        critical_section::with(|_| Self::enqueue_raw(self.nodes, queue, idx))
    }

    /// Prepend `idx` to `queue`; used for priority reinsertion.
    pub fn enqueue_at_head(&mut self, queue: &mut XlayerQueue, idx: NodeIdx) -> bool {
        critical_section::with(|_| {
            if queue.size >= queue.max_size {
                return false;
            }
            match queue.head {
                None => {
                    self.nodes[idx.0 as usize].next = None;
                    queue.head = Some(idx.0);
                    queue.tail = Some(idx.0);
                }
                Some(head) => {
                    self.nodes[idx.0 as usize].next = Some(head);
                    queue.head = Some(idx.0);
                }
            }
            queue.size += 1;
            true
        })
    }

    /// Detach and return the head of `queue`.
    pub fn dequeue(&mut self, queue: &mut XlayerQueue) -> Option<NodeIdx> {
        critical_section::with(|_| Self::dequeue_raw(self.nodes, queue))
    }

    /// Dequeue and free every node of `queue`.
    pub fn flush(&mut self, queue: &mut XlayerQueue) {
        if queue.is_free_queue {
            return;
        }
        critical_section::with(|_| {
            while let Some(idx) = Self::dequeue_raw(self.nodes, queue) {
                let node = &mut self.nodes[idx.0 as usize];
                if node.copy_count == 1 {
                    Self::enqueue_raw(self.nodes, &mut self.free, idx);
                } else {
                    node.copy_count -= 1;
                }
            }
        });
    }

    fn enqueue_raw(nodes: &mut [XlayerNode], queue: &mut XlayerQueue, idx: NodeIdx) -> bool {
        if queue.size >= queue.max_size {
            return false;
        }
        nodes[idx.0 as usize].next = None;
        match queue.tail {
            None => queue.head = Some(idx.0),
            Some(tail) => nodes[tail as usize].next = Some(idx.0),
        }
        queue.tail = Some(idx.0);
        queue.size += 1;
        true
    }

    fn dequeue_raw(nodes: &mut [XlayerNode], queue: &mut XlayerQueue) -> Option<NodeIdx> {
        let head = queue.head?;
        queue.head = nodes[head as usize].next;
        if queue.head.is_none() {
            queue.tail = None;
        }
        queue.size -= 1;
        nodes[head as usize].next = None;
        Some(NodeIdx(head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> (std::vec::Vec<XlayerNode>, std::vec::Vec<u8>) {
        (std::vec![XlayerNode::default(); n], std::vec![0u8; n * 8])
    }

    extern crate std;

    #[test]
    fn pool_starts_full() {
        let (mut nodes, _) = pool_of(4);
        let mut pool = NodePool::new(&mut nodes);
        assert_eq!(pool.free_queue_size(), 4);
        for _ in 0..4 {
            assert!(pool.get_free_node().is_some());
        }
        assert_eq!(pool.get_free_node(), None);
    }

    #[test]
    fn enqueue_dequeue_preserves_fifo_order() {
        let (mut nodes, _) = pool_of(4);
        let mut pool = NodePool::new(&mut nodes);
        let mut q = XlayerQueue::new_transit(4);

        let a = pool.get_free_node().unwrap();
        let b = pool.get_free_node().unwrap();
        assert!(pool.enqueue(&mut q, a));
        assert!(pool.enqueue(&mut q, b));
        assert_eq!(q.peek(), Some(a));
        assert_eq!(pool.dequeue(&mut q), Some(a));
        assert_eq!(pool.dequeue(&mut q), Some(b));
        assert_eq!(pool.dequeue(&mut q), None);
    }

    #[test]
    fn enqueue_fails_when_full_without_corruption() {
        let (mut nodes, _) = pool_of(3);
        let mut pool = NodePool::new(&mut nodes);
        let mut q = XlayerQueue::new_transit(2);

        let a = pool.get_free_node().unwrap();
        let b = pool.get_free_node().unwrap();
        let c = pool.get_free_node().unwrap();
        assert!(pool.enqueue(&mut q, a));
        assert!(pool.enqueue(&mut q, b));
        assert!(!pool.enqueue(&mut q, c));
        assert_eq!(q.size(), 2);
        assert_eq!(pool.dequeue(&mut q), Some(a));
        assert_eq!(pool.dequeue(&mut q), Some(b));
    }

    #[test]
    fn enqueue_at_head_then_dequeue_returns_prepended_node() {
        let (mut nodes, _) = pool_of(3);
        let mut pool = NodePool::new(&mut nodes);
        let mut q = XlayerQueue::new_transit(3);

        let a = pool.get_free_node().unwrap();
        let b = pool.get_free_node().unwrap();
        assert!(pool.enqueue(&mut q, a));
        assert!(pool.enqueue_at_head(&mut q, b));
        assert_eq!(pool.dequeue(&mut q), Some(b));
        assert_eq!(pool.dequeue(&mut q), Some(a));
    }

    #[test]
    fn free_node_honors_copy_count() {
        let (mut nodes, _) = pool_of(2);
        let mut pool = NodePool::new(&mut nodes);

        let a = pool.get_free_node().unwrap();
        pool.inc_copy_count(a);
        pool.free_node(a);
        // One reference remains, the node must not be back in the pool.
        assert_eq!(pool.free_queue_size(), 1);
        pool.free_node(a);
        assert_eq!(pool.free_queue_size(), 2);
    }

    #[test]
    fn flush_returns_nodes_to_pool() {
        let (mut nodes, _) = pool_of(4);
        let mut pool = NodePool::new(&mut nodes);
        let mut q = XlayerQueue::new_transit(4);

        for _ in 0..3 {
            let n = pool.get_free_node().unwrap();
            pool.enqueue(&mut q, n);
        }
        assert_eq!(pool.free_queue_size(), 1);
        pool.flush(&mut q);
        assert_eq!(q.size(), 0);
        assert_eq!(pool.free_queue_size(), 4);
    }

    #[test]
    fn header_blocks_are_disjoint() {
        let (mut nodes, mut mem) = pool_of(2);
        let mut pool = NodePool::with_header_data(&mut nodes, &mut mem, 8);
        let a = pool.get_free_node().unwrap();
        let b = pool.get_free_node().unwrap();
        pool.header_block(a).fill(0xAA);
        pool.header_block(b).fill(0xBB);
        assert!(pool.header_block(a).iter().all(|&x| x == 0xAA));
        assert!(pool.header_block(b).iter().all(|&x| x == 0xBB));
    }
}
