use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

/// Fixed-capacity free list of byte buffers.
///
/// `acquire` pops an idle buffer or allocates a fresh one when the list is empty; `release`
/// returns a buffer and drops it when the list is full. Safe for any number of concurrent
/// producers and consumers. A disabled pool always allocates.
pub(crate) struct BufferPool {
    free: Option<ArrayQueue<Vec<u8>>>,
    buffer_size: usize,
    reused: AtomicU64,
    allocated: AtomicU64,
}

impl BufferPool {
    pub(crate) fn new(enabled: bool, capacity: usize, buffer_size: usize) -> Self {
        BufferPool {
            free: (enabled && capacity > 0).then(|| ArrayQueue::new(capacity)),
            buffer_size,
            reused: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        }
    }

    /// An empty buffer with at least `buffer_size` bytes of capacity.
    pub(crate) fn acquire(&self) -> Vec<u8> {
        if let Some(mut buffer) = self.free.as_ref().and_then(ArrayQueue::pop) {
            self.reused.fetch_add(1, Ordering::Relaxed);
            buffer.clear();
            return buffer;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Vec::with_capacity(self.buffer_size)
    }

    pub(crate) fn release(&self, buffer: Vec<u8>) {
        let Some(free) = &self.free else {
            return;
        };
        // oversized buffers from exceptional datagrams are not worth keeping around
        if buffer.capacity() > self.buffer_size * 4 {
            return;
        }
        let _ = free.push(buffer);
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.free.as_ref().map_or(0, ArrayQueue::len)
    }

    #[cfg(test)]
    pub(crate) fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}
