use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

use super::MTU;

/// Received-but-unacknowledged bytes above which acks are flushed from the receive path
/// instead of waiting for the next outbound tick.
pub(crate) const ACK_FLUSH_THRESHOLD: usize = 2 * MTU;

/// Pending outbound acknowledgements of reliable datagrams received from the peer.
///
/// The receive thread enqueues, the outbound scheduler dequeues either to piggyback acks on
/// outgoing datagrams or to build a dedicated ack datagram.
pub(crate) struct ReceivedPacketTracker {
    pending_acks: SegQueue<(u32, usize)>,
    unacked_bytes: AtomicUsize,
}

impl ReceivedPacketTracker {
    pub(crate) fn new() -> Self {
        ReceivedPacketTracker {
            pending_acks: SegQueue::new(),
            unacked_bytes: AtomicUsize::new(0),
        }
    }

    /// Queues an acknowledgement for `sequence`, a reliable datagram of `len` bytes.
    pub(crate) fn report_received_packet(&self, sequence: u32, len: usize) -> ReportResult {
        self.pending_acks.push((sequence, len));
        let unacked = self.unacked_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if unacked > ACK_FLUSH_THRESHOLD {
            ReportResult::QueueFull
        } else {
            ReportResult::Ok
        }
    }

    pub(crate) fn enqueue(&self, sequence: u32) {
        self.pending_acks.push((sequence, 0));
    }

    pub(crate) fn dequeue_one(&self) -> Option<u32> {
        let (sequence, len) = self.pending_acks.pop()?;
        let _ = self
            .unacked_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bytes| {
                Some(bytes.saturating_sub(len))
            });
        Some(sequence)
    }

    /// Dequeues up to `max` pending acks in arrival order.
    pub(crate) fn dequeue_up_to(&self, max: usize) -> Vec<u32> {
        let mut acks = Vec::new();
        while acks.len() < max {
            match self.dequeue_one() {
                Some(sequence) => acks.push(sequence),
                None => break,
            }
        }
        acks
    }

    #[cfg(test)]
    pub(crate) fn has_pending(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending_acks.len()
    }

    pub(crate) fn unacked_bytes(&self) -> usize {
        self.unacked_bytes.load(Ordering::Acquire)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReportResult {
    /// Acknowledgement queued, it will go out with the next outbound tick
    Ok,

    /// Too many received bytes are unacknowledged and acks must be sent immediately
    QueueFull,
}
