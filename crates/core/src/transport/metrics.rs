//! Pull-style transport counters.
//!
//! One [`TransportMetrics`] instance is owned by each server and shared by reference with the
//! receive thread, the inbox workers and the scheduler. External telemetry reads it through
//! [`UdpServer::metrics`](super::UdpServer::metrics), which adds the current queue depths.
//!
//! All operations are lock-free. A snapshot is not atomic across fields.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct TransportMetrics {
    datagrams_received: AtomicU64,
    datagrams_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    malformed: AtomicU64,
    orphaned: AtomicU64,
    duplicates: AtomicU64,
    resent: AtomicU64,
    send_failures: AtomicU64,
    messages_dropped: AtomicU64,
    handler_failures: AtomicU64,
    admissions_completed: AtomicU64,
    admissions_denied: AtomicU64,
    circuits_timed_out: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) -> u64 {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_add(by))
        })
        .map_or(u64::MAX, |previous| previous.saturating_add(by))
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        bump(&self.datagrams_received, 1);
        bump(&self.bytes_received, bytes as u64);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        bump(&self.datagrams_sent, 1);
        bump(&self.bytes_sent, bytes as u64);
    }

    /// Counts a malformed datagram and tells whether this occurrence should be logged.
    ///
    /// Logging thins out as the count grows: every occurrence up to 100, every 100th up to
    /// 10 000, every 10 000th beyond.
    pub(crate) fn record_malformed(&self) -> bool {
        let count = bump(&self.malformed, 1);
        count <= 100 || (count <= 10_000 && count % 100 == 0) || count % 10_000 == 0
    }

    pub(crate) fn record_orphaned(&self) {
        bump(&self.orphaned, 1);
    }

    pub(crate) fn record_duplicate(&self) {
        bump(&self.duplicates, 1);
    }

    pub(crate) fn record_resent(&self) {
        bump(&self.resent, 1);
    }

    pub(crate) fn record_send_failure(&self) {
        bump(&self.send_failures, 1);
    }

    pub(crate) fn record_message_dropped(&self) {
        bump(&self.messages_dropped, 1);
    }

    pub(crate) fn record_handler_failure(&self) {
        bump(&self.handler_failures, 1);
    }

    pub(crate) fn record_admission(&self, authorized: bool) {
        if authorized {
            bump(&self.admissions_completed, 1);
        } else {
            bump(&self.admissions_denied, 1);
        }
    }

    pub(crate) fn record_timeout(&self) {
        bump(&self.circuits_timed_out, 1);
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn orphaned(&self) -> u64 {
        self.orphaned.load(Ordering::Relaxed)
    }

    pub fn resent(&self) -> u64 {
        self.resent.load(Ordering::Relaxed)
    }

    /// Counter values; queue depths are left at zero for the caller to fill in.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            resent: self.resent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            admissions_completed: self.admissions_completed.load(Ordering::Relaxed),
            admissions_denied: self.admissions_denied.load(Ordering::Relaxed),
            circuits_timed_out: self.circuits_timed_out.load(Ordering::Relaxed),
            ..MetricsSnapshot::default()
        }
    }
}

/// Point-in-time view of the server counters and queue depths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub malformed: u64,
    pub orphaned: u64,
    pub duplicates: u64,
    pub resent: u64,
    pub send_failures: u64,
    /// Messages lost inside the server: reliable sends that exhausted their resends, inbound
    /// messages for closed circuits or a disconnected inbox, and datagrams over an endpoint's
    /// pending admission buffer limit.
    pub messages_dropped: u64,
    pub handler_failures: u64,
    pub admissions_completed: u64,
    pub admissions_denied: u64,
    pub circuits_timed_out: u64,

    pub circuits: usize,
    pub pending_admissions: usize,
    pub inbox_depth: usize,
    pub chat_inbox_depth: usize,
    /// Datagrams waiting in per-circuit outbound queues.
    pub outbound_queue_depth: usize,
    /// Reliable datagrams waiting for acknowledgement, over all circuits.
    pub unacked: usize,
    pub background_tasks: usize,
}
