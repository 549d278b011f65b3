use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use super::packet_data::set_resent;
use super::ThrottleCategory;
use crate::util::backoff::ExponentialBackoff;
use crate::util::time_source::{InstantTimeSrc, TimeSource};

/// Clock granularity term of the RTO formula.
const CLOCK_GRANULARITY: Duration = Duration::from_millis(100);

/// Weight of a new sample in the smoothed RTT (1/8).
const RTT_ALPHA: f64 = 0.125;
/// Weight of a new sample in the RTT variance (1/4).
const RTT_BETA: f64 = 0.25;
/// Multiplier of the RTT variance in the RTO formula.
const RTT_K: f64 = 4.0;

/// Invoked instead of the standard resend when a message carrying it times out. Receives the
/// sequence number and the datagram as last sent.
pub type TimeoutCallback = Arc<dyn Fn(u32, &[u8]) + Send + Sync>;

/// What happens to a reliable message whose retransmission timer fired.
#[derive(Clone, Default)]
pub enum OnTimeout {
    /// Send the same datagram again with the RESENT flag, through the resend throttle.
    #[default]
    Resend,
    /// Drop the message from the unacknowledged table and hand it to the callback.
    Callback(TimeoutCallback),
}

impl fmt::Debug for OnTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnTimeout::Resend => f.write_str("Resend"),
            OnTimeout::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A finalized datagram. Its sequence number is assigned when it is handed to the socket.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub(crate) datagram: Bytes,
    pub(crate) category: ThrottleCategory,
    pub(crate) on_timeout: OnTimeout,
    pub(crate) sequence: u32,
    pub(crate) resend_count: u32,
    pub(crate) sent_at: Instant,
    /// A resend copy of this entry is waiting in the outbound queues.
    pub(crate) resend_queued: bool,
}

impl OutgoingPacket {
    pub(crate) fn new(datagram: Bytes, category: ThrottleCategory, on_timeout: OnTimeout) -> Self {
        OutgoingPacket {
            datagram,
            category,
            on_timeout,
            sequence: 0,
            resend_count: 0,
            sent_at: Instant::now(),
            resend_queued: false,
        }
    }

    pub fn datagram(&self) -> &[u8] {
        &self.datagram
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn resend_count(&self) -> u32 {
        self.resend_count
    }

    pub fn category(&self) -> ThrottleCategory {
        self.category
    }
}

#[derive(Debug)]
pub(crate) enum ResendAction {
    /// Timer re-armed; send this copy again.
    Resend(OutgoingPacket),
    /// Removed from the table; run the message's [`OnTimeout::Callback`].
    Custom(OutgoingPacket),
    /// Removed from the table after exhausting the resend limit.
    GiveUp(OutgoingPacket),
}

/// Smoothed round-trip estimate driving the retransmission timeout.
#[derive(Debug, Clone)]
pub(crate) struct RtoEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RtoEstimator {
    pub(crate) fn new(default_rto: Duration, max_rto: Duration) -> Self {
        RtoEstimator {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: default_rto,
            min_rto: default_rto,
            max_rto,
        }
    }

    pub(crate) fn update(&mut self, sample: Duration) {
        let r = sample.as_secs_f64();
        let (srtt, rttvar) = match self.srtt {
            None => (r, r / 2.0),
            Some(srtt) => {
                let srtt = srtt.as_secs_f64();
                let rttvar =
                    (1.0 - RTT_BETA) * self.rttvar.as_secs_f64() + RTT_BETA * (srtt - r).abs();
                ((1.0 - RTT_ALPHA) * srtt + RTT_ALPHA * r, rttvar)
            }
        };
        self.srtt = Some(Duration::from_secs_f64(srtt));
        self.rttvar = Duration::from_secs_f64(rttvar);
        let rto = srtt + (RTT_K * rttvar).max(CLOCK_GRANULARITY.as_secs_f64());
        self.rto = Duration::from_secs_f64(rto).clamp(self.min_rto, self.max_rto);
    }

    pub(crate) fn rto(&self) -> Duration {
        self.rto
    }

    pub(crate) fn srtt(&self) -> Option<Duration> {
        self.srtt
    }
}

/// Reliable datagrams sent to the peer and not yet acknowledged.
///
/// Entries stay in the table until the peer acknowledges their exact sequence number, the
/// resend limit is exhausted, or their timeout strategy takes them over. Expiry re-arms the
/// timer of an entry instead of removing it, so [`expired`](Self::expired) reports an entry
/// again only after another full RTO. An entry whose resend copy is still queued is not
/// reported at all until [`resend_dequeued`](Self::resend_dequeued) restarts its timer.
pub(crate) struct SentPacketTracker<T: TimeSource = InstantTimeSrc> {
    unacked: HashMap<u32, OutgoingPacket>,
    unacked_bytes: usize,
    estimator: RtoEstimator,
    backoff: ExponentialBackoff,
    /// Number of consecutive timeout events without a genuine acknowledgement.
    backoff_attempt: u32,
    max_resends: Option<u32>,
    time_source: T,
}

impl SentPacketTracker<InstantTimeSrc> {
    pub(crate) fn new(default_rto: Duration, max_rto: Duration, max_resends: Option<u32>) -> Self {
        Self::with_time_source(default_rto, max_rto, max_resends, InstantTimeSrc::new())
    }
}

impl<T: TimeSource> SentPacketTracker<T> {
    pub(crate) fn with_time_source(
        default_rto: Duration,
        max_rto: Duration,
        max_resends: Option<u32>,
        time_source: T,
    ) -> Self {
        SentPacketTracker {
            unacked: HashMap::new(),
            unacked_bytes: 0,
            estimator: RtoEstimator::new(default_rto, max_rto),
            backoff: ExponentialBackoff::new(max_rto),
            backoff_attempt: 0,
            max_resends,
            time_source,
        }
    }

    pub(crate) fn now(&self) -> Instant {
        self.time_source.now()
    }

    /// Registers a reliable datagram that was just handed to the socket.
    pub(crate) fn add(&mut self, mut packet: OutgoingPacket) {
        packet.sent_at = self.time_source.now();
        self.unacked_bytes += packet.datagram.len();
        if let Some(previous) = self.unacked.insert(packet.sequence, packet) {
            tracing::warn!(
                sequence = previous.sequence,
                "Sequence number reused while still unacknowledged"
            );
            self.unacked_bytes = self.unacked_bytes.saturating_sub(previous.datagram.len());
        }
    }

    /// Removes the entry for `sequence`. Returns the round-trip sample taken, if any.
    ///
    /// An entry that was retransmitted, or an ack that arrived in a resent datagram, gives an
    /// ambiguous round trip: it is neither sampled nor allowed to reset the backoff.
    pub(crate) fn acknowledge(&mut self, sequence: u32, from_resent: bool) -> Option<Duration> {
        let packet = self.unacked.remove(&sequence)?;
        self.unacked_bytes = self.unacked_bytes.saturating_sub(packet.datagram.len());
        if from_resent || packet.resend_count > 0 {
            return None;
        }
        self.backoff_attempt = 0;
        let sample = self
            .time_source
            .now()
            .saturating_duration_since(packet.sent_at);
        self.estimator.update(sample);
        Some(sample)
    }

    /// Collects every entry older than the current RTO.
    ///
    /// Entries to be resent are re-armed with the RESENT flag set and returned as copies. When
    /// anything expired the RTO backs off once for the whole call. Entries whose previous
    /// resend copy has not left the queues yet are skipped.
    pub(crate) fn expired(&mut self) -> Vec<ResendAction> {
        let now = self.time_source.now();
        let rto = self.current_rto();
        let mut due: Vec<u32> = self
            .unacked
            .iter()
            .filter(|(_, packet)| {
                !packet.resend_queued && now.saturating_duration_since(packet.sent_at) >= rto
            })
            .map(|(sequence, _)| *sequence)
            .collect();
        if due.is_empty() {
            return Vec::new();
        }
        due.sort_unstable();

        let mut actions = Vec::with_capacity(due.len());
        for sequence in due {
            let Some(packet) = self.unacked.get_mut(&sequence) else {
                continue;
            };
            let exhausted = self
                .max_resends
                .is_some_and(|max| packet.resend_count >= max);
            if exhausted || matches!(packet.on_timeout, OnTimeout::Callback(_)) {
                if let Some(packet) = self.remove(sequence) {
                    actions.push(if exhausted {
                        ResendAction::GiveUp(packet)
                    } else {
                        ResendAction::Custom(packet)
                    });
                }
                continue;
            }
            if packet.resend_count == 0 {
                let mut datagram = BytesMut::from(&packet.datagram[..]);
                set_resent(&mut datagram);
                packet.datagram = datagram.freeze();
            }
            packet.resend_count += 1;
            packet.sent_at = now;
            packet.category = ThrottleCategory::Resend;
            packet.resend_queued = true;
            actions.push(ResendAction::Resend(packet.clone()));
        }
        self.backoff();
        actions
    }

    /// The resend copy of `sequence` left the queues. Its timer restarts now.
    pub(crate) fn resend_dequeued(&mut self, sequence: u32) {
        let now = self.time_source.now();
        if let Some(packet) = self.unacked.get_mut(&sequence) {
            packet.resend_queued = false;
            packet.sent_at = now;
        }
    }

    /// Doubles the effective RTO, up to the configured maximum.
    pub(crate) fn backoff(&mut self) {
        if self.current_rto() < self.backoff.max() {
            self.backoff_attempt += 1;
        }
    }

    /// Estimated RTO with the current backoff applied.
    pub(crate) fn current_rto(&self) -> Duration {
        self.backoff
            .delay(self.estimator.rto(), self.backoff_attempt)
    }

    pub(crate) fn smoothed_rtt(&self) -> Option<Duration> {
        self.estimator.srtt()
    }

    pub(crate) fn len(&self) -> usize {
        self.unacked.len()
    }

    pub(crate) fn is_unacked(&self, sequence: u32) -> bool {
        self.unacked.contains_key(&sequence)
    }

    pub(crate) fn unacked_bytes(&self) -> usize {
        self.unacked_bytes
    }

    pub(crate) fn oldest_unacked(&self) -> Option<u32> {
        self.unacked
            .values()
            .min_by_key(|packet| packet.sent_at)
            .map(|packet| packet.sequence)
    }

    pub(crate) fn clear(&mut self) {
        self.unacked.clear();
        self.unacked_bytes = 0;
    }

    fn remove(&mut self, sequence: u32) -> Option<OutgoingPacket> {
        let packet = self.unacked.remove(&sequence)?;
        self.unacked_bytes = self.unacked_bytes.saturating_sub(packet.datagram.len());
        Some(packet)
    }
}
