//! Per-client connection state.
//!
//! A circuit is shared between the receive thread (acks, duplicate archive, liveness
//! timestamp), the inbox workers (read-only) and the outbound scheduler (queues, throttle,
//! sequence numbers, unacknowledged table). Fields touched by more than one of them are
//! atomics or sit behind their own uncontended lock, so no lock is ever held across circuits.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::duplicate_archive::DuplicateArchive;
use super::received_packet_tracker::ReceivedPacketTracker;
use super::sent_packet_tracker::{OutgoingPacket, SentPacketTracker};
use super::token_bucket::TokenBucket;
use super::{SessionInfo, ThrottleCategory};
use crate::config::UdpServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum CircuitState {
    Connecting = 0,
    Connected = 1,
    /// Connected, with the longer paused ack timeout.
    Paused = 2,
    Closing = 3,
    Closed = 4,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CircuitState::Connecting,
            1 => CircuitState::Connected,
            2 => CircuitState::Paused,
            3 => CircuitState::Closing,
            _ => CircuitState::Closed,
        }
    }
}

/// Scene bucket at the root, one aggregate bucket per circuit, one bucket per category.
struct CircuitThrottle {
    categories: [TokenBucket; ThrottleCategory::COUNT],
}

impl CircuitThrottle {
    fn new(config: &UdpServerConfig, scene: &Arc<TokenBucket>) -> Self {
        let aggregate = Arc::new(TokenBucket::with_parent(
            config.burst_capacity(config.client_throttle),
            config.client_throttle,
            scene.clone(),
        ));
        let categories = ThrottleCategory::ALL.map(|category| {
            let rate = config.throttle_rates.rate(category).unwrap_or(0);
            TokenBucket::with_parent(config.burst_capacity(rate), rate, aggregate.clone())
        });
        CircuitThrottle { categories }
    }
}

pub struct Circuit {
    circuit_code: u32,
    remote: SocketAddr,
    session_id: Uuid,
    agent_id: Uuid,
    state: AtomicU8,
    created_at: Instant,
    /// Millis since `created_at` of the last datagram from the peer.
    last_received_ms: AtomicU64,
    next_sequence: AtomicU32,

    pub(crate) received: ReceivedPacketTracker,
    pub(crate) sent: Mutex<SentPacketTracker>,
    pub(crate) archive: Mutex<DuplicateArchive>,

    /// `None` when throttling is disabled.
    throttle: Option<CircuitThrottle>,
    queues: [SegQueue<OutgoingPacket>; ThrottleCategory::COUNT],
    /// Packets dequeued but refused by the throttle, retried before their queue.
    deferred: Mutex<[Option<OutgoingPacket>; ThrottleCategory::COUNT]>,

    ping: Mutex<PingState>,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    resent: AtomicU64,
}

#[derive(Default)]
struct PingState {
    next_id: u8,
    outstanding: Option<(u8, Instant)>,
    last_rtt: Option<Duration>,
}

impl Circuit {
    pub(crate) fn new(
        session: SessionInfo,
        remote: SocketAddr,
        config: &UdpServerConfig,
        scene: &Arc<TokenBucket>,
    ) -> Self {
        Circuit {
            circuit_code: session.circuit_code,
            remote,
            session_id: session.session_id,
            agent_id: session.agent_id,
            state: AtomicU8::new(CircuitState::Connecting as u8),
            created_at: Instant::now(),
            last_received_ms: AtomicU64::new(0),
            next_sequence: AtomicU32::new(0),
            received: ReceivedPacketTracker::new(),
            sent: Mutex::new(SentPacketTracker::new(
                config.default_rto(),
                config.max_rto(),
                config.max_resends,
            )),
            archive: Mutex::new(DuplicateArchive::new()),
            throttle: (!config.disable_throttles).then(|| CircuitThrottle::new(config, scene)),
            queues: Default::default(),
            deferred: Mutex::new(Default::default()),
            ping: Mutex::new(PingState::default()),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            resent: AtomicU64::new(0),
        }
    }

    pub fn circuit_code(&self) -> u32 {
        self.circuit_code
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether traffic for this circuit should still be processed.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            CircuitState::Connected | CircuitState::Paused
        )
    }

    pub(crate) fn mark_connected(&self) {
        let _ = self.state.compare_exchange(
            CircuitState::Connecting as u8,
            CircuitState::Connected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Switches between the normal and the paused ack timeout. Returns `false` if the circuit
    /// is not connected.
    pub(crate) fn set_paused(&self, paused: bool) -> bool {
        let (from, to) = if paused {
            (CircuitState::Connected, CircuitState::Paused)
        } else {
            (CircuitState::Paused, CircuitState::Connected)
        };
        match self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == to as u8,
        }
    }

    /// Moves the circuit to `Closing`. Only the first caller gets `true`.
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < CircuitState::Closing as u8).then_some(CircuitState::Closing as u8)
            })
            .is_ok()
    }

    /// Final state; queued and unacknowledged datagrams are discarded.
    pub(crate) fn mark_closed(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.drain_queues();
        self.sent.lock().clear();
    }

    pub(crate) fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_received_ms.fetch_max(elapsed, Ordering::AcqRel);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last datagram from the peer, or since creation.
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        let last = self.created_at
            + Duration::from_millis(self.last_received_ms.load(Ordering::Acquire));
        now.saturating_duration_since(last)
    }

    pub(crate) fn ack_timeout(&self, config: &UdpServerConfig) -> Duration {
        if self.state() == CircuitState::Paused {
            config.paused_ack_timeout()
        } else {
            config.ack_timeout()
        }
    }

    /// Next outgoing sequence number. Sequence numbers start at 1.
    pub(crate) fn next_sequence(&self) -> u32 {
        self.next_sequence
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    pub(crate) fn enqueue(&self, packet: OutgoingPacket) {
        self.queues[packet.category.index()].push(packet);
    }

    /// Next packet of `category`, a previously deferred one first.
    pub(crate) fn dequeue(&self, category: ThrottleCategory) -> Option<OutgoingPacket> {
        if let Some(packet) = self.deferred.lock()[category.index()].take() {
            return Some(packet);
        }
        self.queues[category.index()].pop()
    }

    pub(crate) fn defer(&self, packet: OutgoingPacket) {
        let slot = &mut self.deferred.lock()[packet.category.index()];
        debug_assert!(slot.is_none());
        *slot = Some(packet);
    }

    /// Withdraws `bytes` from the category bucket and all its ancestors.
    pub(crate) fn try_consume(&self, category: ThrottleCategory, bytes: usize) -> bool {
        match &self.throttle {
            Some(throttle) => throttle.categories[category.index()].try_consume(bytes),
            None => true,
        }
    }

    pub(crate) fn queued(&self, category: ThrottleCategory) -> usize {
        let deferred = self.deferred.lock()[category.index()].is_some() as usize;
        self.queues[category.index()].len() + deferred
    }

    pub(crate) fn queued_total(&self) -> usize {
        ThrottleCategory::ALL
            .iter()
            .map(|category| self.queued(*category))
            .sum()
    }

    fn drain_queues(&self) {
        *self.deferred.lock() = Default::default();
        for queue in &self.queues {
            while queue.pop().is_some() {}
        }
    }

    pub(crate) fn record_sent(&self, resent: bool) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        if resent {
            self.resent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Allocates the id of a new ping and remembers when it was sent. An unanswered previous
    /// ping is forgotten.
    pub(crate) fn start_ping(&self) -> u8 {
        let mut ping = self.ping.lock();
        let id = ping.next_id;
        ping.next_id = ping.next_id.wrapping_add(1);
        ping.outstanding = Some((id, Instant::now()));
        id
    }

    /// Matches a ping reply; returns the measured round trip.
    pub(crate) fn complete_ping(&self, id: u8) -> Option<Duration> {
        let mut ping = self.ping.lock();
        match ping.outstanding {
            Some((outstanding, sent_at)) if outstanding == id => {
                let rtt = sent_at.elapsed();
                ping.outstanding = None;
                ping.last_rtt = Some(rtt);
                Some(rtt)
            }
            _ => None,
        }
    }

    pub fn stats(&self) -> CircuitStats {
        let (unacked, unacked_bytes, rto, srtt) = {
            let sent = self.sent.lock();
            (
                sent.len(),
                sent.unacked_bytes(),
                sent.current_rto(),
                sent.smoothed_rtt(),
            )
        };
        CircuitStats {
            circuit_code: self.circuit_code,
            remote: self.remote,
            agent_id: self.agent_id,
            state: self.state(),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            resent: self.resent.load(Ordering::Relaxed),
            unacked,
            unacked_bytes,
            pending_acks: self.received.pending(),
            rto_ms: rto.as_millis() as u64,
            srtt_ms: srtt.map(|d| d.as_millis() as u64),
            ping_rtt_ms: self.ping.lock().last_rtt.map(|d| d.as_millis() as u64),
            queue_depths: ThrottleCategory::ALL
                .iter()
                .map(|category| (*category, self.queued(*category)))
                .collect(),
        }
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("circuit_code", &self.circuit_code)
            .field("remote", &self.remote)
            .field("agent_id", &self.agent_id)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub circuit_code: u32,
    pub remote: SocketAddr,
    pub agent_id: Uuid,
    pub state: CircuitState,
    pub packets_in: u64,
    pub packets_out: u64,
    pub resent: u64,
    pub unacked: usize,
    pub unacked_bytes: usize,
    pub pending_acks: usize,
    pub rto_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srtt_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_rtt_ms: Option<u64>,
    pub queue_depths: BTreeMap<ThrottleCategory, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sent_packet_tracker::OnTimeout;
    use bytes::Bytes;

    fn session() -> SessionInfo {
        SessionInfo {
            circuit_code: 99,
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        }
    }

    fn circuit(config: &UdpServerConfig) -> Circuit {
        let scene = Arc::new(TokenBucket::new(
            config.burst_capacity(config.scene_throttle),
            config.scene_throttle,
        ));
        Circuit::new(session(), "127.0.0.1:5000".parse().unwrap(), config, &scene)
    }

    fn packet(category: ThrottleCategory, len: usize) -> OutgoingPacket {
        OutgoingPacket {
            datagram: Bytes::from(vec![0; len]),
            category,
            on_timeout: OnTimeout::Resend,
            sequence: 0,
            resend_count: 0,
            sent_at: Instant::now(),
            resend_queued: false,
        }
    }

    #[test]
    fn state_transitions() {
        let circuit = circuit(&UdpServerConfig::default());
        assert_eq!(circuit.state(), CircuitState::Connecting);
        assert!(!circuit.is_connected());
        circuit.mark_connected();
        assert!(circuit.is_connected());
        assert!(circuit.set_paused(true));
        assert_eq!(circuit.state(), CircuitState::Paused);
        assert!(circuit.is_connected());
        assert!(circuit.set_paused(false));
        assert!(circuit.begin_close());
        assert!(!circuit.begin_close());
        assert!(!circuit.is_connected());
        assert!(!circuit.set_paused(true));
        circuit.mark_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    fn paused_circuit_uses_longer_timeout() {
        let config = UdpServerConfig::default();
        let circuit = circuit(&config);
        circuit.mark_connected();
        assert_eq!(circuit.ack_timeout(&config), config.ack_timeout());
        circuit.set_paused(true);
        assert_eq!(circuit.ack_timeout(&config), config.paused_ack_timeout());
    }

    #[test]
    fn sequence_numbers_start_at_one() {
        let circuit = circuit(&UdpServerConfig::default());
        assert_eq!(circuit.next_sequence(), 1);
        assert_eq!(circuit.next_sequence(), 2);
    }

    #[test]
    fn deferred_packet_comes_first() {
        let circuit = circuit(&UdpServerConfig::default());
        circuit.enqueue(packet(ThrottleCategory::Task, 10));
        circuit.enqueue(packet(ThrottleCategory::Task, 20));
        let first = circuit.dequeue(ThrottleCategory::Task).unwrap();
        assert_eq!(first.datagram.len(), 10);
        circuit.defer(first);
        assert_eq!(circuit.queued(ThrottleCategory::Task), 2);
        assert_eq!(circuit.dequeue(ThrottleCategory::Task).unwrap().datagram.len(), 10);
        assert_eq!(circuit.dequeue(ThrottleCategory::Task).unwrap().datagram.len(), 20);
        assert!(circuit.dequeue(ThrottleCategory::Task).is_none());
    }

    #[test]
    fn category_throttle_limits_withdrawals() {
        let config = UdpServerConfig {
            throttle_rates: crate::config::ThrottleRates {
                texture: 1_000,
                ..Default::default()
            },
            ..Default::default()
        };
        let circuit = circuit(&config);
        // capacity is one MTU at this rate
        assert!(circuit.try_consume(ThrottleCategory::Texture, 1_400));
        assert!(!circuit.try_consume(ThrottleCategory::Texture, 1_400));
        assert!(circuit.try_consume(ThrottleCategory::Control, 1_400));
    }

    #[test]
    fn disabled_throttle_always_admits() {
        let config = UdpServerConfig {
            disable_throttles: true,
            ..Default::default()
        };
        let circuit = circuit(&config);
        for _ in 0..100 {
            assert!(circuit.try_consume(ThrottleCategory::Asset, 1_400));
        }
    }

    #[test]
    fn ping_round_trip() {
        let circuit = circuit(&UdpServerConfig::default());
        let first = circuit.start_ping();
        let second = circuit.start_ping();
        assert_ne!(first, second);
        assert!(circuit.complete_ping(first).is_none());
        assert!(circuit.complete_ping(second).is_some());
        assert!(circuit.stats().ping_rtt_ms.is_some());
    }

    #[test]
    fn close_discards_queues() {
        let circuit = circuit(&UdpServerConfig::default());
        circuit.enqueue(packet(ThrottleCategory::State, 10));
        circuit.enqueue(packet(ThrottleCategory::Asset, 10));
        assert_eq!(circuit.queued_total(), 2);
        circuit.begin_close();
        circuit.mark_closed();
        assert_eq!(circuit.queued_total(), 0);
    }
}
