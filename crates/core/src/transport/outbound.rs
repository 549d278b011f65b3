//! Outbound scheduler.
//!
//! One thread walks every connected circuit per tick. Timed duties run on their own intervals:
//! liveness checks and retransmission every 100 ms, ack-only flushes every 500 ms, pings every
//! 5 s. Every tick each circuit's category queues are drained for as long as its token buckets
//! admit the bytes. Sequence numbers are assigned right before a datagram reaches the socket,
//! so a retransmission keeps the number it was first sent with.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};

use super::circuit::Circuit;
use super::message::{self, Message};
use super::packet_data::{
    ack_capacity, append_acks, build_datagram, flags_of, set_sequence, PacketFlags, HEADER_LEN,
    MAX_APPENDED_ACKS, MTU,
};
use super::packet_log::Direction;
use super::sent_packet_tracker::{OnTimeout, OutgoingPacket, ResendAction};
use super::udp_server::{SendOptions, Shared};
use super::{Socket, ThrottleCategory, TransportError};

const RESEND_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const ACK_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const PING_INTERVAL: Duration = Duration::from_millis(5000);

/// Sleep when no circuit is connected.
const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// Sleep after a tick that sent nothing.
const NOTHING_SENT_SLEEP: Duration = Duration::from_millis(1);

/// Control traffic first, then retransmissions, then the bulk classes.
const DRAIN_ORDER: [ThrottleCategory; ThrottleCategory::COUNT] = [
    ThrottleCategory::Control,
    ThrottleCategory::Resend,
    ThrottleCategory::State,
    ThrottleCategory::Task,
    ThrottleCategory::Texture,
    ThrottleCategory::Asset,
];

pub(crate) fn spawn_scheduler<S: Socket>(
    shared: Arc<Shared<S>>,
    cancel: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("lludp-outbound".into())
        .spawn(move || Scheduler::new(shared).run(cancel))
}

pub(crate) struct Scheduler<S> {
    shared: Arc<Shared<S>>,
    last_resend_check: Instant,
    last_ack_flush: Instant,
    last_ping: Instant,
}

impl<S: Socket> Scheduler<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>) -> Self {
        let now = Instant::now();
        Scheduler {
            shared,
            last_resend_check: now,
            last_ack_flush: now,
            last_ping: now,
        }
    }

    fn run(mut self, cancel: Receiver<()>) {
        tracing::debug!(local_addr = %self.shared.local_addr, "Outbound scheduler running");
        loop {
            if let Err(TryRecvError::Disconnected) = cancel.try_recv() {
                break;
            }
            let sleep = if self.tick(Instant::now()) > 0 {
                None
            } else if self.shared.circuits.is_empty() {
                Some(IDLE_SLEEP)
            } else {
                Some(NOTHING_SENT_SLEEP)
            };
            if let Some(sleep) = sleep {
                if let Err(RecvTimeoutError::Disconnected) = cancel.recv_timeout(sleep) {
                    break;
                }
            }
        }
        tracing::debug!(local_addr = %self.shared.local_addr, "Outbound scheduler stopped");
    }

    /// One pass over all circuits. Returns the number of datagrams sent.
    pub(crate) fn tick(&mut self, now: Instant) -> usize {
        let resend_due = due(&mut self.last_resend_check, now, RESEND_CHECK_INTERVAL);
        let ack_due = due(&mut self.last_ack_flush, now, ACK_FLUSH_INTERVAL);
        let ping_due = due(&mut self.last_ping, now, PING_INTERVAL);

        if resend_due {
            self.shared.expire_pending_admissions(now);
        }

        let mut sent = 0;
        for circuit in self.shared.circuits.snapshot() {
            if !circuit.is_connected() {
                continue;
            }
            if resend_due {
                if self.check_liveness(&circuit, now) {
                    continue;
                }
                self.shared.resend_expired(&circuit);
            }
            if ack_due {
                self.shared.flush_acks(&circuit, false);
            }
            if ping_due {
                self.shared.send_ping(&circuit);
            }
            sent += self.shared.drain(&circuit);
        }
        sent
    }

    /// Closes the circuit if the peer has been silent past its ack timeout. Returns whether it
    /// timed out.
    fn check_liveness(&self, circuit: &Arc<Circuit>, now: Instant) -> bool {
        let idle = circuit.idle_for(now);
        let timeout = circuit.ack_timeout(&self.shared.config);
        if idle <= timeout {
            return false;
        }
        if !circuit.begin_close() {
            return true;
        }
        tracing::warn!(
            circuit_code = circuit.circuit_code(),
            agent = %circuit.agent_id(),
            remote = %circuit.remote(),
            idle_ms = idle.as_millis() as u64,
            "Circuit timed out"
        );
        self.shared.metrics.record_timeout();

        let job = {
            let shared = self.shared.clone();
            let circuit = circuit.clone();
            move || shared.finish_timeout(&circuit)
        };
        if let Err(error) = self.shared.tasks.submit("timeout-disconnect", job) {
            tracing::debug!(%error, "Disconnecting timed out circuit inline");
            self.shared.finish_timeout(circuit);
        }
        true
    }
}

fn due(last: &mut Instant, now: Instant, interval: Duration) -> bool {
    if now.saturating_duration_since(*last) >= interval {
        *last = now;
        true
    } else {
        false
    }
}

impl<S: Socket> Shared<S> {
    /// Frames `message` (splitting it if needed) and queues the datagrams, or sends them right
    /// away when throttling is disabled.
    pub(crate) fn send_message(
        &self,
        circuit: &Circuit,
        message: &Message,
        category: ThrottleCategory,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        if !circuit.is_connected() {
            return Err(TransportError::CircuitClosed(circuit.remote()));
        }
        let max_payload = MTU - HEADER_LEN - options.extra_header.len();
        let payloads = message.split(max_payload)?;
        let mut flags = options.flags();
        if payloads.len() > 1 {
            tracing::trace!(
                circuit_code = circuit.circuit_code(),
                id = %message.id(),
                fragments = payloads.len(),
                "Split oversized message"
            );
            flags |= PacketFlags::RELIABLE;
        }
        for payload in payloads {
            let datagram = build_datagram(flags, &options.extra_header, &payload);
            let packet = OutgoingPacket::new(datagram.freeze(), category, options.on_timeout.clone());
            if self.config.disable_throttles {
                self.finalize_and_send(circuit, packet, true);
            } else {
                circuit.enqueue(packet);
            }
        }
        Ok(())
    }

    /// Sends an unreliable message from the calling thread, skipping queue and throttle.
    pub(crate) fn send_immediate(&self, circuit: &Circuit, message: &Message) {
        let datagram = build_datagram(PacketFlags::empty(), &[], &message.to_bytes());
        let packet = OutgoingPacket::new(
            datagram.freeze(),
            ThrottleCategory::Control,
            OnTimeout::Resend,
        );
        self.finalize_and_send(circuit, packet, false);
    }

    /// Assigns the sequence number, piggybacks pending acks when there is room, registers
    /// reliable datagrams and hands the bytes to the socket.
    ///
    /// Retransmissions go out unchanged and restart their entry's timer.
    pub(crate) fn finalize_and_send(
        &self,
        circuit: &Circuit,
        mut packet: OutgoingPacket,
        piggyback: bool,
    ) -> bool {
        if packet.resend_count > 0 {
            circuit.sent.lock().resend_dequeued(packet.sequence);
            let sent = self.transmit(circuit.remote(), &packet.datagram);
            if sent {
                circuit.record_sent(true);
                self.metrics.record_resent();
            }
            return sent;
        }

        let mut datagram = BytesMut::from(&packet.datagram[..]);
        let flags = flags_of(&datagram);
        if piggyback && !flags.intersects(PacketFlags::ZEROCODED | PacketFlags::RESENT) {
            let room = ack_capacity(&datagram).min(MAX_APPENDED_ACKS);
            if room > 0 {
                let acks = circuit.received.dequeue_up_to(room);
                if !acks.is_empty() {
                    append_acks(&mut datagram, &acks);
                }
            }
        }
        let sequence = circuit.next_sequence();
        set_sequence(&mut datagram, sequence);
        packet.sequence = sequence;
        packet.datagram = datagram.freeze();

        if flags.contains(PacketFlags::RELIABLE) {
            circuit.sent.lock().add(packet.clone());
        }
        let sent = self.transmit(circuit.remote(), &packet.datagram);
        if sent {
            circuit.record_sent(false);
        }
        sent
    }

    fn transmit(&self, remote: SocketAddr, datagram: &[u8]) -> bool {
        match self.socket.send_to(datagram, remote) {
            Ok(_) => {
                self.metrics.record_sent(datagram.len());
                if let Some(log) = &self.packet_log {
                    log.record(Direction::Outbound, remote, datagram);
                }
                true
            }
            Err(error) => {
                self.metrics.record_send_failure();
                tracing::warn!(%remote, %error, len = datagram.len(), "Failed sending datagram");
                false
            }
        }
    }

    /// Sends queued datagrams while the throttle admits them. Returns how many went out.
    pub(crate) fn drain(&self, circuit: &Circuit) -> usize {
        let mut sent = 0;
        for category in DRAIN_ORDER {
            while let Some(packet) = circuit.dequeue(category) {
                if !circuit.is_connected() {
                    return sent;
                }
                // acknowledged while waiting in the resend queue
                if packet.resend_count > 0 && !circuit.sent.lock().is_unacked(packet.sequence) {
                    continue;
                }
                if !circuit.try_consume(category, packet.datagram.len()) {
                    circuit.defer(packet);
                    break;
                }
                if self.finalize_and_send(circuit, packet, true) {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Handles every unacknowledged datagram older than the circuit's RTO.
    pub(crate) fn resend_expired(&self, circuit: &Circuit) {
        let actions = circuit.sent.lock().expired();
        for action in actions {
            match action {
                ResendAction::Resend(packet) => {
                    tracing::trace!(
                        circuit_code = circuit.circuit_code(),
                        sequence = packet.sequence,
                        attempt = packet.resend_count,
                        "Resending unacknowledged datagram"
                    );
                    circuit.enqueue(packet);
                }
                ResendAction::Custom(packet) => {
                    if let OnTimeout::Callback(callback) = &packet.on_timeout {
                        let run = || callback(packet.sequence, &packet.datagram);
                        if catch_unwind(AssertUnwindSafe(run)).is_err() {
                            tracing::error!(
                                circuit_code = circuit.circuit_code(),
                                sequence = packet.sequence,
                                "Timeout callback panicked"
                            );
                        }
                    }
                }
                ResendAction::GiveUp(packet) => {
                    tracing::warn!(
                        circuit_code = circuit.circuit_code(),
                        agent = %circuit.agent_id(),
                        sequence = packet.sequence,
                        resends = packet.resend_count,
                        "Dropping reliable datagram after exhausting resends"
                    );
                    self.metrics.record_message_dropped();
                }
            }
        }
    }

    /// Moves pending acks into dedicated ack datagrams. `immediate` sends them from the
    /// calling thread instead of queueing them.
    pub(crate) fn flush_acks(&self, circuit: &Circuit, immediate: bool) {
        loop {
            let acks = circuit.received.dequeue_up_to(MAX_APPENDED_ACKS);
            if acks.is_empty() {
                break;
            }
            let ack = message::packet_ack(&acks);
            if immediate {
                self.send_immediate(circuit, &ack);
            } else {
                let datagram = build_datagram(PacketFlags::empty(), &[], &ack.to_bytes());
                circuit.enqueue(OutgoingPacket::new(
                    datagram.freeze(),
                    ThrottleCategory::Control,
                    OnTimeout::Resend,
                ));
            }
        }
    }

    pub(crate) fn send_ping(&self, circuit: &Circuit) {
        let id = circuit.start_ping();
        let oldest_unacked = circuit.sent.lock().oldest_unacked().unwrap_or(0);
        let ping = message::start_ping_check(id, oldest_unacked);
        if let Err(error) =
            self.send_message(circuit, &ping, ThrottleCategory::Control, SendOptions::unreliable())
        {
            tracing::debug!(circuit_code = circuit.circuit_code(), %error, "Ping not sent");
        }
    }

    /// Second half of a liveness timeout, run on the task engine.
    pub(crate) fn finish_timeout(&self, circuit: &Arc<Circuit>) {
        self.circuits.remove(circuit);
        circuit.mark_closed();
        self.collaborators.lifecycle.on_timeout(circuit);
        self.collaborators.lifecycle.on_closed(circuit);
        tracing::info!(
            circuit_code = circuit.circuit_code(),
            agent = %circuit.agent_id(),
            remote = %circuit.remote(),
            "Timed out circuit removed"
        );
    }

    /// Forgets handshakes whose authorization did not finish in time, with everything buffered
    /// for them.
    pub(crate) fn expire_pending_admissions(&self, now: Instant) {
        self.pending.retain(|remote, pending| {
            if pending.expires_at > now {
                return true;
            }
            tracing::warn!(
                %remote,
                buffered = pending.buffered.len(),
                "Pending admission expired"
            );
            for (mut packet, _) in pending.buffered.drain(..) {
                self.message_pool.release(mem::take(&mut packet.payload));
            }
            false
        });
    }
}
