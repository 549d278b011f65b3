//! Receive thread and inbox workers.
//!
//! The receive thread decodes every datagram, settles acknowledgements, deduplicates reliable
//! sequence numbers and answers pings itself. Everything else is queued for one of two
//! workers: chat gets its own inbox so a flood of it cannot delay other traffic.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{select, Receiver, TryRecvError};

use super::circuit::Circuit;
use super::message::{self, MessageId};
use super::packet_data::{self, DecodedPacket, MAX_RECV_SIZE};
use super::packet_log::Direction;
use super::received_packet_tracker::ReportResult;
use super::udp_server::{SendOptions, Shared};
use super::{Socket, ThrottleCategory, RECV_POLL_INTERVAL};

/// A decoded application message on its way to the [`MessageHandler`](super::MessageHandler).
#[derive(Debug)]
pub struct InboundMessage {
    pub circuit: Arc<Circuit>,
    pub message_id: MessageId,
    pub sequence: u32,
    pub reliable: bool,
    /// Zero-decoded payload starting with the message id.
    pub payload: Vec<u8>,
    pub body_offset: usize,
}

impl InboundMessage {
    fn new(circuit: Arc<Circuit>, packet: DecodedPacket) -> Self {
        InboundMessage {
            circuit,
            message_id: packet.message_id,
            sequence: packet.header.sequence,
            reliable: packet.header.is_reliable(),
            payload: packet.payload,
            body_offset: packet.body_offset,
        }
    }

    /// Message body after the id.
    pub fn body(&self) -> &[u8] {
        &self.payload[self.body_offset..]
    }
}

pub(crate) fn spawn_receiver<S: Socket>(
    shared: Arc<Shared<S>>,
    cancel: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("lludp-recv".into())
        .spawn(move || receive_loop(shared, cancel))
}

pub(crate) fn spawn_worker<S: Socket>(
    shared: Arc<Shared<S>>,
    name: &str,
    inbox: Receiver<InboundMessage>,
    cancel: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.into())
        .spawn(move || worker_loop(shared, inbox, cancel))
}

fn receive_loop<S: Socket>(shared: Arc<Shared<S>>, cancel: Receiver<()>) {
    tracing::debug!(local_addr = %shared.local_addr, "Receive thread running");
    loop {
        if let Err(TryRecvError::Disconnected) = cancel.try_recv() {
            break;
        }
        let mut buf = shared.packet_pool.acquire();
        buf.resize(MAX_RECV_SIZE, 0);
        match shared.socket.recv_from(&mut buf) {
            Ok((len, from)) => shared.process_datagram(&buf[..len], from),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            // ICMP port unreachable for an earlier send, reported by some platforms
            Err(error) if error.kind() == io::ErrorKind::ConnectionReset => {
                tracing::debug!(%error, "Ignoring connection reset on receive");
            }
            Err(error) => {
                tracing::error!(%error, "Socket receive failed");
                if let Err(TryRecvError::Disconnected) = cancel.try_recv() {
                    break;
                }
                thread::sleep(RECV_POLL_INTERVAL);
            }
        }
        shared.packet_pool.release(buf);
    }
    tracing::debug!(local_addr = %shared.local_addr, "Receive thread stopped");
}

fn worker_loop<S: Socket>(
    shared: Arc<Shared<S>>,
    inbox: Receiver<InboundMessage>,
    cancel: Receiver<()>,
) {
    loop {
        select! {
            recv(inbox) -> message => match message {
                Ok(message) => shared.dispatch(message),
                Err(_) => break,
            },
            recv(cancel) -> _ => break,
        }
    }
}

impl<S: Socket> Shared<S> {
    /// Classifies one raw datagram from `from`.
    pub(crate) fn process_datagram(self: &Arc<Self>, raw: &[u8], from: SocketAddr) {
        self.metrics.record_received(raw.len());
        if let Some(log) = &self.packet_log {
            log.record(Direction::Inbound, from, raw);
        }
        let packet = match packet_data::decode_into(raw, self.message_pool.acquire()) {
            Ok(packet) => packet,
            Err(error) => {
                if self.metrics.record_malformed() {
                    tracing::warn!(
                        %from,
                        %error,
                        total = self.metrics.malformed(),
                        "Dropping malformed datagram"
                    );
                }
                return;
            }
        };

        if let Some(mut pending) = self.pending.get_mut(&from) {
            if packet.message_id == MessageId::USE_CIRCUIT_CODE {
                tracing::trace!(%from, "Handshake repeated while admission is pending");
                drop(pending);
                self.message_pool.release(packet.payload);
            } else if pending.buffered.len() < self.config.pending_buffer_limit {
                pending.buffered.push((packet, raw.len()));
            } else {
                drop(pending);
                self.metrics.record_message_dropped();
                tracing::debug!(
                    %from,
                    id = %packet.message_id,
                    limit = self.config.pending_buffer_limit,
                    "Pending admission buffer full, dropping datagram"
                );
                self.message_pool.release(packet.payload);
            }
            return;
        }

        match self.circuits.lookup(&from) {
            Some(circuit) => self.process_for_circuit(&circuit, packet, raw.len()),
            None if packet.message_id == MessageId::USE_CIRCUIT_CODE => {
                self.begin_admission(from, packet)
            }
            None => {
                self.metrics.record_orphaned();
                tracing::trace!(%from, id = %packet.message_id, "Datagram without circuit");
                self.message_pool.release(packet.payload);
            }
        }
    }

    /// Handles a datagram for an established circuit. Also used to replay datagrams buffered
    /// during admission.
    pub(crate) fn process_for_circuit(
        self: &Arc<Self>,
        circuit: &Arc<Circuit>,
        packet: DecodedPacket,
        len: usize,
    ) {
        if !circuit.is_connected() {
            self.metrics.record_orphaned();
            self.message_pool.release(packet.payload);
            return;
        }
        circuit.touch();

        let from_resent = packet.header.is_resent();
        if !packet.acks.is_empty() {
            let mut sent = circuit.sent.lock();
            for ack in &packet.acks {
                sent.acknowledge(*ack, from_resent);
            }
        }
        if packet.message_id == MessageId::PACKET_ACK {
            let acks = message::parse_packet_ack(packet.body());
            let mut sent = circuit.sent.lock();
            for ack in acks {
                sent.acknowledge(ack, from_resent);
            }
            drop(sent);
            self.message_pool.release(packet.payload);
            return;
        }

        if packet.header.is_reliable() {
            let sequence = packet.header.sequence;
            if circuit.received.report_received_packet(sequence, len) == ReportResult::QueueFull {
                self.flush_acks(circuit, true);
            }
            if !circuit.archive.lock().try_record(sequence) {
                self.metrics.record_duplicate();
                tracing::trace!(
                    circuit_code = circuit.circuit_code(),
                    sequence,
                    "Dropping duplicate datagram"
                );
                self.message_pool.release(packet.payload);
                return;
            }
        }

        match packet.message_id {
            MessageId::START_PING_CHECK => {
                if let Some(&id) = packet.body().first() {
                    let reply = message::complete_ping_check(id);
                    let options = SendOptions::unreliable();
                    if let Err(error) =
                        self.send_message(circuit, &reply, ThrottleCategory::Control, options)
                    {
                        tracing::debug!(
                            circuit_code = circuit.circuit_code(),
                            %error,
                            "Ping reply not sent"
                        );
                    }
                }
            }
            MessageId::COMPLETE_PING_CHECK => {
                if let Some(rtt) = packet.body().first().and_then(|id| circuit.complete_ping(*id)) {
                    tracing::trace!(
                        circuit_code = circuit.circuit_code(),
                        rtt_ms = rtt.as_millis() as u64,
                        "Ping completed"
                    );
                }
            }
            MessageId::USE_CIRCUIT_CODE => {
                tracing::trace!(
                    circuit_code = circuit.circuit_code(),
                    "Handshake repeated on established circuit"
                );
            }
            MessageId::CLOSE_CIRCUIT => {
                self.close_circuit(circuit, "closed by peer");
            }
            id => {
                let inbox = if id.is_chat() {
                    &self.chat_inbox
                } else {
                    &self.inbox
                };
                if let Err(rejected) = inbox.send(InboundMessage::new(circuit.clone(), packet)) {
                    self.metrics.record_message_dropped();
                    self.message_pool.release(rejected.into_inner().payload);
                }
                return;
            }
        }
        self.message_pool.release(packet.payload);
    }

    /// Runs the message handler on a worker thread. Failures are logged and counted.
    fn dispatch(&self, mut message: InboundMessage) {
        let circuit = message.circuit.clone();
        if circuit.is_connected() {
            let handler = &self.collaborators.handler;
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&circuit, &message))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    self.metrics.record_handler_failure();
                    tracing::warn!(
                        circuit_code = circuit.circuit_code(),
                        agent = %circuit.agent_id(),
                        id = %message.message_id,
                        %error,
                        "Message handler failed"
                    );
                }
                Err(_) => {
                    self.metrics.record_handler_failure();
                    tracing::error!(
                        circuit_code = circuit.circuit_code(),
                        agent = %circuit.agent_id(),
                        id = %message.message_id,
                        "Message handler panicked"
                    );
                }
            }
        } else {
            self.metrics.record_message_dropped();
        }
        self.message_pool.release(mem::take(&mut message.payload));
    }
}
