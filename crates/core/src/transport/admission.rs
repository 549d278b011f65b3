//! Circuit handshake.
//!
//! The first `UseCircuitCode` from an unknown endpoint registers it as pending and hands the
//! authorization check to the task engine, so the receive thread never waits on it. Datagrams
//! arriving from a pending endpoint are buffered. Once the check succeeds the circuit is
//! created, the buffered datagrams are replayed in arrival order and the handshake is acked
//! right away; only then is the pending entry dropped.

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;

use super::circuit::Circuit;
use super::message::{self, UseCircuitCode};
use super::packet_data::DecodedPacket;
use super::udp_server::Shared;
use super::{SessionInfo, Socket};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("circuit code {circuit_code} was not authorized")]
    Denied { circuit_code: u32 },
    #[error(transparent)]
    Authorizer(#[from] anyhow::Error),
    #[error("no session registered for circuit code {0}")]
    MissingSession(u32),
    #[error("admission of {0} expired before authorization finished")]
    Expired(SocketAddr),
}

/// An endpoint whose handshake is being authorized.
pub(crate) struct PendingAdmission {
    /// Datagrams received meanwhile, with their raw length.
    pub(crate) buffered: Vec<(DecodedPacket, usize)>,
    pub(crate) expires_at: Instant,
}

impl<S: Socket> Shared<S> {
    pub(crate) fn begin_admission(self: &Arc<Self>, from: SocketAddr, packet: DecodedPacket) {
        let handshake = UseCircuitCode::parse(packet.body());
        let sequence = packet.header.sequence;
        self.message_pool.release(packet.payload);
        let Some(handshake) = handshake else {
            if self.metrics.record_malformed() {
                tracing::warn!(%from, "Dropping truncated circuit handshake");
            }
            return;
        };

        match self.pending.entry(from) {
            Entry::Occupied(_) => return,
            Entry::Vacant(entry) => {
                entry.insert(PendingAdmission {
                    buffered: Vec::new(),
                    expires_at: Instant::now() + self.config.pending_admission_timeout(),
                });
            }
        }
        tracing::debug!(
            %from,
            circuit_code = handshake.circuit_code,
            agent = %handshake.agent_id,
            "Circuit handshake received"
        );

        let shared = self.clone();
        let job = move || shared.complete_admission(from, handshake, sequence);
        if let Err(error) = self.tasks.submit("admission", job) {
            tracing::warn!(%from, %error, "Could not schedule admission");
            self.discard_pending(&from);
        }
    }

    fn complete_admission(
        self: &Arc<Self>,
        from: SocketAddr,
        handshake: UseCircuitCode,
        sequence: u32,
    ) {
        match self.admit(from, handshake, sequence) {
            Ok(circuit) => {
                self.metrics.record_admission(true);
                tracing::info!(
                    circuit_code = circuit.circuit_code(),
                    agent = %circuit.agent_id(),
                    remote = %from,
                    "Circuit admitted"
                );
            }
            Err(error) => {
                self.metrics.record_admission(false);
                let agent = handshake.agent_id;
                if let AdmissionError::Denied { .. } = error {
                    tracing::info!(%from, %agent, %error, "Admission denied");
                } else {
                    tracing::warn!(%from, %agent, %error, "Admission failed");
                }
                self.discard_pending(&from);
            }
        }
    }

    /// Authorizes the handshake and brings the circuit up.
    fn admit(
        self: &Arc<Self>,
        from: SocketAddr,
        handshake: UseCircuitCode,
        sequence: u32,
    ) -> Result<Arc<Circuit>, AdmissionError> {
        let authorized = self.collaborators.authorizer.authorize(
            handshake.session_id,
            handshake.agent_id,
            handshake.circuit_code,
        )?;
        if !authorized {
            return Err(AdmissionError::Denied {
                circuit_code: handshake.circuit_code,
            });
        }
        if !self.pending.contains_key(&from) {
            return Err(AdmissionError::Expired(from));
        }

        let claimed = SessionInfo {
            circuit_code: handshake.circuit_code,
            session_id: handshake.session_id,
            agent_id: handshake.agent_id,
        };
        let circuit = Arc::new(Circuit::new(claimed, from, &self.config, &self.scene_throttle));
        // an authorized code the registry knows nothing about is inconsistent; tear down
        if self.collaborators.sessions.session(handshake.circuit_code).is_none() {
            circuit.begin_close();
            circuit.mark_closed();
            return Err(AdmissionError::MissingSession(handshake.circuit_code));
        }

        circuit.mark_connected();
        for displaced in self.circuits.insert(circuit.clone()) {
            tracing::info!(
                circuit_code = displaced.circuit_code(),
                agent = %displaced.agent_id(),
                remote = %displaced.remote(),
                "Replacing existing circuit"
            );
            if displaced.begin_close() {
                displaced.mark_closed();
                self.collaborators.lifecycle.on_closed(&displaced);
            }
        }
        circuit.archive.lock().try_record(sequence);
        circuit.touch();

        self.replay_pending(&circuit, from);
        self.send_immediate(&circuit, &message::packet_ack(&[sequence]));
        // datagrams may still have been buffered while replaying
        while self
            .pending
            .remove_if(&from, |_, pending| pending.buffered.is_empty())
            .is_none()
        {
            if !self.replay_pending(&circuit, from) {
                break;
            }
        }
        Ok(circuit)
    }

    /// Feeds everything buffered for `from` through the circuit path. Returns `false` if the
    /// pending entry is gone.
    fn replay_pending(self: &Arc<Self>, circuit: &Arc<Circuit>, from: SocketAddr) -> bool {
        loop {
            let batch = match self.pending.get_mut(&from) {
                Some(mut pending) => mem::take(&mut pending.buffered),
                None => return false,
            };
            if batch.is_empty() {
                return true;
            }
            tracing::trace!(%from, count = batch.len(), "Replaying buffered datagrams");
            for (packet, len) in batch {
                self.process_for_circuit(circuit, packet, len);
            }
        }
    }

    fn discard_pending(&self, from: &SocketAddr) {
        if let Some((_, pending)) = self.pending.remove(from) {
            for (packet, _) in pending.buffered {
                self.message_pool.release(packet.payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::config::UdpServerConfig;
    use crate::transport::message::{Message, MessageId};
    use crate::transport::packet_data::{build_datagram, set_sequence, PacketFlags};
    use crate::transport::udp_server::test_support::*;
    use crate::transport::Authorizer;

    fn handshake_datagram(session: &SessionInfo, sequence: u32) -> Vec<u8> {
        let handshake = UseCircuitCode {
            circuit_code: session.circuit_code,
            session_id: session.session_id,
            agent_id: session.agent_id,
        };
        let mut datagram =
            build_datagram(PacketFlags::RELIABLE, &[], &handshake.to_message().to_bytes());
        set_sequence(&mut datagram, sequence);
        datagram.to_vec()
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// Blocks authorization until released, to hold an endpoint in the pending state.
    struct GatedAuthorizer {
        gate: crossbeam::channel::Receiver<bool>,
    }

    impl Authorizer for GatedAuthorizer {
        fn authorize(&self, _: Uuid, _: Uuid, _: u32) -> anyhow::Result<bool> {
            Ok(self.gate.recv_timeout(Duration::from_secs(5))?)
        }
    }

    #[test_log::test]
    fn authorized_handshake_creates_circuit_and_acks() -> testresult::TestResult {
        let harness = Harness::new(UdpServerConfig::default())?;
        let session = harness.session(100);
        let shared = harness.server.shared();
        let from = harness.client.local_addr()?;
        shared.process_datagram(&handshake_datagram(&session, 1), from);

        assert!(wait_for(|| harness.server.circuit(&from).is_some()));
        let ack = harness.recv_from_server()?;
        assert_eq!(ack.message_id, MessageId::PACKET_ACK);
        assert_eq!(message::parse_packet_ack(ack.body()), vec![1]);
        assert!(wait_for(|| shared.pending.is_empty()));
        assert_eq!(harness.server.metrics().admissions_completed, 1);

        let circuit = harness.server.circuit(&from).ok_or("no circuit")?;
        assert_eq!(circuit.agent_id(), session.agent_id);
        // a retransmitted handshake is a duplicate now
        shared.process_datagram(&handshake_datagram(&session, 1), from);
        assert_eq!(shared.metrics.snapshot().duplicates, 1);
        Ok(())
    }

    #[test_log::test]
    fn denied_handshake_leaves_no_state() -> testresult::TestResult {
        let harness = Harness::new(UdpServerConfig::default())?;
        let unknown = SessionInfo {
            circuit_code: 101,
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        };
        let shared = harness.server.shared();
        let from = harness.client.local_addr()?;
        shared.process_datagram(&handshake_datagram(&unknown, 1), from);

        assert!(wait_for(|| harness.server.metrics().admissions_denied == 1));
        assert!(wait_for(|| shared.pending.is_empty()));
        assert!(harness.server.circuit(&from).is_none());
        // fail closed: nothing is sent back
        assert!(harness.try_recv_from_server().is_err());
        Ok(())
    }

    #[test_log::test]
    fn missing_session_tears_circuit_down() -> testresult::TestResult {
        struct AllowAll;
        impl Authorizer for AllowAll {
            fn authorize(&self, _: Uuid, _: Uuid, _: u32) -> anyhow::Result<bool> {
                Ok(true)
            }
        }
        let harness = Harness::custom(UdpServerConfig::default(), Some(Arc::new(AllowAll)), None)?;
        let unregistered = SessionInfo {
            circuit_code: 102,
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        };
        let shared = harness.server.shared();
        let from = harness.client.local_addr()?;
        shared.process_datagram(&handshake_datagram(&unregistered, 1), from);

        assert!(wait_for(|| harness.server.metrics().admissions_denied == 1));
        assert!(harness.server.circuit(&from).is_none());
        assert!(shared.pending.is_empty());
        Ok(())
    }

    #[test_log::test]
    fn datagrams_buffered_while_pending_replay_in_order() -> testresult::TestResult {
        let (open, gate) = crossbeam::channel::bounded(1);
        let authorizer = Arc::new(GatedAuthorizer { gate });
        let harness = Harness::custom(UdpServerConfig::default(), Some(authorizer), None)?;
        let session = harness.session(103);
        let shared = harness.server.shared();
        let from = harness.client.local_addr()?;

        shared.process_datagram(&handshake_datagram(&session, 1), from);
        // repeated handshake while pending is ignored
        shared.process_datagram(&handshake_datagram(&session, 1), from);
        for (sequence, tag) in [(2, b'A'), (3, b'B'), (4, b'C')] {
            let mut datagram = build_datagram(
                PacketFlags::RELIABLE,
                &[],
                &Message::new(MessageId::Low(700), vec![tag]).to_bytes(),
            );
            set_sequence(&mut datagram, sequence);
            shared.process_datagram(&datagram, from);
        }
        assert_eq!(shared.pending.get(&from).map(|p| p.buffered.len()), Some(3));
        assert!(harness.server.circuit(&from).is_none());

        open.send(true)?;
        assert!(wait_for(|| shared.pending.is_empty()));
        let (inbox, _chat) = harness.server.take_inboxes().ok_or("inboxes already taken")?;
        let replayed: Vec<u8> = inbox.try_iter().map(|m| m.body()[0]).collect();
        assert_eq!(replayed, b"ABC");
        Ok(())
    }

    #[test_log::test]
    fn pending_buffer_is_capped() -> testresult::TestResult {
        let (open, gate) = crossbeam::channel::bounded(1);
        let authorizer = Arc::new(GatedAuthorizer { gate });
        let config = UdpServerConfig {
            pending_buffer_limit: 2,
            ..Default::default()
        };
        let harness = Harness::custom(config, Some(authorizer), None)?;
        let session = harness.session(105);
        let shared = harness.server.shared();
        let from = harness.client.local_addr()?;

        shared.process_datagram(&handshake_datagram(&session, 1), from);
        for (sequence, tag) in (2..7).zip(b'A'..) {
            let mut datagram = build_datagram(
                PacketFlags::RELIABLE,
                &[],
                &Message::new(MessageId::Low(700), vec![tag]).to_bytes(),
            );
            set_sequence(&mut datagram, sequence);
            shared.process_datagram(&datagram, from);
        }
        assert_eq!(shared.pending.get(&from).map(|p| p.buffered.len()), Some(2));
        assert_eq!(harness.server.metrics().messages_dropped, 3);

        open.send(true)?;
        assert!(wait_for(|| shared.pending.is_empty()));
        let (inbox, _chat) = harness.server.take_inboxes().ok_or("inboxes already taken")?;
        let replayed: Vec<u8> = inbox.try_iter().map(|m| m.body()[0]).collect();
        assert_eq!(replayed, b"AB");
        Ok(())
    }

    #[test_log::test]
    fn expired_pending_admission_is_dropped() -> testresult::TestResult {
        let (open, gate) = crossbeam::channel::bounded(1);
        let authorizer = Arc::new(GatedAuthorizer { gate });
        let config = UdpServerConfig {
            pending_admission_timeout_ms: 10,
            ..Default::default()
        };
        let harness = Harness::custom(config, Some(authorizer), None)?;
        let session = harness.session(104);
        let shared = harness.server.shared();
        let from = harness.client.local_addr()?;
        shared.process_datagram(&handshake_datagram(&session, 1), from);
        assert_eq!(shared.pending.len(), 1);

        shared.expire_pending_admissions(Instant::now() + Duration::from_millis(50));
        assert!(shared.pending.is_empty());
        open.send(true)?;
        assert!(wait_for(|| harness.server.metrics().admissions_denied == 1));
        assert!(harness.server.circuit(&from).is_none());
        Ok(())
    }
}
