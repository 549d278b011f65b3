mod common;

use std::{io, time::Duration};

use common::{datagram, handshake, wait_for, GatedAuthorizer, TestServer};
use lludp::transport::{
    message::{self, Message, MessageId},
    Socket, TransportError,
};
use lludp::UdpServerConfig;

const NETWORK: u8 = 21;

#[test_log::test]
fn datagrams_racing_the_handshake_are_delivered_after_admission() -> testresult::TestResult {
    let mut open = None;
    let server = TestServer::start_with(NETWORK, UdpServerConfig::default(), |sessions| {
        let (authorizer, gate) = GatedAuthorizer::new(sessions);
        open = Some(gate);
        std::sync::Arc::new(authorizer)
    })?;
    let open = open.ok_or("gate not created")?;
    let session = server.session(42);

    server.send(&handshake(&session, 1))?;
    for (sequence, tag) in [(2, b'A'), (3, b'B')] {
        server.send(&datagram(sequence, true, &Message::new(MessageId::Low(500), vec![tag])))?;
    }
    assert!(wait_for(|| server.server.metrics().datagrams_received == 3));
    assert_eq!(server.server.metrics().pending_admissions, 1);
    assert!(server.server.circuit(&server.client_addr()).is_none());

    open.send(())?;

    let ack = server.recv_matching(|packet| {
        packet.message_id == MessageId::PACKET_ACK
            && message::parse_packet_ack(packet.body()).contains(&1)
    })?;
    assert!(!ack.header.is_reliable());

    let mut bodies = Vec::new();
    for _ in 0..2 {
        let (code, id, body) = server.delivered.recv_timeout(Duration::from_secs(2))?;
        assert_eq!((code, id), (42, MessageId::Low(500)));
        bodies.extend(body);
    }
    assert_eq!(bodies, b"AB");

    let circuit = server
        .server
        .circuit_by_agent(&session.agent_id)
        .ok_or("circuit not indexed by agent")?;
    assert_eq!(circuit.remote(), server.client_addr());
    let metrics = server.server.metrics();
    assert_eq!(metrics.admissions_completed, 1);
    assert_eq!(metrics.pending_admissions, 0);
    Ok(())
}

#[test_log::test]
fn unknown_session_is_denied_silently() -> testresult::TestResult {
    let server = TestServer::start(NETWORK, UdpServerConfig::default())?;
    let stranger = lludp::transport::SessionInfo {
        circuit_code: 9,
        session_id: uuid::Uuid::new_v4(),
        agent_id: uuid::Uuid::new_v4(),
    };
    server.send(&handshake(&stranger, 1))?;

    assert!(wait_for(|| server.server.metrics().admissions_denied == 1));
    assert!(server.server.circuits().is_empty());
    assert_eq!(server.server.metrics().pending_admissions, 0);

    let mut buf = [0u8; 64];
    let err = server.client.recv_from(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    Ok(())
}

#[test_log::test]
fn traffic_without_circuit_is_orphaned() -> testresult::TestResult {
    let server = TestServer::start(NETWORK, UdpServerConfig::default())?;
    server.send(&datagram(1, true, &Message::new(MessageId::Low(500), vec![1])))?;
    server.send(&[0x40, 0, 0])?;

    assert!(wait_for(|| {
        let metrics = server.server.metrics();
        metrics.orphaned == 1 && metrics.malformed == 1
    }));
    assert!(server.delivered.try_recv().is_err());
    Ok(())
}

#[test_log::test]
fn peer_close_removes_circuit() -> testresult::TestResult {
    let server = TestServer::start(NETWORK, UdpServerConfig::default())?;
    server.connect(7)?;

    server.send(&datagram(2, false, &Message::new(MessageId::CLOSE_CIRCUIT, Vec::new())))?;

    assert_eq!(server.closed.recv_timeout(Duration::from_secs(2))?, 7);
    assert!(server.server.circuit(&server.client_addr()).is_none());
    assert!(server.timeouts.try_recv().is_err());
    Ok(())
}

#[test_log::test]
fn stop_closes_circuits_once() -> testresult::TestResult {
    let server = TestServer::start(NETWORK, UdpServerConfig::default())?;
    server.connect(11)?;

    server.server.stop();
    server.server.stop();

    assert_eq!(server.closed.try_iter().collect::<Vec<_>>(), vec![11]);
    assert!(server.server.circuits().is_empty());
    assert!(matches!(
        server.server.start_inbound(),
        Err(TransportError::Stopped)
    ));
    let sent = server.server.send_message(
        server.client_addr(),
        &Message::new(MessageId::Low(500), vec![0]),
        lludp::transport::ThrottleCategory::Task,
        lludp::SendOptions::reliable(),
    );
    assert!(matches!(sent, Err(TransportError::UnknownCircuit(_))));
    Ok(())
}
