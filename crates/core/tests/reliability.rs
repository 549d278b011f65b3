mod common;

use std::collections::BTreeSet;
use std::io;
use std::time::{Duration, Instant};

use common::{datagram, wait_for, TestServer};
use lludp::transport::{
    in_memory_socket::{clear_loss_filter, seeded_loss, set_loss_filter},
    message::{self, Message, MessageId},
    packet_data, Socket, ThrottleCategory, MAX_RECV_SIZE,
};
use lludp::{SendOptions, UdpServerConfig};

const NETWORK: u8 = 22;

fn fast_config() -> UdpServerConfig {
    UdpServerConfig {
        default_rto_ms: 100,
        max_rto_ms: 400,
        ..Default::default()
    }
}

#[test_log::test]
fn unacked_message_is_resent_with_same_sequence() -> testresult::TestResult {
    let server = TestServer::start(NETWORK, fast_config())?;
    server.connect(1)?;
    let id = MessageId::Low(900);

    server.server.send_message(
        server.client_addr(),
        &Message::new(id, b"hello".to_vec()),
        ThrottleCategory::Task,
        SendOptions::reliable(),
    )?;

    let first = server.recv_message(id)?;
    assert!(first.header.is_reliable());
    assert!(!first.header.is_resent());
    let again = server.recv_message(id)?;
    assert!(again.header.is_resent());
    assert_eq!(again.header.sequence, first.header.sequence);
    assert_eq!(again.body(), b"hello");

    let ack = message::packet_ack(&[first.header.sequence]);
    server.send(&datagram(2, false, &ack))?;
    assert!(wait_for(|| server.server.circuits()[0].unacked == 0));

    let stats = &server.server.circuits()[0];
    assert!(stats.resent >= 1);
    assert!(server.server.metrics().resent >= 1);
    Ok(())
}

#[test_log::test]
fn reliable_messages_survive_lossy_link() -> testresult::TestResult {
    let server = TestServer::start(NETWORK, fast_config())?;
    server.connect(6)?;
    let id = MessageId::Low(902);
    let server_addr = server.server.local_addr();
    set_loss_filter(server_addr, seeded_loss(0.4, 7));

    for n in 0..20u8 {
        server.server.send_message(
            server.client_addr(),
            &Message::new(id, vec![n]),
            ThrottleCategory::Task,
            SendOptions::reliable(),
        )?;
    }

    let mut received = BTreeSet::new();
    let mut client_sequence = 2;
    let mut buf = [0u8; MAX_RECV_SIZE];
    let deadline = Instant::now() + Duration::from_secs(15);
    while received.len() < 20 && Instant::now() < deadline {
        let len = match server.client.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        };
        let packet = packet_data::decode(&buf[..len])?;
        if packet.message_id != id {
            continue;
        }
        received.insert(packet.body()[0]);
        let ack = message::packet_ack(&[packet.header.sequence]);
        server.send(&datagram(client_sequence, false, &ack))?;
        client_sequence += 1;
    }
    clear_loss_filter(&server_addr);

    assert_eq!(received, (0..20u8).collect::<BTreeSet<_>>());
    assert!(wait_for(|| server.server.circuits()[0].unacked == 0));
    assert!(server.server.metrics().resent >= 1);
    Ok(())
}

#[test_log::test]
fn duplicate_reliable_datagram_is_delivered_once_and_acked() -> testresult::TestResult {
    let server = TestServer::start(NETWORK, UdpServerConfig::default())?;
    server.connect(2)?;
    let payload = datagram(5, true, &Message::new(MessageId::Low(500), vec![9]));

    server.send(&payload)?;
    server.send(&payload)?;

    let (code, _, body) = server.delivered.recv_timeout(Duration::from_secs(2))?;
    assert_eq!((code, body), (2, vec![9]));
    assert!(wait_for(|| server.server.metrics().duplicates == 1));
    assert!(server.delivered.try_recv().is_err());

    // Both copies get acknowledged; the periodic flush carries them.
    let acked = server.recv_matching(|packet| {
        packet.message_id == MessageId::PACKET_ACK
            && message::parse_packet_ack(packet.body()).contains(&5)
    })?;
    assert!(!acked.header.is_reliable());
    Ok(())
}

#[test_log::test]
fn appended_acks_clear_unacked_packets() -> testresult::TestResult {
    let server = TestServer::start(NETWORK, UdpServerConfig::default())?;
    server.connect(3)?;
    let id = MessageId::Low(901);
    server.server.send_message(
        server.client_addr(),
        &Message::new(id, vec![1]),
        ThrottleCategory::State,
        SendOptions::reliable(),
    )?;
    let sent = server.recv_message(id)?;
    assert_eq!(server.server.circuits()[0].unacked, 1);

    let mut reply = lludp::transport::packet_data::build_datagram(
        lludp::transport::PacketFlags::empty(),
        &[],
        &Message::new(MessageId::Low(500), vec![0]).to_bytes(),
    );
    lludp::transport::packet_data::set_sequence(&mut reply, 2);
    lludp::transport::packet_data::append_acks(&mut reply, &[sent.header.sequence]);
    server.send(&reply)?;

    assert!(wait_for(|| server.server.circuits()[0].unacked == 0));
    assert!(server.server.circuits()[0].srtt_ms.is_some());
    Ok(())
}

#[test_log::test]
fn silent_circuit_times_out() -> testresult::TestResult {
    let config = UdpServerConfig {
        ack_timeout_ms: 300,
        paused_ack_timeout_ms: 300,
        ..Default::default()
    };
    let server = TestServer::start(NETWORK, config)?;
    server.connect(4)?;

    assert_eq!(server.timeouts.recv_timeout(Duration::from_secs(3))?, 4);
    assert_eq!(server.closed.recv_timeout(Duration::from_secs(1))?, 4);
    assert!(server.server.circuit(&server.client_addr()).is_none());
    assert_eq!(server.server.metrics().circuits_timed_out, 1);
    Ok(())
}

#[test_log::test]
fn paused_circuit_survives_regular_timeout() -> testresult::TestResult {
    let config = UdpServerConfig {
        ack_timeout_ms: 200,
        paused_ack_timeout_ms: 60_000,
        ..Default::default()
    };
    let server = TestServer::start(NETWORK, config)?;
    server.connect(5)?;
    assert!(server.server.pause_circuit(&server.client_addr()));

    assert!(server.timeouts.recv_timeout(Duration::from_millis(600)).is_err());
    assert!(server.server.circuit(&server.client_addr()).is_some());

    assert!(server.server.resume_circuit(&server.client_addr()));
    assert_eq!(server.timeouts.recv_timeout(Duration::from_secs(2))?, 5);
    Ok(())
}
