#![allow(dead_code)]

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, Sender};
use lludp::transport::{
    in_memory_socket::InMemorySocket,
    message::{Message, MessageId, UseCircuitCode},
    packet_data::{self, DecodedPacket, PacketFlags},
    Authorizer, Circuit, ConnectionLifecycle, InboundMessage, SessionInfo, Socket,
    StaticSessions, MAX_RECV_SIZE,
};
use lludp::{Collaborators, UdpServer, UdpServerConfig};
use uuid::Uuid;

static NEXT_HOST: AtomicU32 = AtomicU32::new(1);

/// A fresh in-memory address; every test binary counts from a different second octet.
pub fn unique_addr(network: u8) -> SocketAddr {
    let n = NEXT_HOST.fetch_add(1, Ordering::Relaxed);
    SocketAddr::from(([10, network, (n >> 8) as u8, n as u8], 9000))
}

/// Polls `condition` for up to two seconds.
pub fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Frames a single message the way a client would.
pub fn datagram(sequence: u32, reliable: bool, message: &Message) -> Vec<u8> {
    let flags = if reliable {
        PacketFlags::RELIABLE
    } else {
        PacketFlags::empty()
    };
    let mut datagram = packet_data::build_datagram(flags, &[], &message.to_bytes());
    packet_data::set_sequence(&mut datagram, sequence);
    datagram.to_vec()
}

pub fn handshake(session: &SessionInfo, sequence: u32) -> Vec<u8> {
    let message = UseCircuitCode {
        circuit_code: session.circuit_code,
        session_id: session.session_id,
        agent_id: session.agent_id,
    }
    .to_message();
    datagram(sequence, true, &message)
}

/// Blocks authorization until the test opens the gate.
pub struct GatedAuthorizer {
    pub inner: Arc<StaticSessions>,
    gate: Receiver<()>,
}

impl GatedAuthorizer {
    pub fn new(inner: Arc<StaticSessions>) -> (Self, Sender<()>) {
        let (open, gate) = channel::bounded(1);
        (GatedAuthorizer { inner, gate }, open)
    }
}

impl Authorizer for GatedAuthorizer {
    fn authorize(&self, session_id: Uuid, agent_id: Uuid, circuit_code: u32) -> anyhow::Result<bool> {
        let _ = self.gate.recv_timeout(Duration::from_secs(5));
        self.inner.authorize(session_id, agent_id, circuit_code)
    }
}

struct ChannelLifecycle {
    timeouts: Sender<u32>,
    closed: Sender<u32>,
}

impl ConnectionLifecycle for ChannelLifecycle {
    fn on_timeout(&self, circuit: &Circuit) {
        let _ = self.timeouts.send(circuit.circuit_code());
    }

    fn on_closed(&self, circuit: &Circuit) {
        let _ = self.closed.send(circuit.circuit_code());
    }
}

/// A started server on an in-memory socket and one client talking to it.
pub struct TestServer {
    pub server: UdpServer<InMemorySocket>,
    pub client: InMemorySocket,
    pub sessions: Arc<StaticSessions>,
    /// Circuit code, message id and body of every delivered message, in delivery order.
    pub delivered: Receiver<(u32, MessageId, Vec<u8>)>,
    pub timeouts: Receiver<u32>,
    pub closed: Receiver<u32>,
}

impl TestServer {
    pub fn start(network: u8, config: UdpServerConfig) -> anyhow::Result<Self> {
        Self::start_with(network, config, |sessions| sessions)
    }

    /// Like [`start`](Self::start) but lets the test wrap the session store used as authorizer.
    pub fn start_with<A: Authorizer>(
        network: u8,
        mut config: UdpServerConfig,
        authorizer: impl FnOnce(Arc<StaticSessions>) -> Arc<A>,
    ) -> anyhow::Result<Self> {
        config.bind_address = unique_addr(network);
        let sessions = Arc::new(StaticSessions::new());
        let (delivered_tx, delivered) = channel::unbounded();
        let handler = move |circuit: &Circuit, message: &InboundMessage| -> anyhow::Result<()> {
            let body = message.body().to_vec();
            let _ = delivered_tx.send((circuit.circuit_code(), message.message_id, body));
            Ok(())
        };
        let (timeouts_tx, timeouts) = channel::unbounded();
        let (closed_tx, closed) = channel::unbounded();
        let lifecycle = ChannelLifecycle {
            timeouts: timeouts_tx,
            closed: closed_tx,
        };
        let collaborators =
            Collaborators::new(authorizer(sessions.clone()), sessions.clone(), Arc::new(handler))
                .with_lifecycle(Arc::new(lifecycle));
        let server = UdpServer::<InMemorySocket>::bind(config, collaborators)?;
        server.start_inbound()?;
        server.start_outbound()?;
        let client = InMemorySocket::bind(unique_addr(network), None)?;
        Ok(TestServer {
            server,
            client,
            sessions,
            delivered,
            timeouts,
            closed,
        })
    }

    pub fn session(&self, circuit_code: u32) -> SessionInfo {
        let session = SessionInfo {
            circuit_code,
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        };
        self.sessions.insert(session);
        session
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client.local_addr().unwrap()
    }

    pub fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.client.send_to(datagram, self.server.local_addr())?;
        Ok(())
    }

    /// Performs the handshake and waits for the circuit to show up.
    pub fn connect(&self, circuit_code: u32) -> anyhow::Result<SessionInfo> {
        let session = self.session(circuit_code);
        self.send(&handshake(&session, 1))?;
        anyhow::ensure!(
            wait_for(|| self.server.circuit(&self.client_addr()).is_some()),
            "circuit {circuit_code} was not admitted"
        );
        Ok(session)
    }

    /// Next datagram from the server matching `accept`, skipping others, within two seconds.
    pub fn recv_matching(
        &self,
        accept: impl Fn(&DecodedPacket) -> bool,
    ) -> anyhow::Result<DecodedPacket> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut buf = [0u8; MAX_RECV_SIZE];
        while Instant::now() < deadline {
            match self.client.recv_from(&mut buf) {
                Ok((len, _)) => {
                    let packet = packet_data::decode(&buf[..len])?;
                    if accept(&packet) {
                        return Ok(packet);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!("no matching datagram from the server")
    }

    pub fn recv_message(&self, id: MessageId) -> anyhow::Result<DecodedPacket> {
        self.recv_matching(|packet| packet.message_id == id)
    }
}
