//! Server endpoint of the circuit transport.
//!
//! Datagrams are framed by [`packet_data`], carry messages identified as described in
//! [`message`], and are exchanged over circuits (one per connected client) kept in the
//! circuit table. The receive thread decodes and classifies datagrams, two inbox workers run
//! the [`MessageHandler`], and the outbound scheduler drains throttled per-circuit queues,
//! resends unacknowledged reliable datagrams and keeps circuits alive.
//!
//! Everything is driven by [`UdpServer`].

use std::{io, net::SocketAddr, time::Duration};

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::config::SessionRecord;

pub(crate) mod admission;
pub mod circuit;
pub(crate) mod circuit_table;
pub(crate) mod duplicate_archive;
pub mod in_memory_socket;
pub(crate) mod inbound;
pub mod message;
pub mod metrics;
pub(crate) mod outbound;
pub mod packet_data;
pub(crate) mod packet_log;
pub(crate) mod pool;
pub(crate) mod received_packet_tracker;
pub(crate) mod sent_packet_tracker;
pub(crate) mod task_engine;
pub mod token_bucket;
mod udp_server;

pub use self::admission::AdmissionError;
pub use self::circuit::{Circuit, CircuitState, CircuitStats};
pub use self::inbound::InboundMessage;
pub use self::message::{Message, MessageId};
pub use self::metrics::{MetricsSnapshot, TransportMetrics};
pub use self::packet_data::{MalformedPacket, PacketFlags, MAX_RECV_SIZE, MTU};
pub use self::sent_packet_tracker::{OnTimeout, OutgoingPacket, TimeoutCallback};
pub use self::udp_server::{Collaborators, SendOptions, UdpServer};

/// Read timeout of the receive thread, bounding how long `stop` waits for it.
pub(crate) const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outbound traffic classes, each with its own queue and token bucket per circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThrottleCategory {
    /// Retransmissions of unacknowledged reliable datagrams.
    Resend,
    /// Object and terse updates.
    Task,
    Texture,
    Asset,
    State,
    /// Acks and pings. Queued like the rest but only limited by the circuit and scene buckets.
    Control,
}

impl ThrottleCategory {
    pub const ALL: [ThrottleCategory; 6] = [
        ThrottleCategory::Resend,
        ThrottleCategory::Task,
        ThrottleCategory::Texture,
        ThrottleCategory::Asset,
        ThrottleCategory::State,
        ThrottleCategory::Control,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for ThrottleCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ThrottleCategory::Resend => "resend",
            ThrottleCategory::Task => "task",
            ThrottleCategory::Texture => "texture",
            ThrottleCategory::Asset => "asset",
            ThrottleCategory::State => "state",
            ThrottleCategory::Control => "control",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("inbound processing already started")]
    InboundAlreadyStarted,
    #[error("outbound processing already started")]
    OutboundAlreadyStarted,
    #[error("server has been stopped")]
    Stopped,
    #[error("no circuit for {0}")]
    UnknownCircuit(SocketAddr),
    #[error("circuit to {0} is closed")]
    CircuitClosed(SocketAddr),
    #[error("background task queue is full")]
    TaskQueueFull,
    #[error("message {id} has {blocks} repeated blocks and cannot be split, at most 255 fit")]
    TooManyBlocks {
        id: message::MessageId,
        blocks: usize,
    },
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    IO(#[from] io::Error),
}

/// Datagram socket the server runs on.
///
/// `recv_from` must return within a bounded time (an `io::ErrorKind::WouldBlock` or
/// `TimedOut` error when nothing arrived) so the receive thread can observe shutdown.
pub trait Socket: Sized + Send + Sync + 'static {
    fn bind(addr: SocketAddr, recv_buffer_size: Option<usize>) -> io::Result<Self>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Socket for std::net::UdpSocket {
    fn bind(addr: SocketAddr, recv_buffer_size: Option<usize>) -> io::Result<Self> {
        use socket2::{Domain, Protocol, Socket as RawSocket, Type};

        let socket = RawSocket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(size) = recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
            let actual = socket.recv_buffer_size()?;
            if actual < size {
                tracing::warn!(requested = size, actual, "Kernel capped the receive buffer");
            }
        }
        socket.bind(&addr.into())?;
        let socket: std::net::UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        Ok(socket)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        std::net::UdpSocket::recv_from(self, buf)
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        std::net::UdpSocket::send_to(self, buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        std::net::UdpSocket::local_addr(self)
    }
}

/// Session data the login service recorded for a circuit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub circuit_code: u32,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}

impl From<SessionRecord> for SessionInfo {
    fn from(record: SessionRecord) -> Self {
        SessionInfo {
            circuit_code: record.circuit_code,
            session_id: record.session_id,
            agent_id: record.agent_id,
        }
    }
}

/// Validates the identity claimed by a circuit handshake. Called from the background task
/// engine, so it may block on I/O.
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, session_id: Uuid, agent_id: Uuid, circuit_code: u32) -> anyhow::Result<bool>;
}

/// Circuit-code keyed session metadata consulted once a handshake is authorized.
pub trait SessionRegistry: Send + Sync + 'static {
    fn session(&self, circuit_code: u32) -> Option<SessionInfo>;
}

/// Application-level consumer of decoded messages. Runs on an inbox worker thread and is
/// expected to return promptly. Errors and panics are logged and counted, never propagated.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, circuit: &Circuit, message: &InboundMessage) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Circuit, &InboundMessage) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, circuit: &Circuit, message: &InboundMessage) -> anyhow::Result<()> {
        self(circuit, message)
    }
}

/// Notified about circuits going away.
pub trait ConnectionLifecycle: Send + Sync + 'static {
    /// The circuit was closed because the peer stopped sending.
    fn on_timeout(&self, circuit: &Circuit);

    /// The circuit was removed from the table, for whatever reason.
    fn on_closed(&self, _circuit: &Circuit) {}
}

impl ConnectionLifecycle for () {
    fn on_timeout(&self, _circuit: &Circuit) {}
}

/// In-memory session store acting as both [`Authorizer`] and [`SessionRegistry`].
#[derive(Debug, Default)]
pub struct StaticSessions {
    sessions: DashMap<u32, SessionInfo>,
}

impl StaticSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: SessionInfo) {
        self.sessions.insert(session.circuit_code, session);
    }

    pub fn remove(&self, circuit_code: u32) -> Option<SessionInfo> {
        self.sessions.remove(&circuit_code).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl FromIterator<SessionRecord> for StaticSessions {
    fn from_iter<I: IntoIterator<Item = SessionRecord>>(records: I) -> Self {
        let sessions = StaticSessions::new();
        for record in records {
            sessions.insert(record.into());
        }
        sessions
    }
}

impl Authorizer for StaticSessions {
    fn authorize(&self, session_id: Uuid, agent_id: Uuid, circuit_code: u32) -> anyhow::Result<bool> {
        Ok(self.sessions.get(&circuit_code).is_some_and(|session| {
            session.session_id == session_id && session.agent_id == agent_id
        }))
    }
}

impl SessionRegistry for StaticSessions {
    fn session(&self, circuit_code: u32) -> Option<SessionInfo> {
        self.sessions.get(&circuit_code).map(|session| *session)
    }
}
