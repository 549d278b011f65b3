use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::admission::PendingAdmission;
use super::circuit::{Circuit, CircuitStats};
use super::circuit_table::CircuitTable;
use super::inbound::{self, InboundMessage};
use super::message::Message;
use super::metrics::{MetricsSnapshot, TransportMetrics};
use super::outbound;
use super::packet_data::{PacketFlags, MAX_RECV_SIZE, MTU};
use super::packet_log::PacketLog;
use super::pool::BufferPool;
use super::sent_packet_tracker::OnTimeout;
use super::task_engine::TaskEngine;
use super::token_bucket::TokenBucket;
use super::{
    Authorizer, ConnectionLifecycle, MessageHandler, SessionRegistry, Socket, ThrottleCategory,
    TransportError,
};
use crate::config::UdpServerConfig;

/// External services the server calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub authorizer: Arc<dyn Authorizer>,
    pub sessions: Arc<dyn SessionRegistry>,
    pub handler: Arc<dyn MessageHandler>,
    pub lifecycle: Arc<dyn ConnectionLifecycle>,
}

impl Collaborators {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        sessions: Arc<dyn SessionRegistry>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Collaborators {
            authorizer,
            sessions,
            handler,
            lifecycle: Arc::new(()),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn ConnectionLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

/// How an outbound message is framed and tracked.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Track the message until acknowledged and resend it on timeout.
    pub reliable: bool,
    /// Zero-code the payload when the result still fits the MTU.
    pub zero_coded: bool,
    /// Opaque bytes placed between the header and the payload.
    pub extra_header: Vec<u8>,
    pub on_timeout: OnTimeout,
}

impl SendOptions {
    pub fn reliable() -> Self {
        SendOptions {
            reliable: true,
            ..Default::default()
        }
    }

    pub fn unreliable() -> Self {
        Self::default()
    }

    pub fn zero_coded(mut self) -> Self {
        self.zero_coded = true;
        self
    }

    pub fn on_timeout(mut self, on_timeout: OnTimeout) -> Self {
        self.on_timeout = on_timeout;
        self
    }

    pub(crate) fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        flags.set(PacketFlags::RELIABLE, self.reliable);
        flags.set(PacketFlags::ZEROCODED, self.zero_coded);
        flags
    }
}

/// State shared by the receive thread, the inbox workers, the scheduler and background jobs.
pub(crate) struct Shared<S> {
    pub(crate) config: UdpServerConfig,
    pub(crate) socket: S,
    pub(crate) local_addr: SocketAddr,
    pub(crate) circuits: CircuitTable,
    pub(crate) pending: DashMap<SocketAddr, PendingAdmission>,
    pub(crate) metrics: TransportMetrics,
    pub(crate) scene_throttle: Arc<TokenBucket>,
    pub(crate) tasks: TaskEngine,
    pub(crate) packet_log: Option<PacketLog>,
    pub(crate) packet_pool: BufferPool,
    pub(crate) message_pool: BufferPool,
    pub(crate) collaborators: Collaborators,
    pub(crate) inbox: Sender<InboundMessage>,
    pub(crate) chat_inbox: Sender<InboundMessage>,
}

struct InboundThreads {
    cancel: Sender<()>,
    receiver: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

struct OutboundThread {
    cancel: Sender<()>,
    scheduler: JoinHandle<()>,
}

/// Server endpoint of the circuit transport.
///
/// `bind` creates the socket; [`start_inbound`](Self::start_inbound) starts the receive
/// thread and the two inbox workers, [`start_outbound`](Self::start_outbound) the scheduler.
/// [`stop`](Self::stop) cancels and joins all of them and closes every circuit. Dropping the
/// server stops it.
pub struct UdpServer<S: Socket = UdpSocket> {
    shared: Arc<Shared<S>>,
    inboxes: Mutex<Option<(Receiver<InboundMessage>, Receiver<InboundMessage>)>>,
    inbound: Mutex<Option<InboundThreads>>,
    outbound: Mutex<Option<OutboundThread>>,
    stopped: Mutex<bool>,
}

impl<S: Socket> UdpServer<S> {
    pub fn bind(
        config: UdpServerConfig,
        collaborators: Collaborators,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let socket = S::bind(config.bind_address, config.recv_buffer_size)?;
        let local_addr = socket.local_addr()?;
        let packet_log = if config.packet_log.enabled {
            Some(PacketLog::open(&config.packet_log)?)
        } else {
            None
        };
        let scene_throttle = Arc::new(TokenBucket::new(
            config.burst_capacity(config.scene_throttle),
            config.scene_throttle,
        ));
        let (inbox_tx, inbox_rx) = channel::unbounded();
        let (chat_tx, chat_rx) = channel::unbounded();

        tracing::info!(
            %local_addr,
            throttled = !config.disable_throttles,
            scene_throttle = config.scene_throttle,
            "UDP server bound"
        );
        let shared = Shared {
            tasks: TaskEngine::new(config.background_tasks)?,
            packet_pool: BufferPool::new(config.use_packet_pool, config.pool_capacity, MAX_RECV_SIZE),
            message_pool: BufferPool::new(config.use_message_pool, config.pool_capacity, MTU),
            config,
            socket,
            local_addr,
            circuits: CircuitTable::new(),
            pending: DashMap::new(),
            metrics: TransportMetrics::new(),
            scene_throttle,
            packet_log,
            collaborators,
            inbox: inbox_tx,
            chat_inbox: chat_tx,
        };
        Ok(UdpServer {
            shared: Arc::new(shared),
            inboxes: Mutex::new(Some((inbox_rx, chat_rx))),
            inbound: Mutex::new(None),
            outbound: Mutex::new(None),
            stopped: Mutex::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &UdpServerConfig {
        &self.shared.config
    }

    /// Starts the receive thread and the inbox workers.
    pub fn start_inbound(&self) -> Result<(), TransportError> {
        if *self.stopped.lock() {
            return Err(TransportError::Stopped);
        }
        let mut inbound = self.inbound.lock();
        if inbound.is_some() {
            return Err(TransportError::InboundAlreadyStarted);
        }
        let Some((inbox, chat_inbox)) = self.inboxes.lock().take() else {
            return Err(TransportError::InboundAlreadyStarted);
        };
        let (cancel, cancelled) = channel::bounded::<()>(0);

        let workers = vec![
            inbound::spawn_worker(self.shared.clone(), "lludp-inbox", inbox, cancelled.clone())?,
            inbound::spawn_worker(
                self.shared.clone(),
                "lludp-chat-inbox",
                chat_inbox,
                cancelled.clone(),
            )?,
        ];
        let receiver = inbound::spawn_receiver(self.shared.clone(), cancelled)?;
        *inbound = Some(InboundThreads {
            cancel,
            receiver,
            workers,
        });
        tracing::debug!(local_addr = %self.shared.local_addr, "Inbound processing started");
        Ok(())
    }

    /// Starts the outbound scheduler.
    pub fn start_outbound(&self) -> Result<(), TransportError> {
        if *self.stopped.lock() {
            return Err(TransportError::Stopped);
        }
        let mut outbound = self.outbound.lock();
        if outbound.is_some() {
            return Err(TransportError::OutboundAlreadyStarted);
        }
        let (cancel, cancelled) = channel::bounded::<()>(0);
        let scheduler = outbound::spawn_scheduler(self.shared.clone(), cancelled)?;
        *outbound = Some(OutboundThread { cancel, scheduler });
        tracing::debug!(local_addr = %self.shared.local_addr, "Outbound processing started");
        Ok(())
    }

    /// Stops every thread, closes all circuits and drains the background jobs. Idempotent.
    pub fn stop(&self) {
        {
            let mut stopped = self.stopped.lock();
            if *stopped {
                return;
            }
            *stopped = true;
        }
        if let Some(threads) = self.outbound.lock().take() {
            drop(threads.cancel);
            if threads.scheduler.join().is_err() {
                tracing::error!("Outbound scheduler panicked");
            }
        }
        if let Some(threads) = self.inbound.lock().take() {
            drop(threads.cancel);
            for handle in std::iter::once(threads.receiver).chain(threads.workers) {
                if handle.join().is_err() {
                    tracing::error!("Inbound thread panicked");
                }
            }
        }
        self.shared.tasks.shutdown();
        self.shared.pending.clear();
        for circuit in self.shared.circuits.clear() {
            if circuit.begin_close() {
                circuit.mark_closed();
                self.shared.collaborators.lifecycle.on_closed(&circuit);
            }
        }
        if let Some(log) = &self.shared.packet_log {
            log.flush();
        }
        tracing::info!(local_addr = %self.shared.local_addr, "UDP server stopped");
    }

    /// Queues `message` for the circuit at `remote`.
    ///
    /// Messages too large for one datagram are split when their type allows it. With
    /// throttling disabled the datagrams are sent from the calling thread.
    pub fn send_message(
        &self,
        remote: SocketAddr,
        message: &Message,
        category: ThrottleCategory,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        let circuit = self
            .shared
            .circuits
            .lookup(&remote)
            .ok_or(TransportError::UnknownCircuit(remote))?;
        self.shared.send_message(&circuit, message, category, options)
    }

    pub fn circuit(&self, remote: &SocketAddr) -> Option<Arc<Circuit>> {
        self.shared.circuits.lookup(remote)
    }

    pub fn circuit_by_agent(&self, agent_id: &uuid::Uuid) -> Option<Arc<Circuit>> {
        self.shared.circuits.by_agent(agent_id)
    }

    /// Closes the circuit at `remote`. Returns `false` if there was none or it was already
    /// closing.
    pub fn close_circuit(&self, remote: &SocketAddr) -> bool {
        match self.shared.circuits.lookup(remote) {
            Some(circuit) => self.shared.close_circuit(&circuit, "administrative close"),
            None => false,
        }
    }

    /// Applies the paused ack timeout to the circuit at `remote`.
    pub fn pause_circuit(&self, remote: &SocketAddr) -> bool {
        self.shared
            .circuits
            .lookup(remote)
            .is_some_and(|circuit| circuit.set_paused(true))
    }

    pub fn resume_circuit(&self, remote: &SocketAddr) -> bool {
        self.shared
            .circuits
            .lookup(remote)
            .is_some_and(|circuit| circuit.set_paused(false))
    }

    pub fn circuits(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<_> = self
            .shared
            .circuits
            .snapshot()
            .iter()
            .map(|circuit| circuit.stats())
            .collect();
        stats.sort_by_key(|s| s.circuit_code);
        stats
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let shared = &self.shared;
        let circuits = shared.circuits.snapshot();
        let mut snapshot = shared.metrics.snapshot();
        snapshot.circuits = circuits.len();
        snapshot.pending_admissions = shared.pending.len();
        snapshot.inbox_depth = shared.inbox.len();
        snapshot.chat_inbox_depth = shared.chat_inbox.len();
        snapshot.outbound_queue_depth = circuits.iter().map(|c| c.queued_total()).sum();
        snapshot.unacked = circuits.iter().map(|c| c.sent.lock().len()).sum();
        snapshot.background_tasks = shared.tasks.in_flight();
        snapshot
    }
}

impl<S: Socket> Drop for UdpServer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<S: Socket> Shared<S> {
    /// Marks the circuit closing and removes it from the table. Returns `false` if another
    /// caller got there first.
    pub(crate) fn close_circuit(&self, circuit: &Arc<Circuit>, reason: &'static str) -> bool {
        if !circuit.begin_close() {
            return false;
        }
        tracing::info!(
            circuit_code = circuit.circuit_code(),
            agent = %circuit.agent_id(),
            remote = %circuit.remote(),
            reason,
            "Closing circuit"
        );
        self.circuits.remove(circuit);
        circuit.mark_closed();
        self.collaborators.lifecycle.on_closed(circuit);
        true
    }
}

#[cfg(test)]
impl<S: Socket> UdpServer<S> {
    pub(crate) fn shared(&self) -> &Arc<Shared<S>> {
        &self.shared
    }

    pub(crate) fn take_inboxes(
        &self,
    ) -> Option<(Receiver<InboundMessage>, Receiver<InboundMessage>)> {
        self.inboxes.lock().take()
    }
}
