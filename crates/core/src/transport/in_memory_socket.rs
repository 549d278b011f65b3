//! In-memory socket implementation for testing.
//!
//! Sockets bound through [`Socket::bind`] register in a process-wide registry keyed by
//! address; `send_to` looks the target up and pushes the datagram into its inbox. Datagrams
//! to unbound addresses vanish silently, as they would on UDP.
//!
//! Loss can be injected per sending address with [`set_loss_filter`]. Filters are plain
//! predicates, so loss is deterministic.
//!
//! # Usage
//!
//! ```
//! use lludp::transport::{in_memory_socket::InMemorySocket, Socket};
//!
//! let a = InMemorySocket::bind("10.1.0.1:9000".parse().unwrap(), None).unwrap();
//! let b = InMemorySocket::bind("10.1.0.2:9000".parse().unwrap(), None).unwrap();
//! a.send_to(b"ping", b.local_addr().unwrap()).unwrap();
//! let mut buf = [0u8; 16];
//! let (len, from) = b.recv_from(&mut buf).unwrap();
//! assert_eq!(&buf[..len], b"ping");
//! assert_eq!(from, a.local_addr().unwrap());
//! ```

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, LazyLock,
    },
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use super::{Socket, RECV_POLL_INTERVAL};

/// Maximum datagram size accepted by the in-memory transport.
const MAX_PACKET_SIZE: usize = 65535;

/// Decides whether an outgoing datagram is dropped. Gets the sender, the target and the
/// datagram.
pub type LossFilter = Arc<dyn Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync>;

struct ReceivedPacket {
    data: Vec<u8>,
    from: SocketAddr,
}

static SOCKETS: LazyLock<DashMap<SocketAddr, Sender<ReceivedPacket>>> =
    LazyLock::new(DashMap::new);

static LOSS_FILTERS: LazyLock<DashMap<SocketAddr, LossFilter>> = LazyLock::new(DashMap::new);

/// Installs a loss filter for datagrams sent from `addr`, replacing any previous one.
pub fn set_loss_filter(addr: SocketAddr, filter: LossFilter) {
    LOSS_FILTERS.insert(addr, filter);
}

pub fn clear_loss_filter(addr: &SocketAddr) {
    LOSS_FILTERS.remove(addr);
}

/// A filter dropping roughly `rate` of the datagrams, reproducibly for a given seed.
pub fn seeded_loss(rate: f64, seed: u64) -> LossFilter {
    let rng = parking_lot::Mutex::new(SmallRng::seed_from_u64(seed));
    Arc::new(move |_: SocketAddr, _: SocketAddr, _: &[u8]| rng.lock().gen_bool(rate))
}

pub struct InMemorySocket {
    addr: SocketAddr,
    inbox: Receiver<ReceivedPacket>,
    dropped: AtomicU64,
}

impl InMemorySocket {
    /// Datagrams sent from this socket that a loss filter discarded.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Socket for InMemorySocket {
    fn bind(addr: SocketAddr, _recv_buffer_size: Option<usize>) -> io::Result<Self> {
        let (tx, rx) = channel::unbounded();
        match SOCKETS.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{addr} already bound"),
                ))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        tracing::trace!(%addr, "In-memory socket bound");
        Ok(InMemorySocket {
            addr,
            inbox: rx,
            dropped: AtomicU64::new(0),
        })
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.inbox.recv_timeout(RECV_POLL_INTERVAL) {
            Ok(packet) => {
                let len = packet.data.len().min(buf.len());
                buf[..len].copy_from_slice(&packet.data[..len]);
                Ok((len, packet.from))
            }
            Err(RecvTimeoutError::Timeout) => Err(io::ErrorKind::WouldBlock.into()),
            Err(RecvTimeoutError::Disconnected) => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if buf.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram exceeds maximum size",
            ));
        }
        let filter = LOSS_FILTERS.get(&self.addr).map(|f| f.value().clone());
        if filter.is_some_and(|lose| lose(self.addr, target, buf)) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(buf.len());
        }
        if let Some(inbox) = SOCKETS.get(&target) {
            let _ = inbox.send(ReceivedPacket {
                data: buf.to_vec(),
                from: self.addr,
            });
        }
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for InMemorySocket {
    fn drop(&mut self) {
        SOCKETS.remove(&self.addr);
        LOSS_FILTERS.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebinding_fails_until_dropped() -> testresult::TestResult {
        let addr: SocketAddr = "10.9.0.1:1".parse()?;
        let socket = InMemorySocket::bind(addr, None)?;
        assert!(InMemorySocket::bind(addr, None).is_err());
        drop(socket);
        let _socket = InMemorySocket::bind(addr, None)?;
        Ok(())
    }

    #[test]
    fn recv_times_out_when_idle() -> testresult::TestResult {
        let socket = InMemorySocket::bind("10.9.0.2:1".parse()?, None)?;
        let mut buf = [0u8; 8];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        Ok(())
    }

    #[test]
    fn loss_filter_drops_matching_datagrams() -> testresult::TestResult {
        let a = InMemorySocket::bind("10.9.0.3:1".parse()?, None)?;
        let b = InMemorySocket::bind("10.9.0.4:1".parse()?, None)?;
        let drop_aa = |_: SocketAddr, _: SocketAddr, data: &[u8]| data[0] == 0xAA;
        set_loss_filter(a.local_addr()?, Arc::new(drop_aa));
        a.send_to(&[0xAA], b.local_addr()?)?;
        a.send_to(&[0xBB], b.local_addr()?)?;
        let mut buf = [0u8; 8];
        let (len, _) = b.recv_from(&mut buf)?;
        assert_eq!(&buf[..len], &[0xBB]);
        assert_eq!(a.dropped(), 1);
        Ok(())
    }

    #[test]
    fn seeded_loss_is_reproducible() {
        let from: SocketAddr = "10.9.0.5:1".parse().unwrap();
        let first = seeded_loss(0.3, 42);
        let second = seeded_loss(0.3, 42);
        let a: Vec<bool> = (0..100).map(|_| first(from, from, &[])).collect();
        let b: Vec<bool> = (0..100).map(|_| second(from, from, &[])).collect();
        assert_eq!(a, b);
        assert!(a.iter().any(|d| *d) && a.iter().any(|d| !*d));
    }
}
