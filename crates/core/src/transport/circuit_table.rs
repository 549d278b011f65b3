use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::circuit::Circuit;

/// Connected circuits by remote endpoint, with a secondary index by agent.
///
/// The lock only guards structural changes; everything inside a circuit has its own
/// synchronization.
#[derive(Default)]
pub(crate) struct CircuitTable {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_endpoint: HashMap<SocketAddr, Arc<Circuit>>,
    by_agent: HashMap<Uuid, SocketAddr>,
}

impl CircuitTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lookup(&self, remote: &SocketAddr) -> Option<Arc<Circuit>> {
        self.inner.read().by_endpoint.get(remote).cloned()
    }

    pub(crate) fn by_agent(&self, agent_id: &Uuid) -> Option<Arc<Circuit>> {
        let inner = self.inner.read();
        let remote = inner.by_agent.get(agent_id)?;
        inner.by_endpoint.get(remote).cloned()
    }

    /// Adds `circuit`, returning whatever it displaced: an entry for the same endpoint and an
    /// entry for the same agent on another endpoint.
    pub(crate) fn insert(&self, circuit: Arc<Circuit>) -> Vec<Arc<Circuit>> {
        let mut inner = self.inner.write();
        let mut displaced = Vec::new();
        let remote = circuit.remote();
        let agent_id = circuit.agent_id();
        if let Some(previous_remote) = inner.by_agent.insert(agent_id, remote) {
            if previous_remote != remote {
                if let Some(previous) = inner.by_endpoint.remove(&previous_remote) {
                    displaced.push(previous);
                }
            }
        }
        if let Some(previous) = inner.by_endpoint.insert(remote, circuit) {
            let previous_agent = previous.agent_id();
            if previous_agent != agent_id && inner.by_agent.get(&previous_agent) == Some(&remote) {
                inner.by_agent.remove(&previous_agent);
            }
            displaced.push(previous);
        }
        displaced
    }

    /// Removes the entry for `remote` if it is still `circuit`.
    pub(crate) fn remove(&self, circuit: &Arc<Circuit>) -> bool {
        let mut inner = self.inner.write();
        let remote = circuit.remote();
        match inner.by_endpoint.get(&remote) {
            Some(current) if Arc::ptr_eq(current, circuit) => {}
            _ => return false,
        }
        inner.by_endpoint.remove(&remote);
        if inner.by_agent.get(&circuit.agent_id()) == Some(&remote) {
            inner.by_agent.remove(&circuit.agent_id());
        }
        true
    }

    /// Clones the current set of circuits so callers can iterate without holding the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Circuit>> {
        self.inner.read().by_endpoint.values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.read().by_endpoint.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.read().by_endpoint.is_empty()
    }

    pub(crate) fn clear(&self) -> Vec<Arc<Circuit>> {
        let mut inner = self.inner.write();
        inner.by_agent.clear();
        inner.by_endpoint.drain().map(|(_, circuit)| circuit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UdpServerConfig;
    use crate::transport::token_bucket::TokenBucket;
    use crate::transport::SessionInfo;

    fn circuit(code: u32, agent_id: Uuid, remote: &str) -> Arc<Circuit> {
        let config = UdpServerConfig::default();
        let scene = Arc::new(TokenBucket::new(0, 0));
        let session = SessionInfo {
            circuit_code: code,
            session_id: Uuid::new_v4(),
            agent_id,
        };
        Arc::new(Circuit::new(session, remote.parse().unwrap(), &config, &scene))
    }

    #[test]
    fn lookup_by_endpoint_and_agent() {
        let table = CircuitTable::new();
        let agent = Uuid::new_v4();
        let c = circuit(1, agent, "10.0.0.1:1000");
        assert!(table.insert(c.clone()).is_empty());
        assert!(Arc::ptr_eq(&table.lookup(&c.remote()).unwrap(), &c));
        assert!(Arc::ptr_eq(&table.by_agent(&agent).unwrap(), &c));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn same_agent_on_new_endpoint_displaces_old_circuit() {
        let table = CircuitTable::new();
        let agent = Uuid::new_v4();
        let old = circuit(1, agent, "10.0.0.1:1000");
        let new = circuit(2, agent, "10.0.0.1:2000");
        table.insert(old.clone());
        let displaced = table.insert(new.clone());
        assert_eq!(displaced.len(), 1);
        assert!(Arc::ptr_eq(&displaced[0], &old));
        assert!(table.lookup(&old.remote()).is_none());
        assert!(Arc::ptr_eq(&table.by_agent(&agent).unwrap(), &new));
    }

    #[test]
    fn remove_ignores_replaced_entries() {
        let table = CircuitTable::new();
        let old = circuit(1, Uuid::new_v4(), "10.0.0.1:1000");
        let new = circuit(2, Uuid::new_v4(), "10.0.0.1:1000");
        table.insert(old.clone());
        let displaced = table.insert(new.clone());
        assert_eq!(displaced.len(), 1);
        assert!(table.by_agent(&old.agent_id()).is_none());
        assert!(!table.remove(&old));
        assert!(table.remove(&new));
        assert!(table.is_empty());
    }
}
