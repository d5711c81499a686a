use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use mesh_proto::node::NodeId;

use crate::peer::{ConnectionState, PeerHandle};
use crate::registry::DeviceRegistry;

/// Per-state connection counts for diagnostics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub disconnected: usize,
    pub connecting: usize,
    pub handshaking: usize,
    pub connected: usize,
    pub failed: usize,
}

/// Thread-safe map of live peer connections. The pool owns the handles;
/// removal shuts the worker down and joins it.
#[derive(Default)]
pub struct ConnectionPool {
    inner: Mutex<HashMap<NodeId, Arc<PeerHandle>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// False (and no insertion) if a connection to that node already
    /// exists — simultaneous dial-outs and accepts resolve here.
    pub fn add(&self, handle: Arc<PeerHandle>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entry(handle.node_id()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    pub fn get(&self, node_id: NodeId) -> Option<Arc<PeerHandle>> {
        self.inner.lock().unwrap().get(&node_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<PeerHandle>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.inner.lock().unwrap().contains_key(&node_id)
    }

    /// Shut down and join one connection's worker.
    pub async fn remove(&self, node_id: NodeId) -> bool {
        let handle = self.inner.lock().unwrap().remove(&node_id);
        match handle {
            Some(handle) => {
                debug!(node = %node_id, "Removing peer connection");
                handle.shutdown_and_join().await;
                true
            }
            None => false,
        }
    }

    /// Graceful teardown of every connection.
    pub async fn clear(&self) {
        let handles: Vec<Arc<PeerHandle>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.shutdown_and_join().await;
        }
    }

    /// Remove connections that have sat in a terminal state past the
    /// grace period, purging their devices as they go.
    pub async fn reap_dead(&self, registry: &DeviceRegistry, grace: Duration) -> usize {
        let dead: Vec<NodeId> = {
            let inner = self.inner.lock().unwrap();
            inner
                .values()
                .filter(|h| {
                    h.current_state().is_terminal()
                        && h.terminal_for().map_or(false, |d| d >= grace)
                })
                .map(|h| h.node_id())
                .collect()
        };

        let mut reaped = 0;
        for node_id in dead {
            if self.remove(node_id).await {
                registry.remove_all_for(node_id);
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!(count = reaped, "Reaped dead peer connections");
        }
        reaped
    }

    pub fn statistics(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = PoolStats {
            total: inner.len(),
            ..PoolStats::default()
        };
        for handle in inner.values() {
            match handle.current_state() {
                ConnectionState::Disconnected => stats.disconnected += 1,
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::Handshaking => stats.handshaking += 1,
                ConnectionState::Connected => stats.connected += 1,
                ConnectionState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{spawn_outbound, PeerContext, PeerEndpoint, PeerTimings};

    fn test_handle(node_id: NodeId) -> Arc<PeerHandle> {
        let local = NodeId::generate();
        let ctx = Arc::new(PeerContext {
            local_node: local,
            local_name: "pool-test".to_string(),
            registry: Arc::new(DeviceRegistry::new(local)),
            on_remote_midi: Arc::new(|_, _, _, _| {}),
            on_connection_lost: Arc::new(|_, _| {}),
            timings: PeerTimings::default(),
        });
        spawn_outbound(
            PeerEndpoint {
                node_id,
                name: "peer".to_string(),
                address: "127.0.0.1".parse().unwrap(),
                stream_port: 1,
                datagram_port: 1,
            },
            ctx,
        )
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_node() {
        let pool = ConnectionPool::new();
        let node = NodeId::generate();

        let first = test_handle(node);
        let second = test_handle(node);

        assert!(pool.add(Arc::clone(&first)));
        assert!(!pool.add(Arc::clone(&second)));
        assert!(pool.contains(node));

        second.shutdown_and_join().await;
        pool.clear().await;
    }

    #[tokio::test]
    async fn test_remove_joins_worker() {
        let pool = ConnectionPool::new();
        let node = NodeId::generate();
        pool.add(test_handle(node));

        assert!(pool.remove(node).await);
        assert!(!pool.remove(node).await);
        assert!(pool.get(node).is_none());
    }

    #[tokio::test]
    async fn test_reap_respects_grace_period() {
        let pool = ConnectionPool::new();
        let registry = DeviceRegistry::new(NodeId::generate());
        let node = NodeId::generate();
        pool.add(test_handle(node)); // sits Disconnected from birth

        // Too young to reap
        assert_eq!(pool.reap_dead(&registry, Duration::from_secs(60)).await, 0);
        assert!(pool.contains(node));

        // Grace of zero reaps immediately
        assert_eq!(pool.reap_dead(&registry, Duration::ZERO).await, 1);
        assert!(!pool.contains(node));
    }

    #[tokio::test]
    async fn test_statistics_counts_states() {
        let pool = ConnectionPool::new();
        pool.add(test_handle(NodeId::generate()));
        pool.add(test_handle(NodeId::generate()));

        let stats = pool.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.disconnected, 2);
        assert_eq!(stats.connected, 0);

        pool.clear().await;
        assert_eq!(pool.statistics().total, 0);
    }
}
