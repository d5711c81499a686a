use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mesh_device::LocalMidiBackend;
use mesh_proto::node::NodeId;
use mesh_proto::records::{Hello, Record, RecordDecoder};
use mesh_proto::{
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS,
    DEFAULT_STREAM_PORT,
};

use crate::error::ConnectionError;
use crate::forward::ForwardingEngine;
use crate::heartbeat::HeartbeatMonitor;
use crate::identity::NodeIdentity;
use crate::peer::{
    self, ConnectionState, PeerContext, PeerCounterStats, PeerEndpoint, PeerTimings,
};
use crate::pool::ConnectionPool;
use crate::registry::DeviceRegistry;
use crate::routes::RouteManager;
use crate::routing_table::RoutingTable;

/// Timeout for control-plane queries against peer workers.
const QUERY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub state_dir: PathBuf,
    pub node_name: String,
    pub bind_address: IpAddr,
    /// Port for the stream listener. 0 picks an ephemeral port.
    pub stream_port: u16,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long a dead connection may linger before the reaper runs.
    pub reap_grace: Duration,
}

impl MeshConfig {
    pub fn with_state_dir(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            node_name: String::new(),
            bind_address: IpAddr::from([0, 0, 0, 0]),
            stream_port: DEFAULT_STREAM_PORT,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            reap_grace: Duration::from_secs(10),
        }
    }
}

/// One row of `GET /peers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub node_id: NodeId,
    pub name: Option<String>,
    pub address: Option<IpAddr>,
    pub state: ConnectionState,
    pub time_since_last_heartbeat_ms: Option<u64>,
    pub devices_known: usize,
    pub counters: PeerCounterStats,
}

/// Top-level coordinator: owns every core component, runs the accept
/// loop for inbound peers, and wires connection-lost cleanup.
pub struct MeshManager {
    identity: NodeIdentity,
    registry: Arc<DeviceRegistry>,
    table: Arc<RoutingTable>,
    routes: Arc<RouteManager>,
    pool: Arc<ConnectionPool>,
    engine: Arc<ForwardingEngine>,
    peer_ctx: Arc<PeerContext>,
    monitor: HeartbeatMonitor,
    accept_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
    reap_task: JoinHandle<()>,
    stream_addr: SocketAddr,
    started_at: Instant,
}

impl MeshManager {
    /// Bring the node up: identity, local devices, persisted routes,
    /// the stream listener, and one connection per directory peer.
    pub async fn start(
        config: MeshConfig,
        backend: Arc<dyn LocalMidiBackend>,
        directory: Vec<PeerEndpoint>,
    ) -> anyhow::Result<Arc<Self>> {
        let identity = NodeIdentity::load_or_create(&config.state_dir, &config.node_name)?;
        let instance_dir = identity.instance_dir(&config.state_dir)?;

        let registry = Arc::new(DeviceRegistry::new(identity.id()));
        let table = Arc::new(RoutingTable::new());
        let routes = Arc::new(RouteManager::new(
            identity.id(),
            instance_dir.join("routes.json"),
            Arc::clone(&registry),
        ));

        // Table and rule set follow every registry change, so a peer's
        // routes go inert in the same stroke as its devices.
        {
            let table = Arc::clone(&table);
            let routes = Arc::clone(&routes);
            registry.subscribe(Box::new(move |event| {
                table.apply(event);
                routes.revalidate();
            }));
        }

        for descriptor in backend.enumerate() {
            registry.register_local(descriptor.device_id, descriptor.name, descriptor.direction)?;
        }

        if let Err(e) = routes.load() {
            warn!(error = %e, "Could not load routing rules, starting empty");
        }

        let pool = Arc::new(ConnectionPool::new());
        let engine = ForwardingEngine::new(
            identity.id(),
            Arc::clone(&routes),
            Arc::clone(&table),
            Arc::clone(&pool),
            Arc::clone(&backend),
        );

        {
            let engine = Arc::clone(&engine);
            backend.set_input_handler(Arc::new(move |device_id, bytes| {
                engine.on_local_input(device_id, bytes);
            }));
        }

        // Lost connections are cleaned up off the worker's own task so
        // the callback never joins the worker that invoked it.
        let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel::<(NodeId, String)>();
        let cleanup_task = {
            let pool = Arc::clone(&pool);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                while let Some((node_id, reason)) = cleanup_rx.recv().await {
                    info!(node = %node_id, reason = %reason, "Connection lost, purging peer");
                    registry.remove_all_for(node_id);
                    pool.remove(node_id).await;
                }
            })
        };

        let peer_ctx = Arc::new(PeerContext {
            local_node: identity.id(),
            local_name: identity.name().to_string(),
            registry: Arc::clone(&registry),
            on_remote_midi: {
                let engine = Arc::clone(&engine);
                Arc::new(move |node, device, ttl, bytes| {
                    engine.on_remote_input(node, device, ttl, bytes);
                })
            },
            on_connection_lost: {
                let tx = cleanup_tx.clone();
                Arc::new(move |node, reason| {
                    let _ = tx.send((node, reason.to_string()));
                })
            },
            timings: PeerTimings {
                handshake_timeout: config.handshake_timeout,
                heartbeat_interval: config.heartbeat_interval,
                heartbeat_timeout: config.heartbeat_timeout,
            },
        });

        let listener = TcpListener::bind((config.bind_address, config.stream_port))
            .await
            .with_context(|| {
                format!(
                    "binding stream listener on {}:{}",
                    config.bind_address, config.stream_port
                )
            })?;
        let stream_addr = listener.local_addr()?;
        info!(addr = %stream_addr, node = %identity.id(), name = %identity.name(), "Mesh node listening");

        let accept_task = {
            let pool = Arc::clone(&pool);
            let ctx = Arc::clone(&peer_ctx);
            let handshake_timeout = config.handshake_timeout;
            tokio::spawn(run_accept_loop(listener, pool, ctx, handshake_timeout))
        };

        for endpoint in directory {
            if endpoint.node_id == identity.id() {
                continue;
            }
            let handle = peer::spawn_outbound(endpoint.clone(), Arc::clone(&peer_ctx));
            if pool.add(Arc::clone(&handle)) {
                let _ = handle.connect();
            } else {
                warn!(node = %endpoint.node_id, "Duplicate directory entry ignored");
                handle.shutdown_and_join().await;
            }
        }

        let monitor = HeartbeatMonitor::spawn(Arc::clone(&pool), config.heartbeat_interval);

        let reap_task = {
            let pool = Arc::clone(&pool);
            let registry = Arc::clone(&registry);
            let grace = config.reap_grace;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(grace.max(Duration::from_secs(1)));
                loop {
                    ticker.tick().await;
                    pool.reap_dead(&registry, grace).await;
                }
            })
        };

        Ok(Arc::new(Self {
            identity,
            registry,
            table,
            routes,
            pool,
            engine,
            peer_ctx,
            monitor,
            accept_task,
            cleanup_task,
            reap_task,
            stream_addr,
            started_at: Instant::now(),
        }))
    }

    /// Graceful teardown: heartbeats stop first, peers say BYE, the
    /// rule set hits disk last.
    pub async fn stop(&self) {
        info!(node = %self.identity.id(), "Mesh node stopping");
        self.monitor.stop();
        self.reap_task.abort();
        self.accept_task.abort();
        self.pool.clear().await;
        self.cleanup_task.abort();
        if let Err(e) = self.routes.save() {
            warn!(error = %e, "Failed to save routes on shutdown");
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.id()
    }

    pub fn node_name(&self) -> &str {
        self.identity.name()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Actual stream listener address (useful with an ephemeral port).
    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteManager> {
        &self.routes
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn engine(&self) -> &Arc<ForwardingEngine> {
        &self.engine
    }

    /// Dial a peer that appeared after startup.
    pub async fn add_peer(&self, endpoint: PeerEndpoint) -> bool {
        if endpoint.node_id == self.identity.id() || self.pool.contains(endpoint.node_id) {
            return false;
        }
        let handle = peer::spawn_outbound(endpoint, Arc::clone(&self.peer_ctx));
        if self.pool.add(Arc::clone(&handle)) {
            let _ = handle.connect();
            true
        } else {
            handle.shutdown_and_join().await;
            false
        }
    }

    /// Row-per-peer snapshot for the control plane.
    pub async fn peers_snapshot(&self) -> Vec<PeerSummary> {
        let mut out = Vec::new();
        for handle in self.pool.all() {
            let info = handle.peer_info(QUERY_TIMEOUT).await.ok().flatten();
            let heartbeat = handle
                .time_since_last_heartbeat(QUERY_TIMEOUT)
                .await
                .ok()
                .flatten();
            out.push(PeerSummary {
                node_id: handle.node_id(),
                name: info.as_ref().map(|i| i.name.clone()),
                address: info.as_ref().map(|i| i.address),
                state: handle.current_state(),
                time_since_last_heartbeat_ms: heartbeat.map(|d| d.as_millis() as u64),
                devices_known: self.registry.list_for_node(handle.node_id()).len(),
                counters: handle.counters(),
            });
        }
        out.sort_by_key(|p| p.node_id);
        out
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    pool: Arc<ConnectionPool>,
    ctx: Arc<PeerContext>,
    handshake_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let pool = Arc::clone(&pool);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    match tokio::time::timeout(handshake_timeout, read_hello(stream)).await {
                        Ok(Ok((stream, hello, decoder))) => {
                            if hello.node_id == ctx.local_node {
                                warn!(from = %addr, "Rejected connection from ourselves");
                                return;
                            }
                            match peer::spawn_inbound(stream, hello.clone(), decoder, ctx) {
                                Ok(handle) => {
                                    if !pool.add(Arc::clone(&handle)) {
                                        warn!(node = %hello.node_id, "Duplicate connection rejected");
                                        handle.shutdown_and_join().await;
                                    }
                                }
                                Err(e) => {
                                    warn!(from = %addr, error = %e, "Could not spawn peer worker");
                                }
                            }
                        }
                        Ok(Err(e)) => warn!(from = %addr, error = %e, "Bad handshake"),
                        Err(_) => warn!(from = %addr, "Handshake timed out"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Read records until the first one, which must be HELLO.
async fn read_hello(
    mut stream: TcpStream,
) -> Result<(TcpStream, Hello, RecordDecoder), ConnectionError> {
    let mut decoder = RecordDecoder::new();
    let mut chunk = [0u8; 4096];
    loop {
        match decoder
            .next()
            .map_err(|e| ConnectionError::ProtocolViolation(e.to_string()))?
        {
            Some(Record::Hello(hello)) => return Ok((stream, hello, decoder)),
            Some(_) => {
                return Err(ConnectionError::ProtocolViolation(
                    "expected HELLO".to_string(),
                ))
            }
            None => {}
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ConnectionError::ProtocolViolation(
                "closed before HELLO".to_string(),
            ));
        }
        decoder.extend(&chunk[..n]);
    }
}
