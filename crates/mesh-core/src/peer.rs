use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use mesh_proto::classify::{classify, Class};
use mesh_proto::device::DeviceDescriptor;
use mesh_proto::node::NodeId;
use mesh_proto::records::{DeviceUpdate, Hello, MidiRecord, Record, RecordDecoder, Welcome};
use mesh_proto::{
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS,
    PROTOCOL_VERSION,
};

use crate::command::{command_queue, Command, CommandTx, Query};
use crate::error::{ConnectionError, QueryError, SendError};
use crate::registry::DeviceRegistry;
use crate::transport::{DatagramSession, DatagramStats, Inbound, StreamSession};

/// Worker inbox depth shared by both transport readers.
const INBOX_CAPACITY: usize = 1024;

/// Lifecycle of one peer connection. `Failed` is terminal for the
/// instance; the pool reaps it and the manager may dial fresh later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Handshaking = 2,
    Connected = 3,
    Failed = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Handshaking,
            3 => Self::Connected,
            4 => Self::Failed,
            _ => Self::Disconnected,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// What the handshake established about the peer. Immutable afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub name: String,
    pub address: IpAddr,
    pub datagram_endpoint: SocketAddr,
    pub stream_endpoint: SocketAddr,
    pub protocol_version: u8,
}

/// Dial information from the peer directory.
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    pub node_id: NodeId,
    pub name: String,
    pub address: IpAddr,
    pub stream_port: u16,
    pub datagram_port: u16,
}

#[derive(Debug, Clone)]
pub struct PeerTimings {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for PeerTimings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
        }
    }
}

/// Incoming MIDI handed up to the forwarding engine:
/// `(source node, source device, hops remaining, bytes)`.
pub type RemoteMidiHandler = Arc<dyn Fn(NodeId, u16, u8, &[u8]) + Send + Sync>;

/// Invoked once per connection when it leaves the mesh, gracefully or
/// not. Must not block and must not join the worker synchronously.
pub type ConnectionLostHandler = Arc<dyn Fn(NodeId, &str) + Send + Sync>;

/// Everything a peer worker needs from the rest of the node.
pub struct PeerContext {
    pub local_node: NodeId,
    pub local_name: String,
    pub registry: Arc<DeviceRegistry>,
    pub on_remote_midi: RemoteMidiHandler,
    pub on_connection_lost: ConnectionLostHandler,
    pub timings: PeerTimings,
}

/// Observable state mirror. Written only by the worker; everyone else
/// reads. The mirror exists so the pool can reap without a query
/// round-trip.
pub struct StateCell {
    state: AtomicU8,
    terminal_since: Mutex<Option<Instant>>,
    owner: Mutex<Option<tokio::task::Id>>,
}

impl StateCell {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            terminal_since: Mutex::new(Some(Instant::now())),
            owner: Mutex::new(None),
        }
    }

    fn claim_owner(&self) {
        *self.owner.lock().unwrap() = tokio::task::try_id();
    }

    fn set(&self, next: ConnectionState) {
        debug_assert_eq!(
            *self.owner.lock().unwrap(),
            tokio::task::try_id(),
            "peer state mutated outside its worker task"
        );
        self.state.store(next as u8, Ordering::Release);
        *self.terminal_since.lock().unwrap() = next.is_terminal().then(Instant::now);
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// How long the connection has been Disconnected or Failed.
    pub fn terminal_for(&self) -> Option<Duration> {
        self.terminal_since.lock().unwrap().map(|t| t.elapsed())
    }
}

#[derive(Debug, Default)]
pub struct PeerCounters {
    pub sent_datagram: AtomicU64,
    pub sent_stream: AtomicU64,
    pub dropped_sends: AtomicU64,
    pub received_midi: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCounterStats {
    pub sent_datagram: u64,
    pub sent_stream: u64,
    pub dropped_sends: u64,
    pub received_midi: u64,
    pub datagram: DatagramStats,
}

/// The caller-facing side of a peer connection. Every method pushes a
/// command or reads the mirror; none touches worker state.
pub struct PeerHandle {
    node_id: NodeId,
    tx: CommandTx,
    state: Arc<StateCell>,
    counters: Arc<PeerCounters>,
    datagram_counters: Mutex<Option<Arc<crate::transport::DatagramCounters>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeerHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn terminal_for(&self) -> Option<Duration> {
        self.state.terminal_for()
    }

    pub fn counters(&self) -> PeerCounterStats {
        let datagram = self
            .datagram_counters
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.snapshot())
            .unwrap_or_default();
        PeerCounterStats {
            sent_datagram: self.counters.sent_datagram.load(Ordering::Relaxed),
            sent_stream: self.counters.sent_stream.load(Ordering::Relaxed),
            dropped_sends: self.counters.dropped_sends.load(Ordering::Relaxed),
            received_midi: self.counters.received_midi.load(Ordering::Relaxed),
            datagram,
        }
    }

    pub fn connect(&self) -> Result<(), SendError> {
        self.tx.push(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<(), SendError> {
        self.tx.push(Command::Disconnect)
    }

    /// Fire-and-forget MIDI toward this peer. Backpressure is the
    /// caller's signal to count a drop; nothing ever blocks here.
    pub fn send_midi(&self, device_id: u16, ttl: u8, bytes: Vec<u8>) -> Result<(), SendError> {
        self.tx.push(Command::SendMidi {
            device_id,
            bytes,
            ttl,
        })
    }

    /// Heartbeat probe from the monitor. A full queue means the worker
    /// is busy; skipping a probe is harmless.
    pub fn check_heartbeat(&self) {
        let _ = self.tx.push(Command::CheckHeartbeat);
    }

    pub async fn state(&self, timeout: Duration) -> Result<ConnectionState, QueryError> {
        let (tx, rx) = oneshot::channel();
        self.query(Query::State(tx))?;
        Self::await_reply(rx, timeout).await
    }

    pub async fn peer_info(&self, timeout: Duration) -> Result<Option<PeerInfo>, QueryError> {
        let (tx, rx) = oneshot::channel();
        self.query(Query::PeerInfo(tx))?;
        Self::await_reply(rx, timeout).await
    }

    pub async fn remote_devices(
        &self,
        timeout: Duration,
    ) -> Result<Vec<DeviceDescriptor>, QueryError> {
        let (tx, rx) = oneshot::channel();
        self.query(Query::RemoteDevices(tx))?;
        Self::await_reply(rx, timeout).await
    }

    pub async fn time_since_last_heartbeat(
        &self,
        timeout: Duration,
    ) -> Result<Option<Duration>, QueryError> {
        let (tx, rx) = oneshot::channel();
        self.query(Query::TimeSinceLastHeartbeat(tx))?;
        Self::await_reply(rx, timeout).await
    }

    fn query(&self, query: Query) -> Result<(), QueryError> {
        self.tx.push(Command::Query(query)).map_err(|e| match e {
            SendError::Backpressure => QueryError::Backpressure,
            SendError::Closed => QueryError::ShuttingDown,
        })
    }

    async fn await_reply<T>(rx: oneshot::Receiver<T>, timeout: Duration) -> Result<T, QueryError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // Worker dropped the slot: it is on its way out
            Ok(Err(_)) => Err(QueryError::ShuttingDown),
            Err(_) => Err(QueryError::Timeout),
        }
    }

    /// Final teardown: deliver Shutdown (waiting for queue space if
    /// necessary) and join the worker.
    pub async fn shutdown_and_join(&self) {
        let _ = self.tx.push_wait(Command::Shutdown).await;
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Create the worker for a peer this node dials. It sits Disconnected
/// until a `Connect` command arrives.
pub fn spawn_outbound(endpoint: PeerEndpoint, ctx: Arc<PeerContext>) -> Arc<PeerHandle> {
    spawn_worker(endpoint.node_id, Some(endpoint), None, ctx)
}

/// Create the worker for a peer that dialed us. `hello` was already
/// read by the accept loop; the worker replies WELCOME and goes
/// straight to Connected.
pub fn spawn_inbound(
    stream: TcpStream,
    hello: Hello,
    decoder: RecordDecoder,
    ctx: Arc<PeerContext>,
) -> io::Result<Arc<PeerHandle>> {
    let peer_addr = stream.peer_addr()?;
    let start = InboundStart {
        stream,
        hello: hello.clone(),
        decoder,
        peer_addr,
    };
    Ok(spawn_worker(hello.node_id, None, Some(start), ctx))
}

struct InboundStart {
    stream: TcpStream,
    hello: Hello,
    decoder: RecordDecoder,
    peer_addr: SocketAddr,
}

fn spawn_worker(
    node_id: NodeId,
    endpoint: Option<PeerEndpoint>,
    inbound: Option<InboundStart>,
    ctx: Arc<PeerContext>,
) -> Arc<PeerHandle> {
    let (tx, cmd_rx) = command_queue();
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let state = Arc::new(StateCell::new());
    let counters = Arc::new(PeerCounters::default());

    let handle = Arc::new(PeerHandle {
        node_id,
        tx,
        state: Arc::clone(&state),
        counters: Arc::clone(&counters),
        datagram_counters: Mutex::new(None),
        worker: Mutex::new(None),
    });

    let worker = PeerWorker {
        ctx,
        node_id,
        endpoint,
        state_cell: state,
        counters,
        cmd_rx,
        inbox_tx,
        inbox_rx,
        handle: Arc::downgrade(&handle),
        peer_info: None,
        remote_devices: Vec::new(),
        last_heartbeat_rx: None,
        datagram: None,
        stream: None,
        notified_lost: false,
    };
    let join = tokio::spawn(worker.run(inbound));
    *handle.worker.lock().unwrap() = Some(join);
    handle
}

/// The single task that owns all state for one peer. Commands and
/// transport events funnel into its two queues; nothing else mutates.
struct PeerWorker {
    ctx: Arc<PeerContext>,
    /// The peer's node id — expected (outbound) or from HELLO (inbound).
    node_id: NodeId,
    endpoint: Option<PeerEndpoint>,
    state_cell: Arc<StateCell>,
    counters: Arc<PeerCounters>,
    cmd_rx: mpsc::Receiver<Command>,
    inbox_tx: mpsc::Sender<Inbound>,
    inbox_rx: mpsc::Receiver<Inbound>,
    handle: std::sync::Weak<PeerHandle>,
    peer_info: Option<PeerInfo>,
    remote_devices: Vec<DeviceDescriptor>,
    last_heartbeat_rx: Option<Instant>,
    datagram: Option<DatagramSession>,
    stream: Option<StreamSession>,
    notified_lost: bool,
}

impl PeerWorker {
    async fn run(mut self, inbound: Option<InboundStart>) {
        self.state_cell.claim_owner();

        if let Some(start) = inbound {
            if let Err(e) = self.welcome_peer(start).await {
                self.fail(&e.to_string());
            }
        }

        let mut heartbeat = tokio::time::interval(self.ctx.timings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => {
                            self.shutdown().await;
                            break;
                        }
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                    }
                }
                Some(event) = self.inbox_rx.recv() => {
                    self.handle_inbound(event);
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat().await;
                }
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.state_cell.get()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state_cell.set(next);
    }

    /// Returns true when the worker should exit its loop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect => {
                if self.state() != ConnectionState::Disconnected {
                    debug!(peer = %self.node_id, state = ?self.state(), "Connect ignored");
                    return false;
                }
                if let Err(e) = self.connect_outbound().await {
                    self.fail(&e.to_string());
                }
            }
            Command::Disconnect => self.graceful_disconnect("disconnect requested").await,
            Command::SendMidi {
                device_id,
                bytes,
                ttl,
            } => self.send_midi(device_id, ttl, bytes).await,
            Command::CheckHeartbeat => self.check_heartbeat(),
            Command::Query(query) => self.answer(query),
            Command::Shutdown => {
                self.shutdown().await;
                return true;
            }
        }
        false
    }

    // -- Outbound connect & handshake --

    async fn connect_outbound(&mut self) -> Result<(), ConnectionError> {
        let Some(endpoint) = self.endpoint.clone() else {
            return Err(ConnectionError::ProtocolViolation(
                "inbound connection cannot dial".to_string(),
            ));
        };
        self.set_state(ConnectionState::Connecting);

        match tokio::time::timeout(
            self.ctx.timings.handshake_timeout,
            self.handshake_outbound(&endpoint),
        )
        .await
        {
            Err(_) => Err(ConnectionError::HandshakeTimeout),
            Ok(result) => result,
        }
    }

    async fn handshake_outbound(&mut self, endpoint: &PeerEndpoint) -> Result<(), ConnectionError> {
        let stream_addr = SocketAddr::new(endpoint.address, endpoint.stream_port);
        let mut stream = TcpStream::connect(stream_addr).await?;
        stream.set_nodelay(true)?;
        let mut datagram = DatagramSession::bind(endpoint.address.is_ipv6())?;

        let hello = Hello {
            node_id: self.ctx.local_node,
            name: self.ctx.local_name.clone(),
            protocol_version: PROTOCOL_VERSION,
            datagram_port: datagram.local_port()?,
        };
        let mut buf = Vec::with_capacity(256);
        Record::Hello(hello)
            .encode(&mut buf)
            .map_err(|e| ConnectionError::ProtocolViolation(e.to_string()))?;
        stream.write_all(&buf).await?;
        self.set_state(ConnectionState::Handshaking);

        // Block on WELCOME; the surrounding timeout bounds the wait
        let mut decoder = RecordDecoder::new();
        let mut chunk = [0u8; 4096];
        let welcome: Welcome = loop {
            match decoder
                .next()
                .map_err(|e| ConnectionError::ProtocolViolation(e.to_string()))?
            {
                Some(Record::Welcome(welcome)) => break welcome,
                Some(_) => {
                    return Err(ConnectionError::ProtocolViolation(
                        "expected WELCOME".to_string(),
                    ))
                }
                None => {}
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ConnectionError::ProtocolViolation(
                    "stream closed during handshake".to_string(),
                ));
            }
            decoder.extend(&chunk[..n]);
        };

        if welcome.protocol_version != PROTOCOL_VERSION {
            return Err(ConnectionError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: welcome.protocol_version,
            });
        }
        if welcome.node_id != self.node_id {
            return Err(ConnectionError::UnexpectedPeer {
                expected: self.node_id,
                actual: welcome.node_id,
            });
        }

        let peer_datagram = SocketAddr::new(endpoint.address, welcome.datagram_port);
        datagram.start(peer_datagram, self.inbox_tx.clone());
        self.publish_datagram_counters(&datagram);

        self.peer_info = Some(PeerInfo {
            node_id: welcome.node_id,
            name: welcome.name.clone(),
            address: endpoint.address,
            datagram_endpoint: peer_datagram,
            stream_endpoint: stream_addr,
            protocol_version: welcome.protocol_version,
        });
        self.remote_devices = welcome.devices.clone();
        self.ctx
            .registry
            .replace_remote(welcome.node_id, &welcome.devices);

        let mut session = StreamSession::start(stream, decoder, self.inbox_tx.clone());

        // WELCOME only carries the acceptor's devices; answer with ours
        let update = Record::DeviceUpdate(DeviceUpdate {
            devices: self.ctx.registry.local_descriptors(),
        });
        session.send(&update).await?;

        self.stream = Some(session);
        self.datagram = Some(datagram);
        self.last_heartbeat_rx = Some(Instant::now());
        self.set_state(ConnectionState::Connected);
        info!(peer = %self.node_id, name = %welcome.name, "Peer connected");
        Ok(())
    }

    // -- Inbound accept --

    async fn welcome_peer(&mut self, start: InboundStart) -> Result<(), ConnectionError> {
        if start.hello.protocol_version != PROTOCOL_VERSION {
            return Err(ConnectionError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: start.hello.protocol_version,
            });
        }
        self.set_state(ConnectionState::Handshaking);

        let mut datagram = DatagramSession::bind(start.peer_addr.is_ipv6())?;
        let welcome = Welcome {
            node_id: self.ctx.local_node,
            name: self.ctx.local_name.clone(),
            protocol_version: PROTOCOL_VERSION,
            datagram_port: datagram.local_port()?,
            devices: self.ctx.registry.local_descriptors(),
        };

        let mut stream = start.stream;
        stream.set_nodelay(true)?;
        let mut buf = Vec::with_capacity(512);
        Record::Welcome(welcome)
            .encode(&mut buf)
            .map_err(|e| ConnectionError::ProtocolViolation(e.to_string()))?;
        stream.write_all(&buf).await?;

        let peer_datagram = SocketAddr::new(start.peer_addr.ip(), start.hello.datagram_port);
        datagram.start(peer_datagram, self.inbox_tx.clone());
        self.publish_datagram_counters(&datagram);

        self.peer_info = Some(PeerInfo {
            node_id: start.hello.node_id,
            name: start.hello.name.clone(),
            address: start.peer_addr.ip(),
            datagram_endpoint: peer_datagram,
            stream_endpoint: start.peer_addr,
            protocol_version: start.hello.protocol_version,
        });
        self.stream = Some(StreamSession::start(
            stream,
            start.decoder,
            self.inbox_tx.clone(),
        ));
        self.datagram = Some(datagram);
        self.last_heartbeat_rx = Some(Instant::now());
        self.set_state(ConnectionState::Connected);
        info!(peer = %self.node_id, name = %start.hello.name, "Accepted peer connection");
        Ok(())
    }

    fn publish_datagram_counters(&self, datagram: &DatagramSession) {
        if let Some(handle) = self.handle.upgrade() {
            *handle.datagram_counters.lock().unwrap() = Some(datagram.counters());
        }
    }

    // -- Send path --

    async fn send_midi(&mut self, device_id: u16, ttl: u8, bytes: Vec<u8>) {
        if self.state() != ConnectionState::Connected {
            // No offline queue: for notes, late beats lost
            self.counters.dropped_sends.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match classify(&bytes) {
            Class::Realtime => {
                let Some(datagram) = self.datagram.as_mut() else {
                    self.counters.dropped_sends.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                match datagram.send_midi(device_id, ttl, &bytes).await {
                    Ok(()) => {
                        self.counters.sent_datagram.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.counters.dropped_sends.fetch_add(1, Ordering::Relaxed);
                        debug!(peer = %self.node_id, error = %e, "Datagram send failed");
                    }
                }
            }
            Class::NonRealtime => {
                let Some(stream) = self.stream.as_mut() else {
                    self.counters.dropped_sends.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                let record = Record::Midi(MidiRecord {
                    device_id,
                    ttl,
                    data: bytes,
                });
                match stream.send(&record).await {
                    Ok(()) => {
                        self.counters.sent_stream.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        // Ordered path is gone; heartbeats decide whether
                        // the whole connection follows.
                        self.counters.dropped_sends.fetch_add(1, Ordering::Relaxed);
                        warn!(peer = %self.node_id, error = %e, "Stream send failed, dropping ordered path");
                        self.stream = None;
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let local_node = self.ctx.local_node;
        if let Some(datagram) = self.datagram.as_mut() {
            if let Err(e) = datagram.send_heartbeat(local_node).await {
                debug!(peer = %self.node_id, error = %e, "Heartbeat send failed");
            }
        }
    }

    fn check_heartbeat(&mut self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let Some(last) = self.last_heartbeat_rx else {
            return;
        };
        let elapsed = last.elapsed();
        if elapsed > self.ctx.timings.heartbeat_timeout {
            self.fail(&format!(
                "heartbeat timeout after {} ms",
                elapsed.as_millis()
            ));
        }
    }

    // -- Receive path --

    fn handle_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Midi {
                device_id,
                ttl,
                bytes,
            } => self.deliver_midi(device_id, ttl, &bytes),
            Inbound::Heartbeat { node_id } => {
                if node_id == self.node_id {
                    self.last_heartbeat_rx = Some(Instant::now());
                } else {
                    debug!(peer = %self.node_id, claimed = %node_id, "Heartbeat from wrong node id");
                }
            }
            Inbound::Record(record) => self.handle_record(record),
            Inbound::StreamClosed { reason } => {
                if self.state() == ConnectionState::Connected {
                    warn!(peer = %self.node_id, reason = %reason, "Stream reader stopped");
                    self.stream = None;
                }
            }
            Inbound::ProtocolViolation { reason } => {
                self.fail(&format!("protocol violation: {reason}"));
            }
        }
    }

    fn deliver_midi(&self, device_id: u16, ttl: u8, bytes: &[u8]) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        self.counters.received_midi.fetch_add(1, Ordering::Relaxed);
        (self.ctx.on_remote_midi)(self.node_id, device_id, ttl, bytes);
    }

    fn handle_record(&mut self, record: Record) {
        match record {
            Record::Midi(m) => self.deliver_midi(m.device_id, m.ttl, &m.data),
            Record::DeviceUpdate(update) => {
                if self.state() == ConnectionState::Connected {
                    debug!(peer = %self.node_id, count = update.devices.len(), "Device update");
                    self.remote_devices = update.devices.clone();
                    self.ctx.registry.replace_remote(self.node_id, &update.devices);
                }
            }
            Record::Bye => {
                info!(peer = %self.node_id, "Peer said goodbye");
                self.close_transports();
                self.set_state(ConnectionState::Disconnected);
                self.notify_lost("peer disconnected");
            }
            Record::Hello(_) => self.fail("duplicate HELLO"),
            Record::Welcome(_) => self.fail("unexpected WELCOME"),
        }
    }

    // -- Queries --

    fn answer(&self, query: Query) {
        match query {
            Query::State(tx) => {
                let _ = tx.send(self.state());
            }
            Query::PeerInfo(tx) => {
                let _ = tx.send(self.peer_info.clone());
            }
            Query::RemoteDevices(tx) => {
                let _ = tx.send(self.remote_devices.clone());
            }
            Query::TimeSinceLastHeartbeat(tx) => {
                let _ = tx.send(self.last_heartbeat_rx.map(|t| t.elapsed()));
            }
        }
    }

    // -- Teardown --

    fn fail(&mut self, reason: &str) {
        if self.state() == ConnectionState::Failed {
            return;
        }
        error!(peer = %self.node_id, reason = %reason, "Connection failed");
        self.close_transports();
        self.set_state(ConnectionState::Failed);
        self.notify_lost(reason);
    }

    async fn graceful_disconnect(&mut self, reason: &str) {
        if self.state() == ConnectionState::Connected {
            if let Some(stream) = self.stream.as_mut() {
                let _ = stream.send(&Record::Bye).await;
            }
        }
        self.close_transports();
        self.set_state(ConnectionState::Disconnected);
        self.notify_lost(reason);
    }

    /// Drain pending sends, say BYE, close everything, exit. Queries
    /// still queued have their reply slots dropped, which surfaces
    /// `ShuttingDown` at the caller.
    async fn shutdown(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::SendMidi {
                    device_id,
                    bytes,
                    ttl,
                } => self.send_midi(device_id, ttl, bytes).await,
                Command::Query(query) => drop(query),
                _ => {}
            }
        }
        if self.state() == ConnectionState::Connected {
            if let Some(stream) = self.stream.as_mut() {
                let _ = stream.send(&Record::Bye).await;
            }
        }
        self.close_transports();
        // Failed stays visible for post-mortem inspection
        if self.state() != ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected);
        }
        debug!(peer = %self.node_id, "Peer worker stopped");
    }

    fn close_transports(&mut self) {
        if let Some(mut datagram) = self.datagram.take() {
            datagram.close();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }

    fn notify_lost(&mut self, reason: &str) {
        if !self.notified_lost {
            self.notified_lost = true;
            (self.ctx.on_connection_lost)(self.node_id, reason);
        }
    }
}
