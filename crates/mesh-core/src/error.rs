use mesh_proto::node::NodeId;
use thiserror::Error;
use uuid::Uuid;

/// Failures on the connection plane. Workers never propagate these
/// across the command boundary; they become state transitions plus an
/// `on_connection_lost` callback.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("network: {0}")]
    TransientNetwork(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u8, theirs: u8 },

    #[error("peer identified as {actual}, expected {expected}")]
    UnexpectedPeer { expected: NodeId, actual: NodeId },

    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Why a synchronous read of peer state did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("connection is shutting down")]
    ShuttingDown,

    #[error("query timed out")]
    Timeout,

    #[error("peer command queue full")]
    Backpressure,
}

/// Why a fire-and-forget send was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("peer command queue full")]
    Backpressure,

    #[error("connection is shutting down")]
    Closed,
}

/// Forwarding-rule validation and persistence failures. Returned to the
/// control-plane caller; the rule set is left untouched.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("source device ({node}, {device}) not found")]
    SourceMissing { node: NodeId, device: u16 },

    #[error("destination device ({node}, {device}) not found")]
    DestinationMissing { node: NodeId, device: u16 },

    #[error("source device ({node}, {device}) is not an input")]
    SourceNotInput { node: NodeId, device: u16 },

    #[error("destination device ({node}, {device}) is not an output")]
    DestinationNotOutput { node: NodeId, device: u16 },

    #[error("rule routes a device to itself")]
    SelfRoute,

    #[error("duplicate rule: same source, destination, and priority")]
    DuplicateRule,

    #[error("channel filter {0} out of range 0..=15")]
    InvalidChannelFilter(u8),

    #[error("ttl {0} out of range 1..=31")]
    InvalidTtl(u8),

    #[error("no rule with id {0}")]
    UnknownRule(Uuid),

    #[error("routing file version {0} is not supported")]
    UnsupportedVersion(u32),

    #[error("failed to persist routes: {0}")]
    Persist(#[from] std::io::Error),

    #[error("malformed routing file: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Local-device registration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device ({node}, {device}) already registered")]
    DuplicateDevice { node: NodeId, device: u16 },
}
