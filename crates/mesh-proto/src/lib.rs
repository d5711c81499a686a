pub mod classify;
pub mod device;
pub mod frames;
pub mod node;
pub mod records;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Default ports
pub const DEFAULT_STREAM_PORT: u16 = 5040;
pub const DEFAULT_DATAGRAM_PORT: u16 = 5041;
pub const DEFAULT_CONTROL_PORT: u16 = 8070;

/// Liveness timing defaults
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 3_000;

/// How far a datagram sequence number may regress before the receiver
/// discards the frame as stale.
pub const REORDER_WINDOW: u32 = 64;

/// Per-peer command queue capacity. Overflow is dropped, not queued.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Largest stream record body we accept before declaring the peer broken.
pub const MAX_RECORD_LEN: u32 = 1024 * 1024;

/// Hop budget carried by forwarded events. The wire field is 5 bits.
pub const DEFAULT_TTL: u8 = 4;
pub const MAX_TTL: u8 = 31;
