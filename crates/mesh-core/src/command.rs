use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use mesh_proto::device::DeviceDescriptor;
use mesh_proto::COMMAND_QUEUE_CAPACITY;

use crate::error::SendError;
use crate::peer::{ConnectionState, PeerInfo};

/// Everything a peer worker can be asked to do. The queue is the only
/// way in: callers push, the single worker pops, nobody shares state.
#[derive(Debug)]
pub enum Command {
    /// Open transports and run the handshake.
    Connect,
    /// Graceful teardown with a best-effort BYE.
    Disconnect,
    /// Final teardown; drains pending sends, then the worker exits.
    Shutdown,
    /// Fire-and-forget MIDI toward the peer.
    SendMidi {
        device_id: u16,
        bytes: Vec<u8>,
        ttl: u8,
    },
    /// Heartbeat-timeout probe, driven by the monitor.
    CheckHeartbeat,
    /// Synchronous read of worker-owned state.
    Query(Query),
}

/// Read requests with one-shot reply slots. The worker always answers;
/// if it is gone, the dropped sender wakes the caller with
/// `QueryError::ShuttingDown`, so no waiter ever leaks.
#[derive(Debug)]
pub enum Query {
    State(oneshot::Sender<ConnectionState>),
    PeerInfo(oneshot::Sender<Option<PeerInfo>>),
    RemoteDevices(oneshot::Sender<Vec<DeviceDescriptor>>),
    TimeSinceLastHeartbeat(oneshot::Sender<Option<Duration>>),
}

/// Bounded MPSC command queue for one peer worker. FIFO per producer
/// and globally; overflow is reported, never blocked on.
pub fn command_queue() -> (CommandTx, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    (CommandTx { tx }, rx)
}

#[derive(Clone)]
pub struct CommandTx {
    tx: mpsc::Sender<Command>,
}

impl CommandTx {
    /// Non-blocking push. `Backpressure` when the queue is full,
    /// `Closed` once the worker has exited.
    pub fn push(&self, command: Command) -> Result<(), SendError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Awaiting push for control-plane commands that should not be
    /// dropped under load (Connect, Shutdown).
    pub async fn push_wait(&self, command: Command) -> Result<(), SendError> {
        self.tx.send(command).await.map_err(|_| SendError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = command_queue();
        tx.push(Command::Connect).unwrap();
        tx.push(Command::SendMidi {
            device_id: 1,
            bytes: vec![0xF8],
            ttl: 4,
        })
        .unwrap();
        tx.push(Command::Shutdown).unwrap();

        assert!(matches!(rx.recv().await, Some(Command::Connect)));
        assert!(matches!(rx.recv().await, Some(Command::SendMidi { .. })));
        assert!(matches!(rx.recv().await, Some(Command::Shutdown)));
    }

    #[tokio::test]
    async fn test_backpressure_reports_not_blocks() {
        let (tx, rx) = command_queue();
        let mut pushed = 0usize;
        loop {
            match tx.push(Command::CheckHeartbeat) {
                Ok(()) => pushed += 1,
                Err(SendError::Backpressure) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(pushed, COMMAND_QUEUE_CAPACITY);
        drop(rx);
        assert_eq!(tx.push(Command::Connect), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_dropped_reply_slot_wakes_caller() {
        let (reply_tx, reply_rx) = oneshot::channel::<ConnectionState>();
        let query = Query::State(reply_tx);
        drop(query); // worker gone before answering
        assert!(reply_rx.await.is_err());
    }
}
