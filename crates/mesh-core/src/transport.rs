use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use mesh_proto::frames::{Frame, HeartbeatFrame, MidiFrame};
use mesh_proto::node::NodeId;
use mesh_proto::records::{Record, RecordDecoder};
use mesh_proto::REORDER_WINDOW;

/// Events the transport readers push into the peer worker's inbox.
/// Readers own no peer state; enqueueing is their only side effect.
#[derive(Debug)]
pub enum Inbound {
    /// MIDI that arrived on the datagram path.
    Midi {
        device_id: u16,
        ttl: u8,
        bytes: Vec<u8>,
    },
    Heartbeat {
        node_id: NodeId,
    },
    /// A complete record from the stream path.
    Record(Record),
    /// The stream reader stopped on EOF or a read error.
    StreamClosed {
        reason: String,
    },
    /// The stream carried bytes that cannot be a valid record.
    ProtocolViolation {
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct DatagramCounters {
    pub received: AtomicU64,
    pub dropped_malformed: AtomicU64,
    pub dropped_stale: AtomicU64,
    pub dropped_foreign: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatagramStats {
    pub received: u64,
    pub dropped_malformed: u64,
    pub dropped_stale: u64,
    pub dropped_foreign: u64,
}

impl DatagramCounters {
    pub fn snapshot(&self) -> DatagramStats {
        DatagramStats {
            received: self.received.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            dropped_foreign: self.dropped_foreign.load(Ordering::Relaxed),
        }
    }
}

/// Create a nonblocking UDP socket bound to an ephemeral port in the
/// target's address family.
fn bind_datagram_socket(family: Domain) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(family, Type::DGRAM, Some(Protocol::UDP))?;
    let addr: SocketAddr = if family == Domain::IPV6 {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// The unreliable per-peer MIDI path. One UDP socket per peer; frames
/// go to the endpoint the peer advertised in its handshake, heartbeats
/// share the socket.
pub struct DatagramSession {
    socket: Arc<UdpSocket>,
    target: Option<SocketAddr>,
    seq: u32,
    hb_seq: u32,
    send_buf: Vec<u8>,
    counters: Arc<DatagramCounters>,
    reader: Option<JoinHandle<()>>,
}

impl DatagramSession {
    /// Bind before the handshake so HELLO can advertise the port.
    pub fn bind(ipv6: bool) -> io::Result<Self> {
        let family = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let std_socket = bind_datagram_socket(family)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        Ok(Self {
            socket,
            target: None,
            seq: 0,
            hb_seq: 0,
            send_buf: Vec::with_capacity(256),
            counters: Arc::new(DatagramCounters::default()),
            reader: None,
        })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Point the session at the peer and start the reader task. Called
    /// once the peer's datagram endpoint is known.
    pub fn start(&mut self, target: SocketAddr, inbox: mpsc::Sender<Inbound>) {
        self.target = Some(target);
        let reader = tokio::spawn(run_datagram_reader(
            Arc::clone(&self.socket),
            target,
            Arc::clone(&self.counters),
            inbox,
        ));
        self.reader = Some(reader);
    }

    pub async fn send_midi(&mut self, device_id: u16, ttl: u8, bytes: &[u8]) -> io::Result<()> {
        let target = self
            .target
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no datagram target"))?;
        self.seq = self.seq.wrapping_add(1);
        let frame = MidiFrame {
            device_id,
            seq: self.seq,
            ttl,
            payload: bytes.to_vec(),
        };
        frame.serialize(&mut self.send_buf);
        self.socket.send_to(&self.send_buf, target).await?;
        Ok(())
    }

    pub async fn send_heartbeat(&mut self, node_id: NodeId) -> io::Result<()> {
        let target = self
            .target
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no datagram target"))?;
        self.hb_seq = self.hb_seq.wrapping_add(1);
        let frame = HeartbeatFrame {
            node_id,
            seq: self.hb_seq,
        };
        frame.serialize(&mut self.send_buf);
        self.socket.send_to(&self.send_buf, target).await?;
        Ok(())
    }

    pub fn counters(&self) -> Arc<DatagramCounters> {
        Arc::clone(&self.counters)
    }

    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for DatagramSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_datagram_reader(
    socket: Arc<UdpSocket>,
    expected_from: SocketAddr,
    counters: Arc<DatagramCounters>,
    inbox: mpsc::Sender<Inbound>,
) {
    let mut buf = [0u8; 1500]; // MTU-sized buffer
    let mut highest_seq: Option<u32> = None;

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if from != expected_from {
                    counters.dropped_foreign.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                match Frame::deserialize(&buf[..len]) {
                    Some(Frame::Midi(frame)) => {
                        counters.received.fetch_add(1, Ordering::Relaxed);
                        // Tolerate reordering within the window, drop
                        // anything that regressed further than that.
                        if let Some(highest) = highest_seq {
                            let ahead = frame.seq.wrapping_sub(highest) as i32;
                            if ahead > 0 {
                                highest_seq = Some(frame.seq);
                            } else if ahead.unsigned_abs() > REORDER_WINDOW {
                                counters.dropped_stale.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                        } else {
                            highest_seq = Some(frame.seq);
                        }
                        let event = Inbound::Midi {
                            device_id: frame.device_id,
                            ttl: frame.ttl,
                            bytes: frame.payload,
                        };
                        if inbox.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(Frame::Heartbeat(hb)) => {
                        if inbox
                            .send(Inbound::Heartbeat {
                                node_id: hb.node_id,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    None => {
                        counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Datagram receive error");
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}

/// The reliable, ordered per-peer path: length-prefixed records over
/// the connection's TCP stream. The worker owns the write half; the
/// reader task feeds decoded records into the inbox.
pub struct StreamSession {
    writer: tokio::net::tcp::OwnedWriteHalf,
    send_buf: Vec<u8>,
    reader: JoinHandle<()>,
}

impl StreamSession {
    /// Split the stream after the handshake. `decoder` carries any
    /// bytes read past the handshake records.
    pub fn start(stream: TcpStream, decoder: RecordDecoder, inbox: mpsc::Sender<Inbound>) -> Self {
        let (read_half, writer) = stream.into_split();
        let reader = tokio::spawn(run_stream_reader(read_half, decoder, inbox));
        Self {
            writer,
            send_buf: Vec::with_capacity(512),
            reader,
        }
    }

    pub async fn send(&mut self, record: &Record) -> io::Result<()> {
        self.send_buf.clear();
        record
            .encode(&mut self.send_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(&self.send_buf).await
    }

    pub fn close(&mut self) {
        self.reader.abort();
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_stream_reader(
    mut read_half: OwnedReadHalf,
    mut decoder: RecordDecoder,
    inbox: mpsc::Sender<Inbound>,
) {
    let mut chunk = [0u8; 4096];
    loop {
        loop {
            match decoder.next() {
                Ok(Some(record)) => {
                    if inbox.send(Inbound::Record(record)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = inbox
                        .send(Inbound::ProtocolViolation {
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }

        match read_half.read(&mut chunk).await {
            Ok(0) => {
                let _ = inbox
                    .send(Inbound::StreamClosed {
                        reason: "peer closed stream".to_string(),
                    })
                    .await;
                return;
            }
            Ok(n) => decoder.extend(&chunk[..n]),
            Err(e) => {
                let _ = inbox
                    .send(Inbound::StreamClosed {
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_proto::records::MidiRecord;
    use tokio::net::TcpListener;

    async fn datagram_pair() -> (DatagramSession, DatagramSession, mpsc::Receiver<Inbound>) {
        let mut a = DatagramSession::bind(false).unwrap();
        let mut b = DatagramSession::bind(false).unwrap();

        let a_addr: SocketAddr = format!("127.0.0.1:{}", a.local_port().unwrap())
            .parse()
            .unwrap();
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_port().unwrap())
            .parse()
            .unwrap();

        let (a_inbox_tx, _a_inbox_rx) = mpsc::channel(64);
        let (b_inbox_tx, b_inbox_rx) = mpsc::channel(64);
        a.start(b_addr, a_inbox_tx);
        b.start(a_addr, b_inbox_tx);
        (a, b, b_inbox_rx)
    }

    #[tokio::test]
    async fn test_datagram_midi_roundtrip() {
        let (mut a, _b, mut b_inbox) = datagram_pair().await;

        a.send_midi(2, 4, &[0x90, 0x3C, 0x64]).await.unwrap();

        match b_inbox.recv().await.unwrap() {
            Inbound::Midi {
                device_id,
                ttl,
                bytes,
            } => {
                assert_eq!(device_id, 2);
                assert_eq!(ttl, 4);
                assert_eq!(bytes, vec![0x90, 0x3C, 0x64]);
            }
            other => panic!("expected MIDI, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_datagram_heartbeat_roundtrip() {
        let (mut a, _b, mut b_inbox) = datagram_pair().await;
        let node = NodeId::generate();

        a.send_heartbeat(node).await.unwrap();

        match b_inbox.recv().await.unwrap() {
            Inbound::Heartbeat { node_id } => assert_eq!(node_id, node),
            other => panic!("expected heartbeat, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reorder_window_drops_stale_frames() {
        let mut b = DatagramSession::bind(false).unwrap();
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_port().unwrap())
            .parse()
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender_addr = sender.local_addr().unwrap();

        let (inbox_tx, mut inbox) = mpsc::channel(64);
        b.start(sender_addr, inbox_tx);
        let counters = b.counters();

        let mut buf = Vec::new();
        for (seq, note) in [(100u32, 0x10u8), (10, 0x20), (90, 0x30)] {
            MidiFrame {
                device_id: 1,
                seq,
                ttl: 4,
                payload: vec![0x90, note, 0x40],
            }
            .serialize(&mut buf);
            sender.send_to(&buf, b_addr).await.unwrap();
        }

        // seq 100 establishes the high-water mark; seq 10 regressed by
        // 90 (past the window) and is dropped; seq 90 is within it.
        let mut notes = Vec::new();
        for _ in 0..2 {
            match inbox.recv().await.unwrap() {
                Inbound::Midi { bytes, .. } => notes.push(bytes[1]),
                other => panic!("expected MIDI, got {:?}", other),
            }
        }
        assert_eq!(notes, vec![0x10, 0x30]);
        assert_eq!(counters.snapshot().dropped_stale, 1);
        assert_eq!(counters.snapshot().received, 3);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_frames_from_unexpected_sources_are_ignored() {
        let mut b = DatagramSession::bind(false).unwrap();
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_port().unwrap())
            .parse()
            .unwrap();

        let expected = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (inbox_tx, mut inbox) = mpsc::channel(64);
        b.start(expected.local_addr().unwrap(), inbox_tx);
        let counters = b.counters();

        let mut buf = Vec::new();
        MidiFrame {
            device_id: 1,
            seq: 1,
            ttl: 4,
            payload: vec![0xF8],
        }
        .serialize(&mut buf);
        stranger.send_to(&buf, b_addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        expected.send_to(&buf, b_addr).await.unwrap();

        match inbox.recv().await.unwrap() {
            Inbound::Midi { bytes, .. } => assert_eq!(bytes, vec![0xF8]),
            other => panic!("expected MIDI, got {:?}", other),
        }
        assert_eq!(counters.snapshot().dropped_foreign, 1);
        assert_eq!(counters.snapshot().received, 1);
    }

    #[tokio::test]
    async fn test_stream_session_roundtrip_preserves_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (client_inbox_tx, _client_inbox) = mpsc::channel(64);
        let (server_inbox_tx, mut server_inbox) = mpsc::channel(64);
        let mut client_session =
            StreamSession::start(client, RecordDecoder::new(), client_inbox_tx);
        let _server_session = StreamSession::start(server, RecordDecoder::new(), server_inbox_tx);

        for i in 0..10u16 {
            client_session
                .send(&Record::Midi(MidiRecord {
                    device_id: i,
                    ttl: 4,
                    data: vec![0xF0, i as u8, 0xF7],
                }))
                .await
                .unwrap();
        }

        for i in 0..10u16 {
            match server_inbox.recv().await.unwrap() {
                Inbound::Record(Record::Midi(m)) => assert_eq!(m.device_id, i),
                other => panic!("expected MIDI record, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_stream_garbage_reports_protocol_violation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (inbox_tx, mut inbox) = mpsc::channel(64);
        let _session = StreamSession::start(server, RecordDecoder::new(), inbox_tx);

        // Claimed length far beyond the record cap
        client.write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).await.unwrap();

        match inbox.recv().await.unwrap() {
            Inbound::ProtocolViolation { .. } => {}
            other => panic!("expected protocol violation, got {:?}", other),
        }
    }
}
