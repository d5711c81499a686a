use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceDescriptor;
use crate::node::NodeId;
use crate::MAX_RECORD_LEN;

// -- Stream plane framing --
//
// [len(4 BE)][record_type(1)][body(len-1)]
//
// The stream carries the handshake, device-list updates, and MIDI too
// long or order-sensitive for the datagram path.

pub const RT_HELLO: u8 = 1;
pub const RT_WELCOME: u8 = 2;
pub const RT_BYE: u8 = 3;
pub const RT_MIDI: u8 = 4;
pub const RT_DEVICE_UPDATE: u8 = 5;

/// First record on a new stream, sent by the connecting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node_id: NodeId,
    pub name: String,
    pub protocol_version: u8,
    /// Port the sender receives datagrams on; the IP is taken from the
    /// stream's peer address.
    pub datagram_port: u16,
}

/// Handshake reply from the accepting side, carrying its device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub node_id: NodeId,
    pub name: String,
    pub protocol_version: u8,
    pub datagram_port: u16,
    pub devices: Vec<DeviceDescriptor>,
}

/// Full replacement of the sender's device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub devices: Vec<DeviceDescriptor>,
}

/// Ordered MIDI on the stream path. Hand-framed so the hot path never
/// touches a serde codec: `[device_id(2 BE)][ttl(1)][bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiRecord {
    pub device_id: u16,
    pub ttl: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Hello(Hello),
    Welcome(Welcome),
    Bye,
    Midi(MidiRecord),
    DeviceUpdate(DeviceUpdate),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record of {0} bytes exceeds the {MAX_RECORD_LEN} byte limit")]
    Oversized(u32),
    #[error("unknown record type 0x{0:02X}")]
    UnknownType(u8),
    #[error("malformed {0} body")]
    MalformedBody(&'static str),
    #[error("empty record")]
    Empty,
}

impl Record {
    fn type_byte(&self) -> u8 {
        match self {
            Record::Hello(_) => RT_HELLO,
            Record::Welcome(_) => RT_WELCOME,
            Record::Bye => RT_BYE,
            Record::Midi(_) => RT_MIDI,
            Record::DeviceUpdate(_) => RT_DEVICE_UPDATE,
        }
    }

    /// Append the full record, length prefix included, to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), bincode::Error> {
        let start = buf.len();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(self.type_byte());

        match self {
            Record::Hello(h) => bincode::serialize_into(&mut *buf, h)?,
            Record::Welcome(w) => bincode::serialize_into(&mut *buf, w)?,
            Record::Bye => {}
            Record::Midi(m) => {
                buf.extend_from_slice(&m.device_id.to_be_bytes());
                buf.push(m.ttl);
                buf.extend_from_slice(&m.data);
            }
            Record::DeviceUpdate(d) => bincode::serialize_into(&mut *buf, d)?,
        }

        let len = (buf.len() - start - 4) as u32;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    /// Decode a record body (everything after the length prefix).
    pub fn decode(record: &[u8]) -> Result<Record, RecordError> {
        let (&record_type, body) = record.split_first().ok_or(RecordError::Empty)?;
        match record_type {
            RT_HELLO => bincode::deserialize(body)
                .map(Record::Hello)
                .map_err(|_| RecordError::MalformedBody("HELLO")),
            RT_WELCOME => bincode::deserialize(body)
                .map(Record::Welcome)
                .map_err(|_| RecordError::MalformedBody("WELCOME")),
            RT_BYE => Ok(Record::Bye),
            RT_MIDI => {
                if body.len() < 3 {
                    return Err(RecordError::MalformedBody("MIDI"));
                }
                Ok(Record::Midi(MidiRecord {
                    device_id: u16::from_be_bytes([body[0], body[1]]),
                    ttl: body[2],
                    data: body[3..].to_vec(),
                }))
            }
            RT_DEVICE_UPDATE => bincode::deserialize(body)
                .map(Record::DeviceUpdate)
                .map_err(|_| RecordError::MalformedBody("DEVICE_UPDATE")),
            other => Err(RecordError::UnknownType(other)),
        }
    }
}

/// Incremental decoder for the stream's byte soup. Partial records are
/// buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buf: Vec<u8>,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete record, if any. An error here is a
    /// protocol violation and the connection should be failed.
    pub fn next(&mut self) -> Result<Option<Record>, RecordError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len == 0 {
            return Err(RecordError::Empty);
        }
        if len > MAX_RECORD_LEN {
            return Err(RecordError::Oversized(len));
        }
        let total = 4 + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let record = Record::decode(&self.buf[4..total])?;
        self.buf.drain(..total);
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Direction;
    use crate::PROTOCOL_VERSION;

    fn sample_hello() -> Hello {
        Hello {
            node_id: NodeId::generate(),
            name: "stage-left".to_string(),
            protocol_version: PROTOCOL_VERSION,
            datagram_port: 5041,
        }
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = sample_hello();
        let mut buf = Vec::new();
        Record::Hello(hello.clone()).encode(&mut buf).unwrap();

        let mut decoder = RecordDecoder::new();
        decoder.extend(&buf);
        match decoder.next().unwrap().unwrap() {
            Record::Hello(decoded) => assert_eq!(decoded, hello),
            other => panic!("expected HELLO, got {:?}", other),
        }
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn test_welcome_roundtrip_with_devices() {
        let welcome = Welcome {
            node_id: NodeId::generate(),
            name: "front-of-house".to_string(),
            protocol_version: PROTOCOL_VERSION,
            datagram_port: 6001,
            devices: vec![
                DeviceDescriptor::new(2, "APC40 in", Direction::Input),
                DeviceDescriptor::new(5, "Synth out", Direction::Output),
            ],
        };

        let mut buf = Vec::new();
        Record::Welcome(welcome.clone()).encode(&mut buf).unwrap();

        match Record::decode(&buf[4..]).unwrap() {
            Record::Welcome(decoded) => {
                assert_eq!(decoded, welcome);
                assert_eq!(decoded.devices.len(), 2);
            }
            other => panic!("expected WELCOME, got {:?}", other),
        }
    }

    #[test]
    fn test_midi_record_roundtrip() {
        let rec = MidiRecord {
            device_id: 513,
            ttl: 3,
            data: vec![0xF0, 0x41, 0x10, 0x42, 0xF7],
        };
        let mut buf = Vec::new();
        Record::Midi(rec.clone()).encode(&mut buf).unwrap();

        match Record::decode(&buf[4..]).unwrap() {
            Record::Midi(decoded) => assert_eq!(decoded, rec),
            other => panic!("expected MIDI, got {:?}", other),
        }
    }

    #[test]
    fn test_bye_is_empty_body() {
        let mut buf = Vec::new();
        Record::Bye.encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 1, RT_BYE]);
        assert_eq!(Record::decode(&buf[4..]).unwrap(), Record::Bye);
    }

    #[test]
    fn test_decoder_handles_fragmentation() {
        let mut wire = Vec::new();
        Record::Hello(sample_hello()).encode(&mut wire).unwrap();
        Record::Bye.encode(&mut wire).unwrap();

        let mut decoder = RecordDecoder::new();
        let mut records = Vec::new();
        // Feed one byte at a time
        for &b in &wire {
            decoder.extend(&[b]);
            while let Some(r) = decoder.next().unwrap() {
                records.push(r);
            }
        }

        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], Record::Hello(_)));
        assert_eq!(records[1], Record::Bye);
    }

    #[test]
    fn test_decoder_rejects_oversized() {
        let mut decoder = RecordDecoder::new();
        decoder.extend(&(MAX_RECORD_LEN + 1).to_be_bytes());
        decoder.extend(&[RT_MIDI]);
        assert!(matches!(
            decoder.next(),
            Err(RecordError::Oversized(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let body = [0x7Fu8, 0x01, 0x02];
        assert!(matches!(
            Record::decode(&body),
            Err(RecordError::UnknownType(0x7F))
        ));
    }

    #[test]
    fn test_short_midi_body_rejected() {
        let body = [RT_MIDI, 0x00];
        assert!(matches!(
            Record::decode(&body),
            Err(RecordError::MalformedBody("MIDI"))
        ));
    }
}
