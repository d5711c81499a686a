/// Local MIDI endpoint abstraction.
///
/// This crate provides the `LocalMidiBackend` trait the mesh core drives,
/// plus two in-process implementations: a loopback backend whose outputs
/// can be observed (used by tests and headless demos) and a null backend
/// that swallows everything.
///
/// Real hardware backends (ALSA, CoreMIDI, ...) live behind the same
/// trait in their own crates; the core never links a platform MIDI stack.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mesh_proto::device::{DeviceDescriptor, Direction};

/// Callback invoked for every MIDI message arriving on a local input
/// device. Delivered on backend-owned threads; implementations of the
/// mesh core must not block inside it.
pub type MidiInputHandler = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

/// A source and sink of local MIDI traffic.
pub trait LocalMidiBackend: Send + Sync {
    /// List the devices this backend exposes. Called once at startup;
    /// ids must be stable for the process lifetime.
    fn enumerate(&self) -> Vec<DeviceDescriptor>;

    /// Write MIDI bytes to a local output device.
    fn send(&self, device_id: u16, data: &[u8]) -> anyhow::Result<()>;

    /// Install the input callback. At most one handler is active; a
    /// second call replaces the first.
    fn set_input_handler(&self, handler: MidiInputHandler);
}

/// In-process backend: inputs are fed by `inject`, outputs are captured
/// per device and can be drained by the caller.
pub struct LoopbackBackend {
    devices: Vec<DeviceDescriptor>,
    handler: Mutex<Option<MidiInputHandler>>,
    outputs: Mutex<HashMap<u16, Vec<Vec<u8>>>>,
}

impl LoopbackBackend {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices,
            handler: Mutex::new(None),
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Feed bytes into a local input device, as a hardware driver would.
    pub fn inject(&self, device_id: u16, data: &[u8]) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(device_id, data);
        } else {
            tracing::warn!(device_id, "MIDI injected before a handler was installed");
        }
    }

    /// Take everything written to an output device so far.
    pub fn drain_output(&self, device_id: u16) -> Vec<Vec<u8>> {
        self.outputs
            .lock()
            .unwrap()
            .remove(&device_id)
            .unwrap_or_default()
    }
}

impl LocalMidiBackend for LoopbackBackend {
    fn enumerate(&self) -> Vec<DeviceDescriptor> {
        self.devices.clone()
    }

    fn send(&self, device_id: u16, data: &[u8]) -> anyhow::Result<()> {
        let known = self
            .devices
            .iter()
            .any(|d| d.device_id == device_id && d.direction == Direction::Output);
        if !known {
            anyhow::bail!("no local output device {}", device_id);
        }
        self.outputs
            .lock()
            .unwrap()
            .entry(device_id)
            .or_default()
            .push(data.to_vec());
        Ok(())
    }

    fn set_input_handler(&self, handler: MidiInputHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}

/// Backend with no devices at all. Useful for relay-only nodes.
#[derive(Default)]
pub struct NullBackend;

impl LocalMidiBackend for NullBackend {
    fn enumerate(&self) -> Vec<DeviceDescriptor> {
        Vec::new()
    }

    fn send(&self, device_id: u16, _data: &[u8]) -> anyhow::Result<()> {
        anyhow::bail!("no local output device {}", device_id)
    }

    fn set_input_handler(&self, _handler: MidiInputHandler) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn devices() -> Vec<DeviceDescriptor> {
        vec![
            DeviceDescriptor::new(2, "Pads in", Direction::Input),
            DeviceDescriptor::new(5, "Synth out", Direction::Output),
        ]
    }

    #[test]
    fn test_inject_reaches_handler() {
        let backend = LoopbackBackend::new(devices());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        backend.set_input_handler(Arc::new(move |device_id, data| {
            assert_eq!(device_id, 2);
            assert_eq!(data, [0x90, 0x3C, 0x64]);
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        backend.inject(2, &[0x90, 0x3C, 0x64]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_captures_output() {
        let backend = LoopbackBackend::new(devices());
        backend.send(5, &[0x80, 0x3C, 0x00]).unwrap();
        backend.send(5, &[0x90, 0x40, 0x10]).unwrap();

        let out = backend.drain_output(5);
        assert_eq!(out, vec![vec![0x80, 0x3C, 0x00], vec![0x90, 0x40, 0x10]]);
        assert!(backend.drain_output(5).is_empty());
    }

    #[test]
    fn test_send_to_input_or_unknown_device_fails() {
        let backend = LoopbackBackend::new(devices());
        assert!(backend.send(2, &[0xF8]).is_err()); // input device
        assert!(backend.send(99, &[0xF8]).is_err()); // unknown
    }

    #[test]
    fn test_null_backend_has_nothing() {
        let backend = NullBackend;
        assert!(backend.enumerate().is_empty());
        assert!(backend.send(0, &[0xF8]).is_err());
    }
}
