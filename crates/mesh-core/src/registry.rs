use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use mesh_proto::device::{DeviceDescriptor, Direction};
use mesh_proto::node::NodeId;

use crate::error::RegistryError;

/// One MIDI endpoint known to this node, local or remote. The composite
/// `(node_id, device_id)` key is globally unique; device ids only need
/// to be unique within their owning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub node_id: NodeId,
    pub device_id: u16,
    pub name: String,
    pub direction: Direction,
    pub is_local: bool,
}

impl DeviceRecord {
    pub fn key(&self) -> (NodeId, u16) {
        (self.node_id, self.device_id)
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(self.device_id, self.name.clone(), self.direction)
    }
}

/// Change notification delivered to registry listeners.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(DeviceRecord),
    Removed { node_id: NodeId, device_id: u16 },
}

pub type RegistryListener = Box<dyn Fn(&RegistryEvent) + Send + Sync>;

/// All devices this node knows about, behind one mutex. Local devices
/// are registered once at startup; remote sets are replaced wholesale
/// when a peer handshakes or updates, and purged when it goes away.
pub struct DeviceRegistry {
    local_node: NodeId,
    devices: Mutex<BTreeMap<(NodeId, u16), DeviceRecord>>,
    listeners: Mutex<Vec<RegistryListener>>,
}

impl DeviceRegistry {
    pub fn new(local_node: NodeId) -> Self {
        Self {
            local_node,
            devices: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Register listeners before traffic starts; they run on the
    /// mutating caller's thread, after the map lock is released.
    pub fn subscribe(&self, listener: RegistryListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn register_local(
        &self,
        device_id: u16,
        name: impl Into<String>,
        direction: Direction,
    ) -> Result<(), RegistryError> {
        let record = DeviceRecord {
            node_id: self.local_node,
            device_id,
            name: name.into(),
            direction,
            is_local: true,
        };

        {
            let mut devices = self.devices.lock().unwrap();
            if devices.contains_key(&record.key()) {
                return Err(RegistryError::DuplicateDevice {
                    node: self.local_node,
                    device: device_id,
                });
            }
            devices.insert(record.key(), record.clone());
        }

        debug!(device_id, name = %record.name, direction = ?record.direction, "Registered local device");
        self.notify(&[RegistryEvent::Added(record)]);
        Ok(())
    }

    /// Atomically replace everything known about `node_id` with the
    /// given set. Used on handshake and DEVICE_UPDATE.
    pub fn replace_remote(&self, node_id: NodeId, descriptors: &[DeviceDescriptor]) {
        debug_assert_ne!(node_id, self.local_node);
        let mut events = Vec::new();

        {
            let mut devices = self.devices.lock().unwrap();
            let stale: Vec<(NodeId, u16)> = devices
                .range((node_id, 0)..=(node_id, u16::MAX))
                .map(|(k, _)| *k)
                .collect();
            for key in stale {
                devices.remove(&key);
                events.push(RegistryEvent::Removed {
                    node_id: key.0,
                    device_id: key.1,
                });
            }
            for d in descriptors {
                let record = DeviceRecord {
                    node_id,
                    device_id: d.device_id,
                    name: d.name.clone(),
                    direction: d.direction,
                    is_local: false,
                };
                devices.insert(record.key(), record.clone());
                events.push(RegistryEvent::Added(record));
            }
        }

        debug!(node = %node_id, count = descriptors.len(), "Replaced remote device set");
        self.notify(&events);
    }

    /// Purge a departed peer. Idempotent; returns how many records went.
    pub fn remove_all_for(&self, node_id: NodeId) -> usize {
        let mut events = Vec::new();

        {
            let mut devices = self.devices.lock().unwrap();
            let stale: Vec<(NodeId, u16)> = devices
                .range((node_id, 0)..=(node_id, u16::MAX))
                .map(|(k, _)| *k)
                .collect();
            for key in stale {
                devices.remove(&key);
                events.push(RegistryEvent::Removed {
                    node_id: key.0,
                    device_id: key.1,
                });
            }
        }

        if !events.is_empty() {
            debug!(node = %node_id, count = events.len(), "Purged devices for departed node");
            self.notify(&events);
        }
        events.len()
    }

    pub fn lookup(&self, node_id: NodeId, device_id: u16) -> Option<DeviceRecord> {
        self.devices
            .lock()
            .unwrap()
            .get(&(node_id, device_id))
            .cloned()
    }

    pub fn list_all(&self) -> Vec<DeviceRecord> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    pub fn list_for_node(&self, node_id: NodeId) -> Vec<DeviceRecord> {
        self.devices
            .lock()
            .unwrap()
            .range((node_id, 0)..=(node_id, u16::MAX))
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Descriptors for this node's own devices, as advertised in
    /// WELCOME and DEVICE_UPDATE records.
    pub fn local_descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices
            .lock()
            .unwrap()
            .range((self.local_node, 0)..=(self.local_node, u16::MAX))
            .map(|(_, r)| r.descriptor())
            .collect()
    }

    fn notify(&self, events: &[RegistryEvent]) {
        let listeners = self.listeners.lock().unwrap();
        for event in events {
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(NodeId::generate())
    }

    #[test]
    fn test_register_local_rejects_duplicates() {
        let reg = registry();
        reg.register_local(2, "Pads", Direction::Input).unwrap();
        let err = reg.register_local(2, "Again", Direction::Output);
        assert!(matches!(
            err,
            Err(RegistryError::DuplicateDevice { device: 2, .. })
        ));
        assert_eq!(reg.list_all().len(), 1);
    }

    #[test]
    fn test_replace_remote_is_atomic_swap() {
        let reg = registry();
        let peer = NodeId::generate();

        reg.replace_remote(
            peer,
            &[
                DeviceDescriptor::new(1, "Old A", Direction::Input),
                DeviceDescriptor::new(2, "Old B", Direction::Output),
            ],
        );
        assert_eq!(reg.list_for_node(peer).len(), 2);

        reg.replace_remote(peer, &[DeviceDescriptor::new(7, "New", Direction::Output)]);
        let remaining = reg.list_for_node(peer);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].device_id, 7);
        assert!(!remaining[0].is_local);
    }

    #[test]
    fn test_remove_all_for_is_idempotent() {
        let reg = registry();
        let peer = NodeId::generate();
        reg.replace_remote(peer, &[DeviceDescriptor::new(1, "X", Direction::Input)]);

        assert_eq!(reg.remove_all_for(peer), 1);
        assert_eq!(reg.remove_all_for(peer), 0);
        assert!(reg.list_for_node(peer).is_empty());
    }

    #[test]
    fn test_composite_keys_do_not_collide() {
        let reg = registry();
        let peer = NodeId::generate();

        // Same device id locally and remotely: distinct records
        reg.register_local(3, "Local 3", Direction::Output).unwrap();
        reg.replace_remote(peer, &[DeviceDescriptor::new(3, "Remote 3", Direction::Output)]);

        assert_eq!(reg.list_all().len(), 2);
        assert!(reg.lookup(reg.local_node(), 3).unwrap().is_local);
        assert!(!reg.lookup(peer, 3).unwrap().is_local);
    }

    #[test]
    fn test_listeners_see_adds_and_removes() {
        let reg = registry();
        let peer = NodeId::generate();
        let adds = Arc::new(AtomicUsize::new(0));
        let removes = Arc::new(AtomicUsize::new(0));
        {
            let adds = Arc::clone(&adds);
            let removes = Arc::clone(&removes);
            reg.subscribe(Box::new(move |event| match event {
                RegistryEvent::Added(_) => {
                    adds.fetch_add(1, Ordering::SeqCst);
                }
                RegistryEvent::Removed { .. } => {
                    removes.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        reg.replace_remote(
            peer,
            &[
                DeviceDescriptor::new(1, "A", Direction::Input),
                DeviceDescriptor::new(2, "B", Direction::Output),
            ],
        );
        reg.remove_all_for(peer);

        assert_eq!(adds.load(Ordering::SeqCst), 2);
        assert_eq!(removes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_local_descriptors_exclude_remote() {
        let reg = registry();
        let peer = NodeId::generate();
        reg.register_local(1, "In", Direction::Input).unwrap();
        reg.replace_remote(peer, &[DeviceDescriptor::new(9, "Far", Direction::Output)]);

        let local = reg.local_descriptors();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].device_id, 1);
    }
}
