use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use mesh_proto::device::Direction;
use mesh_proto::node::NodeId;

use crate::registry::RegistryEvent;

/// Resolution target for a composite device key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteTarget {
    pub name: String,
    pub direction: Direction,
    pub is_local: bool,
}

/// Flat composite-key map used by the forwarding hot path and the
/// diagnostics endpoint. Kept in sync with the `DeviceRegistry` through
/// its event stream; never mutated anywhere else.
#[derive(Default)]
pub struct RoutingTable {
    entries: Mutex<BTreeMap<(NodeId, u16), RouteTarget>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: &RegistryEvent) {
        let mut entries = self.entries.lock().unwrap();
        match event {
            RegistryEvent::Added(record) => {
                entries.insert(
                    record.key(),
                    RouteTarget {
                        name: record.name.clone(),
                        direction: record.direction,
                        is_local: record.is_local,
                    },
                );
            }
            RegistryEvent::Removed { node_id, device_id } => {
                entries.remove(&(*node_id, *device_id));
            }
        }
    }

    pub fn lookup(&self, node_id: NodeId, device_id: u16) -> Option<RouteTarget> {
        self.entries
            .lock()
            .unwrap()
            .get(&(node_id, device_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the whole table for `GET /routing/table`.
    pub fn snapshot(&self) -> Vec<((NodeId, u16), RouteTarget)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRecord;

    fn added(node: NodeId, device: u16, direction: Direction, local: bool) -> RegistryEvent {
        RegistryEvent::Added(DeviceRecord {
            node_id: node,
            device_id: device,
            name: format!("dev-{device}"),
            direction,
            is_local: local,
        })
    }

    #[test]
    fn test_tracks_adds_and_removes() {
        let table = RoutingTable::new();
        let node = NodeId::generate();

        table.apply(&added(node, 4, Direction::Output, false));
        assert_eq!(table.len(), 1);
        let target = table.lookup(node, 4).unwrap();
        assert_eq!(target.direction, Direction::Output);
        assert!(!target.is_local);

        table.apply(&RegistryEvent::Removed {
            node_id: node,
            device_id: 4,
        });
        assert!(table.lookup(node, 4).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_snapshot_orders_by_key() {
        let table = RoutingTable::new();
        let a = NodeId::nil();
        let b = NodeId::generate();
        table.apply(&added(b, 1, Direction::Input, false));
        table.apply(&added(a, 9, Direction::Output, true));
        table.apply(&added(a, 2, Direction::Input, true));

        let snap = table.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].0, (a, 2));
        assert_eq!(snap[1].0, (a, 9));
        assert_eq!(snap[2].0, (b, 1));
    }
}
