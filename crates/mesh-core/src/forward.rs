use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use mesh_device::LocalMidiBackend;
use mesh_proto::classify::{channel, message_type};
use mesh_proto::device::Direction;
use mesh_proto::node::NodeId;

use crate::peer::ConnectionState;
use crate::pool::ConnectionPool;
use crate::routes::{ForwardingRule, RouteManager};
use crate::routing_table::RoutingTable;

#[derive(Debug, Default)]
pub struct EngineCounters {
    pub ttl_expired: AtomicU64,
    pub no_route: AtomicU64,
    pub delivered_local: AtomicU64,
    pub delivered_remote: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub ttl_expired: u64,
    pub no_route: u64,
    pub delivered_local: u64,
    pub delivered_remote: u64,
    pub dropped: u64,
}

/// The hot path: every MIDI event, local or remote, goes through
/// `dispatch`. It never blocks and never errors — an event is either
/// delivered or counted as dropped.
pub struct ForwardingEngine {
    local_node: NodeId,
    routes: Arc<RouteManager>,
    table: Arc<RoutingTable>,
    pool: Arc<ConnectionPool>,
    backend: Arc<dyn LocalMidiBackend>,
    counters: EngineCounters,
}

impl ForwardingEngine {
    pub fn new(
        local_node: NodeId,
        routes: Arc<RouteManager>,
        table: Arc<RoutingTable>,
        pool: Arc<ConnectionPool>,
        backend: Arc<dyn LocalMidiBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            routes,
            table,
            pool,
            backend,
            counters: EngineCounters::default(),
        })
    }

    /// Entry point for the local backend's input callback. Each matched
    /// rule contributes its own hop budget.
    pub fn on_local_input(&self, device_id: u16, bytes: &[u8]) {
        let matched = self.dispatch(self.local_node, device_id, bytes, None);
        if matched == 0 {
            self.counters.no_route.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Entry point for MIDI received from a peer. The wire addresses a
    /// device on this node: if that is one of our outputs, delivery
    /// happens here; either way the event re-enters rule matching
    /// keyed `(sender, addressed device)` with one hop consumed, so
    /// relay rules can forward it onward.
    pub fn on_remote_input(&self, sender: NodeId, device_id: u16, wire_ttl: u8, bytes: &[u8]) {
        if let Some(target) = self.table.lookup(self.local_node, device_id) {
            if target.is_local && target.direction == Direction::Output {
                match self.backend.send(device_id, bytes) {
                    Ok(()) => {
                        self.counters.delivered_local.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        debug!(device = device_id, error = %e, "Local delivery failed");
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        self.dispatch(sender, device_id, bytes, Some(wire_ttl.saturating_sub(1)));
    }

    /// Evaluate the rule index for one event. Returns how many rules
    /// matched (before filters).
    fn dispatch(
        &self,
        source_node: NodeId,
        source_device: u16,
        bytes: &[u8],
        incoming_ttl: Option<u8>,
    ) -> usize {
        if incoming_ttl == Some(0) {
            self.counters.ttl_expired.fetch_add(1, Ordering::Relaxed);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(source = %source_node, device = source_device, "Hop budget exhausted");
            return 0;
        }

        let rules = self.routes.destinations_for((source_node, source_device));
        if rules.is_empty() {
            return 0;
        }

        let status = bytes.first().copied();
        for rule in &rules {
            if !self.filters_pass(rule, status) {
                self.routes.record_dropped(rule.rule_id);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.deliver(rule, bytes, incoming_ttl);
        }
        rules.len()
    }

    fn filters_pass(&self, rule: &ForwardingRule, status: Option<u8>) -> bool {
        let Some(status) = status else {
            return false;
        };
        // Channel filter only constrains channel voice messages
        if let (Some(filter), Some(ch)) = (rule.channel_filter, channel(status)) {
            if ch != filter {
                return false;
            }
        }
        if let Some(mt) = message_type(status) {
            if rule.message_type_mask & mt.mask_bit() == 0 {
                return false;
            }
        }
        true
    }

    fn deliver(&self, rule: &ForwardingRule, bytes: &[u8], incoming_ttl: Option<u8>) {
        if rule.destination.node_id == self.local_node {
            match self.backend.send(rule.destination.device_id, bytes) {
                Ok(()) => {
                    self.counters.delivered_local.fetch_add(1, Ordering::Relaxed);
                    self.routes.record_forwarded(rule.rule_id);
                }
                Err(e) => {
                    debug!(device = rule.destination.device_id, error = %e, "Local delivery failed");
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    self.routes.record_dropped(rule.rule_id);
                }
            }
            return;
        }

        // Locally originated events take the rule's hop budget; relayed
        // events keep spending the one they arrived with.
        let ttl = incoming_ttl.unwrap_or(rule.ttl);
        let connected = self
            .pool
            .get(rule.destination.node_id)
            .filter(|peer| peer.current_state() == ConnectionState::Connected);
        let Some(peer) = connected else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            self.routes.record_dropped(rule.rule_id);
            return;
        };

        match peer.send_midi(rule.destination.device_id, ttl, bytes.to_vec()) {
            Ok(()) => {
                self.counters.delivered_remote.fetch_add(1, Ordering::Relaxed);
                self.routes.record_forwarded(rule.rule_id);
            }
            Err(_) => {
                // Queue full or worker gone: freshness beats backlog
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.routes.record_dropped(rule.rule_id);
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            ttl_expired: self.counters.ttl_expired.load(Ordering::Relaxed),
            no_route: self.counters.no_route.load(Ordering::Relaxed),
            delivered_local: self.counters.delivered_local.load(Ordering::Relaxed),
            delivered_remote: self.counters.delivered_remote.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRegistry;
    use crate::routes::{Endpoint, NewRule};
    use mesh_device::LoopbackBackend;
    use mesh_proto::classify::{MessageType, MESSAGE_MASK_ALL};
    use mesh_proto::device::{DeviceDescriptor, Direction};
    use mesh_proto::DEFAULT_TTL;

    struct Fixture {
        _dir: tempfile::TempDir,
        local: NodeId,
        registry: Arc<DeviceRegistry>,
        routes: Arc<RouteManager>,
        backend: Arc<LoopbackBackend>,
        engine: Arc<ForwardingEngine>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let local = NodeId::generate();

        let registry = Arc::new(DeviceRegistry::new(local));
        let table = Arc::new(RoutingTable::new());
        {
            let table = Arc::clone(&table);
            registry.subscribe(Box::new(move |event| table.apply(event)));
        }
        registry.register_local(2, "Pads in", Direction::Input).unwrap();
        registry.register_local(5, "Synth out", Direction::Output).unwrap();

        let routes = Arc::new(RouteManager::new(
            local,
            dir.path().join("routes.json"),
            Arc::clone(&registry),
        ));
        let pool = Arc::new(ConnectionPool::new());
        let backend = Arc::new(LoopbackBackend::new(vec![
            DeviceDescriptor::new(2, "Pads in", Direction::Input),
            DeviceDescriptor::new(5, "Synth out", Direction::Output),
        ]));
        let engine = ForwardingEngine::new(
            local,
            Arc::clone(&routes),
            table,
            pool,
            Arc::clone(&backend) as Arc<dyn LocalMidiBackend>,
        );

        Fixture {
            _dir: dir,
            local,
            registry,
            routes,
            backend,
            engine,
        }
    }

    fn local_echo_rule(f: &Fixture) -> NewRule {
        NewRule {
            source: Endpoint::new(f.local, 2),
            destination: Endpoint::new(f.local, 5),
            enabled: true,
            priority: 100,
            channel_filter: None,
            message_type_mask: MESSAGE_MASK_ALL,
            ttl: DEFAULT_TTL,
        }
    }

    #[test]
    fn test_local_echo_delivers_exact_bytes() {
        let f = fixture();
        let rule_id = f.routes.add(local_echo_rule(&f)).unwrap();

        f.engine.on_local_input(2, &[0x90, 0x3C, 0x64]);

        assert_eq!(f.backend.drain_output(5), vec![vec![0x90, 0x3C, 0x64]]);
        let stats = f.routes.stats(rule_id).unwrap();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(f.engine.stats().delivered_local, 1);
    }

    #[test]
    fn test_no_rules_counts_no_route() {
        let f = fixture();
        f.engine.on_local_input(2, &[0x90, 0x3C, 0x64]);
        assert_eq!(f.engine.stats().no_route, 1);
        assert!(f.backend.drain_output(5).is_empty());
    }

    #[test]
    fn test_channel_filter_skips_and_counts() {
        let f = fixture();
        let mut rule = local_echo_rule(&f);
        rule.channel_filter = Some(3);
        let rule_id = f.routes.add(rule).unwrap();

        f.engine.on_local_input(2, &[0x90, 0x3C, 0x64]); // channel 0: filtered
        f.engine.on_local_input(2, &[0x93, 0x3C, 0x64]); // channel 3: passes
        f.engine.on_local_input(2, &[0xF8]); // system: filter does not apply

        assert_eq!(
            f.backend.drain_output(5),
            vec![vec![0x93, 0x3C, 0x64], vec![0xF8]]
        );
        let stats = f.routes.stats(rule_id).unwrap();
        assert_eq!(stats.forwarded, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_message_type_mask_skips_and_counts() {
        let f = fixture();
        let mut rule = local_echo_rule(&f);
        rule.message_type_mask = MessageType::NoteOn.mask_bit() | MessageType::NoteOff.mask_bit();
        let rule_id = f.routes.add(rule).unwrap();

        f.engine.on_local_input(2, &[0x90, 0x3C, 0x64]); // note on: passes
        f.engine.on_local_input(2, &[0xB0, 0x07, 0x40]); // CC: masked out

        assert_eq!(f.backend.drain_output(5), vec![vec![0x90, 0x3C, 0x64]]);
        let stats = f.routes.stats(rule_id).unwrap();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_forwarded_plus_dropped_equals_matched_evaluations() {
        let f = fixture();
        let mut rule = local_echo_rule(&f);
        rule.channel_filter = Some(0);
        let rule_id = f.routes.add(rule).unwrap();

        let evaluations: u64 = 50;
        for i in 0..evaluations {
            // Alternate between passing (ch 0) and filtered (ch 1)
            let status = if i % 2 == 0 { 0x90 } else { 0x91 };
            f.engine.on_local_input(2, &[status, 0x3C, 0x64]);
        }

        let stats = f.routes.stats(rule_id).unwrap();
        assert_eq!(stats.forwarded + stats.dropped, evaluations);
    }

    #[test]
    fn test_ttl_zero_dropped_before_rule_lookup() {
        let f = fixture();
        f.routes.add(local_echo_rule(&f)).unwrap();

        // Wire ttl of 1: the hop consumed on entry leaves 0
        f.engine.on_remote_input(NodeId::generate(), 2, 1, &[0x90, 0x3C, 0x64]);

        assert_eq!(f.engine.stats().ttl_expired, 1);
        assert!(f.backend.drain_output(5).is_empty());
    }

    #[test]
    fn test_remote_event_addressed_at_local_output_is_delivered() {
        let f = fixture();
        let sender = NodeId::generate();

        // No rules at all: terminal delivery still happens
        f.engine.on_remote_input(sender, 5, 4, &[0x80, 0x3C, 0x00]);

        assert_eq!(f.backend.drain_output(5), vec![vec![0x80, 0x3C, 0x00]]);
        assert_eq!(f.engine.stats().delivered_local, 1);

        // Addressed at an input device: nothing is delivered
        f.engine.on_remote_input(sender, 2, 4, &[0x80, 0x3C, 0x00]);
        assert!(f.backend.drain_output(5).is_empty());
        assert_eq!(f.engine.stats().delivered_local, 1);
    }

    #[test]
    fn test_remote_destination_without_peer_counts_dropped() {
        let f = fixture();
        let peer = NodeId::generate();
        f.registry
            .replace_remote(peer, &[DeviceDescriptor::new(6, "Far out", Direction::Output)]);

        let mut rule = local_echo_rule(&f);
        rule.destination = Endpoint::new(peer, 6);
        let rule_id = f.routes.add(rule).unwrap();

        f.engine.on_local_input(2, &[0x90, 0x3C, 0x64]);

        let stats = f.routes.stats(rule_id).unwrap();
        assert_eq!(stats.dropped, 1);
        assert_eq!(f.engine.stats().dropped, 1);
    }

    #[test]
    fn test_priority_fanout_delivers_once_per_rule() {
        let f = fixture();
        f.routes.add(local_echo_rule(&f)).unwrap();
        let mut second = local_echo_rule(&f);
        second.priority = 50;
        f.routes.add(second).unwrap();

        f.engine.on_local_input(2, &[0x90, 0x3C, 0x64]);

        // Two rules, two deliveries: fan-out is deliberate
        assert_eq!(f.backend.drain_output(5).len(), 2);
    }
}
