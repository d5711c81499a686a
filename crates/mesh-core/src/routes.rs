use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mesh_proto::classify::MESSAGE_MASK_ALL;
use mesh_proto::device::Direction;
use mesh_proto::node::NodeId;
use mesh_proto::{DEFAULT_TTL, MAX_TTL};

use crate::error::RouteError;
use crate::registry::DeviceRegistry;

pub const ROUTES_FILE_VERSION: u32 = 1;

/// One side of a forwarding rule. The nil node id means "this node" in
/// persisted form; in memory it is always resolved to the real id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub node_id: NodeId,
    pub device_id: u16,
}

impl Endpoint {
    pub fn new(node_id: NodeId, device_id: u16) -> Self {
        Self { node_id, device_id }
    }

    pub fn key(&self) -> (NodeId, u16) {
        (self.node_id, self.device_id)
    }
}

/// Hot-path counters for one rule. In-memory only; reset on reload.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub last_at: Option<SystemTime>,
}

/// Directional mapping from one input device to one output device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub rule_id: Uuid,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub channel_filter: Option<u8>,
    #[serde(default = "default_mask")]
    pub message_type_mask: u8,
    #[serde(default = "default_ttl")]
    pub ttl: u8,
    #[serde(skip)]
    pub stats: RuleStats,
}

/// Rule creation request, before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRule {
    pub source: Endpoint,
    pub destination: Endpoint,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub channel_filter: Option<u8>,
    #[serde(default = "default_mask")]
    pub message_type_mask: u8,
    #[serde(default = "default_ttl")]
    pub ttl: u8,
}

/// Partial update for `PUT /routing/rules/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
    pub channel_filter: Option<u8>,
    #[serde(default)]
    pub clear_channel_filter: bool,
    pub message_type_mask: Option<u8>,
}

/// Read-model of one rule for the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSnapshot {
    #[serde(flatten)]
    pub rule: ForwardingRule,
    pub pending: bool,
    pub forwarded: u64,
    pub dropped: u64,
    pub last_at_ms: Option<u64>,
}

fn default_enabled() -> bool {
    true
}
fn default_priority() -> i32 {
    100
}
fn default_mask() -> u8 {
    MESSAGE_MASK_ALL
}
fn default_ttl() -> u8 {
    DEFAULT_TTL
}

#[derive(Debug, Serialize, Deserialize)]
struct RoutesFile {
    version: u32,
    rules: Vec<ForwardingRule>,
}

#[derive(Default)]
struct Inner {
    /// Rules whose endpoints currently exist with the right directions.
    active: HashMap<Uuid, ForwardingRule>,
    /// Rules waiting for their devices to (re)appear. Never matched.
    pending: HashMap<Uuid, ForwardingRule>,
    /// Source key -> active rule ids, for O(1) hot-path lookup.
    index: HashMap<(NodeId, u16), Vec<Uuid>>,
}

impl Inner {
    fn insert_active(&mut self, rule: ForwardingRule) {
        self.index
            .entry(rule.source.key())
            .or_default()
            .push(rule.rule_id);
        self.active.insert(rule.rule_id, rule);
    }

    fn remove_active(&mut self, id: Uuid) -> Option<ForwardingRule> {
        let rule = self.active.remove(&id)?;
        if let Some(ids) = self.index.get_mut(&rule.source.key()) {
            ids.retain(|r| *r != id);
            if ids.is_empty() {
                self.index.remove(&rule.source.key());
            }
        }
        Some(rule)
    }
}

/// Owner of the forwarding rule set: CRUD with validation, the source
/// index the hot path reads, and `routes.json` persistence.
pub struct RouteManager {
    local_node: NodeId,
    path: PathBuf,
    registry: Arc<DeviceRegistry>,
    inner: Mutex<Inner>,
}

impl RouteManager {
    pub fn new(local_node: NodeId, path: PathBuf, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            local_node,
            path,
            registry,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Map the reserved nil id to this node.
    fn resolve(&self, endpoint: Endpoint) -> Endpoint {
        if endpoint.node_id.is_nil() {
            Endpoint::new(self.local_node, endpoint.device_id)
        } else {
            endpoint
        }
    }

    /// Map this node back to the reserved nil id for storage.
    fn storage_form(&self, endpoint: Endpoint) -> Endpoint {
        if endpoint.node_id == self.local_node {
            Endpoint::new(NodeId::nil(), endpoint.device_id)
        } else {
            endpoint
        }
    }

    /// Range and self-route checks that need no registry access.
    fn validate_shape(rule: &ForwardingRule) -> Result<(), RouteError> {
        if rule.source == rule.destination {
            return Err(RouteError::SelfRoute);
        }
        if let Some(ch) = rule.channel_filter {
            if ch > 15 {
                return Err(RouteError::InvalidChannelFilter(ch));
            }
        }
        if rule.ttl == 0 || rule.ttl > MAX_TTL {
            return Err(RouteError::InvalidTtl(rule.ttl));
        }
        Ok(())
    }

    /// Both endpoints must exist with the right directions.
    fn validate_endpoints(&self, rule: &ForwardingRule) -> Result<(), RouteError> {
        let (src_node, src_dev) = rule.source.key();
        match self.registry.lookup(src_node, src_dev) {
            None => {
                return Err(RouteError::SourceMissing {
                    node: src_node,
                    device: src_dev,
                })
            }
            Some(record) if record.direction != Direction::Input => {
                return Err(RouteError::SourceNotInput {
                    node: src_node,
                    device: src_dev,
                })
            }
            Some(_) => {}
        }

        let (dst_node, dst_dev) = rule.destination.key();
        match self.registry.lookup(dst_node, dst_dev) {
            None => Err(RouteError::DestinationMissing {
                node: dst_node,
                device: dst_dev,
            }),
            Some(record) if record.direction != Direction::Output => {
                Err(RouteError::DestinationNotOutput {
                    node: dst_node,
                    device: dst_dev,
                })
            }
            Some(_) => Ok(()),
        }
    }

    fn check_duplicate(inner: &Inner, rule: &ForwardingRule) -> Result<(), RouteError> {
        let clash = |other: &ForwardingRule| {
            other.rule_id != rule.rule_id
                && other.source == rule.source
                && other.destination == rule.destination
                && other.priority == rule.priority
        };
        if inner.active.values().any(clash) || inner.pending.values().any(clash) {
            return Err(RouteError::DuplicateRule);
        }
        Ok(())
    }

    /// Create a rule. Fails without side effects on validation errors.
    pub fn add(&self, new: NewRule) -> Result<Uuid, RouteError> {
        let rule = ForwardingRule {
            rule_id: Uuid::new_v4(),
            source: self.resolve(new.source),
            destination: self.resolve(new.destination),
            enabled: new.enabled,
            priority: new.priority,
            channel_filter: new.channel_filter,
            message_type_mask: new.message_type_mask,
            ttl: new.ttl,
            stats: RuleStats::default(),
        };

        Self::validate_shape(&rule)?;
        self.validate_endpoints(&rule)?;

        let rule_id = rule.rule_id;
        {
            let mut inner = self.inner.lock().unwrap();
            Self::check_duplicate(&inner, &rule)?;
            inner.insert_active(rule);
        }

        info!(rule_id = %rule_id, "Forwarding rule added");
        self.persist()?;
        Ok(rule_id)
    }

    /// Partial update of an active or pending rule.
    pub fn update(&self, id: Uuid, patch: RulePatch) -> Result<(), RouteError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let rule = match inner.active.get(&id).or_else(|| inner.pending.get(&id)) {
                Some(rule) => rule.clone(),
                None => return Err(RouteError::UnknownRule(id)),
            };

            let mut updated = rule;
            if let Some(enabled) = patch.enabled {
                updated.enabled = enabled;
            }
            if let Some(priority) = patch.priority {
                updated.priority = priority;
            }
            if patch.clear_channel_filter {
                updated.channel_filter = None;
            } else if let Some(ch) = patch.channel_filter {
                updated.channel_filter = Some(ch);
            }
            if let Some(mask) = patch.message_type_mask {
                updated.message_type_mask = mask;
            }

            Self::validate_shape(&updated)?;
            Self::check_duplicate(&inner, &updated)?;

            if inner.remove_active(id).is_some() {
                inner.insert_active(updated);
            } else if inner.pending.remove(&id).is_some() {
                inner.pending.insert(id, updated);
            }
        }

        debug!(rule_id = %id, "Forwarding rule updated");
        self.persist()
    }

    pub fn remove(&self, id: Uuid) -> Result<(), RouteError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.remove_active(id).is_none() && inner.pending.remove(&id).is_none() {
                return Err(RouteError::UnknownRule(id));
            }
        }
        info!(rule_id = %id, "Forwarding rule removed");
        self.persist()
    }

    /// Load the routing file. Rules whose devices exist go live; the
    /// rest wait in the pending set until `revalidate` promotes them.
    pub fn load(&self) -> Result<usize, RouteError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(&self.path)?;
        let file: RoutesFile = serde_json::from_str(&raw)?;
        if file.version != ROUTES_FILE_VERSION {
            return Err(RouteError::UnsupportedVersion(file.version));
        }

        let mut loaded = 0;
        let mut inner = self.inner.lock().unwrap();
        inner.active.clear();
        inner.pending.clear();
        inner.index.clear();

        for mut rule in file.rules {
            rule.source = self.resolve(rule.source);
            rule.destination = self.resolve(rule.destination);
            rule.stats = RuleStats::default();

            if let Err(e) = Self::validate_shape(&rule) {
                warn!(rule_id = %rule.rule_id, error = %e, "Dropping malformed persisted rule");
                continue;
            }
            if self.validate_endpoints(&rule).is_ok() {
                inner.insert_active(rule);
            } else {
                inner.pending.insert(rule.rule_id, rule);
            }
            loaded += 1;
        }

        info!(
            total = loaded,
            active = inner.active.len(),
            pending = inner.pending.len(),
            "Routing rules loaded"
        );
        Ok(loaded)
    }

    /// Re-check every rule against the registry. Called from the
    /// registry's change listener so a departed peer's rules go inert
    /// in the same stroke as its devices.
    pub fn revalidate(&self) {
        let mut inner = self.inner.lock().unwrap();

        let promote: Vec<Uuid> = inner
            .pending
            .values()
            .filter(|r| self.validate_endpoints(r).is_ok())
            .map(|r| r.rule_id)
            .collect();
        for id in promote {
            if let Some(rule) = inner.pending.remove(&id) {
                debug!(rule_id = %id, "Pending rule activated");
                inner.insert_active(rule);
            }
        }

        let demote: Vec<Uuid> = inner
            .active
            .values()
            .filter(|r| self.validate_endpoints(r).is_err())
            .map(|r| r.rule_id)
            .collect();
        for id in demote {
            if let Some(rule) = inner.remove_active(id) {
                debug!(rule_id = %id, "Active rule suspended, endpoints gone");
                inner.pending.insert(id, rule);
            }
        }
    }

    /// Enabled rules matching a source key, highest priority first with
    /// rule-id tie-breaks for deterministic order.
    pub fn destinations_for(&self, source: (NodeId, u16)) -> Vec<ForwardingRule> {
        let inner = self.inner.lock().unwrap();
        let Some(ids) = inner.index.get(&source) else {
            return Vec::new();
        };
        let mut rules: Vec<ForwardingRule> = ids
            .iter()
            .filter_map(|id| inner.active.get(id))
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        rules
    }

    pub fn record_forwarded(&self, id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(rule) = inner.active.get_mut(&id) {
            rule.stats.forwarded += 1;
            rule.stats.last_at = Some(SystemTime::now());
        }
    }

    pub fn record_dropped(&self, id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(rule) = inner.active.get_mut(&id) {
            rule.stats.dropped += 1;
        }
    }

    pub fn stats(&self, id: Uuid) -> Option<RuleStats> {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .get(&id)
            .or_else(|| inner.pending.get(&id))
            .map(|r| r.stats)
    }

    /// Every rule, active and pending, for the control plane.
    pub fn snapshot(&self) -> Vec<RuleSnapshot> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<RuleSnapshot> = inner
            .active
            .values()
            .map(|r| Self::snapshot_one(r, false))
            .chain(inner.pending.values().map(|r| Self::snapshot_one(r, true)))
            .collect();
        out.sort_by(|a, b| a.rule.rule_id.cmp(&b.rule.rule_id));
        out
    }

    fn snapshot_one(rule: &ForwardingRule, pending: bool) -> RuleSnapshot {
        RuleSnapshot {
            rule: rule.clone(),
            pending,
            forwarded: rule.stats.forwarded,
            dropped: rule.stats.dropped,
            last_at_ms: rule.stats.last_at.and_then(|t| {
                t.duration_since(UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_millis() as u64)
            }),
        }
    }

    pub fn rule_count(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.active.len(), inner.pending.len())
    }

    /// Write the whole rule set to disk. Called on every mutation and
    /// once more on shutdown.
    pub fn save(&self) -> Result<(), RouteError> {
        self.persist()
    }

    fn persist(&self) -> Result<(), RouteError> {
        let rules: Vec<ForwardingRule> = {
            let inner = self.inner.lock().unwrap();
            inner
                .active
                .values()
                .chain(inner.pending.values())
                .map(|r| {
                    let mut stored = r.clone();
                    stored.source = self.storage_form(stored.source);
                    stored.destination = self.storage_form(stored.destination);
                    stored
                })
                .collect()
        };

        let file = RoutesFile {
            version: ROUTES_FILE_VERSION,
            rules,
        };
        let raw = serde_json::to_string_pretty(&file)?;

        // Replace atomically so a crash mid-write never corrupts routes
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
