use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use mesh_proto::node::NodeId;

/// Stable per-process identity: a UUID generated on first run plus a
/// human name, persisted under the state directory and reloaded on
/// every subsequent start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub name: String,
}

impl NodeIdentity {
    /// Load the identity file or create it with a fresh UUID.
    pub fn load_or_create(state_dir: &Path, name: &str) -> anyhow::Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state dir {:?}", state_dir))?;
        let path = state_dir.join("identity.json");

        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading identity file {:?}", path))?;
            let mut identity: NodeIdentity =
                serde_json::from_str(&raw).context("parsing identity file")?;
            // The configured name wins over the persisted one
            if !name.is_empty() && identity.name != name {
                identity.name = name.to_string();
                identity.write(&path)?;
            }
            info!(node_id = %identity.node_id, name = %identity.name, "Loaded node identity");
            return Ok(identity);
        }

        let identity = NodeIdentity {
            node_id: NodeId::generate(),
            name: name.to_string(),
        };
        identity.write(&path)?;
        info!(node_id = %identity.node_id, name = %identity.name, "Created node identity");
        Ok(identity)
    }

    fn write(&self, path: &Path) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).with_context(|| format!("writing identity file {:?}", path))?;
        Ok(())
    }

    /// Per-instance directory for the rest of the persisted state
    /// (`routes.json` lives here). Instances on a shared state dir are
    /// isolated by UUID.
    pub fn instance_dir(&self, state_dir: &Path) -> anyhow::Result<PathBuf> {
        let dir = state_dir.join(self.node_id.to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating instance dir {:?}", dir))?;
        Ok(dir)
    }

    pub fn id(&self) -> NodeId {
        self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_stable_across_restarts() {
        let dir = tempfile::tempdir().unwrap();

        let first = NodeIdentity::load_or_create(dir.path(), "stage-left").unwrap();
        let second = NodeIdentity::load_or_create(dir.path(), "stage-left").unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(second.name(), "stage-left");
    }

    #[test]
    fn test_configured_rename_persists() {
        let dir = tempfile::tempdir().unwrap();

        let first = NodeIdentity::load_or_create(dir.path(), "old-name").unwrap();
        let renamed = NodeIdentity::load_or_create(dir.path(), "new-name").unwrap();
        let reloaded = NodeIdentity::load_or_create(dir.path(), "new-name").unwrap();

        assert_eq!(first.id(), renamed.id());
        assert_eq!(renamed.name(), "new-name");
        assert_eq!(reloaded.name(), "new-name");
    }

    #[test]
    fn test_instance_dirs_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let a = NodeIdentity {
            node_id: NodeId::generate(),
            name: "a".into(),
        };
        let b = NodeIdentity {
            node_id: NodeId::generate(),
            name: "b".into(),
        };

        let dir_a = a.instance_dir(dir.path()).unwrap();
        let dir_b = b.instance_dir(dir.path()).unwrap();
        assert_ne!(dir_a, dir_b);
        assert!(dir_a.is_dir());
        assert!(dir_b.is_dir());
    }
}
