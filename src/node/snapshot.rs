//! Versioned configuration snapshots
//!
//! Each committed configuration is written once, under a name that
//! encodes the node and the version (`<node>.<version>`). Version 0 means
//! "no configuration" and is never stored.

use crate::applicator::NodeContext;
use crate::common::utils::{decode_key, encode_key};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Name of one snapshot: node plus version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFilename {
    pub node_name: String,
    pub version: u64,
}

impl SnapshotFilename {
    pub fn new(node_name: impl Into<String>, version: u64) -> Self {
        Self {
            node_name: node_name.into(),
            version,
        }
    }

    pub fn to_file_name(&self) -> String {
        format!("{}.{}", encode_key(&self.node_name), self.version)
    }

    /// Parse `<node>.<version>`. Node names may themselves contain dots,
    /// so the version is taken after the last one.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (node, version) = file_name.rsplit_once('.')?;
        if node.is_empty() || version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let version = version.parse().ok()?;
        let node_name = decode_key(node).ok()?;
        Some(Self { node_name, version })
    }
}

/// Storage of configuration snapshots by version.
pub trait SnapshotStorage: Send + Sync {
    fn save(&self, version: u64, config: &NodeContext) -> Result<()>;

    /// `Ok(None)` for version 0 and for versions never written.
    fn load(&self, version: u64) -> Result<Option<NodeContext>>;

    /// Stored versions in ascending order.
    fn versions(&self) -> Result<Vec<u64>>;
}

/// Snapshots as pretty JSON files in one directory.
pub struct FileSnapshotStore {
    dir: PathBuf,
    node_name: String,
}

impl FileSnapshotStore {
    pub fn open(dir: impl AsRef<Path>, node_name: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            node_name: node_name.into(),
        })
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir
            .join(SnapshotFilename::new(&self.node_name, version).to_file_name())
    }
}

impl SnapshotStorage for FileSnapshotStore {
    fn save(&self, version: u64, config: &NodeContext) -> Result<()> {
        if version == 0 {
            return Err(Error::InvalidVersion(0));
        }
        let path = self.path_for(version);
        let temp_path = path.with_extension(format!("{}.tmp", version));
        let bytes = serde_json::to_vec_pretty(config)?;
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        tracing::debug!(node = %self.node_name, version, "Wrote config snapshot {:?}", path);
        Ok(())
    }

    fn load(&self, version: u64) -> Result<Option<NodeContext>> {
        if version == 0 {
            return Ok(None);
        }
        let path = self.path_for(version);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Corrupted(format!("config snapshot {:?} is unreadable: {}", path, e))
        })?;
        Ok(Some(config))
    }

    fn versions(&self) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(parsed) = SnapshotFilename::parse(name) {
                if parsed.node_name == self.node_name {
                    versions.push(parsed.version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

/// In-memory snapshots (tests, ephemeral nodes)
#[derive(Default)]
pub struct MemSnapshotStore {
    snapshots: Mutex<BTreeMap<u64, NodeContext>>,
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<u64, NodeContext>>> {
        self.snapshots
            .lock()
            .map_err(|_| Error::Internal("snapshot store lock poisoned".into()))
    }

    /// Overwrite a stored snapshot without any checks.
    pub fn tamper(&self, version: u64, config: NodeContext) -> Result<()> {
        self.lock()?.insert(version, config);
        Ok(())
    }
}

impl SnapshotStorage for MemSnapshotStore {
    fn save(&self, version: u64, config: &NodeContext) -> Result<()> {
        if version == 0 {
            return Err(Error::InvalidVersion(0));
        }
        self.lock()?.insert(version, config.clone());
        Ok(())
    }

    fn load(&self, version: u64) -> Result<Option<NodeContext>> {
        if version == 0 {
            return Ok(None);
        }
        Ok(self.lock()?.get(&version).cloned())
    }

    fn versions(&self) -> Result<Vec<u64>> {
        Ok(self.lock()?.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applicator::{Cluster, Node, Stripe};
    use tempfile::tempdir;

    fn context() -> NodeContext {
        let cluster = Cluster::new(
            "prod",
            vec![Stripe::new("s1", vec![Node::new("node.a", "h:1")])],
        );
        NodeContext::new(cluster, "node.a")
    }

    #[test]
    fn test_filename_parse() {
        let name = SnapshotFilename::new("rack/1 node.a", 12);
        let file = name.to_file_name();
        assert_eq!(SnapshotFilename::parse(&file), Some(name));

        assert_eq!(SnapshotFilename::parse("node-1"), None);
        assert_eq!(SnapshotFilename::parse("node-1.tmp"), None);
        assert_eq!(SnapshotFilename::parse(".3"), None);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path(), "node.a").unwrap();

        assert_eq!(store.load(0).unwrap(), None);
        assert_eq!(store.load(1).unwrap(), None);
        assert!(matches!(
            store.save(0, &context()),
            Err(Error::InvalidVersion(0))
        ));

        store.save(2, &context()).unwrap();
        store.save(1, &context()).unwrap();
        assert_eq!(store.load(2).unwrap(), Some(context()));
        assert_eq!(store.versions().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_file_store_detects_garbage() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path(), "n").unwrap();
        std::fs::write(dir.path().join("n.4"), b"not json").unwrap();
        assert!(matches!(store.load(4), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_mem_store() {
        let store = MemSnapshotStore::new();
        store.save(1, &context()).unwrap();
        assert_eq!(store.load(1).unwrap(), Some(context()));
        assert_eq!(store.versions().unwrap(), vec![1]);
    }
}
