//! Durable key-value ledger backing each node's protocol state
//!
//! Supports in-memory, RocksDB, and Sled backends. Every mutation goes
//! through [`Ledger::write_batch`], which is atomic on all backends, and
//! multi-key reads go through [`Ledger::get_many`], which observes a
//! single point in time.

use crate::common::config::LedgerBackend;
use crate::{Error, Result};
use rocksdb::{Options, WriteBatch, WriteOptions, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One write in an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Trait for ledger storage backends
pub trait Ledger: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read several keys from one consistent view.
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Apply every op or none of them.
    fn write_batch(&self, ops: Vec<LedgerOp>) -> Result<()>;

    /// All entries whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// In-memory ledger (tests, ephemeral nodes)
#[derive(Default)]
pub struct MemLedger {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.map
            .lock()
            .map_err(|_| Error::Ledger("memory ledger lock poisoned".into()))
    }
}

impl Ledger for MemLedger {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let map = self.lock()?;
        Ok(keys.iter().map(|k| map.get(*k).cloned()).collect())
    }

    fn write_batch(&self, ops: Vec<LedgerOp>) -> Result<()> {
        let mut map = self.lock()?;
        for op in ops {
            match op {
                LedgerOp::Put(k, v) => {
                    map.insert(k, v);
                }
                LedgerOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let map = self.lock()?;
        let mut out: Vec<_> = map
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

/// RocksDB ledger
pub struct RocksLedger {
    db: DB,
}

impl RocksLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl Ledger for RocksLedger {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let snapshot = self.db.snapshot();
        keys.iter()
            .map(|k| snapshot.get(k).map_err(Error::from))
            .collect()
    }

    fn write_batch(&self, ops: Vec<LedgerOp>) -> Result<()> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                LedgerOp::Put(k, v) => batch.put(k, v),
                LedgerOp::Delete(k) => batch.delete(k),
            }
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.prefix_iterator(prefix) {
            let (k, v) = item?;
            // prefix_iterator only seeks; stop once past the prefix
            if !k.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(k.to_vec())
                .map_err(|e| Error::Corrupted(format!("ledger key is not utf-8: {}", e)))?;
            out.push((key, v.to_vec()));
        }
        Ok(out)
    }
}

/// Sled ledger
#[cfg(feature = "sled-backend")]
pub struct SledLedger {
    db: sled::Db,
}

#[cfg(feature = "sled-backend")]
impl SledLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| Error::Ledger(e.to_string()))?;
        Ok(Self { db })
    }
}

#[cfg(feature = "sled-backend")]
impl Ledger for SledLedger {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| Error::Ledger(e.to_string()))
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let tree: &sled::Tree = &self.db;
        tree.transaction(|tx| {
            let mut out = Vec::with_capacity(keys.len());
            for k in keys {
                out.push(tx.get(*k)?.map(|ivec| ivec.to_vec()));
            }
            Ok(out)
        })
        .map_err(|e: sled::transaction::TransactionError<()>| Error::Ledger(format!("{:?}", e)))
    }

    fn write_batch(&self, ops: Vec<LedgerOp>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                LedgerOp::Put(k, v) => batch.insert(k.as_bytes(), v),
                LedgerOp::Delete(k) => batch.remove(k.as_bytes()),
            }
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| Error::Ledger(e.to_string()))?;
        self.db.flush().map_err(|e| Error::Ledger(e.to_string()))?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| Error::Ledger(e.to_string()))?;
            let key = String::from_utf8(k.to_vec())
                .map_err(|e| Error::Corrupted(format!("ledger key is not utf-8: {}", e)))?;
            out.push((key, v.to_vec()));
        }
        Ok(out)
    }
}

/// Open the configured backend under `dir`.
pub fn open_ledger(backend: LedgerBackend, dir: &Path) -> Result<Arc<dyn Ledger>> {
    match backend {
        LedgerBackend::Memory => Ok(Arc::new(MemLedger::new())),
        LedgerBackend::Rocksdb => Ok(Arc::new(RocksLedger::open(dir.join("ledger"))?)),
        #[cfg(feature = "sled-backend")]
        LedgerBackend::Sled => Ok(Arc::new(SledLedger::open(dir.join("ledger-sled"))?)),
        #[cfg(not(feature = "sled-backend"))]
        LedgerBackend::Sled => Err(Error::InvalidConfig(
            "sled ledger requires the sled-backend feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(ledger: &dyn Ledger) {
        ledger
            .write_batch(vec![
                LedgerOp::Put("state/mode".into(), b"ACCEPTING".to_vec()),
                LedgerOp::Put("change/b".into(), b"2".to_vec()),
                LedgerOp::Put("change/a".into(), b"1".to_vec()),
            ])
            .unwrap();

        assert_eq!(
            ledger.get("state/mode").unwrap(),
            Some(b"ACCEPTING".to_vec())
        );
        let many = ledger.get_many(&["change/a", "missing"]).unwrap();
        assert_eq!(many, vec![Some(b"1".to_vec()), None]);

        let scanned = ledger.scan_prefix("change/").unwrap();
        let keys: Vec<_> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["change/a", "change/b"]);

        ledger
            .write_batch(vec![LedgerOp::Delete("change/a".into())])
            .unwrap();
        assert_eq!(ledger.get("change/a").unwrap(), None);
    }

    #[test]
    fn test_mem_ledger() {
        exercise(&MemLedger::new());
    }

    #[test]
    fn test_rocks_ledger() {
        let dir = tempdir().unwrap();
        exercise(&RocksLedger::open(dir.path().join("db")).unwrap());
    }

    #[test]
    fn test_rocks_ledger_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let ledger = RocksLedger::open(&path).unwrap();
            ledger
                .write_batch(vec![LedgerOp::Put("k".into(), b"v".to_vec())])
                .unwrap();
        }
        let ledger = RocksLedger::open(&path).unwrap();
        assert_eq!(ledger.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[cfg(feature = "sled-backend")]
    #[test]
    fn test_sled_ledger() {
        let dir = tempdir().unwrap();
        exercise(&SledLedger::open(dir.path().join("db")).unwrap());
    }
}
