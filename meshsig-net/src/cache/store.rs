// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, trace};

use crate::error::{MeshSigError, Result};

const ADVERTISEMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("advertisements");

/// Durable key/value backing for the discovery cache, one record per peer ID.
pub trait CacheStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply every upsert and removal in one transaction.
    fn write_batch(&self, upserts: &[(String, Vec<u8>)], removals: &[String]) -> Result<()>;
}

pub struct RedbCacheStore {
    db: Database,
    path: PathBuf,
}

impl RedbCacheStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    MeshSigError::Storage(format!("Failed to create cache directory: {e}"))
                })?;
            }
        }
        let db = Database::create(path)?;
        {
            let wtxn = db.begin_write()?;
            {
                let _ = wtxn.open_table(ADVERTISEMENTS_TABLE)?;
            }
            wtxn.commit()?;
        }
        debug!(path = ?path, "Opened discovery cache store");
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStore for RedbCacheStore {
    fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(ADVERTISEMENTS_TABLE)?;

        let mut records = Vec::new();
        for result in table.iter()? {
            let (key, value) = result?;
            records.push((key.value().to_string(), value.value().to_vec()));
        }
        trace!(count = records.len(), "Loaded cache records");
        Ok(records)
    }

    fn write_batch(&self, upserts: &[(String, Vec<u8>)], removals: &[String]) -> Result<()> {
        let wtxn = self.db.begin_write()?;
        {
            let mut table = wtxn.open_table(ADVERTISEMENTS_TABLE)?;
            for (key, value) in upserts {
                table.insert(key.as_str(), value.as_slice())?;
            }
            for key in removals {
                table.remove(key.as_str())?;
            }
        }
        wtxn.commit()?;
        trace!(
            upserts = upserts.len(),
            removals = removals.len(),
            "Committed cache batch"
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCacheStore {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
    batches: AtomicUsize,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed batches. Each flush is one batch.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.records.read().get(key).cloned()
    }

    /// Overwrite a record directly, bypassing the cache.
    pub fn insert_raw(&self, key: &str, value: Vec<u8>) {
        self.records.write().insert(key.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl CacheStore for MemoryCacheStore {
    fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .records
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, upserts: &[(String, Vec<u8>)], removals: &[String]) -> Result<()> {
        let mut records = self.records.write();
        for (key, value) in upserts {
            records.insert(key.clone(), value.clone());
        }
        for key in removals {
            records.remove(key);
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<T: CacheStore + ?Sized> CacheStore for std::sync::Arc<T> {
    fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        (**self).load_all()
    }

    fn write_batch(&self, upserts: &[(String, Vec<u8>)], removals: &[String]) -> Result<()> {
        (**self).write_batch(upserts, removals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_redb_store_batch_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.redb");

        {
            let store = RedbCacheStore::open(&path).unwrap();
            store
                .write_batch(
                    &[
                        ("peer-a".into(), b"one".to_vec()),
                        ("peer-b".into(), b"two".to_vec()),
                    ],
                    &[],
                )
                .unwrap();
            store
                .write_batch(&[("peer-c".into(), b"three".to_vec())], &["peer-a".into()])
                .unwrap();
        }

        let store = RedbCacheStore::open(&path).unwrap();
        let records = store.load_all().unwrap();
        let keys: Vec<&str> = records.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["peer-b", "peer-c"]);
        assert_eq!(records[1].1, b"three");
    }

    #[test]
    fn test_memory_store_counts_batches() {
        let store = MemoryCacheStore::new();
        assert!(store.is_empty());
        store
            .write_batch(&[("peer-a".into(), vec![1])], &[])
            .unwrap();
        store.write_batch(&[], &["peer-a".into()]).unwrap();
        assert_eq!(store.batch_count(), 2);
        assert!(store.raw("peer-a").is_none());
    }
}
