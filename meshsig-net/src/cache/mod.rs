// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Discovery cache: verified advertisements keyed by peer ID, persisted
//! through a [`CacheStore`] with debounced write-back.
//!
//! Every read filters expired entries, so callers never observe an
//! advertisement past its `expiresAt`. Writes mark the peer dirty and
//! schedule one batched flush per debounce window. `flush()` drains the dirty
//! set synchronously and is safe to call at any time.

#![forbid(unsafe_code)]

mod record;
mod store;

pub use record::{CacheEntry, EntrySource};
pub use store::{CacheStore, MemoryCacheStore, RedbCacheStore};

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::advertisement::Advertisement;
use crate::error::{MeshSigError, Result};
use crate::types::{now_ms, PeerId};

pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

static SHARED_CACHE: OnceLock<DiscoveryCache> = OnceLock::new();

#[derive(Default)]
struct DirtySet {
    upserts: HashSet<PeerId>,
    removals: HashSet<PeerId>,
}

impl DirtySet {
    fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    fn mark_upsert(&mut self, peer_id: PeerId) {
        self.removals.remove(&peer_id);
        self.upserts.insert(peer_id);
    }

    fn mark_removal(&mut self, peer_id: PeerId) {
        self.upserts.remove(&peer_id);
        self.removals.insert(peer_id);
    }
}

struct Inner {
    entries: RwLock<HashMap<PeerId, Arc<CacheEntry>>>,
    dirty: Mutex<DirtySet>,
    flush_lock: Mutex<()>,
    flush_scheduled: AtomicBool,
    debounce: Duration,
    store: Box<dyn CacheStore>,
}

impl Inner {
    fn flush(&self) -> Result<()> {
        let _serial = self.flush_lock.lock();

        let pending = std::mem::take(&mut *self.dirty.lock());
        if pending.is_empty() {
            return Ok(());
        }

        let mut upserts = Vec::with_capacity(pending.upserts.len());
        let mut removals: Vec<String> = pending
            .removals
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();
        {
            let entries = self.entries.read();
            for peer_id in &pending.upserts {
                match entries.get(peer_id) {
                    Some(entry) => match entry.encode() {
                        Ok(bytes) => upserts.push((peer_id.as_str().to_string(), bytes)),
                        Err(e) => {
                            warn!(peer_id = %peer_id, error = %e, "Failed to encode cache entry");
                        }
                    },
                    None => removals.push(peer_id.as_str().to_string()),
                }
            }
        }

        if let Err(e) = self.store.write_batch(&upserts, &removals) {
            let mut dirty = self.dirty.lock();
            for peer_id in pending.upserts {
                if !dirty.removals.contains(&peer_id) {
                    dirty.upserts.insert(peer_id);
                }
            }
            for peer_id in pending.removals {
                if !dirty.upserts.contains(&peer_id) {
                    dirty.removals.insert(peer_id);
                }
            }
            return Err(e);
        }

        debug!(
            written = upserts.len(),
            removed = removals.len(),
            "Flushed discovery cache"
        );
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.dirty.get_mut().is_empty() {
            return;
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to flush discovery cache on drop");
        }
    }
}

/// Handle to the process's discovery cache. Clones share one state.
#[derive(Clone)]
pub struct DiscoveryCache {
    inner: Arc<Inner>,
}

impl DiscoveryCache {
    pub fn open(store: impl CacheStore + 'static) -> Result<Self> {
        Self::open_with_debounce(store, DEFAULT_FLUSH_DEBOUNCE)
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(RedbCacheStore::open(path)?)
    }

    pub fn in_memory() -> Self {
        Self::build(Box::new(MemoryCacheStore::new()), DEFAULT_FLUSH_DEBOUNCE)
    }

    /// Load every persisted record, keeping only those that still decode,
    /// verify and are unexpired. Rejected records are deleted from storage.
    pub fn open_with_debounce(store: impl CacheStore + 'static, debounce: Duration) -> Result<Self> {
        let cache = Self::build(Box::new(store), debounce);
        let records = cache.inner.store.load_all()?;
        let now = now_ms();

        let mut rejected = Vec::new();
        let mut restored = HashMap::with_capacity(records.len());
        for (key, bytes) in records {
            let entry = match CacheEntry::decode(&bytes) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(peer_id = %key, error = %e, "Dropping undecodable cache record");
                    rejected.push(key);
                    continue;
                }
            };
            if entry.peer_id().as_str() != key {
                warn!(peer_id = %key, "Dropping cache record stored under the wrong key");
                rejected.push(key);
                continue;
            }
            if let Err(e) = entry.advertisement.verify(now) {
                warn!(peer_id = %key, error = %e, "Dropping cached advertisement that failed verification");
                rejected.push(key);
                continue;
            }
            let entry = CacheEntry {
                source: EntrySource::Restored,
                ..entry
            };
            restored.insert(entry.peer_id().clone(), Arc::new(entry));
        }

        if !rejected.is_empty() {
            cache.inner.store.write_batch(&[], &rejected)?;
        }
        info!(
            restored = restored.len(),
            rejected = rejected.len(),
            "Loaded discovery cache"
        );
        *cache.inner.entries.write() = restored;
        Ok(cache)
    }

    fn build(store: Box<dyn CacheStore>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                dirty: Mutex::new(DirtySet::default()),
                flush_lock: Mutex::new(()),
                flush_scheduled: AtomicBool::new(false),
                debounce,
                store,
            }),
        }
    }

    /// Register this cache as the process-wide instance. Fails if another
    /// cache was installed first.
    pub fn install_shared(&self) -> Result<()> {
        SHARED_CACHE
            .set(self.clone())
            .map_err(|_| MeshSigError::Storage("A shared discovery cache is already installed".into()))
    }

    pub fn shared() -> Option<DiscoveryCache> {
        SHARED_CACHE.get().cloned()
    }

    /// Verify and store an advertisement. An advertisement older than the
    /// one already held for the same peer is ignored and the current entry
    /// returned. While an entry is live, the peer ID stays bound to its key.
    pub fn put(&self, advertisement: Advertisement, source: EntrySource) -> Result<Arc<CacheEntry>> {
        let now = now_ms();
        advertisement.verify(now)?;

        let peer_id = advertisement.peer_id.clone();
        let entry = {
            let mut entries = self.inner.entries.write();
            if let Some(existing) = entries.get(&peer_id).filter(|e| !e.is_expired_at(now)) {
                if existing.advertisement.public_key != advertisement.public_key {
                    warn!(
                        peer_id = %peer_id,
                        held = %existing.advertisement.public_key,
                        offered = %advertisement.public_key,
                        "Refusing advertisement from a different key"
                    );
                    return Err(MeshSigError::Unauthorized(format!(
                        "{peer_id} is advertised by a different key"
                    )));
                }
                if existing.advertisement.created_at > advertisement.created_at {
                    debug!(peer_id = %peer_id, "Ignoring older advertisement");
                    return Ok(existing.clone());
                }
            }
            let entry = Arc::new(CacheEntry {
                advertisement,
                inserted_at: now,
                source,
            });
            entries.insert(peer_id.clone(), entry.clone());
            entry
        };

        self.inner.dirty.lock().mark_upsert(peer_id);
        self.schedule_flush()?;
        Ok(entry)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<CacheEntry>> {
        let now = now_ms();
        self.inner
            .entries
            .read()
            .get(peer_id)
            .filter(|e| !e.is_expired_at(now))
            .cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<CacheEntry>> {
        let now = now_ms();
        let mut all: Vec<_> = self
            .inner
            .entries
            .read()
            .values()
            .filter(|e| !e.is_expired_at(now))
            .cloned()
            .collect();
        all.sort_by(|a, b| a.peer_id().cmp(b.peer_id()));
        all
    }

    pub fn remove(&self, peer_id: &PeerId) -> Result<Option<Arc<CacheEntry>>> {
        let removed = self.inner.entries.write().remove(peer_id);
        if removed.is_some() {
            self.inner.dirty.lock().mark_removal(peer_id.clone());
            self.schedule_flush()?;
        }
        Ok(removed)
    }

    /// Drop every entry expired at `now_ms`; returns how many were removed.
    pub fn prune_expired(&self, now_ms: u64) -> Result<usize> {
        let expired: Vec<PeerId> = {
            let mut entries = self.inner.entries.write();
            let expired: Vec<PeerId> = entries
                .iter()
                .filter(|(_, e)| e.is_expired_at(now_ms))
                .map(|(p, _)| p.clone())
                .collect();
            for peer_id in &expired {
                entries.remove(peer_id);
            }
            expired
        };
        if expired.is_empty() {
            return Ok(0);
        }
        {
            let mut dirty = self.inner.dirty.lock();
            for peer_id in &expired {
                dirty.mark_removal(peer_id.clone());
            }
        }
        debug!(count = expired.len(), "Pruned expired advertisements");
        self.schedule_flush()?;
        Ok(expired.len())
    }

    /// Write every pending change now, bypassing the debounce window.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    pub fn is_dirty(&self) -> bool {
        !self.inner.dirty.lock().is_empty()
    }

    /// Entries held in memory, including any that expired since the last prune.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    fn schedule_flush(&self) -> Result<()> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return self.inner.flush(),
        };
        if self.inner.flush_scheduled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let debounce = self.inner.debounce;
        handle.spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.flush_scheduled.store(false, Ordering::SeqCst);
            let result = tokio::task::spawn_blocking(move || inner.flush()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Debounced cache flush failed"),
                Err(e) => warn!(error = %e, "Debounced cache flush task panicked"),
            }
        });
        Ok(())
    }
}

impl std::fmt::Debug for DiscoveryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCache")
            .field("entries", &self.len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::tests::signed_advertisement;
    use crate::advertisement::AdvertisementBuilder;
    use crate::keys::SignerKeys;

    #[test]
    fn test_put_without_runtime_writes_through() {
        let store = Arc::new(MemoryCacheStore::new());
        let cache = DiscoveryCache::open(store.clone()).unwrap();
        let keys = SignerKeys::generate();
        cache
            .put(signed_advertisement(&keys, "peer-a"), EntrySource::Overlay)
            .unwrap();

        assert!(!cache.is_dirty());
        assert!(store.raw("peer-a").is_some());
        assert_eq!(cache.get(&PeerId::new("peer-a")).unwrap().source, EntrySource::Overlay);
    }

    #[test]
    fn test_put_rejects_bad_signature_and_expired() {
        let cache = DiscoveryCache::in_memory();
        let keys = SignerKeys::generate();

        let mut forged = signed_advertisement(&keys, "peer-a");
        forged.signature[5] ^= 0x01;
        assert!(matches!(
            cache.put(forged, EntrySource::Overlay),
            Err(MeshSigError::SignatureInvalid(_))
        ));

        let expired = AdvertisementBuilder::new(PeerId::new("peer-b"))
            .created_at(1_000)
            .ttl(Duration::from_secs(1))
            .sign(&keys)
            .unwrap();
        assert!(matches!(
            cache.put(expired, EntrySource::Overlay),
            Err(MeshSigError::Expired(_))
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_peer_id_stays_bound_to_its_key() {
        let cache = DiscoveryCache::in_memory();
        let owner = SignerKeys::generate();
        let intruder = SignerKeys::generate();
        let now = now_ms();
        let genuine = AdvertisementBuilder::new(PeerId::new("peer-v"))
            .created_at(now)
            .sign(&owner)
            .unwrap();
        let claim = AdvertisementBuilder::new(PeerId::new("peer-v"))
            .created_at(now + 1)
            .sign(&intruder)
            .unwrap();

        cache.put(genuine, EntrySource::Overlay).unwrap();
        assert!(matches!(
            cache.put(claim, EntrySource::Overlay),
            Err(MeshSigError::Unauthorized(_))
        ));
        let held = cache.get(&PeerId::new("peer-v")).unwrap();
        assert_eq!(held.advertisement.public_key, owner.public_key());

        let refreshed = AdvertisementBuilder::new(PeerId::new("peer-v"))
            .created_at(now + 2)
            .sign(&owner)
            .unwrap();
        cache.put(refreshed, EntrySource::Overlay).unwrap();
        assert_eq!(
            cache.get(&PeerId::new("peer-v")).unwrap().advertisement.created_at,
            now + 2
        );
    }

    #[test]
    fn test_older_advertisement_does_not_replace_newer() {
        let cache = DiscoveryCache::in_memory();
        let keys = SignerKeys::generate();
        let now = now_ms();
        let older = AdvertisementBuilder::new(PeerId::new("peer-a"))
            .created_at(now - 5_000)
            .sign(&keys)
            .unwrap();
        let newer = AdvertisementBuilder::new(PeerId::new("peer-a"))
            .created_at(now)
            .sign(&keys)
            .unwrap();

        cache.put(newer.clone(), EntrySource::Overlay).unwrap();
        let kept = cache.put(older, EntrySource::Overlay).unwrap();
        assert_eq!(kept.advertisement, newer);
    }

    #[test]
    fn test_expired_entries_are_hidden_then_pruned() {
        let cache = DiscoveryCache::in_memory();
        let keys = SignerKeys::generate();
        let ad = signed_advertisement(&keys, "peer-a");
        let expires_at = ad.expires_at;
        cache.put(ad, EntrySource::Overlay).unwrap();

        assert_eq!(cache.prune_expired(expires_at - 1).unwrap(), 0);
        assert_eq!(cache.prune_expired(expires_at).unwrap(), 1);
        assert!(cache.get(&PeerId::new("peer-a")).is_none());
        assert!(cache.get_all().is_empty());
    }

    #[test]
    fn test_drop_flushes_pending_writes() {
        let store = Arc::new(MemoryCacheStore::new());
        let keys = SignerKeys::generate();
        {
            let cache = DiscoveryCache::open(store.clone()).unwrap();
            // Seed the dirty set directly, as a pending debounce would.
            let ad = signed_advertisement(&keys, "peer-a");
            cache.inner.entries.write().insert(
                ad.peer_id.clone(),
                Arc::new(CacheEntry {
                    advertisement: ad,
                    inserted_at: now_ms(),
                    source: EntrySource::Manual,
                }),
            );
            cache.inner.dirty.lock().mark_upsert(PeerId::new("peer-a"));
            assert!(cache.is_dirty());
        }
        assert!(store.raw("peer-a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_puts_within_window_coalesce() {
        let store = Arc::new(MemoryCacheStore::new());
        let cache = DiscoveryCache::open(store.clone()).unwrap();

        for i in 0..5 {
            let keys = SignerKeys::generate();
            cache
                .put(signed_advertisement(&keys, &format!("peer-{i}")), EntrySource::Overlay)
                .unwrap();
        }
        assert!(cache.is_dirty());
        assert_eq!(store.batch_count(), 0);

        tokio::time::sleep(DEFAULT_FLUSH_DEBOUNCE + Duration::from_millis(50)).await;
        for _ in 0..20 {
            if store.batch_count() > 0 {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(store.batch_count(), 1);
        assert_eq!(store.len(), 5);
        assert!(!cache.is_dirty());
    }

    #[tokio::test]
    async fn test_flush_bypasses_debounce() {
        let store = Arc::new(MemoryCacheStore::new());
        let cache = DiscoveryCache::open(store.clone()).unwrap();
        let keys = SignerKeys::generate();
        cache
            .put(signed_advertisement(&keys, "peer-a"), EntrySource::Overlay)
            .unwrap();
        cache.flush().unwrap();
        assert!(store.raw("peer-a").is_some());
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_shared_cache_is_one_instance() {
        let cache = DiscoveryCache::in_memory();
        cache.install_shared().unwrap();
        assert!(DiscoveryCache::in_memory().install_shared().is_err());

        let keys = SignerKeys::generate();
        cache
            .put(signed_advertisement(&keys, "peer-a"), EntrySource::Overlay)
            .unwrap();
        let shared = DiscoveryCache::shared().unwrap();
        assert!(shared.get(&PeerId::new("peer-a")).is_some());
    }
}
