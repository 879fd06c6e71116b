//! Scoped local cache for remote file-sets
//!
//! Items pulled from a store are staged into `<slot>.download`, then moved
//! into place together with a checksum side-car on commit. A slot is held by
//! at most one [`CacheSlot`] at a time: a second acquirer of the same key
//! blocks until the first one is dropped, so one item is never downloaded
//! twice concurrently. Dropping an uncommitted slot removes its staging
//! directory, whatever the exit path, and the slot's lock is forgotten once
//! nobody holds or waits on it.
//!
//! Freshness is decided by checksums only. Items that come without checksums
//! are never fresh and are pulled again on every fetch.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{DataStore, ItemEntry, ItemKind, ItemValue, LeafEntry, ProvenanceRecord};
use crate::domain::{RowLocator, StoreCapabilities};
use crate::infrastructure::fs_util::copy_recursively;
use crate::{Result, StorageError};

const STAGING_SUFFIX: &str = ".download";
const CHECKSUM_SUFFIX: &str = ".checksums.json";

#[derive(Default)]
struct SlotLock {
    busy: Mutex<bool>,
    released: Condvar,
}

impl SlotLock {
    fn acquire(&self) -> bool {
        let mut busy = self.busy.lock();
        let waited = *busy;
        while *busy {
            self.released.wait(&mut busy);
        }
        *busy = true;
        waited
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.released.notify_all();
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub waits: usize,
}

type SlotMap = DashMap<String, Arc<SlotLock>>;

/// Local cache directory with per-key exclusive slots
pub struct LocalCache {
    root: PathBuf,
    slots: Arc<SlotMap>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    waits: AtomicUsize,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            slots: Arc::new(DashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys currently held or waited on
    pub fn active_slots(&self) -> usize {
        self.slots.len()
    }

    /// Reserve the slot for `key`, blocking while another holder owns it
    pub fn acquire(&self, key: &str) -> Result<CacheSlot> {
        let lock = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(SlotLock::default()))
            .clone();
        if lock.acquire() {
            self.waits.fetch_add(1, Ordering::SeqCst);
            debug!(key, "Waited for cache slot");
        }

        let base = self.root.join(slot_dir_name(key));
        let slot = CacheSlot {
            key: key.to_string(),
            staging: with_suffix(&base, STAGING_SUFFIX),
            sidecar: with_suffix(&base, CHECKSUM_SUFFIX),
            dir: base,
            lock,
            slots: Arc::clone(&self.slots),
            committed: false,
        };
        // Leftovers from a crashed process
        if slot.staging.exists() {
            fs::remove_dir_all(&slot.staging)?;
        }
        Ok(slot)
    }

    /// Return cached paths when fresh, otherwise fill the slot with `fill`
    pub fn fetch<F>(
        &self,
        key: &str,
        checksums: &BTreeMap<String, String>,
        fill: F,
    ) -> Result<Vec<PathBuf>>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let mut slot = self.acquire(key)?;
        if slot.is_fresh(checksums) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            debug!(key, "Cache hit");
            return slot.cached_paths();
        }
        self.misses.fetch_add(1, Ordering::SeqCst);
        debug!(key, "Cache miss");
        let staging = slot.staging_dir()?.to_path_buf();
        fill(&staging)?;
        slot.commit(checksums)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
            waits: self.waits.load(Ordering::SeqCst),
        }
    }
}

/// Exclusive handle on one cache slot
pub struct CacheSlot {
    key: String,
    dir: PathBuf,
    staging: PathBuf,
    sidecar: PathBuf,
    lock: Arc<SlotLock>,
    slots: Arc<SlotMap>,
    committed: bool,
}

impl CacheSlot {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the committed content matches `checksums`
    ///
    /// Empty checksums cannot vouch for anything and are never fresh.
    pub fn is_fresh(&self, checksums: &BTreeMap<String, String>) -> bool {
        if checksums.is_empty() || !self.dir.exists() {
            return false;
        }
        let stored = match fs::read(&self.sidecar) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        match serde_json::from_slice::<BTreeMap<String, String>>(&stored) {
            Ok(stored) => &stored == checksums,
            Err(_) => false,
        }
    }

    /// Staging directory, created on first use
    pub fn staging_dir(&mut self) -> Result<&Path> {
        if !self.staging.exists() {
            fs::create_dir_all(&self.staging)?;
        }
        Ok(&self.staging)
    }

    /// Move the staged content into place and record its checksums
    pub fn commit(&mut self, checksums: &BTreeMap<String, String>) -> Result<Vec<PathBuf>> {
        if !self.staging.exists() {
            return Err(StorageError::cache(format!(
                "Nothing staged for cache slot {}",
                self.key
            )));
        }
        // Invalidate before replacing so a crash never leaves a fresh-looking slot
        if self.sidecar.exists() {
            fs::remove_file(&self.sidecar)?;
        }
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::rename(&self.staging, &self.dir)?;
        fs::write(&self.sidecar, serde_json::to_vec(checksums)?)?;
        self.committed = true;
        self.cached_paths()
    }

    /// Top-level entries of the committed slot, sorted by name
    pub fn cached_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = fs::read_dir(&self.dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        paths.sort();
        Ok(paths)
    }
}

impl Drop for CacheSlot {
    fn drop(&mut self) {
        if !self.committed && self.staging.exists() {
            if let Err(e) = fs::remove_dir_all(&self.staging) {
                warn!(key = %self.key, error = %e, "Failed to clean cache staging dir");
            }
        }
        self.lock.release();
        // Map entry plus this handle: nobody else holds or waits on the lock
        self.slots.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

fn slot_dir_name(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

// ═══════════════════════════════════════════════════════════════════════════
// Caching decorator
// ═══════════════════════════════════════════════════════════════════════════

/// Store decorator that routes file-set reads through a [`LocalCache`]
pub struct CachingStore<S> {
    inner: S,
    cache: LocalCache,
}

impl<S: DataStore> CachingStore<S> {
    pub fn new(inner: S, cache: LocalCache) -> Self {
        Self { inner, cache }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }
}

impl<S: DataStore> DataStore for CachingStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }

    fn list_rows(&self, dataset_id: &str, hierarchy: &[String]) -> Result<Vec<LeafEntry>> {
        self.inner.list_rows(dataset_id, hierarchy)
    }

    fn list_items(&self, dataset_id: &str, row: &RowLocator) -> Result<Vec<ItemEntry>> {
        self.inner.list_items(dataset_id, row)
    }

    fn read_item(&self, dataset_id: &str, entry: &ItemEntry) -> Result<ItemValue> {
        if entry.kind == ItemKind::Field {
            return self.inner.read_item(dataset_id, entry);
        }
        let key = format!("{}:{}", dataset_id, entry.uri);
        let paths = self.cache.fetch(&key, &entry.checksums, |staging| {
            let value = self.inner.read_item(dataset_id, entry)?;
            let sources = value.paths().ok_or_else(|| {
                StorageError::cache(format!("{} is not a file-set", entry.uri))
            })?;
            for source in sources {
                let name = source
                    .file_name()
                    .ok_or_else(|| StorageError::item_not_found(source.to_string_lossy()))?;
                copy_recursively(source, &staging.join(name))?;
            }
            Ok(())
        })?;
        Ok(ItemValue::FileSet(paths))
    }

    fn write_item(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        path: &str,
        format: &str,
        value: &ItemValue,
    ) -> Result<ItemEntry> {
        self.inner.write_item(dataset_id, row, path, format, value)
    }

    fn read_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        column: &str,
    ) -> Result<Option<ProvenanceRecord>> {
        self.inner.read_provenance(dataset_id, row, column)
    }

    fn write_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        column: &str,
        record: &ProvenanceRecord,
    ) -> Result<()> {
        self.inner.write_provenance(dataset_id, row, column, record)
    }

    fn remove_provenance(&self, dataset_id: &str, row: &RowLocator, column: &str) -> Result<()> {
        self.inner.remove_provenance(dataset_id, row, column)
    }

    fn save_definition(
        &self,
        dataset_id: &str,
        name: Option<&str>,
        definition: &serde_json::Value,
    ) -> Result<()> {
        self.inner.save_definition(dataset_id, name, definition)
    }

    fn load_definition(
        &self,
        dataset_id: &str,
        name: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        self.inner.load_definition(dataset_id, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksums(v: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("a.txt".to_string(), v.to_string());
        map
    }

    #[test]
    fn test_fetch_miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path()).unwrap();

        let paths = cache
            .fetch("ds:item", &checksums("1"), |staging| {
                fs::write(staging.join("a.txt"), "one")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(fs::read_to_string(&paths[0]).unwrap(), "one");

        let again = cache
            .fetch("ds:item", &checksums("1"), |_| {
                panic!("fresh slot must not be refilled")
            })
            .unwrap();
        assert_eq!(again, paths);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                waits: 0
            }
        );
    }

    #[test]
    fn test_changed_checksums_refill_slot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path()).unwrap();

        cache
            .fetch("k", &checksums("1"), |s| Ok(fs::write(s.join("a.txt"), "old")?))
            .unwrap();
        let paths = cache
            .fetch("k", &checksums("2"), |s| Ok(fs::write(s.join("a.txt"), "new")?))
            .unwrap();
        assert_eq!(fs::read_to_string(&paths[0]).unwrap(), "new");
    }

    #[test]
    fn test_failed_fill_leaves_no_staging_and_no_fresh_slot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path()).unwrap();

        let result = cache.fetch("k", &checksums("1"), |staging| {
            fs::write(staging.join("a.txt"), "partial")?;
            Err(StorageError::cache("download interrupted"))
        });
        assert!(result.is_err());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(leftovers.is_empty(), "unexpected leftovers: {:?}", leftovers);

        let slot = cache.acquire("k").unwrap();
        assert!(!slot.is_fresh(&checksums("1")));
    }

    #[test]
    fn test_commit_without_staging_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path()).unwrap();
        let mut slot = cache.acquire("k").unwrap();
        assert!(slot.commit(&checksums("1")).is_err());
    }

    #[test]
    fn test_released_slots_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path()).unwrap();
        for key in ["a", "b", "c"] {
            cache
                .fetch(key, &checksums("1"), |s| Ok(fs::write(s.join("a.txt"), key)?))
                .unwrap();
        }
        assert_eq!(cache.active_slots(), 0);

        let held = cache.acquire("a").unwrap();
        assert_eq!(cache.active_slots(), 1);
        drop(held);
        assert_eq!(cache.active_slots(), 0);

        // Forgetting the lock keeps the committed content
        let paths = cache
            .fetch("a", &checksums("1"), |_| panic!("fresh slot must not be refilled"))
            .unwrap();
        assert_eq!(fs::read_to_string(&paths[0]).unwrap(), "a");
    }

    #[test]
    fn test_waiter_keeps_slot_alive() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(LocalCache::new(dir.path()).unwrap());
        let held = cache.acquire("k").unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let slot = cache.acquire("k").unwrap();
                slot.key().to_string()
            })
        };
        while Arc::strong_count(&held.lock) < 3 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        drop(held);
        assert_eq!(waiter.join().unwrap(), "k");
        assert_eq!(cache.active_slots(), 0);
    }

    #[test]
    fn test_empty_checksums_are_never_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path()).unwrap();
        let empty = BTreeMap::new();
        let mut fills = 0;
        for _ in 0..2 {
            cache
                .fetch("k", &empty, |s| {
                    fills += 1;
                    Ok(fs::write(s.join("a.txt"), "content")?)
                })
                .unwrap();
        }
        assert_eq!(fills, 2);
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path()).unwrap();
        let _a = cache.acquire("a").unwrap();
        let _b = cache.acquire("b").unwrap();
        assert_eq!(cache.stats().waits, 0);
    }
}
