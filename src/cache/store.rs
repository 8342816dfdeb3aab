//! Two-tier response store.
//!
//! Memory tier: a [`ByteLru`] bounded by total entry size. Disk tier: one
//! record file per key under `<root>/<generation>/entries/`, named by the
//! SHA-256 of the key, plus `<root>/<generation>/index.json` mapping those
//! hashes back to keys. Eviction only ever drops the memory copy; the disk
//! copy stays until the key is deleted or its generation is vacuumed.
//!
//! Disk work runs on spawned tasks. Operations on the same key are chained so
//! they apply in the order they were issued, and concurrent loads of one key
//! share a single read.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use metrics::counter;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::codec::{self, CacheEntry, CodecError};
use super::config::CacheConfig;
use super::lock::mutex_lock;
use super::lru::{ByteLru, Insert};
use super::vacuum::{is_safe_generation, vacuum};

const SOURCE: &str = "cache::store";

const ENTRIES_DIR: &str = "entries";
const INDEX_FILE: &str = "index.json";
const ENTRY_EXTENSION: &str = "bin";

const METRIC_MEMORY_HIT: &str = "isr_store_memory_hit_total";
const METRIC_DISK_HIT: &str = "isr_store_disk_hit_total";
const METRIC_MISS: &str = "isr_store_miss_total";
const METRIC_EVICT: &str = "isr_store_evict_total";
const METRIC_REJECTED: &str = "isr_store_rejected_total";
const METRIC_DISK_ERROR: &str = "isr_store_disk_error_total";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid cache generation `{0}`: must be a single path component")]
    InvalidGeneration(String),
    #[error("failed to serialize cache metadata: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("invalid cache entry record: {0}")]
    Codec(#[from] CodecError),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Point-in-time view of store occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub max_bytes: usize,
    pub disk_entries: usize,
}

/// How a completed disk load is admitted into the memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admit {
    /// Insert at the front, evicting older entries as needed.
    Promote,
    /// Insert only when it fits without evicting anything.
    IfRoom,
}

type LoadFuture = Shared<BoxFuture<'static, Option<Arc<CacheEntry>>>>;

/// An in-flight disk read. `promote` starts as the admission of whoever
/// registered the load and is raised when a `get` joins it.
struct LoadSlot {
    id: u64,
    promote: Arc<AtomicBool>,
    load: LoadFuture,
}

/// Frees a load's registry slot when its task ends, panics included.
struct LoadGuard {
    inner: Arc<StoreInner>,
    key: String,
    id: u64,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        let id = self.id;
        self.inner.loads.remove_if(&self.key, |_, slot| slot.id == id);
    }
}
type DiskOp = Shared<BoxFuture<'static, ()>>;

/// Stable file name for a cache key.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Handle to a two-tier store. Clones share the same state.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: CacheConfig,
    entries_dir: PathBuf,
    index_path: PathBuf,
    memory: Mutex<ByteLru<Arc<CacheEntry>>>,
    /// hash -> original key, for every entry believed to be on disk.
    disk_index: DashMap<String, String>,
    /// key -> shared in-flight disk read.
    loads: DashMap<String, LoadSlot>,
    load_seq: AtomicU64,
    /// hash -> most recently scheduled write/delete, tagged with its sequence.
    disk_ops: DashMap<String, (u64, DiskOp)>,
    op_seq: AtomicU64,
    pending: Mutex<Vec<JoinHandle<()>>>,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    flush_lock: tokio::sync::Mutex<()>,
    index_version: AtomicU64,
    flushed_version: AtomicU64,
}

impl CacheStore {
    /// Vacuums old generations (unless `vacuum_on_open` is off), prepares
    /// this generation's directory and restores its disk index.
    ///
    /// A missing or corrupt index yields an empty store.
    #[instrument(skip(config), fields(root = %config.root_dir.display(), generation = %config.generation))]
    pub async fn open(config: CacheConfig) -> Result<Self, StoreError> {
        if config.vacuum_on_open {
            vacuum(&config.root_dir, &config.generation).await?;
        } else if !is_safe_generation(&config.generation) {
            return Err(StoreError::InvalidGeneration(config.generation));
        }

        let generation_dir = config.root_dir.join(&config.generation);
        let entries_dir = generation_dir.join(ENTRIES_DIR);
        tokio::fs::create_dir_all(&entries_dir)
            .await
            .map_err(|source| StoreError::io(&entries_dir, source))?;

        let index_path = generation_dir.join(INDEX_FILE);
        let disk_index: DashMap<String, String> =
            load_index(&index_path).await.into_iter().collect();

        info!(
            disk_entries = disk_index.len(),
            max_bytes = config.max_bytes,
            prefill = config.prefill,
            "opened response cache store"
        );

        let store = Self {
            inner: Arc::new(StoreInner {
                memory: Mutex::new(ByteLru::new(config.max_bytes)),
                config,
                entries_dir,
                index_path,
                disk_index,
                loads: DashMap::new(),
                load_seq: AtomicU64::new(0),
                disk_ops: DashMap::new(),
                op_seq: AtomicU64::new(0),
                pending: Mutex::new(Vec::new()),
                flush_timer: Mutex::new(None),
                flush_lock: tokio::sync::Mutex::new(()),
                index_version: AtomicU64::new(0),
                flushed_version: AtomicU64::new(0),
            }),
        };

        if store.inner.config.prefill {
            let prefill = store.clone();
            tokio::spawn(async move {
                prefill.prefill().await;
            });
        }

        Ok(store)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Looks up `key`, promoting a memory hit and falling back to disk.
    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = mutex_lock(&self.inner.memory, SOURCE, "get").get(key) {
            counter!(METRIC_MEMORY_HIT).increment(1);
            return Some(entry);
        }

        let hash = hash_key(key);
        if !self.inner.disk_index.contains_key(&hash) {
            counter!(METRIC_MISS).increment(1);
            return None;
        }

        let entry = self.load_shared(key, hash, Admit::Promote).await;
        match entry {
            Some(_) => counter!(METRIC_DISK_HIT).increment(1),
            None => counter!(METRIC_MISS).increment(1),
        }
        entry
    }

    /// Stores `entry` under `key` in memory and schedules its disk write.
    ///
    /// Returns `false` when the entry alone exceeds the memory budget; such
    /// entries are never stored on either tier. Must be called from within a
    /// Tokio runtime.
    pub fn set(&self, key: &str, entry: CacheEntry) -> bool {
        let size = entry.byte_size();
        let entry = Arc::new(entry);
        let hash = hash_key(key);

        {
            let mut memory = mutex_lock(&self.inner.memory, SOURCE, "set");
            match memory.insert(key.to_string(), Arc::clone(&entry), size) {
                Insert::Rejected => {
                    counter!(METRIC_REJECTED).increment(1);
                    debug!(
                        key,
                        size,
                        max_bytes = memory.max_bytes(),
                        "entry exceeds cache budget; not stored"
                    );
                    return false;
                }
                Insert::Stored { evicted } => {
                    if !evicted.is_empty() {
                        counter!(METRIC_EVICT).increment(evicted.len() as u64);
                        debug!(key, evicted = ?evicted, "evicted entries from memory tier");
                    }
                }
            }
            self.inner.disk_index.insert(hash.clone(), key.to_string());
        }
        self.inner.index_version.fetch_add(1, Ordering::AcqRel);

        let record = codec::encode(&entry);
        let path = self.inner.entry_path(&hash);
        let inner = Arc::clone(&self.inner);
        let op_hash = hash.clone();
        let _write = self.schedule_disk_op(hash, move |seq| async move {
            if let Err(err) = write_atomically(&path, &record).await {
                counter!(METRIC_DISK_ERROR).increment(1);
                warn!(path = %path.display(), error = %err, "failed to write cache entry");
                if inner.is_latest_op(&op_hash, seq) {
                    inner.disk_index.remove(&op_hash);
                    inner.index_version.fetch_add(1, Ordering::AcqRel);
                }
            }
        });
        self.schedule_index_flush();
        true
    }

    /// Removes `key` from both tiers. Once the returned future resolves, the
    /// entry file is gone as well.
    pub async fn delete(&self, key: &str) {
        let hash = hash_key(key);
        {
            let mut memory = mutex_lock(&self.inner.memory, SOURCE, "delete");
            memory.remove(key);
            self.inner.disk_index.remove(&hash);
        }
        self.inner.index_version.fetch_add(1, Ordering::AcqRel);

        let path = self.inner.entry_path(&hash);
        let op = self.schedule_disk_op(hash, move |_| async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    counter!(METRIC_DISK_ERROR).increment(1);
                    warn!(path = %path.display(), error = %err, "failed to remove cache entry");
                }
            }
        });
        self.schedule_index_flush();
        op.await;
    }

    /// Deletes every key known to either tier.
    #[instrument(skip(self))]
    pub async fn clear(&self) {
        let mut keys = mutex_lock(&self.inner.memory, SOURCE, "clear").keys_mru();
        keys.extend(self.inner.disk_index.iter().map(|item| item.value().clone()));
        keys.sort();
        keys.dedup();

        let count = keys.len();
        join_all(keys.iter().map(|key| self.delete(key))).await;
        info!(count, "cleared response cache");
    }

    pub fn contains(&self, key: &str) -> bool {
        mutex_lock(&self.inner.memory, SOURCE, "contains").contains(key)
            || self.inner.disk_index.contains_key(&hash_key(key))
    }

    /// Whether `key` currently has a memory-tier copy.
    pub fn in_memory(&self, key: &str) -> bool {
        mutex_lock(&self.inner.memory, SOURCE, "in_memory").contains(key)
    }

    pub fn stats(&self) -> StoreStats {
        let memory = mutex_lock(&self.inner.memory, SOURCE, "stats");
        StoreStats {
            memory_entries: memory.len(),
            memory_bytes: memory.total_bytes(),
            max_bytes: memory.max_bytes(),
            disk_entries: self.inner.disk_index.len(),
        }
    }

    /// Keys known to the disk tier, sorted.
    pub fn disk_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .disk_index
            .iter()
            .map(|item| item.value().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Waits for all outstanding disk writes and deletes, then writes the
    /// index immediately.
    #[instrument(skip(self))]
    pub async fn save(&self) {
        loop {
            let handles = std::mem::take(&mut *mutex_lock(&self.inner.pending, SOURCE, "save"));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    warn!(error = %err, "cache disk task did not complete");
                }
            }
        }

        if let Some(timer) = mutex_lock(&self.inner.flush_timer, SOURCE, "save.timer").take() {
            timer.abort();
        }
        if let Err(err) = self.inner.flush_index().await {
            warn!(error = %err, "failed to flush cache index");
        }
    }

    /// Loads disk-resident entries into the memory tier in small concurrent
    /// batches until the budget is reached. Returns how many were loaded.
    pub async fn prefill(&self) -> usize {
        let candidates: Vec<(String, String)> = self
            .inner
            .disk_index
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();
        let batch = self.inner.config.prefill_concurrency_non_zero().get();
        let before = self.stats().memory_entries;

        for chunk in candidates.chunks(batch) {
            {
                let memory = mutex_lock(&self.inner.memory, SOURCE, "prefill");
                if memory.total_bytes() >= memory.max_bytes() {
                    break;
                }
            }

            let loads: Vec<_> = chunk
                .iter()
                .filter(|(_, key)| !self.in_memory(key))
                .map(|(hash, key)| self.load_shared(key, hash.clone(), Admit::IfRoom))
                .collect();
            join_all(loads).await;
        }

        let loaded = self.stats().memory_entries.saturating_sub(before);
        info!(loaded, candidates = candidates.len(), "prefilled memory tier");
        loaded
    }

    /// Joins the in-flight load for `key` or starts one. A promoting caller
    /// that joins a pre-fill load upgrades its admission.
    fn load_shared(&self, key: &str, hash: String, admit: Admit) -> LoadFuture {
        match self.inner.loads.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                if admit == Admit::Promote {
                    existing.get().promote.store(true, Ordering::Release);
                }
                existing.get().load.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.inner.load_seq.fetch_add(1, Ordering::AcqRel);
                let promote = Arc::new(AtomicBool::new(admit == Admit::Promote));
                let task = tokio::spawn(load_from_disk(
                    Arc::clone(&self.inner),
                    key.to_string(),
                    hash,
                    id,
                    Arc::clone(&promote),
                ));
                let load = async move { task.await.ok().flatten() }.boxed().shared();
                slot.insert(LoadSlot {
                    id,
                    promote,
                    load: load.clone(),
                });
                load
            }
        }
    }

    /// Runs `op` after every earlier disk operation on the same hash.
    fn schedule_disk_op<F, Fut>(&self, hash: String, op: F) -> DiskOp
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let seq = self.inner.op_seq.fetch_add(1, Ordering::AcqRel);
        let work = op(seq);
        let inner = Arc::clone(&self.inner);

        let shared = match self.inner.disk_ops.entry(hash.clone()) {
            Entry::Occupied(mut slot) => {
                let previous = slot.get().1.clone();
                let shared = chained(inner, hash, seq, Some(previous), work);
                drop(slot.insert((seq, shared.clone())));
                shared
            }
            Entry::Vacant(slot) => {
                let shared = chained(inner, hash, seq, None, work);
                slot.insert((seq, shared.clone()));
                shared
            }
        };

        self.track(tokio::spawn(shared.clone()));
        shared
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut pending = mutex_lock(&self.inner.pending, SOURCE, "track");
        pending.retain(|handle| !handle.is_finished());
        pending.push(handle);
    }

    /// Restarts the single debounce timer for index flushes.
    fn schedule_index_flush(&self) {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let delay = self.inner.config.index_flush_debounce();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                if let Err(err) = inner.flush_index().await {
                    warn!(error = %err, "failed to flush cache index");
                }
            }
        });

        if let Some(previous) =
            mutex_lock(&self.inner.flush_timer, SOURCE, "schedule_index_flush").replace(timer)
        {
            previous.abort();
        }
    }
}

fn chained<Fut>(
    inner: Arc<StoreInner>,
    hash: String,
    seq: u64,
    previous: Option<DiskOp>,
    work: Fut,
) -> DiskOp
where
    Fut: Future<Output = ()> + Send + 'static,
{
    async move {
        if let Some(previous) = previous {
            previous.await;
        }
        work.await;
        inner
            .disk_ops
            .remove_if(&hash, |_, (latest, _)| *latest == seq);
    }
    .boxed()
    .shared()
}

async fn load_from_disk(
    inner: Arc<StoreInner>,
    key: String,
    hash: String,
    id: u64,
    promote: Arc<AtomicBool>,
) -> Option<Arc<CacheEntry>> {
    let _slot = LoadGuard {
        inner: Arc::clone(&inner),
        key: key.clone(),
        id,
    };
    let pending = inner
        .disk_ops
        .get(&hash)
        .map(|slot| slot.value().1.clone());
    if let Some(pending) = pending {
        pending.await;
    }

    let path = inner.entry_path(&hash);
    let decoded = match tokio::fs::read(&path).await {
        Ok(raw) => codec::decode(&raw).map_err(StoreError::from),
        Err(source) => Err(StoreError::io(&path, source)),
    };

    let entry = match decoded {
        Ok(entry) => Some(Arc::new(entry)),
        Err(err) => {
            debug!(key = %key, error = %err, "disk entry unusable; dropping index reference");
            if matches!(err, StoreError::Codec(_)) {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), error = %err, "failed to remove corrupt cache entry");
                }
            }
            if !inner.disk_ops.contains_key(&hash) && inner.disk_index.remove(&hash).is_some() {
                inner.index_version.fetch_add(1, Ordering::AcqRel);
            }
            None
        }
    };

    let mut memory = mutex_lock(&inner.memory, SOURCE, "load");
    // Leave the registry before reading the admission: any `get` that joined
    // has raised it by now, and later ones start a load of their own.
    inner.loads.remove_if(&key, |_, slot| slot.id == id);
    if let Some(entry) = entry.as_ref() {
        let still_indexed = inner.disk_index.contains_key(&hash);
        if still_indexed && !memory.contains(&key) {
            let size = entry.byte_size();
            let fits = memory.total_bytes() + size <= memory.max_bytes();
            if promote.load(Ordering::Acquire) || fits {
                if let Insert::Stored { evicted } =
                    memory.insert(key.clone(), Arc::clone(entry), size)
                {
                    if !evicted.is_empty() {
                        counter!(METRIC_EVICT).increment(evicted.len() as u64);
                    }
                }
            }
        }
    }

    drop(memory);
    entry
}

impl StoreInner {
    fn entry_path(&self, hash: &str) -> PathBuf {
        self.entries_dir
            .join(hash)
            .with_extension(ENTRY_EXTENSION)
    }

    fn is_latest_op(&self, hash: &str, seq: u64) -> bool {
        self.disk_ops
            .get(hash)
            .is_none_or(|slot| slot.value().0 == seq)
    }

    fn index_snapshot(&self) -> BTreeMap<String, String> {
        self.disk_index
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect()
    }

    async fn flush_index(&self) -> Result<(), StoreError> {
        let _guard = self.flush_lock.lock().await;
        let version = self.index_version.load(Ordering::Acquire);
        let json = serde_json::to_vec(&self.index_snapshot()).map_err(StoreError::Serialize)?;
        write_atomically(&self.index_path, &json)
            .await
            .map_err(|source| StoreError::io(&self.index_path, source))?;
        self.flushed_version.fetch_max(version, Ordering::AcqRel);
        debug!(path = %self.index_path.display(), "flushed cache index");
        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let timer = match self.flush_timer.get_mut() {
            Ok(timer) => timer.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        if self.index_version.load(Ordering::Acquire) <= self.flushed_version.load(Ordering::Acquire)
        {
            return;
        }
        let result = serde_json::to_vec(&self.index_snapshot())
            .map_err(StoreError::Serialize)
            .and_then(|json| {
                let tmp = self.index_path.with_extension("tmp");
                std::fs::write(&tmp, json)
                    .and_then(|()| std::fs::rename(&tmp, &self.index_path))
                    .map_err(|source| StoreError::io(&self.index_path, source))
            });
        if let Err(err) = result {
            warn!(error = %err, "final cache index flush failed");
        }
    }
}

/// Reads a persisted index, dropping entries whose hash does not match
/// their key. Missing or unparseable files yield an empty index.
async fn load_index(path: &Path) -> HashMap<String, String> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return HashMap::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cache index unreadable; starting empty");
            return HashMap::new();
        }
    };

    match serde_json::from_slice::<HashMap<String, String>>(&raw) {
        Ok(index) => index
            .into_iter()
            .filter(|(hash, key)| *hash == hash_key(key))
            .collect(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cache index corrupt; starting empty");
            HashMap::new()
        }
    }
}

async fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}
