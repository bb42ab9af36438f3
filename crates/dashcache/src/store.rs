//! In-process cache store
//!
//! Key/entry table shared by every dataset of the application. Values are
//! type-erased so one store (and one eviction budget) serves datasets of
//! different entity types; reads downcast back to the caller's type.
//!
//! Entries follow `Absent -> Loading -> Fresh -> Stale -> Loading -> ...`,
//! leaving the table on eviction, removal or clear.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{Result, SyncError};
use crate::key::CacheKey;
use crate::stats::CacheStats;

type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Slot in the table
struct Slot {
    value: Option<ErasedValue>,
    timestamp: Instant,
    /// Insertion order, breaks timestamp ties during eviction
    seq: u64,
    loading: bool,
    /// Identifies the fetch that owns a loading slot
    load_id: u64,
    stale: bool,
    /// Stale flag at the start of the current load, restored if it fails
    stale_before_load: bool,
    ttl: Option<Duration>,
}

struct Table {
    slots: HashMap<CacheKey, Slot, RandomState>,
    next_seq: u64,
}

impl Table {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Typed snapshot of a cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Cached value; `None` only while a first-ever fetch is loading
    pub data: Option<V>,
    /// When the value was stored
    pub timestamp: Instant,
    /// A fetch for this key is in flight
    pub is_loading: bool,
    /// Invalidated since it was stored
    pub is_stale: bool,
    /// Per-entry TTL overriding the store tiers
    pub ttl: Option<Duration>,
}

impl<V> CacheEntry<V> {
    /// Time since the value was stored
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }

    /// Holds data and no fetch is in flight
    pub fn is_ready(&self) -> bool {
        !self.is_loading && self.data.is_some()
    }
}

/// Lifecycle state of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Not in the store
    Absent,
    /// Fetch in flight (possibly with placeholder data)
    Loading,
    /// Within TTL and not invalidated
    Fresh,
    /// Expired or invalidated; next access refetches
    Stale,
}

/// Key/entry table with two-tier TTL and oldest-first eviction
pub struct CacheStore {
    table: RwLock<Table>,
    config: StoreConfig,
    stats: Arc<CacheStats>,
    /// Keys that left the store since the last drain, if tracked
    removed: Option<Mutex<Vec<CacheKey>>>,
}

impl CacheStore {
    /// Create an empty store
    pub fn new(config: StoreConfig) -> Self {
        Self {
            table: RwLock::new(Table {
                slots: HashMap::with_hasher(RandomState::new()),
                next_seq: 0,
            }),
            config,
            stats: Arc::new(CacheStats::new()),
            removed: None,
        }
    }

    /// Record keys dropped by eviction or a failed first load
    ///
    /// Lets an owner holding per-key side tables (such as a tag index) drop
    /// its references with [`CacheStore::drain_removed`].
    pub fn with_removal_log(mut self) -> Self {
        self.removed = Some(Mutex::new(Vec::new()));
        self
    }

    /// Keys dropped since the last call; always empty without a removal log
    pub fn drain_removed(&self) -> Vec<CacheKey> {
        match &self.removed {
            Some(log) => std::mem::take(&mut *log.lock()),
            None => Vec::new(),
        }
    }

    fn log_removed(&self, key: CacheKey) {
        if let Some(log) = &self.removed {
            log.lock().push(key);
        }
    }

    /// Read the entry for `key`
    ///
    /// # Returns
    /// * `Ok(None)` - Key is absent
    /// * `Err(TypeMismatch)` - Key holds a value of another type
    pub fn get<V>(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>>
    where
        V: Clone + 'static,
    {
        let table = self.table.read();
        let Some(slot) = table.slots.get(key) else {
            return Ok(None);
        };

        let data = match &slot.value {
            Some(value) => Some(downcast::<V>(key, value)?.clone()),
            None => None,
        };

        Ok(Some(CacheEntry {
            data,
            timestamp: slot.timestamp,
            is_loading: slot.loading,
            is_stale: slot.stale,
            ttl: slot.ttl,
        }))
    }

    /// Store `data` under `key` as a fresh, settled entry
    pub fn set<V>(&self, key: CacheKey, data: V)
    where
        V: Send + Sync + 'static,
    {
        self.set_with_ttl(key, data, None);
    }

    /// Store `data` with a TTL that overrides both store tiers
    pub fn set_with_ttl<V>(&self, key: CacheKey, data: V, ttl: Option<Duration>)
    where
        V: Send + Sync + 'static,
    {
        let mut table = self.table.write();
        let seq = table.bump();
        table.slots.insert(
            key,
            Slot {
                value: Some(Arc::new(data)),
                timestamp: Instant::now(),
                seq,
                loading: false,
                load_id: 0,
                stale: false,
                stale_before_load: false,
                ttl,
            },
        );
        self.stats.record_insert();
        self.evict_locked(&mut table);
    }

    /// Whether `entry` must be refetched
    ///
    /// Critical datasets use the longer tier; a per-entry TTL wins over both.
    pub fn is_expired<V>(&self, entry: &CacheEntry<V>, critical: bool) -> bool {
        if entry.is_stale {
            return true;
        }
        let ttl = entry.ttl.unwrap_or_else(|| self.ttl_for(critical));
        entry.timestamp.elapsed() > ttl
    }

    /// TTL tier for a dataset
    pub fn ttl_for(&self, critical: bool) -> Duration {
        if critical {
            self.config.ttl_critical
        } else {
            self.config.ttl_normal
        }
    }

    /// Current lifecycle state of `key`
    pub fn state(&self, key: &CacheKey, critical: bool) -> EntryState {
        let table = self.table.read();
        match table.slots.get(key) {
            None => EntryState::Absent,
            Some(slot) if slot.loading => EntryState::Loading,
            Some(slot) if slot.value.is_none() => EntryState::Absent,
            Some(slot) => {
                let ttl = slot.ttl.unwrap_or_else(|| self.ttl_for(critical));
                if slot.stale || slot.timestamp.elapsed() > ttl {
                    EntryState::Stale
                } else {
                    EntryState::Fresh
                }
            }
        }
    }

    /// Evict oldest entries once the store is over capacity
    ///
    /// # Returns
    /// * `usize` - Number of entries removed
    pub fn evict(&self) -> usize {
        let mut table = self.table.write();
        self.evict_locked(&mut table)
    }

    fn evict_locked(&self, table: &mut Table) -> usize {
        let len = table.slots.len();
        if len <= self.config.max_entries {
            return 0;
        }

        let target = self
            .config
            .max_entries
            .saturating_sub(self.config.eviction_margin);

        // Loading slots belong to an in-flight fetch and are never evicted
        let mut candidates: Vec<(Instant, u64, CacheKey)> = table
            .slots
            .iter()
            .filter(|(_, slot)| !slot.loading)
            .map(|(key, slot)| (slot.timestamp, slot.seq, key.clone()))
            .collect();
        candidates.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let excess = len - target;
        let mut evicted = 0;
        for (_, _, key) in candidates.into_iter().take(excess) {
            table.slots.remove(&key);
            self.log_removed(key);
            evicted += 1;
        }

        self.stats.record_evictions(evicted as u64);
        debug!(evicted, remaining = table.slots.len(), "cache eviction");
        evicted
    }

    /// Modify the cached value in place, keeping its timestamp
    ///
    /// # Returns
    /// * `Ok(None)` - Nothing cached for `key`
    /// * `Ok(Some(r))` - Result of `f`
    pub fn update<V, R, F>(&self, key: &CacheKey, f: F) -> Result<Option<R>>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(&mut V) -> R,
    {
        let mut table = self.table.write();
        let Some(slot) = table.slots.get_mut(key) else {
            return Ok(None);
        };
        let Some(value) = &slot.value else {
            return Ok(None);
        };

        let mut data = downcast::<V>(key, value)?.clone();
        let result = f(&mut data);
        slot.value = Some(Arc::new(data));
        Ok(Some(result))
    }

    /// Remove `key`
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.table.write().slots.remove(key).is_some()
    }

    /// Mark `key` stale so its next access refetches
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        match self.table.write().slots.get_mut(key) {
            Some(slot) => {
                slot.stale = true;
                true
            }
            None => false,
        }
    }

    /// Drop every entry (logout / teardown)
    pub fn clear(&self) {
        self.table.write().slots.clear();
        self.stats.reset();
    }

    /// Whether `key` has a slot, loading or settled
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.table.read().slots.contains_key(key)
    }

    /// Number of entries, loading ones included
    pub fn len(&self) -> usize {
        self.table.read().slots.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.table.read().slots.is_empty()
    }

    /// Snapshot of the stored keys
    pub fn keys(&self) -> Vec<CacheKey> {
        self.table.read().slots.keys().cloned().collect()
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Store configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Put `key` into the loading state, keeping any previous value
    ///
    /// Returns the load ticket that must be presented to settle it.
    pub(crate) fn begin_load(&self, key: &CacheKey) -> u64 {
        let mut table = self.table.write();
        let load_id = table.bump();
        match table.slots.get_mut(key) {
            Some(slot) => {
                slot.loading = true;
                slot.stale_before_load = slot.stale;
                slot.stale = false;
                slot.load_id = load_id;
            }
            None => {
                table.slots.insert(
                    key.clone(),
                    Slot {
                        value: None,
                        timestamp: Instant::now(),
                        seq: load_id,
                        loading: true,
                        load_id,
                        stale: false,
                        stale_before_load: false,
                        ttl: None,
                    },
                );
            }
        }
        load_id
    }

    /// Settle a load with the produced value
    ///
    /// The value is dropped if the slot was removed or replaced while the
    /// fetch ran. A slot invalidated mid-flight is stored stale.
    pub(crate) fn finish_load<V>(
        &self,
        key: &CacheKey,
        load_id: u64,
        data: V,
        ttl: Option<Duration>,
    ) -> bool
    where
        V: Send + Sync + 'static,
    {
        let mut table = self.table.write();
        let seq = table.bump();
        let Some(slot) = table.slots.get_mut(key) else {
            return false;
        };
        if !slot.loading || slot.load_id != load_id {
            return false;
        }

        slot.value = Some(Arc::new(data));
        slot.timestamp = Instant::now();
        slot.seq = seq;
        slot.loading = false;
        slot.ttl = ttl;
        self.stats.record_insert();
        self.evict_locked(&mut table);
        true
    }

    /// Roll a failed or abandoned load back to its previous state
    pub(crate) fn fail_load(&self, key: &CacheKey, load_id: u64) {
        let mut table = self.table.write();
        let has_previous = match table.slots.get_mut(key) {
            Some(slot) if slot.loading && slot.load_id == load_id => {
                slot.loading = false;
                slot.stale |= slot.stale_before_load;
                slot.value.is_some()
            }
            _ => return,
        };
        if !has_previous {
            table.slots.remove(key);
            self.log_removed(key.clone());
        }
    }
}

fn downcast<'a, V: 'static>(key: &CacheKey, value: &'a ErasedValue) -> Result<&'a V> {
    value.downcast_ref::<V>().ok_or_else(|| SyncError::TypeMismatch {
        key: key.to_string(),
    })
}
