//! In-memory resolution cache with TTL expiry and LRU eviction.
//!
//! Expiry is checked on every read, so an entry is never returned at or past
//! its `expires_at` even before it is physically removed.
//! Optional JSON snapshots let a short-lived process keep its cache warm.

use super::normalize::AddressNormalizer;
use super::types::{NormalizedKey, ResolutionEntry};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

struct Slot {
    entry: ResolutionEntry,
    last_used: AtomicU64,
}

/// Hit/miss counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded normalized-key -> resolution map.
pub struct ResolutionCache {
    capacity: usize,
    slots: RwLock<HashMap<NormalizedKey, Slot>>,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResolutionCache {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: RwLock::new(HashMap::with_capacity(capacity.min(1024))),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Default per-user snapshot location (~/.cache/geocode-engine/cache.json).
    pub fn default_snapshot_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("geocode-engine")
            .join("cache.json")
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a live entry. Returns None if missing or expired.
    pub fn get(&self, key: &NormalizedKey, now: DateTime<Utc>) -> Option<ResolutionEntry> {
        let hit = self.lookup(key, now);
        let counter = if hit.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    /// Like `get`, but leaves the hit/miss counters alone. Used for re-checks
    /// by a caller that already counted its miss.
    pub(crate) fn get_uncounted(&self, key: &NormalizedKey, now: DateTime<Utc>) -> Option<ResolutionEntry> {
        self.lookup(key, now)
    }

    fn lookup(&self, key: &NormalizedKey, now: DateTime<Utc>) -> Option<ResolutionEntry> {
        let slots = self.slots.read();
        let slot = slots.get(key).filter(|slot| !slot.entry.is_expired(now))?;
        slot.last_used.store(self.next_tick(), Ordering::Relaxed);
        Some(slot.entry.clone())
    }

    /// Insert or replace the entry for `entry.key`.
    pub fn put(&self, entry: ResolutionEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut slots = self.slots.write();
        if !slots.contains_key(&entry.key) && slots.len() >= self.capacity {
            let now = entry.resolved_at;
            let before = slots.len();
            slots.retain(|_, slot| !slot.entry.is_expired(now));
            self.evictions
                .fetch_add((before - slots.len()) as u64, Ordering::Relaxed);

            while slots.len() >= self.capacity {
                let lru = slots
                    .iter()
                    .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                    .map(|(key, _)| key.clone());
                match lru {
                    Some(key) => {
                        slots.remove(&key);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }
        let key = entry.key.clone();
        slots.insert(
            key,
            Slot {
                entry,
                last_used: AtomicU64::new(self.next_tick()),
            },
        );
    }

    /// Physically drop expired entries. Returns how many were removed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| !slot.entry.is_expired(now));
        let removed = before - slots.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn invalidate(&self, key: &NormalizedKey) -> bool {
        self.slots.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.slots.write().clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Write live entries to `path` as JSON, least recently used first.
    pub fn save_snapshot(&self, path: &Path, now: DateTime<Utc>) -> io::Result<usize> {
        let entries: Vec<ResolutionEntry> = {
            let slots = self.slots.read();
            let mut live: Vec<(&Slot, u64)> = slots
                .values()
                .filter(|slot| !slot.entry.is_expired(now))
                .map(|slot| (slot, slot.last_used.load(Ordering::Relaxed)))
                .collect();
            live.sort_by_key(|(_, used)| *used);
            live.into_iter().map(|(slot, _)| slot.entry.clone()).collect()
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&entries)?;
        fs::write(path, json)?;
        Ok(entries.len())
    }

    /// Load a snapshot written by `save_snapshot`, returning how many entries
    /// are held afterwards. Expired entries, invalid coordinates and keys that
    /// `normalizer` would not produce are skipped. A missing file loads nothing.
    pub fn load_snapshot(&self, path: &Path, now: DateTime<Utc>, normalizer: &AddressNormalizer) -> io::Result<usize> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let entries: Vec<ResolutionEntry> = serde_json::from_str(&data)?;

        let mut keys = HashSet::with_capacity(entries.len());
        for entry in entries {
            if entry.is_expired(now) || !entry.coordinate.is_valid() {
                continue;
            }
            if !normalizer.is_canonical(&entry.key) {
                tracing::warn!(key = %entry.key, "skipping non-canonical snapshot key");
                continue;
            }
            keys.insert(entry.key.clone());
            self.put(entry);
        }

        let slots = self.slots.read();
        Ok(keys.iter().filter(|key| slots.contains_key(*key)).count())
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }
}
