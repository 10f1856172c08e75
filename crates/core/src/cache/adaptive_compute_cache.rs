use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::TempDir;
use thiserror::Error;

use crate::cache::fingerprint::Fingerprint;
use crate::cache::mapped_store::MappedBlob;
use crate::shared::constants::{
    DEFAULT_CACHE_BUDGET, DEFAULT_CACHE_CEILING, DEFAULT_MAPPED_THRESHOLD,
};
use crate::shared::face::FaceRect;
use crate::shared::frame::Frame;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to create cache spill directory: {0}")]
    SpillDir(#[source] std::io::Error),
    #[error("failed to spill cache entry {fingerprint}: {source}")]
    Spill {
        fingerprint: Fingerprint,
        #[source]
        source: std::io::Error,
    },
}

/// A value the cache can store as bytes.
pub trait CacheValue: Sized {
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Option<Self>;
}

impl CacheValue for Vec<u8> {
    fn to_bytes(&self) -> Vec<u8> {
        self.clone()
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(bytes.to_vec())
    }
}

const FRAME_HEADER_LEN: usize = 17;

impl CacheValue for Frame {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.byte_len());
        out.extend_from_slice(&self.width().to_le_bytes());
        out.extend_from_slice(&self.height().to_le_bytes());
        out.push(self.channels());
        out.extend_from_slice(&(self.index() as u64).to_le_bytes());
        out.extend_from_slice(self.data());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..FRAME_HEADER_LEN)?;
        let width = u32::from_le_bytes(header[0..4].try_into().ok()?);
        let height = u32::from_le_bytes(header[4..8].try_into().ok()?);
        let channels = header[8];
        let index = u64::from_le_bytes(header[9..17].try_into().ok()?) as usize;
        let data = &bytes[FRAME_HEADER_LEN..];
        if data.len() != Frame::expected_len(width, height, channels) {
            return None;
        }
        Some(Frame::new(data.to_vec(), width, height, channels, index))
    }
}

impl CacheValue for Vec<FaceRect> {
    fn to_bytes(&self) -> Vec<u8> {
        self.iter()
            .flat_map(|r| [r.x, r.y, r.width, r.height])
            .flat_map(f32::to_le_bytes)
            .collect()
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 16 != 0 {
            return None;
        }
        let floats: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(
            floats
                .chunks_exact(4)
                .map(|f| FaceRect::new(f[0], f[1], f[2], f[3]))
                .collect(),
        )
    }
}

/// Pairs are stored as `len(a) | a | b`.
impl<A: CacheValue, B: CacheValue> CacheValue for (A, B) {
    fn to_bytes(&self) -> Vec<u8> {
        let a = self.0.to_bytes();
        let b = self.1.to_bytes();
        let mut out = Vec::with_capacity(8 + a.len() + b.len());
        out.extend_from_slice(&(a.len() as u64).to_le_bytes());
        out.extend_from_slice(&a);
        out.extend_from_slice(&b);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let len = u64::from_le_bytes(bytes.get(..8)?.try_into().ok()?) as usize;
        let rest = &bytes[8..];
        let a = A::from_bytes(rest.get(..len)?)?;
        let b = B::from_bytes(&rest[len..])?;
        Some((a, b))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Byte budget; the sum of entry sizes never exceeds it.
    pub max_bytes: usize,
    /// Hard upper bound for budget resizes.
    pub ceiling: usize,
    /// Entries of at least this many bytes go to the mapped tier.
    pub mapped_threshold: usize,
    /// Where mapped entries live. A private temp dir when `None`.
    pub spill_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_CACHE_BUDGET,
            ceiling: DEFAULT_CACHE_CEILING,
            mapped_threshold: DEFAULT_MAPPED_THRESHOLD,
            spill_dir: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub mapped_entries: usize,
    pub current_bytes: usize,
    pub mapped_bytes: usize,
    pub max_bytes: usize,
    pub ceiling: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Clone)]
enum Stored {
    Memory(Arc<[u8]>),
    Mapped(Arc<MappedBlob>),
}

impl Stored {
    fn bytes(&self) -> &[u8] {
        match self {
            Stored::Memory(bytes) => bytes,
            Stored::Mapped(blob) => blob.bytes(),
        }
    }

    fn is_mapped(&self) -> bool {
        matches!(self, Stored::Mapped(_))
    }
}

struct Entry {
    stored: Stored,
    size: usize,
    last_access: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Fingerprint, Entry>,
    tick: u64,
    current_bytes: usize,
    mapped_bytes: usize,
    max_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn detach(&mut self, fingerprint: &Fingerprint) -> Option<(Fingerprint, Entry)> {
        let entry = self.entries.remove(fingerprint)?;
        self.current_bytes -= entry.size;
        if entry.stored.is_mapped() {
            self.mapped_bytes -= entry.size;
        }
        Some((*fingerprint, entry))
    }

    /// Evicts least recently accessed entries until `incoming` more bytes fit.
    fn evict_for(&mut self, incoming: usize, evicted: &mut Vec<(Fingerprint, Entry)>) {
        while self.current_bytes + incoming > self.max_bytes {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(fp, _)| *fp)
            else {
                break;
            };
            if let Some(pair) = self.detach(&oldest) {
                self.evictions += 1;
                evicted.push(pair);
            }
        }
    }
}

/// Byte-budgeted memo of expensive per-frame transforms, keyed by fingerprint.
///
/// Small entries stay in process memory; entries at or above the mapped
/// threshold are written to a private file and read through a memory map.
/// Eviction is strict LRU by last access. The lock covers bookkeeping only:
/// serialization, spilling, deserialization and the computation itself all run
/// outside it.
pub struct AdaptiveComputeCache {
    inner: Mutex<Inner>,
    ceiling: usize,
    mapped_threshold: usize,
    spill_dir: PathBuf,
    _owned_spill_dir: Option<TempDir>,
}

impl AdaptiveComputeCache {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let (spill_dir, owned) = match config.spill_dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir).map_err(CacheError::SpillDir)?;
                (dir, None)
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("facelive-cache-")
                    .tempdir()
                    .map_err(CacheError::SpillDir)?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };
        let ceiling = config.ceiling.max(config.max_bytes);
        Ok(Self {
            inner: Mutex::new(Inner {
                max_bytes: config.max_bytes,
                ..Inner::default()
            }),
            ceiling,
            mapped_threshold: config.mapped_threshold,
            spill_dir,
            _owned_spill_dir: owned,
        })
    }

    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }

    pub fn get<V: CacheValue>(&self, fingerprint: &Fingerprint) -> Option<V> {
        let stored = {
            let mut inner = self.lock();
            let tick = inner.next_tick();
            match inner.entries.get_mut(fingerprint) {
                Some(entry) => {
                    entry.last_access = tick;
                    let stored = entry.stored.clone();
                    inner.hits += 1;
                    stored
                }
                None => {
                    inner.misses += 1;
                    return None;
                }
            }
        };
        let value = V::from_bytes(stored.bytes());
        if value.is_none() {
            log::warn!("Cache entry {fingerprint} does not decode as the requested type");
        }
        value
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().entries.contains_key(fingerprint)
    }

    /// Stores `value`, evicting LRU entries to make room.
    ///
    /// Returns `Ok(false)` when the value alone exceeds the budget and was not
    /// stored.
    pub fn put<V: CacheValue>(&self, fingerprint: Fingerprint, value: &V) -> Result<bool, CacheError> {
        let bytes = value.to_bytes();
        let size = bytes.len();
        if size > self.lock().max_bytes {
            log::debug!("Cache entry {fingerprint} ({size} bytes) exceeds budget; not stored");
            return Ok(false);
        }

        let stored = if size > 0 && size >= self.mapped_threshold {
            let blob = MappedBlob::write(&self.spill_dir, &bytes)
                .map_err(|source| CacheError::Spill { fingerprint, source })?;
            Stored::Mapped(Arc::new(blob))
        } else {
            Stored::Memory(bytes.into())
        };

        let mut evicted = Vec::new();
        let stored_ok = {
            let mut inner = self.lock();
            if let Some(previous) = inner.detach(&fingerprint) {
                evicted.push(previous);
            }
            if size > inner.max_bytes {
                // Budget shrank while spilling.
                false
            } else {
                inner.evict_for(size, &mut evicted);
                let tick = inner.next_tick();
                inner.current_bytes += size;
                if stored.is_mapped() {
                    inner.mapped_bytes += size;
                }
                inner.entries.insert(
                    fingerprint,
                    Entry {
                        stored,
                        size,
                        last_access: tick,
                    },
                );
                true
            }
        };
        release(evicted);
        Ok(stored_ok)
    }

    /// Returns the cached value for `fingerprint`, or computes, stores and
    /// returns it. A failed store is logged; the computed value is still returned.
    pub fn get_or_compute<V, E>(
        &self,
        fingerprint: Fingerprint,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E>
    where
        V: CacheValue,
    {
        if let Some(value) = self.get(&fingerprint) {
            return Ok(value);
        }
        let value = compute()?;
        if let Err(e) = self.put(fingerprint, &value) {
            log::warn!("{e}");
        }
        Ok(value)
    }

    pub fn max_bytes(&self) -> usize {
        self.lock().max_bytes
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Sets the byte budget, clamped to the hard ceiling, evicting as needed.
    /// Returns the budget actually applied.
    pub fn set_max_bytes(&self, max_bytes: usize) -> usize {
        let applied = max_bytes.min(self.ceiling);
        let mut evicted = Vec::new();
        {
            let mut inner = self.lock();
            inner.max_bytes = applied;
            inner.evict_for(0, &mut evicted);
        }
        release(evicted);
        applied
    }

    pub fn clear(&self) {
        let drained: Vec<(Fingerprint, Entry)> = {
            let mut inner = self.lock();
            inner.current_bytes = 0;
            inner.mapped_bytes = 0;
            inner.entries.drain().collect()
        };
        drop(drained);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            mapped_entries: inner.entries.values().filter(|e| e.stored.is_mapped()).count(),
            current_bytes: inner.current_bytes,
            mapped_bytes: inner.mapped_bytes,
            max_bytes: inner.max_bytes,
            ceiling: self.ceiling,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drops evicted entries outside the lock; mapped ones unmap and delete their file here.
fn release(evicted: Vec<(Fingerprint, Entry)>) {
    for (fingerprint, entry) in evicted {
        if entry.stored.is_mapped() {
            log::debug!(
                "Releasing mapped cache entry {fingerprint} ({} bytes)",
                entry.size
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const KB: usize = 1024;

    fn cache(max_bytes: usize, mapped_threshold: usize) -> AdaptiveComputeCache {
        AdaptiveComputeCache::new(CacheConfig {
            max_bytes,
            ceiling: max_bytes * 4,
            mapped_threshold,
            spill_dir: None,
        })
        .unwrap()
    }

    fn fp(n: u128) -> Fingerprint {
        Fingerprint(n)
    }

    #[test]
    fn test_miss_on_empty_cache() {
        let cache = cache(KB, KB);
        assert_eq!(cache.get::<Vec<u8>>(&fp(1)), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_put_then_get_returns_value() {
        let cache = cache(KB, KB);
        assert!(cache.put(fp(1), &vec![1u8, 2, 3]).unwrap());
        assert_eq!(cache.get::<Vec<u8>>(&fp(1)), Some(vec![1, 2, 3]));
        assert_eq!(cache.stats().hits, 1);
    }

    #[rstest]
    #[case::in_process(usize::MAX, 0)]
    #[case::mapped(KB, 1)]
    fn test_repeated_get_returns_identical_bytes(
        #[case] mapped_threshold: usize,
        #[case] mapped_entries: usize,
    ) {
        let cache = cache(100 * KB, mapped_threshold);
        let value: Vec<u8> = (0..8 * KB).map(|i| (i * 31 % 251) as u8).collect();
        cache.put(fp(7), &value).unwrap();
        assert_eq!(cache.stats().mapped_entries, mapped_entries);

        let first = cache.get::<Vec<u8>>(&fp(7)).unwrap();
        let second = cache.get::<Vec<u8>>(&fp(7)).unwrap();

        assert_eq!(first, value);
        assert_eq!(second, first);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
    }

    #[rstest]
    #[case::in_process(usize::MAX)]
    #[case::mapped(10 * KB)]
    fn test_lru_eviction_keeps_most_recent(#[case] mapped_threshold: usize) {
        let cache = cache(100 * KB, mapped_threshold);
        cache.put(fp(0xA), &vec![0xAu8; 40 * KB]).unwrap();
        cache.put(fp(0xB), &vec![0xBu8; 40 * KB]).unwrap();
        cache.put(fp(0xC), &vec![0xCu8; 40 * KB]).unwrap();

        assert!(!cache.contains(&fp(0xA)));
        assert!(cache.contains(&fp(0xB)));
        assert!(cache.contains(&fp(0xC)));
        let stats = cache.stats();
        assert!(stats.current_bytes <= 100 * KB);
        assert_eq!(stats.evictions, 1);
        assert_eq!(cache.get::<Vec<u8>>(&fp(0xC)), Some(vec![0xCu8; 40 * KB]));
    }

    #[test]
    fn test_read_refreshes_recency() {
        let cache = cache(100 * KB, usize::MAX);
        cache.put(fp(0xA), &vec![0u8; 40 * KB]).unwrap();
        cache.put(fp(0xB), &vec![0u8; 40 * KB]).unwrap();
        cache.get::<Vec<u8>>(&fp(0xA));

        cache.put(fp(0xC), &vec![0u8; 40 * KB]).unwrap();

        assert!(cache.contains(&fp(0xA)));
        assert!(!cache.contains(&fp(0xB)));
    }

    #[test]
    fn test_oversized_value_is_not_stored() {
        let cache = cache(10 * KB, usize::MAX);
        cache.put(fp(1), &vec![0u8; 4 * KB]).unwrap();

        assert!(!cache.put(fp(2), &vec![0u8; 11 * KB]).unwrap());

        assert!(cache.contains(&fp(1)));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_budget_never_exceeded_over_many_puts() {
        let cache = cache(64 * KB, 16 * KB);
        for i in 0..50u128 {
            let size = (i as usize % 7 + 1) * 5 * KB;
            cache.put(fp(i), &vec![i as u8; size]).unwrap();
            assert!(cache.stats().current_bytes <= 64 * KB);
        }
    }

    #[test]
    fn test_large_entries_go_to_mapped_tier() {
        let cache = cache(100 * KB, 10 * KB);
        cache.put(fp(1), &vec![1u8; 2 * KB]).unwrap();
        cache.put(fp(2), &vec![2u8; 20 * KB]).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.mapped_entries, 1);
        assert_eq!(stats.mapped_bytes, 20 * KB);
        assert_eq!(stats.current_bytes, 22 * KB);
    }

    #[test]
    fn test_evicting_mapped_entry_removes_its_file() {
        let cache = cache(30 * KB, 10 * KB);
        cache.put(fp(1), &vec![1u8; 20 * KB]).unwrap();
        assert_eq!(std::fs::read_dir(cache.spill_dir()).unwrap().count(), 1);

        cache.put(fp(2), &vec![2u8; 20 * KB]).unwrap();

        assert_eq!(std::fs::read_dir(cache.spill_dir()).unwrap().count(), 1);
        assert_eq!(cache.stats().mapped_bytes, 20 * KB);
    }

    #[test]
    fn test_shrinking_budget_evicts() {
        let cache = cache(100 * KB, usize::MAX);
        cache.put(fp(1), &vec![0u8; 40 * KB]).unwrap();
        cache.put(fp(2), &vec![0u8; 40 * KB]).unwrap();

        assert_eq!(cache.set_max_bytes(50 * KB), 50 * KB);

        assert!(!cache.contains(&fp(1)));
        assert!(cache.contains(&fp(2)));
    }

    #[test]
    fn test_budget_clamped_to_ceiling() {
        let cache = cache(100 * KB, usize::MAX);
        assert_eq!(cache.set_max_bytes(usize::MAX), 400 * KB);
        assert_eq!(cache.max_bytes(), 400 * KB);
    }

    #[test]
    fn test_overwrite_replaces_accounting() {
        let cache = cache(100 * KB, usize::MAX);
        cache.put(fp(1), &vec![0u8; 40 * KB]).unwrap();
        cache.put(fp(1), &vec![0u8; 10 * KB]).unwrap();
        assert_eq!(cache.stats().current_bytes, 10 * KB);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_or_compute_runs_once() {
        let cache = cache(KB, usize::MAX);
        let mut calls = 0;
        for _ in 0..3 {
            let v: Result<Vec<u8>, ()> = cache.get_or_compute(fp(7), || {
                calls += 1;
                Ok(vec![7])
            });
            assert_eq!(v.unwrap(), vec![7]);
        }
        assert_eq!(calls, 1);
        approx::assert_relative_eq!(cache.stats().hit_rate(), 2.0 / 3.0);
    }

    #[test]
    fn test_get_or_compute_error_is_not_cached() {
        let cache = cache(KB, usize::MAX);
        let v: Result<Vec<u8>, &str> = cache.get_or_compute(fp(7), || Err("boom"));
        assert_eq!(v, Err("boom"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_empties_both_tiers() {
        let cache = cache(100 * KB, 10 * KB);
        cache.put(fp(1), &vec![0u8; 2 * KB]).unwrap();
        cache.put(fp(2), &vec![0u8; 20 * KB]).unwrap();

        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.stats().current_bytes, 0);
        assert_eq!(std::fs::read_dir(cache.spill_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_frame_value_keeps_geometry() {
        let cache = cache(KB, usize::MAX);
        let frame = Frame::new((0..24).collect(), 4, 2, 3, 9);
        cache.put(fp(1), &frame).unwrap();
        assert_eq!(cache.get::<Frame>(&fp(1)), Some(frame));
    }

    #[test]
    fn test_pair_and_rect_values() {
        let cache = cache(KB, usize::MAX);
        let rects = vec![FaceRect::new(1.0, 2.0, 3.0, 4.0)];
        let value = (rects.clone(), vec![5u8, 6]);
        cache.put(fp(1), &value).unwrap();
        assert_eq!(cache.get::<(Vec<FaceRect>, Vec<u8>)>(&fp(1)), Some(value));
    }

    #[test]
    fn test_wrong_type_decodes_as_miss() {
        let cache = cache(KB, usize::MAX);
        cache.put(fp(1), &vec![1u8, 2, 3]).unwrap();
        assert_eq!(cache.get::<Frame>(&fp(1)), None);
    }
}
