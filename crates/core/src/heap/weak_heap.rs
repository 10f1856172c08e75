//! Capacity-bounded, key-addressed arena for transient frame buffers.
//!
//! Buffers are stored as `Arc<[u8]>` so a reader keeps its bytes alive even if
//! the entry is evicted or overwritten while it is being processed. Eviction is
//! strict LRU on last access (write or read).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeapError {
    #[error("buffer {key} of {size} bytes exceeds heap capacity of {capacity} bytes")]
    TooLarge {
        key: String,
        size: usize,
        capacity: usize,
    },
    #[error("buffer {0} is no longer in the heap")]
    Missing(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: usize,
    pub used: usize,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub soft_failures: u64,
}

struct HeapEntry {
    data: Arc<[u8]>,
    last_access: u64,
}

#[derive(Default)]
struct HeapInner {
    entries: HashMap<String, HeapEntry>,
    used: usize,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    soft_failures: u64,
}

impl HeapInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_lru(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone());
        match victim {
            Some(key) => {
                if let Some(entry) = self.entries.remove(&key) {
                    self.used -= entry.data.len();
                    self.evictions += 1;
                    log::debug!("Weak heap evicted {key} ({} bytes)", entry.data.len());
                }
                true
            }
            None => false,
        }
    }
}

/// Shared frame arena. One instance per pipeline, passed down as `Arc<WeakHeap>`.
pub struct WeakHeap {
    capacity: usize,
    inner: Mutex<HeapInner>,
}

impl WeakHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HeapInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores `bytes` under `key`, evicting least-recently-used entries as needed.
    ///
    /// A buffer larger than the whole heap is a soft failure: it is logged,
    /// counted and rejected, and the caller is expected to drop the frame.
    pub fn write(&self, key: &str, bytes: Vec<u8>) -> Result<(), HeapError> {
        let size = bytes.len();
        let mut inner = self.lock();
        if size > self.capacity {
            inner.soft_failures += 1;
            log::warn!(
                "Weak heap cannot hold {key}: {size} bytes exceeds capacity {}",
                self.capacity
            );
            return Err(HeapError::TooLarge {
                key: key.to_string(),
                size,
                capacity: self.capacity,
            });
        }

        if let Some(old) = inner.entries.remove(key) {
            inner.used -= old.data.len();
        }
        while inner.used + size > self.capacity {
            if !inner.evict_lru() {
                break;
            }
        }

        let last_access = inner.tick();
        inner.used += size;
        inner.entries.insert(
            key.to_string(),
            HeapEntry {
                data: Arc::from(bytes),
                last_access,
            },
        );
        Ok(())
    }

    /// Returns the buffer for `key`, or `None` if it was never written or has
    /// been reclaimed. A miss means "skip this frame", never a fatal error.
    pub fn read(&self, key: &str) -> Option<Arc<[u8]>> {
        let mut inner = self.lock();
        let now = inner.tick();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = now;
                let data = entry.data.clone();
                inner.hits += 1;
                Some(data)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.lock();
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.used -= entry.data.len();
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.used = 0;
    }

    pub fn stats(&self) -> HeapStats {
        let inner = self.lock();
        HeapStats {
            capacity: self.capacity,
            used: inner.used,
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            soft_failures: inner.soft_failures,
        }
    }

    // A panic while holding the lock leaves the bookkeeping consistent
    // (every mutation is a single step), so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HeapInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
