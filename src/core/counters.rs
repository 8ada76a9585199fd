//! Shared position counters.
//!
//! Counters live in an mmap'd values file so external publishers and
//! subscribers can observe them. Each counter occupies its own 128-byte slot
//! to keep hot counters off each other's cache lines. The manager is
//! authoritative for slot lifetime; a [`Position`] is an arena handle that
//! keeps the mapping alive and resolves to the slot's atomic on use.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::core::mmap::MmapFile;
use crate::core::{Error, Result};

pub const COUNTER_RECORD_LENGTH: usize = 128;

pub type CounterId = i32;

struct CountersInner {
    _mmap: MmapFile,
    base: *const u8,
    max_counters: usize,
}

// SAFETY: slots are only ever accessed through &AtomicI64; the mapping is
// owned by the Arc and outlives every handle.
unsafe impl Send for CountersInner {}
unsafe impl Sync for CountersInner {}

impl CountersInner {
    fn value_atomic(&self, id: CounterId) -> &AtomicI64 {
        debug_assert!((id as usize) < self.max_counters);
        // SAFETY: each slot starts 128-byte aligned within the mapping and
        // the value word is at slot offset 0.
        unsafe { &*(self.base.add(id as usize * COUNTER_RECORD_LENGTH) as *const AtomicI64) }
    }
}

/// Allocator and registry for shared counters.
pub struct CountersManager {
    inner: Arc<CountersInner>,
    labels: Vec<Option<String>>,
    free_list: Vec<CounterId>,
}

impl CountersManager {
    pub fn create(path: &Path, max_counters: usize) -> Result<Self> {
        if max_counters == 0 {
            return Err(Error::InvalidParams("max counters must be non-zero"));
        }
        let mmap = MmapFile::create(path, max_counters * COUNTER_RECORD_LENGTH)?;
        let base = mmap.as_slice().as_ptr();
        Ok(Self {
            inner: Arc::new(CountersInner {
                _mmap: mmap,
                base,
                max_counters,
            }),
            labels: Vec::new(),
            free_list: Vec::new(),
        })
    }

    /// Allocate a counter with value zero. Freed slots are recycled before
    /// the high-water mark grows.
    pub fn allocate(&mut self, label: &str) -> Result<Position> {
        let id = match self.free_list.pop() {
            Some(id) => {
                self.labels[id as usize] = Some(label.to_owned());
                id
            }
            None => {
                if self.labels.len() >= self.inner.max_counters {
                    return Err(Error::InvalidParams("counters exhausted"));
                }
                self.labels.push(Some(label.to_owned()));
                (self.labels.len() - 1) as CounterId
            }
        };

        self.inner.value_atomic(id).store(0, Ordering::Release);
        Ok(Position {
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Return a slot to the free list. The slot value is zeroed; handles to
    /// the freed id keep resolving but observe recycled state.
    pub fn free(&mut self, id: CounterId) {
        let index = id as usize;
        if index < self.labels.len() && self.labels[index].is_some() {
            self.labels[index] = None;
            self.inner.value_atomic(id).store(0, Ordering::Release);
            self.free_list.push(id);
        }
    }

    pub fn label(&self, id: CounterId) -> Option<&str> {
        self.labels.get(id as usize).and_then(|l| l.as_deref())
    }

    /// Revalidate an id into a fresh handle.
    pub fn counter_addr(&self, id: CounterId) -> Result<Position> {
        let index = id as usize;
        if index >= self.labels.len() || self.labels[index].is_none() {
            return Err(Error::InvalidParams("counter id not allocated"));
        }
        Ok(Position {
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn get_volatile(&self, id: CounterId) -> Result<i64> {
        Ok(self.counter_addr(id)?.get_volatile())
    }

    pub fn set_ordered(&self, id: CounterId, value: i64) -> Result<()> {
        self.counter_addr(id)?.set_ordered(value);
        Ok(())
    }

    pub fn increment_ordered(&self, id: CounterId, delta: i64) -> Result<()> {
        self.counter_addr(id)?.increment_ordered(delta);
        Ok(())
    }

    pub fn max_counters(&self) -> usize {
        self.inner.max_counters
    }
}

/// Handle to one shared 64-bit counter.
#[derive(Clone)]
pub struct Position {
    id: CounterId,
    inner: Arc<CountersInner>,
}

impl Position {
    pub fn id(&self) -> CounterId {
        self.id
    }

    /// Plain load for single-writer fields owned by the conductor.
    pub fn get(&self) -> i64 {
        self.inner.value_atomic(self.id).load(Ordering::Relaxed)
    }

    /// Acquire load of a counter written by another process.
    pub fn get_volatile(&self) -> i64 {
        self.inner.value_atomic(self.id).load(Ordering::Acquire)
    }

    /// Release store visible to other processes.
    pub fn set_ordered(&self, value: i64) {
        self.inner.value_atomic(self.id).store(value, Ordering::Release);
    }

    pub fn increment_ordered(&self, delta: i64) -> i64 {
        self.inner.value_atomic(self.id).fetch_add(delta, Ordering::Release)
    }
}

impl std::fmt::Debug for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Position")
            .field("id", &self.id)
            .field("value", &self.get_volatile())
            .finish()
    }
}

/// Well-known driver counters.
pub struct SystemCounters {
    unblocked_publications: Position,
}

impl SystemCounters {
    pub fn new(manager: &mut CountersManager) -> Result<Self> {
        Ok(Self {
            unblocked_publications: manager.allocate("unblocked publications")?,
        })
    }

    pub fn unblocked_publications(&self) -> &Position {
        &self.unblocked_publications
    }
}
