//! Shared progress counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache-line aligned atomic counter to prevent false sharing
/// Each counter is on its own 64-byte cache line
#[repr(align(64))]
#[derive(Debug)]
pub struct CacheAlignedAtomic(pub AtomicU64);

impl CacheAlignedAtomic {
    pub const fn new(val: u64) -> Self {
        Self(AtomicU64::new(val))
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Delivery counters, updated by every destination stream
#[derive(Debug)]
pub struct QueueStats {
    pub delivered: CacheAlignedAtomic,
    pub failed: CacheAlignedAtomic,
    pub retried: CacheAlignedAtomic,
}

impl QueueStats {
    pub fn new() -> Self {
        Self {
            delivered: CacheAlignedAtomic::new(0),
            failed: CacheAlignedAtomic::new(0),
            retried: CacheAlignedAtomic::new(0),
        }
    }

    pub fn snapshot(&self) -> QueueSummary {
        QueueSummary {
            delivered: self.delivered.get(),
            failed: self.failed.get(),
            retried: self.retried.get(),
        }
    }
}

impl Default for QueueStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of `QueueStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Counters for a one-shot build, updated from rayon workers
#[derive(Debug)]
pub struct BuildStats {
    pub files_written: CacheAlignedAtomic,
    pub bytes_written: CacheAlignedAtomic,
    pub errors: CacheAlignedAtomic,
}

impl BuildStats {
    pub fn new() -> Self {
        Self {
            files_written: CacheAlignedAtomic::new(0),
            bytes_written: CacheAlignedAtomic::new(0),
            errors: CacheAlignedAtomic::new(0),
        }
    }
}

impl Default for BuildStats {
    fn default() -> Self {
        Self::new()
    }
}
