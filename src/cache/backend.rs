//! The storage contract behind the response cache.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Status;

/// Exact operation counters plus a derived hit rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing (or an expired entry).
    pub misses: u64,
    /// Stores performed.
    pub sets: u64,
    /// Explicit deletions.
    pub deletes: u64,
    /// Entries removed by capacity pressure or the expiry sweeper.
    pub evictions: u64,
    /// Entries currently held.
    pub size: usize,
    /// Configured capacity (0 means unbounded).
    pub max_size: usize,
}

impl Stats {
    /// Fraction of lookups that hit, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A stored value with its lifecycle timestamps.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The cached bytes.
    pub value: Vec<u8>,
    /// When the entry was created.
    pub created_at: Instant,
    /// When the entry expires; `None` never expires.
    pub expires_at: Option<Instant>,
    /// When the entry was last read.
    pub accessed_at: Instant,
}

impl Entry {
    /// Returns `true` once the entry's TTL has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }
}

/// A pluggable cache store.
///
/// Values are handed out by value (copied bytes) so backends never alias
/// their internal storage.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Looks up `key`, returning the stored bytes on a live hit.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Status>;

    /// Stores `value` under `key`; `ttl` of `None` never expires.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), Status>;

    /// Removes `key` if present.
    async fn delete(&self, key: &str) -> Result<(), Status>;

    /// Removes every entry.
    async fn clear(&self) -> Result<(), Status>;

    /// Current counters.
    fn stats(&self) -> Stats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_is_derived() {
        let stats = Stats {
            hits: 3,
            misses: 1,
            ..Stats::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < 1e-9);
        assert_eq!(Stats::default().hit_rate(), 0.0);
    }

    #[test]
    fn entry_without_ttl_never_expires() {
        let now = Instant::now();
        let entry = Entry {
            value: vec![1],
            created_at: now,
            expires_at: None,
            accessed_at: now,
        };
        assert!(!entry.is_expired(now + Duration::from_secs(3600)));
    }

    #[test]
    fn entry_with_ttl_expires() {
        let now = Instant::now();
        let entry = Entry {
            value: vec![1],
            created_at: now,
            expires_at: Some(now + Duration::from_millis(10)),
            accessed_at: now,
        };
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + Duration::from_millis(10)));
    }
}
