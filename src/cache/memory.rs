//! In-memory cache backend.
//!
//! A mutex-guarded map with LRU eviction at capacity and a background
//! sweeper that removes expired entries in small batches so the lock is
//! never held for long. The sweeper starts with the backend and stops when
//! it is closed (or dropped).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::backend::{Backend, Entry, Stats};
use crate::error::{ConfigError, Status};

/// Configuration for [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Capacity; inserting beyond it evicts the least recently accessed
    /// entry. 0 means unbounded.
    pub max_entries: usize,
    /// How often the sweeper scans for expired entries.
    pub sweep_interval: Duration,
    /// Maximum deletions per lock acquisition during a sweep.
    pub sweep_batch: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            sweep_interval: Duration::from_secs(60),
            sweep_batch: 64,
        }
    }
}

impl MemoryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::invalid("sweep_interval", "must be positive"));
        }
        if self.sweep_batch == 0 {
            return Err(ConfigError::invalid("sweep_batch", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, Entry>,
    stats: Stats,
}

/// The in-memory [`Backend`].
#[derive(Debug)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
    max_entries: usize,
    stop: watch::Sender<bool>,
}

impl MemoryBackend {
    /// Creates the backend and starts its sweeper task.
    pub fn new(config: MemoryConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let store = Arc::new(Mutex::new(Store {
            entries: HashMap::new(),
            stats: Stats {
                max_size: config.max_entries,
                ..Stats::default()
            },
        }));
        let (stop, stopped) = watch::channel(false);

        tokio::spawn(sweep_loop(
            Arc::clone(&store),
            config.sweep_interval,
            config.sweep_batch,
            stopped,
        ));

        Ok(Self {
            store,
            max_entries: config.max_entries,
            stop,
        })
    }

    /// Creates a backend with default configuration.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(MemoryConfig::default())
    }

    /// Stops the sweeper. Dropping the backend does the same.
    pub fn close(&self) {
        let _ = self.stop.send(true);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Removes the least recently accessed entry. Linear scan; capacity
    /// bounds keep it cheap.
    fn evict_lru(store: &mut Store) {
        let victim = store
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.accessed_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            store.entries.remove(&key);
            store.stats.evictions += 1;
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Status> {
        let mut store = self.lock();
        let now = Instant::now();

        let value = match store.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.accessed_at = now;
                Some(entry.value.clone())
            }
            // Expired entries stay put for the sweeper; the lookup is
            // still a miss.
            _ => None,
        };

        if value.is_some() {
            store.stats.hits += 1;
        } else {
            store.stats.misses += 1;
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), Status> {
        let mut store = self.lock();
        let now = Instant::now();

        if self.max_entries > 0
            && store.entries.len() >= self.max_entries
            && !store.entries.contains_key(key)
        {
            Self::evict_lru(&mut store);
        }

        store.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                expires_at: ttl.map(|ttl| now + ttl),
                accessed_at: now,
            },
        );
        store.stats.sets += 1;
        store.stats.size = store.entries.len();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Status> {
        let mut store = self.lock();
        if store.entries.remove(key).is_some() {
            store.stats.deletes += 1;
            store.stats.size = store.entries.len();
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), Status> {
        let mut store = self.lock();
        store.entries.clear();
        store.stats.size = 0;
        Ok(())
    }

    fn stats(&self) -> Stats {
        let store = self.lock();
        Stats {
            size: store.entries.len(),
            ..store.stats
        }
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// Background expiry sweep. Each pass deletes expired keys in batches,
/// releasing the lock between batches.
async fn sweep_loop(
    store: Arc<Mutex<Store>>,
    interval: Duration,
    batch: usize,
    mut stopped: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = sweep_once(&store, batch);
                if removed > 0 {
                    debug!(removed, "cache sweep removed expired entries");
                }
            }
            changed = stopped.changed() => {
                if changed.is_err() || *stopped.borrow() {
                    return;
                }
            }
        }
    }
}

fn sweep_once(store: &Arc<Mutex<Store>>, batch: usize) -> u64 {
    let mut removed = 0u64;
    loop {
        let mut guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let expired: Vec<String> = guard
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .take(batch)
            .map(|(key, _)| key.clone())
            .collect();

        if expired.is_empty() {
            guard.stats.size = guard.entries.len();
            return removed;
        }
        for key in &expired {
            guard.entries.remove(key);
        }
        guard.stats.evictions += expired.len() as u64;
        guard.stats.size = guard.entries.len();
        removed += expired.len() as u64;

        if expired.len() < batch {
            return removed;
        }
        // Release the lock before the next batch.
        drop(guard);
    }
}
