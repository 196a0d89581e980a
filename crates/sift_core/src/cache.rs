//! Bounded, time-expiring result cache.
//!
//! Entries expire `ttl` after insertion and are dropped lazily on lookup.
//! When full, the earliest-inserted entry is evicted; reads do not refresh
//! recency, rewriting a key does. Time is measured with `tokio::time::Instant`
//! so tests can drive the clock.
//!
//! Every `clear()` bumps a generation counter. Writers that computed their
//! value before a clear pass the generation they started under to
//! [`ResultCache::set_if_current`], and stale writes are dropped.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::RetrievalMethod;

/// Opaque, order-independent key for a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Whitespace-collapsed, lowercased query plus method, `top_k`, and
    /// filters in key order, hashed with SHA-256.
    pub fn new(
        query: &str,
        method: RetrievalMethod,
        top_k: usize,
        filters: &BTreeMap<String, String>,
    ) -> Self {
        let normalized = query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(method.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(top_k.to_le_bytes());
        for (key, value) in filters {
            hasher.update(b"\x1e");
            hasher.update(key.as_bytes());
            hasher.update(b"\x1f");
            hasher.update(value.as_bytes());
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{:02x}", byte);
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct Entry<V> {
    value: Arc<V>,
    inserted_at: Instant,
}

struct CacheState<V> {
    entries: HashMap<CacheKey, Entry<V>>,
    /// Insertion order, oldest first.
    order: VecDeque<CacheKey>,
    generation: u64,
}

/// TTL + FIFO cache shared by concurrent readers.
pub struct ResultCache<V> {
    ttl: Duration,
    max_entries: usize,
    state: Mutex<CacheState<V>>,
}

impl<V> ResultCache<V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                generation: 0,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    // A poisoned lock degrades to a cache miss rather than failing the caller.
    fn lock(&self) -> Option<MutexGuard<'_, CacheState<V>>> {
        match self.state.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("result cache lock poisoned; treating as miss");
                None
            }
        }
    }

    /// Look up `key` using the cache's own TTL.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        self.get_with_ttl(key, self.ttl)
    }

    /// Look up `key`, treating entries older than `ttl` as absent.
    pub fn get_with_ttl(&self, key: &CacheKey, ttl: Duration) -> Option<Arc<V>> {
        let mut state = self.lock()?;
        let inserted_at = state.entries.get(key)?.inserted_at;
        if inserted_at.elapsed() < ttl {
            return state.entries.get(key).map(|e| Arc::clone(&e.value));
        }
        debug!("cache entry {} expired", key.as_str());
        state.entries.remove(key);
        state.order.retain(|k| k != key);
        None
    }

    /// Current generation; changes on every [`clear`](Self::clear).
    pub fn generation(&self) -> u64 {
        self.lock().map(|s| s.generation).unwrap_or(0)
    }

    /// Insert or overwrite `key`, evicting the oldest entries past capacity.
    pub fn set(&self, key: CacheKey, value: V) {
        self.store(key, value, None);
    }

    /// Like [`set`](Self::set), but only while the cache is still at
    /// `generation`. Returns whether the value was stored.
    pub fn set_if_current(&self, key: CacheKey, value: V, generation: u64) -> bool {
        self.store(key, value, Some(generation))
    }

    fn store(&self, key: CacheKey, value: V, expected: Option<u64>) -> bool {
        if self.max_entries == 0 {
            return false;
        }
        let Some(mut state) = self.lock() else { return false };
        if expected.is_some_and(|g| g != state.generation) {
            debug!("cache write for {} dropped: cleared since computed", key.as_str());
            return false;
        }
        if state.entries.contains_key(&key) {
            state.order.retain(|k| k != &key);
        } else {
            while state.entries.len() >= self.max_entries {
                let Some(oldest) = state.order.pop_front() else { break };
                state.entries.remove(&oldest);
                debug!("cache evicted {}", oldest.as_str());
            }
        }
        state.order.push_back(key.clone());
        state.entries.insert(
            key,
            Entry {
                value: Arc::new(value),
                inserted_at: Instant::now(),
            },
        );
        true
    }

    /// Drop every entry and start a new generation. Values already handed
    /// out stay valid.
    pub fn clear(&self) {
        if let Some(mut state) = self.lock() {
            state.entries.clear();
            state.order.clear();
            state.generation = state.generation.wrapping_add(1);
        }
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
