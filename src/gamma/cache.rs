//! Bounded time-limited cache of computed gamma ramps.
//!
//! Keys are `(monitor id, kelvin)`. Entries expire after the TTL and the
//! oldest-inserted entry is evicted when the cache is full.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::gamma::ramp::GammaRamp;

type CacheKey = (String, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct CacheEntry {
    ramp: Arc<GammaRamp>,
    inserted_at: Instant,
}

#[derive(Debug)]
pub struct CurveCache {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<CacheKey, CacheEntry>,
    order: VecDeque<CacheKey>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CurveCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, monitor: &str, kelvin: u32, now: Instant) -> Option<Arc<GammaRamp>> {
        let key = (monitor.to_string(), kelvin);
        let fresh = self
            .entries
            .get(&key)
            .map(|entry| now.saturating_duration_since(entry.inserted_at) < self.ttl);

        match fresh {
            Some(true) => {
                self.hits += 1;
                self.entries.get(&key).map(|entry| Arc::clone(&entry.ramp))
            }
            Some(false) => {
                self.remove(&key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, monitor: &str, kelvin: u32, ramp: Arc<GammaRamp>, now: Instant) {
        let key = (monitor.to_string(), kelvin);
        self.remove(&key);

        while self.entries.len() >= self.max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                self.evictions += 1;
            }
        }

        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                ramp,
                inserted_at: now,
            },
        );
    }

    /// Apply new limits, evicting immediately if the cache is now too large.
    pub fn set_limits(&mut self, ttl: Duration, max_entries: usize) {
        self.ttl = ttl;
        self.max_entries = max_entries.max(1);
        while self.entries.len() > self.max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                self.evictions += 1;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries: self.entries.len(),
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}
