//! Intent memoization cache
//!
//! Caches translated intents keyed by a hash of the normalized utterance
//! and the verbatim context. A hit skips the oracle entirely, so every hit
//! is worth roughly one full translation (~1,200 tokens). Entries expire
//! after a TTL and the least recently used entry is evicted at capacity.
//! The cache persists to `<state_root>/cache/intent_cache.json`;
//! a corrupt file means starting fresh, never crashing.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::intent::Intent;

/// Estimated tokens saved per cache hit (translation input + output)
const TOKENS_PER_HIT: u64 = 1_200;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedIntent {
    intent: Intent,
    user_input: String,
    context_hash: String,
    created_at: f64,
    hit_count: u64,
    last_hit: Option<f64>,
}

impl CachedIntent {
    fn is_expired(&self, ttl_seconds: u64, now: f64) -> bool {
        now - self.created_at > ttl_seconds as f64
    }

    fn last_access(&self) -> f64 {
        self.last_hit.unwrap_or(self.created_at)
    }
}

/// Cache statistics, persisted alongside entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub tokens_saved: u64,
}

impl IntentCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    cache: HashMap<String, CachedIntent>,
    stats: IntentCacheStats,
}

/// TTL'd, LRU-evicting, persistent memoization of translations
pub struct IntentCache {
    entries: LruCache<String, CachedIntent>,
    stats: IntentCacheStats,
    ttl_seconds: u64,
    cache_path: PathBuf,
}

impl IntentCache {
    pub fn new(state_root: &std::path::Path, ttl_seconds: u64, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is nonzero");
        let cache_path = state_root.join("cache").join("intent_cache.json");

        let mut cache = Self {
            entries: LruCache::new(capacity),
            stats: IntentCacheStats::default(),
            ttl_seconds,
            cache_path,
        };
        cache.load();
        cache
    }

    /// Look up a cached translation. Expired entries are removed on sight.
    pub fn get(&mut self, user_input: &str, context: &str) -> Option<Intent> {
        let key = compute_key(user_input, context);
        let now = epoch_seconds();

        let expired = match self.entries.peek(&key) {
            None => {
                self.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(self.ttl_seconds, now),
        };

        if expired {
            self.entries.pop(&key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            self.save();
            return None;
        }

        let entry = self.entries.get_mut(&key).expect("peeked entry present");
        entry.hit_count += 1;
        entry.last_hit = Some(now);
        let intent = entry.intent.clone();

        self.stats.hits += 1;
        self.stats.tokens_saved += TOKENS_PER_HIT;
        self.save();

        debug!(hits = self.stats.hits, "intent cache hit");
        Some(intent)
    }

    /// Cache a fresh translation, evicting the LRU entry at capacity.
    pub fn set(&mut self, user_input: &str, context: &str, intent: Intent) {
        let key = compute_key(user_input, context);

        let entry = CachedIntent {
            intent,
            user_input: truncate(user_input, 200),
            context_hash: short_hash(context),
            created_at: epoch_seconds(),
            hit_count: 0,
            last_hit: None,
        };

        let at_capacity = self.entries.len() == usize::from(self.entries.cap());
        if at_capacity && !self.entries.contains(&key) {
            self.stats.evictions += 1;
        }
        self.entries.push(key, entry);
        self.save();
    }

    pub fn invalidate(&mut self, user_input: &str, context: &str) -> bool {
        let key = compute_key(user_input, context);
        let existed = self.entries.pop(&key).is_some();
        if existed {
            self.save();
        }
        existed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.stats = IntentCacheStats::default();
        self.save();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &IntentCacheStats {
        &self.stats
    }

    /// Estimated dollars saved by hits, at ~$3 per million tokens
    pub fn estimated_cost_saved(&self) -> f64 {
        (self.stats.tokens_saved as f64 / 1_000_000.0) * 3.0
    }

    fn load(&mut self) {
        let Ok(data) = std::fs::read_to_string(&self.cache_path) else {
            return;
        };
        let Ok(persisted) = serde_json::from_str::<PersistedCache>(&data) else {
            // Corrupt store: start fresh rather than crash.
            debug!(path = %self.cache_path.display(), "intent cache corrupt, starting fresh");
            return;
        };

        let now = epoch_seconds();
        let mut live: Vec<(String, CachedIntent)> = persisted
            .cache
            .into_iter()
            .filter(|(_, e)| !e.is_expired(self.ttl_seconds, now))
            .collect();

        // Rebuild recency order: oldest access first so the LRU order
        // survives the round trip.
        live.sort_by(|a, b| {
            a.1.last_access()
                .partial_cmp(&b.1.last_access())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (key, entry) in live {
            self.entries.push(key, entry);
        }

        self.stats = persisted.stats;
    }

    /// Best-effort flush; a write failure only costs warm-start state.
    fn save(&self) {
        let persisted = PersistedCache {
            cache: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            stats: self.stats.clone(),
        };

        if let Some(parent) = self.cache_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(&persisted) {
            let _ = std::fs::write(&self.cache_path, json);
        }
    }
}

fn compute_key(user_input: &str, context: &str) -> String {
    let normalized = user_input.trim().to_lowercase();
    let combined = format!("{}|{}", normalized, context);
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn short_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
