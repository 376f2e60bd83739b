//! Content-addressed, TTL-based cache of provider results.
//!
//! The key is a SHA-256 hash over a canonical JSON rendering of the request:
//! messages in call order, options in declaration order, unset options
//! serialized explicitly as null. Identical requests therefore always
//! collide, regardless of how the caller constructed the inputs.
//!
//! Expiry is lazy: an entry past its TTL is removed on the access that finds
//! it, and insertion at capacity evicts the single globally-oldest entry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use ballast_types::{GenerateOptions, GenerateResult, Message};

/// Estimated savings rate used by [`CacheStats::cost_saved`], in USD per
/// 1K tokens. Deliberately a flat constant rather than the cost tracker's
/// per-model pricing: stats are an approximation, and the original system
/// keeps the two disconnected.
const SAVINGS_PER_1K_TOKENS: f64 = 0.001;

/// Cache sizing and expiry configuration.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// One cached provider result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub result: GenerateResult,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hits: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups that hit, `0.0` when no lookups were made.
    pub hit_rate: f64,
    /// Σ `result.tokens_used * hits` across live entries.
    pub tokens_saved: u64,
    /// `tokens_saved / 1000 * $0.001` - a flat estimate, not per-model pricing.
    pub cost_saved: f64,
}

/// Serialized cache state for persistence; storage medium is the caller's
/// choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheExport {
    pub entries: Vec<CacheEntry>,
    pub stats: ExportedStats,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExportedStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Content-addressed response cache.
///
/// State lives behind a `Mutex` never held across an `await`; one cache can
/// be shared via `Arc`.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResponseCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Look up a cached result for this exact request.
    ///
    /// Counts a hit or miss; an expired entry is purged and reported as a
    /// miss.
    #[must_use]
    pub fn get(&self, messages: &[Message], options: &GenerateOptions) -> Option<GenerateResult> {
        let key = cache_key(messages, options);
        let now = Utc::now();
        let mut state = self.state.lock().expect("cache lock poisoned");

        if state.entries.get(&key).is_some_and(|e| e.is_expired(now)) {
            tracing::debug!(key = %key, "Cache entry expired");
            state.entries.remove(&key);
        }

        let hit = state.entries.get_mut(&key).map(|entry| {
            entry.hits += 1;
            entry.result.clone()
        });
        match hit {
            Some(result) => {
                state.hits += 1;
                Some(result)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Whether a live entry exists for this request. Does not touch hit/miss
    /// counters, but still purges an expired entry it finds.
    #[must_use]
    pub fn has(&self, messages: &[Message], options: &GenerateOptions) -> bool {
        let key = cache_key(messages, options);
        let now = Utc::now();
        let mut state = self.state.lock().expect("cache lock poisoned");

        if state.entries.get(&key).is_some_and(|e| e.is_expired(now)) {
            state.entries.remove(&key);
        }
        state.entries.contains_key(&key)
    }

    /// Store a result for this request.
    ///
    /// Inserting a brand-new key at capacity evicts the globally-oldest
    /// entry (by creation time, across all keys). Re-setting an existing key
    /// replaces the entry in place and resets its hit count.
    pub fn set(&self, messages: &[Message], options: &GenerateOptions, result: GenerateResult) {
        let key = cache_key(messages, options);
        let now = Utc::now();
        let mut state = self.state.lock().expect("cache lock poisoned");

        if !state.entries.contains_key(&key) && state.entries.len() >= self.config.max_entries {
            evict_oldest(&mut state.entries);
        }

        let expires_at = now
            + chrono::Duration::from_std(self.config.ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000_000_000));
        state.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                result,
                created_at: now,
                expires_at,
                hits: 0,
            },
        );
    }

    /// Remove entries matching `predicate`. Returns how many were removed.
    pub fn invalidate(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let mut state = self.state.lock().expect("cache lock poisoned");
        let before = state.entries.len();
        state.entries.retain(|_, entry| !predicate(entry));
        before - state.entries.len()
    }

    /// Remove entries created more than `age` ago.
    pub fn invalidate_older_than(&self, age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        self.invalidate(|entry| entry.created_at < cutoff)
    }

    /// Drop all entries and reset counters.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("cache lock poisoned");
        *state = CacheState::default();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("cache lock poisoned");
        let lookups = state.hits + state.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            state.hits as f64 / lookups as f64 * 100.0
        };
        let tokens_saved: u64 = state
            .entries
            .values()
            .map(|entry| entry.result.tokens_used.unwrap_or(0) * entry.hits)
            .sum();
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            tokens_saved,
            cost_saved: tokens_saved as f64 / 1000.0 * SAVINGS_PER_1K_TOKENS,
        }
    }

    /// Snapshot entries and counters for persistence.
    #[must_use]
    pub fn export(&self) -> CacheExport {
        let state = self.state.lock().expect("cache lock poisoned");
        CacheExport {
            entries: state.entries.values().cloned().collect(),
            stats: ExportedStats {
                hits: state.hits,
                misses: state.misses,
            },
        }
    }

    /// Replace cache contents from a previous [`export`](Self::export).
    ///
    /// Already-expired entries are skipped; surplus beyond `max_entries` is
    /// dropped oldest-first.
    pub fn import(&self, export: CacheExport) {
        let now = Utc::now();
        let mut entries: Vec<CacheEntry> = export
            .entries
            .into_iter()
            .filter(|entry| !entry.is_expired(now))
            .collect();
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.created_at));
        entries.truncate(self.config.max_entries);

        let mut state = self.state.lock().expect("cache lock poisoned");
        state.entries = entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        state.hits = export.stats.hits;
        state.misses = export.stats.misses;
    }
}

fn evict_oldest(entries: &mut HashMap<String, CacheEntry>) {
    let oldest = entries
        .values()
        .min_by_key(|entry| entry.created_at)
        .map(|entry| entry.key.clone());
    if let Some(key) = oldest {
        tracing::debug!(key = %key, "Evicting oldest cache entry");
        entries.remove(&key);
    }
}

/// Canonical key material. Struct field order fixes the serialized field
/// order; options serialize all four fields (null when unset) so shape never
/// varies with which options the caller happened to set.
#[derive(Serialize)]
struct KeyMaterial<'a> {
    messages: Vec<KeyMessage<'a>>,
    options: KeyOptions,
}

#[derive(Serialize)]
struct KeyMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct KeyOptions {
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    top_k: Option<u32>,
}

/// Stable SHA-256 key for a request.
#[must_use]
pub fn cache_key(messages: &[Message], options: &GenerateOptions) -> String {
    let material = KeyMaterial {
        messages: messages
            .iter()
            .map(|m| KeyMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect(),
        options: KeyOptions {
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
        },
    };
    // Serialization of these shapes cannot fail; fall back to an empty body
    // rather than panicking if it somehow does.
    let canonical = serde_json::to_string(&material).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CacheConfig, ResponseCache, cache_key};
    use ballast_types::{GenerateOptions, GenerateResult, Message};

    fn result(content: &str, tokens: u64) -> GenerateResult {
        GenerateResult {
            content: content.to_string(),
            model: "test-model".to_string(),
            tokens_used: Some(tokens),
            prompt_tokens: None,
            completion_tokens: None,
            finish_reason: None,
        }
    }

    fn msgs(content: &str) -> Vec<Message> {
        vec![Message::user(content)]
    }

    #[test]
    fn identical_requests_share_a_key() {
        let a = cache_key(&msgs("hello"), &GenerateOptions::default().with_max_tokens(100));
        let b = cache_key(&msgs("hello"), &GenerateOptions::default().with_max_tokens(100));
        assert_eq!(a, b);
    }

    #[test]
    fn key_varies_with_content_options_and_order() {
        let base = cache_key(&msgs("hello"), &GenerateOptions::default());
        assert_ne!(base, cache_key(&msgs("world"), &GenerateOptions::default()));
        assert_ne!(
            base,
            cache_key(&msgs("hello"), &GenerateOptions::default().with_temperature(0.5))
        );

        let ab = vec![Message::user("a"), Message::user("b")];
        let ba = vec![Message::user("b"), Message::user("a")];
        assert_ne!(
            cache_key(&ab, &GenerateOptions::default()),
            cache_key(&ba, &GenerateOptions::default())
        );
    }

    #[test]
    fn get_after_set_round_trips() {
        let cache = ResponseCache::default();
        let options = GenerateOptions::default();

        assert!(cache.get(&msgs("q"), &options).is_none());
        cache.set(&msgs("q"), &options, result("answer", 10));
        let hit = cache.get(&msgs("q"), &options).unwrap();
        assert_eq!(hit.content, "answer");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn expired_entry_is_purged_on_access() {
        let cache = ResponseCache::new(CacheConfig {
            ttl: Duration::ZERO,
            ..CacheConfig::default()
        });
        let options = GenerateOptions::default();

        cache.set(&msgs("q"), &options, result("answer", 10));
        assert!(cache.get(&msgs("q"), &options).is_none());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn insert_at_capacity_evicts_exactly_one_oldest() {
        let cache = ResponseCache::new(CacheConfig {
            max_entries: 3,
            ..CacheConfig::default()
        });
        let options = GenerateOptions::default();

        for i in 0..3 {
            cache.set(&msgs(&format!("q{i}")), &options, result("a", 1));
            // Distinct creation timestamps keep "oldest" unambiguous.
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(cache.stats().entries, 3);

        cache.set(&msgs("q3"), &options, result("a", 1));
        assert_eq!(cache.stats().entries, 3);

        // q0 was the globally oldest; everything else survives.
        assert!(!cache.has(&msgs("q0"), &options));
        for q in ["q1", "q2", "q3"] {
            assert!(cache.has(&msgs(q), &options), "{q} should survive");
        }
    }

    #[test]
    fn resetting_existing_key_does_not_evict() {
        let cache = ResponseCache::new(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        });
        let options = GenerateOptions::default();

        cache.set(&msgs("a"), &options, result("1", 1));
        cache.set(&msgs("b"), &options, result("2", 1));
        cache.set(&msgs("a"), &options, result("3", 1));

        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.get(&msgs("a"), &options).unwrap().content, "3");
        assert!(cache.has(&msgs("b"), &options));
    }

    #[test]
    fn tokens_saved_scales_with_hits() {
        let cache = ResponseCache::default();
        let options = GenerateOptions::default();

        cache.set(&msgs("q"), &options, result("a", 500));
        let _ = cache.get(&msgs("q"), &options);
        let _ = cache.get(&msgs("q"), &options);

        let stats = cache.stats();
        assert_eq!(stats.tokens_saved, 1000);
        assert!((stats.cost_saved - 0.001).abs() < 1e-12);
    }

    #[test]
    fn invalidate_by_predicate() {
        let cache = ResponseCache::default();
        let options = GenerateOptions::default();

        cache.set(&msgs("keep"), &options, result("a", 1));
        cache.set(&msgs("drop"), &options, result("b", 1));

        let removed = cache.invalidate(|entry| entry.result.content == "b");
        assert_eq!(removed, 1);
        assert!(cache.has(&msgs("keep"), &options));
        assert!(!cache.has(&msgs("drop"), &options));
    }

    #[test]
    fn export_import_round_trips() {
        let cache = ResponseCache::default();
        let options = GenerateOptions::default();

        cache.set(&msgs("q"), &options, result("answer", 10));
        let _ = cache.get(&msgs("q"), &options);
        let _ = cache.get(&msgs("missing"), &options);

        let export = cache.export();
        let restored = ResponseCache::default();
        restored.import(export);

        assert_eq!(restored.get(&msgs("q"), &options).unwrap().content, "answer");
        let stats = restored.stats();
        // Restored counters plus the verification hit above.
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn clear_resets_everything() {
        let cache = ResponseCache::default();
        let options = GenerateOptions::default();

        cache.set(&msgs("q"), &options, result("a", 1));
        let _ = cache.get(&msgs("q"), &options);
        cache.clear();

        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }
}
