//! Pre-synthesized audio template cache (C5)
//!
//! Clips are keyed by (phrase id, language, voice) and capped by a
//! strict byte budget with LRU eviction on insert. The cache is never
//! authoritative: a miss means a fresh synthesis.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dastak_core::Language;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClipKey {
    pub phrase_id: String,
    pub language: Language,
    pub voice: String,
}

struct Clip {
    audio: Bytes,
    last_used: u64,
}

struct Inner {
    clips: HashMap<ClipKey, Clip>,
    bytes: usize,
    tick: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub budget_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct TemplateCache {
    inner: Mutex<Inner>,
    budget: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TemplateCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                clips: HashMap::new(),
                bytes: 0,
                tick: 0,
            }),
            budget: budget_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &ClipKey) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.clips.get_mut(key) {
            Some(clip) => {
                clip.last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(clip.audio.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a clip, evicting least-recently-used entries while over
    /// budget. A clip larger than the whole budget is not cached.
    pub fn insert(&self, key: ClipKey, audio: Bytes) {
        if audio.len() > self.budget {
            return;
        }
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(old) = inner.clips.remove(&key) {
            inner.bytes -= old.audio.len();
        }
        inner.bytes += audio.len();
        inner.clips.insert(key, Clip { audio, last_used: tick });

        while inner.bytes > self.budget {
            let Some(victim) = inner
                .clips
                .iter()
                .min_by_key(|(_, clip)| clip.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(clip) = inner.clips.remove(&victim) {
                inner.bytes -= clip.audio.len();
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.clips.len(),
            bytes: inner.bytes,
            budget_bytes: self.budget,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> ClipKey {
        ClipKey {
            phrase_id: id.to_string(),
            language: Language::Hindi,
            voice: "standard-female".to_string(),
        }
    }

    #[test]
    fn hit_after_insert_miss_before() {
        let cache = TemplateCache::new(1024);
        assert!(cache.get(&key("greeting")).is_none());
        cache.insert(key("greeting"), Bytes::from_static(b"audio"));
        assert_eq!(cache.get(&key("greeting")).unwrap(), Bytes::from_static(b"audio"));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn evicts_least_recently_used_over_budget() {
        let cache = TemplateCache::new(300);
        cache.insert(key("a"), Bytes::from(vec![0u8; 100]));
        cache.insert(key("b"), Bytes::from(vec![0u8; 100]));
        cache.insert(key("c"), Bytes::from(vec![0u8; 100]));
        // Touch a so b becomes the LRU.
        cache.get(&key("a"));
        cache.insert(key("d"), Bytes::from(vec![0u8; 100]));

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none(), "LRU entry should be evicted");
        assert!(cache.get(&key("c")).is_some());
        assert!(cache.get(&key("d")).is_some());
        assert!(cache.stats().bytes <= 300);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn oversized_clip_is_not_cached() {
        let cache = TemplateCache::new(64);
        cache.insert(key("huge"), Bytes::from(vec![0u8; 128]));
        assert!(cache.get(&key("huge")).is_none());
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn reinsert_replaces_without_double_counting() {
        let cache = TemplateCache::new(1024);
        cache.insert(key("x"), Bytes::from(vec![0u8; 100]));
        cache.insert(key("x"), Bytes::from(vec![0u8; 50]));
        assert_eq!(cache.stats().bytes, 50);
        assert_eq!(cache.stats().entries, 1);
    }
}
