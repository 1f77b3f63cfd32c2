//! Bounded cache of decoded synthesis audio, keyed by the exact spoken text.

use crate::audio::AudioBuffer;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::debug;

/// Insertion-ordered cache. A hit does not refresh an entry; once the bound is
/// exceeded the oldest insertion is evicted.
#[derive(Debug)]
pub struct SynthesisCache {
    capacity: usize,
    entries: IndexMap<String, Arc<AudioBuffer>>,
}

impl SynthesisCache {
    /// `capacity` is clamped to at least one entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: IndexMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, text: &str) -> Option<Arc<AudioBuffer>> {
        self.entries.get(text).cloned()
    }

    pub fn insert(&mut self, text: String, audio: Arc<AudioBuffer>) {
        // Re-inserting keeps the original slot, like any other hit.
        self.entries.insert(text, audio);
        while self.entries.len() > self.capacity {
            if let Some((evicted, _)) = self.entries.shift_remove_index(0) {
                debug!("Synthesis cache evicted {:?}", evicted);
            }
        }
    }

    pub fn contains(&self, text: &str) -> bool {
        self.entries.contains_key(text)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio() -> Arc<AudioBuffer> {
        Arc::new(AudioBuffer::new(vec![0.0; 16], 16000, 1))
    }

    #[test]
    fn fifty_first_entry_evicts_the_first() {
        let mut cache = SynthesisCache::new(50);
        for i in 0..50 {
            cache.insert(format!("line {}", i), audio());
        }
        assert_eq!(cache.len(), 50);

        cache.insert("line 50".to_string(), audio());
        assert_eq!(cache.len(), 50);
        assert!(!cache.contains("line 0"));
        assert!(cache.contains("line 1"));
        assert!(cache.contains("line 50"));
    }

    #[test]
    fn hits_do_not_refresh_position() {
        let mut cache = SynthesisCache::new(2);
        cache.insert("a".into(), audio());
        cache.insert("b".into(), audio());
        assert!(cache.get("a").is_some());

        cache.insert("c".into(), audio());
        assert!(!cache.contains("a"));
        assert!(cache.contains("b") && cache.contains("c"));
    }

    #[test]
    fn zero_capacity_holds_one() {
        let mut cache = SynthesisCache::new(0);
        cache.insert("a".into(), audio());
        cache.insert("b".into(), audio());
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("b"));
    }
}
