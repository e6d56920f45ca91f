//! Memory cache of decoded images.

use std::sync::atomic::{AtomicU64, Ordering};

use moka::sync::Cache;

use crate::decoder::Image;
use crate::request::RequestKey;

/// Bounded key to decoded-image store.
///
/// Implementations are internally thread-safe; the coordinator adds no
/// locking of its own around these calls.
pub trait MemoryCache: Send + Sync {
    fn get(&self, key: &RequestKey) -> Option<Image>;
    fn set(&self, key: RequestKey, image: Image);
    fn remove(&self, key: &RequestKey);
    fn remove_all(&self);
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub size_bytes: u64,
    pub num_images: u64,
}

/// Cost-weighted image cache using moka (TinyLFU eviction).
pub struct MokaMemoryCache {
    images: Cache<RequestKey, Image>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MokaMemoryCache {
    /// Create a cache bounded to `max_size_bytes` of decoded pixels.
    pub fn new(max_size_bytes: u64) -> Self {
        let images = Cache::builder()
            .weigher(|_key: &RequestKey, image: &Image| -> u32 {
                image.cost().try_into().unwrap_or(u32::MAX)
            })
            .max_capacity(max_size_bytes)
            .build();

        Self {
            images,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Check if an image is cached.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.images.contains_key(key)
    }

    /// Get cache statistics.
    ///
    /// Runs pending moka maintenance first so sizes reflect recent writes.
    pub fn stats(&self) -> CacheStats {
        self.images.run_pending_tasks();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            size_bytes: self.images.weighted_size(),
            num_images: self.images.entry_count(),
        }
    }

    /// Reset hit/miss counters to zero.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl MemoryCache for MokaMemoryCache {
    fn get(&self, key: &RequestKey) -> Option<Image> {
        let image = self.images.get(key);
        if image.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        image
    }

    fn set(&self, key: RequestKey, image: Image) {
        self.images.insert(key, image);
    }

    fn remove(&self, key: &RequestKey) {
        self.images.invalidate(key);
    }

    fn remove_all(&self) {
        self.images.invalidate_all();
        // Don't reset stats - keep for debugging
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ImageSize;
    use url::Url;

    fn key(path: &str, size: Option<ImageSize>) -> RequestKey {
        RequestKey::new(Url::parse(&format!("https://x/{path}")).unwrap(), size)
    }

    fn make_image(size: usize) -> Image {
        Image::new(vec![0u8; size], 1, 1)
    }

    #[test]
    fn test_cache_set_and_get() {
        let cache = MokaMemoryCache::new(10 * 1024 * 1024);
        let k = key("a.jpg", Some(ImageSize::new(10, 10)));

        cache.set(k.clone(), make_image(1000));

        let retrieved = cache.get(&k);
        assert_eq!(retrieved.unwrap().cost(), 1000);
    }

    #[test]
    fn test_sizes_are_distinct_entries() {
        let cache = MokaMemoryCache::new(10 * 1024 * 1024);
        cache.set(key("a.jpg", Some(ImageSize::new(10, 10))), make_image(10));

        assert!(cache.get(&key("a.jpg", Some(ImageSize::new(20, 20)))).is_none());
        assert!(cache.get(&key("a.jpg", None)).is_none());
    }

    #[test]
    fn test_cache_hit_miss_stats() {
        let cache = MokaMemoryCache::new(1024 * 1024);
        let k = key("a.jpg", None);
        cache.set(k.clone(), make_image(100));

        cache.get(&k);
        cache.get(&k);
        cache.get(&key("missing.jpg", None));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 2.0 / 3.0).abs() < 1e-9);

        cache.reset_stats();
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_remove_and_remove_all() {
        let cache = MokaMemoryCache::new(1024 * 1024);
        cache.set(key("a.jpg", None), make_image(100));
        cache.set(key("b.jpg", None), make_image(100));

        cache.remove(&key("a.jpg", None));
        assert!(cache.get(&key("a.jpg", None)).is_none());
        assert!(cache.contains(&key("b.jpg", None)));

        cache.remove_all();
        assert!(cache.get(&key("b.jpg", None)).is_none());
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = MokaMemoryCache::new(500);
        for i in 0..10 {
            cache.set(key(&format!("{i}.jpg"), None), make_image(200));
        }
        let stats = cache.stats();
        assert!(stats.size_bytes <= 500, "size {}", stats.size_bytes);
    }
}
