use super::{CacheError, Weighted};
use foyer::{CacheBuilder, LfuConfig, LruConfig, S3FifoConfig};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

const fn default_capacity() -> usize {
    1 << 20
}

const fn default_shards() -> usize {
    16
}

fn default_eviction() -> String {
    "lru".to_string()
}

fn default_name() -> String {
    "foyer".to_string()
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct FoyerCacheConfig {
    /// Name of the cache, shows up in foyer's own tracing.
    #[serde(default = "default_name")]
    pub name: String,

    /// In-memory cache capacity. (weighted units)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Shards of the in-memory cache.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Eviction algorithm to use: lru, lfu or s3fifo.
    #[serde(default = "default_eviction")]
    pub eviction: String,
}

impl Default for FoyerCacheConfig {
    fn default() -> Self {
        FoyerCacheConfig {
            name: default_name(),
            capacity: default_capacity(),
            shards: default_shards(),
            eviction: default_eviction(),
        }
    }
}

impl FoyerCacheConfig {
    /// Build an in-memory cache.
    pub fn build_memory<K, V>(&self) -> Result<FoyerPlainCache<K, V>, CacheError>
    where
        K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
        V: Clone + Send + Sync + Weighted + 'static,
    {
        FoyerPlainCache::memory(self)
    }
}

pub struct FoyerPlainCache<K, V>
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    cache: foyer::Cache<K, V>,
}

impl<K, V> Debug for FoyerPlainCache<K, V>
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoyerPlainCache").finish()
    }
}

impl<K, V> FoyerPlainCache<K, V>
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    pub fn memory(config: &FoyerCacheConfig) -> Result<FoyerPlainCache<K, V>, CacheError> {
        if config.capacity == 0 {
            return Err(CacheError::InvalidCacheConfig(
                "capacity must be positive".to_string(),
            ));
        }
        let builder = CacheBuilder::new(config.capacity)
            .with_name(config.name.clone())
            .with_shards(config.shards.max(1))
            .with_weighter(|_: &_, v: &V| v.weight());
        let cache = match config.eviction.as_str() {
            "lru" => builder.with_eviction_config(LruConfig::default()).build(),
            "lfu" => builder.with_eviction_config(LfuConfig::default()).build(),
            "s3fifo" => builder.with_eviction_config(S3FifoConfig::default()).build(),
            other => {
                return Err(CacheError::InvalidCacheConfig(format!(
                    "unknown eviction policy {other}"
                )))
            }
        };
        tracing::debug!(
            name = %config.name,
            capacity = config.capacity,
            eviction = %config.eviction,
            "Built in-memory cache"
        );
        Ok(FoyerPlainCache { cache })
    }
}

#[async_trait::async_trait]
impl<K, V> super::Cache<K, V> for FoyerPlainCache<K, V>
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        Ok(self.cache.get(key).map(|v| v.value().clone()))
    }

    async fn insert(&self, key: K, value: V) {
        self.cache.insert(key, value);
    }

    async fn remove(&self, key: &K) {
        self.cache.remove(key);
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cache;

    #[derive(Clone, Debug, PartialEq)]
    struct Entry(usize);

    impl Weighted for Entry {
        fn weight(&self) -> usize {
            self.0
        }
    }

    #[tokio::test]
    async fn test_inserted_key_immediately_available() {
        let cache = FoyerCacheConfig::default()
            .build_memory::<String, Entry>()
            .unwrap();
        cache.insert("key1".to_string(), Entry(3)).await;
        assert_eq!(cache.get(&"key1".to_string()).await.unwrap(), Some(Entry(3)));
    }

    #[tokio::test]
    async fn test_weighted_eviction_bounds_usage() {
        let cache = FoyerCacheConfig {
            capacity: 100,
            shards: 1,
            ..Default::default()
        }
        .build_memory::<u32, Entry>()
        .unwrap();
        for i in 0..50 {
            cache.insert(i, Entry(10)).await;
        }
        let mut resident = 0;
        for i in 0..50 {
            if cache.get(&i).await.unwrap().is_some() {
                resident += 1;
            }
        }
        assert!(resident <= 10, "resident entries: {resident}");
        assert!(resident > 0);
    }

    #[test]
    fn test_unknown_eviction_is_rejected() {
        let res = FoyerCacheConfig {
            eviction: "random".to_string(),
            ..Default::default()
        }
        .build_memory::<u32, Entry>();
        assert!(matches!(res, Err(CacheError::InvalidCacheConfig(_))));
    }
}
