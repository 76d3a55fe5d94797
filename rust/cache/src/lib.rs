mod foyer;
mod nop;
mod unbounded;

use serde::{Deserialize, Serialize};
use sketchdb_error::{ErrorCodes, SketchDbError};
use std::hash::Hash;
use thiserror::Error;

pub use self::foyer::{FoyerCacheConfig, FoyerPlainCache};
pub use nop::NopCache;
pub use unbounded::{UnboundedCache, UnboundedCacheConfig};

/// A cache offers async access to a mapping from K to V.
///
/// Values are cloned out of the cache, so V should be cheap to clone
/// (usually an `Arc` around the real payload).
#[async_trait::async_trait]
pub trait Cache<K, V>: Send + Sync
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, CacheError>;
    async fn insert(&self, key: K, value: V);
    async fn remove(&self, key: &K);
    async fn clear(&self) -> Result<(), CacheError>;
}

/// The cost of keeping a value resident. Weighted caches evict by the sum of
/// weights instead of the number of entries.
pub trait Weighted {
    fn weight(&self) -> usize;
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid cache config: {0}")]
    InvalidCacheConfig(String),
}

impl SketchDbError for CacheError {
    fn code(&self) -> ErrorCodes {
        match self {
            CacheError::InvalidCacheConfig(_) => ErrorCodes::InvalidArgument,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub enum CacheConfig {
    // case-insensitive
    #[serde(alias = "unbounded")]
    Unbounded(UnboundedCacheConfig),
    #[serde(alias = "memory")]
    Memory(FoyerCacheConfig),
    #[serde(alias = "nop")]
    Nop,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory(FoyerCacheConfig::default())
    }
}

pub fn from_config<K, V>(
    config: &CacheConfig,
) -> Result<Box<dyn Cache<K, V>>, Box<dyn SketchDbError>>
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    match config {
        CacheConfig::Unbounded(unbounded) => Ok(Box::new(unbounded.build())),
        CacheConfig::Memory(foyer_config) => Ok(Box::new(
            foyer_config.build_memory().map_err(|e| e.boxed())?,
        )),
        CacheConfig::Nop => Ok(Box::new(NopCache)),
    }
}

pub fn new_cache_for_test<K, V>() -> Box<dyn Cache<K, V>>
where
    K: Clone + Send + Sync + Eq + PartialEq + Hash + 'static,
    V: Clone + Send + Sync + Weighted + 'static,
{
    Box::new(UnboundedCache::new(&UnboundedCacheConfig::default()))
}
