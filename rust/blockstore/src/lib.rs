pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sketchdb_config::Configurable;
use sketchdb_error::{ErrorCodes, SketchDbError};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

pub use local::{LocalByteStore, LocalByteStoreConfig};
pub use memory::MemoryByteStore;

/// An ordered key-value store of opaque byte strings.
///
/// Keys are compared bytewise. Scans return entries in ascending key order.
/// Implementations make each individual call atomic but offer no
/// transactions across calls.
#[async_trait]
pub trait ByteStore: Debug + Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, ByteStoreError>;

    async fn put(&self, key: &[u8], value: Bytes) -> Result<(), ByteStoreError>;

    /// Returns whether the key was present.
    async fn delete(&self, key: &[u8]) -> Result<bool, ByteStoreError>;

    /// All entries with `low <= key <= high`.
    async fn range_scan(
        &self,
        low: &[u8],
        high: &[u8],
    ) -> Result<Vec<(Vec<u8>, Bytes)>, ByteStoreError>;

    /// All entries whose key starts with `prefix`.
    async fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Bytes)>, ByteStoreError>;

    /// Keys starting with `prefix`, ascending, without reading values.
    async fn scan_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, ByteStoreError>;

    /// Number of stored keys.
    async fn size(&self) -> Result<usize, ByteStoreError>;
}

#[derive(Error, Debug)]
pub enum ByteStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Key of {len} bytes exceeds the {max} byte limit of this store")]
    KeyTooLong { len: usize, max: usize },
}

impl SketchDbError for ByteStoreError {
    fn code(&self) -> ErrorCodes {
        match self {
            ByteStoreError::Io { .. } => ErrorCodes::Internal,
            ByteStoreError::KeyTooLong { .. } => ErrorCodes::InvalidArgument,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
/// The configuration for the chosen byte store.
/// # Options
/// - Memory: everything lives in a process-local ordered map.
/// - Local: one file per key under a root directory.
pub enum ByteStoreConfig {
    // case-insensitive
    #[default]
    #[serde(alias = "memory")]
    Memory,
    #[serde(alias = "local")]
    Local(LocalByteStoreConfig),
}

pub async fn from_config(
    config: &ByteStoreConfig,
) -> Result<Arc<dyn ByteStore>, Box<dyn SketchDbError>> {
    match config {
        ByteStoreConfig::Memory => Ok(Arc::new(MemoryByteStore::new())),
        ByteStoreConfig::Local(local_config) => {
            Ok(Arc::new(LocalByteStore::try_from_config(local_config).await?))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Exercises the ordering contract every store has to honor.
    pub(crate) async fn check_ordered_store(store: &dyn ByteStore) {
        for key in [b"b".to_vec(), b"a".to_vec(), b"ab".to_vec(), vec![0xff], vec![]] {
            let value = Bytes::from(key.iter().rev().copied().collect::<Vec<u8>>());
            store.put(&key, value).await.unwrap();
        }
        assert_eq!(store.size().await.unwrap(), 5);
        assert_eq!(store.get(b"ab").await.unwrap(), Some(Bytes::from_static(b"ba")));
        assert_eq!(store.get(b"zz").await.unwrap(), None);

        let keys: Vec<Vec<u8>> = store
            .range_scan(b"a", b"b")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"ab".to_vec(), b"b".to_vec()]);

        let keys: Vec<Vec<u8>> = store
            .prefix_scan(b"a")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"ab".to_vec()]);
        assert_eq!(
            store.scan_keys(b"a").await.unwrap(),
            vec![b"a".to_vec(), b"ab".to_vec()]
        );
        assert_eq!(store.scan_keys(&[]).await.unwrap().len(), 5);

        assert!(store.range_scan(b"c", b"d").await.unwrap().is_empty());
        assert!(store.delete(b"a").await.unwrap());
        assert!(!store.delete(b"a").await.unwrap());
        assert_eq!(store.size().await.unwrap(), 4);

        store.put(b"b", Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(store.get(b"b").await.unwrap(), Some(Bytes::from_static(b"new")));
        assert_eq!(store.size().await.unwrap(), 4);
    }
}
