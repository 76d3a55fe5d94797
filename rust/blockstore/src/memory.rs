use super::{ByteStore, ByteStoreError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// A byte store backed by an in-process `BTreeMap`. Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryByteStore {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
}

impl MemoryByteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ByteStore for MemoryByteStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, ByteStoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: Bytes) -> Result<(), ByteStoreError> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, ByteStoreError> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn range_scan(
        &self,
        low: &[u8],
        high: &[u8],
    ) -> Result<Vec<(Vec<u8>, Bytes)>, ByteStoreError> {
        if low > high {
            return Ok(Vec::new());
        }
        let entries = self.entries.read();
        Ok(entries
            .range::<[u8], _>((Bound::Included(low), Bound::Included(high)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Bytes)>, ByteStoreError> {
        let entries = self.entries.read();
        Ok(entries
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn scan_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, ByteStoreError> {
        let entries = self.entries.read();
        Ok(entries
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn size(&self) -> Result<usize, ByteStoreError> {
        Ok(self.entries.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::check_ordered_store;

    #[tokio::test]
    async fn test_memory_store_ordering() {
        check_ordered_store(&MemoryByteStore::new()).await;
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let store = MemoryByteStore::new();
        let clone = store.clone();
        store.put(b"k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(clone.get(b"k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_inverted_range_is_empty() {
        let store = MemoryByteStore::new();
        store.put(b"m", Bytes::new()).await.unwrap();
        assert!(store.range_scan(b"z", b"a").await.unwrap().is_empty());
    }
}
