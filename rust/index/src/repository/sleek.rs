use super::{AddressBook, BucketRepository, BucketRepositoryError, LockStripes};
use crate::bucket::{DeleteStatus, InsertStatus, SleekBucket};
use crate::filter::Filter;
use crate::result_queue::ResultQueue;
use crate::sketch::SketchAddress;
use crate::stats::Statistics;
use async_trait::async_trait;
use parking_lot::RwLock;
use sketchdb_blockstore::ByteStore;
use sketchdb_cache::{Cache, Weighted};
use sketchdb_distance::MetricObject;
use std::collections::BTreeSet;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// A shared handle to a parsed bucket, as held by the bucket cache.
#[derive(Clone, Debug)]
pub struct BucketRef<O: MetricObject> {
    inner: Arc<RwLock<SleekBucket<O>>>,
}

impl<O: MetricObject> BucketRef<O> {
    fn new(bucket: SleekBucket<O>) -> Self {
        BucketRef {
            inner: Arc::new(RwLock::new(bucket)),
        }
    }
}

impl<O: MetricObject> Weighted for BucketRef<O> {
    fn weight(&self) -> usize {
        self.inner.read().len().max(1)
    }
}

/// Stores each bucket as one serialized value under its address key and
/// keeps parsed buckets in a cache.
///
/// Writers hold the address's stripe lock for the whole read-modify-write.
/// Readers only take it on a cache miss, so a bucket loaded from the store
/// can never overwrite a newer cached copy.
pub struct SleekBucketRepository<O: MetricObject> {
    store: Arc<dyn ByteStore>,
    cache: Box<dyn Cache<SketchAddress, BucketRef<O>>>,
    pivot_count: usize,
    addresses: AddressBook,
    locks: LockStripes,
}

impl<O: MetricObject> Debug for SleekBucketRepository<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleekBucketRepository")
            .field("store", &self.store)
            .field("pivot_count", &self.pivot_count)
            .field("buckets", &self.addresses.len())
            .finish()
    }
}

impl<O: MetricObject> SleekBucketRepository<O> {
    /// Opens the repository, discovering existing buckets from the store's
    /// keys. Keys that are not `bits`-wide addresses are skipped.
    pub async fn open(
        store: Arc<dyn ByteStore>,
        cache: Box<dyn Cache<SketchAddress, BucketRef<O>>>,
        pivot_count: usize,
        lock_stripes: usize,
        bits: usize,
    ) -> Result<Self, BucketRepositoryError> {
        let mut addresses = BTreeSet::new();
        for key in store.scan_keys(&[]).await? {
            match SketchAddress::from_key(bits, &key) {
                Some(address) => {
                    addresses.insert(address);
                }
                None => tracing::warn!("Ignoring store key {:?} that is not a bucket address", key),
            }
        }
        tracing::info!("Opened sleek bucket repository with {} buckets", addresses.len());
        Ok(SleekBucketRepository {
            store,
            cache,
            pivot_count,
            addresses: AddressBook::new(addresses),
            locks: LockStripes::new(lock_stripes),
        })
    }

    async fn cached(&self, address: &SketchAddress) -> Option<BucketRef<O>> {
        self.cache.get(address).await.ok().flatten()
    }

    /// Reads and parses a bucket from the store and caches it. The caller
    /// must hold the address's stripe lock. Returns the bytes read too.
    async fn fetch_locked(
        &self,
        address: &SketchAddress,
    ) -> Result<Option<(BucketRef<O>, usize)>, BucketRepositoryError> {
        let Some(data) = self.store.get(&address.to_key()).await? else {
            return Ok(None);
        };
        let bucket = match SleekBucket::parse(self.pivot_count, &data) {
            Ok(bucket) => bucket,
            Err(e) => {
                tracing::error!("Failed to parse bucket {}: {}", address, e);
                return Err(BucketRepositoryError::Corrupt {
                    address: address.clone(),
                    source: e,
                });
            }
        };
        let bucket = BucketRef::new(bucket);
        self.cache.insert(address.clone(), bucket.clone()).await;
        Ok(Some((bucket, data.len())))
    }

    async fn load_locked(
        &self,
        address: &SketchAddress,
    ) -> Result<Option<BucketRef<O>>, BucketRepositoryError> {
        if let Some(bucket) = self.cached(address).await {
            return Ok(Some(bucket));
        }
        Ok(self.fetch_locked(address).await?.map(|(bucket, _)| bucket))
    }

    async fn load_for_read(
        &self,
        address: &SketchAddress,
        stats: Option<&Statistics>,
    ) -> Result<Option<BucketRef<O>>, BucketRepositoryError> {
        if let Some(bucket) = self.cached(address).await {
            return Ok(Some(bucket));
        }
        let _guard = self.locks.lock(address).await;
        if let Some(bucket) = self.cached(address).await {
            return Ok(Some(bucket));
        }
        match self.fetch_locked(address).await? {
            Some((bucket, bytes)) => {
                if let Some(stats) = stats {
                    stats.add_bytes_read(bytes);
                }
                Ok(Some(bucket))
            }
            None => Ok(None),
        }
    }

    /// Writes a modified bucket back. On failure the cached copy is dropped
    /// so the next reader sees what the store holds.
    async fn persist_locked(
        &self,
        address: &SketchAddress,
        bucket: &BucketRef<O>,
        newly_created: bool,
    ) -> Result<(), BucketRepositoryError> {
        let encoded = bucket.inner.read().serialize();
        let data = match encoded {
            Ok(data) => data,
            Err(e) => {
                self.cache.remove(address).await;
                return Err(BucketRepositoryError::Encode {
                    address: address.clone(),
                    source: e,
                });
            }
        };
        if let Err(e) = self.store.put(&address.to_key(), data).await {
            tracing::error!("Failed to write bucket {}: {}", address, e);
            self.cache.remove(address).await;
            return Err(e.into());
        }
        bucket.inner.write().mark_clean();
        if newly_created {
            self.cache.insert(address.clone(), bucket.clone()).await;
        }
        self.addresses.insert(address);
        Ok(())
    }
}

#[async_trait]
impl<O: MetricObject> BucketRepository<O> for SleekBucketRepository<O> {
    async fn insert(
        &self,
        address: &SketchAddress,
        id: i64,
        object: O,
    ) -> Result<InsertStatus, BucketRepositoryError> {
        let _guard = self.locks.lock(address).await;
        let (bucket, newly_created) = match self.load_locked(address).await? {
            Some(bucket) => (bucket, false),
            None => (BucketRef::new(SleekBucket::new(self.pivot_count)), true),
        };
        let status = bucket.inner.write().insert(id, object);
        if let InsertStatus::AlreadyExists(_) = status {
            return Ok(status);
        }
        self.persist_locked(address, &bucket, newly_created).await?;
        Ok(status)
    }

    async fn delete(
        &self,
        address: &SketchAddress,
        object: &O,
    ) -> Result<DeleteStatus, BucketRepositoryError> {
        let _guard = self.locks.lock(address).await;
        let Some(bucket) = self.load_locked(address).await? else {
            return Ok(DeleteStatus::NotFound);
        };
        let (status, now_empty) = {
            let mut bucket = bucket.inner.write();
            let status = bucket.delete(object);
            (status, bucket.is_empty())
        };
        if status == DeleteStatus::NotFound {
            return Ok(status);
        }
        if now_empty {
            self.cache.remove(address).await;
            self.store.delete(&address.to_key()).await?;
            self.addresses.remove(address);
            return Ok(status);
        }
        self.persist_locked(address, &bucket, false).await?;
        Ok(status)
    }

    async fn exists(
        &self,
        address: &SketchAddress,
        object: &O,
    ) -> Result<Option<i64>, BucketRepositoryError> {
        Ok(match self.load_for_read(address, None).await? {
            Some(bucket) => bucket.inner.read().exists(object),
            None => None,
        })
    }

    async fn search(
        &self,
        address: &SketchAddress,
        query: &O,
        range: O::Distance,
        filter: Option<&dyn Filter<O>>,
        collector: &mut ResultQueue<O>,
        stats: &Statistics,
    ) -> Result<(), BucketRepositoryError> {
        let Some(bucket) = self.load_for_read(address, Some(stats)).await? else {
            return Ok(());
        };
        stats.inc_buckets_read();
        bucket
            .inner
            .read()
            .search(query, range, filter, collector, stats);
        Ok(())
    }

    async fn objects(
        &self,
        address: &SketchAddress,
    ) -> Result<Vec<(i64, O)>, BucketRepositoryError> {
        Ok(match self.load_for_read(address, None).await? {
            Some(bucket) => bucket
                .inner
                .read()
                .records()
                .map(|r| (r.id, r.object.clone()))
                .collect(),
            None => Vec::new(),
        })
    }

    fn addresses(&self) -> Vec<SketchAddress> {
        self.addresses.snapshot()
    }

    fn bucket_count(&self) -> usize {
        self.addresses.len()
    }
}
