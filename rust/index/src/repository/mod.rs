mod keyed;
mod sleek;

pub use keyed::KeyedBucketRepository;
pub use sleek::{BucketRef, SleekBucketRepository};

use crate::bucket::{BucketCodecError, DeleteStatus, InsertStatus};
use crate::filter::Filter;
use crate::result_queue::ResultQueue;
use crate::sketch::SketchAddress;
use crate::stats::Statistics;
use async_trait::async_trait;
use parking_lot::RwLock;
use sketchdb_blockstore::ByteStoreError;
use sketchdb_distance::MetricObject;
use sketchdb_error::{ErrorCodes, SketchDbError};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BucketRepositoryError {
    #[error("Byte store error: {0}")]
    Store(#[from] ByteStoreError),
    #[error("Bucket {address} is corrupt: {source}")]
    Corrupt {
        address: SketchAddress,
        #[source]
        source: BucketCodecError,
    },
    #[error("Bucket {address} cannot be encoded: {source}")]
    Encode {
        address: SketchAddress,
        #[source]
        source: BucketCodecError,
    },
}

impl SketchDbError for BucketRepositoryError {
    fn code(&self) -> ErrorCodes {
        match self {
            BucketRepositoryError::Store(e) => e.code(),
            BucketRepositoryError::Corrupt { .. } => ErrorCodes::DataLoss,
            BucketRepositoryError::Encode { source, .. } => source.code(),
        }
    }
}

/// Storage strategy for buckets.
///
/// Mutations of one address are serialized by the implementation, so a
/// duplicate check and the insert that follows it cannot interleave with
/// another writer of the same bucket.
#[async_trait]
pub trait BucketRepository<O: MetricObject>: Debug + Send + Sync {
    async fn insert(
        &self,
        address: &SketchAddress,
        id: i64,
        object: O,
    ) -> Result<InsertStatus, BucketRepositoryError>;

    async fn delete(
        &self,
        address: &SketchAddress,
        object: &O,
    ) -> Result<DeleteStatus, BucketRepositoryError>;

    async fn exists(
        &self,
        address: &SketchAddress,
        object: &O,
    ) -> Result<Option<i64>, BucketRepositoryError>;

    /// Offers the bucket's records within `range` of `query` to `collector`.
    /// A missing bucket is not an error.
    async fn search(
        &self,
        address: &SketchAddress,
        query: &O,
        range: O::Distance,
        filter: Option<&dyn Filter<O>>,
        collector: &mut ResultQueue<O>,
        stats: &Statistics,
    ) -> Result<(), BucketRepositoryError>;

    /// Every record of the bucket.
    async fn objects(&self, address: &SketchAddress)
        -> Result<Vec<(i64, O)>, BucketRepositoryError>;

    /// Addresses of all non-empty buckets.
    fn addresses(&self) -> Vec<SketchAddress>;

    fn bucket_count(&self) -> usize;
}

/// The set of non-empty bucket addresses.
#[derive(Debug, Default)]
pub(crate) struct AddressBook {
    addresses: RwLock<BTreeSet<SketchAddress>>,
}

impl AddressBook {
    pub(crate) fn new(addresses: BTreeSet<SketchAddress>) -> Self {
        AddressBook {
            addresses: RwLock::new(addresses),
        }
    }

    pub(crate) fn insert(&self, address: &SketchAddress) {
        if !self.addresses.read().contains(address) {
            self.addresses.write().insert(address.clone());
        }
    }

    pub(crate) fn remove(&self, address: &SketchAddress) {
        self.addresses.write().remove(address);
    }

    pub(crate) fn snapshot(&self) -> Vec<SketchAddress> {
        self.addresses.read().iter().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.addresses.read().len()
    }
}

/// A fixed set of async mutexes, one picked per address by hash.
#[derive(Debug)]
pub(crate) struct LockStripes {
    locks: Vec<tokio::sync::Mutex<()>>,
}

impl LockStripes {
    pub(crate) fn new(stripes: usize) -> Self {
        LockStripes {
            locks: (0..stripes.max(1))
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
        }
    }

    pub(crate) async fn lock(&self, address: &SketchAddress) -> tokio::sync::MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        address.hash(&mut hasher);
        let stripe = (hasher.finish() % self.locks.len() as u64) as usize;
        self.locks[stripe].lock().await
    }
}
