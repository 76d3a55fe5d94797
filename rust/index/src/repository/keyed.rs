use super::{AddressBook, BucketRepository, BucketRepositoryError, LockStripes};
use crate::bucket::{
    match_member, match_pivot, BucketCodecError, BucketObject, DeleteStatus, InsertStatus,
};
use crate::filter::Filter;
use crate::result_queue::ResultQueue;
use crate::sketch::SketchAddress;
use crate::stats::Statistics;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sketchdb_blockstore::ByteStore;
use sketchdb_distance::{Distance, MetricObject};
use std::collections::BTreeSet;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

const PIVOT_TAG: u8 = 0x00;
const MEMBER_TAG: u8 = 0x01;

/// Stores every record of a bucket under its own key:
///
/// ```text
/// pivot:  address | 0x00 | slot: u32 BE                  => id | payload
/// member: address | 0x01 | [smap[0] sortable] | id sortable => smap | id | payload
/// ```
///
/// Members are ordered by their distance to the first local pivot, so a
/// query only scans the members whose key lies within its range of the
/// query's own distance to that pivot.
pub struct KeyedBucketRepository<O: MetricObject> {
    store: Arc<dyn ByteStore>,
    pivot_count: usize,
    addresses: AddressBook,
    locks: LockStripes,
    _object: PhantomData<fn() -> O>,
}

impl<O: MetricObject> Debug for KeyedBucketRepository<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedBucketRepository")
            .field("store", &self.store)
            .field("pivot_count", &self.pivot_count)
            .field("buckets", &self.addresses.len())
            .finish()
    }
}

fn tagged_prefix(address: &SketchAddress, tag: u8) -> Vec<u8> {
    let mut key = address.to_key();
    key.push(tag);
    key
}

fn pivot_key(address: &SketchAddress, slot: u32) -> Vec<u8> {
    let mut key = tagged_prefix(address, PIVOT_TAG);
    key.put_u32(slot);
    key
}

fn member_key<D: Distance>(address: &SketchAddress, first: Option<D>, id: i64) -> Vec<u8> {
    let mut key = tagged_prefix(address, MEMBER_TAG);
    if let Some(first) = first {
        first.put_sortable(&mut key);
    }
    id.put_sortable(&mut key);
    key
}

impl<O: MetricObject> KeyedBucketRepository<O> {
    /// Opens the repository. Bucket addresses are recovered from the key
    /// prefixes already in the store.
    pub async fn open(
        store: Arc<dyn ByteStore>,
        pivot_count: usize,
        lock_stripes: usize,
        bits: usize,
    ) -> Result<Self, BucketRepositoryError> {
        let address_len = SketchAddress::key_len(bits);
        let mut addresses = BTreeSet::new();
        for key in store.scan_keys(&[]).await? {
            let address = if key.len() > address_len {
                SketchAddress::from_key(bits, &key[..address_len])
            } else {
                None
            };
            match address {
                Some(address) => {
                    addresses.insert(address);
                }
                None => tracing::warn!("Ignoring store key {:?} that is not a bucket record", key),
            }
        }
        tracing::info!("Opened keyed bucket repository with {} buckets", addresses.len());
        Ok(KeyedBucketRepository {
            store,
            pivot_count,
            addresses: AddressBook::new(addresses),
            locks: LockStripes::new(lock_stripes),
            _object: PhantomData,
        })
    }

    fn corrupt(address: &SketchAddress, source: BucketCodecError) -> BucketRepositoryError {
        tracing::error!("Failed to parse record of bucket {}: {}", address, source);
        BucketRepositoryError::Corrupt {
            address: address.clone(),
            source,
        }
    }

    fn decode_record(
        &self,
        address: &SketchAddress,
        smap_len: usize,
        value: &[u8],
    ) -> Result<BucketObject<O>, BucketRepositoryError> {
        let needed = smap_len * O::Distance::WIDTH + 8;
        if value.len() < needed {
            return Err(Self::corrupt(
                address,
                BucketCodecError::Truncated {
                    needed,
                    remaining: value.len(),
                },
            ));
        }
        let mut buf = value;
        let smap = (0..smap_len).map(|_| O::Distance::get_le(&mut buf)).collect();
        let id = buf.get_i64_le();
        let object = O::decode(buf).map_err(|e| Self::corrupt(address, e.into()))?;
        Ok(BucketObject::new(id, smap, object))
    }

    fn encode_record(record: &BucketObject<O>) -> Bytes {
        let payload = record.object.encode();
        let mut buf =
            BytesMut::with_capacity(record.smap.len() * O::Distance::WIDTH + 8 + payload.len());
        for d in &record.smap {
            d.put_le(&mut buf);
        }
        buf.put_i64_le(record.id);
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Local pivots in slot order, plus the bytes read.
    async fn load_pivots(
        &self,
        address: &SketchAddress,
    ) -> Result<(Vec<BucketObject<O>>, usize), BucketRepositoryError> {
        let entries = self
            .store
            .prefix_scan(&tagged_prefix(address, PIVOT_TAG))
            .await?;
        let mut bytes = 0;
        let mut pivots = Vec::with_capacity(entries.len());
        for (_, value) in entries {
            bytes += value.len();
            pivots.push(self.decode_record(address, 0, &value)?);
        }
        Ok((pivots, bytes))
    }

    /// Members whose first SMAP entry lies in `low..=high`, or all members
    /// when the bucket has no local pivots.
    async fn load_members(
        &self,
        address: &SketchAddress,
        bounds: Option<(O::Distance, O::Distance)>,
    ) -> Result<Vec<(Vec<u8>, BucketObject<O>, usize)>, BucketRepositoryError> {
        let entries = match (self.pivot_count, bounds) {
            (0, _) | (_, None) => {
                self.store
                    .prefix_scan(&tagged_prefix(address, MEMBER_TAG))
                    .await?
            }
            (_, Some((low, high))) => {
                let mut low_key = tagged_prefix(address, MEMBER_TAG);
                low.put_sortable(&mut low_key);
                let mut high_key = tagged_prefix(address, MEMBER_TAG);
                high.put_sortable(&mut high_key);
                high_key.extend_from_slice(&[0xff; 8]);
                self.store.range_scan(&low_key, &high_key).await?
            }
        };
        entries
            .into_iter()
            .map(|(key, value)| {
                let record = self.decode_record(address, self.pivot_count, &value)?;
                Ok((key, record, value.len()))
            })
            .collect()
    }

    fn smap_of(pivots: &[BucketObject<O>], object: &O) -> Vec<O::Distance> {
        pivots.iter().map(|p| object.distance(&p.object)).collect()
    }

    /// The key and id of a stored object at distance zero from `object`.
    async fn find(
        &self,
        address: &SketchAddress,
        pivots: &[BucketObject<O>],
        object: &O,
    ) -> Result<Option<(Vec<u8>, i64)>, BucketRepositoryError> {
        for (slot, pivot) in pivots.iter().enumerate() {
            if pivot.object.distance(object) == O::Distance::ZERO {
                return Ok(Some((pivot_key(address, slot as u32), pivot.id)));
            }
        }
        if pivots.len() < self.pivot_count {
            return Ok(None);
        }
        // An equal object has the same distance to the first pivot.
        let bounds = pivots
            .first()
            .map(|p| object.distance(&p.object))
            .map(|first| (first, first));
        for (key, record, _) in self.load_members(address, bounds).await? {
            if record.object.distance(object) == O::Distance::ZERO {
                return Ok(Some((key, record.id)));
            }
        }
        Ok(None)
    }

    /// Appends a record to a bucket whose pivots are `pivots`.
    async fn append_locked(
        &self,
        address: &SketchAddress,
        pivots: &mut Vec<BucketObject<O>>,
        id: i64,
        object: O,
    ) -> Result<(), BucketRepositoryError> {
        if pivots.len() < self.pivot_count {
            let record = BucketObject::new(id, Vec::new(), object);
            self.store
                .put(
                    &pivot_key(address, pivots.len() as u32),
                    Self::encode_record(&record),
                )
                .await?;
            pivots.push(record);
        } else {
            let smap = Self::smap_of(pivots, &object);
            let key = member_key(address, smap.first().copied(), id);
            let record = BucketObject::new(id, smap, object);
            self.store.put(&key, Self::encode_record(&record)).await?;
        }
        self.addresses.insert(address);
        Ok(())
    }

    /// Drops every key of the bucket and re-inserts `survivors`, which picks
    /// new local pivots and recomputes every SMAP vector.
    async fn rebuild_locked(
        &self,
        address: &SketchAddress,
        mut survivors: Vec<BucketObject<O>>,
    ) -> Result<(), BucketRepositoryError> {
        for key in self.store.scan_keys(&address.to_key()).await? {
            self.store.delete(&key).await?;
        }
        if survivors.is_empty() {
            self.addresses.remove(address);
            return Ok(());
        }
        survivors.sort_by_key(|r| r.id);
        let mut pivots = Vec::with_capacity(self.pivot_count);
        for record in survivors {
            self.append_locked(address, &mut pivots, record.id, record.object)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<O: MetricObject> BucketRepository<O> for KeyedBucketRepository<O> {
    async fn insert(
        &self,
        address: &SketchAddress,
        id: i64,
        object: O,
    ) -> Result<InsertStatus, BucketRepositoryError> {
        let _guard = self.locks.lock(address).await;
        let (mut pivots, _) = self.load_pivots(address).await?;
        if let Some((_, existing)) = self.find(address, &pivots, &object).await? {
            return Ok(InsertStatus::AlreadyExists(existing));
        }
        self.append_locked(address, &mut pivots, id, object).await?;
        Ok(InsertStatus::Inserted(id))
    }

    async fn delete(
        &self,
        address: &SketchAddress,
        object: &O,
    ) -> Result<DeleteStatus, BucketRepositoryError> {
        let _guard = self.locks.lock(address).await;
        let (pivots, _) = self.load_pivots(address).await?;
        let Some((key, id)) = self.find(address, &pivots, object).await? else {
            return Ok(DeleteStatus::NotFound);
        };
        if key.get(address.to_key().len()) == Some(&PIVOT_TAG) {
            let members = self.load_members(address, None).await?;
            let survivors = pivots
                .into_iter()
                .filter(|p| p.id != id)
                .chain(members.into_iter().map(|(_, record, _)| record))
                .collect();
            self.rebuild_locked(address, survivors).await?;
        } else {
            self.store.delete(&key).await?;
            if pivots.is_empty() && self.store.scan_keys(&address.to_key()).await?.is_empty() {
                self.addresses.remove(address);
            }
        }
        Ok(DeleteStatus::Removed(id))
    }

    async fn exists(
        &self,
        address: &SketchAddress,
        object: &O,
    ) -> Result<Option<i64>, BucketRepositoryError> {
        let (pivots, _) = self.load_pivots(address).await?;
        Ok(self
            .find(address, &pivots, object)
            .await?
            .map(|(_, id)| id))
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
        let (pivots, mut bytes) = self.load_pivots(address).await?;
        let query_smap: Vec<O::Distance> = pivots
            .iter()
            .map(|p| match_pivot(p, query, range, filter, collector, stats))
            .collect();
        let members = if pivots.len() < self.pivot_count {
            Vec::new()
        } else {
            let bounds = query_smap.first().map(|first| {
                (
                    first.saturating_sub(range).max_by_total(O::Distance::ZERO),
                    first.saturating_add(range),
                )
            });
            self.load_members(address, bounds).await?
        };
        if pivots.is_empty() && members.is_empty() {
            return Ok(());
        }
        stats.inc_buckets_read();
        for (_, member, len) in &members {
            bytes += len;
            match_member(member, query, &query_smap, range, filter, collector, stats);
        }
        stats.add_bytes_read(bytes);
        Ok(())
    }

    async fn objects(
        &self,
        address: &SketchAddress,
    ) -> Result<Vec<(i64, O)>, BucketRepositoryError> {
        let (pivots, _) = self.load_pivots(address).await?;
        let members = self.load_members(address, None).await?;
        Ok(pivots
            .into_iter()
            .chain(members.into_iter().map(|(_, record, _)| record))
            .map(|r| (r.id, r.object))
            .collect())
    }

    fn addresses(&self) -> Vec<SketchAddress> {
        self.addresses.snapshot()
    }

    fn bucket_count(&self) -> usize {
        self.addresses.len()
    }
}
