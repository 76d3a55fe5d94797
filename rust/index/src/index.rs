use crate::bucket::{DeleteStatus, InsertStatus};
use crate::calibrator::{CalibrationRun, CalibrationState, Calibrator};
use crate::config::{BucketLayout, IndexConfig, SketchDbConfig};
use crate::errors::{IndexError, SearchError};
use crate::filter::{Filter, NonEqualsFilter};
use crate::meta::{IndexFingerprint, MetaStore};
use crate::pivots::{PivotSelector, RandomPivotSelector};
use crate::repository::{BucketRepository, KeyedBucketRepository, SleekBucketRepository};
use crate::result_queue::{ResultEntry, ResultQueue};
use crate::sketch::{BitDistortion, SketchAddress, SketchEngine, SketchProjection};
use crate::stats::{Statistics, StatisticsSnapshot};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use sketchdb_blockstore::ByteStore;
use sketchdb_config::Configurable;
use sketchdb_distance::{Distance, MetricObject};
use sketchdb_error::SketchDbError;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// A k-nearest query, optionally bounded by a range.
#[derive(Clone)]
pub struct SearchRequest<O: MetricObject> {
    pub query: O,
    pub k: usize,
    pub range: O::Distance,
    pub filter: Option<Arc<dyn Filter<O>>>,
    /// Checked between bucket visits. A cancelled query returns what it has
    /// collected so far.
    pub cancellation: Option<CancellationToken>,
}

impl<O: MetricObject> SearchRequest<O> {
    pub fn new(query: O, k: usize) -> Self {
        SearchRequest {
            query,
            k,
            range: O::Distance::MAX,
            filter: None,
            cancellation: None,
        }
    }

    pub fn with_range(mut self, range: O::Distance) -> Self {
        self.range = range;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn Filter<O>>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

impl<O: MetricObject> Debug for SearchRequest<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchRequest")
            .field("query", &self.query)
            .field("k", &self.k)
            .field("range", &self.range)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct SearchResponse<O: MetricObject> {
    /// Closest first.
    pub results: Vec<ResultEntry<O>>,
    pub buckets_visited: usize,
    pub cancelled: bool,
    /// Work done by this query alone.
    pub stats: StatisticsSnapshot,
}

/// The searchable half of an index, fixed at freeze.
struct FrozenIndex<O: MetricObject> {
    engine: SketchEngine<O>,
    repository: Box<dyn BucketRepository<O>>,
}

/// A similarity index over objects that only expose a distance.
///
/// Objects inserted before [`SketchIndex::freeze`] are staged in the metadata
/// store. Freezing picks the sketch pivots from the staged objects and moves
/// each of them into the bucket named by its sketch; every later insert goes
/// straight to its bucket. Only a frozen index can be searched.
pub struct SketchIndex<O: MetricObject> {
    config: IndexConfig,
    meta: MetaStore,
    bucket_store: Arc<dyn ByteStore>,
    selector: Arc<dyn PivotSelector<O>>,
    frozen: RwLock<Option<Arc<FrozenIndex<O>>>>,
    // Held by staging writes and by freeze so no staged insert is lost.
    staging: tokio::sync::Mutex<()>,
    // One calibration run at a time.
    calibrating: tokio::sync::Mutex<()>,
    // Orders the persisted copies of `next_id` and `len`.
    counters: tokio::sync::Mutex<()>,
    calibrator: Calibrator,
    stats: Statistics,
    next_id: AtomicI64,
    len: AtomicU64,
}

impl<O: MetricObject> Debug for SketchIndex<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SketchIndex")
            .field("config", &self.config)
            .field("frozen", &self.is_frozen())
            .field("len", &self.len())
            .finish()
    }
}

async fn open_repository<O: MetricObject>(
    config: &IndexConfig,
    store: Arc<dyn ByteStore>,
) -> Result<Box<dyn BucketRepository<O>>, IndexError> {
    let repository: Box<dyn BucketRepository<O>> = match config.layout {
        BucketLayout::Sleek => {
            let cache = sketchdb_cache::from_config(&config.bucket_cache)
                .map_err(|e| IndexError::InvalidConfig(e.to_string()))?;
            Box::new(
                SleekBucketRepository::open(
                    store,
                    cache,
                    config.bucket_pivot_count,
                    config.lock_stripes,
                    config.sketch_bits,
                )
                .await?,
            )
        }
        BucketLayout::Keyed => Box::new(
            KeyedBucketRepository::open(
                store,
                config.bucket_pivot_count,
                config.lock_stripes,
                config.sketch_bits,
            )
            .await?,
        ),
    };
    Ok(repository)
}

impl<O: MetricObject> SketchIndex<O> {
    /// Creates an index over empty stores.
    pub async fn new(
        config: IndexConfig,
        bucket_store: Arc<dyn ByteStore>,
        meta_store: Arc<dyn ByteStore>,
        selector: Arc<dyn PivotSelector<O>>,
    ) -> Result<Self, IndexError> {
        if meta_store.size().await? != 0 || bucket_store.size().await? != 0 {
            return Err(IndexError::InvalidConfig(
                "stores already hold data, open the existing index instead".to_string(),
            ));
        }
        Self::open(config, bucket_store, meta_store, selector).await
    }

    /// Opens the index held by the stores, creating it when they are empty.
    #[instrument(skip_all)]
    pub async fn open(
        config: IndexConfig,
        bucket_store: Arc<dyn ByteStore>,
        meta_store: Arc<dyn ByteStore>,
        selector: Arc<dyn PivotSelector<O>>,
    ) -> Result<Self, IndexError> {
        config.validate().map_err(IndexError::InvalidConfig)?;
        let meta = MetaStore::new(meta_store);
        let fingerprint = IndexFingerprint::from(&config);
        match meta.fingerprint().await? {
            Some(stored) if stored != fingerprint => {
                return Err(IndexError::InvalidConfig(format!(
                    "index was created with {stored:?}, config asks for {fingerprint:?}"
                )));
            }
            Some(_) => {}
            None => meta.put_fingerprint(&fingerprint).await?,
        }

        let frozen = if meta.is_frozen().await? {
            let pairs = meta.pivots::<O>().await?.ok_or_else(|| {
                IndexError::Metadata("frozen index has no pivots".to_string())
            })?;
            if pairs.len() != config.sketch_bits {
                return Err(IndexError::Metadata(format!(
                    "{} pivot pairs stored for a {}-bit sketch",
                    pairs.len(),
                    config.sketch_bits
                )));
            }
            let repository = open_repository(&config, bucket_store.clone()).await?;
            meta.clear_stage().await?;
            Some(Arc::new(FrozenIndex {
                engine: SketchEngine::new(pairs),
                repository,
            }))
        } else {
            None
        };

        let calibrator = Calibrator::with_state(config.calibration.clone(), meta.calibration().await?);
        let next_id = meta.next_id().await?;
        let len = meta.len().await?;
        tracing::info!(
            frozen = frozen.is_some(),
            len,
            "Opened sketch index with {} bits",
            config.sketch_bits
        );
        Ok(SketchIndex {
            config,
            meta,
            bucket_store,
            selector,
            frozen: RwLock::new(frozen),
            staging: tokio::sync::Mutex::new(()),
            calibrating: tokio::sync::Mutex::new(()),
            counters: tokio::sync::Mutex::new(()),
            calibrator,
            stats: Statistics::new(),
            next_id: AtomicI64::new(next_id),
            len: AtomicU64::new(len),
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.read().is_some()
    }

    fn frozen(&self) -> Option<Arc<FrozenIndex<O>>> {
        self.frozen.read().clone()
    }

    fn ready(&self) -> Result<Arc<FrozenIndex<O>>, IndexError> {
        self.frozen().ok_or(IndexError::NotReady)
    }

    /// Number of stored objects.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of non-empty buckets. Zero before freeze.
    pub fn bucket_count(&self) -> usize {
        self.frozen()
            .map_or(0, |frozen| frozen.repository.bucket_count())
    }

    /// How often each sketch bit came out cleared or set. Empty before
    /// freeze.
    pub fn distortion(&self) -> Vec<BitDistortion> {
        self.frozen()
            .map(|frozen| frozen.engine.distortion())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn calibration(&self) -> CalibrationState {
        self.calibrator.state()
    }

    fn check_range(&self, projection: &SketchProjection) -> Result<(), IndexError> {
        match self.config.max_distance {
            Some(max) if projection.max_pivot_distance > max => Err(IndexError::OutOfRange {
                distance: projection.max_pivot_distance,
                max,
            }),
            _ => Ok(()),
        }
    }

    async fn allocate_id(&self) -> Result<i64, IndexError> {
        let _guard = self.counters.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.meta.put_next_id(id + 1).await?;
        Ok(id)
    }

    async fn record_len_change(&self, inserted: bool) -> Result<(), IndexError> {
        let _guard = self.counters.lock().await;
        let len = if inserted {
            self.len.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.len.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
        };
        self.meta.put_len(len).await
    }

    /// Deletes every key in the bucket store. Returns how many were removed.
    async fn clear_bucket_store(&self) -> Result<usize, IndexError> {
        let keys = self.bucket_store.scan_keys(&[]).await?;
        for key in &keys {
            self.bucket_store.delete(key).await?;
        }
        Ok(keys.len())
    }

    /// Adds an object. Before freeze objects are staged without a duplicate
    /// check; duplicates are dropped when the index is frozen.
    #[instrument(skip_all)]
    pub async fn insert(&self, object: O) -> Result<InsertStatus, IndexError> {
        if self.frozen().is_none() {
            let _guard = self.staging.lock().await;
            if self.frozen().is_none() {
                let id = self.allocate_id().await?;
                self.meta.stage(id, &object).await?;
                self.record_len_change(true).await?;
                tracing::debug!("Staged object {}", id);
                return Ok(InsertStatus::Inserted(id));
            }
        }
        let frozen = self.ready()?;
        let projection = frozen.engine.project(&object);
        self.check_range(&projection)?;
        if let Some(existing) = frozen
            .repository
            .exists(&projection.address, &object)
            .await?
        {
            return Ok(InsertStatus::AlreadyExists(existing));
        }
        let id = self.allocate_id().await?;
        let status = frozen
            .repository
            .insert(&projection.address, id, object)
            .await?;
        if let InsertStatus::Inserted(_) = status {
            self.record_len_change(true).await?;
        }
        Ok(status)
    }

    #[instrument(skip_all)]
    pub async fn delete(&self, object: &O) -> Result<DeleteStatus, IndexError> {
        if self.frozen().is_none() {
            let _guard = self.staging.lock().await;
            if self.frozen().is_none() {
                let found = self
                    .meta
                    .staged::<O>()
                    .await?
                    .into_iter()
                    .find(|(_, staged)| staged.distance(object) == O::Distance::ZERO);
                let Some((id, _)) = found else {
                    return Ok(DeleteStatus::NotFound);
                };
                if !self.meta.unstage(id).await? {
                    return Err(IndexError::DuplicateOrMissingIdentity(id));
                }
                self.record_len_change(false).await?;
                return Ok(DeleteStatus::Removed(id));
            }
        }
        let frozen = self.ready()?;
        let projection = frozen.engine.project(object);
        self.check_range(&projection)?;
        let status = frozen
            .repository
            .delete(&projection.address, object)
            .await?;
        if let DeleteStatus::Removed(_) = status {
            self.record_len_change(false).await?;
        }
        Ok(status)
    }

    /// Identity of a stored object at distance zero from `object`.
    #[instrument(skip_all)]
    pub async fn exists(&self, object: &O) -> Result<Option<i64>, IndexError> {
        match self.frozen() {
            None => Ok(self
                .meta
                .staged::<O>()
                .await?
                .into_iter()
                .find(|(_, staged)| staged.distance(object) == O::Distance::ZERO)
                .map(|(id, _)| id)),
            Some(frozen) => {
                let projection = frozen.engine.project(object);
                self.check_range(&projection)?;
                Ok(frozen
                    .repository
                    .exists(&projection.address, object)
                    .await?)
            }
        }
    }

    /// Builds the sketch from the staged objects and moves every one of them
    /// into its bucket.
    ///
    /// A failed freeze leaves the index unfrozen with an empty bucket store,
    /// so it can be retried. Buckets left behind by a freeze that never
    /// finished are removed before any new bucket is written.
    #[instrument(skip_all)]
    pub async fn freeze(&self) -> Result<(), IndexError> {
        let _guard = self.staging.lock().await;
        if self.is_frozen() {
            return Err(IndexError::AlreadyFrozen);
        }
        let leftover = self.clear_bucket_store().await?;
        if leftover > 0 {
            tracing::warn!("Removed {} bucket keys left by an unfinished freeze", leftover);
        }
        let frozen = match self.build_buckets().await {
            Ok(frozen) => frozen,
            Err(e) => {
                tracing::error!("Freeze failed, removing partially written buckets: {}", e);
                if let Err(cleanup) = self.clear_bucket_store().await {
                    tracing::error!("Could not remove partially written buckets: {}", cleanup);
                }
                return Err(e);
            }
        };
        *self.frozen.write() = Some(Arc::new(frozen));
        // A frozen index never reads the stage again; reopening retries this.
        if let Err(e) = self.meta.clear_stage().await {
            tracing::warn!("Could not clear staged objects after freeze: {}", e);
        }
        Ok(())
    }

    async fn build_buckets(&self) -> Result<FrozenIndex<O>, IndexError> {
        let staged = self.meta.staged::<O>().await?;
        let pivot_ids = self
            .selector
            .select_pivots(2 * self.config.sketch_bits, &staged)?;
        let by_id: HashMap<i64, &O> = staged.iter().map(|(id, o)| (*id, o)).collect();
        let mut pivots = Vec::with_capacity(pivot_ids.len());
        for id in pivot_ids {
            let object = by_id
                .get(&id)
                .ok_or(IndexError::DuplicateOrMissingIdentity(id))?;
            pivots.push((*object).clone());
        }
        let mut pivots = pivots.into_iter();
        let mut pairs = Vec::with_capacity(self.config.sketch_bits);
        while let (Some(a), Some(b)) = (pivots.next(), pivots.next()) {
            pairs.push((a, b));
        }
        self.meta.put_pivots(&pairs).await?;

        let engine = SketchEngine::new(pairs);
        let repository = open_repository(&self.config, self.bucket_store.clone()).await?;
        let mut stored: u64 = 0;
        let mut duplicates = 0;
        for (id, object) in staged {
            let address = engine.project(&object).address;
            match repository.insert(&address, id, object).await? {
                InsertStatus::Inserted(_) => stored += 1,
                InsertStatus::AlreadyExists(existing) => {
                    duplicates += 1;
                    tracing::warn!("Dropping staged object {} as a duplicate of {}", id, existing);
                }
            }
        }
        {
            let _guard = self.counters.lock().await;
            self.meta.put_len(stored).await?;
            self.meta.mark_frozen().await?;
            self.len.store(stored, Ordering::SeqCst);
        }
        tracing::info!(
            objects = stored,
            duplicates,
            buckets = repository.bucket_count(),
            "Froze sketch index"
        );
        Ok(FrozenIndex { engine, repository })
    }

    /// Exact k-nearest search. Buckets are visited closest sketch first and
    /// skipped when their lower bound exceeds the current range.
    #[instrument(skip_all, fields(k = request.k))]
    pub async fn search_exact(
        &self,
        request: &SearchRequest<O>,
    ) -> Result<SearchResponse<O>, SearchError> {
        let frozen = self.ready()?;
        let projection = frozen.engine.project(&request.query);
        self.check_range(&projection)?;
        let order = frozen.engine.order_buckets(
            &projection,
            &frozen.repository.addresses(),
            usize::MAX,
        );
        self.scan(&frozen, &projection, order, request).await
    }

    /// Approximate k-nearest search: reads only as many buckets as
    /// calibration found necessary for this k.
    #[instrument(skip_all, fields(k = request.k))]
    pub async fn search_approximate(
        &self,
        request: &SearchRequest<O>,
    ) -> Result<SearchResponse<O>, SearchError> {
        let frozen = self.ready()?;
        let projection = frozen.engine.project(&request.query);
        self.check_range(&projection)?;
        let budget = self
            .calibrator
            .estimate_budget(request.k, frozen.repository.bucket_count());
        tracing::debug!("Bucket budget {} for k = {}", budget, request.k);
        let order = frozen
            .engine
            .order_buckets(&projection, &frozen.repository.addresses(), budget);
        self.scan(&frozen, &projection, order, request).await
    }

    async fn scan(
        &self,
        frozen: &FrozenIndex<O>,
        projection: &SketchProjection,
        order: Vec<SketchAddress>,
        request: &SearchRequest<O>,
    ) -> Result<SearchResponse<O>, SearchError> {
        let stats = Statistics::new();
        stats.inc_queries();
        let mut collector = ResultQueue::new(request.k);
        let mut range = request.range;
        let mut buckets_visited = 0;
        let mut cancelled = false;
        for address in order {
            if request.is_cancelled() {
                cancelled = true;
                break;
            }
            if frozen.engine.bucket_lower_bound(projection, &address) > range.to_f64() {
                continue;
            }
            frozen
                .repository
                .search(
                    &address,
                    &request.query,
                    range,
                    request.filter.as_deref(),
                    &mut collector,
                    &stats,
                )
                .await?;
            buckets_visited += 1;
            range = collector.update_range(range);
        }
        let snapshot = stats.snapshot();
        self.stats.absorb(&snapshot);
        Ok(SearchResponse {
            results: collector.into_sorted_results(),
            buckets_visited,
            cancelled,
            stats: snapshot,
        })
    }

    /// Learns bucket budgets for every configured k from a sample of stored
    /// objects and persists them. Replaces earlier samples.
    #[instrument(skip_all)]
    pub async fn calibrate(&self) -> Result<(), IndexError> {
        let frozen = self.ready()?;
        let _guard = self.calibrating.lock().await;
        let addresses = frozen.repository.addresses();
        let mut database = Vec::new();
        for address in &addresses {
            database.extend(frozen.repository.objects(address).await?);
        }
        let mut state = CalibrationState::default();
        if database.is_empty() {
            self.meta.put_calibration(&state).await?;
            self.calibrator.install(state);
            return Ok(());
        }

        let calibration = self.calibrator.config();
        let mut rng = match calibration.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sample_size = calibration.sample_size.min(database.len());
        let filter: &dyn Filter<O> = &NonEqualsFilter;
        let stats = Statistics::new();
        for i in sample(&mut rng, database.len(), sample_size).into_vec() {
            let query = &database[i].1;
            let mut ground_truth: Vec<O::Distance> = database
                .iter()
                .map(|(_, o)| o.distance(query))
                .filter(|d| *d != O::Distance::ZERO)
                .collect();
            ground_truth.sort_by(|a, b| a.total_cmp(b));

            let projection = frozen.engine.project(query);
            let order = frozen
                .engine
                .order_buckets(&projection, &addresses, usize::MAX);
            for &k in &calibration.user_k {
                let mut collector = ResultQueue::new(k);
                let mut run =
                    CalibrationRun::new(&ground_truth, database.len(), calibration.expected_ep);
                let mut range = O::Distance::MAX;
                let mut good = None;
                for address in &order {
                    frozen
                        .repository
                        .search(address, query, range, Some(filter), &mut collector, &stats)
                        .await?;
                    range = collector.update_range(range);
                    if let Some(scanned) = run.observe(&collector) {
                        good = Some(scanned);
                        break;
                    }
                }
                let good = good.unwrap_or(order.len());
                state.record(k, good);
                stats.add_extra(&format!("calibration.k{k}.buckets"), good as f64);
            }
        }
        self.stats.absorb(&stats.snapshot());
        self.meta.put_calibration(&state).await?;
        self.calibrator.install(state);
        tracing::info!(
            samples = sample_size,
            "Calibrated bucket budgets for k in {:?}",
            calibration.user_k
        );
        Ok(())
    }
}

#[async_trait]
impl<O: MetricObject> Configurable<SketchDbConfig> for SketchIndex<O> {
    async fn try_from_config(config: &SketchDbConfig) -> Result<Self, Box<dyn SketchDbError>> {
        let bucket_store = sketchdb_blockstore::from_config(&config.bucket_store).await?;
        let meta_store = sketchdb_blockstore::from_config(&config.meta_store).await?;
        let selector = Arc::new(RandomPivotSelector::new(config.index.pivot_seed));
        SketchIndex::open(config.index.clone(), bucket_store, meta_store, selector)
            .await
            .map_err(|e| e.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrator::CalibrationConfig;
    use proptest::prelude::*;
    use rand::Rng;
    use bytes::Bytes;
    use sketchdb_blockstore::{ByteStoreError, LocalByteStoreConfig, MemoryByteStore};
    use sketchdb_cache::CacheConfig;
    use sketchdb_distance::{EditString, L1Vector};
    use sketchdb_error::ErrorCodes;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn config(layout: BucketLayout) -> IndexConfig {
        IndexConfig {
            sketch_bits: 4,
            bucket_pivot_count: 2,
            layout,
            bucket_cache: CacheConfig::Unbounded(Default::default()),
            pivot_seed: Some(11),
            calibration: CalibrationConfig {
                user_k: vec![1, 5],
                expected_ep: 0.0,
                sample_size: 10,
                seed: Some(3),
                ..Default::default()
            },
            lock_stripes: 8,
            ..Default::default()
        }
    }

    async fn index_with(
        config: IndexConfig,
        bucket_store: Arc<dyn ByteStore>,
        meta_store: Arc<dyn ByteStore>,
    ) -> SketchIndex<L1Vector> {
        let selector = Arc::new(RandomPivotSelector::new(config.pivot_seed));
        SketchIndex::open(config, bucket_store, meta_store, selector)
            .await
            .unwrap()
    }

    async fn memory_index(layout: BucketLayout) -> SketchIndex<L1Vector> {
        index_with(
            config(layout),
            Arc::new(MemoryByteStore::new()),
            Arc::new(MemoryByteStore::new()),
        )
        .await
    }

    /// `n` distinct points in `[0, 100)^2`.
    fn random_vectors(n: usize, seed: u64) -> Vec<L1Vector> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut seen = HashSet::new();
        let mut points = Vec::with_capacity(n);
        while points.len() < n {
            let point: (i16, i16) = (rng.gen_range(0..100), rng.gen_range(0..100));
            if seen.insert(point) {
                points.push(L1Vector(vec![point.0, point.1]));
            }
        }
        points
    }

    fn brute_force(data: &[L1Vector], query: &L1Vector, k: usize) -> Vec<i32> {
        let mut distances: Vec<i32> = data.iter().map(|o| o.distance(query)).collect();
        distances.sort();
        distances.truncate(k);
        distances
    }

    async fn frozen_index(layout: BucketLayout, data: &[L1Vector]) -> SketchIndex<L1Vector> {
        let index = memory_index(layout).await;
        for o in data {
            index.insert(o.clone()).await.unwrap();
        }
        index.freeze().await.unwrap();
        index
    }

    /// A memory store whose puts start failing once a write allowance is
    /// used up.
    #[derive(Debug)]
    struct FlakyStore {
        inner: MemoryByteStore,
        puts_left: AtomicUsize,
    }

    impl FlakyStore {
        fn failing_after(puts: usize) -> Self {
            FlakyStore {
                inner: MemoryByteStore::new(),
                puts_left: AtomicUsize::new(puts),
            }
        }

        fn heal(&self) {
            self.puts_left.store(usize::MAX, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ByteStore for FlakyStore {
        async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, ByteStoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &[u8], value: Bytes) -> Result<(), ByteStoreError> {
            if self
                .puts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return Err(ByteStoreError::Io {
                    path: format!("{key:?}"),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &[u8]) -> Result<bool, ByteStoreError> {
            self.inner.delete(key).await
        }

        async fn range_scan(
            &self,
            low: &[u8],
            high: &[u8],
        ) -> Result<Vec<(Vec<u8>, Bytes)>, ByteStoreError> {
            self.inner.range_scan(low, high).await
        }

        async fn prefix_scan(
            &self,
            prefix: &[u8],
        ) -> Result<Vec<(Vec<u8>, Bytes)>, ByteStoreError> {
            self.inner.prefix_scan(prefix).await
        }

        async fn scan_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, ByteStoreError> {
            self.inner.scan_keys(prefix).await
        }

        async fn size(&self) -> Result<usize, ByteStoreError> {
            self.inner.size().await
        }
    }

    fn distances(response: &SearchResponse<L1Vector>) -> Vec<i32> {
        response.results.iter().map(|e| e.distance).collect()
    }

    #[tokio::test]
    async fn test_search_requires_freeze() {
        let index = memory_index(BucketLayout::Sleek).await;
        index.insert(L1Vector(vec![1, 1])).await.unwrap();
        let err = index
            .search_exact(&SearchRequest::new(L1Vector(vec![0, 0]), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::NotReady));
        assert_eq!(err.code(), ErrorCodes::FailedPrecondition);
        assert!(matches!(index.calibrate().await, Err(IndexError::NotReady)));
        assert_eq!(index.bucket_count(), 0);
        assert!(index.distortion().is_empty());
    }

    #[tokio::test]
    async fn test_freeze_needs_enough_distinct_objects() {
        let index = memory_index(BucketLayout::Sleek).await;
        for _ in 0..20 {
            index.insert(L1Vector(vec![4, 4])).await.unwrap();
        }
        let err = index.freeze().await.unwrap_err();
        assert!(matches!(err, IndexError::PivotSelection(_)));
        assert!(!index.is_frozen());
    }

    #[tokio::test]
    async fn test_freeze_twice_fails() {
        let index = frozen_index(BucketLayout::Sleek, &random_vectors(30, 1)).await;
        assert!(matches!(index.freeze().await, Err(IndexError::AlreadyFrozen)));
    }

    #[tokio::test]
    async fn test_failed_freeze_can_be_retried() {
        let data = random_vectors(60, 21);
        let query = L1Vector(vec![50, 50]);
        for layout in [BucketLayout::Sleek, BucketLayout::Keyed] {
            let bucket_store = Arc::new(FlakyStore::failing_after(10));
            // Unseeded, so the retry picks different pivots.
            let index = index_with(
                IndexConfig {
                    pivot_seed: None,
                    ..config(layout)
                },
                bucket_store.clone(),
                Arc::new(MemoryByteStore::new()),
            )
            .await;
            for o in &data {
                index.insert(o.clone()).await.unwrap();
            }

            let err = index.freeze().await.unwrap_err();
            assert!(matches!(err, IndexError::Store(_)), "{layout:?}: {err:?}");
            assert!(!index.is_frozen());
            assert_eq!(bucket_store.size().await.unwrap(), 0);
            assert_eq!(index.len(), 60);
            assert!(index.exists(&data[59]).await.unwrap().is_some());

            bucket_store.heal();
            index.freeze().await.unwrap();
            let response = index
                .search_exact(&SearchRequest::new(query.clone(), 1000))
                .await
                .unwrap();
            let ids: HashSet<i64> = response.results.iter().map(|e| e.id).collect();
            assert_eq!(response.results.len(), 60);
            assert_eq!(ids.len(), 60);
            assert_eq!(index.len(), 60);
            assert_eq!(distances(&response), brute_force(&data, &query, 1000));
        }
    }

    #[tokio::test]
    async fn test_freeze_discards_buckets_of_an_unfinished_freeze() {
        let bucket_store: Arc<dyn ByteStore> = Arc::new(MemoryByteStore::new());
        let meta_store: Arc<dyn ByteStore> = Arc::new(MemoryByteStore::new());
        let stray = vec![0x0f, 0x01, 0xaa];
        bucket_store
            .put(&stray, Bytes::from_static(b"half a bucket"))
            .await
            .unwrap();

        let data = random_vectors(40, 22);
        let index = index_with(config(BucketLayout::Keyed), bucket_store.clone(), meta_store).await;
        for o in &data {
            index.insert(o.clone()).await.unwrap();
        }
        index.freeze().await.unwrap();
        assert_eq!(bucket_store.get(&stray).await.unwrap(), None);
        let response = index
            .search_exact(&SearchRequest::new(L1Vector(vec![0, 0]), 100))
            .await
            .unwrap();
        assert_eq!(response.results.len(), 40);
    }

    #[tokio::test]
    async fn test_exact_search_matches_brute_force() {
        let data = random_vectors(300, 2);
        for layout in [BucketLayout::Sleek, BucketLayout::Keyed] {
            let index = frozen_index(layout, &data).await;
            assert_eq!(index.len(), 300);
            assert!(index.bucket_count() > 1);
            for query in random_vectors(20, 3) {
                for k in [1, 7, 40] {
                    let response = index
                        .search_exact(&SearchRequest::new(query.clone(), k))
                        .await
                        .unwrap();
                    assert_eq!(distances(&response), brute_force(&data, &query, k));
                    assert!(!response.cancelled);
                }
            }
            assert_eq!(index.stats().queries, 60);
        }
    }

    #[tokio::test]
    async fn test_range_search_returns_everything_in_range() {
        let data = random_vectors(200, 4);
        let index = frozen_index(BucketLayout::Sleek, &data).await;
        let query = L1Vector(vec![50, 50]);
        let response = index
            .search_exact(&SearchRequest::new(query.clone(), data.len()).with_range(20))
            .await
            .unwrap();
        let mut expected: Vec<i32> = data
            .iter()
            .map(|o| o.distance(&query))
            .filter(|d| *d <= 20)
            .collect();
        expected.sort();
        assert_eq!(distances(&response), expected);
    }

    #[tokio::test]
    async fn test_filter_excludes_query() {
        let data = random_vectors(100, 5);
        let index = frozen_index(BucketLayout::Keyed, &data).await;
        let query = data[0].clone();
        let response = index
            .search_exact(
                &SearchRequest::new(query.clone(), 3).with_filter(Arc::new(NonEqualsFilter)),
            )
            .await
            .unwrap();
        assert_eq!(response.results.len(), 3);
        assert!(response.results.iter().all(|e| e.distance > 0));
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped_at_freeze() {
        let mut data = random_vectors(50, 6);
        data.push(data[3].clone());
        data.push(data[3].clone());
        let index = memory_index(BucketLayout::Sleek).await;
        for o in &data {
            index.insert(o.clone()).await.unwrap();
        }
        assert_eq!(index.len(), 52);
        assert_eq!(index.exists(&data[3]).await.unwrap(), Some(3));
        index.freeze().await.unwrap();

        let unique = {
            let mut seen: Vec<&L1Vector> = Vec::new();
            for o in &data {
                if !seen.iter().any(|s| s.distance(o) == 0) {
                    seen.push(o);
                }
            }
            seen.len() as u64
        };
        assert_eq!(index.len(), unique);
        assert_eq!(index.exists(&data[3]).await.unwrap(), Some(3));
        assert_eq!(
            index.insert(data[3].clone()).await.unwrap(),
            InsertStatus::AlreadyExists(3)
        );
    }

    #[tokio::test]
    async fn test_insert_delete_exists_in_both_modes() {
        let index = memory_index(BucketLayout::Keyed).await;
        let data = random_vectors(40, 7);
        for o in &data {
            index.insert(o.clone()).await.unwrap();
        }
        let staged = L1Vector(vec![500, 500]);
        assert_eq!(index.insert(staged.clone()).await.unwrap(), InsertStatus::Inserted(40));
        assert_eq!(index.delete(&staged).await.unwrap(), DeleteStatus::Removed(40));
        assert_eq!(index.delete(&staged).await.unwrap(), DeleteStatus::NotFound);
        assert_eq!(index.exists(&staged).await.unwrap(), None);

        index.freeze().await.unwrap();
        let before = index.len();
        let late = L1Vector(vec![-30, 7]);
        let InsertStatus::Inserted(id) = index.insert(late.clone()).await.unwrap() else {
            panic!("expected a fresh insert");
        };
        assert_eq!(id, 41);
        assert_eq!(index.len(), before + 1);
        assert_eq!(index.exists(&late).await.unwrap(), Some(41));
        let response = index
            .search_exact(&SearchRequest::new(late.clone(), 1))
            .await
            .unwrap();
        assert_eq!(response.results[0].id, 41);

        assert_eq!(index.delete(&late).await.unwrap(), DeleteStatus::Removed(41));
        assert_eq!(index.len(), before);
        assert_eq!(index.exists(&late).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_out_of_range_rejected() {
        let mut config = config(BucketLayout::Sleek);
        config.max_distance = Some(500.0);
        let index = index_with(
            config,
            Arc::new(MemoryByteStore::new()),
            Arc::new(MemoryByteStore::new()),
        )
        .await;
        for o in random_vectors(30, 8) {
            index.insert(o).await.unwrap();
        }
        index.freeze().await.unwrap();
        let far = L1Vector(vec![10_000, 0]);
        let err = index.insert(far.clone()).await.unwrap_err();
        assert!(matches!(err, IndexError::OutOfRange { max, .. } if max == 500.0));
        assert_eq!(err.code(), ErrorCodes::OutOfRange);
        assert!(matches!(
            index.search_exact(&SearchRequest::new(far, 1)).await,
            Err(IndexError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_search_returns_partial_results() {
        let index = frozen_index(BucketLayout::Sleek, &random_vectors(100, 9)).await;
        let token = CancellationToken::new();
        token.cancel();
        let response = index
            .search_exact(
                &SearchRequest::new(L1Vector(vec![1, 1]), 5).with_cancellation(token),
            )
            .await
            .unwrap();
        assert!(response.cancelled);
        assert_eq!(response.buckets_visited, 0);
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn test_calibration_drives_approximate_search() {
        let data = random_vectors(300, 10);
        let index = frozen_index(BucketLayout::Sleek, &data).await;
        let query = L1Vector(vec![33, 66]);

        // Without calibration the budget covers every bucket.
        let uncalibrated = index
            .search_approximate(&SearchRequest::new(query.clone(), 5))
            .await
            .unwrap();
        assert_eq!(distances(&uncalibrated), brute_force(&data, &query, 5));

        index.calibrate().await.unwrap();
        let state = index.calibration();
        assert_eq!(state.samples[&1].len(), 10);
        assert_eq!(state.samples[&5].len(), 10);
        assert!(state
            .samples
            .values()
            .flatten()
            .all(|n| *n >= 1 && *n <= index.bucket_count()));

        let response = index
            .search_approximate(&SearchRequest::new(query.clone(), 5))
            .await
            .unwrap();
        let budget = index.calibrator.estimate_budget(5, index.bucket_count());
        assert!(response.buckets_visited <= budget);
        assert!(response.results.len() <= 5);
        assert!(index.stats().extras.contains_key("calibration.k5.buckets"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calibrations_run_one_at_a_time() {
        let index = Arc::new(frozen_index(BucketLayout::Sleek, &random_vectors(200, 14)).await);
        let runs: Vec<_> = (0..4)
            .map(|_| {
                let index = index.clone();
                tokio::spawn(async move { index.calibrate().await })
            })
            .collect();
        for run in runs {
            run.await.unwrap().unwrap();
        }
        let state = index.calibration();
        assert_eq!(state.samples.len(), 2);
        assert!(state.samples.values().all(|v| v.len() == 10));
        assert_eq!(index.meta.calibration().await.unwrap(), state);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_persist_final_counters() {
        let data = random_vectors(120, 15);
        let index = Arc::new(frozen_index(BucketLayout::Keyed, &data[..40]).await);
        let writers: Vec<_> = data[40..]
            .chunks(10)
            .map(|chunk| {
                let index = index.clone();
                let chunk = chunk.to_vec();
                tokio::spawn(async move {
                    for o in chunk {
                        index.insert(o).await.unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        assert_eq!(index.len(), 120);
        assert_eq!(index.meta.len().await.unwrap(), 120);
        assert_eq!(index.meta.next_id().await.unwrap(), 120);
    }

    #[tokio::test]
    async fn test_reopen_restores_index() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let mut sketchdb = SketchDbConfig {
            index: config(BucketLayout::Sleek),
            ..Default::default()
        };
        sketchdb.bucket_store = sketchdb_blockstore::ByteStoreConfig::Local(LocalByteStoreConfig {
            root: format!("{root}/buckets"),
        });
        sketchdb.meta_store = sketchdb_blockstore::ByteStoreConfig::Local(LocalByteStoreConfig {
            root: format!("{root}/meta"),
        });

        let data = random_vectors(120, 12);
        let query = L1Vector(vec![10, 90]);
        let (expected, len, buckets, calibration) = {
            let index = SketchIndex::<L1Vector>::try_from_config(&sketchdb)
                .await
                .unwrap();
            for o in &data {
                index.insert(o.clone()).await.unwrap();
            }
            index.freeze().await.unwrap();
            index.calibrate().await.unwrap();
            let response = index
                .search_exact(&SearchRequest::new(query.clone(), 10))
                .await
                .unwrap();
            (
                distances(&response),
                index.len(),
                index.bucket_count(),
                index.calibration(),
            )
        };

        let index = SketchIndex::<L1Vector>::try_from_config(&sketchdb)
            .await
            .unwrap();
        assert!(index.is_frozen());
        assert_eq!(index.len(), len);
        assert_eq!(index.bucket_count(), buckets);
        assert_eq!(index.calibration(), calibration);
        let response = index
            .search_exact(&SearchRequest::new(query, 10))
            .await
            .unwrap();
        assert_eq!(distances(&response), expected);
        let InsertStatus::Inserted(id) = index.insert(L1Vector(vec![-5, -5])).await.unwrap() else {
            panic!("expected a fresh insert");
        };
        assert_eq!(id, 120);
    }

    #[tokio::test]
    async fn test_reopen_with_other_shape_fails() {
        let bucket_store: Arc<dyn ByteStore> = Arc::new(MemoryByteStore::new());
        let meta_store: Arc<dyn ByteStore> = Arc::new(MemoryByteStore::new());
        index_with(config(BucketLayout::Sleek), bucket_store.clone(), meta_store.clone()).await;
        let selector = Arc::new(RandomPivotSelector::new(None));
        let err = SketchIndex::<L1Vector>::open(
            config(BucketLayout::Keyed),
            bucket_store.clone(),
            meta_store.clone(),
            selector.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IndexError::InvalidConfig(_)));
        let err = SketchIndex::<L1Vector>::new(
            config(BucketLayout::Sleek),
            bucket_store,
            meta_store,
            selector,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IndexError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_edit_strings() {
        let words = [
            "kitten", "sitting", "mitten", "bitten", "sitter", "knitting", "written", "smitten",
            "fitting", "hitting", "kitchen", "mittens",
        ];
        let mut config = config(BucketLayout::Keyed);
        config.sketch_bits = 2;
        let index: SketchIndex<EditString> = SketchIndex::new(
            config,
            Arc::new(MemoryByteStore::new()),
            Arc::new(MemoryByteStore::new()),
            Arc::new(RandomPivotSelector::new(Some(5))),
        )
        .await
        .unwrap();
        for w in words {
            index.insert(EditString(w.to_string())).await.unwrap();
        }
        index.freeze().await.unwrap();
        let response = index
            .search_exact(&SearchRequest::new(EditString("sitten".to_string()), 3))
            .await
            .unwrap();
        let found: Vec<i32> = response.results.iter().map(|e| e.distance).collect();
        assert_eq!(found, vec![1, 1, 1]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn test_exact_search_is_complete(
            points in proptest::collection::vec((-50i16..50, -50i16..50), 12..80),
            query in (-60i16..60, -60i16..60),
            k in 1usize..15,
            keyed in any::<bool>(),
        ) {
            let data: Vec<L1Vector> = points.iter().map(|(x, y)| L1Vector(vec![*x, *y])).collect();
            let query = L1Vector(vec![query.0, query.1]);
            let layout = if keyed { BucketLayout::Keyed } else { BucketLayout::Sleek };
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let got = runtime.block_on(async {
                let index = memory_index(layout).await;
                for o in &data {
                    index.insert(o.clone()).await.unwrap();
                }
                if index.freeze().await.is_err() {
                    // Too few distinct points for eight pivots.
                    return None;
                }
                let response = index
                    .search_exact(&SearchRequest::new(query.clone(), k))
                    .await
                    .unwrap();
                Some(distances(&response))
            });
            if let Some(got) = got {
                let mut unique: Vec<&L1Vector> = Vec::new();
                for o in &data {
                    if !unique.iter().any(|u| u.distance(o) == 0) {
                        unique.push(o);
                    }
                }
                let unique: Vec<L1Vector> = unique.into_iter().cloned().collect();
                prop_assert_eq!(got, brute_force(&unique, &query, k));
            }
        }
    }
}
