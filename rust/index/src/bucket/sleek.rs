use super::codec;
use super::{match_member, match_pivot, BucketCodecError, BucketObject, DeleteStatus, InsertStatus};
use crate::filter::Filter;
use crate::result_queue::ResultQueue;
use crate::stats::Statistics;
use bytes::Bytes;
use sketchdb_distance::{Distance, MetricObject};

/// All records sharing one sketch address.
///
/// The first `pivot_count` objects inserted become the bucket's local pivots;
/// every later object stores its distances to those pivots (its SMAP vector)
/// so a query can bound its distance to the object without computing it.
/// Local pivots only change when one of them is deleted, which rebuilds the
/// bucket from scratch.
#[derive(Clone, Debug)]
pub struct SleekBucket<O: MetricObject> {
    pivot_count: usize,
    pivots: Vec<BucketObject<O>>,
    members: Vec<BucketObject<O>>,
    modified: bool,
}

impl<O: MetricObject> SleekBucket<O> {
    pub fn new(pivot_count: usize) -> Self {
        SleekBucket {
            pivot_count,
            pivots: Vec::with_capacity(pivot_count),
            members: Vec::new(),
            modified: false,
        }
    }

    pub(crate) fn from_parts(
        pivot_count: usize,
        pivots: Vec<BucketObject<O>>,
        members: Vec<BucketObject<O>>,
    ) -> Self {
        SleekBucket {
            pivot_count,
            pivots,
            members,
            modified: false,
        }
    }

    pub fn pivot_count(&self) -> usize {
        self.pivot_count
    }

    pub fn len(&self) -> usize {
        self.pivots.len() + self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the bucket changed since it was parsed or last marked clean.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn mark_clean(&mut self) {
        self.modified = false;
    }

    pub fn pivots(&self) -> &[BucketObject<O>] {
        &self.pivots
    }

    pub fn members(&self) -> &[BucketObject<O>] {
        &self.members
    }

    /// Pivots first, then members.
    pub fn records(&self) -> impl Iterator<Item = &BucketObject<O>> {
        self.pivots.iter().chain(self.members.iter())
    }

    /// Identity of a stored object at distance zero from `object`.
    pub fn exists(&self, object: &O) -> Option<i64> {
        self.records()
            .find(|r| r.object.distance(object) == O::Distance::ZERO)
            .map(|r| r.id)
    }

    pub fn insert(&mut self, id: i64, object: O) -> InsertStatus {
        if let Some(existing) = self.exists(&object) {
            return InsertStatus::AlreadyExists(existing);
        }
        self.insert_unchecked(id, object);
        InsertStatus::Inserted(id)
    }

    fn insert_unchecked(&mut self, id: i64, object: O) {
        if self.pivots.len() < self.pivot_count {
            self.pivots.push(BucketObject::new(id, Vec::new(), object));
        } else {
            let smap = self
                .pivots
                .iter()
                .map(|p| object.distance(&p.object))
                .collect();
            self.members.push(BucketObject::new(id, smap, object));
        }
        self.modified = true;
    }

    pub fn delete(&mut self, object: &O) -> DeleteStatus {
        let is_match = |r: &BucketObject<O>| r.object.distance(object) == O::Distance::ZERO;
        if let Some(pos) = self.pivots.iter().position(is_match) {
            let removed = self.pivots.remove(pos);
            let survivors: Vec<BucketObject<O>> = std::mem::take(&mut self.pivots)
                .into_iter()
                .chain(std::mem::take(&mut self.members))
                .collect();
            for record in survivors {
                self.insert_unchecked(record.id, record.object);
            }
            self.modified = true;
            return DeleteStatus::Removed(removed.id);
        }
        if let Some(pos) = self.members.iter().position(is_match) {
            let removed = self.members.remove(pos);
            self.modified = true;
            return DeleteStatus::Removed(removed.id);
        }
        DeleteStatus::NotFound
    }

    /// Offers every record within `range` of `query` to `collector`.
    pub fn search(
        &self,
        query: &O,
        range: O::Distance,
        filter: Option<&dyn Filter<O>>,
        collector: &mut ResultQueue<O>,
        stats: &Statistics,
    ) {
        let query_smap: Vec<O::Distance> = self
            .pivots
            .iter()
            .map(|p| match_pivot(p, query, range, filter, collector, stats))
            .collect();
        for member in &self.members {
            match_member(member, query, &query_smap, range, filter, collector, stats);
        }
    }

    pub fn serialize(&self) -> Result<Bytes, BucketCodecError> {
        codec::encode(self)
    }

    pub fn parse(pivot_count: usize, data: &[u8]) -> Result<Self, BucketCodecError> {
        codec::decode(pivot_count, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sketchdb_distance::L1Vector;

    fn v(values: &[i16]) -> L1Vector {
        L1Vector(values.to_vec())
    }

    #[test]
    fn test_first_inserts_become_pivots() {
        let mut bucket = SleekBucket::new(2);
        assert_eq!(bucket.insert(1, v(&[0, 0])), InsertStatus::Inserted(1));
        assert_eq!(bucket.insert(2, v(&[10, 0])), InsertStatus::Inserted(2));
        assert_eq!(bucket.insert(3, v(&[3, 4])), InsertStatus::Inserted(3));
        assert_eq!(bucket.pivots().len(), 2);
        assert_eq!(bucket.members().len(), 1);
        assert!(bucket.pivots().iter().all(|p| p.smap.is_empty()));
        assert_eq!(bucket.members()[0].smap, vec![7, 11]);
        assert_eq!(bucket.len(), 3);
        assert!(bucket.is_modified());
    }

    #[test]
    fn test_distance_zero_is_a_duplicate() {
        let mut bucket = SleekBucket::new(1);
        bucket.insert(1, v(&[5, 5]));
        bucket.insert(2, v(&[6, 5]));
        assert_eq!(bucket.insert(3, v(&[5, 5])), InsertStatus::AlreadyExists(1));
        assert_eq!(bucket.insert(4, v(&[6, 5])), InsertStatus::AlreadyExists(2));
        assert_eq!(bucket.exists(&v(&[6, 5])), Some(2));
        assert_eq!(bucket.exists(&v(&[7, 5])), None);
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn test_duplicate_of_member_behind_three_pivots() {
        let mut bucket = SleekBucket::new(3);
        bucket.insert(1, v(&[0]));
        bucket.insert(2, v(&[7]));
        bucket.insert(3, v(&[3]));
        assert_eq!(bucket.insert(4, v(&[2])), InsertStatus::Inserted(4));
        assert_eq!(bucket.members()[0].smap, vec![2, 5, 1]);

        let y = v(&[2]);
        assert_eq!(bucket.exists(&y), Some(4));
        assert_eq!(bucket.insert(5, y), InsertStatus::AlreadyExists(4));
        assert_eq!(bucket.len(), 4);
    }

    #[test]
    fn test_delete_member_keeps_pivots() {
        let mut bucket = SleekBucket::new(1);
        bucket.insert(1, v(&[0]));
        bucket.insert(2, v(&[4]));
        bucket.insert(3, v(&[9]));
        bucket.mark_clean();
        assert_eq!(bucket.delete(&v(&[4])), DeleteStatus::Removed(2));
        assert!(bucket.is_modified());
        assert_eq!(bucket.pivots()[0].id, 1);
        assert_eq!(bucket.members().len(), 1);
        assert_eq!(bucket.delete(&v(&[4])), DeleteStatus::NotFound);
    }

    #[test]
    fn test_delete_pivot_rebuilds() {
        let mut bucket = SleekBucket::new(1);
        bucket.insert(1, v(&[0]));
        bucket.insert(2, v(&[4]));
        bucket.insert(3, v(&[9]));
        assert_eq!(bucket.delete(&v(&[0])), DeleteStatus::Removed(1));
        // The oldest survivor is promoted and the rest re-measured against it.
        assert_eq!(bucket.pivots()[0].id, 2);
        assert_eq!(bucket.members().len(), 1);
        assert_eq!(bucket.members()[0].id, 3);
        assert_eq!(bucket.members()[0].smap, vec![5]);
    }

    #[test]
    fn test_pivots_outside_range_are_not_collected() {
        let mut bucket = SleekBucket::new(2);
        bucket.insert(1, v(&[0]));
        bucket.insert(2, v(&[100]));
        let stats = Statistics::new();
        let mut collector = ResultQueue::new(10);
        bucket.search(&v(&[1]), 5, None, &mut collector, &stats);
        let ids: Vec<i64> = collector.sorted_results().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1]);
        assert_eq!(stats.snapshot().distance_computations, 2);
    }

    proptest! {
        #[test]
        fn test_search_matches_brute_force(
            pivot_count in 0usize..4,
            objects in proptest::collection::vec(
                proptest::collection::vec(-50i16..50, 3), 1..40),
            query in proptest::collection::vec(-50i16..50, 3),
            range in 0i32..200,
        ) {
            let mut bucket = SleekBucket::new(pivot_count);
            for (id, o) in objects.iter().enumerate() {
                bucket.insert(id as i64, L1Vector(o.clone()));
            }
            let query = L1Vector(query);
            let stats = Statistics::new();
            let mut collector = ResultQueue::new(objects.len());
            bucket.search(&query, range, None, &mut collector, &stats);

            let mut expected: Vec<i64> = bucket
                .records()
                .filter(|r| r.object.distance(&query) <= range)
                .map(|r| r.id)
                .collect();
            expected.sort();
            let mut got: Vec<i64> = collector.sorted_results().iter().map(|e| e.id).collect();
            got.sort();
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn test_knn_search_matches_brute_force(
            objects in proptest::collection::vec(
                proptest::collection::vec(-50i16..50, 2), 1..40),
            query in proptest::collection::vec(-50i16..50, 2),
            k in 1usize..6,
        ) {
            let mut bucket = SleekBucket::new(2);
            for (id, o) in objects.iter().enumerate() {
                bucket.insert(id as i64, L1Vector(o.clone()));
            }
            let query = L1Vector(query);
            let mut collector = ResultQueue::new(k);
            bucket.search(&query, i32::MAX, None, &mut collector, &Statistics::new());

            let mut truth: Vec<i32> = bucket.records().map(|r| r.object.distance(&query)).collect();
            truth.sort();
            truth.truncate(k);
            let got: Vec<i32> = collector.sorted_results().iter().map(|e| e.distance).collect();
            prop_assert_eq!(got, truth);
        }
    }
}
