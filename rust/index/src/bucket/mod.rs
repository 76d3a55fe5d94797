mod codec;
mod sleek;

pub use codec::{length_prefix_width, BucketCodecError};
pub use sleek::SleekBucket;

use crate::filter::Filter;
use crate::result_queue::ResultQueue;
use crate::stats::Statistics;
use sketchdb_distance::{Distance, MetricObject};
use std::cmp::Ordering;

/// One indexed record: its identity, the distances to the bucket's local
/// pivots (empty for the pivots themselves) and the object.
#[derive(Clone, Debug)]
pub struct BucketObject<O: MetricObject> {
    pub id: i64,
    pub smap: Vec<O::Distance>,
    pub object: O,
}

impl<O: MetricObject> BucketObject<O> {
    pub fn new(id: i64, smap: Vec<O::Distance>, object: O) -> Self {
        BucketObject { id, smap, object }
    }

    /// L-infinity distance between two SMAP vectors. By the triangle
    /// inequality this never exceeds the true distance of the objects.
    pub fn l_inf(&self, query_smap: &[O::Distance]) -> O::Distance {
        self.smap
            .iter()
            .zip(query_smap)
            .fold(O::Distance::ZERO, |acc, (m, q)| {
                acc.max_by_total(m.abs_diff(*q))
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertStatus {
    Inserted(i64),
    AlreadyExists(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteStatus {
    Removed(i64),
    NotFound,
}

/// Scores a local pivot against the query: counts the distance, offers the
/// pivot to the collector when it is in range and returns the distance for
/// the query's SMAP vector.
pub(crate) fn match_pivot<O: MetricObject>(
    pivot: &BucketObject<O>,
    query: &O,
    range: O::Distance,
    filter: Option<&dyn Filter<O>>,
    collector: &mut ResultQueue<O>,
    stats: &Statistics,
) -> O::Distance {
    let distance = query.distance(&pivot.object);
    stats.inc_distance_computations();
    if distance.total_cmp(&range) != Ordering::Greater
        && filter.map_or(true, |f| f.accept(&pivot.object, query))
    {
        collector.add(pivot.id, pivot.object.clone(), distance);
    }
    distance
}

/// Scores a bucket member. The true distance is only computed when the SMAP
/// lower bound leaves a chance of entering the collector.
pub(crate) fn match_member<O: MetricObject>(
    member: &BucketObject<O>,
    query: &O,
    query_smap: &[O::Distance],
    range: O::Distance,
    filter: Option<&dyn Filter<O>>,
    collector: &mut ResultQueue<O>,
    stats: &Statistics,
) {
    let lower_bound = member.l_inf(query_smap);
    stats.inc_smap_comparisons();
    if lower_bound.total_cmp(&range) == Ordering::Greater || !collector.is_candidate(lower_bound) {
        return;
    }
    if !filter.map_or(true, |f| f.accept(&member.object, query)) {
        return;
    }
    let distance = query.distance(&member.object);
    stats.inc_distance_computations();
    if distance.total_cmp(&range) != Ordering::Greater {
        collector.add(member.id, member.object.clone(), distance);
    }
}
