use sketchdb_distance::{Distance, MetricObject};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One match returned by a query.
#[derive(Clone, Debug)]
pub struct ResultEntry<O: MetricObject> {
    pub id: i64,
    pub object: O,
    pub distance: O::Distance,
}

// Entries order by distance, ties broken by id, so equal-distance results
// come out in a deterministic order.
impl<O: MetricObject> Ord for ResultEntry<O> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl<O: MetricObject> PartialOrd for ResultEntry<O> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<O: MetricObject> PartialEq for ResultEntry<O> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<O: MetricObject> Eq for ResultEntry<O> {}

/// Keeps the best `k` results seen so far.
///
/// Backed by a max-heap so the current worst result is always at the top;
/// that value is what the search uses to shrink its range.
#[derive(Clone, Debug)]
pub struct ResultQueue<O: MetricObject> {
    k: usize,
    heap: BinaryHeap<ResultEntry<O>>,
}

impl<O: MetricObject> ResultQueue<O> {
    pub fn new(k: usize) -> Self {
        ResultQueue {
            k,
            heap: BinaryHeap::with_capacity(k.min(1024)),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Distance of the worst result currently kept.
    pub fn worst(&self) -> Option<O::Distance> {
        self.heap.peek().map(|e| e.distance)
    }

    /// Offers a result. Returns whether it was kept.
    pub fn add(&mut self, id: i64, object: O, distance: O::Distance) -> bool {
        if self.k == 0 {
            return false;
        }
        if self.heap.len() < self.k {
            self.heap.push(ResultEntry {
                id,
                object,
                distance,
            });
            return true;
        }
        match self.worst() {
            Some(worst) if distance.total_cmp(&worst) == Ordering::Less => {
                self.heap.pop();
                self.heap.push(ResultEntry {
                    id,
                    object,
                    distance,
                });
                true
            }
            _ => false,
        }
    }

    /// Whether an object at `distance` (or a lower bound of it) could still
    /// enter the queue.
    pub fn is_candidate(&self, distance: O::Distance) -> bool {
        if self.heap.len() < self.k {
            return true;
        }
        match self.worst() {
            Some(worst) => distance.total_cmp(&worst) == Ordering::Less,
            None => false,
        }
    }

    /// Tightens a search range: once the queue is full nothing farther than
    /// the current worst result can matter.
    pub fn update_range(&self, range: O::Distance) -> O::Distance {
        match self.worst() {
            Some(worst) if self.is_full() => range.min_by_total(worst),
            _ => range,
        }
    }

    /// Snapshot of the results, closest first.
    pub fn sorted_results(&self) -> Vec<ResultEntry<O>> {
        self.heap.clone().into_sorted_vec()
    }

    pub fn into_sorted_results(self) -> Vec<ResultEntry<O>> {
        self.heap.into_sorted_vec()
    }

    /// Error on position of the current results against the sorted distances
    /// of the true nearest neighbors.
    ///
    /// Each result is matched with the first not yet used ground truth slot of
    /// equal distance; the sum of position shifts is normalized by the number
    /// of results and the database size. Results with no matching slot
    /// contribute nothing. Zero for an empty queue.
    pub fn error_of_position(&self, ground_truth: &[O::Distance], database_size: usize) -> f64 {
        let results = self.sorted_results();
        if results.is_empty() || database_size == 0 {
            return 0.0;
        }
        let mut used = vec![false; ground_truth.len()];
        let mut shift: i64 = 0;
        for (position, result) in results.iter().enumerate() {
            let slot = ground_truth.iter().enumerate().position(|(cx, truth)| {
                !used[cx] && truth.total_cmp(&result.distance) == Ordering::Equal
            });
            if let Some(cx) = slot {
                used[cx] = true;
                shift += cx as i64 - position as i64;
            }
        }
        shift as f64 / (results.len() as f64 * database_size as f64)
    }
}
