use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Work counters for queries and calibration.
///
/// Passed by reference into every bucket scan. Counters are atomics so a
/// shared instance can be updated from concurrent queries; named extras keep
/// a running summary of arbitrary measurements.
#[derive(Debug, Default)]
pub struct Statistics {
    distance_computations: AtomicU64,
    smap_comparisons: AtomicU64,
    buckets_read: AtomicU64,
    bytes_read: AtomicU64,
    queries: AtomicU64,
    extras: Mutex<BTreeMap<String, ExtraStatistic>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtraStatistic {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl ExtraStatistic {
    fn new(value: f64) -> Self {
        ExtraStatistic {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn merge(&mut self, other: &ExtraStatistic) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub distance_computations: u64,
    pub smap_comparisons: u64,
    pub buckets_read: u64,
    pub bytes_read: u64,
    pub queries: u64,
    pub extras: BTreeMap<String, ExtraStatistic>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_distance_computations(&self) {
        self.distance_computations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_smap_comparisons(&self) {
        self.smap_comparisons.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_buckets_read(&self) {
        self.buckets_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_queries(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_extra(&self, name: &str, value: f64) {
        let mut extras = self.extras.lock();
        match extras.get_mut(name) {
            Some(stat) => stat.merge(&ExtraStatistic::new(value)),
            None => {
                extras.insert(name.to_string(), ExtraStatistic::new(value));
            }
        }
    }

    /// Folds a finished query's counters into this one.
    pub fn absorb(&self, other: &StatisticsSnapshot) {
        self.distance_computations
            .fetch_add(other.distance_computations, Ordering::Relaxed);
        self.smap_comparisons
            .fetch_add(other.smap_comparisons, Ordering::Relaxed);
        self.buckets_read
            .fetch_add(other.buckets_read, Ordering::Relaxed);
        self.bytes_read.fetch_add(other.bytes_read, Ordering::Relaxed);
        self.queries.fetch_add(other.queries, Ordering::Relaxed);
        let mut extras = self.extras.lock();
        for (name, stat) in &other.extras {
            match extras.get_mut(name) {
                Some(existing) => existing.merge(stat),
                None => {
                    extras.insert(name.clone(), *stat);
                }
            }
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            distance_computations: self.distance_computations.load(Ordering::Relaxed),
            smap_comparisons: self.smap_comparisons.load(Ordering::Relaxed),
            buckets_read: self.buckets_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            extras: self.extras.lock().clone(),
        }
    }

    pub fn reset(&self) {
        self.distance_computations.store(0, Ordering::Relaxed);
        self.smap_comparisons.store(0, Ordering::Relaxed);
        self.buckets_read.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.queries.store(0, Ordering::Relaxed);
        self.extras.lock().clear();
    }
}
