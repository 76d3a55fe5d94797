use crate::result_queue::ResultQueue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sketchdb_distance::MetricObject;
use std::collections::BTreeMap;

fn default_user_k() -> Vec<usize> {
    vec![1, 10]
}

fn default_expected_ep() -> f64 {
    0.0001
}

fn default_sample_size() -> usize {
    100
}

/// How the recorded samples of one k are summarized into a bucket budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatistic {
    #[default]
    Mean,
    Max,
    /// Nearest-rank percentile, in `0..=100`.
    Percentile(f64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// The k values approximate queries are calibrated for.
    #[serde(default = "default_user_k")]
    pub user_k: Vec<usize>,
    /// Target error on position.
    #[serde(default = "default_expected_ep")]
    pub expected_ep: f64,
    /// Database objects used as calibration queries.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default)]
    pub statistic: BudgetStatistic,
    /// Seed for sampling calibration queries. Random when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            user_k: default_user_k(),
            expected_ep: default_expected_ep(),
            sample_size: default_sample_size(),
            statistic: BudgetStatistic::default(),
            seed: None,
        }
    }
}

/// Buckets scanned before reaching the target accuracy, per k. This is what
/// gets persisted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub samples: BTreeMap<usize, Vec<usize>>,
}

impl CalibrationState {
    pub fn record(&mut self, k: usize, good_bucket_count: usize) {
        self.samples.entry(k).or_default().push(good_bucket_count);
    }
}

/// Learns how many buckets an approximate query has to read.
#[derive(Debug)]
pub struct Calibrator {
    config: CalibrationConfig,
    state: RwLock<CalibrationState>,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self::with_state(config, CalibrationState::default())
    }

    pub fn with_state(config: CalibrationConfig, state: CalibrationState) -> Self {
        Calibrator {
            config,
            state: RwLock::new(state),
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn state(&self) -> CalibrationState {
        self.state.read().clone()
    }

    /// Replaces every earlier sample with `state` in one step.
    pub fn install(&self, state: CalibrationState) {
        *self.state.write() = state;
    }

    /// Bucket budget for a k-nearest query.
    ///
    /// Uses the samples of the smallest calibrated k not below `k`, or of the
    /// largest calibrated k when `k` exceeds them all. Without any sample the
    /// budget is every bucket.
    pub fn estimate_budget(&self, k: usize, total_buckets: usize) -> usize {
        let state = self.state.read();
        let samples = state
            .samples
            .range(k..)
            .find(|(_, s)| !s.is_empty())
            .or_else(|| state.samples.iter().rev().find(|(_, s)| !s.is_empty()))
            .map(|(_, s)| s);
        let Some(samples) = samples else {
            return total_buckets;
        };
        let budget = match self.config.statistic {
            BudgetStatistic::Mean => {
                let sum: usize = samples.iter().sum();
                sum.div_ceil(samples.len())
            }
            BudgetStatistic::Max => samples.iter().copied().max().unwrap_or(total_buckets),
            BudgetStatistic::Percentile(p) => {
                let mut sorted = samples.clone();
                sorted.sort_unstable();
                let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
                sorted[rank.clamp(1, sorted.len()) - 1]
            }
        };
        budget.max(1)
    }
}

/// Tracks one calibration query for one k while buckets are scanned in
/// sketch order.
#[derive(Debug)]
pub struct CalibrationRun<'a, D> {
    ground_truth: &'a [D],
    database_size: usize,
    expected_ep: f64,
    buckets_scanned: usize,
    ep: f64,
}

impl<'a, D> CalibrationRun<'a, D> {
    /// `ground_truth` holds the sorted distances from the query to the whole
    /// database.
    pub fn new(ground_truth: &'a [D], database_size: usize, expected_ep: f64) -> Self {
        CalibrationRun {
            ground_truth,
            database_size,
            expected_ep,
            buckets_scanned: 0,
            ep: 1.0,
        }
    }

    /// Call after each scanned bucket. Returns the number of buckets scanned
    /// once the queue first reaches the expected accuracy.
    pub fn observe<O>(&mut self, queue: &ResultQueue<O>) -> Option<usize>
    where
        O: MetricObject<Distance = D>,
    {
        self.buckets_scanned += 1;
        if queue.is_full() {
            self.ep = queue.error_of_position(self.ground_truth, self.database_size);
        }
        if self.ep <= self.expected_ep {
            Some(self.buckets_scanned)
        } else {
            None
        }
    }

    pub fn last_ep(&self) -> f64 {
        self.ep
    }
}
