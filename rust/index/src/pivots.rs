use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sketchdb_distance::{Distance, MetricObject};
use sketchdb_error::{ErrorCodes, SketchDbError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PivotSelectionError {
    #[error("Need {requested} distinct pivots but only {available} distinct objects exist")]
    InsufficientObjects { requested: usize, available: usize },
}

impl SketchDbError for PivotSelectionError {
    fn code(&self) -> ErrorCodes {
        match self {
            PivotSelectionError::InsufficientObjects { .. } => ErrorCodes::FailedPrecondition,
        }
    }
}

/// Chooses reference objects for the sketch.
pub trait PivotSelector<O>: Send + Sync {
    /// Returns `count` ids taken from `candidates`.
    fn select_pivots(
        &self,
        count: usize,
        candidates: &[(i64, O)],
    ) -> Result<Vec<i64>, PivotSelectionError>;
}

/// Picks pivots uniformly at random, skipping objects at distance zero from
/// an already chosen pivot. Deterministic when seeded.
#[derive(Clone, Debug, Default)]
pub struct RandomPivotSelector {
    seed: Option<u64>,
}

impl RandomPivotSelector {
    pub fn new(seed: Option<u64>) -> Self {
        RandomPivotSelector { seed }
    }
}

impl<O: MetricObject> PivotSelector<O> for RandomPivotSelector {
    fn select_pivots(
        &self,
        count: usize,
        candidates: &[(i64, O)],
    ) -> Result<Vec<i64>, PivotSelectionError> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.shuffle(&mut rng);

        let mut chosen: Vec<&(i64, O)> = Vec::with_capacity(count);
        for i in order {
            if chosen.len() == count {
                break;
            }
            let candidate = &candidates[i];
            let duplicate = chosen
                .iter()
                .any(|(_, pivot)| pivot.distance(&candidate.1) == O::Distance::ZERO);
            if !duplicate {
                chosen.push(candidate);
            }
        }
        if chosen.len() < count {
            return Err(PivotSelectionError::InsufficientObjects {
                requested: count,
                available: chosen.len(),
            });
        }
        Ok(chosen.into_iter().map(|(id, _)| *id).collect())
    }
}
