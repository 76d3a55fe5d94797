use sketchdb_distance::{Distance, MetricObject};

/// Decides whether a stored object may be returned for a query. Filters run
/// before the true distance is computed, so a rejected object costs nothing.
pub trait Filter<O>: Send + Sync {
    fn accept(&self, candidate: &O, query: &O) -> bool;
}

impl<O, F> Filter<O> for F
where
    F: Fn(&O, &O) -> bool + Send + Sync,
{
    fn accept(&self, candidate: &O, query: &O) -> bool {
        self(candidate, query)
    }
}

/// Rejects objects at distance zero from the query, i.e. the query itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct NonEqualsFilter;

impl<O: MetricObject> Filter<O> for NonEqualsFilter {
    fn accept(&self, candidate: &O, query: &O) -> bool {
        candidate.distance(query) != O::Distance::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sketchdb_distance::L1Vector;

    #[test]
    fn test_non_equals_filter() {
        let query = L1Vector(vec![1, 2]);
        assert!(!NonEqualsFilter.accept(&L1Vector(vec![1, 2]), &query));
        assert!(NonEqualsFilter.accept(&L1Vector(vec![1, 3]), &query));
    }

    #[test]
    fn test_closure_filter() {
        let even_first = |candidate: &L1Vector, _: &L1Vector| candidate.0[0] % 2 == 0;
        let query = L1Vector(vec![0]);
        assert!(even_first.accept(&L1Vector(vec![4]), &query));
        assert!(!even_first.accept(&L1Vector(vec![3]), &query));
    }
}
