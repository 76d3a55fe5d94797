pub mod distance;
pub mod numeric;
pub mod object;

pub use numeric::Distance;
pub use object::{EditString, EuclideanVector, L1Vector, MetricObject, ObjectCodecError};
