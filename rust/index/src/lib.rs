pub mod bucket;
pub mod calibrator;
pub mod config;
mod errors;
pub mod filter;
mod index;
mod meta;
pub mod pivots;
pub mod repository;
pub mod result_queue;
pub mod sketch;
pub mod stats;

// Re-export types

pub use bucket::{BucketObject, DeleteStatus, InsertStatus, SleekBucket};
pub use calibrator::{BudgetStatistic, CalibrationConfig, CalibrationState, Calibrator};
pub use config::{BucketLayout, IndexConfig, SketchDbConfig};
pub use errors::{IndexError, SearchError};
pub use filter::{Filter, NonEqualsFilter};
pub use index::{SearchRequest, SearchResponse, SketchIndex};
pub use meta::IndexFingerprint;
pub use pivots::{PivotSelectionError, PivotSelector, RandomPivotSelector};
pub use repository::{BucketRepository, KeyedBucketRepository, SleekBucketRepository};
pub use result_queue::{ResultEntry, ResultQueue};
pub use sketch::{BitDistortion, SketchAddress, SketchEngine, SketchProjection};
pub use stats::{Statistics, StatisticsSnapshot};
