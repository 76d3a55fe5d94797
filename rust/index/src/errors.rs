use crate::bucket::BucketCodecError;
use crate::pivots::PivotSelectionError;
use crate::repository::BucketRepositoryError;
use crate::sketch::SketchAddress;
use sketchdb_blockstore::ByteStoreError;
use sketchdb_error::{ErrorCodes, SketchDbError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index is not frozen yet")]
    NotReady,
    #[error("Index is already frozen")]
    AlreadyFrozen,
    #[error("Identity {0} is duplicated or missing")]
    DuplicateOrMissingIdentity(i64),
    #[error("Distance {distance} exceeds the configured maximum {max}")]
    OutOfRange { distance: f64, max: f64 },
    #[error("Bucket {address} is corrupt: {source}")]
    Corrupt {
        address: SketchAddress,
        #[source]
        source: BucketCodecError,
    },
    #[error("Bucket {address} cannot be encoded: {source}")]
    Encode {
        address: SketchAddress,
        #[source]
        source: BucketCodecError,
    },
    #[error("Byte store error: {0}")]
    Store(#[from] ByteStoreError),
    #[error("Pivot selection failed: {0}")]
    PivotSelection(#[from] PivotSelectionError),
    #[error("Invalid index config: {0}")]
    InvalidConfig(String),
    #[error("Invalid index metadata: {0}")]
    Metadata(String),
}

/// Errors surfaced by queries.
pub type SearchError = IndexError;

impl SketchDbError for IndexError {
    fn code(&self) -> ErrorCodes {
        match self {
            IndexError::NotReady => ErrorCodes::FailedPrecondition,
            IndexError::AlreadyFrozen => ErrorCodes::FailedPrecondition,
            IndexError::DuplicateOrMissingIdentity(_) => ErrorCodes::Internal,
            IndexError::OutOfRange { .. } => ErrorCodes::OutOfRange,
            IndexError::Corrupt { .. } => ErrorCodes::DataLoss,
            IndexError::Encode { source, .. } => source.code(),
            IndexError::Store(e) => e.code(),
            IndexError::PivotSelection(e) => e.code(),
            IndexError::InvalidConfig(_) => ErrorCodes::InvalidArgument,
            IndexError::Metadata(_) => ErrorCodes::DataLoss,
        }
    }
}

impl From<BucketRepositoryError> for IndexError {
    fn from(e: BucketRepositoryError) -> Self {
        match e {
            BucketRepositoryError::Store(e) => IndexError::Store(e),
            BucketRepositoryError::Corrupt { address, source } => {
                IndexError::Corrupt { address, source }
            }
            BucketRepositoryError::Encode { address, source } => {
                IndexError::Encode { address, source }
            }
        }
    }
}
