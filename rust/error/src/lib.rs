// A small set of error codes modelled on the gRPC status codes.
// Every error type in the workspace maps itself onto one of these so callers
// can react to a failure class without matching on concrete error enums.
use std::error::Error;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum ErrorCodes {
    // Success is used instead of Ok, which is taken by Result.
    Success = 0,
    // CANCELLED indicates the operation was cancelled by the caller.
    Cancelled = 1,
    // UNKNOWN indicates an unknown error.
    Unknown = 2,
    // INVALID_ARGUMENT indicates the caller supplied an invalid argument.
    InvalidArgument = 3,
    // NOT_FOUND means a requested entity (bucket, key, pivot) was not found.
    NotFound = 5,
    // ALREADY_EXISTS means an entity we attempted to create already exists.
    AlreadyExists = 6,
    // FAILED_PRECONDITION means the system is not in the state required
    // for the operation, e.g. searching an index that is not frozen yet.
    FailedPrecondition = 9,
    // ABORTED indicates the operation was aborted.
    Aborted = 10,
    // OUT_OF_RANGE means a value fell outside the declared valid range.
    OutOfRange = 11,
    // UNIMPLEMENTED indicates the operation is not supported.
    Unimplemented = 12,
    // INTERNAL errors are broken invariants.
    Internal = 13,
    // UNAVAILABLE indicates a backing resource is currently unavailable.
    Unavailable = 14,
    // DATA_LOSS indicates unrecoverable data loss or corruption.
    DataLoss = 15,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::InvalidArgument => "InvalidArgumentError",
            ErrorCodes::NotFound => "NotFoundError",
            ErrorCodes::FailedPrecondition => "NotReadyError",
            ErrorCodes::OutOfRange => "OutOfRangeError",
            ErrorCodes::DataLoss => "CorruptionError",
            ErrorCodes::Internal => "InternalError",
            _ => "SketchDbError",
        }
    }
}

pub trait SketchDbError: Error + Send {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn SketchDbError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
    fn should_trace_error(&self) -> bool {
        true
    }
}

impl Error for Box<dyn SketchDbError> {}

impl SketchDbError for Box<dyn SketchDbError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("distance {0} above 255")]
    struct TooFar(u32);

    impl SketchDbError for TooFar {
        fn code(&self) -> ErrorCodes {
            ErrorCodes::OutOfRange
        }
    }

    #[test]
    fn test_boxed_error_keeps_code() {
        let err = TooFar(300).boxed();
        assert_eq!(err.code(), ErrorCodes::OutOfRange);
        assert_eq!(err.code().name(), "OutOfRangeError");
        assert_eq!(err.to_string(), "distance 300 above 255");
        assert!(err.should_trace_error());
    }
}
