use crate::distance::{edit_distance, euclidean_distance_scalar, manhattan_distance_scalar};
use crate::numeric::Distance;
use bytes::{Buf, BufMut};
use sketchdb_error::{ErrorCodes, SketchDbError};
use thiserror::Error;

/// An object living in a metric space.
///
/// `distance` must be symmetric and non-negative, and should satisfy the
/// triangle inequality: every pruning rule in the index relies on it. The
/// byte codec is what ends up inside bucket records, so `decode(encode(x))`
/// must be at distance zero from `x`.
pub trait MetricObject: Clone + std::fmt::Debug + Send + Sync + 'static {
    type Distance: Distance;

    fn distance(&self, other: &Self) -> Self::Distance;

    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self, ObjectCodecError>;
}

#[derive(Debug, Error)]
pub enum ObjectCodecError {
    #[error("Payload of {len} bytes is not a multiple of the {width} byte component width")]
    Misaligned { len: usize, width: usize },
    #[error("Payload is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl SketchDbError for ObjectCodecError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::DataLoss
    }
}

fn check_alignment(bytes: &[u8], width: usize) -> Result<(), ObjectCodecError> {
    if bytes.len() % width != 0 {
        return Err(ObjectCodecError::Misaligned {
            len: bytes.len(),
            width,
        });
    }
    Ok(())
}

/// Integer vector under the L1 (manhattan) metric.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct L1Vector(pub Vec<i16>);

impl MetricObject for L1Vector {
    type Distance = i32;

    fn distance(&self, other: &Self) -> i32 {
        manhattan_distance_scalar(&self.0, &other.0)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() * 2);
        for v in &self.0 {
            buf.put_i16_le(*v);
        }
        buf
    }

    fn decode(mut bytes: &[u8]) -> Result<Self, ObjectCodecError> {
        check_alignment(bytes, 2)?;
        let mut values = Vec::with_capacity(bytes.len() / 2);
        while bytes.has_remaining() {
            values.push(bytes.get_i16_le());
        }
        Ok(L1Vector(values))
    }
}

/// Float vector under the euclidean metric.
#[derive(Clone, Debug, PartialEq)]
pub struct EuclideanVector(pub Vec<f32>);

impl MetricObject for EuclideanVector {
    type Distance = f32;

    fn distance(&self, other: &Self) -> f32 {
        euclidean_distance_scalar(&self.0, &other.0).sqrt()
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() * 4);
        for v in &self.0 {
            buf.put_f32_le(*v);
        }
        buf
    }

    fn decode(mut bytes: &[u8]) -> Result<Self, ObjectCodecError> {
        check_alignment(bytes, 4)?;
        let mut values = Vec::with_capacity(bytes.len() / 4);
        while bytes.has_remaining() {
            values.push(bytes.get_f32_le());
        }
        Ok(EuclideanVector(values))
    }
}

/// Text under the Levenshtein metric. Payloads are variable length, so
/// buckets of these always use the length-prefixed record layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EditString(pub String);

impl MetricObject for EditString {
    type Distance = i32;

    fn distance(&self, other: &Self) -> i32 {
        edit_distance(&self.0, &other.0)
    }

    fn encode(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, ObjectCodecError> {
        Ok(EditString(std::str::from_utf8(bytes)?.to_string()))
    }
}
