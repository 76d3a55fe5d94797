//! Binary layout of a whole bucket, all integers little-endian:
//!
//! ```text
//! count: i32 | mode: i32 | record * count
//! record = [smap: D * pivot_count]? id: i64 [length: i8 | i16 | i32]? payload
//! ```
//!
//! Records are written pivots first; the first `min(pivot_count, count)`
//! records are pivots and carry no SMAP vector. A positive `mode` is the
//! length shared by every payload and no record has a length prefix. A
//! non-positive `mode` is `-max_len` and every payload is preceded by a
//! prefix of the narrowest width able to hold `max_len`.

use super::{BucketObject, SleekBucket};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sketchdb_distance::{Distance, MetricObject, ObjectCodecError};
use sketchdb_error::{ErrorCodes, SketchDbError};
use thiserror::Error;

const HEADER_LEN: usize = 8;
const ID_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum BucketCodecError {
    #[error("Bucket data truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("Invalid bucket header: count {count}, mode {mode}")]
    InvalidHeader { count: i32, mode: i32 },
    #[error("Record length {len} outside 0..={max}")]
    InvalidLength { len: i64, max: usize },
    #[error("{0} trailing bytes after the last record")]
    TrailingBytes(usize),
    #[error("Bucket too large to encode: {0}")]
    TooLarge(String),
    #[error("Undecodable payload: {0}")]
    Object(#[from] ObjectCodecError),
}

impl SketchDbError for BucketCodecError {
    fn code(&self) -> ErrorCodes {
        match self {
            BucketCodecError::TooLarge(_) => ErrorCodes::InvalidArgument,
            _ => ErrorCodes::DataLoss,
        }
    }
}

/// Width in bytes of the length prefix used when payloads vary in size.
pub fn length_prefix_width(max_len: usize) -> usize {
    if max_len <= i8::MAX as usize {
        1
    } else if max_len <= i16::MAX as usize {
        2
    } else {
        4
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), BucketCodecError> {
    if buf.remaining() < needed {
        return Err(BucketCodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub(super) fn encode<O: MetricObject>(bucket: &SleekBucket<O>) -> Result<Bytes, BucketCodecError> {
    let payloads: Vec<Vec<u8>> = bucket.records().map(|r| r.object.encode()).collect();
    let count = i32::try_from(payloads.len())
        .map_err(|_| BucketCodecError::TooLarge(format!("{} records", payloads.len())))?;
    let max_len = payloads.iter().map(Vec::len).max().unwrap_or(0);
    let min_len = payloads.iter().map(Vec::len).min().unwrap_or(0);
    let max_len_i32 = i32::try_from(max_len)
        .map_err(|_| BucketCodecError::TooLarge(format!("payload of {max_len} bytes")))?;

    let mode = if max_len > 0 && min_len == max_len {
        max_len_i32
    } else {
        -max_len_i32
    };
    let prefix_width = if mode > 0 {
        0
    } else {
        length_prefix_width(max_len)
    };

    let smap_len: usize = bucket.members().iter().map(|m| m.smap.len()).sum();
    let payload_len: usize = payloads.iter().map(Vec::len).sum();
    let mut buf = BytesMut::with_capacity(
        HEADER_LEN
            + smap_len * O::Distance::WIDTH
            + payloads.len() * (ID_LEN + prefix_width)
            + payload_len,
    );
    buf.put_i32_le(count);
    buf.put_i32_le(mode);
    for (record, payload) in bucket.records().zip(payloads.iter()) {
        for d in &record.smap {
            d.put_le(&mut buf);
        }
        buf.put_i64_le(record.id);
        match prefix_width {
            1 => buf.put_i8(payload.len() as i8),
            2 => buf.put_i16_le(payload.len() as i16),
            4 => buf.put_i32_le(payload.len() as i32),
            _ => {}
        }
        buf.put_slice(payload);
    }
    Ok(buf.freeze())
}

pub(super) fn decode<O: MetricObject>(
    pivot_count: usize,
    data: &[u8],
) -> Result<SleekBucket<O>, BucketCodecError> {
    let mut buf = data;
    ensure(buf, HEADER_LEN)?;
    let count = buf.get_i32_le();
    let mode = buf.get_i32_le();
    if count < 0 || mode == i32::MIN || (count == 0 && mode != 0) {
        return Err(BucketCodecError::InvalidHeader { count, mode });
    }
    let count = count as usize;
    let (fixed_len, max_len) = if mode > 0 {
        (Some(mode as usize), mode as usize)
    } else {
        (None, mode.unsigned_abs() as usize)
    };
    let prefix_width = length_prefix_width(max_len);

    let pivot_total = pivot_count.min(count);
    let mut pivots = Vec::with_capacity(pivot_total);
    // The count is untrusted: never reserve more records than bytes exist.
    let mut members = Vec::with_capacity((count - pivot_total).min(data.len() / ID_LEN));
    for i in 0..count {
        let smap_len = if i < pivot_total { 0 } else { pivot_count };
        let mut smap = Vec::with_capacity(smap_len);
        for _ in 0..smap_len {
            ensure(buf, O::Distance::WIDTH)?;
            smap.push(O::Distance::get_le(&mut buf));
        }
        ensure(buf, ID_LEN)?;
        let id = buf.get_i64_le();

        let len = match fixed_len {
            Some(len) => len,
            None => {
                ensure(buf, prefix_width)?;
                let len = match prefix_width {
                    1 => buf.get_i8() as i64,
                    2 => buf.get_i16_le() as i64,
                    _ => buf.get_i32_le() as i64,
                };
                if len < 0 || len as usize > max_len {
                    return Err(BucketCodecError::InvalidLength { len, max: max_len });
                }
                len as usize
            }
        };
        ensure(buf, len)?;
        let object = O::decode(&buf[..len])?;
        buf.advance(len);

        let record = BucketObject::new(id, smap, object);
        if i < pivot_total {
            pivots.push(record);
        } else {
            members.push(record);
        }
    }
    if buf.has_remaining() {
        return Err(BucketCodecError::TrailingBytes(buf.remaining()));
    }
    Ok(SleekBucket::from_parts(pivot_count, pivots, members))
}
