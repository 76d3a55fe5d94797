use bytes::{Buf, BufMut};
use std::cmp::Ordering;
use std::fmt::{Debug, Display};

/// The numeric type a metric returns.
///
/// Every index structure is generic over this trait so the same bucket,
/// queue and sketch code serves integer and floating point metrics.
/// Values are always non-negative when produced by a metric, but the trait
/// itself does not assume it (lower bounds are computed from differences).
pub trait Distance:
    Copy + Send + Sync + PartialEq + PartialOrd + Debug + Display + 'static
{
    const ZERO: Self;
    const MAX: Self;
    /// Width in bytes of the fixed-size encodings.
    const WIDTH: usize;

    /// A total order. NaN sorts after every other float.
    fn total_cmp(&self, other: &Self) -> Ordering;

    fn abs_diff(self, other: Self) -> Self;

    fn saturating_add(self, other: Self) -> Self;

    fn saturating_sub(self, other: Self) -> Self;

    fn to_f64(self) -> f64;

    /// Little-endian, `WIDTH` bytes.
    fn put_le<B: BufMut>(self, buf: &mut B);

    /// Reads `WIDTH` little-endian bytes. Panics if fewer remain, use
    /// [`Distance::try_get_le`] on untrusted input.
    fn get_le<B: Buf>(buf: &mut B) -> Self;

    /// Big-endian encoding whose bytewise order matches `total_cmp`.
    fn put_sortable<B: BufMut>(self, buf: &mut B);

    fn get_sortable<B: Buf>(buf: &mut B) -> Self;

    fn try_get_le<B: Buf>(buf: &mut B) -> Option<Self> {
        if buf.remaining() < Self::WIDTH {
            return None;
        }
        Some(Self::get_le(buf))
    }

    fn try_get_sortable<B: Buf>(buf: &mut B) -> Option<Self> {
        if buf.remaining() < Self::WIDTH {
            return None;
        }
        Some(Self::get_sortable(buf))
    }

    fn sortable_key(self) -> Vec<u8> {
        let mut key = Vec::with_capacity(Self::WIDTH);
        self.put_sortable(&mut key);
        key
    }

    fn max_by_total(self, other: Self) -> Self {
        match self.total_cmp(&other) {
            Ordering::Less => other,
            _ => self,
        }
    }

    fn min_by_total(self, other: Self) -> Self {
        match self.total_cmp(&other) {
            Ordering::Greater => other,
            _ => self,
        }
    }
}

macro_rules! impl_int_distance {
    ($t:ty, $u:ty, $put_le:ident, $get_le:ident, $put_be:ident, $get_be:ident) => {
        impl Distance for $t {
            const ZERO: Self = 0;
            const MAX: Self = <$t>::MAX;
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn total_cmp(&self, other: &Self) -> Ordering {
                Ord::cmp(self, other)
            }

            fn abs_diff(self, other: Self) -> Self {
                let diff = <$t>::abs_diff(self, other);
                if diff > <$t>::MAX as $u {
                    <$t>::MAX
                } else {
                    diff as $t
                }
            }

            fn saturating_add(self, other: Self) -> Self {
                <$t>::saturating_add(self, other)
            }

            fn saturating_sub(self, other: Self) -> Self {
                <$t>::saturating_sub(self, other)
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn put_le<B: BufMut>(self, buf: &mut B) {
                buf.$put_le(self);
            }

            fn get_le<B: Buf>(buf: &mut B) -> Self {
                buf.$get_le()
            }

            fn put_sortable<B: BufMut>(self, buf: &mut B) {
                const SIGN: $u = 1 << (<$u>::BITS - 1);
                buf.$put_be((self as $u) ^ SIGN);
            }

            fn get_sortable<B: Buf>(buf: &mut B) -> Self {
                const SIGN: $u = 1 << (<$u>::BITS - 1);
                (buf.$get_be() ^ SIGN) as $t
            }
        }
    };
}

macro_rules! impl_float_distance {
    ($t:ty, $u:ty, $put_le:ident, $get_le:ident, $put_be:ident, $get_be:ident) => {
        impl Distance for $t {
            const ZERO: Self = 0.0;
            const MAX: Self = <$t>::MAX;
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn total_cmp(&self, other: &Self) -> Ordering {
                <$t>::total_cmp(self, other)
            }

            fn abs_diff(self, other: Self) -> Self {
                (self - other).abs()
            }

            fn saturating_add(self, other: Self) -> Self {
                (self + other).min(<$t>::MAX)
            }

            fn saturating_sub(self, other: Self) -> Self {
                (self - other).max(<$t>::MIN)
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn put_le<B: BufMut>(self, buf: &mut B) {
                buf.$put_le(self);
            }

            fn get_le<B: Buf>(buf: &mut B) -> Self {
                buf.$get_le()
            }

            fn put_sortable<B: BufMut>(self, buf: &mut B) {
                const SIGN: $u = 1 << (<$u>::BITS - 1);
                let bits = self.to_bits();
                let key = if bits & SIGN != 0 { !bits } else { bits | SIGN };
                buf.$put_be(key);
            }

            fn get_sortable<B: Buf>(buf: &mut B) -> Self {
                const SIGN: $u = 1 << (<$u>::BITS - 1);
                let key = buf.$get_be();
                let bits = if key & SIGN != 0 { key & !SIGN } else { !key };
                <$t>::from_bits(bits)
            }
        }
    };
}

impl_int_distance!(i8, u8, put_i8, get_i8, put_u8, get_u8);
impl_int_distance!(i16, u16, put_i16_le, get_i16_le, put_u16, get_u16);
impl_int_distance!(i32, u32, put_i32_le, get_i32_le, put_u32, get_u32);
impl_int_distance!(i64, u64, put_i64_le, get_i64_le, put_u64, get_u64);
impl_float_distance!(f32, u32, put_f32_le, get_f32_le, put_u32, get_u32);
impl_float_distance!(f64, u64, put_f64_le, get_f64_le, put_u64, get_u64);
