use serde::{Deserialize, Serialize};
use sketchdb_distance::{Distance, MetricObject};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// An M-bit sketch, the identity of a bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SketchAddress {
    bits: usize,
    words: Vec<u64>,
}

impl SketchAddress {
    pub fn zero(bits: usize) -> Self {
        SketchAddress {
            bits,
            words: vec![0; bits.div_ceil(64)],
        }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn get(&self, i: usize) -> bool {
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn set(&mut self, i: usize, value: bool) {
        if value {
            self.words[i / 64] |= 1 << (i % 64);
        } else {
            self.words[i / 64] &= !(1 << (i % 64));
        }
    }

    pub fn hamming(&self, other: &SketchAddress) -> u32 {
        self.words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    pub fn differing_bits<'a>(&'a self, other: &'a SketchAddress) -> impl Iterator<Item = usize> + 'a {
        self.words
            .iter()
            .zip(&other.words)
            .enumerate()
            .flat_map(|(w, (a, b))| {
                let mut diff = a ^ b;
                std::iter::from_fn(move || {
                    if diff == 0 {
                        return None;
                    }
                    let bit = diff.trailing_zeros() as usize;
                    diff &= diff - 1;
                    Some(w * 64 + bit)
                })
            })
    }

    /// Bytes needed to store an address of `bits` bits.
    pub fn key_len(bits: usize) -> usize {
        bits.div_ceil(8)
    }

    /// Fixed-width byte form, bit `i` at byte `i / 8`, most significant bit
    /// first.
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = vec![0u8; Self::key_len(self.bits)];
        for i in 0..self.bits {
            if self.get(i) {
                key[i / 8] |= 0x80 >> (i % 8);
            }
        }
        key
    }

    pub fn from_key(bits: usize, key: &[u8]) -> Option<Self> {
        if key.len() != Self::key_len(bits) {
            return None;
        }
        let mut address = SketchAddress::zero(bits);
        for (byte_index, byte) in key.iter().enumerate() {
            for offset in 0..8 {
                if byte & (0x80 >> offset) == 0 {
                    continue;
                }
                let i = byte_index * 8 + offset;
                if i >= bits {
                    return None;
                }
                address.set(i, true);
            }
        }
        Some(address)
    }
}

impl fmt::Display for SketchAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.to_key() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Where an object falls in the sketch and how confidently.
#[derive(Clone, Debug)]
pub struct SketchProjection {
    pub address: SketchAddress,
    /// `|d(o, A_i) - d(o, B_i)| / 2` for every pivot pair: how far the object
    /// sits from the hyperplane of bit `i`.
    pub lower_bounds: Vec<f64>,
    /// Bit indices, least confident first.
    pub order: Vec<usize>,
    /// Largest distance to any sketch pivot.
    pub max_pivot_distance: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitDistortion {
    pub cleared: u64,
    pub set: u64,
}

/// The global sketch: M pivot pairs, each contributing one bit that records
/// which pivot of the pair is closer.
#[derive(Debug)]
pub struct SketchEngine<O: MetricObject> {
    pairs: Vec<(O, O)>,
    distortion: Vec<[AtomicU64; 2]>,
}

impl<O: MetricObject> SketchEngine<O> {
    pub fn new(pairs: Vec<(O, O)>) -> Self {
        let distortion = pairs
            .iter()
            .map(|_| [AtomicU64::new(0), AtomicU64::new(0)])
            .collect();
        SketchEngine { pairs, distortion }
    }

    pub fn bits(&self) -> usize {
        self.pairs.len()
    }

    pub fn pairs(&self) -> &[(O, O)] {
        &self.pairs
    }

    pub fn project(&self, object: &O) -> SketchProjection {
        let mut address = SketchAddress::zero(self.bits());
        let mut lower_bounds = Vec::with_capacity(self.bits());
        let mut max_pivot_distance = 0.0f64;
        for (i, (a, b)) in self.pairs.iter().enumerate() {
            let da = object.distance(a);
            let db = object.distance(b);
            let bit = da.total_cmp(&db) == Ordering::Greater;
            address.set(i, bit);
            self.distortion[i][bit as usize].fetch_add(1, AtomicOrdering::Relaxed);
            lower_bounds.push((da.abs_diff(db).to_f64() / 2.0).max(0.0));
            max_pivot_distance = max_pivot_distance.max(da.to_f64()).max(db.to_f64());
        }
        let mut order: Vec<usize> = (0..self.bits()).collect();
        order.sort_by(|x, y| lower_bounds[*x].total_cmp(&lower_bounds[*y]));
        SketchProjection {
            address,
            lower_bounds,
            order,
            max_pivot_distance,
        }
    }

    /// Known addresses closest to the query first: fewest differing bits,
    /// then smallest sum of the query's lower bounds over those bits.
    pub fn order_buckets(
        &self,
        query: &SketchProjection,
        known: &[SketchAddress],
        budget: usize,
    ) -> Vec<SketchAddress> {
        let mut scored: Vec<(u32, f64, &SketchAddress)> = known
            .iter()
            .map(|address| {
                let mut hamming = 0;
                let mut confidence = 0.0;
                for i in query.address.differing_bits(address) {
                    hamming += 1;
                    confidence += query.lower_bounds[i];
                }
                (hamming, confidence, address)
            })
            .collect();
        scored.sort_by(|x, y| {
            x.0.cmp(&y.0)
                .then_with(|| x.1.total_cmp(&y.1))
                .then_with(|| x.2.cmp(y.2))
        });
        scored
            .into_iter()
            .take(budget)
            .map(|(_, _, address)| address.clone())
            .collect()
    }

    /// A lower bound on the distance from the query to any object stored
    /// under `address`.
    ///
    /// An object on the other side of pair `i`'s hyperplane is at least
    /// `lower_bounds[i]` away from the query, so the largest such bound over
    /// the differing bits holds for the whole bucket.
    pub fn bucket_lower_bound(&self, query: &SketchProjection, address: &SketchAddress) -> f64 {
        query
            .address
            .differing_bits(address)
            .map(|i| query.lower_bounds[i])
            .fold(0.0, f64::max)
    }

    pub fn distortion(&self) -> Vec<BitDistortion> {
        self.distortion
            .iter()
            .map(|[cleared, set]| BitDistortion {
                cleared: cleared.load(AtomicOrdering::Relaxed),
                set: set.load(AtomicOrdering::Relaxed),
            })
            .collect()
    }
}
