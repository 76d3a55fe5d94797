use crate::calibrator::CalibrationConfig;
use serde::{Deserialize, Serialize};
use sketchdb_blockstore::ByteStoreConfig;
use sketchdb_cache::CacheConfig;
use sketchdb_config::{load_config_from_path, ConfigError};

/// Widest sketch accepted. Addresses are compared bit by bit on every query,
/// so this also caps per-query sketch work. At this width the longest bucket
/// key still fits the local byte store's file-name limit.
pub const MAX_SKETCH_BITS: usize = 512;

const fn default_sketch_bits() -> usize {
    64
}

const fn default_bucket_pivot_count() -> usize {
    3
}

const fn default_lock_stripes() -> usize {
    64
}

/// How buckets are laid out in the byte store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketLayout {
    /// Whole bucket serialized under its address, parsed buckets cached.
    // case-insensitive
    #[default]
    #[serde(alias = "sleek")]
    Sleek,
    /// One store entry per record, members keyed by their distance to the
    /// first local pivot so a query range-scans only the relevant slice.
    #[serde(alias = "keyed")]
    Keyed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Number of pivot pairs, i.e. address width in bits.
    #[serde(default = "default_sketch_bits")]
    pub sketch_bits: usize,
    /// Local pivots per bucket.
    #[serde(default = "default_bucket_pivot_count")]
    pub bucket_pivot_count: usize,
    #[serde(default)]
    pub layout: BucketLayout,
    /// Cache of parsed buckets. Only used by the sleek layout.
    #[serde(default)]
    pub bucket_cache: CacheConfig,
    /// Inserts and queries whose distance to a sketch pivot exceeds this are
    /// rejected.
    #[serde(default)]
    pub max_distance: Option<f64>,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Seed for pivot selection when the index builds its own selector.
    #[serde(default)]
    pub pivot_seed: Option<u64>,
    /// Number of mutexes serializing bucket writes.
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            sketch_bits: default_sketch_bits(),
            bucket_pivot_count: default_bucket_pivot_count(),
            layout: BucketLayout::default(),
            bucket_cache: CacheConfig::default(),
            max_distance: None,
            calibration: CalibrationConfig::default(),
            pivot_seed: None,
            lock_stripes: default_lock_stripes(),
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.sketch_bits == 0 || self.sketch_bits > MAX_SKETCH_BITS {
            return Err(format!(
                "sketch_bits must be in 1..={MAX_SKETCH_BITS}, got {}",
                self.sketch_bits
            ));
        }
        if self.calibration.user_k.is_empty() || self.calibration.user_k.contains(&0) {
            return Err("calibration.user_k must list positive values".to_string());
        }
        if !(0.0..=1.0).contains(&self.calibration.expected_ep) {
            return Err(format!(
                "calibration.expected_ep must be in [0, 1], got {}",
                self.calibration.expected_ep
            ));
        }
        if let Some(max) = self.max_distance {
            if max.is_nan() || max < 0.0 {
                return Err(format!("max_distance must be non-negative, got {max}"));
            }
        }
        Ok(())
    }
}

/// Everything needed to stand up an index: its own settings plus where
/// buckets and metadata live.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SketchDbConfig {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub bucket_store: ByteStoreConfig,
    #[serde(default)]
    pub meta_store: ByteStoreConfig,
}

impl SketchDbConfig {
    /// Loads from a YAML file, overridden by `SKETCHDB_` environment
    /// variables.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        load_config_from_path(path)
    }
}
