//! Allocator configuration
//!
//! Layered the same way for every host: built-in defaults, then an optional
//! TOML file, then `PHOTONSLAB__*` environment variables.
//!
//! ```toml
//! [growth]
//! enabled = true
//! utilization_threshold = 0.75
//!
//! [buckets.small]
//! slot_capacity = 1024
//! slots_per_batch = 256
//! ```

use crate::error::{Error, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "PHOTONSLAB";

/// Slot geometry for one fixed size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpec {
    /// Elements (vertices) each slot can hold
    pub slot_capacity: usize,
    /// Slots carved out of a freshly created batch
    pub slots_per_batch: usize,
}

impl BucketSpec {
    pub const fn new(slot_capacity: usize, slots_per_batch: usize) -> Self {
        Self {
            slot_capacity,
            slots_per_batch,
        }
    }
}

/// Fixed size classes, smallest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketsConfig {
    pub small: BucketSpec,
    pub medium: BucketSpec,
    pub large: BucketSpec,
    pub xlarge: BucketSpec,
}

impl Default for BucketsConfig {
    fn default() -> Self {
        Self {
            small: BucketSpec::new(1024, 256),
            medium: BucketSpec::new(4096, 128),
            large: BucketSpec::new(16384, 64),
            xlarge: BucketSpec::new(65536, 16),
        }
    }
}

/// Dynamic growth: double a dense batch instead of opening a new one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthConfig {
    pub enabled: bool,
    /// Minimum active/total slot ratio before a batch may grow
    pub utilization_threshold: f64,
    /// Doublings allowed per batch (2 means start -> 2x -> 4x)
    pub max_cycles: u32,
    /// Hard ceiling on a single batch's buffer size
    pub max_batch_bytes: u64,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            utilization_threshold: 0.75,
            max_cycles: 2,
            max_batch_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Defragmentation of sparse batches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Batches below this active/total slot ratio are candidates
    pub utilization_floor: f64,
    /// Batches whose slots may be relocated per compaction pass
    pub max_batches_per_cycle: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            utilization_floor: 0.25,
            max_batches_per_cycle: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreeListConfig {
    /// Keep free slots ordered by (batch, slot) and reuse the lowest first.
    /// When disabled the free list is a LIFO stack.
    pub sorted: bool,
}

impl Default for FreeListConfig {
    fn default() -> Self {
        Self { sorted: true }
    }
}

/// How often the host loop runs maintenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub compaction_interval_frames: u64,
    pub integrity_interval_frames: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            compaction_interval_frames: 60,
            integrity_interval_frames: 100,
        }
    }
}

/// Complete allocator configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub buckets: BucketsConfig,
    pub growth: GrowthConfig,
    pub compaction: CompactionConfig,
    pub free_list: FreeListConfig,
    pub cadence: CadenceConfig,
}

impl AllocatorConfig {
    /// Load defaults, an optional TOML file and `PHOTONSLAB__*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(
            path,
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
    }

    /// Same as [`load`](Self::load) with an explicit environment source
    pub fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let defaults = Config::try_from(&Self::default())
            .map_err(|e| Error::Config(format!("Failed to seed defaults: {}", e)))?;

        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = path {
            info!(path = ?path, "Loading allocator configuration");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let config: Self = builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        debug!(?config, "Allocator configuration ready");
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to render configuration: {}", e)))
    }

    /// Reject configurations the allocator cannot honor
    pub fn validate(&self) -> Result<()> {
        let b = &self.buckets;
        let specs = [
            ("small", b.small),
            ("medium", b.medium),
            ("large", b.large),
            ("xlarge", b.xlarge),
        ];

        let mut previous = 0;
        for (name, spec) in specs {
            if spec.slot_capacity == 0 || spec.slots_per_batch == 0 {
                return Err(Error::Config(format!(
                    "bucket '{}' needs a non-zero slot capacity and slot count",
                    name
                )));
            }
            if spec.slot_capacity <= previous {
                return Err(Error::Config(format!(
                    "bucket '{}' capacity {} must exceed the previous class ({})",
                    name, spec.slot_capacity, previous
                )));
            }
            previous = spec.slot_capacity;
        }

        if !(self.growth.utilization_threshold > 0.0 && self.growth.utilization_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "growth.utilization_threshold must be in (0, 1], got {}",
                self.growth.utilization_threshold
            )));
        }
        if !(self.compaction.utilization_floor > 0.0 && self.compaction.utilization_floor <= 1.0) {
            return Err(Error::Config(format!(
                "compaction.utilization_floor must be in (0, 1], got {}",
                self.compaction.utilization_floor
            )));
        }
        if self.cadence.compaction_interval_frames == 0 || self.cadence.integrity_interval_frames == 0
        {
            return Err(Error::Config(
                "cadence intervals must be at least one frame".to_string(),
            ));
        }

        Ok(())
    }
}
