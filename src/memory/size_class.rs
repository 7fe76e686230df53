//! Size class selection for the bucketed allocator

use crate::config::{BucketSpec, BucketsConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size category of an entry's payload
///
/// Ordered smallest to largest. Every class except `XXLarge` has a fixed
/// per-slot capacity; `XXLarge` batches hold a single slot sized exactly to
/// the payload that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
    XLarge,
    XXLarge,
}

impl SizeClass {
    /// All classes in draw order
    pub const ALL: [SizeClass; 5] = [
        SizeClass::Small,
        SizeClass::Medium,
        SizeClass::Large,
        SizeClass::XLarge,
        SizeClass::XXLarge,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_unbounded(self) -> bool {
        self == SizeClass::XXLarge
    }

    pub fn name(self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
            SizeClass::XLarge => "xlarge",
            SizeClass::XXLarge => "xxlarge",
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-class slot geometry, derived from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketLayout {
    fixed: [BucketSpec; 4],
}

impl BucketLayout {
    pub fn new(buckets: &BucketsConfig) -> Self {
        Self {
            fixed: [buckets.small, buckets.medium, buckets.large, buckets.xlarge],
        }
    }

    /// Smallest class whose slot capacity holds `element_count`
    ///
    /// Counts beyond the largest fixed class land in `XXLarge`.
    pub fn classify(&self, element_count: usize) -> SizeClass {
        self.fixed
            .iter()
            .position(|spec| element_count <= spec.slot_capacity)
            .map(|i| SizeClass::ALL[i])
            .unwrap_or(SizeClass::XXLarge)
    }

    /// Per-slot capacity, `None` for the unbounded class
    pub fn slot_capacity(&self, class: SizeClass) -> Option<usize> {
        self.fixed.get(class.index()).map(|spec| spec.slot_capacity)
    }

    /// Slots in a freshly created batch
    pub fn slots_per_batch(&self, class: SizeClass) -> usize {
        self.fixed
            .get(class.index())
            .map(|spec| spec.slots_per_batch)
            .unwrap_or(1)
    }
}

impl Default for BucketLayout {
    fn default() -> Self {
        Self::new(&BucketsConfig::default())
    }
}
