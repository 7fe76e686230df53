//! Slot bookkeeping types

use super::size_class::SizeClass;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Floats per element: x, y, r, g, b, a
pub const ELEMENT_FLOATS: usize = 6;
/// Bytes per float component
pub const FLOAT_BYTES: usize = 4;
/// Bytes per element
pub const ELEMENT_BYTES: usize = ELEMENT_FLOATS * FLOAT_BYTES;

/// Caller-chosen identity of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for EntryId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Batch identity, monotonically increasing and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch#{:03}", self.0)
    }
}

/// A fixed-offset region inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Owning entry, `None` while free
    pub owner: Option<EntryId>,
    /// Elements currently stored (at most the slot capacity)
    pub element_count: usize,
    /// Element offset within the batch buffer
    pub element_offset: usize,
}

impl Slot {
    /// Create a free slot at the given element offset
    pub fn new(element_offset: usize) -> Self {
        Self {
            owner: None,
            element_count: 0,
            element_offset,
        }
    }

    pub fn is_active(&self) -> bool {
        self.owner.is_some()
    }

    /// Claim this slot for an entry
    pub fn occupy(&mut self, entry: EntryId, element_count: usize) {
        self.owner = Some(entry);
        self.element_count = element_count;
    }

    /// Release this slot, returning the previous owner
    pub fn release(&mut self) -> Option<EntryId> {
        self.element_count = 0;
        self.owner.take()
    }
}

/// Reference to one slot of one batch
///
/// Ordering is (batch, slot), which is the order the sorted free list keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotRef {
    pub batch: BatchId,
    pub slot: usize,
}

impl SlotRef {
    pub fn new(batch: BatchId, slot: usize) -> Self {
        Self { batch, slot }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.batch, self.slot)
    }
}

/// Where an entry's payload currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub class: SizeClass,
    pub batch: BatchId,
    pub slot: usize,
    pub element_count: usize,
}

impl EntryLocation {
    pub fn slot_ref(&self) -> SlotRef {
        SlotRef::new(self.batch, self.slot)
    }
}
