//! Batch defragmentation
//!
//! Sparse batches are drained into denser batches of the same pool so the
//! emptied batch can be deleted and its buffer released.

use super::backend::BufferBackend;
use super::pool::BucketPool;
use super::size_class::SizeClass;
use super::slot::{BatchId, EntryId, EntryLocation, SlotRef, ELEMENT_BYTES, ELEMENT_FLOATS};
use crate::config::CompactionConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use tracing::debug;

/// A batch below the utilization floor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub class: SizeClass,
    pub batch: BatchId,
    pub active: usize,
    pub slots: usize,
    pub utilization: f64,
}

impl Candidate {
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }
}

/// Result of draining one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactOutcome {
    /// The source batch ended with no active slots
    pub now_empty: bool,
    pub slots_moved: usize,
    pub bytes_moved: usize,
}

/// Scans pools for sparse batches and relocates their slots
///
/// Holds no allocator state; everything it touches is passed in.
#[derive(Debug, Clone)]
pub struct Compactor {
    enabled: bool,
    utilization_floor: f64,
}

impl Compactor {
    pub fn new(config: &CompactionConfig) -> Self {
        Self {
            enabled: config.enabled,
            utilization_floor: config.utilization_floor,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Find batches below the utilization floor, sparsest first
    pub fn scan(&self, pools: &[BucketPool]) -> Vec<Candidate> {
        if !self.enabled {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        let mut total = 0;
        for pool in pools {
            let count = pool.batch_count();
            for (i, batch) in pool.batches().iter().enumerate() {
                total += 1;
                if batch.slot_count() == 0 {
                    debug!(
                        target: "photonslab::compaction",
                        "[{}] batch[{}/{}] {} - skipping (no slots)",
                        pool.class(), i + 1, count, batch.id()
                    );
                    continue;
                }

                let utilization = batch.utilization();
                if utilization < self.utilization_floor {
                    debug!(
                        target: "photonslab::compaction",
                        "[{}] batch[{}/{}] {} - CANDIDATE ({:.1}% util, {}/{} slots active)",
                        pool.class(), i + 1, count, batch.id(),
                        utilization * 100.0, batch.active_count(), batch.slot_count()
                    );
                    candidates.push(Candidate {
                        class: pool.class(),
                        batch: batch.id(),
                        active: batch.active_count(),
                        slots: batch.slot_count(),
                        utilization,
                    });
                } else {
                    debug!(
                        target: "photonslab::compaction",
                        "[{}] batch[{}/{}] {} - too dense ({:.1}% util, {}/{} slots active)",
                        pool.class(), i + 1, count, batch.id(),
                        utilization * 100.0, batch.active_count(), batch.slot_count()
                    );
                }
            }
        }

        candidates.sort_by(|a, b| a.utilization.total_cmp(&b.utilization));
        debug!(
            target: "photonslab::compaction",
            total_batches = total,
            empty = candidates.iter().filter(|c| c.is_empty()).count(),
            candidates = candidates.len(),
            floor = self.utilization_floor,
            "Scan completed"
        );
        candidates
    }

    /// Move every active slot of `source` into other batches of `pool`
    ///
    /// Stops early once no other batch has spare capacity. Each move copies
    /// the payload through the backend, repoints the entry's location and
    /// frees the source slot.
    pub fn compact<B: BufferBackend>(
        &self,
        pool: &mut BucketPool,
        directory: &mut HashMap<EntryId, EntryLocation>,
        backend: &mut B,
        source: BatchId,
    ) -> Result<CompactOutcome> {
        let mut outcome = CompactOutcome::default();
        if !self.enabled {
            return Ok(outcome);
        }

        let to_move: Vec<(usize, EntryId, usize)> = pool
            .batch(source)
            .ok_or_else(|| Error::InvariantViolation(format!("{} vanished before compaction", source)))?
            .active_entries()
            .filter_map(|(slot, s)| s.owner.map(|owner| (slot, owner, s.element_count)))
            .collect();

        for (slot, entry, element_count) in to_move {
            let target = match pool.find_batch_with_spare_capacity_except(Some(source)) {
                Some(target) => target,
                None => {
                    debug!(
                        target: "photonslab::compaction",
                        batch = %source,
                        moved = outcome.slots_moved,
                        "No target capacity left, stopping early"
                    );
                    break;
                }
            };

            match directory.get(&entry) {
                Some(loc) if loc.batch == source && loc.slot == slot => {}
                other => {
                    return Err(Error::InvariantViolation(format!(
                        "entry {} in {}[{}] has location {:?}",
                        entry, source, slot, other
                    )))
                }
            }

            self.relocate(pool, backend, SlotRef::new(source, slot), target, entry, element_count)
                .map(|new_slot| {
                    directory.insert(
                        entry,
                        EntryLocation {
                            class: pool.class(),
                            batch: target,
                            slot: new_slot,
                            element_count,
                        },
                    );
                })?;
            pool.free_slot(SlotRef::new(source, slot))?;

            outcome.slots_moved += 1;
            outcome.bytes_moved += element_count * ELEMENT_BYTES;
        }

        outcome.now_empty = pool.batch(source).map_or(false, |b| b.is_empty());
        Ok(outcome)
    }

    /// Copy one slot's payload into a fresh slot of `target`
    fn relocate<B: BufferBackend>(
        &self,
        pool: &mut BucketPool,
        backend: &mut B,
        from: SlotRef,
        target: BatchId,
        entry: EntryId,
        element_count: usize,
    ) -> Result<usize> {
        let payload = {
            let batch = pool
                .batch(from.batch)
                .ok_or_else(|| Error::InvariantViolation(format!("{} vanished", from.batch)))?;
            backend.read(
                batch.buffer(),
                batch.byte_offset(from.slot)?,
                element_count * ELEMENT_FLOATS,
            )?
        };

        let new_slot = pool.allocate_in(target, entry, element_count)?;
        let written = match pool.batch(target) {
            Some(batch) => batch
                .byte_offset(new_slot)
                .and_then(|offset| backend.write(batch.buffer(), offset, &payload)),
            None => Err(Error::InvariantViolation(format!("{} vanished", target))),
        };

        if let Err(e) = written {
            pool.free_slot(SlotRef::new(target, new_slot))?;
            return Err(e);
        }
        Ok(new_slot)
    }
}
