//! Batches of one size class and their shared free list

use super::backend::BufferBackend;
use super::batch::Batch;
use super::size_class::{BucketLayout, SizeClass};
use super::slot::{BatchId, EntryId, SlotRef};
use crate::error::{Error, Result};
use tracing::error;

/// All batches of one size class
///
/// Batches are kept in id order, so lookups by id are a binary search.
/// Every inactive slot of every batch sits on the free list exactly once.
#[derive(Debug)]
pub struct BucketPool {
    class: SizeClass,
    slot_capacity: Option<usize>,
    slots_per_batch: usize,
    batches: Vec<Batch>,
    free: Vec<SlotRef>,
    sorted: bool,
}

impl BucketPool {
    pub fn new(class: SizeClass, layout: &BucketLayout, sorted: bool) -> Self {
        Self {
            class,
            slot_capacity: layout.slot_capacity(class),
            slots_per_batch: layout.slots_per_batch(class),
            batches: Vec::new(),
            free: Vec::new(),
            sorted,
        }
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    /// Fixed per-slot capacity, `None` for the unbounded class
    pub fn slot_capacity(&self) -> Option<usize> {
        self.slot_capacity
    }

    pub fn slots_per_batch(&self) -> usize {
        self.slots_per_batch
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn batch(&self, id: BatchId) -> Option<&Batch> {
        self.position(id).map(|i| &self.batches[i])
    }

    pub fn batch_mut(&mut self, id: BatchId) -> Option<&mut Batch> {
        self.position(id).map(move |i| &mut self.batches[i])
    }

    pub fn contains_batch(&self, id: BatchId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: BatchId) -> Option<usize> {
        self.batches.binary_search_by_key(&id, |b| b.id()).ok()
    }

    fn batch_or_err(&mut self, id: BatchId) -> Result<&mut Batch> {
        let class = self.class;
        self.batch_mut(id).ok_or_else(|| {
            Error::InvariantViolation(format!("{} is not in the {} pool", id, class))
        })
    }

    pub fn free_slots(&self) -> &[SlotRef] {
        &self.free
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Active slots across all batches
    pub fn active_slot_count(&self) -> usize {
        self.batches.iter().map(Batch::active_count).sum()
    }

    /// Add a freshly created batch; all its slots become free
    pub fn push_batch(&mut self, batch: Batch) -> Result<()> {
        if let Some(last) = self.batches.last() {
            if last.id() >= batch.id() {
                return Err(Error::InvariantViolation(format!(
                    "{} added after {} in the {} pool",
                    batch.id(),
                    last.id(),
                    self.class
                )));
            }
        }

        let id = batch.id();
        let free: Vec<usize> = (0..batch.slot_count())
            .filter(|&i| batch.slot(i).map_or(false, |s| !s.is_active()))
            .collect();
        self.batches.push(batch);
        for slot in free {
            self.add_free_slot(SlotRef::new(id, slot));
        }
        Ok(())
    }

    /// Return a slot to the free list
    pub fn add_free_slot(&mut self, slot: SlotRef) {
        if self.sorted {
            if let Err(pos) = self.free.binary_search(&slot) {
                self.free.insert(pos, slot);
            }
        } else if !self.free.contains(&slot) {
            self.free.push(slot);
        }
    }

    /// Drop one slot from the free list
    pub fn remove_free_slot(&mut self, slot: SlotRef) {
        self.free.retain(|r| *r != slot);
    }

    /// Drop every free-list entry of a batch, returning how many were removed
    pub fn remove_free_slots_for(&mut self, batch: BatchId) -> usize {
        let before = self.free.len();
        self.free.retain(|r| r.batch != batch);
        before - self.free.len()
    }

    /// Pop the next free slot
    ///
    /// With a sorted list this is the lowest (batch, slot) pair, which keeps
    /// early batches dense and lets later ones drain for reclamation.
    pub fn find_free_slot(&mut self) -> Option<SlotRef> {
        self.take_free_slot_where(|_, _| true)
    }

    /// Pop the next free slot accepted by `fits`
    ///
    /// Rejected slots stay on the free list.
    pub fn take_free_slot_where<F>(&mut self, fits: F) -> Option<SlotRef>
    where
        F: Fn(&Batch, usize) -> bool,
    {
        let accept = |r: &SlotRef| self.batch(r.batch).map_or(false, |b| fits(b, r.slot));
        let pos = if self.sorted {
            self.free.iter().position(accept)
        } else {
            self.free.iter().rposition(accept)
        }?;
        Some(self.free.remove(pos))
    }

    /// First batch, in id order, with an inactive slot
    pub fn find_batch_with_spare_capacity(&self) -> Option<BatchId> {
        self.find_batch_with_spare_capacity_except(None)
    }

    pub fn find_batch_with_spare_capacity_except(&self, skip: Option<BatchId>) -> Option<BatchId> {
        self.batches
            .iter()
            .find(|b| Some(b.id()) != skip && b.has_spare_capacity())
            .map(Batch::id)
    }

    /// Claim the first inactive slot of a batch
    pub fn allocate_in(&mut self, batch: BatchId, entry: EntryId, element_count: usize) -> Result<usize> {
        let slot = self.batch_or_err(batch)?.allocate(entry, element_count)?;
        self.remove_free_slot(SlotRef::new(batch, slot));
        Ok(slot)
    }

    /// Claim a slot previously taken off the free list
    pub fn claim(&mut self, slot: SlotRef, entry: EntryId, element_count: usize) -> Result<()> {
        self.batch_or_err(slot.batch)?
            .claim(slot.slot, entry, element_count)
    }

    /// Free a slot and put it back on the free list
    pub fn free_slot(&mut self, slot: SlotRef) -> Result<EntryId> {
        let owner = self.batch_or_err(slot.batch)?.free(slot.slot).ok_or_else(|| {
            Error::InvariantViolation(format!("{} freed while inactive", slot))
        })?;
        self.add_free_slot(slot);
        Ok(owner)
    }

    /// Double a batch, adding its new slots to the free list
    pub fn grow_batch<B: BufferBackend>(&mut self, batch: BatchId, backend: &mut B) -> Result<Vec<EntryId>> {
        let (affected, new_slots) = self.batch_or_err(batch)?.grow(backend)?;
        for slot in new_slots {
            self.add_free_slot(SlotRef::new(batch, slot));
        }
        Ok(affected)
    }

    /// Remove an empty batch from the pool
    ///
    /// Purges its free-list entries first. Removing a batch that still has
    /// active slots is an invariant violation and leaves the pool untouched.
    pub fn take_batch(&mut self, id: BatchId) -> Result<Batch> {
        let pos = self.position(id).ok_or_else(|| {
            Error::InvariantViolation(format!("{} is not in the {} pool", id, self.class))
        })?;

        let batch = &self.batches[pos];
        if !batch.is_empty() {
            error!(
                target: "photonslab::compaction",
                batch = %id,
                active = batch.active_count(),
                "Refusing to delete batch with active slots"
            );
            for (slot, s) in batch.active_entries() {
                error!(
                    target: "photonslab::compaction",
                    batch = %id,
                    slot,
                    entry = ?s.owner,
                    elements = s.element_count,
                    "Slot still active"
                );
            }
            return Err(Error::InvariantViolation(format!(
                "cannot delete {}: still has {} active entries",
                id,
                batch.active_count()
            )));
        }

        self.remove_free_slots_for(id);
        Ok(self.batches.remove(pos))
    }

    /// Remove every batch, leaving the pool empty
    pub fn drain_batches(&mut self) -> Vec<Batch> {
        self.free.clear();
        std::mem::take(&mut self.batches)
    }
}
