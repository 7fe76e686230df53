//! One backing buffer subdivided into fixed-capacity slots

use super::backend::{BufferBackend, BufferHandle, LayoutHandle};
use super::size_class::SizeClass;
use super::slot::{BatchId, EntryId, Slot, ELEMENT_BYTES, ELEMENT_FLOATS};
use crate::config::GrowthConfig;
use crate::error::{Error, Result};
use std::time::Instant;
use tracing::debug;

/// A batch owns one buffer + layout pair and the slots carved out of it
///
/// Slots are index-stable: they are only ever flagged active or inactive,
/// never reordered. `active` lists the indices of occupied slots and is the
/// source for draw submission.
#[derive(Debug)]
pub struct Batch {
    id: BatchId,
    class: SizeClass,
    buffer: BufferHandle,
    layout: LayoutHandle,
    /// Total element capacity of the buffer
    capacity: usize,
    /// Element capacity of each slot
    slot_capacity: usize,
    slots: Vec<Slot>,
    active: Vec<usize>,
    growth_cycles: u32,
    initial_capacity: usize,
}

impl Batch {
    /// Allocate resources for a new batch of `slot_count` slots
    ///
    /// Slot `i` starts at element `i * slot_capacity`.
    pub fn create<B: BufferBackend>(
        backend: &mut B,
        id: BatchId,
        class: SizeClass,
        slot_capacity: usize,
        slot_count: usize,
    ) -> Result<Self> {
        let capacity = slot_capacity * slot_count;
        let buffer = backend.create_buffer(capacity * ELEMENT_BYTES)?;
        let layout = match backend.create_layout(&buffer) {
            Ok(layout) => layout,
            Err(e) => {
                backend.destroy_buffer(buffer);
                return Err(e);
            }
        };

        let slots = (0..slot_count)
            .map(|i| Slot::new(i * slot_capacity))
            .collect();

        debug!(
            target: "photonslab::memory",
            batch = %id,
            class = %class,
            slots = slot_count,
            capacity,
            "Created batch"
        );

        Ok(Self {
            id,
            class,
            buffer,
            layout,
            capacity,
            slot_capacity,
            slots,
            active: Vec::new(),
            growth_cycles: 0,
            initial_capacity: capacity,
        })
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    pub fn layout(&self) -> &LayoutHandle {
        &self.layout
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Indices of active slots, in submission order
    pub fn active_slots(&self) -> &[usize] {
        &self.active
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn growth_cycles(&self) -> u32 {
        self.growth_cycles
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    pub fn byte_size(&self) -> usize {
        self.capacity * ELEMENT_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.active.len() < self.slots.len()
    }

    /// Active/total slot ratio; 0 for a batch without slots
    pub fn utilization(&self) -> f64 {
        if self.slots.is_empty() {
            return 0.0;
        }
        self.active.len() as f64 / self.slots.len() as f64
    }

    /// Elements stored across all active slots
    pub fn stored_elements(&self) -> usize {
        self.active
            .iter()
            .map(|&i| self.slots[i].element_count)
            .sum()
    }

    /// Byte offset of a slot inside this batch's buffer
    ///
    /// Every upload, read-back and relocation goes through here.
    pub fn byte_offset(&self, slot: usize) -> Result<usize> {
        self.slots
            .get(slot)
            .map(|s| s.element_offset * ELEMENT_BYTES)
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "{} has no slot {} ({} slots)",
                    self.id,
                    slot,
                    self.slots.len()
                ))
            })
    }

    /// Claim the first inactive slot
    pub fn allocate(&mut self, entry: EntryId, element_count: usize) -> Result<usize> {
        let index = self
            .slots
            .iter()
            .position(|s| !s.is_active())
            .ok_or(Error::Full(self.id))?;
        self.claim(index, entry, element_count)?;
        Ok(index)
    }

    /// Claim a specific slot
    pub fn claim(&mut self, index: usize, entry: EntryId, element_count: usize) -> Result<()> {
        if element_count > self.slot_capacity {
            return Err(Error::InvariantViolation(format!(
                "{} elements do not fit {} slot of {}",
                element_count, self.id, self.slot_capacity
            )));
        }
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            Error::InvariantViolation(format!("{} has no slot {}", self.id, index))
        })?;
        if let Some(owner) = slot.owner {
            return Err(Error::InvariantViolation(format!(
                "{}[{}] already owned by entry {}",
                self.id, index, owner
            )));
        }

        slot.occupy(entry, element_count);
        self.active.push(index);
        Ok(())
    }

    /// Update the element count of an active slot
    pub fn set_element_count(&mut self, index: usize, element_count: usize) -> Result<()> {
        let capacity = self.slot_capacity;
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_active() && element_count <= capacity => {
                slot.element_count = element_count;
                Ok(())
            }
            _ => Err(Error::InvariantViolation(format!(
                "cannot store {} elements in {}[{}]",
                element_count, self.id, index
            ))),
        }
    }

    /// Mark a slot inactive and return its previous owner
    pub fn free(&mut self, index: usize) -> Option<EntryId> {
        let owner = self.slots.get_mut(index)?.release()?;
        if let Some(pos) = self.active.iter().position(|&i| i == index) {
            self.active.swap_remove(pos);
        }
        Some(owner)
    }

    /// Entries currently stored in this batch
    pub fn active_entries(&self) -> impl Iterator<Item = (usize, &Slot)> + '_ {
        self.active.iter().map(move |&i| (i, &self.slots[i]))
    }

    /// Whether doubling this batch is allowed right now
    pub fn can_grow(&self, growth: &GrowthConfig) -> bool {
        if !growth.enabled || self.class.is_unbounded() {
            return false;
        }
        if self.growth_cycles >= growth.max_cycles || self.slots.is_empty() {
            return false;
        }
        if self.utilization() < growth.utilization_threshold {
            return false;
        }
        (self.byte_size() as u64) * 2 <= growth.max_batch_bytes
    }

    /// Double the buffer and slot table
    ///
    /// Existing slots keep their offsets; the new slots continue after the
    /// old capacity. Buffer contents are copied into the replacement buffer,
    /// the layout is re-pointed at it and the old buffer is destroyed.
    /// Returns the entries stored before growth (their storage moved) and
    /// the indices of the new, inactive slots.
    pub fn grow<B: BufferBackend>(
        &mut self,
        backend: &mut B,
    ) -> Result<(Vec<EntryId>, std::ops::Range<usize>)> {
        let started = Instant::now();
        let affected: Vec<EntryId> = self.active_entries().filter_map(|(_, s)| s.owner).collect();

        let new_capacity = self.capacity * 2;
        let replacement = backend.create_buffer(new_capacity * ELEMENT_BYTES)?;
        let copied = backend
            .read(&self.buffer, 0, self.capacity * ELEMENT_FLOATS)
            .and_then(|contents| backend.write(&replacement, 0, &contents))
            .and_then(|_| backend.bind_layout(&self.layout, &replacement));
        if let Err(e) = copied {
            backend.destroy_buffer(replacement);
            return Err(e);
        }

        let old = std::mem::replace(&mut self.buffer, replacement);
        backend.destroy_buffer(old);

        let old_len = self.slots.len();
        let new_len = old_len * 2;
        let slot_capacity = self.slot_capacity;
        self.slots
            .extend((old_len..new_len).map(|i| Slot::new(i * slot_capacity)));
        self.capacity = new_capacity;
        self.growth_cycles += 1;

        debug!(
            target: "photonslab::memory",
            batch = %self.id,
            cycles = self.growth_cycles,
            slots = new_len,
            capacity = new_capacity,
            affected = affected.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Grew batch"
        );

        Ok((affected, old_len..new_len))
    }

    /// Destroy the buffer and layout
    pub fn release<B: BufferBackend>(self, backend: &mut B) {
        backend.destroy_layout(self.layout);
        backend.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::backend::HostBackend;

    fn small_batch(backend: &mut HostBackend, slots: usize) -> Result<Batch> {
        Batch::create(backend, BatchId(1), SizeClass::Small, 16, slots)
    }

    #[test]
    fn test_create_assigns_offsets() -> Result<()> {
        let mut backend = HostBackend::new();
        let batch = small_batch(&mut backend, 4)?;

        let offsets: Vec<_> = batch.slots().iter().map(|s| s.element_offset).collect();
        assert_eq!(offsets, vec![0, 16, 32, 48]);
        assert_eq!(batch.capacity(), 64);
        assert_eq!(batch.byte_offset(2)?, 32 * ELEMENT_BYTES);
        assert_eq!(backend.buffer_len(batch.buffer()), Some(64 * ELEMENT_BYTES));
        Ok(())
    }

    #[test]
    fn test_allocate_until_full() -> Result<()> {
        let mut backend = HostBackend::new();
        let mut batch = small_batch(&mut backend, 2)?;

        assert_eq!(batch.allocate(EntryId(1), 10)?, 0);
        assert_eq!(batch.allocate(EntryId(2), 16)?, 1);
        assert!(matches!(batch.allocate(EntryId(3), 1), Err(Error::Full(_))));
        assert_eq!(batch.utilization(), 1.0);
        assert_eq!(batch.stored_elements(), 26);
        Ok(())
    }

    #[test]
    fn test_free_reuses_first_inactive() -> Result<()> {
        let mut backend = HostBackend::new();
        let mut batch = small_batch(&mut backend, 4)?;
        for i in 0..4 {
            batch.allocate(EntryId(i), 1)?;
        }

        assert_eq!(batch.free(1), Some(EntryId(1)));
        assert_eq!(batch.free(1), None);
        assert_eq!(batch.active_count(), 3);
        assert!(!batch.active_slots().contains(&1));

        assert_eq!(batch.allocate(EntryId(9), 1)?, 1);
        Ok(())
    }

    #[test]
    fn test_claim_rejects_oversized_and_active() -> Result<()> {
        let mut backend = HostBackend::new();
        let mut batch = small_batch(&mut backend, 2)?;

        assert!(matches!(
            batch.claim(0, EntryId(1), 17),
            Err(Error::InvariantViolation(_))
        ));
        batch.claim(0, EntryId(1), 16)?;
        assert!(matches!(
            batch.claim(0, EntryId(2), 1),
            Err(Error::InvariantViolation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_can_grow_conditions() -> Result<()> {
        let mut backend = HostBackend::new();
        let mut batch = small_batch(&mut backend, 4)?;
        let growth = GrowthConfig::default();

        for i in 0..2 {
            batch.allocate(EntryId(i), 1)?;
        }
        assert!(!batch.can_grow(&growth), "50% is below the threshold");

        batch.allocate(EntryId(2), 1)?;
        assert!(batch.can_grow(&growth));

        let disabled = GrowthConfig {
            enabled: false,
            ..GrowthConfig::default()
        };
        assert!(!batch.can_grow(&disabled));

        let tight = GrowthConfig {
            max_batch_bytes: batch.byte_size() as u64,
            ..GrowthConfig::default()
        };
        assert!(!batch.can_grow(&tight));
        Ok(())
    }

    #[test]
    fn test_grow_preserves_offsets_and_data() -> Result<()> {
        let mut backend = HostBackend::new();
        let mut batch = small_batch(&mut backend, 2)?;
        let payload: Vec<f32> = (0..12).map(|i| i as f32).collect();

        let slot = batch.allocate(EntryId(5), 2)?;
        backend.write(batch.buffer(), batch.byte_offset(slot)?, &payload)?;
        batch.allocate(EntryId(6), 1)?;
        let old_buffer = batch.buffer().raw();

        let (affected, new_slots) = batch.grow(&mut backend)?;
        assert_eq!(affected.len(), 2);
        assert!(affected.contains(&EntryId(5)));
        assert_eq!(new_slots, 2..4);
        assert_eq!(batch.slot_count(), 4);
        assert_eq!(batch.capacity(), 64);
        assert_eq!(batch.growth_cycles(), 1);
        assert_eq!(batch.initial_capacity(), 32);
        assert_eq!(batch.slot(2).map(|s| s.element_offset), Some(32));

        assert_ne!(batch.buffer().raw(), old_buffer);
        assert_eq!(backend.buffer_count(), 1);
        assert_eq!(backend.read(batch.buffer(), batch.byte_offset(slot)?, 12)?, payload);
        Ok(())
    }

    #[test]
    fn test_grow_failure_leaves_batch_intact() -> Result<()> {
        let mut backend = HostBackend::with_byte_budget(32 * ELEMENT_BYTES + 8);
        let mut batch = small_batch(&mut backend, 2)?;
        batch.allocate(EntryId(1), 1)?;

        assert!(matches!(batch.grow(&mut backend), Err(Error::Resource(_))));
        assert_eq!(batch.slot_count(), 2);
        assert_eq!(batch.growth_cycles(), 0);
        assert_eq!(backend.buffer_count(), 1);
        Ok(())
    }

    #[test]
    fn test_release_destroys_resources() -> Result<()> {
        let mut backend = HostBackend::new();
        let batch = small_batch(&mut backend, 2)?;
        batch.release(&mut backend);
        assert_eq!(backend.buffer_count(), 0);
        assert_eq!(backend.layout_count(), 0);
        Ok(())
    }
}
