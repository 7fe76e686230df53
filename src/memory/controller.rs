//! Memory controller: entry directory and allocation policy
//!
//! Owns every bucket pool, the entry -> slot directory and the backend.
//! Nothing else writes to the backing buffers.

use super::backend::BufferBackend;
use super::batch::Batch;
use super::compactor::Compactor;
use super::pool::BucketPool;
use super::size_class::{BucketLayout, SizeClass};
use super::slot::{BatchId, EntryId, EntryLocation, SlotRef, ELEMENT_FLOATS};
use super::stats::{Counters, Stats};
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, error, warn};

/// Outcome of one `try_compaction` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Batches below the utilization floor at scan time
    pub candidates: usize,
    /// Batches that had at least one slot relocated
    pub compacted: usize,
    /// Batches deleted (already empty, or emptied by relocation)
    pub deleted: usize,
    pub slots_moved: usize,
    /// Candidates left for a later pass because of the per-pass cap
    pub deferred: usize,
}

/// Size-bucketed slot allocator over a [`BufferBackend`]
pub struct MemoryController<B: BufferBackend> {
    backend: B,
    config: AllocatorConfig,
    layout: BucketLayout,
    /// One pool per size class, indexed by `SizeClass::index`
    pools: Vec<BucketPool>,
    directory: HashMap<EntryId, EntryLocation>,
    pending_reuploads: HashSet<EntryId>,
    compactor: Compactor,
    counters: Counters,
    next_batch_id: u64,
}

impl<B: BufferBackend> std::fmt::Debug for MemoryController<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryController")
            .field("entries", &self.directory.len())
            .field("pending_reuploads", &self.pending_reuploads.len())
            .field("next_batch_id", &self.next_batch_id)
            .finish()
    }
}

impl<B: BufferBackend> MemoryController<B> {
    /// Create a controller with the default configuration
    pub fn new(backend: B) -> Self {
        Self::build(backend, AllocatorConfig::default())
    }

    /// Create a controller with a validated configuration
    pub fn with_config(backend: B, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(backend, config))
    }

    fn build(backend: B, config: AllocatorConfig) -> Self {
        let layout = BucketLayout::new(&config.buckets);
        let pools = SizeClass::ALL
            .iter()
            .map(|&class| BucketPool::new(class, &layout, config.free_list.sorted))
            .collect();

        Self {
            backend,
            compactor: Compactor::new(&config.compaction),
            config,
            layout,
            pools,
            directory: HashMap::new(),
            pending_reuploads: HashSet::new(),
            counters: Counters::default(),
            next_batch_id: 1,
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn layout(&self) -> &BucketLayout {
        &self.layout
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable backend access, for inspecting recorded submissions
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn pool(&self, class: SizeClass) -> &BucketPool {
        &self.pools[class.index()]
    }

    pub fn pools(&self) -> &[BucketPool] {
        &self.pools
    }

    /// Number of entries with a slot
    pub fn len(&self) -> usize {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    pub fn contains(&self, entry: EntryId) -> bool {
        self.directory.contains_key(&entry)
    }

    pub fn location(&self, entry: EntryId) -> Option<EntryLocation> {
        self.directory.get(&entry).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.directory.keys().copied()
    }

    /// Make sure `entry` has a slot holding `payload`
    ///
    /// `payload` is interleaved x, y, r, g, b, a per element. A payload that
    /// fits the entry's current slot is rewritten in place; otherwise the
    /// old slot is released and a slot of the matching class is acquired
    /// (free list, then spare batch capacity, then growth, then a new batch).
    pub fn ensure_slot(&mut self, entry: EntryId, payload: &[f32]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::InvalidPayload(format!(
                "cannot allocate empty payload for entry {}",
                entry
            )));
        }
        if payload.len() % ELEMENT_FLOATS != 0 {
            return Err(Error::InvalidPayload(format!(
                "payload must be a multiple of {} floats (x,y,r,g,b,a), got {}",
                ELEMENT_FLOATS,
                payload.len()
            )));
        }
        let element_count = payload.len() / ELEMENT_FLOATS;

        if let Some(existing) = self.location(entry) {
            let capacity = self
                .pools[existing.class.index()]
                .batch(existing.batch)
                .map(Batch::slot_capacity)
                .ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "entry {} points at missing {}",
                        entry, existing.batch
                    ))
                })?;

            if element_count <= capacity {
                return self.update_in_place(entry, existing, payload, element_count);
            }

            debug!(
                target: "photonslab::memory",
                %entry,
                from = %existing.class,
                elements = element_count,
                capacity,
                "Payload outgrew its slot, reallocating"
            );
            self.remove_cluster(entry)?;
        }

        let class = self.layout.classify(element_count);
        let slot = self.acquire_slot(class, entry, element_count)?;

        if let Err(e) = self.upload(class, slot, payload) {
            self.pools[class.index()].free_slot(slot)?;
            return Err(e);
        }

        self.directory.insert(
            entry,
            EntryLocation {
                class,
                batch: slot.batch,
                slot: slot.slot,
                element_count,
            },
        );
        Ok(())
    }

    fn update_in_place(
        &mut self,
        entry: EntryId,
        location: EntryLocation,
        payload: &[f32],
        element_count: usize,
    ) -> Result<()> {
        self.upload(location.class, location.slot_ref(), payload)?;

        let batch = self.pools[location.class.index()]
            .batch_mut(location.batch)
            .ok_or_else(|| Error::InvariantViolation(format!("{} vanished", location.batch)))?;
        batch.set_element_count(location.slot, element_count)?;

        if let Some(loc) = self.directory.get_mut(&entry) {
            loc.element_count = element_count;
        }
        Ok(())
    }

    /// Write a payload at a slot's offset
    fn upload(&mut self, class: SizeClass, slot: SlotRef, payload: &[f32]) -> Result<()> {
        let batch = self.pools[class.index()]
            .batch(slot.batch)
            .ok_or_else(|| Error::InvariantViolation(format!("{} vanished", slot.batch)))?;
        let offset = batch.byte_offset(slot.slot)?;
        self.backend.write(batch.buffer(), offset, payload)
    }

    /// Claim a slot for `element_count` elements in the pool of `class`
    fn acquire_slot(&mut self, class: SizeClass, entry: EntryId, element_count: usize) -> Result<SlotRef> {
        let idx = class.index();
        let unbounded = class.is_unbounded();
        let fits = |batch: &Batch, slot: usize| {
            !unbounded
                || batch
                    .slot(slot)
                    .map_or(false, |s| element_count <= batch.capacity() - s.element_offset)
        };

        if let Some(slot) = self.pools[idx].take_free_slot_where(fits) {
            self.pools[idx].claim(slot, entry, element_count)?;
            return Ok(slot);
        }

        let spare = self.pools[idx]
            .batches()
            .iter()
            .find(|b| b.has_spare_capacity() && (!unbounded || b.capacity() >= element_count))
            .map(Batch::id);
        if let Some(batch) = spare {
            let slot = self.pools[idx].allocate_in(batch, entry, element_count)?;
            return Ok(SlotRef::new(batch, slot));
        }

        if !unbounded {
            if let Some(batch) = self.grow_some_batch(class)? {
                let slot = self.pools[idx].allocate_in(batch, entry, element_count)?;
                return Ok(SlotRef::new(batch, slot));
            }
        }

        let batch = self.create_batch(class, element_count)?;
        let slot = self.pools[idx].allocate_in(batch, entry, element_count)?;
        Ok(SlotRef::new(batch, slot))
    }

    /// Double the first growable batch of a pool
    ///
    /// Entries that lived in the batch are queued for re-upload.
    fn grow_some_batch(&mut self, class: SizeClass) -> Result<Option<BatchId>> {
        let idx = class.index();
        let growth = &self.config.growth;
        let candidate = self.pools[idx]
            .batches()
            .iter()
            .find(|b| b.can_grow(growth))
            .map(Batch::id);

        let batch = match candidate {
            Some(batch) => batch,
            None => return Ok(None),
        };

        let started = Instant::now();
        let affected = self.pools[idx].grow_batch(batch, &mut self.backend)?;

        self.counters.growth_events += 1;
        self.counters.last_growth_time_us = started.elapsed().as_secs_f64() * 1e6;
        debug!(
            target: "photonslab::memory",
            %batch,
            %class,
            affected = affected.len(),
            "Queued entries for re-upload after growth"
        );
        self.pending_reuploads.extend(affected);
        Ok(Some(batch))
    }

    /// Create a batch sized for `class`
    ///
    /// Unbounded batches get a single slot sized exactly to the payload.
    fn create_batch(&mut self, class: SizeClass, element_count: usize) -> Result<BatchId> {
        let (slot_capacity, slot_count) = match self.layout.slot_capacity(class) {
            Some(capacity) => (capacity, self.layout.slots_per_batch(class)),
            None => (element_count, 1),
        };

        let id = BatchId(self.next_batch_id);
        let batch = Batch::create(&mut self.backend, id, class, slot_capacity, slot_count)
            .map_err(|e| {
                error!(target: "photonslab::memory", %class, error = %e, "Failed to create batch");
                e
            })?;
        self.next_batch_id += 1;
        self.pools[class.index()].push_batch(batch)?;
        Ok(id)
    }

    /// Release an entry's slot and forget its location
    pub fn remove_cluster(&mut self, entry: EntryId) -> Result<()> {
        let location = self.location(entry).ok_or(Error::NotFound(entry))?;

        let owner = self.pools[location.class.index()].free_slot(location.slot_ref())?;
        if owner != entry {
            return Err(Error::InvariantViolation(format!(
                "{} owned by entry {}, expected {}",
                location.slot_ref(),
                owner,
                entry
            )));
        }

        self.directory.remove(&entry);
        self.pending_reuploads.remove(&entry);
        Ok(())
    }

    /// Read back an entry's stored payload
    pub fn read_entry(&self, entry: EntryId) -> Result<Vec<f32>> {
        let location = self.location(entry).ok_or(Error::NotFound(entry))?;
        let batch = self.pools[location.class.index()]
            .batch(location.batch)
            .ok_or_else(|| Error::InvariantViolation(format!("{} vanished", location.batch)))?;
        self.backend.read(
            batch.buffer(),
            batch.byte_offset(location.slot)?,
            location.element_count * ELEMENT_FLOATS,
        )
    }

    /// Entries whose storage moved since the last call
    pub fn get_and_clear_pending_reuploads(&mut self) -> HashSet<EntryId> {
        std::mem::take(&mut self.pending_reuploads)
    }

    pub fn pending_reuploads(&self) -> &HashSet<EntryId> {
        &self.pending_reuploads
    }

    /// Submit one batched draw per non-empty batch
    ///
    /// Order is size class, then batch id. Returns the number of draws.
    pub fn draw(&mut self) -> Result<usize> {
        let mut draws = 0;
        for pool in &self.pools {
            for batch in pool.batches() {
                if batch.is_empty() {
                    continue;
                }
                let (firsts, counts): (Vec<u32>, Vec<u32>) = batch
                    .active_entries()
                    .map(|(_, s)| (s.element_offset as u32, s.element_count as u32))
                    .unzip();
                self.backend.multi_draw(batch.layout(), &firsts, &counts)?;
                draws += 1;
            }
        }
        self.counters.draw_calls_per_frame = draws;
        Ok(draws)
    }

    pub fn stats(&self) -> Stats {
        Stats::collect(&self.pools, self.directory.len(), &self.counters)
    }

    /// Emit the utilization report at debug level
    pub fn log_stats(&self) {
        for line in self.stats().render_report().lines() {
            debug!(target: "photonslab::memory", "{}", line);
        }
    }

    /// Relocate sparse batches and delete empty ones
    ///
    /// Empty candidates are always deleted. At most
    /// `compaction.max_batches_per_cycle` batches have slots relocated per
    /// pass; the rest are picked up by a later scan.
    pub fn try_compaction(&mut self) -> Result<CompactionReport> {
        let mut report = CompactionReport::default();
        if !self.compactor.is_enabled() {
            return Ok(report);
        }

        let candidates = self.compactor.scan(&self.pools);
        report.candidates = candidates.len();
        if candidates.is_empty() {
            return Ok(report);
        }

        let started = Instant::now();
        let max_per_cycle = self.config.compaction.max_batches_per_cycle;
        let floor = self.config.compaction.utilization_floor;

        for candidate in &candidates {
            let idx = candidate.class.index();
            let (empty, sparse) = match self.pools[idx].batch(candidate.batch) {
                Some(batch) => (batch.is_empty(), batch.utilization() < floor),
                None => continue,
            };

            if empty {
                debug!(target: "photonslab::compaction", batch = %candidate.batch, "Batch is empty, deleting");
                self.delete_batch(candidate.class, candidate.batch)?;
                report.deleted += 1;
                self.counters.compaction_events += 1;
                self.counters.batch_deletions += 1;
                continue;
            }
            if !sparse {
                continue;
            }
            if report.compacted >= max_per_cycle {
                report.deferred += 1;
                continue;
            }

            debug!(
                target: "photonslab::compaction",
                batch = %candidate.batch,
                class = %candidate.class,
                active = candidate.active,
                "Compacting batch"
            );
            let outcome = self.compactor.compact(
                &mut self.pools[idx],
                &mut self.directory,
                &mut self.backend,
                candidate.batch,
            )?;

            if outcome.slots_moved > 0 {
                report.compacted += 1;
                report.slots_moved += outcome.slots_moved;
                self.counters.compaction_events += 1;
                self.counters.slots_relocated += outcome.slots_moved as u64;
                self.counters.bytes_relocated += outcome.bytes_moved as u64;
            }

            if outcome.now_empty {
                self.delete_batch(candidate.class, candidate.batch)?;
                report.deleted += 1;
                self.counters.batch_deletions += 1;
            } else {
                debug!(
                    target: "photonslab::compaction",
                    batch = %candidate.batch,
                    "Batch still has active slots after compaction"
                );
            }
        }

        if report.deferred > 0 {
            debug!(
                target: "photonslab::compaction",
                max_per_cycle,
                deferred = report.deferred,
                "Reached compaction limit for this pass"
            );
        }
        if report.compacted > 0 || report.deleted > 0 {
            self.counters.last_compaction_time_us = started.elapsed().as_secs_f64() * 1e6;
        }
        debug!(
            target: "photonslab::compaction",
            candidates = report.candidates,
            compacted = report.compacted,
            deleted = report.deleted,
            "Compaction pass completed"
        );
        Ok(report)
    }

    /// Delete an empty batch and release its resources
    fn delete_batch(&mut self, class: SizeClass, id: BatchId) -> Result<()> {
        let batch = self.pools[class.index()].take_batch(id)?;
        debug!(target: "photonslab::compaction", batch = %id, %class, "Deleted batch");
        batch.release(&mut self.backend);
        Ok(())
    }

    /// Cross-check the directory against the pools
    ///
    /// Every entry must point at an existing batch of its class, at an active
    /// slot it owns; every pool's active slots must match its entries; every
    /// inactive slot must be on the free list exactly once. Read-only.
    pub fn validate_integrity(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut per_class = vec![0usize; SizeClass::ALL.len()];

        let mut entries: Vec<_> = self.directory.iter().collect();
        entries.sort_by_key(|(id, _)| **id);

        for (&entry, loc) in entries {
            per_class[loc.class.index()] += 1;
            let batch = match self.pools[loc.class.index()].batch(loc.batch) {
                Some(batch) => batch,
                None => {
                    errors.push(format!("entry {} references deleted {}", entry, loc.batch));
                    continue;
                }
            };
            let slot = match batch.slot(loc.slot) {
                Some(slot) => slot,
                None => {
                    errors.push(format!(
                        "entry {} has invalid slot index {} ({} has {} slots)",
                        entry,
                        loc.slot,
                        loc.batch,
                        batch.slot_count()
                    ));
                    continue;
                }
            };
            if !slot.is_active() {
                errors.push(format!("entry {} references inactive {}", entry, loc.slot_ref()));
            } else if slot.owner != Some(entry) {
                errors.push(format!(
                    "entry {} slot mismatch: {} is owned by {:?}",
                    entry,
                    loc.slot_ref(),
                    slot.owner
                ));
            }
            if slot.element_count != loc.element_count {
                errors.push(format!(
                    "entry {} records {} elements, slot holds {}",
                    entry, loc.element_count, slot.element_count
                ));
            }
        }

        for pool in &self.pools {
            let active = pool.active_slot_count();
            if active != per_class[pool.class().index()] {
                errors.push(format!(
                    "{} pool has {} active slots for {} entries",
                    pool.class(),
                    active,
                    per_class[pool.class().index()]
                ));
            }

            let mut listed = HashSet::new();
            for r in pool.free_slots() {
                if !listed.insert(*r) {
                    errors.push(format!("{} is on the {} free list twice", r, pool.class()));
                }
                match pool.batch(r.batch).and_then(|b| b.slot(r.slot)) {
                    None => errors.push(format!("free list references missing {}", r)),
                    Some(s) if s.is_active() => {
                        errors.push(format!("{} is both active and on the free list", r))
                    }
                    Some(_) => {}
                }
            }
            for batch in pool.batches() {
                for (i, slot) in batch.slots().iter().enumerate() {
                    let r = SlotRef::new(batch.id(), i);
                    if !slot.is_active() && !listed.contains(&r) {
                        errors.push(format!("{} is neither active nor free", r));
                    }
                }
            }
        }

        if errors.is_empty() {
            return Ok(());
        }

        error!(count = errors.len(), "Integrity check failed");
        for e in &errors {
            error!("  - {}", e);
        }
        Err(Error::Integrity(errors))
    }

    /// Destroy every batch and forget all entries
    pub fn release_all(&mut self) {
        let mut released = 0;
        for pool in &mut self.pools {
            for batch in pool.drain_batches() {
                batch.release(&mut self.backend);
                released += 1;
            }
        }
        if !self.directory.is_empty() {
            warn!(
                target: "photonslab::memory",
                entries = self.directory.len(),
                "Releasing resources with live entries"
            );
        }
        self.directory.clear();
        self.pending_reuploads.clear();
        debug!(target: "photonslab::memory", batches = released, "Released all batches");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BucketSpec;
    use crate::memory::backend::HostBackend;
    use crate::memory::slot::ELEMENT_BYTES;

    fn payload(elements: usize, seed: f32) -> Vec<f32> {
        (0..elements * ELEMENT_FLOATS).map(|i| seed + i as f32).collect()
    }

    /// Tiny buckets so tests stay readable: small holds 4 elements x 4 slots
    fn tiny_config() -> AllocatorConfig {
        let mut config = AllocatorConfig::default();
        config.buckets.small = BucketSpec::new(4, 4);
        config.buckets.medium = BucketSpec::new(8, 2);
        config.buckets.large = BucketSpec::new(16, 2);
        config.buckets.xlarge = BucketSpec::new(32, 2);
        config
    }

    fn controller(config: AllocatorConfig) -> Result<MemoryController<HostBackend>> {
        MemoryController::with_config(HostBackend::new(), config)
    }

    #[test]
    fn test_rejects_invalid_payloads() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        assert!(matches!(
            mc.ensure_slot(EntryId(1), &[]),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            mc.ensure_slot(EntryId(1), &[0.0; 7]),
            Err(Error::InvalidPayload(_))
        ));
        assert!(mc.is_empty());
        assert_eq!(mc.stats().total_batches, 0);
        Ok(())
    }

    #[test]
    fn test_first_allocation_creates_batch() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        mc.ensure_slot(EntryId(1), &payload(3, 0.0))?;

        let loc = mc.location(EntryId(1)).ok_or(Error::NotFound(EntryId(1)))?;
        assert_eq!(loc.class, SizeClass::Small);
        assert_eq!(loc.batch, BatchId(1));
        assert_eq!(loc.slot, 0);
        assert_eq!(loc.element_count, 3);

        let pool = mc.pool(SizeClass::Small);
        assert_eq!(pool.batch_count(), 1);
        assert_eq!(pool.free_len(), 3);
        mc.validate_integrity()
    }

    #[test]
    fn test_in_place_update_keeps_slot() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        mc.ensure_slot(EntryId(1), &payload(2, 0.0))?;
        let before = mc.location(EntryId(1));

        mc.ensure_slot(EntryId(1), &payload(4, 100.0))?;
        let after = mc.location(EntryId(1)).ok_or(Error::NotFound(EntryId(1)))?;
        assert_eq!(before.map(|l| l.slot_ref()), Some(after.slot_ref()));
        assert_eq!(after.element_count, 4);
        assert_eq!(mc.read_entry(EntryId(1))?, payload(4, 100.0));
        mc.validate_integrity()
    }

    #[test]
    fn test_outgrown_payload_moves_class() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        mc.ensure_slot(EntryId(1), &payload(4, 0.0))?;
        mc.ensure_slot(EntryId(1), &payload(6, 1.0))?;

        let loc = mc.location(EntryId(1)).ok_or(Error::NotFound(EntryId(1)))?;
        assert_eq!(loc.class, SizeClass::Medium);
        assert_eq!(mc.pool(SizeClass::Small).active_slot_count(), 0);
        assert_eq!(mc.pool(SizeClass::Small).free_len(), 4);
        assert_eq!(mc.read_entry(EntryId(1))?, payload(6, 1.0));
        mc.validate_integrity()
    }

    #[test]
    fn test_remove_cluster() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        mc.ensure_slot(EntryId(1), &payload(1, 0.0))?;
        mc.ensure_slot(EntryId(2), &payload(1, 0.0))?;

        mc.remove_cluster(EntryId(1))?;
        assert!(!mc.contains(EntryId(1)));
        assert!(matches!(
            mc.remove_cluster(EntryId(1)),
            Err(Error::NotFound(EntryId(1)))
        ));
        assert!(matches!(mc.read_entry(EntryId(1)), Err(Error::NotFound(_))));

        // Freed slot 0 is reused first
        mc.ensure_slot(EntryId(3), &payload(1, 0.0))?;
        assert_eq!(mc.location(EntryId(3)).map(|l| l.slot), Some(0));
        mc.validate_integrity()
    }

    #[test]
    fn test_growth_before_new_batch() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        for i in 0..4 {
            mc.ensure_slot(EntryId(i), &payload(4, i as f32))?;
        }
        mc.ensure_slot(EntryId(4), &payload(4, 4.0))?;

        let pool = mc.pool(SizeClass::Small);
        assert_eq!(pool.batch_count(), 1);
        assert_eq!(pool.batches()[0].slot_count(), 8);
        assert_eq!(mc.location(EntryId(4)).map(|l| l.slot), Some(4));
        assert_eq!(mc.stats().counters.growth_events, 1);

        let pending = mc.get_and_clear_pending_reuploads();
        assert_eq!(pending, (0..4).map(EntryId).collect::<HashSet<_>>());
        assert!(mc.get_and_clear_pending_reuploads().is_empty());

        for i in 0..5 {
            assert_eq!(mc.read_entry(EntryId(i))?, payload(4, i as f32));
        }
        mc.validate_integrity()
    }

    #[test]
    fn test_growth_stops_at_max_cycles() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        // 4 -> 8 -> 16 slots, then a second batch
        for i in 0..17 {
            mc.ensure_slot(EntryId(i), &payload(1, 0.0))?;
        }
        let pool = mc.pool(SizeClass::Small);
        assert_eq!(pool.batch_count(), 2);
        assert_eq!(pool.batches()[0].growth_cycles(), 2);
        assert_eq!(pool.batches()[0].slot_count(), 16);
        assert_eq!(mc.stats().counters.growth_events, 2);
        mc.validate_integrity()
    }

    #[test]
    fn test_growth_respects_byte_ceiling() -> Result<()> {
        let mut config = tiny_config();
        config.growth.max_batch_bytes = (4 * 4 * ELEMENT_BYTES) as u64;
        let mut mc = controller(config)?;
        for i in 0..5 {
            mc.ensure_slot(EntryId(i), &payload(1, 0.0))?;
        }
        assert_eq!(mc.pool(SizeClass::Small).batch_count(), 2);
        assert_eq!(mc.stats().counters.growth_events, 0);
        Ok(())
    }

    #[test]
    fn test_unbounded_entries_get_exact_batches() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        mc.ensure_slot(EntryId(1), &payload(40, 0.0))?;
        mc.ensure_slot(EntryId(2), &payload(50, 0.0))?;

        let pool = mc.pool(SizeClass::XXLarge);
        assert_eq!(pool.batch_count(), 2);
        assert_eq!(pool.batches()[0].capacity(), 40);
        assert_eq!(pool.batches()[1].capacity(), 50);

        // Shrinking stays in place, growing beyond the batch moves
        mc.ensure_slot(EntryId(1), &payload(35, 0.0))?;
        assert_eq!(mc.location(EntryId(1)).map(|l| l.batch), Some(BatchId(1)));
        mc.ensure_slot(EntryId(1), &payload(45, 0.0))?;
        assert_eq!(mc.location(EntryId(1)).map(|l| l.batch), Some(BatchId(3)));
        mc.validate_integrity()
    }

    #[test]
    fn test_unbounded_free_slot_must_fit() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        mc.ensure_slot(EntryId(1), &payload(40, 0.0))?;
        mc.remove_cluster(EntryId(1))?;

        mc.ensure_slot(EntryId(2), &payload(60, 0.0))?;
        assert_eq!(mc.location(EntryId(2)).map(|l| l.batch), Some(BatchId(2)));
        // The too-small slot is still free for a later fit
        assert_eq!(mc.pool(SizeClass::XXLarge).free_len(), 1);

        mc.ensure_slot(EntryId(3), &payload(33, 0.0))?;
        assert_eq!(mc.location(EntryId(3)).map(|l| l.batch), Some(BatchId(1)));
        assert_eq!(mc.pool(SizeClass::XXLarge).free_len(), 0);
        mc.validate_integrity()
    }

    #[test]
    fn test_draw_order_and_skips_empty() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        mc.ensure_slot(EntryId(1), &payload(6, 0.0))?;
        mc.ensure_slot(EntryId(2), &payload(2, 0.0))?;
        mc.ensure_slot(EntryId(3), &payload(3, 0.0))?;
        mc.ensure_slot(EntryId(4), &payload(40, 0.0))?;
        mc.remove_cluster(EntryId(4))?;

        assert_eq!(mc.draw()?, 2);
        let draws = mc.backend_mut().take_draw_calls();
        assert_eq!(draws.len(), 2);
        // small first
        assert_eq!(draws[0].firsts, vec![0, 4]);
        assert_eq!(draws[0].counts, vec![2, 3]);
        assert_eq!(draws[1].counts, vec![6]);
        assert_eq!(mc.stats().counters.draw_calls_per_frame, 2);
        Ok(())
    }

    #[test]
    fn test_compaction_relocates_and_deletes() -> Result<()> {
        let mut config = tiny_config();
        config.growth.enabled = false;
        config.compaction.utilization_floor = 0.3;
        let mut mc = controller(config)?;
        for i in 0..8 {
            mc.ensure_slot(EntryId(i), &payload(2, i as f32))?;
        }
        for i in [1, 4, 5, 6] {
            mc.remove_cluster(EntryId(i))?;
        }
        assert_eq!(mc.pool(SizeClass::Small).batch_count(), 2);

        let report = mc.try_compaction()?;
        assert_eq!(report.compacted, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.slots_moved, 1);

        assert_eq!(mc.pool(SizeClass::Small).batch_count(), 1);
        assert_eq!(mc.location(EntryId(7)).map(|l| l.batch), Some(BatchId(1)));
        assert_eq!(mc.read_entry(EntryId(7))?, payload(2, 7.0));
        assert_eq!(mc.backend().buffer_count(), 1);

        let stats = mc.stats();
        assert_eq!(stats.counters.batch_deletions, 1);
        assert_eq!(stats.counters.slots_relocated, 1);
        assert_eq!(stats.counters.bytes_relocated, (2 * ELEMENT_BYTES) as u64);
        mc.validate_integrity()
    }

    #[test]
    fn test_compaction_deletes_all_empty_batches() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        for i in 0..3 {
            mc.ensure_slot(EntryId(i), &payload(40 + i as usize, 0.0))?;
        }
        for i in 0..3 {
            mc.remove_cluster(EntryId(i))?;
        }

        let report = mc.try_compaction()?;
        assert_eq!(report.deleted, 3);
        assert_eq!(mc.stats().total_batches, 0);
        assert_eq!(mc.pool(SizeClass::XXLarge).free_len(), 0);
        assert_eq!(mc.backend().buffer_count(), 0);
        mc.validate_integrity()
    }

    #[test]
    fn test_compaction_cap_defers_work() -> Result<()> {
        let mut config = tiny_config();
        config.growth.enabled = false;
        config.compaction.utilization_floor = 0.5;
        let mut mc = controller(config)?;
        for i in 0..12 {
            mc.ensure_slot(EntryId(i), &payload(1, 0.0))?;
        }
        // batch1: 2/4, batch2: 1/4, batch3: 1/4
        for i in [0, 1, 5, 6, 7, 9, 10, 11] {
            mc.remove_cluster(EntryId(i))?;
        }

        let report = mc.try_compaction()?;
        assert_eq!(report.compacted, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(mc.pool(SizeClass::Small).batch_count(), 2);

        let report = mc.try_compaction()?;
        assert_eq!(report.compacted, 1);
        assert_eq!(mc.pool(SizeClass::Small).batch_count(), 1);
        mc.validate_integrity()
    }

    #[test]
    fn test_resource_failure_propagates() -> Result<()> {
        let budget = 4 * 4 * ELEMENT_BYTES;
        let mut config = tiny_config();
        config.growth.enabled = false;
        let mut mc = MemoryController::with_config(HostBackend::with_byte_budget(budget), config)?;
        for i in 0..4 {
            mc.ensure_slot(EntryId(i), &payload(1, 0.0))?;
        }

        assert!(matches!(
            mc.ensure_slot(EntryId(9), &payload(1, 0.0)),
            Err(Error::Resource(_))
        ));
        assert!(!mc.contains(EntryId(9)));
        assert_eq!(mc.len(), 4);
        mc.validate_integrity()
    }

    #[test]
    fn test_validate_integrity_reports_corruption() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        mc.ensure_slot(EntryId(1), &payload(1, 0.0))?;
        mc.directory.insert(
            EntryId(2),
            EntryLocation {
                class: SizeClass::Small,
                batch: BatchId(1),
                slot: 0,
                element_count: 1,
            },
        );

        match mc.validate_integrity() {
            Err(Error::Integrity(errors)) => {
                assert!(errors.iter().any(|e| e.contains("slot mismatch")));
                assert!(errors.iter().any(|e| e.contains("active slots for 2 entries")));
            }
            other => panic!("expected integrity failure, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_release_all() -> Result<()> {
        let mut mc = controller(tiny_config())?;
        mc.ensure_slot(EntryId(1), &payload(1, 0.0))?;
        mc.ensure_slot(EntryId(2), &payload(50, 0.0))?;

        mc.release_all();
        assert!(mc.is_empty());
        assert_eq!(mc.backend().buffer_count(), 0);
        assert_eq!(mc.backend().layout_count(), 0);
        assert_eq!(mc.stats().total_batches, 0);
        Ok(())
    }
}
