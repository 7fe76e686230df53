//! Bucketed Slot Allocator
//!
//! Packs many independently changing entries into a small number of large
//! vertex buffers. Each entry gets a fixed-capacity slot chosen by element
//! count, so one batched draw per buffer replaces one draw per entry.
//!
//! # Architecture
//!
//! ```text
//! MemoryController
//!   ├─→ BucketPool(small,   1024 el) → batch#001 [■■■□] batch#004 [■□□□]
//!   ├─→ BucketPool(medium,  4096 el) → batch#002 [■■□□]
//!   ├─→ BucketPool(large,  16384 el) → (none)
//!   ├─→ BucketPool(xlarge, 65536 el) → (none)
//!   └─→ BucketPool(xxlarge, exact)   → batch#003 [■]
//!
//! Directory
//!   └─→ entry #7  → (small, batch#001, slot 2)
//!   └─→ entry #12 → (xxlarge, batch#003, slot 0)
//!
//! Maintenance:
//!   ├─→ Growth (double a dense batch in place)
//!   └─→ Compaction (drain sparse batches, delete empty ones)
//! ```
//!
//! Every pool keeps a free list of inactive slots ordered by (batch, slot).
//! All buffer traffic goes through a [`BufferBackend`].

pub mod backend;
pub mod batch;
pub mod compactor;
pub mod controller;
pub mod metrics;
pub mod pool;
pub mod size_class;
pub mod slot;
pub mod stats;

pub use backend::{BufferBackend, BufferHandle, DrawCall, HostBackend, LayoutHandle};
pub use batch::Batch;
pub use compactor::{Candidate, CompactOutcome, Compactor};
pub use controller::{CompactionReport, MemoryController};
pub use metrics::AllocatorMetrics;
pub use pool::BucketPool;
pub use size_class::{BucketLayout, SizeClass};
pub use slot::{
    BatchId, EntryId, EntryLocation, Slot, SlotRef, ELEMENT_BYTES, ELEMENT_FLOATS, FLOAT_BYTES,
};
pub use stats::{BatchStats, BucketStats, Counters, Stats};
