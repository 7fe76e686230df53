// PhotonSlab - size-bucketed slot allocator for shared vertex buffers
// Packs many independently churning entries into a few large buffers

#![warn(rust_2018_idioms)]

pub mod config;
pub mod frame;
pub mod memory;

// Re-exports for convenience
pub use config::AllocatorConfig;
pub use frame::{Frame, FrameLoop, FrameSummary};
pub use memory::{
    BufferBackend, EntryId, HostBackend, MemoryController, SizeClass, Stats,
};

/// PhotonSlab error types
pub mod error {
    use crate::memory::{BatchId, EntryId};
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid payload: {0}")]
        InvalidPayload(String),

        #[error("Not found: entry {0}")]
        NotFound(EntryId),

        #[error("Batch full: {0} has no inactive slot")]
        Full(BatchId),

        #[error("Resource error: {0}")]
        Resource(String),

        #[error("Invariant violation: {0}")]
        InvariantViolation(String),

        #[error("Integrity check failed with {} errors", .0.len())]
        Integrity(Vec<String>),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
