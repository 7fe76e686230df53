//! Backing buffer resource boundary
//!
//! The controller never touches a graphics API directly. Everything it needs
//! from the resource layer goes through [`BufferBackend`]: buffer lifecycle,
//! layout (vertex attribute) descriptors, sub-range writes and reads, and
//! the batched draw primitive.

use super::slot::{ELEMENT_FLOATS, FLOAT_BYTES};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// Owned handle to one backing buffer
///
/// Not `Clone`: destroying a buffer consumes its handle.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(u32);

impl BufferHandle {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Owned handle to one buffer-layout descriptor
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct LayoutHandle(u32);

impl LayoutHandle {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Resource operations the memory controller depends on
///
/// Offsets are in bytes, payloads in floats. `multi_draw` takes element
/// (vertex) offsets and counts, one pair per sub-range.
pub trait BufferBackend {
    /// Allocate an uninitialized buffer of `byte_len` bytes
    fn create_buffer(&mut self, byte_len: usize) -> Result<BufferHandle>;

    /// Create a layout descriptor reading interleaved position/color from `buffer`
    fn create_layout(&mut self, buffer: &BufferHandle) -> Result<LayoutHandle>;

    /// Point an existing layout at a different buffer
    fn bind_layout(&mut self, layout: &LayoutHandle, buffer: &BufferHandle) -> Result<()>;

    /// Write `data` starting at `byte_offset`
    fn write(&mut self, buffer: &BufferHandle, byte_offset: usize, data: &[f32]) -> Result<()>;

    /// Read `float_len` floats starting at `byte_offset`
    fn read(&self, buffer: &BufferHandle, byte_offset: usize, float_len: usize) -> Result<Vec<f32>>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn destroy_layout(&mut self, layout: LayoutHandle);

    /// Submit one batched draw over the given element ranges
    fn multi_draw(&mut self, layout: &LayoutHandle, firsts: &[u32], counts: &[u32]) -> Result<()>;
}

/// One recorded `multi_draw` submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawCall {
    pub layout: u32,
    pub buffer: u32,
    pub firsts: Vec<u32>,
    pub counts: Vec<u32>,
}

/// In-process backend keeping every buffer in host memory
///
/// Used by tests and the simulation driver. Every access is bounds-checked
/// and every draw is recorded.
#[derive(Default)]
pub struct HostBackend {
    next_handle: u32,
    buffers: HashMap<u32, Vec<f32>>,
    layouts: HashMap<u32, u32>,
    draws: Vec<DrawCall>,
    byte_budget: Option<usize>,
    allocated_bytes: usize,
}

impl fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBackend")
            .field("buffers", &self.buffers.len())
            .field("layouts", &self.layouts.len())
            .field("allocated_bytes", &self.allocated_bytes)
            .finish()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail buffer creation once `bytes` would be exceeded
    pub fn with_byte_budget(bytes: usize) -> Self {
        Self {
            byte_budget: Some(bytes),
            ..Self::default()
        }
    }

    /// Number of live buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of live layouts
    pub fn layout_count(&self) -> usize {
        self.layouts.len()
    }

    /// Bytes held by live buffers
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Byte size of a live buffer
    pub fn buffer_len(&self, buffer: &BufferHandle) -> Option<usize> {
        self.buffers.get(&buffer.0).map(|b| b.len() * FLOAT_BYTES)
    }

    /// Draws recorded since the last call
    pub fn take_draw_calls(&mut self) -> Vec<DrawCall> {
        std::mem::take(&mut self.draws)
    }

    fn next_id(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn range(buffer: &[f32], byte_offset: usize, float_len: usize) -> Result<std::ops::Range<usize>> {
        if byte_offset % FLOAT_BYTES != 0 {
            return Err(Error::Resource(format!(
                "Unaligned byte offset {}",
                byte_offset
            )));
        }
        let start = byte_offset / FLOAT_BYTES;
        let end = start + float_len;
        if end > buffer.len() {
            return Err(Error::Resource(format!(
                "Range {}..{} exceeds buffer of {} floats",
                start,
                end,
                buffer.len()
            )));
        }
        Ok(start..end)
    }
}

impl BufferBackend for HostBackend {
    fn create_buffer(&mut self, byte_len: usize) -> Result<BufferHandle> {
        if byte_len % FLOAT_BYTES != 0 {
            return Err(Error::Resource(format!(
                "Buffer size {} is not a whole number of floats",
                byte_len
            )));
        }
        if let Some(budget) = self.byte_budget {
            if self.allocated_bytes + byte_len > budget {
                return Err(Error::Resource(format!(
                    "Out of buffer memory: {} + {} bytes exceeds budget of {}",
                    self.allocated_bytes, byte_len, budget
                )));
            }
        }

        let id = self.next_id();
        self.buffers.insert(id, vec![0.0; byte_len / FLOAT_BYTES]);
        self.allocated_bytes += byte_len;
        trace!(buffer = id, byte_len, "Created buffer");
        Ok(BufferHandle(id))
    }

    fn create_layout(&mut self, buffer: &BufferHandle) -> Result<LayoutHandle> {
        if !self.buffers.contains_key(&buffer.0) {
            return Err(Error::Resource(format!("Unknown buffer {}", buffer.0)));
        }
        let id = self.next_id();
        self.layouts.insert(id, buffer.0);
        Ok(LayoutHandle(id))
    }

    fn bind_layout(&mut self, layout: &LayoutHandle, buffer: &BufferHandle) -> Result<()> {
        if !self.buffers.contains_key(&buffer.0) {
            return Err(Error::Resource(format!("Unknown buffer {}", buffer.0)));
        }
        match self.layouts.get_mut(&layout.0) {
            Some(bound) => {
                *bound = buffer.0;
                Ok(())
            }
            None => Err(Error::Resource(format!("Unknown layout {}", layout.0))),
        }
    }

    fn write(&mut self, buffer: &BufferHandle, byte_offset: usize, data: &[f32]) -> Result<()> {
        let storage = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| Error::Resource(format!("Unknown buffer {}", buffer.0)))?;
        let range = Self::range(storage, byte_offset, data.len())?;
        storage[range].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, buffer: &BufferHandle, byte_offset: usize, float_len: usize) -> Result<Vec<f32>> {
        let storage = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| Error::Resource(format!("Unknown buffer {}", buffer.0)))?;
        let range = Self::range(storage, byte_offset, float_len)?;
        Ok(storage[range].to_vec())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(storage) = self.buffers.remove(&buffer.0) {
            self.allocated_bytes -= storage.len() * FLOAT_BYTES;
            trace!(buffer = buffer.0, "Destroyed buffer");
        }
    }

    fn destroy_layout(&mut self, layout: LayoutHandle) {
        self.layouts.remove(&layout.0);
    }

    fn multi_draw(&mut self, layout: &LayoutHandle, firsts: &[u32], counts: &[u32]) -> Result<()> {
        if firsts.len() != counts.len() {
            return Err(Error::Resource(format!(
                "Draw ranges mismatch: {} firsts, {} counts",
                firsts.len(),
                counts.len()
            )));
        }
        let buffer = *self
            .layouts
            .get(&layout.0)
            .ok_or_else(|| Error::Resource(format!("Unknown layout {}", layout.0)))?;
        let floats = self.buffers.get(&buffer).map(Vec::len).unwrap_or(0);
        let elements = floats / ELEMENT_FLOATS;
        for (&first, &count) in firsts.iter().zip(counts) {
            if first as usize + count as usize > elements {
                return Err(Error::Resource(format!(
                    "Draw range {}+{} exceeds {} elements",
                    first, count, elements
                )));
            }
        }

        self.draws.push(DrawCall {
            layout: layout.0,
            buffer,
            firsts: firsts.to_vec(),
            counts: counts.to_vec(),
        });
        Ok(())
    }
}
