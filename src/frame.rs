//! Host frame loop: prepare, then draw, then periodic maintenance
//!
//! A [`Frame`] mutably borrows its [`FrameLoop`], so allocation for a frame
//! cannot overlap with that frame's draw submission.

use crate::config::CadenceConfig;
use crate::error::Result;
use crate::memory::{BufferBackend, CompactionReport, EntryId, MemoryController};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

/// What happened when a frame finished
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameSummary {
    pub frame: u64,
    pub draw_calls: usize,
    /// Set when a compaction pass ran this frame
    #[serde(skip)]
    pub compaction: Option<CompactionReport>,
    pub integrity_checked: bool,
}

impl FrameSummary {
    pub fn compacted(&self) -> bool {
        self.compaction.is_some()
    }
}

/// Drives a controller one frame at a time
#[derive(Debug)]
pub struct FrameLoop<B: BufferBackend> {
    controller: MemoryController<B>,
    cadence: CadenceConfig,
    frame: u64,
}

impl<B: BufferBackend> FrameLoop<B> {
    /// Cadence is taken from the controller's configuration
    pub fn new(controller: MemoryController<B>) -> Self {
        let cadence = controller.config().cadence.clone();
        Self {
            controller,
            cadence,
            frame: 0,
        }
    }

    /// Frames completed or in progress
    pub fn frame_number(&self) -> u64 {
        self.frame
    }

    pub fn controller(&self) -> &MemoryController<B> {
        &self.controller
    }

    pub fn into_controller(self) -> MemoryController<B> {
        self.controller
    }

    /// Start the prepare phase of the next frame
    pub fn begin_frame(&mut self) -> Frame<'_, B> {
        self.frame += 1;
        Frame {
            number: self.frame,
            owner: self,
        }
    }
}

/// Prepare phase of one frame
pub struct Frame<'a, B: BufferBackend> {
    number: u64,
    owner: &'a mut FrameLoop<B>,
}

impl<'a, B: BufferBackend> Frame<'a, B> {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn controller(&self) -> &MemoryController<B> {
        &self.owner.controller
    }

    pub fn ensure_slot(&mut self, entry: EntryId, payload: &[f32]) -> Result<()> {
        self.owner.controller.ensure_slot(entry, payload)
    }

    pub fn remove_cluster(&mut self, entry: EntryId) -> Result<()> {
        self.owner.controller.remove_cluster(entry)
    }

    /// Entries that must resubmit their payload this frame
    pub fn take_pending_reuploads(&mut self) -> HashSet<EntryId> {
        self.owner.controller.get_and_clear_pending_reuploads()
    }

    /// Draw, then run whatever maintenance is due this frame
    pub fn finish(self) -> Result<FrameSummary> {
        let controller = &mut self.owner.controller;
        let cadence = &self.owner.cadence;

        let mut summary = FrameSummary {
            frame: self.number,
            draw_calls: controller.draw()?,
            ..Default::default()
        };

        if self.number % cadence.compaction_interval_frames == 0 {
            let report = controller.try_compaction()?;
            if report.compacted > 0 || report.deleted > 0 {
                info!(
                    target: "photonslab::frame",
                    frame = self.number,
                    compacted = report.compacted,
                    deleted = report.deleted,
                    slots_moved = report.slots_moved,
                    "Compaction reclaimed batches"
                );
            }
            summary.compaction = Some(report);
        }

        if self.number % cadence.integrity_interval_frames == 0 {
            controller.validate_integrity()?;
            summary.integrity_checked = true;
            debug!(target: "photonslab::frame", frame = self.number, "Integrity check passed");
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::memory::HostBackend;

    fn frame_loop(compaction: u64, integrity: u64) -> Result<FrameLoop<HostBackend>> {
        let mut config = AllocatorConfig::default();
        config.cadence.compaction_interval_frames = compaction;
        config.cadence.integrity_interval_frames = integrity;
        let controller = MemoryController::with_config(HostBackend::new(), config)?;
        Ok(FrameLoop::new(controller))
    }

    #[test]
    fn test_maintenance_cadence() -> Result<()> {
        let mut frames = frame_loop(2, 3)?;
        let mut ran = Vec::new();
        for _ in 0..6 {
            let summary = frames.begin_frame().finish()?;
            ran.push((summary.frame, summary.compacted(), summary.integrity_checked));
        }
        assert_eq!(
            ran,
            vec![
                (1, false, false),
                (2, true, false),
                (3, false, true),
                (4, true, false),
                (5, false, false),
                (6, true, true),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_frame_draws_prepared_entries() -> Result<()> {
        let mut frames = frame_loop(60, 100)?;

        let mut frame = frames.begin_frame();
        frame.ensure_slot(EntryId(1), &[0.0; 6 * 3])?;
        frame.ensure_slot(EntryId(2), &[1.0; 6 * 2000])?;
        assert_eq!(frame.controller().len(), 2);
        let summary = frame.finish()?;
        assert_eq!(summary.draw_calls, 2);

        let mut frame = frames.begin_frame();
        frame.remove_cluster(EntryId(2))?;
        assert!(frame.take_pending_reuploads().is_empty());
        assert_eq!(frame.finish()?.draw_calls, 1);
        assert_eq!(frames.frame_number(), 2);
        Ok(())
    }

    #[test]
    fn test_compaction_reclaims_empty_batch_on_cadence() -> Result<()> {
        let mut frames = frame_loop(2, 2)?;

        let mut frame = frames.begin_frame();
        frame.ensure_slot(EntryId(1), &[0.0; 6])?;
        frame.finish()?;

        let mut frame = frames.begin_frame();
        frame.remove_cluster(EntryId(1))?;
        let summary = frame.finish()?;
        assert_eq!(summary.compaction.map(|r| r.deleted), Some(1));
        assert!(summary.integrity_checked);
        assert_eq!(frames.controller().stats().total_batches, 0);
        Ok(())
    }
}
