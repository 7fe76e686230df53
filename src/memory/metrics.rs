//! Prometheus export of allocator statistics
//!
//! Gauges mirror [`Stats`]: aggregate occupancy, event counters and
//! per-size-class breakdowns labelled by `class`.

use super::size_class::SizeClass;
use super::stats::Stats;
use crate::error::{Error, Result};
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::debug;

/// Metric set registered in a registry owned by this value
pub struct AllocatorMetrics {
    registry: Registry,
    entries: IntGauge,
    elements: IntGauge,
    bytes: IntGauge,
    batches: IntGauge,
    slots: IntGauge,
    active_slots: IntGauge,
    free_slots: IntGauge,
    draw_calls: IntGauge,
    growth_events: IntGauge,
    compaction_events: IntGauge,
    batch_deletions: IntGauge,
    slots_relocated: IntGauge,
    class_batches: IntGaugeVec,
    class_active_slots: IntGaugeVec,
    class_bytes: IntGaugeVec,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let g = IntGauge::new(name, help).map_err(metrics_err)?;
    registry.register(Box::new(g.clone())).map_err(metrics_err)?;
    Ok(g)
}

fn class_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGaugeVec> {
    let g = IntGaugeVec::new(Opts::new(name, help), &["class"]).map_err(metrics_err)?;
    registry.register(Box::new(g.clone())).map_err(metrics_err)?;
    Ok(g)
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Resource(format!("Metrics error: {}", e))
}

impl AllocatorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let r = &registry;

        let metrics = Self {
            entries: gauge(r, "photonslab_entries", "Entries with a slot")?,
            elements: gauge(r, "photonslab_elements", "Elements stored across all slots")?,
            bytes: gauge(r, "photonslab_buffer_bytes", "Bytes held by batch buffers")?,
            batches: gauge(r, "photonslab_batches", "Live batches")?,
            slots: gauge(r, "photonslab_slots", "Slots across all batches")?,
            active_slots: gauge(r, "photonslab_active_slots", "Occupied slots")?,
            free_slots: gauge(r, "photonslab_free_list_slots", "Free-list depth")?,
            draw_calls: gauge(r, "photonslab_draw_calls_per_frame", "Draw calls issued last frame")?,
            growth_events: gauge(r, "photonslab_growth_events", "Batch doublings so far")?,
            compaction_events: gauge(r, "photonslab_compaction_events", "Compaction events so far")?,
            batch_deletions: gauge(r, "photonslab_batch_deletions", "Batches deleted so far")?,
            slots_relocated: gauge(r, "photonslab_slots_relocated", "Slots moved by compaction so far")?,
            class_batches: class_gauge(r, "photonslab_class_batches", "Live batches per size class")?,
            class_active_slots: class_gauge(r, "photonslab_class_active_slots", "Occupied slots per size class")?,
            class_bytes: class_gauge(r, "photonslab_class_buffer_bytes", "Buffer bytes per size class")?,
            registry,
        };
        Ok(metrics)
    }

    /// Update every gauge from a stats snapshot
    pub fn observe(&self, stats: &Stats) {
        let c = &stats.counters;
        self.entries.set(stats.total_entries as i64);
        self.elements.set(stats.total_elements as i64);
        self.bytes.set(stats.total_bytes as i64);
        self.batches.set(stats.total_batches as i64);
        self.slots.set(stats.total_slots as i64);
        self.active_slots.set(stats.total_active_slots as i64);
        self.free_slots.set(stats.free_slots as i64);
        self.draw_calls.set(c.draw_calls_per_frame as i64);
        self.growth_events.set(c.growth_events as i64);
        self.compaction_events.set(c.compaction_events as i64);
        self.batch_deletions.set(c.batch_deletions as i64);
        self.slots_relocated.set(c.slots_relocated as i64);

        for class in SizeClass::ALL {
            let bucket = stats.bucket(class).cloned().unwrap_or_default();
            let label = [class.name()];
            self.class_batches.with_label_values(&label).set(bucket.batches as i64);
            self.class_active_slots
                .with_label_values(&label)
                .set(bucket.active_slots as i64);
            self.class_bytes.with_label_values(&label).set(bucket.bytes as i64);
        }
        debug!(entries = stats.total_entries, batches = stats.total_batches, "Metrics updated");
    }

    /// Render in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Resource(format!("Metrics error: {}", e)))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::stats::BucketStats;

    #[test]
    fn test_observe_and_encode() -> Result<()> {
        let metrics = AllocatorMetrics::new()?;

        let mut stats = Stats {
            total_entries: 12,
            total_batches: 2,
            ..Default::default()
        };
        stats.counters.growth_events = 1;
        stats.buckets.insert(
            SizeClass::Medium,
            BucketStats {
                batches: 2,
                active_slots: 12,
                ..Default::default()
            },
        );
        metrics.observe(&stats);

        let text = metrics.encode()?;
        assert!(text.contains("photonslab_entries 12"));
        assert!(text.contains("photonslab_growth_events 1"));
        assert!(text.contains("photonslab_class_batches{class=\"medium\"} 2"));
        assert!(text.contains("photonslab_class_batches{class=\"small\"} 0"));
        Ok(())
    }

    #[test]
    fn test_registries_are_independent() -> Result<()> {
        let a = AllocatorMetrics::new()?;
        let b = AllocatorMetrics::new()?;
        a.observe(&Stats {
            total_entries: 3,
            ..Default::default()
        });
        assert!(b.encode()?.contains("photonslab_entries 0"));
        Ok(())
    }
}
