//! Allocator statistics and the utilization report

use super::pool::BucketPool;
use super::size_class::SizeClass;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Per-size-class counts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BucketStats {
    pub entries: usize,
    pub batches: usize,
    pub active_batches: usize,
    pub slots: usize,
    pub active_slots: usize,
    pub free_slots: usize,
    pub bytes: u64,
    pub elements: u64,
    pub batch_details: Vec<BatchStats>,
}

impl BucketStats {
    pub(crate) fn from_pool(pool: &BucketPool) -> Self {
        let mut stats = BucketStats {
            batches: pool.batch_count(),
            free_slots: pool.free_len(),
            ..Default::default()
        };

        for batch in pool.batches() {
            let elements = batch.stored_elements() as u64;
            stats.bytes += batch.byte_size() as u64;
            stats.slots += batch.slot_count();
            stats.active_slots += batch.active_count();
            stats.entries += batch.active_count();
            stats.elements += elements;
            if !batch.is_empty() {
                stats.active_batches += 1;
            }
            stats.batch_details.push(BatchStats {
                id: batch.id().0,
                slots: batch.slot_count(),
                active_slots: batch.active_count(),
                bytes: batch.byte_size() as u64,
                elements,
                growth_cycles: batch.growth_cycles(),
                initial_capacity: batch.initial_capacity(),
                capacity: batch.capacity(),
            });
        }
        stats
    }

    pub fn slot_utilization(&self) -> f64 {
        ratio(self.active_slots, self.slots)
    }

    pub fn batch_utilization(&self) -> f64 {
        ratio(self.active_batches, self.batches)
    }
}

/// One batch as seen by the report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub id: u64,
    pub slots: usize,
    pub active_slots: usize,
    pub bytes: u64,
    pub elements: u64,
    pub growth_cycles: u32,
    pub initial_capacity: usize,
    pub capacity: usize,
}

/// Event counters maintained by the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Counters {
    pub growth_events: u64,
    pub last_growth_time_us: f64,
    pub compaction_events: u64,
    pub last_compaction_time_us: f64,
    pub batch_deletions: u64,
    pub slots_relocated: u64,
    pub bytes_relocated: u64,
    pub draw_calls_per_frame: usize,
}

/// Snapshot of allocator state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub total_entries: usize,
    pub total_elements: u64,
    pub total_bytes: u64,
    pub total_batches: usize,
    pub total_active_batches: usize,
    pub total_slots: usize,
    pub total_active_slots: usize,
    pub free_slots: usize,
    #[serde(flatten)]
    pub counters: Counters,
    pub buckets: BTreeMap<SizeClass, BucketStats>,
}

impl Stats {
    pub(crate) fn collect(pools: &[BucketPool], entries: usize, counters: &Counters) -> Self {
        let mut stats = Stats {
            total_entries: entries,
            counters: counters.clone(),
            ..Default::default()
        };

        for pool in pools {
            let bucket = BucketStats::from_pool(pool);
            stats.total_elements += bucket.elements;
            stats.total_bytes += bucket.bytes;
            stats.total_batches += bucket.batches;
            stats.total_active_batches += bucket.active_batches;
            stats.total_slots += bucket.slots;
            stats.total_active_slots += bucket.active_slots;
            stats.free_slots += bucket.free_slots;
            stats.buckets.insert(pool.class(), bucket);
        }
        stats
    }

    pub fn bucket(&self, class: SizeClass) -> Option<&BucketStats> {
        self.buckets.get(&class)
    }

    pub fn slot_utilization(&self) -> f64 {
        ratio(self.total_active_slots, self.total_slots)
    }

    pub fn batch_utilization(&self) -> f64 {
        ratio(self.total_active_batches, self.total_batches)
    }

    /// Multi-line utilization report
    pub fn render_report(&self) -> String {
        let c = &self.counters;
        let mut out = String::new();

        let _ = writeln!(out, "===== Memory Controller Stats =====");
        let _ = writeln!(
            out,
            "{} compactions ({} slots relocated, {} batches deleted, {:.2}µs last), {} growth events ({:.2}µs last)",
            c.compaction_events,
            c.slots_relocated,
            c.batch_deletions,
            c.last_compaction_time_us,
            c.growth_events,
            c.last_growth_time_us,
        );
        let _ = writeln!(
            out,
            "{:.1}% slots active ({}/{}), {:.1}% batches active ({}/{}), {} free-list slots, {} bytes, {} entries ({} triangles, {} vertices)",
            self.slot_utilization() * 100.0,
            self.total_active_slots,
            self.total_slots,
            self.batch_utilization() * 100.0,
            self.total_active_batches,
            self.total_batches,
            self.free_slots,
            format_count(self.total_bytes),
            self.total_entries,
            format_count(self.total_elements / 3),
            format_count(self.total_elements),
        );

        for (class, bucket) in &self.buckets {
            if bucket.batches == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "  [{:>8}] {} {:.0}% slots active ({}/{}), {:.0}% batches active ({}/{}), {} free-list slots, {} bytes ({} triangles, {} vertices)",
                class.name(),
                utilization_bar(bucket.slot_utilization(), 12),
                bucket.slot_utilization() * 100.0,
                bucket.active_slots,
                bucket.slots,
                bucket.batch_utilization() * 100.0,
                bucket.active_batches,
                bucket.batches,
                bucket.free_slots,
                format_count(bucket.bytes),
                format_count(bucket.elements / 3),
                format_count(bucket.elements),
            );

            for batch in &bucket.batch_details {
                let util = ratio(batch.active_slots, batch.slots);
                let _ = writeln!(
                    out,
                    "      batch#{:03}  {} {:.0}% slots active ({}/{}), {} bytes ({} triangles, {} vertices), {}× growth ({} -> {})",
                    batch.id,
                    utilization_bar(util, 8),
                    util * 100.0,
                    batch.active_slots,
                    batch.slots,
                    format_count(batch.bytes),
                    format_count(batch.elements / 3),
                    format_count(batch.elements),
                    batch.growth_cycles + 1,
                    format_count(batch.initial_capacity as u64),
                    format_count(batch.capacity as u64),
                );
            }
        }
        let _ = write!(out, "===================================");
        out
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Bar of `width` cells, filled proportionally to `utilization`
pub fn utilization_bar(utilization: f64, width: usize) -> String {
    let utilization = utilization.clamp(0.0, 1.0);
    let filled = (utilization * width as f64) as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

/// Compact count: 999, 1.5K, 2.3M
pub fn format_count(n: u64) -> String {
    if n < 1_000 {
        n.to_string()
    } else if n < 1_000_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    }
}
