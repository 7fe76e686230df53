use photonslab::config::BucketSpec;
use photonslab::memory::{HostBackend, SizeClass, ELEMENT_FLOATS};
use photonslab::{AllocatorConfig, EntryId, MemoryController};
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Operation {
    Ensure { entry: u64, elements: usize, seed: u8 },
    Remove { entry: u64 },
    Compact,
    Draw,
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        6 => (0u64..40, 1usize..=80, any::<u8>())
            .prop_map(|(entry, elements, seed)| Operation::Ensure { entry, elements, seed }),
        3 => (0u64..40).prop_map(|entry| Operation::Remove { entry }),
        1 => Just(Operation::Compact),
        1 => Just(Operation::Draw),
    ]
}

/// Small geometry so a few dozen operations exercise every class
fn small_config(growth: bool, sorted: bool) -> AllocatorConfig {
    let mut config = AllocatorConfig::default();
    config.buckets.small = BucketSpec::new(4, 4);
    config.buckets.medium = BucketSpec::new(12, 3);
    config.buckets.large = BucketSpec::new(24, 2);
    config.buckets.xlarge = BucketSpec::new(48, 2);
    config.growth.enabled = growth;
    config.growth.max_batch_bytes = 64 * 1024;
    config.free_list.sorted = sorted;
    config.compaction.utilization_floor = 0.5;
    config
}

fn payload(elements: usize, seed: u8) -> Vec<f32> {
    (0..elements * ELEMENT_FLOATS)
        .map(|i| seed as f32 + i as f32 * 0.5)
        .collect()
}

proptest! {
    #[test]
    fn prop_any_sequence_keeps_invariants(
        ops in prop::collection::vec(arb_operation(), 1..120),
        growth in any::<bool>(),
        sorted in any::<bool>(),
    ) {
        let config = small_config(growth, sorted);
        let max_cycles = config.growth.max_cycles;
        let max_bytes = config.growth.max_batch_bytes;
        let mut mc = MemoryController::with_config(HostBackend::new(), config).unwrap();
        let mut model: HashMap<u64, (usize, u8)> = HashMap::new();

        for op in ops {
            match op {
                Operation::Ensure { entry, elements, seed } => {
                    mc.ensure_slot(EntryId(entry), &payload(elements, seed)).unwrap();
                    model.insert(entry, (elements, seed));
                }
                Operation::Remove { entry } => {
                    let result = mc.remove_cluster(EntryId(entry));
                    prop_assert_eq!(result.is_ok(), model.remove(&entry).is_some());
                }
                Operation::Compact => {
                    mc.try_compaction().unwrap();
                    for pool in mc.pools() {
                        prop_assert!(pool.batches().iter().all(|b| !b.is_empty()));
                    }
                }
                Operation::Draw => {
                    let draws = mc.draw().unwrap();
                    let non_empty: usize = mc
                        .pools()
                        .iter()
                        .map(|p| p.batches().iter().filter(|b| !b.is_empty()).count())
                        .sum();
                    prop_assert_eq!(draws, non_empty);
                }
            }

            prop_assert!(mc.validate_integrity().is_ok());
            prop_assert_eq!(mc.len(), model.len());

            for class in SizeClass::ALL {
                let entries_in_class = mc
                    .entries()
                    .filter(|e| mc.location(*e).map(|l| l.class) == Some(class))
                    .count();
                prop_assert_eq!(mc.pool(class).active_slot_count(), entries_in_class);
            }

            for pool in mc.pools() {
                for batch in pool.batches() {
                    prop_assert!(batch.growth_cycles() <= max_cycles);
                    if batch.growth_cycles() > 0 {
                        prop_assert!(batch.byte_size() as u64 <= max_bytes);
                    }
                }
            }
        }

        // Every payload survives churn, growth and compaction
        for (entry, (elements, seed)) in &model {
            prop_assert_eq!(mc.read_entry(EntryId(*entry)).unwrap(), payload(*elements, *seed));
        }
    }

    #[test]
    fn prop_repeat_ensure_is_idempotent(
        elements in 1usize..=100,
        seed in any::<u8>(),
        others in prop::collection::vec(1usize..=100, 0..20),
    ) {
        let mut mc = MemoryController::with_config(HostBackend::new(), small_config(true, true)).unwrap();
        for (i, n) in others.iter().enumerate() {
            mc.ensure_slot(EntryId(1000 + i as u64), &payload(*n, 0)).unwrap();
        }

        let data = payload(elements, seed);
        mc.ensure_slot(EntryId(1), &data).unwrap();
        let first = mc.location(EntryId(1));
        let batches = mc.stats().total_batches;

        mc.ensure_slot(EntryId(1), &data).unwrap();
        prop_assert_eq!(mc.location(EntryId(1)), first);
        prop_assert_eq!(mc.stats().total_batches, batches);
        prop_assert_eq!(mc.read_entry(EntryId(1)).unwrap(), data);
    }
}
