//! Census history and sampler behaviour

mod common;

use common::create_test_scope;
use heapscope_core::census::TypeHistory;
use heapscope_core::{HeapValue, ManagedHeap};
use proptest::prelude::*;
use std::collections::HashMap;

fn tick(types: &[(&str, u64)]) -> HashMap<String, u64> {
    types
        .iter()
        .map(|(name, count)| (name.to_string(), *count))
        .collect()
}

#[test]
fn test_vanished_type_keeps_receiving_zeros() {
    let mut history = TypeHistory::new(10);
    history.record(&tick(&[("app::A", 3)]));
    history.record(&tick(&[("app::A", 5), ("app::B", 1)]));
    history.record(&tick(&[("app::B", 2)]));

    assert_eq!(history.series("app::A").unwrap(), vec![3, 5, 0]);
    assert_eq!(history.series("app::B").unwrap(), vec![0, 1, 2]);
    assert_eq!(history.type_names(), vec!["app::A", "app::B"]);
}

#[test]
fn test_window_slides_one_for_one_at_cap() {
    let mut history = TypeHistory::new(3);
    for count in 1..=5 {
        history.record(&tick(&[("app::Job", count)]));
    }
    assert_eq!(history.series("app::Job").unwrap(), vec![3, 4, 5]);
    assert_eq!(history.samples(), 3);
}

fn census_ticks() -> impl Strategy<Value = Vec<Vec<(u8, u64)>>> {
    prop::collection::vec(prop::collection::vec((0u8..6, 0u64..50), 0..6), 1..40)
}

proptest! {
    #[test]
    fn prop_series_lengths_track_samples(ticks in census_ticks(), max_history in 1usize..12) {
        let mut history = TypeHistory::new(max_history);

        for (index, observed) in ticks.iter().enumerate() {
            let counts: HashMap<String, u64> = observed
                .iter()
                .map(|(ty, count)| (format!("app::T{}", ty), *count))
                .collect();
            history.record(&counts);

            let expected = (index + 1).min(max_history);
            prop_assert_eq!(history.samples(), expected);
            prop_assert!(history.is_consistent());
            for name in history.type_names() {
                prop_assert_eq!(history.series(&name).unwrap().len(), expected);
            }
            for (name, count) in &counts {
                prop_assert_eq!(history.series(name).unwrap().last().copied(), Some(*count));
            }
        }
    }
}

#[tokio::test]
async fn test_sampler_tracks_growth_and_release() {
    let heap = ManagedHeap::new();
    let registry = heap.alloc_root("app::Registry", HeapValue::List(Vec::new()));
    let scope = create_test_scope(&heap);

    for _ in 0..4 {
        let session = heap.alloc("app::Session", HeapValue::Int(0));
        heap.push(registry, session).unwrap();
        scope.tick_now().await.unwrap();
    }
    heap.clear(registry).unwrap();
    scope.tick_now().await.unwrap();

    assert_eq!(scope.history("app::Session").await.unwrap(), vec![1, 2, 3, 4, 0]);
    let stats = scope.type_stats(0).await;
    let sessions = stats
        .iter()
        .find(|row| row.type_name == "app::Session")
        .unwrap();
    assert_eq!((sessions.min, sessions.current, sessions.max), (0, 0, 4));
}

#[tokio::test]
async fn test_background_sampler_stops_on_shutdown() {
    use heapscope_core::config::HeapscopeConfig;

    let heap = ManagedHeap::new();
    heap.alloc_root("app::Job", HeapValue::Int(1));
    let mut config = HeapscopeConfig::default();
    config.sampler.period_secs = 1;
    let scope = common::create_scope_with(&heap, config);

    let handle = scope.start();
    // the first interval tick fires immediately
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    scope.shutdown();
    handle.await.unwrap();

    assert_eq!(scope.history("app::Job").await.unwrap(), vec![1]);
}
