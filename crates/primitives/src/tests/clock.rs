use rand::thread_rng;

use super::*;

fn device(tag: u8) -> DeviceId {
    DeviceId::from([tag; 21])
}

#[test]
fn test_empty_clocks_are_equal() {
    let a = VectorClock::new();
    let b = VectorClock::new();

    assert_eq!(a.compare(&b), ClockOrdering::Equal);
}

#[test]
fn test_missing_components_count_as_zero() {
    let a: VectorClock = [(device(1), 1)].into_iter().collect();
    let b = VectorClock::new();

    assert_eq!(a.compare(&b), ClockOrdering::Dominates);
    assert_eq!(b.compare(&a), ClockOrdering::DominatedBy);
}

#[test]
fn test_dominance_requires_every_component() {
    let a: VectorClock = [(device(1), 2), (device(2), 1)].into_iter().collect();
    let b: VectorClock = [(device(1), 1), (device(2), 1)].into_iter().collect();

    assert_eq!(a.compare(&b), ClockOrdering::Dominates);
    assert_eq!(b.compare(&a), ClockOrdering::DominatedBy);
}

#[test]
fn test_concurrent_edits_detected() {
    // A wrote {A:2}, B wrote {A:1, B:1} from the same ancestor {A:1}.
    let a: VectorClock = [(device(1), 2)].into_iter().collect();
    let b: VectorClock = [(device(1), 1), (device(2), 1)].into_iter().collect();

    assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
    assert_eq!(b.compare(&a), ClockOrdering::Concurrent);
}

#[test]
fn test_merged_with_takes_component_max() {
    let a: VectorClock = [(device(1), 2)].into_iter().collect();
    let b: VectorClock = [(device(1), 1), (device(2), 3)].into_iter().collect();

    let merged = a.merged_with(&b);

    assert_eq!(merged.get(&device(1)), 2);
    assert_eq!(merged.get(&device(2)), 3);
    assert_eq!(merged.compare(&a), ClockOrdering::Dominates);
    assert_eq!(merged.compare(&b), ClockOrdering::Dominates);
}

#[test]
fn test_covered_by() {
    let tombstone: VectorClock = [(device(1), 4)].into_iter().collect();
    let acked: VectorClock = [(device(1), 4), (device(2), 1)].into_iter().collect();
    let stale: VectorClock = [(device(1), 3)].into_iter().collect();

    assert!(tombstone.covered_by(&acked));
    assert!(!tombstone.covered_by(&stale));
}

#[test]
fn test_random_device_ids_round_trip() {
    let id = DeviceId::random(&mut thread_rng());
    let parsed: DeviceId = id.to_string().parse().unwrap();

    assert_eq!(parsed, id);
}
