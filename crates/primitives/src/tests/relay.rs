use super::*;

#[test]
fn test_applied_set_is_bounded() {
    let mut state = RelayState::default();

    for n in 0..(MAX_APPLIED_ENVELOPES + 50) {
        state.record_applied(format!("env-{n}"));
    }

    assert_eq!(state.applied_count(), MAX_APPLIED_ENVELOPES);
    assert!(
        !state.was_applied("env-0"),
        "oldest ids must be evicted first"
    );
    assert!(state.was_applied(&format!("env-{}", MAX_APPLIED_ENVELOPES + 49)));
}

#[test]
fn test_record_applied_is_idempotent() {
    let mut state = RelayState::default();

    state.record_applied("env-1".to_owned());
    state.record_applied("env-1".to_owned());

    assert_eq!(state.applied_count(), 1);
}

#[test]
fn test_payload_type_wire_name() {
    let json = serde_json::to_string(&RelayPayloadType::IndexDelta).unwrap();

    assert_eq!(json, "\"INDEX_DELTA\"");
}
