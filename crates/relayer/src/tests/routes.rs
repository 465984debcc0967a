use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use super::*;

fn push_body(pair_id: &str, ciphertext_len: usize) -> RelayPushRequest {
    RelayPushRequest {
        pair_id: pair_id.to_owned(),
        from_device_id: "device-a".to_owned(),
        nonce: STANDARD.encode([7; 12]),
        ciphertext: STANDARD.encode(vec![1; ciphertext_len]),
        auth_tag: STANDARD.encode([9; 16]),
    }
}

async fn send_push(app: &Router, body: &RelayPushRequest) -> (StatusCode, serde_json::Value) {
    let request = Request::post("/bdp/relay/push")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

async fn send_get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::get(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

fn test_pair_id() -> String {
    butterfly_primitives::PairId::from([3; 32]).to_string()
}

#[tokio::test]
async fn test_push_then_pull_round_trip() {
    let app = router(RelayerState::new());
    let pair_id = test_pair_id();

    let (status, created) = send_push(&app, &push_body(&pair_id, 128)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(created["id"].as_str().unwrap().starts_with("env_"));
    assert!(created["expiresAt"].as_u64().unwrap() > now_ms());

    let (status, pulled) = send_get(&app, &format!("/bdp/relay/pull?pairId={pair_id}&since=0")).await;
    assert_eq!(status, StatusCode::OK);
    let envelopes = pulled["envelopes"].as_array().unwrap();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0]["id"], created["id"]);
    assert!(pulled["serverTime"].as_u64().unwrap() > 0);

    // `since` past the envelope's creation returns nothing new.
    let since = envelopes[0]["createdAt"].as_u64().unwrap();
    let (status, pulled) =
        send_get(&app, &format!("/bdp/relay/pull?pairId={pair_id}&since={since}")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(pulled["envelopes"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_oversize_push_is_rejected_with_413() {
    let app = router(RelayerState::new());

    let (status, body) = send_push(&app, &push_body(&test_pair_id(), MAX_ENVELOPE_BYTES + 1)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(body["error"].as_str().unwrap().contains("decoded bytes"));
}

#[tokio::test]
async fn test_malformed_fields_are_rejected_with_400() {
    let app = router(RelayerState::new());
    let pair_id = test_pair_id();

    let mut short_nonce = push_body(&pair_id, 16);
    short_nonce.nonce = STANDARD.encode([1; 8]);
    let (status, _body) = send_push(&app, &short_nonce).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut bad_tag = push_body(&pair_id, 16);
    bad_tag.auth_tag = "!".repeat(AUTH_TAG_B64_LEN);
    let (status, _body) = send_push(&app, &bad_tag).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut empty_pair = push_body(&pair_id, 16);
    empty_pair.pair_id = String::new();
    let (status, _body) = send_push(&app, &empty_pair).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut long_pair = push_body(&pair_id, 16);
    long_pair.pair_id = "x".repeat(65);
    let (status, _body) = send_push(&app, &long_pair).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rate_limit_after_sixty_pushes() {
    let app = router(RelayerState::new());
    let pair_id = test_pair_id();

    for _ in 0..MAX_PUSHES_PER_HOUR {
        let (status, _body) = send_push(&app, &push_body(&pair_id, 8)).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send_push(&app, &push_body(&pair_id, 8)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("rate"));

    // Another pair is unaffected.
    let other = butterfly_primitives::PairId::from([9; 32]).to_string();
    let (status, _body) = send_push(&app, &push_body(&other, 8)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_clear_deletes_up_to_timestamp() {
    let app = router(RelayerState::new());
    let pair_id = test_pair_id();

    let (status, _first) = send_push(&app, &push_body(&pair_id, 8)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, pulled) = send_get(&app, &format!("/bdp/relay/pull?pairId={pair_id}&since=0")).await;
    let cutoff = pulled["envelopes"][0]["createdAt"].as_u64().unwrap();

    let request = Request::delete(format!("/bdp/relay/clear?pairId={pair_id}&upTo={cutoff}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let cleared: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(cleared["deleted"], 1);

    let (_, pulled) = send_get(&app, &format!("/bdp/relay/pull?pairId={pair_id}&since=0")).await;
    assert!(pulled["envelopes"].as_array().unwrap().is_empty());
}
