//! The relay server: three routes and a bounded in-memory envelope log.
//!
//! Envelopes are opaque ciphertext; the server never holds a key. It
//! enforces the protocol-wide limits (decoded size, per-pair cap, TTL,
//! push rate) and evicts oldest-first, so a pair that outruns its quota
//! loses history, never correctness: peers fall back to a full exchange.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::Deserialize;
use tracing::{debug, info};

use butterfly_primitives::relay::{
    RelayClearResponse, RelayEnvelope, RelayErrorResponse, RelayPullResponse, RelayPushRequest,
    RelayPushResponse,
};
use butterfly_primitives::now_ms;

/// Decoded ciphertext cap per envelope.
pub const MAX_ENVELOPE_BYTES: usize = 64 * 1024;
/// Envelopes retained per pair; the oldest is evicted beyond this.
pub const MAX_ENVELOPES_PER_PAIR: usize = 100;
/// Envelope time-to-live.
pub const ENVELOPE_TTL_MS: u64 = 30 * 24 * 60 * 60 * 1000;
/// Push budget per pair per sliding hour.
pub const MAX_PUSHES_PER_HOUR: usize = 60;

const RATE_WINDOW_MS: u64 = 60 * 60 * 1000;

/// The raw nonce is 12 bytes, so its base64 form is exactly this long.
const NONCE_B64_LEN: usize = 16;
/// The raw tag is 16 bytes, so its base64 form is exactly this long.
const AUTH_TAG_B64_LEN: usize = 24;

#[derive(Debug, Default)]
struct PairLog {
    envelopes: Vec<RelayEnvelope>,
    /// Push timestamps inside the sliding rate window.
    pushes: Vec<u64>,
}

/// Shared server state; cheap to clone into handlers.
#[derive(Clone, Debug, Default)]
pub struct RelayerState {
    pairs: Arc<Mutex<HashMap<String, PairLog>>>,
}

impl RelayerState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[must_use]
pub fn router(state: RelayerState) -> Router {
    Router::new()
        .route("/bdp/relay/push", post(push))
        .route("/bdp/relay/pull", get(pull))
        .route("/bdp/relay/clear", delete(clear))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(RelayErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

fn check_identifier(name: &str, value: &str) -> Result<(), ApiError> {
    if value.is_empty() || value.len() > 64 {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("{name} must be 1-64 characters"),
        ));
    }
    Ok(())
}

async fn push(
    State(state): State<RelayerState>,
    Json(body): Json<RelayPushRequest>,
) -> Result<(StatusCode, Json<RelayPushResponse>), ApiError> {
    check_identifier("pairId", &body.pair_id)?;
    check_identifier("fromDeviceId", &body.from_device_id)?;

    if body.nonce.len() != NONCE_B64_LEN || STANDARD.decode(&body.nonce).is_err() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "nonce must be 12 base64-encoded bytes",
        ));
    }
    if body.auth_tag.len() != AUTH_TAG_B64_LEN || STANDARD.decode(&body.auth_tag).is_err() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "authTag must be 16 base64-encoded bytes",
        ));
    }

    let ciphertext = STANDARD
        .decode(&body.ciphertext)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "ciphertext is not valid base64"))?;
    if ciphertext.len() > MAX_ENVELOPE_BYTES {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("envelope exceeds {MAX_ENVELOPE_BYTES} decoded bytes"),
        ));
    }

    let now = now_ms();
    let mut pairs = lock(&state);
    let log = pairs.entry(body.pair_id.clone()).or_default();

    log.pushes.retain(|&at| now.saturating_sub(at) < RATE_WINDOW_MS);
    if log.pushes.len() >= MAX_PUSHES_PER_HOUR {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "push rate exceeded for this pair",
        ));
    }
    log.pushes.push(now);

    let envelope = RelayEnvelope {
        id: fresh_id(),
        pair_id: body.pair_id.clone(),
        from_device_id: body.from_device_id.clone(),
        nonce: body.nonce,
        ciphertext: body.ciphertext,
        auth_tag: body.auth_tag,
        created_at: now,
        expires_at: now + ENVELOPE_TTL_MS,
    };

    let response = RelayPushResponse {
        id: envelope.id.clone(),
        expires_at: envelope.expires_at,
    };

    log.envelopes.push(envelope);
    if log.envelopes.len() > MAX_ENVELOPES_PER_PAIR {
        let evicted = log.envelopes.remove(0);
        debug!(pair_id = %body.pair_id, evicted = %evicted.id, "evicted oldest envelope");
    }

    info!(pair_id = %body.pair_id, id = %response.id, "stored envelope");
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullParams {
    pair_id: String,
    #[serde(default)]
    since: u64,
}

async fn pull(
    State(state): State<RelayerState>,
    Query(params): Query<PullParams>,
) -> Result<Json<RelayPullResponse>, ApiError> {
    check_identifier("pairId", &params.pair_id)?;

    let now = now_ms();
    let mut pairs = lock(&state);

    let envelopes = match pairs.get_mut(&params.pair_id) {
        Some(log) => {
            log.envelopes.retain(|envelope| envelope.expires_at > now);
            log.envelopes
                .iter()
                .filter(|envelope| envelope.created_at > params.since)
                .cloned()
                .collect()
        }
        None => Vec::new(),
    };

    Ok(Json(RelayPullResponse {
        envelopes,
        server_time: now,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearParams {
    pair_id: String,
    up_to: u64,
}

async fn clear(
    State(state): State<RelayerState>,
    Query(params): Query<ClearParams>,
) -> Result<Json<RelayClearResponse>, ApiError> {
    check_identifier("pairId", &params.pair_id)?;

    let mut pairs = lock(&state);
    let deleted = match pairs.get_mut(&params.pair_id) {
        Some(log) => {
            let before = log.envelopes.len();
            log.envelopes
                .retain(|envelope| envelope.created_at > params.up_to);
            (before - log.envelopes.len()) as u64
        }
        None => 0,
    };

    Ok(Json(RelayClearResponse { deleted }))
}

fn fresh_id() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("env_{suffix}")
}

fn lock(state: &RelayerState) -> std::sync::MutexGuard<'_, HashMap<String, PairLog>> {
    state
        .pairs
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "tests/routes.rs"]
mod tests;
