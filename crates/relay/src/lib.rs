//! The relay client: encrypted index deltas for offline catch-up.
//!
//! While no direct session exists, each device pushes its index changes
//! as AES-256-GCM envelopes under the pair's group key and pulls whatever
//! peers left behind. The relay never sees plaintext; envelopes that fail
//! to open are silently dropped (not ours, or corrupt), and replays are
//! no-ops twice over: the applied-id set skips them, and vector clocks
//! would shrug them off anyway.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::thread_rng;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use butterfly_crypto::{join_tag, random_nonce, split_tag, Nonce, NONCE_LEN, TAG_LEN};
use butterfly_identity::DeviceService;
use butterfly_primitives::relay::{
    RelayClearResponse, RelayEnvelope, RelayPayload, RelayPayloadType, RelayPullResponse,
    RelayPushRequest, RelayPushResponse,
};
use butterfly_primitives::{now_ms, FileEntry, Hash, PairId, RelayState, SyncError};
use butterfly_storage::{ApplyOutcome, Conflict, FileIndex};
use butterfly_store::key::RelayStateKey;
use butterfly_store::{Store, StoreError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RelayError {
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("envelope could not be sealed")]
    Seal,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] butterfly_storage::StorageError),

    #[error(transparent)]
    Identity(#[from] butterfly_identity::IdentityError),
}

impl From<RelayError> for SyncError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Rejected { status: 429, .. } => Self::RateLimited {
                retry_after_ms: 60_000,
            },
            RelayError::Seal => Self::Crypto("envelope sealing failed".to_owned()),
            RelayError::Store(StoreError::Full) => Self::StorageFull,
            RelayError::Storage(storage) => storage.into(),
            RelayError::Identity(identity) => identity.into(),
            other => Self::TransferFailed(other.to_string()),
        }
    }
}

/// Result of one pull: how much was new, and what could not be merged
/// automatically.
#[derive(Debug, Default)]
pub struct PullOutcome {
    pub envelopes_applied: usize,
    pub entries_applied: usize,
    /// Concurrent edits surfaced while applying; the caller parks them.
    pub conflicts: Vec<Conflict>,
}

/// HTTP client for the three relay routes, plus per-pair state keeping.
#[derive(Clone, Debug)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: Url,
    store: Store,
    device: DeviceService,
}

impl RelayClient {
    #[must_use]
    pub fn new(base_url: Url, store: Store, device: DeviceService) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            store,
            device,
        }
    }

    pub fn state(&self, pair_id: &PairId) -> Result<RelayState, RelayError> {
        Ok(self
            .store
            .get(&RelayStateKey(*pair_id))?
            .unwrap_or_default())
    }

    fn save_state(&self, pair_id: &PairId, state: &RelayState) -> Result<(), RelayError> {
        Ok(self.store.put(&RelayStateKey(*pair_id), state)?)
    }

    /// Seals the changed entries into one envelope and pushes it.
    /// `last_push_seq` only advances on success, so a rejected push is
    /// retried wholesale later.
    pub async fn push_delta(
        &self,
        pair_id: &PairId,
        changed_entries: &[FileEntry],
        new_root: Hash,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<String, RelayError> {
        let device_id = self.device.device_id()?;

        let payload = RelayPayload {
            payload_type: RelayPayloadType::IndexDelta,
            from_device_id: device_id,
            affected_paths: changed_entries
                .iter()
                .map(|entry| entry.path.clone())
                .collect(),
            delta_entries: changed_entries.to_vec(),
            new_root,
            from_seq,
            to_seq,
            pushed_at: now_ms(),
        };
        let plaintext =
            serde_json::to_vec(&payload).map_err(|_| RelayError::Seal)?;

        let nonce = random_nonce(&mut thread_rng());
        let sealed = self
            .device
            .derive_group_key(pair_id)
            .seal(plaintext, nonce)
            .ok_or(RelayError::Seal)?;
        let (ciphertext, auth_tag) = split_tag(sealed).ok_or(RelayError::Seal)?;

        let body = RelayPushRequest {
            pair_id: pair_id.to_string(),
            from_device_id: device_id.to_string(),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(&ciphertext),
            auth_tag: STANDARD.encode(auth_tag),
        };

        let response = self
            .http
            .post(self.endpoint("push"))
            .json(&body)
            .send()
            .await?;
        let accepted: RelayPushResponse = parse_response(response).await?;

        let mut state = self.state(pair_id)?;
        state.last_push_seq = state.last_push_seq.max(to_seq);
        state.pending_push = false;
        self.save_state(pair_id, &state)?;

        debug!(%pair_id, id = %accepted.id, "pushed delta envelope");
        Ok(accepted.id)
    }

    /// Fetches envelopes since the last pull and merges every new one
    /// into the index.
    pub async fn pull_deltas(
        &self,
        pair_id: &PairId,
        index: &FileIndex,
    ) -> Result<PullOutcome, RelayError> {
        let mut state = self.state(pair_id)?;
        let our_device = self.device.device_id()?;

        let url = format!(
            "{}?pairId={}&since={}",
            self.endpoint("pull"),
            pair_id,
            state.last_fetched_at
        );
        let response = self.http.get(url).send().await?;
        let pulled: RelayPullResponse = parse_response(response).await?;

        let group_key = self.device.derive_group_key(pair_id);
        let mut outcome = PullOutcome::default();

        for envelope in pulled.envelopes {
            if state.was_applied(&envelope.id) {
                continue;
            }
            if envelope.from_device_id == our_device.to_string() {
                // Our own push coming back; remember it, skip the work.
                state.record_applied(envelope.id);
                continue;
            }

            let Some(payload) = open_envelope(&group_key, &envelope) else {
                debug!(id = %envelope.id, "dropping undecryptable envelope");
                continue;
            };

            for entry in payload.delta_entries {
                match index.apply_remote(entry.clone())? {
                    ApplyOutcome::Applied => outcome.entries_applied += 1,
                    ApplyOutcome::Conflict { local } => outcome.conflicts.push(Conflict {
                        path: entry.path.clone(),
                        local,
                        remote: entry,
                    }),
                    ApplyOutcome::Identical | ApplyOutcome::IgnoredOlder => {}
                }
            }

            state.record_applied(envelope.id);
            outcome.envelopes_applied += 1;
        }

        state.last_fetched_at = pulled.server_time;
        self.save_state(pair_id, &state)?;

        debug!(
            %pair_id,
            envelopes = outcome.envelopes_applied,
            entries = outcome.entries_applied,
            "pull finished"
        );
        Ok(outcome)
    }

    /// Best-effort deletion of envelopes both sides have applied.
    /// Failures are logged and swallowed; the TTL cleans up eventually.
    pub async fn clear_old(&self, pair_id: &PairId, up_to: u64) -> u64 {
        let url = format!("{}?pairId={}&upTo={}", self.endpoint("clear"), pair_id, up_to);

        match self.http.delete(url).send().await {
            Ok(response) => match parse_response::<RelayClearResponse>(response).await {
                Ok(cleared) => cleared.deleted,
                Err(err) => {
                    debug!(%pair_id, ?err, "relay clear rejected");
                    0
                }
            },
            Err(err) => {
                debug!(%pair_id, ?err, "relay clear unreachable");
                0
            }
        }
    }

    /// Marks local changes awaiting a push.
    pub fn note_pending_push(&self, pair_id: &PairId) -> Result<(), RelayError> {
        let mut state = self.state(pair_id)?;
        state.pending_push = true;
        self.save_state(pair_id, &state)
    }

    fn endpoint(&self, route: &str) -> String {
        format!("{}bdp/relay/{route}", self.base_url)
    }
}

fn open_envelope(key: &butterfly_crypto::GroupKey, envelope: &RelayEnvelope) -> Option<RelayPayload> {
    let nonce_bytes = STANDARD.decode(&envelope.nonce).ok()?;
    let nonce: Nonce = <[u8; NONCE_LEN]>::try_from(nonce_bytes.as_slice()).ok()?;

    let ciphertext = STANDARD.decode(&envelope.ciphertext).ok()?;
    let tag_bytes = STANDARD.decode(&envelope.auth_tag).ok()?;
    let tag: [u8; TAG_LEN] = tag_bytes.try_into().ok()?;

    let plaintext = key.open(join_tag(ciphertext, &tag), nonce)?;
    serde_json::from_slice(&plaintext).ok()
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let message = response
        .json::<butterfly_primitives::relay::RelayErrorResponse>()
        .await
        .map(|body| body.error)
        .unwrap_or_else(|_| status.to_string());

    warn!(status = status.as_u16(), %message, "relay request rejected");
    Err(RelayError::Rejected {
        status: status.as_u16(),
        message,
    })
}
