//! Pairwise and group keys for the sync engine.
//!
//! [`SharedKey`] protects direct peer-to-peer frames: X25519 ECDH over the
//! two devices' keypairs, expanded into an AES-256-GCM key. [`GroupKey`]
//! protects relay envelopes: any device knowing the pair secret derives
//! the same key with HKDF, so members never exchange key material.

use curve25519_dalek::MontgomeryPoint;
use rand::{CryptoRng, Rng};
use ring::{aead, hkdf};

use butterfly_primitives::{PairId, PrivateKey, PublicKey};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub type Nonce = [u8; NONCE_LEN];

/// HKDF application info pinning group keys to this protocol.
const GROUP_KEY_INFO: &[u8] = b"bdp/group-key/v1";
/// HKDF application info for pairwise session keys.
const SHARED_KEY_INFO: &[u8] = b"bdp/shared-key/v1";

#[must_use]
pub fn random_nonce(rng: &mut (impl Rng + CryptoRng)) -> Nonce {
    rng.gen()
}

/// AES-256-GCM key material with seal/open over detachable tags.
#[derive(Copy, Clone, Debug)]
struct AeadKey {
    key: [u8; 32],
}

impl AeadKey {
    fn from_ikm(ikm: &[u8], info: &[u8]) -> Self {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[0; 32]);
        let prk = salt.extract(ikm);
        let info_slices = [info];
        let okm = prk
            .expand(&info_slices, hkdf::HKDF_SHA256)
            .expect("HKDF-SHA256 output fits a 32-byte key");

        let mut key = [0; 32];
        okm.fill(&mut key)
            .expect("HKDF-SHA256 output fits a 32-byte key");

        Self { key }
    }

    fn seal(&self, payload: Vec<u8>, nonce: Nonce) -> Option<Vec<u8>> {
        let sealing_key =
            aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_256_GCM, &self.key).ok()?);

        let mut cipher_text = payload;
        sealing_key
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut cipher_text,
            )
            .ok()?;

        Some(cipher_text)
    }

    fn open(&self, cipher_text: Vec<u8>, nonce: Nonce) -> Option<Vec<u8>> {
        let opening_key =
            aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_256_GCM, &self.key).ok()?);

        let mut payload = cipher_text;
        let decrypted_len = opening_key
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut payload,
            )
            .ok()?
            .len();

        payload.truncate(decrypted_len);

        Some(payload)
    }
}

/// Pairwise key between this device and one peer.
#[derive(Copy, Clone, Debug)]
pub struct SharedKey {
    key: AeadKey,
}

impl SharedKey {
    /// X25519 ECDH with our private key and the peer's public key, then
    /// HKDF expansion. Both directions derive the same key.
    #[must_use]
    pub fn new(sk: &PrivateKey, pk: &PublicKey) -> Self {
        let shared_point = MontgomeryPoint(*pk.as_bytes()).mul_clamped(*sk.as_bytes());

        Self {
            key: AeadKey::from_ikm(shared_point.as_bytes(), SHARED_KEY_INFO),
        }
    }

    /// Ciphertext with the 16-byte tag appended, or `None` on AEAD
    /// failure.
    #[must_use]
    pub fn seal(&self, payload: Vec<u8>, nonce: Nonce) -> Option<Vec<u8>> {
        self.key.seal(payload, nonce)
    }

    #[must_use]
    pub fn open(&self, cipher_text: Vec<u8>, nonce: Nonce) -> Option<Vec<u8>> {
        self.key.open(cipher_text, nonce)
    }
}

/// Group key shared by every member of a pair.
#[derive(Copy, Clone, Debug)]
pub struct GroupKey {
    key: AeadKey,
}

impl GroupKey {
    /// HKDF-SHA-256 with zero salt over the pair secret. Deterministic:
    /// the pair secret is the only input.
    #[must_use]
    pub fn derive(pair_id: &PairId) -> Self {
        Self {
            key: AeadKey::from_ikm(pair_id.as_bytes(), GROUP_KEY_INFO),
        }
    }

    #[must_use]
    pub fn seal(&self, payload: Vec<u8>, nonce: Nonce) -> Option<Vec<u8>> {
        self.key.seal(payload, nonce)
    }

    #[must_use]
    pub fn open(&self, cipher_text: Vec<u8>, nonce: Nonce) -> Option<Vec<u8>> {
        self.key.open(cipher_text, nonce)
    }
}

/// Splits sealed output into `(ciphertext, tag)` for surfaces that carry
/// the tag separately, like the relay envelope.
#[must_use]
pub fn split_tag(mut sealed: Vec<u8>) -> Option<(Vec<u8>, [u8; TAG_LEN])> {
    if sealed.len() < TAG_LEN {
        return None;
    }
    let tag_bytes = sealed.split_off(sealed.len() - TAG_LEN);
    let tag: [u8; TAG_LEN] = tag_bytes.try_into().ok()?;
    Some((sealed, tag))
}

/// Rejoins `(ciphertext, tag)` into the form [`GroupKey::open`] expects.
#[must_use]
pub fn join_tag(mut cipher_text: Vec<u8>, tag: &[u8; TAG_LEN]) -> Vec<u8> {
    cipher_text.extend_from_slice(tag);
    cipher_text
}
