use core::fmt;
use core::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use borsh::{BorshDeserialize, BorshSerialize};
use rand::{CryptoRng, Rng};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::identity::PublicKey;

/// Length of the raw device identifier.
pub const DEVICE_ID_LEN: usize = 21;

/// Opaque 21-byte device identifier, chosen once at first launch.
///
/// Rendered as url-safe base64 without padding (28 characters) wherever it
/// appears in the wire format or as a vector-clock key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    #[must_use]
    pub fn random(rng: &mut (impl Rng + CryptoRng)) -> Self {
        let mut bytes = [0; DEVICE_ID_LEN];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }
}

#[derive(Copy, Clone, Debug, Error)]
#[error("invalid device id")]
pub struct InvalidDeviceId;

impl From<[u8; DEVICE_ID_LEN]> for DeviceId {
    fn from(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({self})")
    }
}

impl FromStr for DeviceId {
    type Err = InvalidDeviceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|_| InvalidDeviceId)?;
        let bytes: [u8; DEVICE_ID_LEN] = bytes.try_into().map_err(|_| InvalidDeviceId)?;
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = DeviceId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a url-safe base64 device id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(IdVisitor)
    }
}

/// The local device record, one per process lifetime.
///
/// Created on first launch and persisted; mutated only by `local_seq`
/// increments and label edits.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub label: String,
    /// Monotonic counter, incremented on every locally observed change.
    pub local_seq: u64,
    pub public_key: PublicKey,
    pub created_at: u64,
}
