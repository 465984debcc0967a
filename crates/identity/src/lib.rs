//! The device and key service.
//!
//! One [`Device`] record exists per installation: an opaque id, a label, a
//! monotonic `local_seq` and an X25519 keypair. The private key never
//! leaves this crate; callers get derived [`SharedKey`]s and [`GroupKey`]s
//! instead. The record and key are created on first launch, cached
//! process-wide after the first read, and only destroyed by an explicit
//! reset.

use std::sync::{Arc, RwLock};

use rand::thread_rng;
use thiserror::Error;
use tracing::{debug, info};

use butterfly_crypto::{GroupKey, SharedKey};
use butterfly_primitives::{now_ms, Device, DeviceId, PairId, PrivateKey, PublicKey, SyncError};
use butterfly_store::key::{LocalDevice, LocalDeviceKey};
use butterfly_store::{Store, StoreError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    #[error("key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    #[error("malformed peer public key")]
    MalformedPeerKey,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<IdentityError> for SyncError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Store(StoreError::Full) => Self::StorageFull,
            IdentityError::Store(other) => Self::Storage(other.to_string()),
            other => Self::Crypto(other.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
struct CachedIdentity {
    device: Device,
    private_key: PrivateKey,
}

/// Process-wide device identity, lazily loaded from the store.
#[derive(Clone, Debug)]
pub struct DeviceService {
    store: Store,
    cache: Arc<RwLock<Option<CachedIdentity>>>,
}

impl DeviceService {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Returns the persisted device record, creating and persisting a
    /// fresh identity on first launch.
    pub fn get_or_create_device(&self) -> Result<Device, IdentityError> {
        Ok(self.identity()?.device)
    }

    /// The device's public key, for greeting frames.
    pub fn public_key(&self) -> Result<PublicKey, IdentityError> {
        Ok(self.identity()?.device.public_key)
    }

    pub fn device_id(&self) -> Result<DeviceId, IdentityError> {
        Ok(self.identity()?.device.id)
    }

    /// Bumps and persists `local_seq`, returning the new value. Every
    /// locally observed change claims one.
    pub fn increment_local_seq(&self) -> Result<u64, IdentityError> {
        let mut guard = self.write_cache();
        let identity = Self::load_or_create(&self.store, &mut guard)?;

        identity.device.local_seq += 1;
        let seq = identity.device.local_seq;
        self.store.put(&LocalDevice, &identity.device)?;

        Ok(seq)
    }

    pub fn set_label(&self, label: String) -> Result<Device, IdentityError> {
        let mut guard = self.write_cache();
        let identity = Self::load_or_create(&self.store, &mut guard)?;

        identity.device.label = label;
        self.store.put(&LocalDevice, &identity.device)?;

        Ok(identity.device.clone())
    }

    /// ECDH with the peer's public key. An all-zero key is the one
    /// malformed encoding a well-behaved peer can never send.
    pub fn derive_shared_key(&self, peer_key: &PublicKey) -> Result<SharedKey, IdentityError> {
        if peer_key.as_bytes() == &[0; 32] {
            return Err(IdentityError::MalformedPeerKey);
        }

        let identity = self.identity()?;
        Ok(SharedKey::new(&identity.private_key, peer_key))
    }

    /// The relay group key for `pair_id`; pure derivation, no identity
    /// involved, kept here so every key exits through one service.
    #[must_use]
    pub fn derive_group_key(&self, pair_id: &PairId) -> GroupKey {
        GroupKey::derive(pair_id)
    }

    /// Drops the in-memory cache; the next call reloads from the store.
    /// Test hook, also used after a user-initiated identity reset.
    pub fn reset_cache(&self) {
        let mut guard = self.write_cache();
        *guard = None;
        debug!("device identity cache dropped");
    }

    fn identity(&self) -> Result<CachedIdentity, IdentityError> {
        if let Some(identity) = self.read_cache().clone() {
            return Ok(identity);
        }

        let mut guard = self.write_cache();
        Ok(Self::load_or_create(&self.store, &mut guard)?.clone())
    }

    fn load_or_create<'a>(
        store: &Store,
        cache: &'a mut Option<CachedIdentity>,
    ) -> Result<&'a mut CachedIdentity, IdentityError> {
        if cache.is_none() {
            let device: Option<Device> = store.get(&LocalDevice)?;

            let identity = match device {
                Some(device) => {
                    let private_key: PrivateKey = store.get(&LocalDeviceKey)?.ok_or_else(|| {
                        IdentityError::KeyStoreUnavailable(
                            "device record exists but its key handle is missing".to_owned(),
                        )
                    })?;
                    CachedIdentity {
                        device,
                        private_key,
                    }
                }
                None => Self::first_launch(store)?,
            };

            *cache = Some(identity);
        }

        Ok(cache
            .as_mut()
            .expect("cache was populated just above"))
    }

    fn first_launch(store: &Store) -> Result<CachedIdentity, IdentityError> {
        let mut rng = thread_rng();

        let private_key = PrivateKey::random(&mut rng);
        let id = DeviceId::random(&mut rng);

        let device = Device {
            id,
            label: format!("device-{}", &id.to_string()[..6]),
            local_seq: 0,
            public_key: private_key.public_key(),
            created_at: now_ms(),
        };

        store.put(&LocalDevice, &device)?;
        store.put(&LocalDeviceKey, &private_key)?;

        info!(device_id = %device.id, "created device identity");

        Ok(CachedIdentity {
            device,
            private_key,
        })
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, Option<CachedIdentity>> {
        self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, Option<CachedIdentity>> {
        self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_launch_creates_and_persists() {
        let store = Store::in_memory();
        let service = DeviceService::new(store.clone());

        let device = service.get_or_create_device().expect("device creation");
        assert_eq!(device.local_seq, 0);

        // A second service over the same store sees the same identity.
        let second = DeviceService::new(store);
        let reloaded = second.get_or_create_device().expect("device reload");
        assert_eq!(reloaded.id, device.id);
        assert_eq!(reloaded.public_key, device.public_key);
    }

    #[test]
    fn test_local_seq_is_monotonic_and_durable() {
        let store = Store::in_memory();
        let service = DeviceService::new(store.clone());

        assert_eq!(service.increment_local_seq().expect("seq"), 1);
        assert_eq!(service.increment_local_seq().expect("seq"), 2);

        service.reset_cache();
        assert_eq!(
            service.increment_local_seq().expect("seq"),
            3,
            "seq continues from the persisted record after a cache reset"
        );

        let fresh = DeviceService::new(store);
        assert_eq!(fresh.get_or_create_device().expect("device").local_seq, 3);
    }

    #[test]
    fn test_shared_key_agreement_between_two_devices() {
        let ours = DeviceService::new(Store::in_memory());
        let theirs = DeviceService::new(Store::in_memory());

        let our_public = ours.public_key().expect("public key");
        let their_public = theirs.public_key().expect("public key");

        let our_shared = ours.derive_shared_key(&their_public).expect("derive");
        let their_shared = theirs.derive_shared_key(&our_public).expect("derive");

        let nonce = [3; butterfly_crypto::NONCE_LEN];
        let sealed = our_shared
            .seal(b"direct frame".to_vec(), nonce)
            .expect("seal");
        let opened = their_shared.open(sealed, nonce).expect("open");

        assert_eq!(opened, b"direct frame");
    }

    #[test]
    fn test_malformed_peer_key_is_rejected() {
        let service = DeviceService::new(Store::in_memory());

        let malformed = PublicKey::from([0; 32]);
        assert!(matches!(
            service.derive_shared_key(&malformed),
            Err(IdentityError::MalformedPeerKey)
        ));
    }

    #[test]
    fn test_group_keys_match_across_devices() {
        let ours = DeviceService::new(Store::in_memory());
        let theirs = DeviceService::new(Store::in_memory());

        let pair_id = PairId::from([5; 32]);
        let nonce = [9; butterfly_crypto::NONCE_LEN];

        let sealed = ours
            .derive_group_key(&pair_id)
            .seal(b"envelope".to_vec(), nonce)
            .expect("seal");
        let opened = theirs
            .derive_group_key(&pair_id)
            .open(sealed, nonce)
            .expect("open");

        assert_eq!(opened, b"envelope");
    }
}
