//! On-disk configuration for a butterfly node.

use core::time::Duration;
use std::fs::{read_to_string, write};

use camino::{Utf8Path, Utf8PathBuf};
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};
use url::Url;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ConfigFile {
    pub datastore: DataStoreConfig,

    pub blobstore: BlobStoreConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[non_exhaustive]
pub struct DataStoreConfig {
    pub path: Utf8PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[non_exhaustive]
pub struct BlobStoreConfig {
    pub path: Utf8PathBuf,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Per-chunk transfer timeout.
    #[serde(rename = "chunk_timeout_ms", with = "serde_duration")]
    pub chunk_timeout: Duration,
    /// Idle keepalive interval.
    #[serde(rename = "ping_interval_ms", with = "serde_duration")]
    pub ping_interval: Duration,
    /// Files in flight at once, uploads and downloads together.
    pub max_concurrent_transfers: usize,
    /// Session retries before giving up.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    #[serde(rename = "base_delay_ms", with = "serde_duration")]
    pub base_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(90),
            max_concurrent_transfers: 3,
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RelayConfig {
    /// Base URL of the relay server; relay sync is off when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
}

impl ConfigFile {
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let raw = read_to_string(&path).wrap_err_with(|| format!("failed to read {path}"))?;

        toml::from_str(&raw).wrap_err_with(|| format!("failed to parse {path}"))
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let raw = toml::to_string_pretty(self)?;

        write(&path, raw).wrap_err_with(|| format!("failed to write {path}"))?;
        Ok(())
    }
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigFile {
        ConfigFile {
            datastore: DataStoreConfig {
                path: "data".into(),
            },
            blobstore: BlobStoreConfig {
                path: "blobs".into(),
            },
            sync: SyncConfig::default(),
            relay: RelayConfig::default(),
        }
    }

    #[test]
    fn test_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        assert!(!ConfigFile::exists(dir));
        sample().save(dir).unwrap();
        assert!(ConfigFile::exists(dir));

        let loaded = ConfigFile::load(dir).unwrap();
        assert_eq!(loaded.datastore.path, "data");
        assert_eq!(loaded.sync.chunk_timeout, Duration::from_secs(30));
        assert_eq!(loaded.sync.max_concurrent_transfers, 3);
        assert!(loaded.relay.url.is_none());
    }

    #[test]
    fn test_sync_section_is_optional() {
        let parsed: ConfigFile = toml::from_str(
            r#"
            [datastore]
            path = "d"

            [blobstore]
            path = "b"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.sync.max_retries, 5);
        assert_eq!(parsed.sync.ping_interval, Duration::from_secs(90));
    }
}
