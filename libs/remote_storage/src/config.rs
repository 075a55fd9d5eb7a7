use std::{
    num::{NonZeroU32, NonZeroUsize},
    time::Duration,
};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::DEFAULT_REMOTE_STORAGE_MAX_CONCURRENT_SYNCS;

/// External backup storage configuration, enough for creating a client for that storage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteStorageConfig {
    /// The storage connection configuration.
    #[serde(flatten)]
    pub storage: RemoteStorageKind,
    /// Max allowed number of concurrent sync operations between the local and remote storage.
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: NonZeroUsize,
    /// Max allowed errors before the sync task is considered failed and its timeline's tenant
    /// is marked Broken. Unset means transient errors are retried forever.
    #[serde(default)]
    pub max_sync_errors: Option<NonZeroU32>,
    /// A common timeout enforced for all requests.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

/// A kind of a remote storage to connect to, with its connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RemoteStorageKind {
    /// Storage based on local file system.
    /// Specify a root folder to place all stored files into.
    LocalFs { local_path: Utf8PathBuf },
}

impl RemoteStorageConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn from_toml_str(input: &str) -> anyhow::Result<RemoteStorageConfig> {
        Ok(toml_edit::de::from_str(input)?)
    }

    /// Config for a local filesystem storage with default limits.
    pub fn local_fs(local_path: Utf8PathBuf) -> Self {
        RemoteStorageConfig {
            storage: RemoteStorageKind::LocalFs { local_path },
            max_concurrent_syncs: default_max_concurrent_syncs(),
            max_sync_errors: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

fn default_max_concurrent_syncs() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_REMOTE_STORAGE_MAX_CONCURRENT_SYNCS)
        .expect("default concurrency is not zero")
}

fn default_timeout() -> Duration {
    RemoteStorageConfig::DEFAULT_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_localfs_config_with_defaults() {
        let config = RemoteStorageConfig::from_toml_str("local_path = '/tmp/remote'").unwrap();
        assert_eq!(
            config,
            RemoteStorageConfig::local_fs(Utf8PathBuf::from("/tmp/remote"))
        );
    }

    #[test]
    fn parse_localfs_config_with_limits() {
        let input = "local_path = '.'
max_concurrent_syncs = 3
max_sync_errors = 5
timeout = '5s'";

        let config = RemoteStorageConfig::from_toml_str(input).unwrap();

        assert_eq!(
            config,
            RemoteStorageConfig {
                storage: RemoteStorageKind::LocalFs {
                    local_path: Utf8PathBuf::from(".")
                },
                max_concurrent_syncs: NonZeroUsize::new(3).unwrap(),
                max_sync_errors: NonZeroU32::new(5),
                timeout: Duration::from_secs(5),
            }
        );
    }

    #[test]
    fn zero_limits_are_rejected() {
        RemoteStorageConfig::from_toml_str("local_path = '.'\nmax_concurrent_syncs = 0")
            .unwrap_err();
        RemoteStorageConfig::from_toml_str("local_path = '.'\nmax_sync_errors = 0").unwrap_err();
    }
}
