//! Functions for handling page server configuration options
//!
//! Configuration options can be set in the pageserver.toml configuration
//! file, or on the command line.
//!
//! Instantiated by deserializing `pageserver.toml` into a [`ConfigToml`], and
//! passing that to [`PageServerConf::parse_and_validate`].

use std::num::NonZeroUsize;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use remote_storage::RemoteStorageConfig;
use serde::{Deserialize, Serialize};
use utils::{
    id::{NodeId, TenantId, TimelineId},
    logging::LogFormat,
};

use crate::tenant::storage_layer::LayerFileName;
use crate::{METADATA_FILE_NAME, TENANT_ATTACHING_MARKER_FILENAME};

pub mod defaults {
    use const_format::formatcp;

    pub use pageserver_api::{DEFAULT_HTTP_LISTEN_ADDR, DEFAULT_HTTP_LISTEN_PORT};

    /// Amount of LSN history kept behind `last_record_lsn` before obsolete layers can be removed.
    pub const DEFAULT_GC_HORIZON: u64 = 64 * 1024 * 1024;

    /// How many layers of one tenant are downloaded at once during attach.
    pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 8;

    pub const DEFAULT_LOG_FORMAT: &str = "plain";

    ///
    /// Default built-in configuration file.
    ///
    pub const DEFAULT_CONFIG_FILE: &str = formatcp!(
        r#"
# Initial configuration file created by 'pageserver --init'
#listen_http_addr = '{DEFAULT_HTTP_LISTEN_ADDR}'

#gc_horizon = {DEFAULT_GC_HORIZON}
#download_concurrency = {DEFAULT_DOWNLOAD_CONCURRENCY}

#log_format = '{DEFAULT_LOG_FORMAT}'

# [remote_storage]
"#
    );
}

pub const PAGESERVER_CONFIG_FILE_NAME: &str = "pageserver.toml";
pub const TENANTS_SEGMENT_NAME: &str = "tenants";
pub const TIMELINES_SEGMENT_NAME: &str = "timelines";

/// The contents of `pageserver.toml`, with every field defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigToml {
    pub id: Option<NodeId>,
    pub listen_http_addr: String,
    pub log_format: LogFormat,
    pub remote_storage: Option<RemoteStorageConfig>,
    pub gc_horizon: u64,
    pub download_concurrency: NonZeroUsize,
}

impl Default for ConfigToml {
    fn default() -> Self {
        use defaults::*;
        ConfigToml {
            id: None,
            listen_http_addr: DEFAULT_HTTP_LISTEN_ADDR.to_string(),
            log_format: LogFormat::Plain,
            remote_storage: None,
            gc_horizon: DEFAULT_GC_HORIZON,
            download_concurrency: NonZeroUsize::new(DEFAULT_DOWNLOAD_CONCURRENCY)
                .expect("default concurrency is not zero"),
        }
    }
}

impl ConfigToml {
    /// Parses the config file contents and applies the command line overrides on top.
    ///
    /// Every override is a standalone TOML document, e.g. `gc_horizon=1024`; its
    /// top-level keys replace the keys of the file wholesale, so overriding
    /// `remote_storage={local_path='/tmp'}` replaces the entire table.
    pub fn parse_with_overrides(contents: &str, overrides: &[String]) -> anyhow::Result<Self> {
        let mut doc = contents
            .parse::<toml_edit::Document>()
            .context("Failed to parse the config file")?;

        for option_line in overrides {
            let doc_override = option_line.parse::<toml_edit::Document>().with_context(|| {
                format!("Option '{option_line}' could not be parsed as a toml document")
            })?;

            for (key, item) in doc_override.iter() {
                doc.insert(key, item.clone());
            }
        }

        toml_edit::de::from_document(doc).context("Failed to deserialize the config")
    }
}

/// Immutable configuration of the page server, shared as `&'static` by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageServerConf {
    // Identifier of that particular pageserver, reported by the status endpoint.
    pub id: NodeId,

    /// Example (default): 127.0.0.1:9898
    pub listen_http_addr: String,

    // Repository directory. All local state lives under it.
    pub workdir: Utf8PathBuf,

    pub log_format: LogFormat,

    pub remote_storage_config: RemoteStorageConfig,

    pub gc_horizon: u64,
    pub download_concurrency: NonZeroUsize,
}

impl PageServerConf {
    //
    // Repository paths, relative to workdir.
    //

    pub fn tenants_path(&self) -> Utf8PathBuf {
        self.workdir.join(TENANTS_SEGMENT_NAME)
    }

    pub fn tenant_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenants_path().join(tenant_id.to_string())
    }

    pub fn tenant_attaching_mark_file_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenant_path(tenant_id)
            .join(TENANT_ATTACHING_MARKER_FILENAME)
    }

    pub fn timelines_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenant_path(tenant_id).join(TIMELINES_SEGMENT_NAME)
    }

    pub fn timeline_path(&self, tenant_id: &TenantId, timeline_id: &TimelineId) -> Utf8PathBuf {
        self.timelines_path(tenant_id).join(timeline_id.to_string())
    }

    /// Points to a place in pageserver's local directory,
    /// where certain timeline's metadata file should be located.
    pub fn metadata_path(&self, tenant_id: &TenantId, timeline_id: &TimelineId) -> Utf8PathBuf {
        self.timeline_path(tenant_id, timeline_id)
            .join(METADATA_FILE_NAME)
    }

    pub fn layer_path(
        &self,
        tenant_id: &TenantId,
        timeline_id: &TimelineId,
        layer_file_name: &LayerFileName,
    ) -> Utf8PathBuf {
        self.timeline_path(tenant_id, timeline_id)
            .join(layer_file_name.file_name())
    }

    /// Parse a configuration file (pageserver.toml) into a PageServerConf struct,
    /// validating the input and failing on errors.
    ///
    /// This leaves any options not present in the file in the built-in defaults.
    pub fn parse_and_validate(config_toml: ConfigToml, workdir: &Utf8Path) -> anyhow::Result<Self> {
        let ConfigToml {
            id,
            listen_http_addr,
            log_format,
            remote_storage,
            gc_horizon,
            download_concurrency,
        } = config_toml;

        Ok(PageServerConf {
            id: id.context("missing required value 'id'")?,
            listen_http_addr,
            workdir: workdir.to_owned(),
            log_format,
            remote_storage_config: remote_storage
                .context("missing required section [remote_storage]")?,
            gc_horizon,
            download_concurrency,
        })
    }

    /// Reads `pageserver.toml` from the workdir, applying the command line overrides.
    pub fn load(workdir: &Utf8Path, overrides: &[String]) -> anyhow::Result<Self> {
        let cfg_file_path = workdir.join(PAGESERVER_CONFIG_FILE_NAME);
        let contents = std::fs::read_to_string(&cfg_file_path)
            .with_context(|| format!("Failed to read config file at '{cfg_file_path}'"))?;
        let config_toml = ConfigToml::parse_with_overrides(&contents, overrides)
            .with_context(|| format!("Failed to parse config file at '{cfg_file_path}'"))?;
        Self::parse_and_validate(config_toml, workdir)
    }

    pub fn dummy_conf(repo_dir: Utf8PathBuf, remote_root: Utf8PathBuf) -> Self {
        PageServerConf {
            id: NodeId(0),
            listen_http_addr: defaults::DEFAULT_HTTP_LISTEN_ADDR.to_string(),
            workdir: repo_dir,
            log_format: LogFormat::Test,
            remote_storage_config: RemoteStorageConfig::local_fs(remote_root),
            gc_horizon: defaults::DEFAULT_GC_HORIZON,
            download_concurrency: NonZeroUsize::new(defaults::DEFAULT_DOWNLOAD_CONCURRENCY)
                .expect("default concurrency is not zero"),
        }
    }
}
