//! Every timeline has a metadata file that is its local index: the LSN up to
//! which its data is on disk, and the layer files holding that data.
//!
//! The remote counterpart is the [`IndexPart`], which the attach path turns
//! back into a local metadata file once every layer it lists is downloaded.
//!
//! [`IndexPart`]: super::remote_timeline_client::index::IndexPart

use std::collections::BTreeSet;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use utils::{
    crashsafe,
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use super::storage_layer::LayerFileName;
use crate::config::PageServerConf;
use crate::TEMP_FILE_SUFFIX;

/// Use special format number to enable backward compatibility.
const METADATA_FORMAT_VERSION: u16 = 1;

/// Metadata stored on disk for each timeline
///
/// The fields correspond to the values we hold in memory, in Timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineMetadata {
    format_version: u16,
    disk_consistent_lsn: Lsn,
    layers: BTreeSet<LayerFileName>,
}

impl TimelineMetadata {
    pub fn new(disk_consistent_lsn: Lsn, layers: BTreeSet<LayerFileName>) -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            disk_consistent_lsn,
            layers,
        }
    }

    pub fn from_bytes(metadata_bytes: &[u8]) -> anyhow::Result<Self> {
        let metadata: TimelineMetadata =
            serde_json::from_slice(metadata_bytes).context("Failed to parse metadata")?;
        ensure!(
            metadata.format_version == METADATA_FORMAT_VERSION,
            "unsupported metadata format version {}",
            metadata.format_version
        );
        Ok(metadata)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize metadata")
    }

    pub fn disk_consistent_lsn(&self) -> Lsn {
        self.disk_consistent_lsn
    }

    pub fn layers(&self) -> &BTreeSet<LayerFileName> {
        &self.layers
    }
}

/// Save timeline metadata to file
pub fn save_metadata(
    conf: &'static PageServerConf,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    data: &TimelineMetadata,
) -> anyhow::Result<()> {
    let path = conf.metadata_path(tenant_id, timeline_id);
    let tmp_path = crashsafe::path_with_suffix_extension(&path, TEMP_FILE_SUFFIX);
    crashsafe::overwrite(&path, &tmp_path, &data.to_bytes()?)
        .with_context(|| format!("save metadata of timeline {tenant_id}/{timeline_id}"))
}

pub fn load_metadata(
    conf: &'static PageServerConf,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
) -> anyhow::Result<TimelineMetadata> {
    let metadata_path = conf.metadata_path(tenant_id, timeline_id);
    let metadata_bytes = std::fs::read(&metadata_path)
        .with_context(|| format!("Failed to read metadata bytes from path {metadata_path}"))?;
    TimelineMetadata::from_bytes(&metadata_bytes).with_context(|| {
        format!("Failed to parse metadata bytes from path {metadata_path}")
    })
}
