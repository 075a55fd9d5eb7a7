//! In-memory representation of the `index_part.json` file, the authoritative
//! list of a timeline's files in the remote storage.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use utils::lsn::Lsn;

use crate::tenant::metadata::TimelineMetadata;
use crate::tenant::storage_layer::LayerFileName;

/// Metadata gathered for each of the layer files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerFileMetadata {
    file_size: u64,
}

impl From<&'_ IndexLayerMetadata> for LayerFileMetadata {
    fn from(other: &IndexLayerMetadata) -> Self {
        LayerFileMetadata {
            file_size: other.file_size,
        }
    }
}

impl LayerFileMetadata {
    pub fn new(file_size: u64) -> Self {
        LayerFileMetadata { file_size }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

/// In-memory representation of an `index_part.json` file
///
/// Contains the data about all files in the timeline, present remotely and its metadata.
/// A layer is only listed here once its upload has completed.
///
/// This type needs to be backwards and forwards compatible. When changing the fields,
/// remember to add a test case for the changed version.
#[serde_as]
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct IndexPart {
    /// Debugging aid describing the version of this type.
    #[serde(default)]
    pub version: usize,

    /// Per layer file name metadata.
    pub layer_metadata: BTreeMap<LayerFileName, IndexLayerMetadata>,

    // 'disk_consistent_lsn' is a copy of the 'disk_consistent_lsn' in the local metadata.
    #[serde_as(as = "DisplayFromStr")]
    pub disk_consistent_lsn: Lsn,
}

impl IndexPart {
    /// When adding or modifying any parts of `IndexPart`, increment the version so that it can be
    /// used to understand later versions.
    pub const LATEST_VERSION: usize = 1;

    pub const FILE_NAME: &'static str = "index_part.json";

    pub fn new<'a>(
        layers_and_metadata: impl IntoIterator<Item = (&'a LayerFileName, &'a LayerFileMetadata)>,
        disk_consistent_lsn: Lsn,
    ) -> Self {
        let layer_metadata = layers_and_metadata
            .into_iter()
            .map(|(name, metadata)| (name.clone(), IndexLayerMetadata::from(metadata)))
            .collect();

        Self {
            version: Self::LATEST_VERSION,
            layer_metadata,
            disk_consistent_lsn,
        }
    }

    pub fn from_json_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("Failed to deserialize index part")
    }

    pub fn to_json_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize index part")
    }

    /// The local index a timeline gets once every listed layer is on local disk.
    pub fn to_local_metadata(&self) -> TimelineMetadata {
        TimelineMetadata::new(
            self.disk_consistent_lsn,
            self.layer_metadata.keys().cloned().collect::<BTreeSet<_>>(),
        )
    }
}

/// Serialized form of [`LayerFileMetadata`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub struct IndexLayerMetadata {
    pub file_size: u64,
}

impl From<&LayerFileMetadata> for IndexLayerMetadata {
    fn from(other: &LayerFileMetadata) -> Self {
        IndexLayerMetadata {
            file_size: other.file_size,
        }
    }
}
