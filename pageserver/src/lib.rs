//! The page server keeps tenants' layer files on local disk and mirrors them
//! to a remote storage, so that a tenant can be attached to another node and
//! rehydrated from there.

pub mod config;
pub mod context;
pub mod http;
pub mod metrics;
pub mod tenant;

use camino::Utf8Path;

/// Presence of this file in a tenant directory means that the tenant is being
/// attached: its layers are still being downloaded from the remote storage.
pub const TENANT_ATTACHING_MARKER_FILENAME: &str = "attaching";

/// Local index of a timeline, see [`tenant::metadata::TimelineMetadata`].
pub const METADATA_FILE_NAME: &str = "metadata";

/// Suffix of directories and files that are being written and are not valid
/// yet. Such leftovers are removed on startup.
pub const TEMP_FILE_SUFFIX: &str = "___temp";

/// Suffix of layer files that are being downloaded.
pub const TEMP_DOWNLOAD_EXTENSION: &str = "temp_download";

pub fn is_temporary(path: &Utf8Path) -> bool {
    match path.file_name() {
        Some(name) => name.ends_with(TEMP_FILE_SUFFIX),
        None => false,
    }
}

pub fn is_temp_download_file(path: &Utf8Path) -> bool {
    path.extension()
        .map(|ext| ext.ends_with(TEMP_DOWNLOAD_EXTENSION))
        .unwrap_or(false)
}
