//!
//! Layer files: immutable files holding the records of one LSN range of a timeline.
//!
//! A layer file is a sequence of records, each prefixed with its length as a
//! big-endian `u64`. A record advances the LSN by exactly its encoded size, so
//! the file covering `[start, end)` is `end - start` bytes long.
//!
use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use camino::Utf8Path;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use utils::{crashsafe, lsn::Lsn};

use crate::TEMP_FILE_SUFFIX;

/// Size of the length prefix of every record.
pub const RECORD_HEADER_SIZE: u64 = 8;

/// How far a record moves the LSN once written to a layer.
pub fn record_lsn_len(record: &[u8]) -> u64 {
    RECORD_HEADER_SIZE + record.len() as u64
}

/// Represents the filename of a layer
///
///    <LSN start>-<LSN end>
///
#[derive(Debug, PartialEq, Eq, Clone, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct LayerFileName {
    pub lsn_range: Range<Lsn>,
}

// Note: reads rely on this sort order to go through the layers in LSN order
impl PartialOrd for LayerFileName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LayerFileName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lsn_range
            .start
            .cmp(&other.lsn_range.start)
            .then(self.lsn_range.end.cmp(&other.lsn_range.end))
    }
}

impl LayerFileName {
    pub fn new(lsn_range: Range<Lsn>) -> Self {
        LayerFileName { lsn_range }
    }

    ///
    /// Parse a string as a layer file name. Returns None if the filename does not
    /// match the expected pattern.
    ///
    pub fn parse_str(fname: &str) -> Option<Self> {
        let (start, end) = fname.split_once('-')?;
        if start.len() != 16 || end.len() != 16 {
            return None;
        }
        let start_lsn = Lsn::from_hex(start).ok()?;
        let end_lsn = Lsn::from_hex(end).ok()?;

        if start_lsn >= end_lsn {
            return None;
        }

        Some(LayerFileName {
            lsn_range: start_lsn..end_lsn,
        })
    }

    pub fn file_name(&self) -> String {
        self.to_string()
    }

    /// Width of the LSN range, which is also the size of the layer file in bytes.
    pub fn expected_file_size(&self) -> u64 {
        self.lsn_range.end.0 - self.lsn_range.start.0
    }

    /// Whether `other` covers a part of this layer's range only.
    pub fn covers(&self, other: &LayerFileName) -> bool {
        self != other
            && self.lsn_range.start <= other.lsn_range.start
            && other.lsn_range.end <= self.lsn_range.end
    }
}

impl fmt::Display for LayerFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016X}-{:016X}",
            u64::from(self.lsn_range.start),
            u64::from(self.lsn_range.end),
        )
    }
}

impl FromStr for LayerFileName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s).with_context(|| format!("invalid layer file name '{s}'"))
    }
}

pub fn encode_records<'a>(records: impl IntoIterator<Item = &'a Bytes>) -> Bytes {
    let mut buf = BytesMut::new();
    for record in records {
        buf.put_u64(record.len() as u64);
        buf.put_slice(record);
    }
    buf.freeze()
}

pub fn decode_records(mut buf: Bytes) -> anyhow::Result<Vec<Bytes>> {
    let mut records = Vec::new();
    while buf.has_remaining() {
        anyhow::ensure!(
            buf.remaining() as u64 >= RECORD_HEADER_SIZE,
            "truncated record header"
        );
        let len = buf.get_u64() as usize;
        anyhow::ensure!(
            buf.remaining() >= len,
            "truncated record: expected {len} bytes, {} left",
            buf.remaining()
        );
        records.push(buf.split_to(len));
    }
    Ok(records)
}

/// Writes a new layer file crash-safely: a crash leaves either no file or the complete one.
/// Returns the file size.
pub fn write_layer_file(path: &Utf8Path, records: &[Bytes]) -> anyhow::Result<u64> {
    let contents = encode_records(records);
    let tmp_path = crashsafe::path_with_suffix_extension(path, TEMP_FILE_SUFFIX);
    crashsafe::overwrite(path, &tmp_path, &contents)
        .with_context(|| format!("write layer file {path}"))?;
    Ok(contents.len() as u64)
}

pub async fn read_layer_file(path: &Utf8Path) -> anyhow::Result<Vec<Bytes>> {
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("read layer file {path}"))?;
    decode_records(Bytes::from(contents)).with_context(|| format!("decode layer file {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(start: u64, end: u64) -> LayerFileName {
        LayerFileName::new(Lsn(start)..Lsn(end))
    }

    #[test]
    fn layer_file_name_format() {
        let name = layer(0x10, 0x2A8);
        assert_eq!(name.file_name(), "0000000000000010-00000000000002A8");
        assert_eq!(LayerFileName::parse_str(&name.file_name()), Some(name));
    }

    #[test]
    fn invalid_layer_file_names() {
        for bad in [
            "metadata",
            "0000000000000010",
            "0000000000000020-0000000000000010",
            "0000000000000010-0000000000000010",
            "10-20",
            "0000000000000010-00000000000000ZZ",
            "0000000000000010-0000000000000020.temp_download",
        ] {
            assert_eq!(LayerFileName::parse_str(bad), None, "{bad}");
        }
    }

    #[test]
    fn layer_names_in_json_maps() -> anyhow::Result<()> {
        let mut map = std::collections::BTreeMap::new();
        map.insert(layer(0, 16), 16u64);
        let json = serde_json::to_string(&map)?;
        assert_eq!(json, r#"{"0000000000000000-0000000000000010":16}"#);
        let parsed: std::collections::BTreeMap<LayerFileName, u64> = serde_json::from_str(&json)?;
        assert_eq!(parsed, map);
        Ok(())
    }

    #[test]
    fn covering_layers() {
        let merged = layer(0, 100);
        assert!(merged.covers(&layer(0, 40)));
        assert!(merged.covers(&layer(40, 100)));
        assert!(!merged.covers(&merged));
        assert!(!merged.covers(&layer(40, 120)));
        assert!(!layer(0, 40).covers(&merged));
    }

    #[test]
    fn records_encoding() -> anyhow::Result<()> {
        let records = vec![Bytes::from_static(b"first"), Bytes::new()];
        let encoded = encode_records(&records);
        assert_eq!(
            encoded.len() as u64,
            records.iter().map(|r| record_lsn_len(r)).sum::<u64>()
        );
        assert_eq!(decode_records(encoded.clone())?, records);

        decode_records(encoded.slice(..encoded.len() - 1)).unwrap_err();
        decode_records(encoded.slice(..3)).unwrap_err();
        Ok(())
    }

    #[tokio::test]
    async fn layer_file_on_disk() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let records = vec![Bytes::from_static(b"very secret secret|1")];
        let name = layer(0, records.iter().map(|r| record_lsn_len(r)).sum());
        let path = dir.path().join(name.file_name());

        let size = write_layer_file(&path, &records)?;
        assert_eq!(size, name.expected_file_size());
        assert_eq!(read_layer_file(&path).await?, records);
        assert!(!crashsafe::path_with_suffix_extension(&path, TEMP_FILE_SUFFIX).exists());
        Ok(())
    }
}
