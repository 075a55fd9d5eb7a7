/// Extensions to `std::fs` types.
use std::{fs, io};

use camino::Utf8Path;

/// Sums the sizes of all regular files under `path`, recursively.
///
/// Subdirectories whose file name is listed in `exclude` are skipped entirely,
/// at any depth. A missing `path` counts as zero bytes.
pub fn dir_size(path: &Utf8Path, exclude: &[&str]) -> io::Result<u64> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut total = 0;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let name = entry.file_name();
            if exclude.iter().any(|excluded| name == *excluded) {
                continue;
            }
            let child = path.join(name.to_string_lossy().as_ref());
            total += dir_size(&child, exclude)?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dir_size_skips_excluded_subtrees() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::write(root.join("a"), [0u8; 10]).unwrap();
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("sub/b"), [0u8; 20]).unwrap();
        fs::write(root.join("sub/deeper/c"), [0u8; 30]).unwrap();
        fs::create_dir_all(root.join("wal")).unwrap();
        fs::write(root.join("wal/segment"), [0u8; 1000]).unwrap();
        fs::create_dir_all(root.join("sub/wal")).unwrap();
        fs::write(root.join("sub/wal/segment"), [0u8; 500]).unwrap();

        assert_eq!(dir_size(root, &[]).unwrap(), 1560);
        assert_eq!(dir_size(root, &["wal"]).unwrap(), 60);
        assert_eq!(dir_size(&root.join("missing"), &["wal"]).unwrap(), 0);
    }
}
