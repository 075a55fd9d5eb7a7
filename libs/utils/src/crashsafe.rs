use std::{
    borrow::Cow,
    fs::{self, File},
    io::{self, Write},
};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(
    original_path: impl AsRef<Utf8Path>,
    suffix: &str,
) -> Utf8PathBuf {
    let new_extension = match original_path.as_ref().extension() {
        Some(extension) => Cow::Owned(format!("{extension}.{suffix}")),
        None => Cow::Borrowed(suffix),
    };
    original_path.as_ref().with_extension(new_extension)
}

pub fn fsync_file_and_parent(file_path: &Utf8Path) -> anyhow::Result<()> {
    let parent = file_path
        .parent()
        .with_context(|| format!("File {file_path} has no parent"))?;

    fsync(file_path)?;
    fsync(parent)?;
    Ok(())
}

pub fn fsync(path: &Utf8Path) -> anyhow::Result<()> {
    File::open(path)
        .context("Failed to open the file")
        .and_then(|file| file.sync_all().context("Failed to sync file metadata"))
        .with_context(|| format!("Failed to fsync file {path}"))
}

pub async fn fsync_async(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    tokio::fs::File::open(path.as_ref()).await?.sync_all().await
}

/// Similar to [`std::fs::create_dir`], except we fsync the
/// created directory and its parent.
pub fn create_dir(path: impl AsRef<Utf8Path>) -> anyhow::Result<()> {
    let directory_path = path.as_ref();
    fs::create_dir(directory_path)
        .with_context(|| format!("Failed to create directory {directory_path}"))?;
    fsync_file_and_parent(directory_path).context("failed to fsync created directory")?;
    Ok(())
}

/// Similar to [`std::fs::create_dir_all`], except we fsync all
/// newly created directories and the pre-existing parent.
pub fn create_dir_all(path: impl AsRef<Utf8Path>) -> anyhow::Result<()> {
    let mut path = path.as_ref();

    let mut dirs_to_create = Vec::new();

    loop {
        match path.metadata() {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => anyhow::bail!("non-directory found in path: {path}"),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => anyhow::bail!("Error during path {path} metadata retrieval: {e}"),
        }

        dirs_to_create.push(path);

        match path.parent() {
            Some(parent) => path = parent,
            None => anyhow::bail!("can't find parent of path '{path}'"),
        }
    }

    for &path in dirs_to_create.iter().rev() {
        fs::create_dir(path).with_context(|| format!("Failed to create directory {path}"))?;
    }

    for &path in dirs_to_create.iter() {
        fsync(path)?;
    }

    if !dirs_to_create.is_empty() {
        fsync(path)?;
    }

    Ok(())
}

/// Writes `content` to `final_path` so that a crash at any point leaves either
/// the old file or the complete new one: write to `tmp_path`, fsync it,
/// rename over the target and fsync the parent directory.
pub fn overwrite(final_path: &Utf8Path, tmp_path: &Utf8Path, content: &[u8]) -> anyhow::Result<()> {
    let parent = final_path
        .parent()
        .with_context(|| format!("File {final_path} has no parent"))?;
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)
            .with_context(|| format!("Failed to open temporary file {tmp_path}"))?;
        file.write_all(content)
            .with_context(|| format!("Failed to write temporary file {tmp_path}"))?;
        file.sync_all()
            .with_context(|| format!("Failed to fsync temporary file {tmp_path}"))?;
    }
    fs::rename(tmp_path, final_path)
        .with_context(|| format!("Failed to rename {tmp_path} to {final_path}"))?;
    fsync(parent)?;
    Ok(())
}

/// Removes a file and fsyncs its parent directory. Missing files are not an error.
pub fn durable_remove_file(path: &Utf8Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to remove file {path}")),
    }
    if let Some(parent) = path.parent() {
        fsync(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use camino_tempfile::tempdir;

    use super::*;

    #[test]
    fn test_path_with_suffix_extension() {
        let p = Utf8PathBuf::from("/foo/bar");
        assert_eq!(path_with_suffix_extension(&p, "temp"), "/foo/bar.temp");
        let p = Utf8PathBuf::from("/foo/bar.baz");
        assert_eq!(
            path_with_suffix_extension(&p, "temp.temp"),
            "/foo/bar.baz.temp.temp"
        );
        let p = Utf8PathBuf::from("/foo/0000000000000000-0000000000000010");
        assert_eq!(
            path_with_suffix_extension(&p, "temp_download"),
            "/foo/0000000000000000-0000000000000010.temp_download"
        );
    }

    #[test]
    fn test_create_dir_fsyncd() {
        let dir = tempdir().unwrap();

        let existing_dir_path = dir.path();
        let err = create_dir(existing_dir_path).unwrap_err();
        let error_message = format!("{err:#}");
        assert!(
            error_message.contains("File exists"),
            "Unexpected error message: {error_message}"
        );

        create_dir(existing_dir_path.join("child")).unwrap();

        let nested_child_dir = existing_dir_path.join("child1").join("child2");
        create_dir(nested_child_dir).unwrap_err();
    }

    #[test]
    fn test_create_dir_all_fsyncd() {
        let dir = tempdir().unwrap();

        let existing_dir_path = dir.path();
        create_dir_all(existing_dir_path).unwrap();

        let nested_child_dir = existing_dir_path.join("child1").join("child2");
        assert!(!nested_child_dir.exists());
        create_dir_all(&nested_child_dir).unwrap();
        assert!(nested_child_dir.exists());

        let file_path = existing_dir_path.join("file");
        std::fs::write(&file_path, b"").unwrap();

        let err = create_dir_all(&file_path).unwrap_err();
        let error_message = format!("{err:#}");
        assert!(
            error_message.contains("non-directory found in path"),
            "Unexpected error message: {error_message}"
        );
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("metadata");
        let tmp = path_with_suffix_extension(&target, "___temp");

        overwrite(&target, &tmp, b"first").unwrap();
        overwrite(&target, &tmp, b"second").unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        assert!(!tmp.exists());

        durable_remove_file(&target).unwrap();
        assert!(!target.exists());
        durable_remove_file(&target).unwrap();
    }
}
