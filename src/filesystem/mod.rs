//! Filesystem primitives shared by the store and the dispatcher.
//!
//! Every mutation that publishes a file goes through a staged temp file and
//! an atomic hardlink/rename, so a path either holds complete content or
//! nothing at all.

mod chunk;
mod tempdir;

use std::path::Path;

use crate::{error::Error, store::Digest, Result};

pub use chunk::{ChunkReader, ChunkWriter, CHUNK_SIZE};
pub use tempdir::TempDir;

/// Size of the file at `path`, or `None` if it cannot be stat'ed.
pub async fn size(path: impl AsRef<Path>) -> Option<u64> {
    tokio::fs::metadata(path.as_ref()).await.ok().map(|m| m.len())
}

/// Create `path` and every missing ancestor. Existing directories are fine.
pub async fn make_dirs(path: impl AsRef<Path>) -> Result<()> {
    tokio::fs::create_dir_all(path.as_ref())
        .await
        .map_err(Error::io("mkdir", path))
}

pub async fn remove(path: impl AsRef<Path>) -> Result<()> {
    tokio::fs::remove_file(path.as_ref())
        .await
        .map_err(Error::io("remove", path))
}

/// Recursively delete `path` without crossing mount boundaries.
///
/// A mount point encountered inside the tree is not descended into; removing
/// its directory entry fails and the error propagates.
pub async fn remove_tree(path: impl AsRef<Path>) -> Result<()> {
    let owned = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || tempdir::remove_tree_blocking(&owned))
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        .and_then(|res| res)
        .map_err(Error::io("removetree", path))
}

/// Leave the file readable and executable by the owner only.
pub async fn make_executable(path: impl AsRef<Path>) -> Result<()> {
    set_mode(path, 0o500, "chmod+x").await
}

/// Drop every permission except owner read.
pub async fn make_immutable(path: impl AsRef<Path>) -> Result<()> {
    set_mode(path, 0o400, "chmod-w").await
}

async fn set_mode(path: impl AsRef<Path>, mode: u32, op: &'static str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path.as_ref(), std::fs::Permissions::from_mode(mode))
        .await
        .map_err(Error::io(op, path))
}

pub async fn is_symlink(path: impl AsRef<Path>) -> bool {
    tokio::fs::symlink_metadata(path.as_ref())
        .await
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Streamed SHA-256 of the file at `path`.
pub async fn hash_file(path: impl AsRef<Path>) -> Result<Digest> {
    let mut reader = read(path).await?;
    let mut hasher = crate::store::Hasher::new();
    while let Some(chunk) = reader.next_chunk().await? {
        hasher.update(&chunk);
    }
    Ok(hasher.finalize())
}

/// Open `path` for chunked reading.
pub async fn read(path: impl AsRef<Path>) -> Result<ChunkReader> {
    ChunkReader::open(path.as_ref()).await
}

/// Start a chunked write of `path`.
///
/// Returns `None` when the target already exists, `overwrite` is false and
/// `exist_ok` is true: the caller has nothing to do. The actual content is
/// only published once the writer commits.
pub async fn write(
    path: impl AsRef<Path>,
    overwrite: bool,
    exist_ok: bool,
) -> Result<Option<ChunkWriter>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        make_dirs(parent).await?;
    }
    if !overwrite && size(path).await.is_some() {
        if exist_ok {
            return Ok(None);
        }
        return Err(Error::io("write", path)(std::io::Error::from(
            std::io::ErrorKind::AlreadyExists,
        )));
    }
    ChunkWriter::create(path, overwrite, exist_ok).await.map(Some)
}

/// Copy `src` to `dst`, hardlinking when possible.
///
/// Symlink sources are never hardlinked; they fall back to a streamed copy so
/// the published file owns its bytes.
pub async fn copy(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    overwrite: bool,
    exist_ok: bool,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        make_dirs(parent).await?;
    }
    if !is_symlink(src).await {
        match atomic_link(src, dst, overwrite, exist_ok).await {
            LinkOutcome::Done => return Ok(()),
            LinkOutcome::Exists => {
                return Err(Error::io("copy", dst)(std::io::Error::from(
                    std::io::ErrorKind::AlreadyExists,
                )))
            }
            LinkOutcome::Fallback => {}
        }
    }
    stream_copy(src, dst, overwrite, exist_ok).await
}

/// Move `src` to `dst`: hardlink + unlink, falling back to copy + remove.
pub async fn move_file(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    overwrite: bool,
    exist_ok: bool,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        make_dirs(parent).await?;
    }
    if !is_symlink(src).await {
        match atomic_link(src, dst, overwrite, exist_ok).await {
            LinkOutcome::Done => {
                match tokio::fs::remove_file(src).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(Error::io("remove", src)(err)),
                }
                return Ok(());
            }
            LinkOutcome::Exists => {
                return Err(Error::io("move", dst)(std::io::Error::from(
                    std::io::ErrorKind::AlreadyExists,
                )))
            }
            LinkOutcome::Fallback => {}
        }
    }
    stream_copy(src, dst, overwrite, exist_ok).await?;
    remove(src).await
}

enum LinkOutcome {
    Done,
    Exists,
    Fallback,
}

/// One hardlink attempt with the overwrite/exist_ok dance.
///
/// `Fallback` means the link is not applicable here (cross-device, perms)
/// and the caller should stream instead.
async fn atomic_link(src: &Path, dst: &Path, overwrite: bool, exist_ok: bool) -> LinkOutcome {
    match tokio::fs::hard_link(src, dst).await {
        Ok(()) => LinkOutcome::Done,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            if exist_ok {
                return LinkOutcome::Done;
            }
            if !overwrite {
                return LinkOutcome::Exists;
            }
            if tokio::fs::remove_file(dst).await.is_err() {
                return LinkOutcome::Fallback;
            }
            match tokio::fs::hard_link(src, dst).await {
                Ok(()) => LinkOutcome::Done,
                Err(_) => LinkOutcome::Fallback,
            }
        }
        Err(_) => LinkOutcome::Fallback,
    }
}

async fn stream_copy(src: &Path, dst: &Path, overwrite: bool, exist_ok: bool) -> Result<()> {
    let mut reader = read(src).await?;
    let Some(mut writer) = write(dst, overwrite, exist_ok).await? else {
        return Ok(());
    };
    while let Some(chunk) = reader.next_chunk().await? {
        writer.push(&chunk).await?;
    }
    writer.commit().await
}

/// A fresh uniquely-named file next to `prefix`, opened for writing.
pub async fn temp_file(prefix: impl AsRef<Path>) -> Result<(tokio::fs::File, std::path::PathBuf)> {
    let prefix = prefix.as_ref();
    loop {
        let mut name = prefix.as_os_str().to_os_string();
        name.push(format!(".{}", uuid::Uuid::new_v4().simple()));
        let path = std::path::PathBuf::from(name);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(Error::io("mkstemp", path)(err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    async fn write_all(path: &Path, data: &[u8]) {
        let mut writer = write(path, false, false).await.unwrap().unwrap();
        writer.push(data).await.unwrap();
        writer.commit().await.unwrap();
    }

    #[tokio::test]
    async fn chunked_round_trip() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let path = tmp.path().join("blob");
        let data = vec![0xabu8; CHUNK_SIZE * 2 + 17];

        write_all(&path, &data).await;

        let mut reader = read(&path).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            assert!(chunk.len() <= CHUNK_SIZE);
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn empty_chunk_commits() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let path = tmp.path().join("blob");

        let mut writer = write(&path, false, false).await.unwrap().unwrap();
        writer.push(b"payload").await.unwrap();
        assert!(size(&path).await.is_none());
        writer.push(b"").await.unwrap();
        assert_eq!(size(&path).await, Some(7));
    }

    #[tokio::test]
    async fn uncommitted_writer_leaves_nothing() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let path = tmp.path().join("blob");
        {
            let mut writer = write(&path, false, false).await.unwrap().unwrap();
            writer.push(b"half").await.unwrap();
        }
        assert!(size(&path).await.is_none());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn write_respects_exist_ok() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let path = tmp.path().join("blob");
        write_all(&path, b"first").await;

        assert!(write(&path, false, true).await.unwrap().is_none());
        assert!(matches!(
            write(&path, false, false).await,
            Err(Error::Io { .. })
        ));

        let mut writer = write(&path, true, false).await.unwrap().unwrap();
        writer.push(b"second").await.unwrap();
        writer.commit().await.unwrap();
        let mut reader = read(&path).await.unwrap();
        assert_eq!(reader.next_chunk().await.unwrap().unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn copy_prefers_hardlink() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write_all(&src, b"shared").await;

        copy(&src, &dst, false, false).await.unwrap();

        let a = std::fs::metadata(&src).unwrap();
        let b = std::fs::metadata(&dst).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[tokio::test]
    async fn copy_of_symlink_streams() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let src = tmp.path().join("src");
        let link = tmp.path().join("link");
        let dst = tmp.path().join("dst");
        write_all(&src, b"linked").await;
        tokio::fs::symlink(&src, &link).await.unwrap();

        copy(&link, &dst, false, false).await.unwrap();

        let a = std::fs::metadata(&src).unwrap();
        let b = std::fs::metadata(&dst).unwrap();
        assert_ne!(a.ino(), b.ino());
        assert_eq!(std::fs::read(&dst).unwrap(), b"linked");
    }

    #[tokio::test]
    async fn move_unlinks_source() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write_all(&src, b"moved").await;

        move_file(&src, &dst, false, false).await.unwrap();
        assert!(size(&src).await.is_none());
        assert_eq!(std::fs::read(&dst).unwrap(), b"moved");
    }

    #[tokio::test]
    async fn temp_dir_cleans_up() {
        let kept;
        let removed;
        {
            let mut keep = TempDir::new(std::env::temp_dir()).await.unwrap();
            keep.keep();
            kept = keep.path().to_path_buf();
            let gone = TempDir::new(std::env::temp_dir()).await.unwrap();
            removed = gone.path().to_path_buf();
            write_all(&removed.join("residue"), b"x").await;
        }
        assert!(std::fs::metadata(&kept).is_ok());
        assert!(std::fs::metadata(&removed).is_err());
        std::fs::remove_dir_all(&kept).unwrap();
    }
}
