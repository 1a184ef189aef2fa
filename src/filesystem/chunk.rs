use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{error::Error, Result};

/// Upper bound on a single chunk moving through readers, writers and fetch
/// callbacks. Output blobs no larger than this are inlined into responses.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Lazy chunked reader over one file.
pub struct ChunkReader {
    file: tokio::fs::File,
    path: PathBuf,
}

impl ChunkReader {
    pub(super) async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(Error::io("read", path))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Next chunk of at most [`CHUNK_SIZE`] bytes, `None` at end of file.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let amount = self
            .file
            .read(&mut buf)
            .await
            .map_err(Error::io("read", &self.path))?;
        if amount == 0 {
            return Ok(None);
        }
        buf.truncate(amount);
        Ok(Some(Bytes::from(buf)))
    }

    /// Drain the remaining chunks into one buffer.
    pub async fn read_all(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Chunk receiver staging into a sibling temp file.
///
/// Nothing is visible at the target path until commit, which fsyncs and
/// atomically publishes the staged file. An empty chunk pushed into the
/// writer is the commit signal; dropping an uncommitted writer discards the
/// staged bytes.
pub struct ChunkWriter {
    file: Option<tokio::fs::File>,
    staged: PathBuf,
    target: PathBuf,
    overwrite: bool,
    exist_ok: bool,
    committed: bool,
}

impl ChunkWriter {
    pub(super) async fn create(target: &Path, overwrite: bool, exist_ok: bool) -> Result<Self> {
        let (file, staged) = super::temp_file(target).await?;
        Ok(Self {
            file: Some(file),
            staged,
            target: target.to_path_buf(),
            overwrite,
            exist_ok,
            committed: false,
        })
    }

    /// Append one chunk. The empty chunk commits.
    pub async fn push(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return self.commit_inner().await;
        }
        let Some(file) = self.file.as_mut() else {
            return Err(Error::io("write", &self.target)(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        };
        file.write_all(chunk)
            .await
            .map_err(Error::io("write", &self.staged))
    }

    /// Durably publish the staged bytes at the target path.
    pub async fn commit(mut self) -> Result<()> {
        self.commit_inner().await
    }

    async fn commit_inner(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()
            .await
            .map_err(Error::io("flush", &self.staged))?;
        file.sync_all()
            .await
            .map_err(Error::io("fsync", &self.staged))?;
        drop(file);
        self.publish().await?;
        self.committed = true;
        Ok(())
    }

    async fn publish(&self) -> Result<()> {
        if self.overwrite {
            return tokio::fs::rename(&self.staged, &self.target)
                .await
                .map_err(Error::io("rename", &self.target));
        }
        match tokio::fs::hard_link(&self.staged, &self.target).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && self.exist_ok => {}
            Err(err) => {
                let _ = std::fs::remove_file(&self.staged);
                return Err(Error::io("publish", &self.target)(err));
            }
        }
        match tokio::fs::remove_file(&self.staged).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io("remove", &self.staged)(err)),
        }
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = std::fs::remove_file(&self.staged) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("leaking staged file {:?}: {}", self.staged, err);
                }
            }
        }
    }
}
