//! Content-addressed blob store.
//!
//! Blobs live at `<root>/hh/hh/<hex>` keyed by their SHA-256 and are never
//! mutated once published. Safety under concurrent writers rests entirely on
//! the atomic hardlink/rename publish in [`crate::filesystem`] plus
//! idempotent ingest.

mod digest;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    filesystem::{self, ChunkReader, ChunkWriter},
    Result,
};

pub use digest::{Digest, Hasher};

/// Role of a file inside an execution request or response.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileKind {
    Stdin,
    Stdout,
    Stderr,
    User,
}

/// A file crossing the worker boundary.
///
/// `contents` is the optional inline literal body; when absent the blob is
/// resolved through the store, fetching on demand.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub hash: Digest,
    #[serde(default)]
    pub executable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Vec<u8>>,
}

impl FileInfo {
    pub(crate) fn stdio(kind: FileKind) -> Self {
        Self {
            name: String::new(),
            kind,
            hash: Digest::new([0; 32]),
            executable: false,
            contents: None,
        }
    }
}

/// Source of blobs the worker does not yet hold.
///
/// Implementations must stream the exact bytes hashing to `hash` into the
/// writer and commit it (an empty chunk or [`ChunkWriter::commit`]).
/// Integrity of the delivered bytes is the implementor's responsibility.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, hash: &Digest, sink: ChunkWriter) -> Result<()>;
}

/// Fetcher for requests whose inputs are all inline or already present.
pub struct NoFetcher;

#[async_trait::async_trait]
impl Fetcher for NoFetcher {
    async fn fetch(&self, hash: &Digest, _sink: ChunkWriter) -> Result<()> {
        Err(crate::Error::InvalidRequest(format!(
            "no fetcher available for blob {hash}"
        )))
    }
}

pub struct Store {
    root: PathBuf,
}

impl Store {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        filesystem::make_dirs(&root).await?;
        Ok(Self { root })
    }

    /// Two-level fanout path for a digest.
    pub fn path_for(&self, hash: &Digest) -> PathBuf {
        let hex = hash.hex();
        self.root.join(&hex[..2]).join(&hex[2..4]).join(hex)
    }

    pub async fn contains(&self, hash: &Digest) -> bool {
        filesystem::size(self.path_for(hash)).await.is_some()
    }

    /// Make sure the blob behind `info` is present, fetching it if needed.
    pub async fn maybe_fetch(&self, info: &FileInfo, fetcher: &dyn Fetcher) -> Result<()> {
        let path = self.path_for(&info.hash);
        if filesystem::size(&path).await.is_some() {
            return Ok(());
        }
        let Some(mut writer) = filesystem::write(&path, false, false).await? else {
            return Ok(());
        };
        match &info.contents {
            Some(contents) => {
                writer.push(contents).await?;
                writer.commit().await
            }
            None => fetcher.fetch(&info.hash, writer).await,
        }
    }

    pub async fn read(&self, hash: &Digest) -> Result<ChunkReader> {
        filesystem::read(self.path_for(hash)).await
    }

    /// Whole blob in memory; callers know their blobs are small.
    pub async fn contents(&self, hash: &Digest) -> Result<Vec<u8>> {
        self.read(hash).await?.read_all().await
    }

    /// Hash the file at `path` and publish it into the store.
    ///
    /// Concurrent ingests of equal bytes race benignly: the loser observes
    /// the blob already present and succeeds.
    pub async fn ingest(&self, path: impl AsRef<Path>) -> Result<Digest> {
        let digest = filesystem::hash_file(path.as_ref()).await?;
        filesystem::copy(path.as_ref(), self.path_for(&digest), false, true).await?;
        Ok(digest)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::filesystem::TempDir;
    use std::{collections::HashMap, sync::Arc};

    pub(crate) struct MemoryFetcher {
        blobs: HashMap<Digest, Vec<u8>>,
    }

    impl MemoryFetcher {
        pub(crate) fn new(bodies: &[&[u8]]) -> Self {
            Self {
                blobs: bodies
                    .iter()
                    .map(|body| (Digest::of_bytes(body), body.to_vec()))
                    .collect(),
            }
        }
    }

    #[async_trait::async_trait]
    impl Fetcher for MemoryFetcher {
        async fn fetch(&self, hash: &Digest, mut sink: ChunkWriter) -> Result<()> {
            let body = self
                .blobs
                .get(hash)
                .ok_or_else(|| crate::Error::InvalidRequest(format!("unknown blob {hash}")))?;
            for chunk in body.chunks(crate::filesystem::CHUNK_SIZE) {
                sink.push(chunk).await?;
            }
            sink.push(b"").await
        }
    }

    fn user_file(name: &str, body: &[u8], inline: bool) -> FileInfo {
        FileInfo {
            name: name.into(),
            kind: FileKind::User,
            hash: Digest::of_bytes(body),
            executable: false,
            contents: inline.then(|| body.to_vec()),
        }
    }

    #[tokio::test]
    async fn ingest_read_round_trip() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let store = Store::open(tmp.path().join("store")).await.unwrap();
        let source = tmp.path().join("source");
        let data = vec![0x5au8; 100_000];
        tokio::fs::write(&source, &data).await.unwrap();

        let digest = store.ingest(&source).await.unwrap();
        assert_eq!(digest, Digest::of_bytes(&data));
        assert_eq!(store.contents(&digest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn maybe_fetch_inline_contents() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let store = Store::open(tmp.path().join("store")).await.unwrap();
        let info = user_file("input.txt", b"inline body", true);

        store.maybe_fetch(&info, &NoFetcher).await.unwrap();
        assert_eq!(store.contents(&info.hash).await.unwrap(), b"inline body");
    }

    #[tokio::test]
    async fn maybe_fetch_uses_callback_once() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let store = Store::open(tmp.path().join("store")).await.unwrap();
        let body = vec![7u8; crate::filesystem::CHUNK_SIZE * 3 + 5];
        let fetcher = MemoryFetcher::new(&[&body]);
        let info = user_file("data.bin", &body, false);

        store.maybe_fetch(&info, &fetcher).await.unwrap();
        assert_eq!(store.contents(&info.hash).await.unwrap(), body);

        // present now, so the NoFetcher is never consulted
        store.maybe_fetch(&info, &NoFetcher).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_ingest_deduplicates() {
        let tmp = TempDir::new(std::env::temp_dir()).await.unwrap();
        let store = Arc::new(Store::open(tmp.path().join("store")).await.unwrap());
        let data = Arc::new(vec![0xc3u8; 1 << 20]);

        let mut sources = Vec::new();
        for i in 0..2 {
            let path = tmp.path().join(format!("src{i}"));
            tokio::fs::write(&path, data.as_slice()).await.unwrap();
            sources.push(path);
        }

        let tasks: Vec<_> = sources
            .into_iter()
            .map(|path| {
                let store = store.clone();
                tokio::spawn(async move { store.ingest(&path).await })
            })
            .collect();

        let mut digests = Vec::new();
        for task in tasks {
            digests.push(task.await.unwrap().unwrap());
        }
        assert_eq!(digests[0], digests[1]);
        assert!(store.contains(&digests[0]).await);
    }
}
