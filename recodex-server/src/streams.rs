//! Streaming file access with rolling SHA-256.
//!
//! Downloads hash the bytes as the worker pulls them and publish the final
//! checksum into the scheduler's path map, where the worker fetches it for
//! verification. Uploads land in a `.upload` temp file that is atomically
//! renamed only after size and checksum agree.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tracing::debug;

pub fn hex_digest(digest: impl AsRef<[u8]>) -> String {
    digest
        .as_ref()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Source file reader that feeds a SHA-256 and, once fully drained,
/// publishes `(path, checksum)` into the shared map.
pub struct DownloadStream {
    file: File,
    path: PathBuf,
    checksums: DashMapHandle,
    hasher: Option<Sha256>,
    pub size: u64,
    pub file_name: String,
}

type DashMapHandle = std::sync::Arc<DashMap<PathBuf, String>>;

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl DownloadStream {
    pub async fn open(path: PathBuf, checksums: &DashMapHandle) -> io::Result<Self> {
        let file = File::open(&path).await?;
        let metadata = file.metadata().await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            file,
            path,
            checksums: checksums.clone(),
            hasher: Some(Sha256::new()),
            size: metadata.len(),
            file_name,
        })
    }

    fn publish_checksum(&mut self) {
        if let Some(hasher) = self.hasher.take() {
            let checksum = hex_digest(hasher.finalize());
            debug!(path = %self.path.display(), checksum, "source checksum computed");
            self.checksums.insert(self.path.clone(), checksum);
        }
    }
}

impl AsyncRead for DownloadStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.file).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                if filled.is_empty() {
                    this.publish_checksum();
                } else if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(filled);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Hashing writer over the `.upload` temp file.
#[derive(Debug)]
pub struct UploadSink {
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
    hasher: Sha256,
    received: u64,
}

impl UploadSink {
    /// Create the temp file (and parent directories) beside the final
    /// destination.
    pub async fn open(final_path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = upload_temp_path(&final_path);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            file,
            temp_path,
            final_path,
            hasher: Sha256::new(),
            received: 0,
        })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.hasher.update(chunk);
        self.received += chunk.len() as u64;
        self.file.write_all(chunk).await
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn checksum(&self) -> String {
        hex_digest(self.hasher.clone().finalize())
    }

    /// Promote the temp file to its final name.
    pub async fn commit(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        tokio::fs::rename(&self.temp_path, &self.final_path).await
    }

    /// Drop the temp file after a failed upload.
    pub async fn discard(self) -> io::Result<()> {
        drop(self.file);
        tokio::fs::remove_file(&self.temp_path).await
    }
}

fn upload_temp_path(final_path: &Path) -> PathBuf {
    let mut path = final_path.as_os_str().to_owned();
    path.push(".upload");
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn download_publishes_checksum_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.mkv");
        tokio::fs::write(&path, b"recodex test payload").await.unwrap();

        let checksums: DashMapHandle = Arc::new(DashMap::new());
        let mut stream = DownloadStream::open(path.clone(), &checksums).await.unwrap();
        assert_eq!(stream.size, 20);
        assert_eq!(stream.file_name, "source.mkv");

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"recodex test payload");

        let expected = hex_digest(Sha256::digest(b"recodex test payload"));
        assert_eq!(checksums.get(&path).unwrap().value(), &expected);
    }

    #[tokio::test]
    async fn upload_commit_renames_discard_removes() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("nested/dest.mkv");

        let mut sink = UploadSink::open(final_path.clone()).await.unwrap();
        sink.write(b"encoded bytes").await.unwrap();
        assert_eq!(sink.received(), 13);
        assert_eq!(
            sink.checksum(),
            hex_digest(Sha256::digest(b"encoded bytes"))
        );
        sink.commit().await.unwrap();
        assert!(final_path.exists());
        assert!(!final_path.with_extension("mkv.upload").exists());

        let mut sink = UploadSink::open(final_path.clone()).await.unwrap();
        sink.write(b"bad").await.unwrap();
        let temp = dir.path().join("nested/dest.mkv.upload");
        assert!(temp.exists());
        sink.discard().await.unwrap();
        assert!(!temp.exists());
    }
}
