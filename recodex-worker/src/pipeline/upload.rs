//! Upload stage: push the encoded artifact back to the server.
//!
//! The worker has already burned hours of CPU by the time it gets here, so
//! the POST retries for as long as it takes the server to come back.

use std::path::Path;
use std::time::Duration;

use reqwest::header;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use recodex_model::WorkTaskEncode;

use super::{Pipeline, hex_digest};
use crate::errors::WorkerError;
use crate::retry::retry_fixed;

const UPLOAD_ATTEMPTS: usize = 17_280;
const RETRY_DELAY: Duration = Duration::from_secs(5);

pub(super) async fn run(
    pipeline: &Pipeline,
    work: &mut WorkTaskEncode,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let target = work
        .target_file_path
        .clone()
        .ok_or_else(|| WorkerError::Other("task has no encoded artifact".into()))?;
    let size = tokio::fs::metadata(&target).await?.len();
    let checksum = sha256_file(&target, cancel).await?;
    debug!(job = %work.task.id, size, checksum, "uploading artifact");

    let client = pipeline.http();
    let task = &work.task;
    let target_ref = &target;
    let checksum_ref = checksum.as_str();
    retry_fixed("upload", UPLOAD_ATTEMPTS, RETRY_DELAY, cancel, move || {
        async move {
            let file = tokio::fs::File::open(target_ref).await?;
            let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
            let response = client
                .post(&task.upload_url)
                .header(header::CONTENT_LENGTH, size)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header("checksum", checksum_ref)
                .body(body)
                .send()
                .await?;
            if response.status() != reqwest::StatusCode::CREATED {
                return Err(WorkerError::HttpStatus(response.status().as_u16()));
            }
            Ok(())
        }
    })
    .await
}

async fn sha256_file(path: &Path, cancel: &CancellationToken) -> Result<String, WorkerError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 128 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Err(WorkerError::Canceled);
        }
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_digest(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashes_match_the_reference_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.mkv");
        tokio::fs::write(&path, b"encoded artifact bytes").await.unwrap();

        let cancel = CancellationToken::new();
        let digest = sha256_file(&path, &cancel).await.unwrap();
        assert_eq!(digest, hex_digest(Sha256::digest(b"encoded artifact bytes")));
    }
}
