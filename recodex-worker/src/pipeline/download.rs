//! Download stage: pull the source from the server, hash it on the way
//! down, and verify against the server-computed checksum.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use recodex_model::{TaskEncode, WorkTaskEncode};

use super::{Pipeline, hex_digest};
use crate::errors::WorkerError;
use crate::retry::retry_fixed;

const DOWNLOAD_ATTEMPTS: usize = 180;
const CHECKSUM_ATTEMPTS: usize = 10;
const RETRY_DELAY: Duration = Duration::from_secs(5);

struct Downloaded {
    path: PathBuf,
    checksum: String,
}

pub(super) async fn run(
    pipeline: &Pipeline,
    work: &mut WorkTaskEncode,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let client = pipeline.http();
    let task = &work.task;
    let work_dir = &work.work_dir;

    let downloaded = retry_fixed(
        "download",
        DOWNLOAD_ATTEMPTS,
        RETRY_DELAY,
        cancel,
        move || {
            let cancel = cancel.clone();
            async move { fetch_source(client, task, work_dir, &cancel).await }
        },
    )
    .await?;

    let expected = retry_fixed(
        "source-checksum",
        CHECKSUM_ATTEMPTS,
        RETRY_DELAY,
        cancel,
        move || async move {
            let response = client.get(&task.checksum_url).send().await?;
            if !response.status().is_success() {
                return Err(WorkerError::HttpStatus(response.status().as_u16()));
            }
            Ok(response.text().await?)
        },
    )
    .await?;

    if expected != downloaded.checksum {
        return Err(WorkerError::ChecksumMismatch {
            expected,
            got: downloaded.checksum,
        });
    }

    debug!(job = %task.id, path = %downloaded.path.display(), "source verified");
    work.source_file_path = Some(downloaded.path);
    Ok(())
}

async fn fetch_source(
    client: &reqwest::Client,
    task: &TaskEncode,
    work_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Downloaded, WorkerError> {
    let response = client.get(&task.download_url).send().await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(WorkerError::JobNotFound);
    }
    if !response.status().is_success() {
        return Err(WorkerError::HttpStatus(response.status().as_u16()));
    }

    let extension = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .map(disposition_extension)
        .unwrap_or_default();
    let path = work_dir.join(format!("{}{}", task.id, extension));

    let mut file = tokio::fs::File::create(&path).await?;
    let mut hasher = Sha256::new();
    let mut body = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(WorkerError::Canceled),
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.sync_all().await?;

    Ok(Downloaded {
        path,
        checksum: hex_digest(hasher.finalize()),
    })
}

/// Extension (dot included) of the filename advertised in a
/// `Content-Disposition: attachment; filename=...` header.
fn disposition_extension(disposition: &str) -> String {
    disposition
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("filename="))
        .next()
        .map(|name| name.trim_matches('"'))
        .and_then(|name| Path::new(name).extension().map(|ext| format!(".{}", ext.to_string_lossy())))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_the_extension() {
        assert_eq!(
            disposition_extension("attachment; filename=Some.Movie.2019.mkv"),
            ".mkv"
        );
        assert_eq!(
            disposition_extension("attachment; filename=\"quoted name.mp4\""),
            ".mp4"
        );
        assert_eq!(disposition_extension("inline"), "");
    }
}
