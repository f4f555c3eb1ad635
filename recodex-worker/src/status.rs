//! On-disk task status files.
//!
//! After every event the task's `{jobId}.json` is rewritten with the event
//! and the task paths, so a crashed worker re-enters the pipeline at the
//! stage it left off instead of waiting for a broker redelivery.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::warn;

use recodex_model::{TaskEvent, TaskStatus, WorkTaskEncode};

use crate::errors::WorkerError;

/// Persist the task state beside its working files. Failure is logged,
/// not fatal: the broker still redelivers on a total loss.
pub async fn save(task: &WorkTaskEncode, last_event: &TaskEvent) {
    let status = TaskStatus {
        last_event: last_event.clone(),
        task: task.clone(),
    };
    if let Err(err) = write_status(&status).await {
        warn!(job = %task.task.id, error = %err, "status file write failed");
    }
}

async fn write_status(status: &TaskStatus) -> Result<(), WorkerError> {
    let path = status.task.status_file_path();
    let body = serde_json::to_vec_pretty(status).map_err(|err| WorkerError::Other(err.to_string()))?;
    let mut file = tokio::fs::File::create(&path).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    Ok(())
}

pub async fn load(path: &Path) -> Result<TaskStatus, WorkerError> {
    let body = tokio::fs::read(path).await?;
    serde_json::from_slice(&body).map_err(|err| WorkerError::Other(err.to_string()))
}

/// Find every status file under the worker's temporary root.
pub async fn scan(root: &Path) -> Result<Vec<TaskStatus>, WorkerError> {
    let mut found = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                dirs.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                match load(&path).await {
                    Ok(status) => found.push(status),
                    Err(err) => warn!(path = %path.display(), error = %err, "unreadable status file, skipping"),
                }
            }
        }
    }
    Ok(found)
}

/// Remove a task's working directory, retrying because encoders can hold
/// files open for a moment after being killed.
pub async fn clean_work_dir(work_dir: &PathBuf) -> Result<(), WorkerError> {
    let cancel = tokio_util::sync::CancellationToken::new();
    crate::retry::retry_fixed(
        "clean-work-dir",
        60,
        std::time::Duration::from_secs(1),
        &cancel,
        move || {
            let work_dir = work_dir.clone();
            async move {
                match tokio::fs::remove_dir_all(&work_dir).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(err) => Err(WorkerError::Io(err)),
                }
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use recodex_model::{NotificationKind, Status, TaskEncode};
    use uuid::Uuid;

    fn task(dir: &Path, id: Uuid) -> WorkTaskEncode {
        WorkTaskEncode::new(
            TaskEncode {
                id,
                download_url: "http://server/d".into(),
                upload_url: "http://server/u".into(),
                checksum_url: "http://server/c".into(),
                event_id: 3,
                priority: 2,
            },
            dir.join(id.to_string()),
        )
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let work = task(dir.path(), id);
        tokio::fs::create_dir_all(&work.work_dir).await.unwrap();

        let event = TaskEvent::notification(
            id,
            4,
            NotificationKind::Download,
            Status::Completed,
            "",
        );
        save(&work, &event).await;

        let statuses = scan(dir.path()).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].task.task.id, id);
        assert_eq!(statuses[0].last_event.event_id, 4);
        assert!(statuses[0].last_event.is_encoding());
    }

    #[tokio::test]
    async fn scan_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(scan(&missing).await.unwrap().is_empty());
    }
}
