//! Dispatch payloads and worker-local task state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::TaskEvent;

/// The encode dispatch sent from server to workers over the task queue.
///
/// URLs point back at the server's streaming endpoints; `event_id` is the
/// id of the last event the server recorded, so the worker continues the
/// sequence from there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEncode {
    pub id: Uuid,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    #[serde(rename = "uploadURL")]
    pub upload_url: String,
    #[serde(rename = "checksumURL")]
    pub checksum_url: String,
    #[serde(rename = "eventID")]
    pub event_id: i32,
    pub priority: u8,
}

/// Targeted control actions published to one worker's control queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Cancel,
}

/// Payload of a `JobEvent`-typed control-queue message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobControlEvent {
    pub id: Uuid,
    pub action: JobAction,
}

/// A dispatched task plus the worker-local paths it accumulates as it moves
/// through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkTaskEncode {
    pub task: TaskEncode,
    pub work_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_file_path: Option<PathBuf>,
}

impl WorkTaskEncode {
    pub fn new(task: TaskEncode, work_dir: PathBuf) -> Self {
        Self {
            task,
            work_dir,
            source_file_path: None,
            target_file_path: None,
        }
    }

    /// Path of the on-disk status file beside the task's working files.
    pub fn status_file_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.json", self.task.id))
    }
}

/// Contents of the status file persisted after every event, keyed by the
/// last event so a restarted worker knows which stage to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub last_event: TaskEvent,
    pub task: WorkTaskEncode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_encode_uses_camel_case_url_fields() {
        let task = TaskEncode {
            id: Uuid::new_v4(),
            download_url: "http://server/api/v1/job/x/download".into(),
            upload_url: "http://server/api/v1/job/x/upload".into(),
            checksum_url: "http://server/api/v1/job/x/checksum".into(),
            event_id: 0,
            priority: 2,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("downloadURL").is_some());
        assert!(json.get("uploadURL").is_some());
        assert!(json.get("checksumURL").is_some());
        assert!(json.get("eventID").is_some());
    }

    #[test]
    fn cancel_action_round_trips() {
        let event = JobControlEvent {
            id: Uuid::new_v4(),
            action: JobAction::Cancel,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"cancel\""));
        let back: JobControlEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.action, JobAction::Cancel);
    }
}
