//! The append-only event vocabulary shared by server and workers.
//!
//! A job is mutated only by appending [`TaskEvent`]s; its current status is
//! the status of the most recent `Job`-kind event. The vocabulary is closed:
//! unknown kinds or statuses fail deserialization instead of being carried
//! along.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A stored string fell outside the frozen vocabulary.
#[derive(Debug, Error)]
#[error("unknown {field} value: {value}")]
pub struct VocabularyError {
    pub field: &'static str,
    pub value: String,
}

/// Whether a message on the event queue is a liveness ping or a job
/// notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Ping,
    Notification,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Ping => "Ping",
            EventKind::Notification => "Notification",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = VocabularyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Ping" => Ok(EventKind::Ping),
            "Notification" => Ok(EventKind::Notification),
            other => Err(VocabularyError {
                field: "event_type",
                value: other.to_string(),
            }),
        }
    }
}

/// The phase a notification reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    Job,
    Download,
    Upload,
    MKVExtract,
    FFProbe,
    PGS,
    FFMPEG,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Job => "Job",
            NotificationKind::Download => "Download",
            NotificationKind::Upload => "Upload",
            NotificationKind::MKVExtract => "MKVExtract",
            NotificationKind::FFProbe => "FFProbe",
            NotificationKind::PGS => "PGS",
            NotificationKind::FFMPEG => "FFMPEG",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = VocabularyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Job" => Ok(NotificationKind::Job),
            "Download" => Ok(NotificationKind::Download),
            "Upload" => Ok(NotificationKind::Upload),
            "MKVExtract" => Ok(NotificationKind::MKVExtract),
            "FFProbe" => Ok(NotificationKind::FFProbe),
            "PGS" => Ok(NotificationKind::PGS),
            "FFMPEG" => Ok(NotificationKind::FFMPEG),
            other => Err(VocabularyError {
                field: "notification_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle status carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Requeued,
    Progressing,
    Completed,
    Canceled,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Requeued => "requeued",
            Status::Progressing => "progressing",
            Status::Completed => "completed",
            Status::Canceled => "canceled",
            Status::Failed => "failed",
        }
    }

    /// Terminal statuses end a job attempt; only a `requeued` event can
    /// follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Canceled | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = VocabularyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(Status::Queued),
            "requeued" => Ok(Status::Requeued),
            "progressing" => Ok(Status::Progressing),
            "completed" => Ok(Status::Completed),
            "canceled" => Ok(Status::Canceled),
            "failed" => Ok(Status::Failed),
            other => Err(VocabularyError {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// One record of a job's append-only event log.
///
/// `event_id` is a per-job dense counter starting at 0; the store rejects
/// any insert that does not continue the sequence. Pings reuse the same
/// envelope with no notification kind or status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub event_id: i32,
    pub event_type: EventKind,
    #[serde(default)]
    pub worker_name: String,
    #[serde(default)]
    pub worker_queue: String,
    pub event_time: DateTime<Utc>,
    #[serde(default)]
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<NotificationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default)]
    pub message: String,
}

impl TaskEvent {
    /// A notification event for one job phase.
    pub fn notification(
        job_id: Uuid,
        event_id: i32,
        kind: NotificationKind,
        status: Status,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(job_id),
            event_id,
            event_type: EventKind::Notification,
            worker_name: String::new(),
            worker_queue: String::new(),
            event_time: Utc::now(),
            ip: String::new(),
            notification_type: Some(kind),
            status: Some(status),
            message: message.into(),
        }
    }

    /// A worker liveness ping.
    pub fn ping(worker_name: impl Into<String>, worker_queue: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: None,
            event_id: 0,
            event_type: EventKind::Ping,
            worker_name: worker_name.into(),
            worker_queue: worker_queue.into(),
            event_time: Utc::now(),
            ip: ip.into(),
            notification_type: None,
            status: None,
            message: String::new(),
        }
    }

    fn is(&self, kind: NotificationKind, status: Status) -> bool {
        self.event_type == EventKind::Notification
            && self.notification_type == Some(kind)
            && self.status == Some(status)
    }

    /// The last recorded event of a task that has not finished its
    /// download yet.
    pub fn is_downloading(&self) -> bool {
        self.is(NotificationKind::Download, Status::Progressing)
            || self.is(NotificationKind::Job, Status::Progressing)
    }

    /// The last recorded event of a task somewhere inside the encode stage.
    pub fn is_encoding(&self) -> bool {
        use NotificationKind::*;
        if self.is(Download, Status::Completed) {
            return true;
        }
        for kind in [MKVExtract, FFProbe, PGS] {
            if self.is(kind, Status::Progressing) || self.is(kind, Status::Completed) {
                return true;
            }
        }
        self.is(FFMPEG, Status::Progressing)
    }

    /// The last recorded event of a task with a finished encode awaiting
    /// upload.
    pub fn is_uploading(&self) -> bool {
        self.is(NotificationKind::FFMPEG, Status::Completed)
            || self.is(NotificationKind::Upload, Status::Progressing)
    }
}

/// The ordered event log of one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskEvents(pub Vec<TaskEvent>);

impl TaskEvents {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaskEvent> {
        self.0.iter()
    }

    pub fn push(&mut self, event: TaskEvent) {
        self.0.push(event);
    }

    /// The event with the highest id, regardless of kind.
    pub fn latest(&self) -> Option<&TaskEvent> {
        self.0.iter().max_by_key(|event| event.event_id)
    }

    /// The highest-id event of one notification kind.
    pub fn latest_of_kind(&self, kind: NotificationKind) -> Option<&TaskEvent> {
        self.0
            .iter()
            .filter(|event| event.notification_type == Some(kind))
            .max_by_key(|event| event.event_id)
    }

    /// The job's current status: the status of the latest `Job`-kind event.
    pub fn current_status(&self) -> Option<Status> {
        self.latest_of_kind(NotificationKind::Job)
            .and_then(|event| event.status)
    }
}

impl IntoIterator for TaskEvents {
    type Item = TaskEvent;
    type IntoIter = std::vec::IntoIter<TaskEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TaskEvents {
    type Item = &'a TaskEvent;
    type IntoIter = std::slice::Iter<'a, TaskEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<TaskEvent> for TaskEvents {
    fn from_iter<T: IntoIterator<Item = TaskEvent>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_id: i32, kind: NotificationKind, status: Status) -> TaskEvent {
        TaskEvent::notification(Uuid::new_v4(), event_id, kind, status, "")
    }

    #[test]
    fn current_status_tracks_latest_job_event() {
        let events: TaskEvents = [
            event(0, NotificationKind::Job, Status::Queued),
            event(1, NotificationKind::Job, Status::Progressing),
            event(2, NotificationKind::Download, Status::Completed),
        ]
        .into_iter()
        .collect();

        assert_eq!(events.current_status(), Some(Status::Progressing));
        assert_eq!(events.latest().map(|e| e.event_id), Some(2));
    }

    #[test]
    fn latest_of_kind_ignores_other_kinds() {
        let events: TaskEvents = [
            event(0, NotificationKind::Job, Status::Queued),
            event(1, NotificationKind::Download, Status::Progressing),
            event(2, NotificationKind::Download, Status::Completed),
        ]
        .into_iter()
        .collect();

        let latest = events.latest_of_kind(NotificationKind::Download).unwrap();
        assert_eq!(latest.event_id, 2);
        assert_eq!(latest.status, Some(Status::Completed));
    }

    #[test]
    fn stage_routing_predicates() {
        assert!(event(0, NotificationKind::Job, Status::Progressing).is_downloading());
        assert!(event(0, NotificationKind::Download, Status::Progressing).is_downloading());

        assert!(event(0, NotificationKind::Download, Status::Completed).is_encoding());
        assert!(event(0, NotificationKind::FFProbe, Status::Progressing).is_encoding());
        assert!(event(0, NotificationKind::PGS, Status::Completed).is_encoding());
        assert!(event(0, NotificationKind::FFMPEG, Status::Progressing).is_encoding());

        assert!(event(0, NotificationKind::FFMPEG, Status::Completed).is_uploading());
        assert!(event(0, NotificationKind::Upload, Status::Progressing).is_uploading());

        assert!(!event(0, NotificationKind::FFMPEG, Status::Completed).is_encoding());
        assert!(!event(0, NotificationKind::Job, Status::Completed).is_downloading());
    }

    #[test]
    fn status_vocabulary_is_closed() {
        assert!(serde_json::from_str::<Status>("\"paused\"").is_err());
        assert!(serde_json::from_str::<NotificationKind>("\"Transcode\"").is_err());
        assert_eq!(
            serde_json::to_string(&Status::Requeued).unwrap(),
            "\"requeued\""
        );
    }

    #[test]
    fn ping_omits_notification_fields() {
        let ping = TaskEvent::ping("worker-1", "worker-1-42-control", "10.0.0.1");
        let json = serde_json::to_value(&ping).unwrap();
        assert!(json.get("notification_type").is_none());
        assert!(json.get("status").is_none());
        assert_eq!(json["event_type"], "Ping");
    }
}
