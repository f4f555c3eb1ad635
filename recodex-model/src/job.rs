//! The durable job record and its HTTP-facing request/notification shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{EventKind, NotificationKind, Status, TaskEvent, TaskEvents};

/// A unit of transcode work, identified by a UUID assigned at creation.
///
/// Paths are relative to the server's download/upload roots. The job is
/// mutated only by appending events; the denormalized status fields mirror
/// the latest `Job`-kind event for list views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source_path: String,
    pub destination_path: String,
    #[serde(default, skip_serializing_if = "TaskEvents::is_empty")]
    pub events: TaskEvents,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: Uuid, source_path: impl Into<String>, destination_path: impl Into<String>) -> Self {
        Self {
            id,
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            events: TaskEvents::default(),
            status: None,
            status_message: None,
            last_update: None,
        }
    }

    /// Append a new event continuing the job's dense event-id sequence.
    pub fn add_event(&mut self, kind: NotificationKind, status: Status) -> TaskEvent {
        let event_id = self.events.latest().map_or(0, |event| event.event_id + 1);
        let event = TaskEvent {
            id: Some(self.id),
            event_id,
            event_type: EventKind::Notification,
            worker_name: String::new(),
            worker_queue: String::new(),
            event_time: Utc::now(),
            ip: String::new(),
            notification_type: Some(kind),
            status: Some(status),
            message: String::new(),
        };
        self.events.push(event.clone());
        event
    }

    pub fn current_status(&self) -> Option<Status> {
        self.events.current_status().or(self.status)
    }
}

/// Body of `POST /api/v1/job/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,
    /// Reschedule an existing job that previously completed.
    #[serde(default)]
    pub force_completed: bool,
    /// Reschedule an existing job that previously failed or was canceled.
    #[serde(default)]
    pub force_failed: bool,
}

/// Frame pushed to websocket subscribers on every job change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUpdateNotification {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_phase: Option<NotificationKind>,
    #[serde(default)]
    pub message: String,
    pub event_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,
}

impl JobUpdateNotification {
    /// The frame for a recorded worker event.
    pub fn from_event(event: &TaskEvent) -> Option<Self> {
        let id = event.id?;
        Some(Self {
            id,
            status: event.status,
            status_phase: event.notification_type,
            message: event.message.clone(),
            event_time: event.event_time,
            source_path: None,
            destination_path: None,
        })
    }

    /// The frame announcing a freshly created job.
    pub fn created(job: &Job) -> Self {
        Self {
            id: job.id,
            status: Some(Status::Queued),
            status_phase: Some(NotificationKind::Job),
            message: String::new(),
            event_time: Utc::now(),
            source_path: Some(job.source_path.clone()),
            destination_path: Some(job.destination_path.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_event_continues_the_sequence() {
        let mut job = Job::new(Uuid::new_v4(), "a/b.mkv", "a/b_encoded.mkv");
        let first = job.add_event(NotificationKind::Job, Status::Queued);
        let second = job.add_event(NotificationKind::Job, Status::Progressing);

        assert_eq!(first.event_id, 0);
        assert_eq!(second.event_id, 1);
        assert_eq!(job.current_status(), Some(Status::Progressing));
    }

    #[test]
    fn job_request_accepts_minimal_body() {
        let request: JobRequest =
            serde_json::from_str(r#"{"source_path":"movies/a.mp4"}"#).unwrap();
        assert_eq!(request.source_path, "movies/a.mp4");
        assert!(request.destination_path.is_none());
        assert!(!request.force_completed);
    }
}
