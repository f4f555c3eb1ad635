//! Wire-format fidelity: what the server publishes, a worker built from
//! the same model must read back byte-for-byte, and vice versa. These are
//! the contracts that cross process boundaries.

use chrono::Utc;
use recodex_model::{
    EventKind, Job, JobAction, JobControlEvent, JobRequest, JobUpdateNotification,
    NotificationKind, Status, TaskEncode, TaskEvent, TaskPgs, TaskPgsResponse, TaskStatus,
    WorkTaskEncode,
};
use uuid::Uuid;

#[test]
fn encode_task_round_trips_with_camel_case_urls() {
    let id = Uuid::new_v4();
    let task = TaskEncode {
        id,
        download_url: format!("http://server/api/v1/job/{id}/download"),
        upload_url: format!("http://server/api/v1/job/{id}/upload"),
        checksum_url: format!("http://server/api/v1/job/{id}/checksum"),
        event_id: 0,
        priority: 2,
    };

    let wire = serde_json::to_string(&task).unwrap();
    assert!(wire.contains("\"downloadURL\""));
    assert!(wire.contains("\"eventID\":0"));
    assert!(wire.contains("\"priority\":2"));

    let decoded: TaskEncode = serde_json::from_str(&wire).unwrap();
    assert_eq!(decoded.id, id);
    assert_eq!(decoded.download_url, task.download_url);
}

#[test]
fn notification_event_uses_snake_case_fields() {
    let mut event = TaskEvent::notification(
        Uuid::new_v4(),
        5,
        NotificationKind::FFMPEG,
        Status::Progressing,
        r#"{"progress":"42.00"}"#,
    );
    event.worker_name = "garage-1".into();

    let wire = serde_json::to_value(&event).unwrap();
    assert_eq!(wire["event_type"], "Notification");
    assert_eq!(wire["notification_type"], "FFMPEG");
    assert_eq!(wire["status"], "progressing");
    assert_eq!(wire["worker_name"], "garage-1");
    assert_eq!(wire["event_id"], 5);

    let decoded: TaskEvent = serde_json::from_value(wire).unwrap();
    assert_eq!(decoded.event_type, EventKind::Notification);
    assert_eq!(decoded.status, Some(Status::Progressing));
}

#[test]
fn unknown_status_is_rejected_not_carried() {
    let wire = serde_json::to_string(&TaskEvent::notification(
        Uuid::new_v4(),
        0,
        NotificationKind::Job,
        Status::Queued,
        "",
    ))
    .unwrap()
    .replace("queued", "enqueued");
    assert!(serde_json::from_str::<TaskEvent>(&wire).is_err());
}

#[test]
fn cancel_control_event_round_trips() {
    let event = JobControlEvent {
        id: Uuid::new_v4(),
        action: JobAction::Cancel,
    };
    let wire = serde_json::to_string(&event).unwrap();
    assert!(wire.contains("\"action\":\"cancel\""));
    let decoded: JobControlEvent = serde_json::from_str(&wire).unwrap();
    assert_eq!(decoded.action, JobAction::Cancel);
}

#[test]
fn pgs_request_and_response_round_trip() {
    let id = Uuid::new_v4();
    let request = TaskPgs {
        id,
        pgs_id: 4,
        pgs_data: b"\x50\x47binary payload".to_vec(),
        language: "eng".into(),
        reply_to: "garage-1-1234-control".into(),
    };
    let wire = serde_json::to_string(&request).unwrap();
    assert!(wire.contains("\"pgsid\":4"));
    assert!(wire.contains("\"replyto\""));
    let decoded: TaskPgs = serde_json::from_str(&wire).unwrap();
    assert_eq!(decoded.pgs_data, request.pgs_data);

    let response = TaskPgsResponse {
        id,
        pgs_id: 4,
        srt: b"1\n00:00:01,000 --> 00:00:02,000\nhello\n".to_vec(),
        error: String::new(),
        queue: request.reply_to.clone(),
    };
    let wire = serde_json::to_string(&response).unwrap();
    let decoded: TaskPgsResponse = serde_json::from_str(&wire).unwrap();
    assert!(!decoded.is_error());
    assert_eq!(decoded.srt, response.srt);
}

#[test]
fn status_file_preserves_pipeline_position() {
    let id = Uuid::new_v4();
    let mut work = WorkTaskEncode::new(
        TaskEncode {
            id,
            download_url: "http://server/d".into(),
            upload_url: "http://server/u".into(),
            checksum_url: "http://server/c".into(),
            event_id: 7,
            priority: 9,
        },
        std::path::PathBuf::from("/scratch/recodex/worker-garage-1").join(id.to_string()),
    );
    work.source_file_path = Some(work.work_dir.join(format!("{id}.mkv")));

    let status = TaskStatus {
        last_event: TaskEvent::notification(
            id,
            7,
            NotificationKind::FFMPEG,
            Status::Completed,
            "",
        ),
        task: work,
    };
    let wire = serde_json::to_string_pretty(&status).unwrap();
    let decoded: TaskStatus = serde_json::from_str(&wire).unwrap();

    assert!(decoded.last_event.is_uploading());
    assert_eq!(decoded.task.task.event_id, 7);
    assert_eq!(
        decoded.task.source_file_path,
        status.task.source_file_path
    );
}

#[test]
fn websocket_frame_shape() {
    let mut job = Job::new(Uuid::new_v4(), "a/b.x264.mkv", "a/b.x265.mkv");
    job.add_event(NotificationKind::Job, Status::Queued);

    let frame = JobUpdateNotification::created(&job);
    let wire = serde_json::to_value(&frame).unwrap();
    assert_eq!(wire["status"], "queued");
    assert_eq!(wire["status_phase"], "Job");
    assert_eq!(wire["source_path"], "a/b.x264.mkv");

    let update = JobUpdateNotification {
        id: job.id,
        status: Some(Status::Failed),
        status_phase: Some(NotificationKind::FFMPEG),
        message: "exit code 1".into(),
        event_time: Utc::now(),
        source_path: None,
        destination_path: None,
    };
    let wire = serde_json::to_value(&update).unwrap();
    assert!(wire.get("source_path").is_none());
    assert_eq!(wire["message"], "exit code 1");
}

#[test]
fn job_request_defaults_leave_force_flags_off() {
    let request: JobRequest =
        serde_json::from_str(r#"{"source_path":"shows/e01.mp4","destination_path":"shows/e01.mkv"}"#)
            .unwrap();
    assert_eq!(request.destination_path.as_deref(), Some("shows/e01.mkv"));
    assert!(!request.force_completed);
    assert!(!request.force_failed);
}
