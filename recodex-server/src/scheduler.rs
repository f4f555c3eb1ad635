//! Job scheduling: validation, destination derivation, dispatch,
//! timeout-driven requeue, cancellation, and the live-update fan-out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use recodex_broker::BrokerError;
use recodex_config::SchedulerConfig;
use recodex_media::{priority_for_duration, probe_file};
use recodex_model::{
    EventKind, Job, JobAction, JobControlEvent, JobRequest, JobUpdateNotification,
    NotificationKind, Status, TaskEncode, TaskEvent, Worker,
};

use crate::events::EventPublisher;
use crate::store::{self, Store, StoreError};
use crate::streams::{DownloadStream, UploadSink};

static VIDEO_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(((x|h)264)|mpeg-4|mpeg-1|mpeg-2|mpeg|xvid|divx|vc-1|av1|vp8|vp9|wmv3|mp43)")
        .expect("video token regex")
});
static AUDIO_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(ac3|eac3|pcm|flac|mp2|dts|mp3|truehd|wma|vorbis|opus|mpeg audio)")
        .expect("audio token regex")
});

const VALID_EXTENSIONS: &[&str] = &[
    "mp4", "mpg", "m4a", "m4v", "f4v", "f4a", "m4b", "m4r", "f4b", "mov", "ogg", "oga", "ogv",
    "ogx", "wmv", "wma", "asf", "webm", "avi", "flv", "vob", "mkv",
];

/// Priority assigned when a timed-out job is republished.
const REQUEUE_PRIORITY: u8 = 9;
/// Priority used when the duration probe fails; the job still schedules.
const FALLBACK_PRIORITY: u8 = 3;

const SUBSCRIBER_BUFFER: usize = 100;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Validation(String),

    #[error("job already exists")]
    Conflict,

    #[error("job not found")]
    NotFound,

    #[error("job is in status {0}, streaming not allowed")]
    StreamNotAllowed(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => SchedulerError::NotFound,
            StoreError::Conflict => SchedulerError::Conflict,
            other => SchedulerError::Store(other),
        }
    }
}

/// Rewrite legacy codec tokens in a path and force the `.mkv` extension.
/// Applying it to its own output is a no-op.
pub fn derive_destination(source: &str) -> String {
    let rewritten = VIDEO_TOKENS.replace_all(source, "x265");
    let rewritten = AUDIO_TOKENS.replace_all(&rewritten, "AAC");
    PathBuf::from(rewritten.as_ref())
        .with_extension("mkv")
        .to_string_lossy()
        .into_owned()
}

fn fallback_destination(source: &str) -> String {
    let path = PathBuf::from(source);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}_encoded.mkv"))
        .to_string_lossy()
        .into_owned()
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Store,
    publisher: EventPublisher,
    checksums: Arc<DashMap<PathBuf, String>>,
    subscribers: DashMap<Uuid, mpsc::Sender<JobUpdateNotification>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Store,
        publisher: EventPublisher,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            publisher,
            checksums: Arc::new(DashMap::new()),
            subscribers: DashMap::new(),
            cancel,
        }
    }

    /// Validate a request, derive its destination and priority, and
    /// dispatch it. Returns the created (or force-rescheduled) job.
    pub async fn schedule_job_request(&self, request: &JobRequest) -> Result<Job, SchedulerError> {
        let source_path = request.source_path.trim_start_matches('/').to_string();
        let full_path = self.config.download_path.join(&source_path);

        let metadata = tokio::fs::metadata(&full_path)
            .await
            .map_err(|_| SchedulerError::Validation(format!("{} does not exist", full_path.display())))?;
        if metadata.is_dir() {
            return Err(SchedulerError::Validation(format!(
                "{} is a directory",
                full_path.display()
            )));
        }
        if metadata.len() < self.config.min_file_size {
            return Err(SchedulerError::Validation(format!(
                "{} file size must be bigger than {}",
                full_path.display(),
                self.config.min_file_size
            )));
        }
        let extension = full_path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !VALID_EXTENSIONS.contains(&extension.as_str()) {
            return Err(SchedulerError::Validation(format!(
                "{} invalid extension {extension}",
                full_path.display()
            )));
        }

        let destination_path = match &request.destination_path {
            Some(destination) => destination.clone(),
            None => {
                let derived = derive_destination(&source_path);
                if derived == source_path {
                    fallback_destination(&source_path)
                } else {
                    derived
                }
            }
        };

        let priority = self.derive_priority(&full_path).await;
        let job = self
            .dispatch(&source_path, &destination_path, priority, request)
            .await?;

        self.notify(JobUpdateNotification::created(&job));
        Ok(job)
    }

    async fn derive_priority(&self, path: &Path) -> u8 {
        match probe_file(path, &self.cancel).await {
            Ok(data) => {
                let seconds = data.format.duration_seconds();
                priority_for_duration(Duration::from_secs_f64(seconds.max(0.0)))
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "duration probe failed, using fallback priority");
                FALLBACK_PRIORITY
            }
        }
    }

    /// Create the job, its first event, and the broker dispatch in one
    /// transaction. An existing job is a conflict unless a matching force
    /// flag allows rescheduling it.
    async fn dispatch(
        &self,
        source_path: &str,
        destination_path: &str,
        priority: u8,
        request: &JobRequest,
    ) -> Result<Job, SchedulerError> {
        let source = source_path.to_string();
        let destination = destination_path.to_string();
        let publisher = self.publisher.clone();
        let domain = self.config.domain.clone();
        let force_completed = request.force_completed;
        let force_failed = request.force_failed;

        self.store
            .with_transaction(move |conn: &mut sqlx::PgConnection| {
                Box::pin(async move {
                    match store::get_job_by_path(conn, &source).await? {
                        None => {
                            let mut job = Job::new(Uuid::new_v4(), source, destination);
                            store::add_job(conn, &job).await?;
                            let event = job.add_event(NotificationKind::Job, Status::Queued);
                            store::add_event(conn, &event).await?;

                            let task = encode_task(&domain, &job, priority);
                            publisher.publish_job_request(&task).await?;
                            Ok(job)
                        }
                        Some(mut job) => {
                            let status = job.current_status();
                            let allowed = matches!(
                                (status, force_completed, force_failed),
                                (Some(Status::Completed), true, _)
                                    | (Some(Status::Failed), _, true)
                                    | (Some(Status::Canceled), _, true)
                            );
                            if !allowed {
                                return Err(SchedulerError::Conflict);
                            }
                            let event = job.add_event(NotificationKind::Job, Status::Requeued);
                            store::add_event(conn, &event).await?;

                            let task = encode_task(&domain, &job, priority);
                            publisher.publish_job_request(&task).await?;
                            Ok(job)
                        }
                    }
                })
            })
            .await
    }

    /// The scheduling loop: periodically requeue jobs stuck `progressing`
    /// past the timeout.
    pub async fn run(self: Arc<Self>) {
        info!(
            every = ?self.config.schedule_time,
            timeout = ?self.config.job_timeout,
            "starting scheduling loop"
        );
        let mut ticker = tokio::time::interval(self.config.schedule_time);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("scheduling loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.requeue_timed_out().await {
                        error!(error = %err, "timeout requeue sweep failed");
                    }
                }
            }
        }
    }

    async fn requeue_timed_out(&self) -> Result<(), SchedulerError> {
        let stale = self.store.get_timeout_jobs(self.config.job_timeout).await?;
        for event in stale {
            if event.status != Some(Status::Progressing) {
                continue;
            }
            let Some(job_id) = event.id else { continue };
            info!(job = %job_id, "requeueing after job timeout");
            if let Err(err) = self.requeue_job(job_id).await {
                error!(job = %job_id, error = %err, "requeue failed");
            }
        }
        Ok(())
    }

    async fn requeue_job(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let publisher = self.publisher.clone();
        let domain = self.config.domain.clone();

        self.store
            .with_transaction(move |conn: &mut sqlx::PgConnection| {
                Box::pin(async move {
                    let mut job = store::get_job(conn, job_id).await?;
                    let event = job.add_event(NotificationKind::Job, Status::Requeued);
                    store::add_event(conn, &event).await?;

                    let task = encode_task(&domain, &job, REQUEUE_PRIORITY);
                    publisher.publish_job_request(&task).await?;
                    Ok(())
                })
            })
            .await
    }

    /// Publish a cancel action to the worker that owns a `progressing` job.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let job = self.store.get_job(job_id).await?;
        if job.current_status() != Some(Status::Progressing) {
            return Err(SchedulerError::Validation(format!(
                "job {} is not progressing",
                job_id
            )));
        }
        let owner = job
            .events
            .latest_of_kind(NotificationKind::Job)
            .map(|event| event.worker_name.clone())
            .filter(|name| !name.is_empty())
            .ok_or(SchedulerError::NotFound)?;
        let worker = self.store.get_worker(&owner).await?;

        self.publisher
            .publish_job_event(
                &JobControlEvent {
                    id: job_id,
                    action: JobAction::Cancel,
                },
                &worker.queue_name,
            )
            .await;
        Ok(())
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, SchedulerError> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn get_jobs(&self, page: u32, page_size: u32) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.get_jobs(page, page_size).await?)
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<(), SchedulerError> {
        Ok(self.store.delete_job(id).await?)
    }

    pub async fn get_workers(&self) -> Result<Vec<Worker>, SchedulerError> {
        Ok(self.store.get_workers().await?)
    }

    /// Register a websocket subscriber. The receiver sees every update
    /// produced after registration, in order.
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<JobUpdateNotification>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.remove(&id);
    }

    fn notify(&self, notification: JobUpdateNotification) {
        for entry in self.subscribers.iter() {
            // Best effort: a slow subscriber drops frames instead of
            // stalling event processing.
            let _ = entry.value().try_send(notification.clone());
        }
    }

    /// Side effects after an event was durably recorded.
    pub async fn after_event(&self, event: &TaskEvent) {
        if event.event_type == EventKind::Ping {
            return;
        }
        if let Some(notification) = JobUpdateNotification::from_event(event) {
            self.notify(notification);
        }

        if event.notification_type == Some(NotificationKind::Job)
            && event.status == Some(Status::Completed)
        {
            self.handle_completed(event).await;
        }
    }

    async fn handle_completed(&self, event: &TaskEvent) {
        if !self.config.delete_source_on_complete {
            return;
        }
        let Some(job_id) = event.id else { return };
        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(err) => {
                error!(job = %job_id, error = %err, "completed job lookup failed");
                return;
            }
        };
        let source = self.config.download_path.join(&job.source_path);
        let target = self.config.upload_path.join(&job.destination_path);
        if tokio::fs::metadata(&target).await.is_err() {
            warn!(
                job = %job_id,
                source = %source.display(),
                "job completed but target file is missing, keeping source"
            );
            return;
        }
        info!(job = %job_id, source = %source.display(), "job completed, removing source file");
        if let Err(err) = tokio::fs::remove_file(&source).await {
            error!(job = %job_id, error = %err, "source removal failed");
        }
    }

    async fn streamable_job(&self, id: Uuid) -> Result<Job, SchedulerError> {
        let job = self.store.get_job(id).await?;
        match job.current_status() {
            Some(Status::Progressing) => Ok(job),
            other => Err(SchedulerError::StreamNotAllowed(
                other.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()),
            )),
        }
    }

    /// Open the source file for a worker download. The returned stream
    /// publishes the source checksum once fully read.
    pub async fn download_stream(&self, id: Uuid) -> Result<DownloadStream, SchedulerError> {
        let job = self.streamable_job(id).await?;
        let path = self.config.download_path.join(&job.source_path);
        DownloadStream::open(path, &self.checksums)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => SchedulerError::NotFound,
                _ => SchedulerError::Io(err),
            })
    }

    /// Open the `.upload` temp sink for a worker upload.
    pub async fn upload_sink(&self, id: Uuid) -> Result<UploadSink, SchedulerError> {
        let job = self.streamable_job(id).await?;
        let path = self.config.upload_path.join(&job.destination_path);
        Ok(UploadSink::open(path).await?)
    }

    /// The previously computed source checksum for a job.
    pub async fn checksum(&self, id: Uuid) -> Result<String, SchedulerError> {
        let job = self.store.get_job(id).await?;
        let path = self.config.download_path.join(&job.source_path);
        self.checksums
            .get(&path)
            .map(|entry| entry.value().clone())
            .ok_or(SchedulerError::NotFound)
    }
}

fn encode_task(domain: &url::Url, job: &Job, priority: u8) -> TaskEncode {
    let base = domain.as_str().trim_end_matches('/').to_string();
    let event_id = job.events.latest().map_or(0, |event| event.event_id);
    TaskEncode {
        id: job.id,
        download_url: format!("{base}/api/v1/job/{}/download", job.id),
        upload_url: format!("{base}/api/v1/job/{}/upload", job.id),
        checksum_url: format!("{base}/api/v1/job/{}/checksum", job.id),
        event_id,
        priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_video_and_audio_tokens() {
        assert_eq!(
            derive_destination("movies/Show.2019.x264.AC3.mp4"),
            "movies/Show.2019.x265.AAC.mkv"
        );
        assert_eq!(
            derive_destination("a/B H264 DTS.avi"),
            "a/B x265 AAC.mkv"
        );
    }

    #[test]
    fn derivation_is_idempotent() {
        let once = derive_destination("movies/Show.x264.EAC3.mkv");
        let twice = derive_destination(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn unchanged_paths_get_the_encoded_suffix() {
        let source = "movies/plain.mkv";
        assert_eq!(derive_destination(source), source);
        assert_eq!(fallback_destination(source), "movies/plain_encoded.mkv");
    }

    #[test]
    fn encode_task_urls_point_at_the_job() {
        let domain = url::Url::parse("http://transcode.local:8080").unwrap();
        let mut job = Job::new(Uuid::new_v4(), "a.mkv", "a_encoded.mkv");
        job.add_event(NotificationKind::Job, Status::Queued);

        let task = encode_task(&domain, &job, 2);
        assert_eq!(
            task.download_url,
            format!("http://transcode.local:8080/api/v1/job/{}/download", job.id)
        );
        assert_eq!(task.event_id, 0);
        assert_eq!(task.priority, 2);
    }
}
