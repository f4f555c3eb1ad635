//! The three-stage encode pipeline: download, encode, upload.
//!
//! Stages run as independent tasks connected by channels; a job moves
//! through them in order, emitting an event (and rewriting its status
//! file) at every transition. The download stage only starts work while
//! the encode stage is nearly drained, so a worker holds at most one
//! encoding job plus one pre-downloaded job at steady state.

mod download;
mod encode;
mod upload;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use recodex_config::WorkerConfig;
use recodex_model::{
    NotificationKind, Status, TaskEncode, TaskEvent, TaskPgs, TaskPgsResponse, WorkTaskEncode,
};

use crate::client::{ActiveJobs, Manager};
use crate::errors::WorkerError;
use crate::status;

const STAGE_CHANNEL_SIZE: usize = 100;
/// Tasks waiting to be downloaded; one queued task keeps the worker fed
/// without hoarding dispatches other workers could take.
const DOWNLOAD_QUEUE_SIZE: usize = 1;

pub(crate) fn hex_digest(digest: impl AsRef<[u8]>) -> String {
    digest
        .as_ref()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

pub struct Pipeline {
    config: WorkerConfig,
    temp_root: PathBuf,
    manager: Arc<dyn Manager>,
    active: ActiveJobs,
    root: CancellationToken,
    http: reqwest::Client,
    download_tx: mpsc::Sender<WorkTaskEncode>,
    encode_tx: mpsc::Sender<WorkTaskEncode>,
    upload_tx: mpsc::Sender<WorkTaskEncode>,
    download_queued: AtomicUsize,
    encode_queued: AtomicUsize,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("temp_root", &self.temp_root)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build the pipeline and spawn its stage tasks.
    pub fn start(
        config: WorkerConfig,
        temp_root: PathBuf,
        manager: Arc<dyn Manager>,
        active: ActiveJobs,
        root: CancellationToken,
    ) -> Arc<Self> {
        let (download_tx, download_rx) = mpsc::channel(STAGE_CHANNEL_SIZE);
        let (encode_tx, encode_rx) = mpsc::channel(STAGE_CHANNEL_SIZE);
        let (upload_tx, upload_rx) = mpsc::channel(STAGE_CHANNEL_SIZE);

        let pipeline = Arc::new(Self {
            config,
            temp_root,
            manager,
            active,
            root,
            http: reqwest::Client::new(),
            download_tx,
            encode_tx,
            upload_tx,
            download_queued: AtomicUsize::new(0),
            encode_queued: AtomicUsize::new(0),
        });

        tokio::spawn(pipeline.clone().download_stage(download_rx));
        tokio::spawn(pipeline.clone().encode_stage(encode_rx));
        tokio::spawn(pipeline.clone().upload_stage(upload_rx));
        pipeline
    }

    /// Whether the consumer may pull another dispatch off the queue.
    pub fn has_capacity(&self) -> bool {
        self.download_queued.load(Ordering::SeqCst) < DOWNLOAD_QUEUE_SIZE
    }

    /// Accept a dispatched task: claim it with a `Job/progressing` event
    /// and queue its download.
    pub async fn submit(&self, task: TaskEncode) -> Result<(), WorkerError> {
        let work_dir = self.temp_root.join(task.id.to_string());
        tokio::fs::create_dir_all(&work_dir).await?;
        let mut work = WorkTaskEncode::new(task, work_dir);

        self.job_token(work.task.id);
        self.update_status(&mut work, NotificationKind::Job, Status::Progressing, "")
            .await;
        self.download_queued.fetch_add(1, Ordering::SeqCst);
        if self.download_tx.send(work).await.is_err() {
            self.download_queued.fetch_sub(1, Ordering::SeqCst);
            return Err(WorkerError::Other("pipeline stopped".into()));
        }
        Ok(())
    }

    /// Re-enter tasks found on disk at the stage their last event names.
    pub async fn resume(&self) {
        let statuses = match status::scan(&self.temp_root).await {
            Ok(statuses) => statuses,
            Err(err) => {
                error!(error = %err, "resume scan failed");
                return;
            }
        };
        for persisted in statuses {
            let work = persisted.task;
            let last = persisted.last_event;
            let job = work.task.id;
            self.job_token(job);

            if last.is_downloading() {
                info!(job = %job, "resuming task in download stage");
                self.download_queued.fetch_add(1, Ordering::SeqCst);
                let _ = self.download_tx.send(work).await;
            } else if last.is_encoding() {
                info!(job = %job, "resuming task in encode stage");
                self.encode_queued.fetch_add(1, Ordering::SeqCst);
                let _ = self.encode_tx.send(work).await;
            } else if last.is_uploading() {
                info!(job = %job, "resuming task in upload stage");
                let _ = self.upload_tx.send(work).await;
            } else {
                info!(job = %job, "removing finished task leftovers");
                self.active.remove(&job);
                if let Err(err) = status::clean_work_dir(&work.work_dir).await {
                    warn!(job = %job, error = %err, "leftover cleanup failed");
                }
            }
        }
    }

    /// One cancellation token per job, child of the worker root.
    fn job_token(&self, job: Uuid) -> CancellationToken {
        self.active
            .entry(job)
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// Emit the next event for a task and persist the status file.
    pub(crate) async fn update_status(
        &self,
        work: &mut WorkTaskEncode,
        kind: NotificationKind,
        state: Status,
        message: impl Into<String>,
    ) {
        work.task.event_id += 1;
        let mut event = TaskEvent::notification(
            work.task.id,
            work.task.event_id,
            kind,
            state,
            message,
        );
        event.worker_name = self.config.name.clone();
        self.manager.notify_event(event.clone()).await;
        status::save(work, &event).await;
    }

    /// Terminal failure handling: `Job/canceled` for cancellations,
    /// `Job/failed` otherwise, then workspace cleanup.
    async fn error_job(&self, mut work: WorkTaskEncode, err: &WorkerError) {
        if err.is_canceled() {
            self.update_status(&mut work, NotificationKind::Job, Status::Canceled, "")
                .await;
        } else {
            self.update_status(
                &mut work,
                NotificationKind::Job,
                Status::Failed,
                err.to_string(),
            )
            .await;
        }
        self.active.remove(&work.task.id);
        if let Err(err) = status::clean_work_dir(&work.work_dir).await {
            error!(job = %work.task.id, error = %err, "workspace cleanup failed");
        }
    }

    async fn download_stage(self: Arc<Self>, mut rx: mpsc::Receiver<WorkTaskEncode>) {
        loop {
            tokio::select! {
                _ = self.root.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            // Hold downloads while the encode stage still has a job
            // waiting; keeps at most one pre-downloaded task per worker.
            if self.encode_queued.load(Ordering::SeqCst) > 0 {
                continue;
            }
            let Ok(mut work) = rx.try_recv() else { continue };
            self.download_queued.fetch_sub(1, Ordering::SeqCst);

            let cancel = self.job_token(work.task.id);
            self.update_status(&mut work, NotificationKind::Download, Status::Progressing, "")
                .await;
            match download::run(&self, &mut work, &cancel).await {
                Ok(()) => {
                    self.update_status(
                        &mut work,
                        NotificationKind::Download,
                        Status::Completed,
                        "",
                    )
                    .await;
                    self.encode_queued.fetch_add(1, Ordering::SeqCst);
                    let _ = self.encode_tx.send(work).await;
                }
                Err(err) => {
                    self.update_status(
                        &mut work,
                        NotificationKind::Download,
                        Status::Failed,
                        err.to_string(),
                    )
                    .await;
                    self.error_job(work, &err).await;
                }
            }
        }
    }

    async fn encode_stage(self: Arc<Self>, mut rx: mpsc::Receiver<WorkTaskEncode>) {
        let slots = Arc::new(Semaphore::new(self.config.encode_jobs.max(1)));
        loop {
            let work = tokio::select! {
                _ = self.root.cancelled() => return,
                work = rx.recv() => match work {
                    Some(work) => work,
                    None => return,
                },
            };
            self.encode_queued.fetch_sub(1, Ordering::SeqCst);

            let permit = tokio::select! {
                _ = self.root.cancelled() => return,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let pipeline = self.clone();
            tokio::spawn(async move {
                let _slot = permit;
                pipeline.process_encode(work).await;
            });
        }
    }

    async fn process_encode(self: Arc<Self>, mut work: WorkTaskEncode) {
        let cancel = self.job_token(work.task.id);
        match encode::run(&self, &mut work, &cancel).await {
            Ok(()) => {
                let _ = self.upload_tx.send(work).await;
            }
            Err(err) => self.error_job(work, &err).await,
        }
    }

    async fn upload_stage(self: Arc<Self>, mut rx: mpsc::Receiver<WorkTaskEncode>) {
        loop {
            let mut work = tokio::select! {
                _ = self.root.cancelled() => return,
                work = rx.recv() => match work {
                    Some(work) => work,
                    None => return,
                },
            };
            let cancel = self.job_token(work.task.id);
            self.update_status(&mut work, NotificationKind::Upload, Status::Progressing, "")
                .await;
            match upload::run(&self, &mut work, &cancel).await {
                Ok(()) => {
                    self.update_status(&mut work, NotificationKind::Upload, Status::Completed, "")
                        .await;
                    self.update_status(&mut work, NotificationKind::Job, Status::Completed, "")
                        .await;
                    self.active.remove(&work.task.id);
                    if let Err(err) = status::clean_work_dir(&work.work_dir).await {
                        error!(job = %work.task.id, error = %err, "workspace cleanup failed");
                    }
                }
                Err(err) => {
                    self.update_status(
                        &mut work,
                        NotificationKind::Upload,
                        Status::Failed,
                        err.to_string(),
                    )
                    .await;
                    self.error_job(work, &err).await;
                }
            }
        }
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) async fn request_pgs(&self, task: TaskPgs) -> oneshot::Receiver<TaskPgsResponse> {
        self.manager.request_pgs(task).await
    }

    pub(crate) fn worker_config(&self) -> &WorkerConfig {
        &self.config
    }
}
