//! Encode stage: probe, subtitle conversion, the encoder run, and result
//! validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use recodex_media::{
    ContainerData, EncoderSettings, ExternalCommand, ProgressParser, SubtitleStream, probe_file,
};
use recodex_model::{NotificationKind, Status, TaskPgs, WorkTaskEncode};

use super::Pipeline;
use crate::errors::WorkerError;

/// Gathering converted subtitles is bounded; OCR of a full feature's
/// tracks is slow but not endless.
const PGS_DEADLINE: Duration = Duration::from_secs(90 * 60);

/// Tolerated drift between source and encoded duration, in seconds.
const MAX_DURATION_DRIFT: f64 = 60.0;

/// Progress events fire at most once per whole percent.
const PROGRESS_STEP: f64 = 1.0;

pub(super) async fn run(
    pipeline: &Pipeline,
    work: &mut WorkTaskEncode,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let source = work
        .source_file_path
        .clone()
        .ok_or_else(|| WorkerError::Other("task has no downloaded source".into()))?;

    pipeline
        .update_status(work, NotificationKind::FFProbe, Status::Progressing, "")
        .await;
    let probed = match probe_file(&source, cancel).await {
        Ok(probed) => probed,
        Err(err) => {
            pipeline
                .update_status(work, NotificationKind::FFProbe, Status::Failed, err.to_string())
                .await;
            return Err(err.into());
        }
    };
    let source_size = tokio::fs::metadata(&source).await?.len();
    pipeline
        .update_status(work, NotificationKind::FFProbe, Status::Completed, "")
        .await;

    let container = ContainerData::summarize(&probed)?;
    convert_image_subtitles(pipeline, work, &container, cancel).await?;

    pipeline
        .update_status(work, NotificationKind::FFMPEG, Status::Progressing, "")
        .await;
    let target = work.work_dir.join(format!("{}-encoded.mkv", work.task.id));
    if let Err(err) = encode_video(pipeline, work, &container, &source, &target, cancel).await {
        pipeline
            .update_status(work, NotificationKind::FFMPEG, Status::Failed, err.to_string())
            .await;
        return Err(err);
    }

    if let Err(err) = validate_encode(&container, source_size, &target, cancel).await {
        pipeline
            .update_status(work, NotificationKind::FFMPEG, Status::Failed, err.to_string())
            .await;
        return Err(err);
    }

    pipeline
        .update_status(work, NotificationKind::FFMPEG, Status::Completed, "")
        .await;
    work.target_file_path = Some(target);
    Ok(())
}

/// Extract image-based subtitle tracks and fan them out to the PGS worker
/// pool, writing the returned SRT files beside the source.
async fn convert_image_subtitles(
    pipeline: &Pipeline,
    work: &mut WorkTaskEncode,
    container: &ContainerData,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let tracks: Vec<SubtitleStream> = container.image_subtitles().cloned().collect();
    if tracks.is_empty() {
        return Ok(());
    }

    pipeline
        .update_status(work, NotificationKind::MKVExtract, Status::Progressing, "")
        .await;
    if let Err(err) = extract_tracks(work, &tracks, cancel).await {
        pipeline
            .update_status(work, NotificationKind::MKVExtract, Status::Failed, err.to_string())
            .await;
        return Err(err);
    }
    pipeline
        .update_status(work, NotificationKind::MKVExtract, Status::Completed, "")
        .await;

    pipeline
        .update_status(work, NotificationKind::PGS, Status::Progressing, "")
        .await;
    if let Err(err) = gather_conversions(pipeline, work, &tracks, cancel).await {
        pipeline
            .update_status(work, NotificationKind::PGS, Status::Failed, err.to_string())
            .await;
        return Err(err);
    }
    pipeline
        .update_status(work, NotificationKind::PGS, Status::Completed, "")
        .await;
    Ok(())
}

async fn extract_tracks(
    work: &WorkTaskEncode,
    tracks: &[SubtitleStream],
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let source = work
        .source_file_path
        .as_ref()
        .ok_or_else(|| WorkerError::Other("task has no downloaded source".into()))?;
    let mut command = ExternalCommand::new("mkvextract")
        .arg("tracks")
        .arg(source.display().to_string())
        .work_dir(&work.work_dir)
        .allow_exit_codes([0, 1]);
    for track in tracks {
        command = command.arg(format!("{}:{}.sup", track.index, track.index));
    }
    command.run(cancel).await?;
    Ok(())
}

/// N pending conversions feed one merged set; the consumer waits on
/// (responses, cancellation, deadline).
async fn gather_conversions(
    pipeline: &Pipeline,
    work: &WorkTaskEncode,
    tracks: &[SubtitleStream],
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let mut pending = FuturesUnordered::new();
    for track in tracks {
        let sup_path = work.work_dir.join(format!("{}.sup", track.index));
        let payload = tokio::fs::read(&sup_path).await?;
        debug!(job = %work.task.id, stream = track.index, bytes = payload.len(), "requesting PGS conversion");
        let receiver = pipeline
            .request_pgs(TaskPgs {
                id: work.task.id,
                pgs_id: track.index,
                pgs_data: payload,
                language: track.language.clone(),
                reply_to: String::new(),
            })
            .await;
        pending.push(receiver);
    }

    let deadline = tokio::time::sleep(PGS_DEADLINE);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(WorkerError::Canceled),
            _ = &mut deadline => return Err(WorkerError::PgsTimeout),
            next = pending.next() => {
                let Some(next) = next else { return Ok(()) };
                let response = next
                    .map_err(|_| WorkerError::Other("PGS response channel dropped".into()))?;
                if response.is_error() {
                    return Err(WorkerError::PgsFailed {
                        stream: response.pgs_id,
                        message: response.error,
                    });
                }
                let srt_path = work.work_dir.join(format!("{}.srt", response.pgs_id));
                tokio::fs::write(&srt_path, &response.srt).await?;
                debug!(job = %work.task.id, stream = response.pgs_id, "SRT stored");
            }
        }
    }
}

async fn encode_video(
    pipeline: &Pipeline,
    work: &mut WorkTaskEncode,
    container: &ContainerData,
    source: &Path,
    target: &PathBuf,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let settings = EncoderSettings {
        threads: pipeline.worker_config().threads,
    };
    let args = settings.build_args(container, source, &work.work_dir, target);

    let mut parser = ProgressParser::new(container.video.duration_seconds);
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let command = ExternalCommand::new("ffmpeg")
        .args(args)
        .work_dir(&work.work_dir);
    let command_cancel = cancel.clone();
    let encode = async move {
        command
            .run_with_stderr(&command_cancel, move |chunk| {
                if let Some(progress) = parser.feed(chunk) {
                    let _ = progress_tx.send(progress);
                }
            })
            .await
    };
    tokio::pin!(encode);

    let mut last_reported = 0.0_f64;
    loop {
        tokio::select! {
            result = &mut encode => {
                result?;
                return Ok(());
            }
            Some(progress) = progress_rx.recv() => {
                if progress.percent - last_reported >= PROGRESS_STEP {
                    last_reported = progress.percent;
                    pipeline
                        .update_status(
                            work,
                            NotificationKind::FFMPEG,
                            Status::Progressing,
                            format!("{{\"progress\":\"{:.2}\"}}", progress.percent.min(100.0)),
                        )
                        .await;
                }
            }
        }
    }
}

/// The encode must round-trip the duration and actually shrink the file.
async fn validate_encode(
    container: &ContainerData,
    source_size: u64,
    target: &PathBuf,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let encoded = probe_file(target, cancel).await?;
    let encoded_size = tokio::fs::metadata(target).await?.len();

    let source_duration = container.video.duration_seconds;
    let encoded_duration = encoded.format.duration_seconds();
    if (encoded_duration - source_duration).abs() > MAX_DURATION_DRIFT {
        return Err(WorkerError::EncodeValidation(format!(
            "source duration {source_duration:.2}s differs from encoded {encoded_duration:.2}s"
        )));
    }
    if encoded_size >= source_size {
        return Err(WorkerError::EncodeValidation(format!(
            "encoded size {encoded_size} bytes is not smaller than source {source_size} bytes"
        )));
    }
    Ok(())
}
