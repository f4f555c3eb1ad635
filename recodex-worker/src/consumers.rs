//! Task-queue consumption: polling `basic_get` loops gated by acceptance
//! windows, pipeline capacity, and the priority cap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use lapin::options::{BasicAckOptions, BasicGetOptions, BasicNackOptions};
use lapin::message::BasicGetMessage;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use recodex_broker::{Broker, declare_task_queue};
use recodex_config::{BrokerConfig, WorkerConfig};
use recodex_model::{TaskEncode, TaskPgs};

use crate::client::{ActiveJobs, priority_accepted};
use crate::errors::WorkerError;
use crate::pgs::PgsConverter;
use crate::pipeline::Pipeline;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_secs(5);

fn accepts_now(config: &WorkerConfig) -> bool {
    !config.paused && config.within_window(Local::now().time())
}

async fn idle(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Poll the encode queue and hand accepted dispatches to the pipeline.
pub async fn run_encode_consumer(
    broker: Arc<Broker>,
    config: BrokerConfig,
    worker: WorkerConfig,
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        if let Err(err) = consume_encode(&broker, &config, &worker, &pipeline, &shutdown).await {
            error!(error = %err, "encode consumer failed, reopening");
            if !idle(&shutdown, Duration::from_secs(1)).await {
                return;
            }
        }
    }
}

async fn consume_encode(
    broker: &Broker,
    config: &BrokerConfig,
    worker: &WorkerConfig,
    pipeline: &Pipeline,
    shutdown: &CancellationToken,
) -> Result<(), WorkerError> {
    let channel = broker.channel().await?;
    declare_task_queue(&channel, &config.task_encode_queue).await?;
    info!(queue = %config.task_encode_queue, "consuming encode tasks");

    loop {
        if !idle(shutdown, POLL_INTERVAL).await {
            return Ok(());
        }
        if !accepts_now(worker) || !pipeline.has_capacity() {
            continue;
        }

        let message = channel
            .basic_get(&config.task_encode_queue, BasicGetOptions::default())
            .await
            .map_err(recodex_broker::BrokerError::from)?;
        let Some(message) = message else {
            if !idle(shutdown, EMPTY_QUEUE_BACKOFF).await {
                return Ok(());
            }
            continue;
        };

        if let Some(message) = filter_priority(message, worker.priority).await {
            let task: TaskEncode = match serde_json::from_slice(&message.delivery.data) {
                Ok(task) => task,
                Err(err) => {
                    error!(error = %err, "undecodable encode task, dropping");
                    nack(&message, false).await;
                    continue;
                }
            };
            info!(job = %task.id, priority = delivery_priority(&message), "encode task assigned");
            match pipeline.submit(task).await {
                Ok(()) => ack(&message).await,
                Err(err) => {
                    error!(error = %err, "task intake failed, requeueing");
                    nack(&message, true).await;
                }
            }
        }
    }
}

/// Poll the PGS queue and convert tracks on a bounded pool.
pub async fn run_pgs_consumer(
    broker: Arc<Broker>,
    config: BrokerConfig,
    worker: WorkerConfig,
    converter: Arc<PgsConverter>,
    active: ActiveJobs,
    shutdown: CancellationToken,
) {
    let slots = Arc::new(Semaphore::new(worker.pgs_jobs.max(1)));
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let result = consume_pgs(&broker, &config, &worker, &converter, &active, &slots, &shutdown).await;
        if let Err(err) = result {
            error!(error = %err, "PGS consumer failed, reopening");
            if !idle(&shutdown, Duration::from_secs(1)).await {
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn consume_pgs(
    broker: &Broker,
    config: &BrokerConfig,
    worker: &WorkerConfig,
    converter: &Arc<PgsConverter>,
    active: &ActiveJobs,
    slots: &Arc<Semaphore>,
    shutdown: &CancellationToken,
) -> Result<(), WorkerError> {
    let channel = broker.channel().await?;
    declare_task_queue(&channel, &config.task_pgs_queue).await?;
    info!(queue = %config.task_pgs_queue, "consuming PGS tasks");

    loop {
        if !idle(shutdown, POLL_INTERVAL).await {
            return Ok(());
        }
        if !accepts_now(worker) {
            continue;
        }
        let Ok(permit) = slots.clone().try_acquire_owned() else {
            continue;
        };

        let message = channel
            .basic_get(&config.task_pgs_queue, BasicGetOptions::default())
            .await
            .map_err(recodex_broker::BrokerError::from)?;
        let Some(message) = message else {
            drop(permit);
            if !idle(shutdown, EMPTY_QUEUE_BACKOFF).await {
                return Ok(());
            }
            continue;
        };

        let Some(message) = filter_priority(message, worker.priority).await else {
            drop(permit);
            continue;
        };
        let task: TaskPgs = match serde_json::from_slice(&message.delivery.data) {
            Ok(task) => task,
            Err(err) => {
                error!(error = %err, "undecodable PGS task, dropping");
                nack(&message, false).await;
                continue;
            }
        };

        // Reuse the job's token when the encode half of this worker
        // already owns it; otherwise register one for targeted cancels.
        let newly_registered = !active.contains_key(&task.id);
        let cancel = active
            .entry(task.id)
            .or_insert_with(|| shutdown.child_token())
            .clone();
        ack(&message).await;

        let converter = converter.clone();
        let active = active.clone();
        let job_id = task.id;
        tokio::spawn(async move {
            let _slot = permit;
            converter.execute(task, cancel).await;
            if newly_registered {
                active.remove(&job_id);
            }
        });
    }
}

fn delivery_priority(message: &BasicGetMessage) -> u8 {
    (*message.delivery.properties.priority()).unwrap_or(0)
}

/// Enforce the priority cap; rejected dispatches go back to the queue for
/// a worker that accepts them.
async fn filter_priority(message: BasicGetMessage, cap: u8) -> Option<BasicGetMessage> {
    let priority = delivery_priority(&message);
    if priority_accepted(priority, cap) {
        return Some(message);
    }
    warn!(priority, cap, "task above priority cap, requeueing");
    nack(&message, true).await;
    None
}

async fn ack(message: &BasicGetMessage) {
    if let Err(err) = message.delivery.ack(BasicAckOptions::default()).await {
        warn!(error = %err, "task ack failed");
    }
}

async fn nack(message: &BasicGetMessage, requeue: bool) {
    let result = message
        .delivery
        .nack(BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        })
        .await;
    if let Err(err) = result {
        warn!(error = %err, "task nack failed");
    }
}
