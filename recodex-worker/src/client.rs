//! Worker side of the broker: event publishing, control-queue
//! demultiplexing, PGS request/response correlation, and the liveness ping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use recodex_broker::{
    Broker, Envelope, KIND_JOB_EVENT, KIND_PGS_RESPONSE, declare_control_queue,
    declare_task_queue, publish_json, unique_name,
};
use recodex_config::{BrokerConfig, WorkerConfig};
use recodex_model::{JobAction, JobControlEvent, TaskEvent, TaskPgs, TaskPgsResponse};

use crate::errors::WorkerError;
use crate::retry::retry_forever;

const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(1);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// What running tasks need from the broker side, injected at construction
/// so task code never holds the client directly.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Deliver an event to the server. Must not fail silently: retries
    /// until the broker takes it or the worker shuts down.
    async fn notify_event(&self, event: TaskEvent);

    /// Publish a PGS conversion request and return the channel its
    /// response will arrive on.
    async fn request_pgs(&self, task: TaskPgs) -> oneshot::Receiver<TaskPgsResponse>;

    /// Publish a PGS conversion response to the requester's control queue.
    async fn respond_pgs(&self, response: TaskPgsResponse);
}

/// Cancellation tokens of tasks currently owned by this worker, keyed by
/// job id. Shared between the consumers that create them and the control
/// queue that fires them.
pub type ActiveJobs = Arc<DashMap<Uuid, CancellationToken>>;

pub struct WorkerClient {
    broker: Arc<Broker>,
    config: BrokerConfig,
    worker: WorkerConfig,
    control_queue: String,
    pending_pgs: DashMap<(Uuid, i32), oneshot::Sender<TaskPgsResponse>>,
    active: ActiveJobs,
    ip: String,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("control_queue", &self.control_queue)
            .finish_non_exhaustive()
    }
}

impl WorkerClient {
    pub fn new(
        broker: Arc<Broker>,
        config: BrokerConfig,
        worker: WorkerConfig,
        active: ActiveJobs,
        ip: String,
        shutdown: CancellationToken,
    ) -> Self {
        let control_queue = format!("{}-control", unique_name(&worker.name));
        Self {
            broker,
            config,
            worker,
            control_queue,
            pending_pgs: DashMap::new(),
            active,
            ip,
            shutdown,
        }
    }

    async fn publish_with_retry<T: serde::Serialize + Sync>(
        &self,
        queue: &str,
        payload: &T,
        envelope: Envelope,
    ) {
        let result = retry_forever(
            "publish",
            PUBLISH_RETRY_DELAY,
            &self.shutdown,
            move || {
                let envelope = envelope.clone();
                async move {
                    let channel = self.broker.channel().await?;
                    publish_json(&channel, queue, payload, envelope).await?;
                    Ok(())
                }
            },
        )
        .await;
        if let Err(err) = result {
            warn!(queue, error = %err, "publish abandoned");
        }
    }

    /// The 30-second liveness ping, expiring in the queue as fast as it is
    /// produced.
    pub async fn run_ping_loop(&self) {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let ping = TaskEvent::ping(
                        self.worker.name.clone(),
                        self.control_queue.clone(),
                        self.ip.clone(),
                    );
                    self.publish_with_retry(
                        &self.config.event_queue,
                        &ping,
                        Envelope::with_ttl(PING_INTERVAL),
                    )
                    .await;
                }
            }
        }
    }

    /// Consume the control queue: cancellations for owned jobs and PGS
    /// responses routed to their pending request.
    pub async fn run_control_consumer(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            if let Err(err) = self.consume_control().await {
                error!(error = %err, "control consumer failed, reopening");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    async fn consume_control(&self) -> Result<(), WorkerError> {
        let channel = self.broker.channel().await?;
        declare_control_queue(&channel, &self.control_queue).await?;
        let mut consumer = channel
            .basic_consume(
                &self.control_queue,
                &format!("{}-consumer", self.control_queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(recodex_broker::BrokerError::from)?;
        info!(queue = %self.control_queue, "control queue ready");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else {
                        return Err(WorkerError::Other("control consumer closed".into()));
                    };
                    let delivery = delivery.map_err(recodex_broker::BrokerError::from)?;
                    let kind = delivery
                        .properties
                        .kind()
                        .as_ref()
                        .map(|kind| kind.as_str().to_string())
                        .unwrap_or_default();
                    match kind.as_str() {
                        KIND_JOB_EVENT => self.handle_job_event(&delivery.data),
                        KIND_PGS_RESPONSE => self.handle_pgs_response(&delivery.data),
                        other => warn!(kind = other, "unexpected control message"),
                    }
                    if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                        warn!(error = %err, "control ack failed");
                    }
                }
            }
        }
    }

    fn handle_job_event(&self, data: &[u8]) {
        let event: JobControlEvent = match serde_json::from_slice(data) {
            Ok(event) => event,
            Err(err) => {
                error!(error = %err, "undecodable job control event");
                return;
            }
        };
        match event.action {
            JobAction::Cancel => {
                if let Some(entry) = self.active.get(&event.id) {
                    warn!(job = %event.id, "cancel requested, stopping job");
                    entry.value().cancel();
                } else {
                    warn!(job = %event.id, "cancel requested for unknown job");
                }
            }
        }
    }

    fn handle_pgs_response(&self, data: &[u8]) {
        let response: TaskPgsResponse = match serde_json::from_slice(data) {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "undecodable PGS response");
                return;
            }
        };
        let key = (response.id, response.pgs_id);
        match self.pending_pgs.remove(&key) {
            Some((_, sender)) => {
                debug!(job = %response.id, stream = response.pgs_id, "PGS response routed");
                let _ = sender.send(response);
            }
            None => warn!(job = %response.id, stream = response.pgs_id, "PGS response with no pending request"),
        }
    }
}

#[async_trait]
impl Manager for WorkerClient {
    async fn notify_event(&self, event: TaskEvent) {
        if let (Some(kind), Some(status)) = (event.notification_type, event.status) {
            info!(job = ?event.id, phase = %kind, status = %status, "job event");
        }
        self.publish_with_retry(&self.config.event_queue, &event, Envelope::default())
            .await;
    }

    async fn request_pgs(&self, mut task: TaskPgs) -> oneshot::Receiver<TaskPgsResponse> {
        task.reply_to = self.control_queue.clone();
        let (tx, rx) = oneshot::channel();
        self.pending_pgs.insert((task.id, task.pgs_id), tx);

        // Declare the PGS queue on first use so a request never lands in
        // the void when this worker starts before any PGS worker.
        let declare_and_publish = async {
            let channel = self.broker.channel().await?;
            declare_task_queue(&channel, &self.config.task_pgs_queue).await?;
            publish_json(&channel, &self.config.task_pgs_queue, &task, Envelope::default()).await
        };
        if let Err(err) = declare_and_publish.await {
            error!(job = %task.id, stream = task.pgs_id, error = %err, "PGS request publish failed");
            if let Some((_, sender)) = self.pending_pgs.remove(&(task.id, task.pgs_id)) {
                let _ = sender.send(TaskPgsResponse {
                    id: task.id,
                    pgs_id: task.pgs_id,
                    srt: Vec::new(),
                    error: format!("publish failed: {err}"),
                    queue: String::new(),
                });
            }
        }
        rx
    }

    async fn respond_pgs(&self, response: TaskPgsResponse) {
        let queue = response.queue.clone();
        self.publish_with_retry(&queue, &response, Envelope::tagged(KIND_PGS_RESPONSE))
            .await;
    }
}

/// Best-effort public address used in ping events.
pub async fn public_ip() -> String {
    const ECHO_SERVICES: &[&str] = &[
        "https://api.ipify.org?format=text",
        "https://ifconfig.me",
        "https://ident.me/",
    ];
    for service in ECHO_SERVICES {
        let response = reqwest::Client::new()
            .get(*service)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        if let Ok(response) = response {
            if let Ok(text) = response.text().await {
                let trimmed = text.trim().to_string();
                if !trimmed.is_empty() {
                    return trimmed;
                }
            }
        }
    }
    String::new()
}

/// Whether a dispatched task's priority is acceptable: at or below the
/// configured cap, with requeued (priority 9) tasks always let through so
/// a capped fleet cannot strand timed-out jobs.
pub fn priority_accepted(delivery_priority: u8, cap: u8) -> bool {
    const REQUEUE_PRIORITY: u8 = 9;
    delivery_priority <= cap || delivery_priority == REQUEUE_PRIORITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeued_tasks_preempt_the_cap() {
        assert!(priority_accepted(2, 3));
        assert!(priority_accepted(3, 3));
        assert!(!priority_accepted(4, 3));
        assert!(priority_accepted(9, 3));
    }
}
