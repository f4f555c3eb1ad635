//! Server side of the broker: task dispatch and the event-queue consumer.

use std::sync::Arc;

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use recodex_broker::{
    Broker, BrokerError, Envelope, KIND_JOB_EVENT, declare_control_queue, declare_event_queue,
    declare_task_queue, publish_json, unique_name,
};
use recodex_config::BrokerConfig;
use recodex_model::{JobControlEvent, TaskEncode, TaskEvent};

use crate::scheduler::Scheduler;
use crate::store::{self, Store};

/// Publishing half of the server's broker contract.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    broker: Arc<Broker>,
    config: BrokerConfig,
}

impl EventPublisher {
    pub fn new(broker: Arc<Broker>, config: BrokerConfig) -> Self {
        Self { broker, config }
    }

    /// Enqueue an encode task at its computed priority.
    pub async fn publish_job_request(&self, task: &TaskEncode) -> Result<(), BrokerError> {
        let channel = self.broker.channel().await?;
        declare_task_queue(&channel, &self.config.task_encode_queue).await?;
        publish_json(
            &channel,
            &self.config.task_encode_queue,
            task,
            Envelope::with_priority(task.priority),
        )
        .await?;
        info!(job = %task.id, priority = task.priority, "published encode task");
        Ok(())
    }

    /// Fire-and-forget control message targeted at one worker.
    pub async fn publish_job_event(&self, event: &JobControlEvent, worker_queue: &str) {
        let result = async {
            let channel = self.broker.channel().await?;
            declare_control_queue(&channel, worker_queue).await?;
            publish_json(&channel, worker_queue, event, Envelope::tagged(KIND_JOB_EVENT)).await
        }
        .await;
        match result {
            Ok(()) => info!(job = %event.id, queue = worker_queue, action = ?event.action, "sent job control event"),
            Err(err) => error!(job = %event.id, queue = worker_queue, error = %err, "failed to send job control event"),
        }
    }
}

/// The single event-queue consumer.
///
/// Each delivery is recorded in its own transaction; only a committed
/// transaction is acked, so the broker redelivers anything the server did
/// not durably record. Failures (including event-id gaps from stale
/// workers) are nacked without requeue and dropped.
pub async fn run_event_processor(
    broker: Arc<Broker>,
    config: BrokerConfig,
    store: Store,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
) -> Result<(), BrokerError> {
    loop {
        let channel = broker.channel().await?;
        declare_event_queue(&channel, &config.event_queue).await?;
        let mut consumer = channel
            .basic_consume(
                &config.event_queue,
                &unique_name("server"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(queue = %config.event_queue, "consuming worker events");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("event processor stopping");
                    return Ok(());
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            handle_delivery(&store, &scheduler, delivery).await;
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "event consumer error, reopening");
                            break;
                        }
                        None => {
                            warn!("event consumer closed, reopening");
                            break;
                        }
                    }
                }
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

async fn handle_delivery(store: &Store, scheduler: &Scheduler, delivery: Delivery) {
    let event: TaskEvent = match serde_json::from_slice(&delivery.data) {
        Ok(event) => event,
        Err(err) => {
            error!(error = %err, "undecodable event, dropping");
            nack(&delivery).await;
            return;
        }
    };

    let recorded: Result<(), store::StoreError> = {
        let event = event.clone();
        store
            .with_transaction(move |conn: &mut sqlx::PgConnection| {
                Box::pin(async move { store::process_event(conn, &event).await })
            })
            .await
    };

    match recorded {
        Ok(()) => {
            scheduler.after_event(&event).await;
            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                warn!(error = %err, "event ack failed");
            }
        }
        Err(err) => {
            error!(job = ?event.id, event_id = event.event_id, error = %err, "event rejected, dropping");
            nack(&delivery).await;
        }
    }
}

async fn nack(delivery: &Delivery) {
    let result = delivery
        .nack(BasicNackOptions {
            requeue: false,
            ..BasicNackOptions::default()
        })
        .await;
    if let Err(err) = result {
        warn!(error = %err, "event nack failed");
    }
}
