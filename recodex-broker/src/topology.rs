//! Queue declarations for the four logical queues.

use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Queue, options::QueueDeclareOptions};
use rand::Rng;

use crate::BrokerError;

/// Priority ceiling configured on the task queues.
pub const MAX_QUEUE_PRIORITY: u8 = 10;

/// Durable task queue with priority delivery (encode and PGS queues).
pub async fn declare_task_queue(channel: &Channel, name: &str) -> Result<Queue, BrokerError> {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-max-priority".into(),
        AMQPValue::LongInt(i32::from(MAX_QUEUE_PRIORITY)),
    );
    let queue = channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            arguments,
        )
        .await?;
    Ok(queue)
}

/// Durable event queue feeding the server's single consumer.
pub async fn declare_event_queue(channel: &Channel, name: &str) -> Result<Queue, BrokerError> {
    let queue = channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(queue)
}

/// Per-worker control queue, deleted by the broker once its consumer goes
/// away.
pub async fn declare_control_queue(channel: &Channel, name: &str) -> Result<Queue, BrokerError> {
    let queue = channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(queue)
}

/// A process-unique name: `{prefix}-{random}`. Used for consumer tags and
/// the control-queue stem.
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, rand::rng().random_range(0..5_000_000u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_carry_the_prefix() {
        let name = unique_name("server");
        assert!(name.starts_with("server-"));
        assert_ne!(unique_name("server"), unique_name("worker"));
    }
}
