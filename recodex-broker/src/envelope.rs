//! Typed message envelopes over JSON bodies.

use std::time::Duration;

use chrono::Utc;
use lapin::{BasicProperties, Channel, options::BasicPublishOptions};
use serde::Serialize;

use crate::BrokerError;

/// AMQP `type` tag for targeted job control messages.
pub const KIND_JOB_EVENT: &str = "JobEvent";
/// AMQP `type` tag for PGS conversion responses.
pub const KIND_PGS_RESPONSE: &str = "PGSResponse";

const DEFAULT_PRIORITY: u8 = 5;

/// Properties attached to an outgoing message. Task payloads go untagged;
/// control-queue messages carry a `kind` so the consumer can demultiplex.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub kind: Option<&'static str>,
    pub priority: Option<u8>,
    pub expiration: Option<Duration>,
}

impl Envelope {
    pub fn tagged(kind: &'static str) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_priority(priority: u8) -> Self {
        Self {
            priority: Some(priority),
            ..Self::default()
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            expiration: Some(ttl),
            ..Self::default()
        }
    }
}

/// Serialize `payload` and publish it to `queue` on the default exchange,
/// waiting for the broker to take the message.
pub async fn publish_json<T: Serialize>(
    channel: &Channel,
    queue: &str,
    payload: &T,
    envelope: Envelope,
) -> Result<(), BrokerError> {
    let body = serde_json::to_vec(payload)?;

    let mut properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_priority(envelope.priority.unwrap_or(DEFAULT_PRIORITY))
        .with_timestamp(Utc::now().timestamp() as u64);
    if let Some(kind) = envelope.kind {
        properties = properties.with_kind(kind.into());
    }
    if let Some(expiration) = envelope.expiration {
        properties = properties.with_expiration(expiration.as_millis().to_string().into());
    }

    channel
        .basic_publish("", queue, BasicPublishOptions::default(), &body, properties)
        .await?
        .await?;
    Ok(())
}
