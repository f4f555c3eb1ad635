//! AMQP plumbing shared by the Recodex server and workers.
//!
//! The topology is four logical queues: the priority-enabled encode and PGS
//! task queues, the event queue feeding the server, and one ephemeral
//! control queue per worker process. Bodies are JSON; the AMQP `type`
//! property distinguishes `JobEvent` and `PGSResponse` messages from
//! untagged task payloads.

pub mod connection;
pub mod envelope;
pub mod topology;

pub use connection::Broker;
pub use envelope::{Envelope, KIND_JOB_EVENT, KIND_PGS_RESPONSE, publish_json};
pub use topology::{
    MAX_QUEUE_PRIORITY, declare_control_queue, declare_event_queue, declare_task_queue,
    unique_name,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("broker unreachable after {0} attempts")]
    Unreachable(usize),
}
