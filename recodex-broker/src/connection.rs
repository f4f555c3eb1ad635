//! Connection lifecycle with fixed-backoff reconnect.

use std::time::Duration;

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use recodex_config::BrokerConfig;

use crate::BrokerError;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_ATTEMPTS: usize = 10;

/// A broker connection handle. Channels are cheap and opened per consumer
/// or per publish burst; when the underlying connection dies, the next
/// `channel()` call re-dials with bounded fixed-backoff retries. In-flight
/// unacked deliveries are redelivered by the broker after reconnect.
pub struct Broker {
    uri: String,
    connection: RwLock<Connection>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

impl Broker {
    /// Dial the broker, retrying with a fixed delay while it comes up.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let uri = config.amqp_uri();
        let connection = dial(&uri).await?;
        info!(host = %config.host, port = config.port, "connected to broker");
        Ok(Self {
            uri,
            connection: RwLock::new(connection),
        })
    }

    /// Open a channel, reconnecting the underlying connection if needed.
    pub async fn channel(&self) -> Result<Channel, BrokerError> {
        {
            let connection = self.connection.read().await;
            if connection.status().connected() {
                match connection.create_channel().await {
                    Ok(channel) => return Ok(channel),
                    Err(err) => warn!(error = %err, "channel open failed, reconnecting"),
                }
            }
        }

        let mut connection = self.connection.write().await;
        if !connection.status().connected() {
            *connection = dial(&self.uri).await?;
            info!("reconnected to broker");
        }
        Ok(connection.create_channel().await?)
    }
}

async fn dial(uri: &str) -> Result<Connection, BrokerError> {
    for attempt in 1..=RECONNECT_ATTEMPTS {
        match Connection::connect(uri, ConnectionProperties::default()).await {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                error!(attempt, error = %err, "broker connection failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    Err(BrokerError::Unreachable(RECONNECT_ATTEMPTS))
}
