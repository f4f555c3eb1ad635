//! Worker liveness record, upserted on every ping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub ip: String,
    pub queue_name: String,
    pub last_seen: DateTime<Utc>,
}
