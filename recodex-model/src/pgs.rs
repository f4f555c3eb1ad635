//! PGS subtitle sub-job request/response payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serde_bytes;

/// Request to convert one image-based subtitle track to text.
///
/// `reply_to` names the requesting worker's control queue so the response
/// finds its way back to the in-process pending request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPgs {
    pub id: Uuid,
    #[serde(rename = "pgsid")]
    pub pgs_id: i32,
    #[serde(rename = "pgsdata", with = "serde_bytes")]
    pub pgs_data: Vec<u8>,
    #[serde(rename = "pgslanguage")]
    pub language: String,
    #[serde(rename = "replyto", default)]
    pub reply_to: String,
}

/// Outcome of a PGS conversion. Toolchain failures travel in `error`
/// instead of poisoning the queue, so the requester sees an orderly
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPgsResponse {
    pub id: Uuid,
    #[serde(rename = "pgsid")]
    pub pgs_id: i32,
    #[serde(with = "serde_bytes", default)]
    pub srt: Vec<u8>,
    #[serde(rename = "error", default)]
    pub error: String,
    #[serde(default)]
    pub queue: String,
}

impl TaskPgsResponse {
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pgs_bytes_travel_as_base64() {
        let request = TaskPgs {
            id: Uuid::new_v4(),
            pgs_id: 3,
            pgs_data: vec![0x50, 0x47, 0x00, 0xff],
            language: "eng".into(),
            reply_to: "worker-1-99-control".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["pgsdata"], "UEcA/w==");

        let back: TaskPgs = serde_json::from_value(json).unwrap();
        assert_eq!(back.pgs_data, request.pgs_data);
    }

    #[test]
    fn empty_error_means_success() {
        let response: TaskPgsResponse = serde_json::from_str(
            r#"{"id":"2a4c6b9e-3f00-4b5a-9a63-97e1b2a6a001","pgsid":1,"srt":"","queue":"q"}"#,
        )
        .unwrap();
        assert!(!response.is_error());
    }
}
