use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Envelope shared by every message on the transfer socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WSMessage<T> {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub timestamp: u64,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
}

impl<T> WSMessage<T> {
    pub fn new(msg_type: impl Into<String>, payload: Option<T>) -> Self {
        Self {
            msg_type: msg_type.into(),
            timestamp: now_millis(),
            request_id: None,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Success,
    Error,
}

/// One hex-encoded slice of an RGBA image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageChunkPayload {
    pub width: u32,
    pub height: u32,
    pub part: usize,
    pub total_parts: usize,
    pub status: TransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub data: String,
}

/// Inbound request to capture and generate with the given text parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequestPayload {
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
