//! Reload channel messages.
//!
//! Every frame is a UTF-8 JSON text frame shaped `{"event": ..., "data": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum inbound frame size (1MB); reload traffic is tiny.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Outbound event name asking the server to hot-reload a file.
pub const REQUEST_RELOAD: &str = "requestReload";
/// Inbound outcome of a reload request.
pub const RELOAD_RESULT: &str = "reloadResult";
/// Inbound failure report.
pub const RELOAD_ERROR: &str = "reloadError";

/// Envelope shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of `requestReload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadRequest {
    pub file_name: String,
    pub project_id: String,
}

impl ReloadRequest {
    /// Serialize as a complete `requestReload` frame.
    pub fn to_text(&self) -> String {
        let envelope = serde_json::json!({
            "event": REQUEST_RELOAD,
            "data": self,
        });
        envelope.to_string()
    }
}

/// A message the server sent on a reload channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadNotice {
    /// `reloadResult`
    Result {
        success: bool,
        message: Option<String>,
    },
    /// `reloadError`
    Error { message: String },
}

impl ReloadNotice {
    /// Parse an inbound frame. Returns None for anything unrecognised.
    pub fn from_text(text: &str) -> Option<Self> {
        let envelope: Envelope = serde_json::from_str(text).ok()?;
        let message = envelope
            .data
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);

        match envelope.event.as_str() {
            RELOAD_RESULT => Some(Self::Result {
                success: envelope
                    .data
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                message,
            }),
            RELOAD_ERROR => Some(Self::Error {
                message: message.unwrap_or_else(|| "Unknown reload error".to_string()),
            }),
            _ => None,
        }
    }

    /// Error text to surface, if this notice reports a failure.
    pub fn failure(&self) -> Option<String> {
        match self {
            Self::Result { success: true, .. } => None,
            Self::Result {
                success: false,
                message,
            } => Some(
                message
                    .clone()
                    .unwrap_or_else(|| "Reload failed".to_string()),
            ),
            Self::Error { message } => Some(message.clone()),
        }
    }
}
