use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event name of the post-handshake confirmation frame.
pub const EVENT_CONNECTED: &str = "connected";
/// Older servers confirm the handshake under this name.
pub const EVENT_OPENED: &str = "opened";
pub const EVENT_NOTIFICATION: &str = "notification";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Classification of a named server-push frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventName {
    Connected,
    Notification,
    Heartbeat,
    Other(String),
}

impl StreamEventName {
    pub fn parse(name: &str) -> Self {
        match name {
            EVENT_CONNECTED | EVENT_OPENED => Self::Connected,
            EVENT_NOTIFICATION => Self::Notification,
            EVENT_HEARTBEAT => Self::Heartbeat,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationCategory {
    ApplicationStatus,
    ProgramUpdate,
    DocumentRequest,
    Payment,
    System,
    /// Category this client does not know yet; the raw value is kept.
    Other(String),
}

impl NotificationCategory {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ApplicationStatus => "application_status",
            Self::ProgramUpdate => "program_update",
            Self::DocumentRequest => "document_request",
            Self::Payment => "payment",
            Self::System => "system",
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for NotificationCategory {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "application_status" => Self::ApplicationStatus,
            "program_update" => Self::ProgramUpdate,
            "document_request" => Self::DocumentRequest,
            "payment" => Self::Payment,
            "system" => Self::System,
            _ => Self::Other(raw),
        }
    }
}

impl From<NotificationCategory> for String {
    fn from(category: NotificationCategory) -> Self {
        category.as_str().to_string()
    }
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification pushed by the portal.
///
/// Required fields are never defaulted: a payload missing any of them is
/// rejected by [`decode_notification`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub id: String,
    pub category: NotificationCategory,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, alias = "link", skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed notification payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid notification field `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Decodes and validates a `notification` frame payload.
pub fn decode_notification(payload: &str) -> Result<NotificationEvent, DecodeError> {
    let event: NotificationEvent = serde_json::from_str(payload)?;
    validate_notification(&event)?;
    Ok(event)
}

pub(crate) fn validate_notification(event: &NotificationEvent) -> Result<(), DecodeError> {
    if event.id.trim().is_empty() {
        return Err(DecodeError::Invalid {
            field: "id",
            reason: "must not be empty",
        });
    }
    if event.category.as_str().is_empty() {
        return Err(DecodeError::Invalid {
            field: "category",
            reason: "must not be empty",
        });
    }
    Ok(())
}
