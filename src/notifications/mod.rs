//! Real-time notification delivery.
//!
//! [`NotificationHub`] keeps one live channel per connected user and pushes
//! [`Notification`] values to them. Delivery is best effort: nothing is queued
//! for users who are offline, and a channel that cannot take a frame is
//! dropped on the spot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod bridge;
pub mod hub;

pub use bridge::{HealthReport, NotificationBridge, SosAlert};
pub use hub::{ChannelHandle, FrameSink, NotificationHub, Notifier, SinkClosed, HEARTBEAT_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Sos,
    Health,
    Incident,
    Attendance,
    Announcement,
    TourRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

impl Notification {
    /// Builds a notification stamped with the current time. The id is the
    /// subject followed by the timestamp in milliseconds.
    pub fn new(
        subject: &str,
        kind: NotificationType,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        let timestamp = Utc::now();
        Self {
            id: format!("{subject}-{}", timestamp.timestamp_millis()),
            kind,
            title: title.into(),
            message: message.into(),
            data,
            timestamp,
            severity,
        }
    }
}

/// What travels over a channel.
#[derive(Debug, Clone)]
pub enum Frame {
    Notification(Arc<Notification>),
    /// Keeps idle connections open; carries no payload.
    Heartbeat,
}

impl Frame {
    /// Server-sent events encoding: `data: <json>\n\n` or `:heartbeat\n\n`.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Notification(notification) => {
                Ok(format!("data: {}\n\n", serde_json::to_string(&**notification)?))
            }
            Self::Heartbeat => Ok(":heartbeat\n\n".to_string()),
        }
    }
}
