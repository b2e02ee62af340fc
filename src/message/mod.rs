//! The message envelope shared by the publish and receive paths.
//!
//! A [`Message`] is created by the publisher in [`MessageStatus::Scheduled`]
//! (or [`MessageStatus::Delayed`] when it must not go out before
//! `expires_at`), persisted, dispatched, delivered, and finally parked in a
//! terminal status until the collector removes it.

mod id;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use id::IdGenerator;

/// Well-known header keys stamped on every envelope.
pub mod headers {
    /// Id assigned by the publisher. Inbox rows keep it as the origin id.
    pub const MESSAGE_ID: &str = "msg-id";
    pub const MESSAGE_NAME: &str = "msg-name";
    pub const GROUP: &str = "msg-group";
    pub const SENT_TIME: &str = "msg-sent-time";
    pub const DELAY_TIME: &str = "msg-delay-time";
    /// Populated with the last handler error on the inbox row.
    pub const EXCEPTION: &str = "msg-exception";

    /// Keys the core owns; user headers never override them.
    pub const RESERVED: [&str; 5] = [MESSAGE_ID, MESSAGE_NAME, GROUP, SENT_TIME, DELAY_TIME];
}

/// Lifecycle status of a message. Exactly one value at any time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    #[default]
    Scheduled,
    Queued,
    Pending,
    Retrying,
    Succeeded,
    Failed,
    Delayed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 7] = [
        MessageStatus::Scheduled,
        MessageStatus::Queued,
        MessageStatus::Pending,
        MessageStatus::Retrying,
        MessageStatus::Succeeded,
        MessageStatus::Failed,
        MessageStatus::Delayed,
    ];

    /// Statuses the retry sweep may pick up.
    pub const RETRYABLE: [MessageStatus; 4] = [
        MessageStatus::Scheduled,
        MessageStatus::Queued,
        MessageStatus::Pending,
        MessageStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "SCHEDULED",
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Pending => "PENDING",
            MessageStatus::Retrying => "RETRYING",
            MessageStatus::Succeeded => "SUCCEEDED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Delayed => "DELAYED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Succeeded | MessageStatus::Failed)
    }

    pub fn is_retryable(&self) -> bool {
        Self::RETRYABLE.contains(self)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown message status: {s}"))
    }
}

/// Which table a row lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageCategory {
    /// Outbox rows written by the publisher.
    Published,
    /// Inbox rows written when a consumer accepts a delivery.
    Received,
}

impl MessageCategory {
    pub const ALL: [MessageCategory; 2] = [MessageCategory::Published, MessageCategory::Received];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageCategory::Published => "published",
            MessageCategory::Received => "received",
        }
    }
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope flowing through storage, dispatcher, transport and handlers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    /// Logical topic / event type.
    pub name: String,
    /// Consumer group (queue namespace).
    pub group: String,
    /// Serialized payload, opaque to the core.
    pub content: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub status: MessageStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only for delayed messages: do not dispatch before this instant.
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation timestamp kept for audit and sweep ordering.
    pub added: DateTime<Utc>,
    pub version: String,
}

impl Message {
    /// Build a fresh envelope in `SCHEDULED` status.
    pub fn new(
        id: i64,
        name: impl Into<String>,
        group: impl Into<String>,
        content: impl Into<String>,
        version: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        let name = name.into();
        let group = group.into();
        let mut headers = HashMap::new();
        headers.insert(headers::MESSAGE_ID.to_string(), id.to_string());
        headers.insert(headers::MESSAGE_NAME.to_string(), name.clone());
        headers.insert(headers::GROUP.to_string(), group.clone());
        headers.insert(headers::SENT_TIME.to_string(), now.to_rfc3339());

        Self {
            id,
            name,
            group,
            content: content.into(),
            headers,
            status: MessageStatus::Scheduled,
            retries: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            expires_at: None,
            added: now,
            version: version.into(),
        }
    }

    /// Merge caller headers without touching the reserved keys.
    pub fn with_headers<I, K, V>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in extra {
            let key = key.into();
            if headers::RESERVED.contains(&key.as_str()) {
                continue;
            }
            self.headers.insert(key, value.into());
        }
        self
    }

    /// Hold the message back until `due`.
    pub fn delay_until(mut self, due: DateTime<Utc>) -> Self {
        self.status = MessageStatus::Delayed;
        self.expires_at = Some(due);
        self.headers
            .insert(headers::DELAY_TIME.to_string(), due.to_rfc3339());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// The id the publisher assigned; differs from `id` on inbox rows.
    pub fn origin_id(&self) -> i64 {
        self.header(headers::MESSAGE_ID)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(self.id)
    }

    /// `{group}.{version}`, the transport destination for this message.
    pub fn destination(&self) -> String {
        crate::queue::destination(&self.group, &self.version)
    }

    /// Decode the JSON payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.content)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a delayed message may be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |due| due <= now)
    }

    /// Move to `status` and stamp `updated_at`.
    pub fn transition(&mut self, status: MessageStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Count a failed attempt. Returns `true` when the ceiling is reached
    /// and the message must be parked in `FAILED`.
    pub fn record_failure(&mut self) -> bool {
        self.retries = self.retries.saturating_add(1);
        self.retries >= self.max_retries
    }

    /// Whether another attempt is still allowed.
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }
}
