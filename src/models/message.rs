//! Message-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for client-generated ids of optimistic messages.
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Chat message scoped to a negotiation room (bid).
///
/// Accepts both the REST and the socket payload spellings (`_id`/`id`,
/// `content`/`body`, `createdAt`/`sentAt`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(rename = "bidId", alias = "room")]
    pub room: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(alias = "content", alias = "text")]
    pub body: String,
    #[serde(alias = "createdAt", alias = "timestamp", default = "Utc::now")]
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a provisional message for an optimistic send.
    pub fn provisional(room: &str, sender_id: &str, sender_name: Option<&str>, body: &str) -> Self {
        Self {
            id: format!("{}{}", PROVISIONAL_PREFIX, uuid::Uuid::new_v4()),
            room: room.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.map(str::to_string),
            body: body.to_string(),
            sent_at: Utc::now(),
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.starts_with(PROVISIONAL_PREFIX)
    }

    /// Display name, falling back to the sender id.
    pub fn sender_label(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender_id)
    }
}

/// Body of a REST send request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage<'a> {
    pub bid_id: &'a str,
    pub content: &'a str,
}
