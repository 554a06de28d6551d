//! Database models.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Processing,
    PendingHuman,
    Resolved,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Processing => "processing",
            Self::PendingHuman => "pending_human",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    /// Whether automated claiming and recovery may act on this status.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Open | Self::Processing)
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author class of a conversation message.
///
/// `Internal` messages are diagnostics for operators and do not count
/// towards "who spoke last".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MessageType {
    Customer,
    Bot,
    Human,
    Internal,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Bot => "bot",
            Self::Human => "human",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation together with its processing-control fields.
///
/// Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    pub id: String,
    /// Owning organization (tenant).
    pub organization_id: String,
    pub status: ConversationStatus,
    /// There is customer input that has not been processed yet.
    pub needs_processing: bool,
    /// Lease deadline; the holder owns the conversation until then.
    pub processing_locked_until: Option<i64>,
    /// Lease holder (worker id).
    pub processing_locked_by: Option<String>,
    /// The conversation must not be reprocessed before this deadline.
    pub cooldown_until: Option<i64>,
    /// Lifetime claim count.
    pub processing_attempts: i64,
    /// Consecutive failures since the last successful run.
    pub processing_error_count: i64,
    pub last_processing_error: Option<String>,
    pub last_processing_error_at: Option<i64>,
    /// Cached classification from the last recovery pass.
    pub is_stuck: bool,
    pub stuck_detected_at: Option<i64>,
    pub stuck_reason: Option<String>,
    /// Recovery passes applied; only zeroed by manual recovery.
    pub recovery_attempts: i64,
    pub last_recovery_attempt_at: Option<i64>,
    /// Human owner. When set the conversation is exempt from automation.
    pub assigned_user_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    /// Whether some worker holds a lease that has not expired at `now`.
    pub fn has_live_lease(&self, now: i64) -> bool {
        self.processing_locked_until.is_some_and(|until| until > now)
    }

    /// Whether the cooldown window is still running at `now`.
    pub fn in_cooldown(&self, now: i64) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    /// Whether automated claiming or recovery may touch this conversation.
    pub fn is_automatable(&self) -> bool {
        self.assigned_user_id.is_none() && self.status.is_schedulable()
    }
}

/// A conversation row returned by the staleness scan, with the derived
/// message fields the detector needs.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct StaleCandidate {
    #[sqlx(flatten)]
    pub conversation: Conversation,
    /// Timestamp of the latest customer message.
    pub last_customer_message_at: Option<i64>,
    /// Type of the latest customer/bot/human message.
    pub last_message_type: Option<MessageType>,
}

/// A stored conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    /// Auto-incrementing ID.
    pub id: i64,
    pub conversation_id: String,
    pub content: String,
    pub message_type: MessageType,
    /// Free-form JSON object.
    pub metadata: Json<serde_json::Value>,
    pub created_at: i64,
}

/// A message to be appended to a conversation log.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub content: String,
    pub message_type: MessageType,
    pub metadata: serde_json::Value,
}

impl NewMessage {
    /// Create a message with empty metadata.
    pub fn new(content: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            content: content.into(),
            message_type,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attach metadata to the message.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Number of flagged conversations per stuck reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StuckReasonCount {
    pub stuck_reason: String,
    pub count: i64,
}
