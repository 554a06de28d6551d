//! Escalation sink trait and implementations.

use async_trait::async_trait;
use database::{Conversation, ConversationStatus};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::SchedulerError;

/// Default capacity of the broadcast channel used by [`BroadcastSink`].
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A "conversation changed" notification for connected observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChangedEvent {
    pub conversation_id: String,
    pub organization_id: String,
    pub status: ConversationStatus,
    pub changed_fields: Vec<String>,
    /// Epoch milliseconds.
    pub updated_at: i64,
}

impl StatusChangedEvent {
    pub fn new(conversation: &Conversation, changed_fields: &[&str]) -> Self {
        Self {
            conversation_id: conversation.id.clone(),
            organization_id: conversation.organization_id.clone(),
            status: conversation.status,
            changed_fields: changed_fields.iter().map(|f| f.to_string()).collect(),
            updated_at: conversation.updated_at,
        }
    }
}

/// Receives conversation status changes that need human attention.
///
/// Publishing is fire-and-forget from the scheduler's point of view: errors
/// are logged by the caller and never undo the state change.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    /// Announce that `changed_fields` of `conversation` changed.
    async fn publish_status_changed(
        &self,
        conversation: &Conversation,
        changed_fields: &[&str],
    ) -> Result<(), SchedulerError>;
}

/// A sink that discards all notifications.
#[derive(Debug, Clone, Default)]
pub struct NoOpSink;

#[async_trait]
impl EscalationSink for NoOpSink {
    async fn publish_status_changed(
        &self,
        _conversation: &Conversation,
        _changed_fields: &[&str],
    ) -> Result<(), SchedulerError> {
        Ok(())
    }
}

/// A sink that logs every notification.
#[derive(Debug, Clone, Default)]
pub struct LoggingSink;

#[async_trait]
impl EscalationSink for LoggingSink {
    async fn publish_status_changed(
        &self,
        conversation: &Conversation,
        changed_fields: &[&str],
    ) -> Result<(), SchedulerError> {
        tracing::info!(
            conversation_id = %conversation.id,
            organization_id = %conversation.organization_id,
            status = %conversation.status,
            "Conversation changed: {}",
            changed_fields.join(", ")
        );
        Ok(())
    }
}

/// A sink that fans notifications out to every subscriber.
///
/// Subscribers that fall behind lose the oldest events. Publishing with no
/// subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<StatusChangedEvent>,
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Attach a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChangedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EscalationSink for BroadcastSink {
    async fn publish_status_changed(
        &self,
        conversation: &Conversation,
        changed_fields: &[&str],
    ) -> Result<(), SchedulerError> {
        let event = StatusChangedEvent::new(conversation, changed_fields);
        match self.sender.send(event) {
            Ok(delivered) => {
                tracing::debug!(
                    conversation_id = %conversation.id,
                    delivered,
                    "Published status change"
                );
            }
            Err(_) => {
                tracing::debug!(
                    conversation_id = %conversation.id,
                    "No observers connected for status change"
                );
            }
        }
        Ok(())
    }
}
