//! Processing pipeline traits and the lease-claiming wrapper.

use std::time::Duration;

use async_trait::async_trait;
use database::{conversation, now_millis, Conversation, ConversationStatus, Database};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;

/// What the driver learns from handing a conversation to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// The conversation was processed and its lease released.
    Completed { status: ConversationStatus },
    /// Another worker holds the conversation, or it stopped being ready.
    AlreadyClaimed,
    /// Processing failed; the failure was recorded for the stale detector.
    Failed { error: String },
}

/// Entry point the scheduler driver calls for each ready conversation.
///
/// Implementations are responsible for claiming the lease before doing any
/// work and for the failure bookkeeping the stale detector later reads.
#[async_trait]
pub trait ConversationProcessor: Send + Sync {
    async fn process(&self, conversation: &Conversation) -> Result<ProcessOutcome, SchedulerError>;
}

/// Result of a successful handler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Status to leave the conversation in.
    pub status: ConversationStatus,
    /// Debounce window before the conversation may be processed again.
    pub cooldown: Option<Duration>,
}

impl HandlerOutcome {
    /// The bot answered; wait `cooldown` before reprocessing.
    pub fn responded(cooldown: Duration) -> Self {
        Self {
            status: ConversationStatus::Open,
            cooldown: Some(cooldown),
        }
    }

    /// The handler asked for a human.
    pub fn handed_off() -> Self {
        Self {
            status: ConversationStatus::PendingHuman,
            cooldown: None,
        }
    }

    pub fn resolved() -> Self {
        Self {
            status: ConversationStatus::Resolved,
            cooldown: None,
        }
    }
}

/// The actual conversation work (generating and sending a reply).
#[async_trait]
pub trait ConversationHandler: Send + Sync {
    async fn handle(&self, conversation: &Conversation) -> Result<HandlerOutcome, SchedulerError>;
}

/// A processor that discards every conversation.
#[derive(Debug, Clone, Default)]
pub struct NoOpProcessor;

#[async_trait]
impl ConversationProcessor for NoOpProcessor {
    async fn process(
        &self,
        _conversation: &Conversation,
    ) -> Result<ProcessOutcome, SchedulerError> {
        Ok(ProcessOutcome::AlreadyClaimed)
    }
}

/// Wraps a [`ConversationHandler`] with lease claiming and failure
/// bookkeeping.
///
/// The claim is a single conditional update; if it does not apply, the
/// handler never runs. A worker that crashes mid-handler leaves its lease to
/// expire, which the stale detector reports as an expired lock.
pub struct LeasedProcessor<H: ConversationHandler> {
    db: Database,
    handler: H,
    worker_id: String,
    lease_ttl: Duration,
}

impl<H: ConversationHandler> LeasedProcessor<H> {
    /// Create a processor with a random worker id.
    pub fn new(db: Database, handler: H, lease_ttl: Duration) -> Self {
        Self::with_worker_id(db, handler, lease_ttl, format!("worker-{}", Uuid::new_v4()))
    }

    pub fn with_worker_id(
        db: Database,
        handler: H,
        lease_ttl: Duration,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            handler,
            worker_id: worker_id.into(),
            lease_ttl,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<H: ConversationHandler> ConversationProcessor for LeasedProcessor<H> {
    async fn process(&self, target: &Conversation) -> Result<ProcessOutcome, SchedulerError> {
        let pool = self.db.pool();
        let now = now_millis();
        let ttl_ms = i64::try_from(self.lease_ttl.as_millis()).unwrap_or(i64::MAX / 2);

        let claimed =
            conversation::claim_conversation(pool, &target.id, &self.worker_id, now, ttl_ms).await?;
        if !claimed {
            debug!(conversation_id = %target.id, "Conversation already claimed");
            return Ok(ProcessOutcome::AlreadyClaimed);
        }

        match self.handler.handle(target).await {
            Ok(outcome) => {
                let cooldown_until = outcome.cooldown.map(|cooldown| {
                    now_millis().saturating_add(i64::try_from(cooldown.as_millis()).unwrap_or(0))
                });
                let released = conversation::complete_processing(
                    pool,
                    &target.id,
                    &self.worker_id,
                    outcome.status,
                    cooldown_until,
                )
                .await?;
                if !released {
                    // Lease expired and was recovered while we worked.
                    warn!(
                        conversation_id = %target.id,
                        worker_id = %self.worker_id,
                        "Lease lost before completion"
                    );
                }
                info!(
                    conversation_id = %target.id,
                    status = %outcome.status,
                    "Processed conversation"
                );
                Ok(ProcessOutcome::Completed {
                    status: outcome.status,
                })
            }
            Err(e) => {
                let error = e.to_string();
                warn!(conversation_id = %target.id, "Processing failed: {}", error);
                let recorded = conversation::record_processing_failure(
                    pool,
                    &target.id,
                    &self.worker_id,
                    &error,
                    now_millis(),
                )
                .await?;
                if !recorded {
                    warn!(
                        conversation_id = %target.id,
                        worker_id = %self.worker_id,
                        "Lease lost before failure could be recorded"
                    );
                }
                Ok(ProcessOutcome::Failed { error })
            }
        }
    }
}
