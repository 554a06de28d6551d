//! Recovery of stale conversations.
//!
//! Each recovery is a short sequence of conditional writes:
//!
//! ```text
//! load row ──► missing?            → conversation_not_found
//!          ──► dry run?            → dry_run
//!          ──► no longer eligible? → no_longer_stuck
//!          ──► attempts ≥ ceiling? → escalate
//!          ──► begin attempt (CAS on recovery_attempts, marks stuck)
//!          ──► reason-specific fix (clears stuck markers)
//! ```
//!
//! Every write is guarded by "still unassigned and still open/processing", so
//! a human taking over mid-recovery is never overwritten, and two passes
//! racing on the same row cannot both apply a remediation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use database::{
    conversation, message, now_millis, Conversation, ConversationPatch, ConversationStatus,
    Database, MessageType, NewMessage, UpdateGuard,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::detector::StaleConversation;
use crate::error::SchedulerError;
use crate::sink::EscalationSink;
use crate::stuck::{backoff_delay, StuckReason};

/// Customer-facing notice appended when a conversation is handed to a human.
pub const ESCALATION_CUSTOMER_MESSAGE: &str = "We're sorry, we're experiencing technical \
difficulties handling your request. A human agent will assist you shortly.";

/// Outcome label of a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    ConversationNotFound,
    DryRun,
    /// The conversation recovered, was taken over, or was recovered recently.
    NoLongerStuck,
    /// Another recovery pass or a human changed the row first.
    Superseded,
    ClearedLockAndRequeued,
    RequeuedForProcessing,
    RetryWithBackoff,
    ResetAndRequeued,
    ClearedCooldownAndRequeued,
    EscalatedToHuman,
    RecoveryError,
    UnknownStuckReason,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConversationNotFound => "conversation_not_found",
            Self::DryRun => "dry_run",
            Self::NoLongerStuck => "no_longer_stuck",
            Self::Superseded => "superseded",
            Self::ClearedLockAndRequeued => "cleared_lock_and_requeued",
            Self::RequeuedForProcessing => "requeued_for_processing",
            Self::RetryWithBackoff => "retry_with_backoff",
            Self::ResetAndRequeued => "reset_and_requeued",
            Self::ClearedCooldownAndRequeued => "cleared_cooldown_and_requeued",
            Self::EscalatedToHuman => "escalated_to_human",
            Self::RecoveryError => "recovery_error",
            Self::UnknownStuckReason => "unknown_stuck_reason",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub action: RecoveryAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retry-after delay written for repeated failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

impl RecoveryResult {
    fn succeeded(action: RecoveryAction) -> Self {
        Self {
            success: true,
            action,
            error: None,
            backoff_ms: None,
        }
    }

    fn failed(action: RecoveryAction, error: Option<String>) -> Self {
        Self {
            success: false,
            action,
            error,
            backoff_ms: None,
        }
    }
}

/// Applies reason-specific remediation to stale conversations and escalates
/// to a human once automated recovery is exhausted.
pub struct RecoveryEngine<N: EscalationSink> {
    db: Database,
    sink: Arc<N>,
    config: SchedulerConfig,
}

impl<N: EscalationSink> RecoveryEngine<N> {
    pub fn new(db: Database, sink: N, config: SchedulerConfig) -> Self {
        Self::with_shared_sink(db, Arc::new(sink), config)
    }

    /// Create an engine that shares its sink with other components.
    pub fn with_shared_sink(db: Database, sink: Arc<N>, config: SchedulerConfig) -> Self {
        Self { db, sink, config }
    }

    pub fn sink(&self) -> &N {
        &self.sink
    }

    /// Remediate one stale conversation.
    ///
    /// Never fails: store errors come back as `recovery_error` and the
    /// conversation is left for the next detector pass.
    pub async fn recover(&self, stale: &StaleConversation, dry_run: bool) -> RecoveryResult {
        self.recover_inner(stale, dry_run || self.config.dry_run, true)
            .await
    }

    /// Re-run recovery from the cached stuck markers of a conversation.
    ///
    /// Meant for operators re-driving flagged conversations, so the
    /// recently-recovered window is not honored.
    pub async fn recover_flagged(&self, conversation_id: &str) -> RecoveryResult {
        let flagged = match conversation::find_conversation(self.db.pool(), conversation_id)
            .await
        {
            Ok(Some(found)) => found,
            Ok(None) => return RecoveryResult::failed(RecoveryAction::ConversationNotFound, None),
            Err(e) => {
                error!(conversation_id, "Failed to load flagged conversation: {}", e);
                return RecoveryResult::failed(RecoveryAction::RecoveryError, Some(e.to_string()));
            }
        };

        if !flagged.is_stuck {
            return RecoveryResult::succeeded(RecoveryAction::NoLongerStuck);
        }

        let cached = flagged.stuck_reason.clone().unwrap_or_default();
        let stuck_reason = match cached.parse::<StuckReason>() {
            Ok(reason) => reason,
            Err(e) => {
                error!(conversation_id, cached_reason = %cached, "Cannot recover: {}", e);
                return RecoveryResult::failed(RecoveryAction::UnknownStuckReason, Some(e));
            }
        };

        let now = now_millis();
        let stuck_for = flagged
            .stuck_detected_at
            .map_or(0, |at| now.saturating_sub(at).max(0));
        let stale = StaleConversation {
            conversation_id: flagged.id,
            organization_id: flagged.organization_id,
            status: flagged.status,
            stuck_reason,
            stale_duration: Duration::from_millis(u64::try_from(stuck_for).unwrap_or(0)),
            processing_attempts: flagged.processing_attempts,
            processing_error_count: flagged.processing_error_count,
            last_processing_error: flagged.last_processing_error,
        };

        self.recover_inner(&stale, self.config.dry_run, false).await
    }

    /// Operator reset of a conversation within an organization.
    ///
    /// Clears every processing, cooldown, error and stuck field, zeroes
    /// `recovery_attempts`, and requeues the conversation as open. Returns
    /// `None` if the organization has no such conversation.
    pub async fn manual_recovery(
        &self,
        conversation_id: &str,
        organization_id: &str,
    ) -> Result<Option<Conversation>, SchedulerError> {
        let reset =
            conversation::manual_recovery(self.db.pool(), conversation_id, organization_id).await?;

        match reset {
            Some(_) => info!(
                conversation_id,
                organization_id, "Manually reset conversation processing state"
            ),
            None => warn!(
                conversation_id,
                organization_id, "Manual recovery requested for unknown conversation"
            ),
        }

        Ok(reset)
    }

    async fn recover_inner(
        &self,
        stale: &StaleConversation,
        dry_run: bool,
        honor_recent_recovery: bool,
    ) -> RecoveryResult {
        match self.try_recover(stale, dry_run, honor_recent_recovery).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    conversation_id = %stale.conversation_id,
                    reason = %stale.stuck_reason,
                    "Recovery failed: {}",
                    e
                );
                RecoveryResult::failed(RecoveryAction::RecoveryError, Some(e.to_string()))
            }
        }
    }

    async fn try_recover(
        &self,
        stale: &StaleConversation,
        dry_run: bool,
        honor_recent_recovery: bool,
    ) -> Result<RecoveryResult, SchedulerError> {
        let pool = self.db.pool();
        let id = stale.conversation_id.as_str();
        let reason = stale.stuck_reason;
        let now = now_millis();

        let Some(current) = conversation::find_conversation(pool, id).await? else {
            warn!(conversation_id = id, "Stale conversation no longer exists");
            return Ok(RecoveryResult::failed(
                RecoveryAction::ConversationNotFound,
                None,
            ));
        };

        if dry_run {
            info!(
                conversation_id = id,
                reason = %reason,
                recovery_attempts = current.recovery_attempts,
                processing_error_count = current.processing_error_count,
                stale_ms = stale.stale_duration.as_millis() as u64,
                "[dry run] Would recover stale conversation"
            );
            return Ok(RecoveryResult::succeeded(RecoveryAction::DryRun));
        }

        let recently_recovered = honor_recent_recovery && self.recently_recovered(&current, now);
        if !current.is_automatable() || recently_recovered {
            debug!(
                conversation_id = id,
                status = %current.status,
                "Conversation no longer needs recovery"
            );
            return Ok(RecoveryResult::succeeded(RecoveryAction::NoLongerStuck));
        }

        if current.recovery_attempts >= self.config.max_recovery_attempts {
            warn!(
                conversation_id = id,
                recovery_attempts = current.recovery_attempts,
                max = self.config.max_recovery_attempts,
                "Recovery attempts exhausted"
            );
            return self
                .escalate(&current, reason, current.recovery_attempts)
                .await;
        }

        let started = conversation::begin_recovery_attempt(
            pool,
            id,
            current.recovery_attempts,
            reason.as_str(),
            now,
        )
        .await?;
        if !started {
            debug!(conversation_id = id, "Recovery superseded by a concurrent change");
            return Ok(superseded());
        }

        self.remediate(&current, reason, current.recovery_attempts + 1, now)
            .await
    }

    /// Apply the reason-specific fix after the attempt has been recorded.
    async fn remediate(
        &self,
        current: &Conversation,
        reason: StuckReason,
        attempt: i64,
        now: i64,
    ) -> Result<RecoveryResult, SchedulerError> {
        let id = current.id.as_str();

        let (action, patch, backoff) = match reason {
            StuckReason::LockExpired => (
                RecoveryAction::ClearedLockAndRequeued,
                requeue().clear_lease(),
                None,
            ),
            StuckReason::NoResponseTimeout => {
                (RecoveryAction::RequeuedForProcessing, requeue(), None)
            }
            StuckReason::RepeatedFailures => {
                if current.processing_error_count >= self.config.max_recovery_attempts {
                    warn!(
                        conversation_id = id,
                        processing_error_count = current.processing_error_count,
                        "Too many processing failures"
                    );
                    return self.escalate(current, reason, attempt).await;
                }
                // The delay becomes the retry-after deadline instead of
                // holding this tick.
                let delay = backoff_delay(current.processing_error_count);
                let delay_ms = delay.as_millis() as u64;
                (
                    RecoveryAction::RetryWithBackoff,
                    requeue()
                        .clear_lease()
                        .cooldown_until(now.saturating_add(delay_ms as i64)),
                    Some(delay_ms),
                )
            }
            StuckReason::AbandonedProcessing => (
                RecoveryAction::ResetAndRequeued,
                requeue().clear_lease(),
                None,
            ),
            StuckReason::CooldownStuck => (
                RecoveryAction::ClearedCooldownAndRequeued,
                ConversationPatch::new()
                    .clear_cooldown()
                    .needs_processing(true)
                    .clear_stuck_markers(),
                None,
            ),
        };

        let applied = conversation::update_fields(
            self.db.pool(),
            id,
            &patch,
            &UpdateGuard::automatable(),
        )
        .await?;
        if !applied {
            debug!(conversation_id = id, "Remediation superseded by a concurrent change");
            self.release_stuck_markers(id).await;
            return Ok(superseded());
        }

        info!(
            conversation_id = id,
            reason = %reason,
            action = %action,
            attempt,
            backoff_ms = backoff.unwrap_or(0),
            "Recovered stale conversation"
        );

        Ok(RecoveryResult {
            backoff_ms: backoff,
            ..RecoveryResult::succeeded(action)
        })
    }

    /// Drop the stuck markers of a conversation someone else took over.
    ///
    /// Unguarded: the row is no longer ours to remediate, but the markers
    /// written by this attempt must not outlive it.
    async fn release_stuck_markers(&self, conversation_id: &str) {
        let patch = ConversationPatch::new().clear_stuck_markers();
        let pool = self.db.pool();
        let cleared =
            conversation::update_fields(pool, conversation_id, &patch, &UpdateGuard::none()).await;
        if let Err(e) = cleared {
            warn!(conversation_id, "Failed to clear stuck markers: {}", e);
        }
    }

    fn recently_recovered(&self, conversation: &Conversation, now: i64) -> bool {
        conversation
            .last_recovery_attempt_at
            .is_some_and(|at| now - at < self.config.stale_threshold_ms())
    }

    /// Hand the conversation to a human.
    ///
    /// The state change commits first; the two log messages and the
    /// notification follow and only log on failure.
    async fn escalate(
        &self,
        current: &Conversation,
        reason: StuckReason,
        recovery_attempts: i64,
    ) -> Result<RecoveryResult, SchedulerError> {
        let patch = ConversationPatch::new()
            .status(ConversationStatus::PendingHuman)
            .needs_processing(false)
            .clear_lease()
            .clear_stuck_markers();
        let applied = conversation::update_fields(
            self.db.pool(),
            &current.id,
            &patch,
            &UpdateGuard::automatable(),
        )
        .await?;
        if !applied {
            debug!(conversation_id = %current.id, "Escalation superseded by a concurrent change");
            self.release_stuck_markers(&current.id).await;
            return Ok(superseded());
        }

        warn!(
            conversation_id = %current.id,
            organization_id = %current.organization_id,
            reason = %reason,
            recovery_attempts,
            "Escalated conversation to a human agent"
        );

        self.append_escalation_messages(current, reason, recovery_attempts)
            .await;
        self.publish_escalation(&current.id).await;

        Ok(RecoveryResult::succeeded(RecoveryAction::EscalatedToHuman))
    }

    async fn append_escalation_messages(
        &self,
        current: &Conversation,
        reason: StuckReason,
        recovery_attempts: i64,
    ) {
        let notice = NewMessage::new(ESCALATION_CUSTOMER_MESSAGE, MessageType::Bot)
            .with_metadata(json!({ "escalation": true }));

        let diagnostic = NewMessage::new(
            escalation_diagnostic(current, reason, recovery_attempts),
            MessageType::Internal,
        )
        .with_metadata(json!({
            "escalation": true,
            "stuck_reason": reason.as_str(),
            "processing_error_count": current.processing_error_count,
            "processing_attempts": current.processing_attempts,
            "recovery_attempts": recovery_attempts,
        }));

        for entry in [notice, diagnostic] {
            if let Err(e) = message::append_message(self.db.pool(), &current.id, &entry).await {
                warn!(
                    conversation_id = %current.id,
                    message_type = %entry.message_type,
                    "Failed to append escalation message: {}",
                    e
                );
            }
        }
    }

    async fn publish_escalation(&self, conversation_id: &str) {
        let found = conversation::find_conversation(self.db.pool(), conversation_id).await;
        let escalated = match found {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                warn!(conversation_id, "Escalated conversation vanished before notification");
                return;
            }
            Err(e) => {
                warn!(conversation_id, "Failed to reload escalated conversation: {}", e);
                return;
            }
        };

        if let Err(e) = self.sink.publish_status_changed(&escalated, &["status"]).await {
            warn!(conversation_id, "Failed to publish escalation: {}", e);
        }
    }
}

/// Base remediation: reopen the conversation for processing.
fn requeue() -> ConversationPatch {
    ConversationPatch::new()
        .status(ConversationStatus::Open)
        .needs_processing(true)
        .clear_stuck_markers()
}

fn superseded() -> RecoveryResult {
    RecoveryResult::failed(
        RecoveryAction::Superseded,
        Some("conversation changed during recovery".to_string()),
    )
}

fn escalation_diagnostic(
    conversation: &Conversation,
    reason: StuckReason,
    recovery_attempts: i64,
) -> String {
    format!(
        "Automated processing escalated to a human agent.\n\
         Reason: {}\n\
         Processing errors: {}\n\
         Processing attempts: {}\n\
         Last error: {}\n\
         Recovery attempts: {}",
        reason,
        conversation.processing_error_count,
        conversation.processing_attempts,
        conversation
            .last_processing_error
            .as_deref()
            .unwrap_or("none"),
        recovery_attempts,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::StaleDetector;
    use crate::sink::{BroadcastSink, NoOpSink};
    use crate::test_support::{seed, test_db, Seed, MINUTE};
    use database::message::list_messages;

    fn engine(db: &Database) -> RecoveryEngine<BroadcastSink> {
        RecoveryEngine::new(db.clone(), BroadcastSink::default(), SchedulerConfig::default())
    }

    fn stale(id: &str, reason: StuckReason) -> StaleConversation {
        StaleConversation {
            conversation_id: id.to_string(),
            organization_id: "org-1".to_string(),
            status: ConversationStatus::Open,
            stuck_reason: reason,
            stale_duration: Duration::from_secs(300),
            processing_attempts: 0,
            processing_error_count: 0,
            last_processing_error: None,
        }
    }

    async fn load(db: &Database, id: &str) -> Conversation {
        conversation::get_conversation(db.pool(), id).await.unwrap()
    }

    #[tokio::test]
    async fn test_missing_conversation() {
        let db = test_db().await;
        let result = engine(&db)
            .recover(&stale("ghost", StuckReason::LockExpired), false)
            .await;
        assert!(!result.success);
        assert_eq!(result.action, RecoveryAction::ConversationNotFound);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_mutate() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                status: "processing",
                locked_until: Some(-10 * MINUTE),
                ..Seed::waiting()
            },
        )
        .await;
        let before = load(&db, "c1").await;

        let result = engine(&db)
            .recover(&stale("c1", StuckReason::LockExpired), true)
            .await;
        assert!(result.success);
        assert_eq!(result.action, RecoveryAction::DryRun);
        assert_eq!(load(&db, "c1").await, before);
    }

    #[tokio::test]
    async fn test_lock_expired_clears_lease_and_requeues() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                status: "processing",
                needs_processing: false,
                locked_until: Some(-10 * MINUTE),
                is_stuck: true,
                ..Seed::waiting()
            },
        )
        .await;

        let result = engine(&db)
            .recover(&stale("c1", StuckReason::LockExpired), false)
            .await;
        assert!(result.success);
        assert_eq!(result.action, RecoveryAction::ClearedLockAndRequeued);

        let after = load(&db, "c1").await;
        assert_eq!(after.status, ConversationStatus::Open);
        assert!(after.needs_processing);
        assert!(after.processing_locked_until.is_none());
        assert!(after.processing_locked_by.is_none());
        assert!(!after.is_stuck);
        assert!(after.stuck_reason.is_none());
        assert!(after.stuck_detected_at.is_none());
        assert_eq!(after.recovery_attempts, 1);
        assert!(after.last_recovery_attempt_at.is_some());
    }

    #[tokio::test]
    async fn test_no_response_timeout_requeues() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                needs_processing: false,
                is_stuck: true,
                ..Seed::waiting()
            },
        )
        .await;

        let result = engine(&db)
            .recover(&stale("c1", StuckReason::NoResponseTimeout), false)
            .await;
        assert_eq!(result.action, RecoveryAction::RequeuedForProcessing);
        let after = load(&db, "c1").await;
        assert!(after.needs_processing);
        assert_eq!(after.status, ConversationStatus::Open);
        assert!(!after.is_stuck);
    }

    #[tokio::test]
    async fn test_repeated_failures_sets_retry_after() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                status: "processing",
                locked_until: Some(-MINUTE),
                error_count: 3,
                ..Seed::waiting()
            },
        )
        .await;

        let started = now_millis();
        let result = engine(&db)
            .recover(&stale("c1", StuckReason::RepeatedFailures), false)
            .await;
        assert!(result.success);
        assert_eq!(result.action, RecoveryAction::RetryWithBackoff);
        assert_eq!(result.backoff_ms, Some(8_000));

        let after = load(&db, "c1").await;
        assert_eq!(after.status, ConversationStatus::Open);
        assert!(after.needs_processing);
        assert!(after.processing_locked_until.is_none());
        let cooldown = after.cooldown_until.unwrap();
        assert!(cooldown >= started + 8_000);
        // Error streak is the pipeline's to reset.
        assert_eq!(after.processing_error_count, 3);
    }

    #[tokio::test]
    async fn test_repeated_failures_over_ceiling_escalates() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                error_count: 5,
                last_error: Some("upstream timeout"),
                ..Seed::waiting()
            },
        )
        .await;

        let result = engine(&db)
            .recover(&stale("c1", StuckReason::RepeatedFailures), false)
            .await;
        assert_eq!(result.action, RecoveryAction::EscalatedToHuman);
        assert!(result.backoff_ms.is_none());

        let after = load(&db, "c1").await;
        assert_eq!(after.status, ConversationStatus::PendingHuman);
        assert!(!after.needs_processing);
        assert_eq!(after.recovery_attempts, 1);

        let messages = list_messages(db.pool(), "c1").await.unwrap();
        let internal = messages
            .iter()
            .find(|m| m.message_type == MessageType::Internal)
            .unwrap();
        assert!(internal.content.contains("REPEATED_FAILURES"));
        assert!(internal.content.contains("upstream timeout"));
    }

    #[tokio::test]
    async fn test_abandoned_processing_resets() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                locked_until: Some(-MINUTE),
                ..Seed::waiting()
            },
        )
        .await;

        let result = engine(&db)
            .recover(&stale("c1", StuckReason::AbandonedProcessing), false)
            .await;
        assert_eq!(result.action, RecoveryAction::ResetAndRequeued);
        let after = load(&db, "c1").await;
        assert!(after.processing_locked_until.is_none());
        assert!(after.needs_processing);
    }

    #[tokio::test]
    async fn test_cooldown_stuck_clears_cooldown() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                needs_processing: false,
                cooldown_until: Some(-60 * MINUTE),
                ..Seed::waiting()
            },
        )
        .await;

        let result = engine(&db)
            .recover(&stale("c1", StuckReason::CooldownStuck), false)
            .await;
        assert_eq!(result.action, RecoveryAction::ClearedCooldownAndRequeued);
        let after = load(&db, "c1").await;
        assert!(after.cooldown_until.is_none());
        assert!(after.needs_processing);
    }

    #[tokio::test]
    async fn test_ceiling_escalates_with_two_messages_and_one_notification() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                recovery_attempts: 5,
                ..Seed::waiting()
            },
        )
        .await;
        let engine = engine(&db);
        let mut events = engine.sink().subscribe();

        let result = engine
            .recover(&stale("c1", StuckReason::AbandonedProcessing), false)
            .await;
        assert!(result.success);
        assert_eq!(result.action, RecoveryAction::EscalatedToHuman);

        let after = load(&db, "c1").await;
        assert_eq!(after.status, ConversationStatus::PendingHuman);
        assert!(!after.needs_processing);
        assert_eq!(after.recovery_attempts, 5);

        let messages = list_messages(db.pool(), "c1").await.unwrap();
        // Seeded customer message plus the two escalation messages.
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].message_type, MessageType::Bot);
        assert_eq!(messages[1].content, ESCALATION_CUSTOMER_MESSAGE);
        assert_eq!(messages[2].message_type, MessageType::Internal);

        let event = events.recv().await.unwrap();
        assert_eq!(event.conversation_id, "c1");
        assert_eq!(event.status, ConversationStatus::PendingHuman);
        assert_eq!(event.changed_fields, vec!["status".to_string()]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_recover_is_a_no_op() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                status: "processing",
                needs_processing: false,
                locked_until: Some(-10 * MINUTE),
                ..Seed::waiting()
            },
        )
        .await;
        let engine = engine(&db);
        let target = stale("c1", StuckReason::LockExpired);

        let first = engine.recover(&target, false).await;
        assert_eq!(first.action, RecoveryAction::ClearedLockAndRequeued);
        let after_first = load(&db, "c1").await;

        let second = engine.recover(&target, false).await;
        assert_eq!(second.action, RecoveryAction::NoLongerStuck);
        let after_second = load(&db, "c1").await;
        assert_eq!(after_second.recovery_attempts, after_first.recovery_attempts);
        assert_eq!(after_second.status, after_first.status);

        let detector = StaleDetector::new(db.clone(), SchedulerConfig::default());
        assert!(detector.detect().await.is_empty());
    }

    #[tokio::test]
    async fn test_assigned_mid_recovery_is_left_alone() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                assigned_user_id: Some("agent-1"),
                status: "processing",
                locked_until: Some(-MINUTE),
                ..Seed::waiting()
            },
        )
        .await;

        let result = engine(&db)
            .recover(&stale("c1", StuckReason::LockExpired), false)
            .await;
        assert_eq!(result.action, RecoveryAction::NoLongerStuck);
        let after = load(&db, "c1").await;
        assert_eq!(after.status, ConversationStatus::Processing);
        assert_eq!(after.recovery_attempts, 0);
    }

    #[tokio::test]
    async fn test_superseded_remediation_releases_stuck_markers() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                status: "processing",
                needs_processing: false,
                locked_until: Some(-10 * MINUTE),
                ..Seed::waiting()
            },
        )
        .await;
        let now = now_millis();
        assert!(
            conversation::begin_recovery_attempt(db.pool(), "c1", 0, "LOCK_EXPIRED", now)
                .await
                .unwrap()
        );
        let current = load(&db, "c1").await;
        // A human takes over between the attempt and the fix.
        conversation::assign_user(db.pool(), "c1", Some("agent-1"))
            .await
            .unwrap();

        let result = engine(&db)
            .remediate(&current, StuckReason::LockExpired, 1, now)
            .await
            .unwrap();
        assert_eq!(result.action, RecoveryAction::Superseded);

        let after = load(&db, "c1").await;
        assert!(!after.is_stuck);
        assert!(after.stuck_reason.is_none());
        assert!(after.stuck_detected_at.is_none());
        assert_eq!(after.assigned_user_id.as_deref(), Some("agent-1"));
        assert_eq!(after.status, ConversationStatus::Processing);
        assert_eq!(after.recovery_attempts, 1);
    }

    #[tokio::test]
    async fn test_superseded_escalation_releases_stuck_markers() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                is_stuck: true,
                stuck_reason: Some("REPEATED_FAILURES"),
                recovery_attempts: 5,
                ..Seed::waiting()
            },
        )
        .await;
        let current = load(&db, "c1").await;
        conversation::assign_user(db.pool(), "c1", Some("agent-1"))
            .await
            .unwrap();

        let result = engine(&db)
            .escalate(&current, StuckReason::RepeatedFailures, 5)
            .await
            .unwrap();
        assert_eq!(result.action, RecoveryAction::Superseded);

        let after = load(&db, "c1").await;
        assert!(!after.is_stuck);
        assert!(after.stuck_reason.is_none());
        assert_eq!(after.status, ConversationStatus::Open);
        assert_eq!(list_messages(db.pool(), "c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_flagged_uses_cached_reason() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                id: "flagged",
                needs_processing: false,
                cooldown_until: Some(-MINUTE),
                is_stuck: true,
                stuck_reason: Some("COOLDOWN_STUCK"),
                ..Seed::waiting()
            },
        )
        .await;
        seed(
            &db,
            Seed {
                id: "garbled",
                is_stuck: true,
                stuck_reason: Some("SOMETHING_ELSE"),
                ..Seed::waiting()
            },
        )
        .await;
        seed(
            &db,
            Seed {
                id: "healthy",
                ..Seed::waiting()
            },
        )
        .await;
        let engine = RecoveryEngine::new(db.clone(), NoOpSink, SchedulerConfig::default());

        let result = engine.recover_flagged("flagged").await;
        assert_eq!(result.action, RecoveryAction::ClearedCooldownAndRequeued);

        let result = engine.recover_flagged("garbled").await;
        assert!(!result.success);
        assert_eq!(result.action, RecoveryAction::UnknownStuckReason);

        let result = engine.recover_flagged("healthy").await;
        assert_eq!(result.action, RecoveryAction::NoLongerStuck);

        let result = engine.recover_flagged("ghost").await;
        assert_eq!(result.action, RecoveryAction::ConversationNotFound);
    }

    #[tokio::test]
    async fn test_manual_recovery_resets_everything() {
        let db = test_db().await;
        seed(
            &db,
            Seed {
                status: "pending_human",
                needs_processing: false,
                error_count: 6,
                recovery_attempts: 5,
                is_stuck: true,
                stuck_reason: Some("REPEATED_FAILURES"),
                cooldown_until: Some(MINUTE),
                ..Seed::waiting()
            },
        )
        .await;
        let engine = engine(&db);

        assert!(engine
            .manual_recovery("c1", "someone-else")
            .await
            .unwrap()
            .is_none());

        let reset = engine.manual_recovery("c1", "org-1").await.unwrap().unwrap();
        assert_eq!(reset.status, ConversationStatus::Open);
        assert!(reset.needs_processing);
        assert_eq!(reset.recovery_attempts, 0);
        assert_eq!(reset.processing_error_count, 0);
        assert!(reset.cooldown_until.is_none());
        assert!(!reset.is_stuck);
    }

    #[tokio::test]
    async fn test_store_failure_becomes_recovery_error() {
        let db = test_db().await;
        seed(&db, Seed::waiting()).await;
        db.close().await;

        let result = engine(&db)
            .recover(&stale("c1", StuckReason::AbandonedProcessing), false)
            .await;
        assert!(!result.success);
        assert_eq!(result.action, RecoveryAction::RecoveryError);
        assert!(result.error.is_some());
    }

    #[test]
    fn test_result_serialization() {
        let result = RecoveryResult {
            backoff_ms: Some(2_000),
            ..RecoveryResult::succeeded(RecoveryAction::RetryWithBackoff)
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["action"], "retry_with_backoff");
        assert_eq!(value["backoff_ms"], 2_000);
        assert!(value.get("error").is_none());
    }
}
