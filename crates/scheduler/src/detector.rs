//! Stale conversation detection.

use std::time::Duration;

use database::{conversation, now_millis, ConversationStatus, Database, StaleCandidate};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::stuck::{classify, has_stuck_trigger, ClassificationContext, StuckReason};

/// A conversation the detector considers abandoned, with its diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleConversation {
    pub conversation_id: String,
    pub organization_id: String,
    pub status: ConversationStatus,
    pub stuck_reason: StuckReason,
    /// How long the customer has been waiting.
    pub stale_duration: Duration,
    pub processing_attempts: i64,
    pub processing_error_count: i64,
    pub last_processing_error: Option<String>,
}

/// Finds conversations whose processing appears abandoned.
///
/// Detection is read-only. Writing the diagnosis back is the recovery
/// engine's job.
#[derive(Debug, Clone)]
pub struct StaleDetector {
    db: Database,
    config: SchedulerConfig,
}

impl StaleDetector {
    pub fn new(db: Database, config: SchedulerConfig) -> Self {
        Self { db, config }
    }

    /// Scan the store and classify every stale conversation.
    ///
    /// Store errors are logged and yield an empty result so that a failed
    /// scan never takes the scheduler down.
    pub async fn detect(&self) -> Vec<StaleConversation> {
        self.detect_at(now_millis()).await
    }

    /// Same as [`detect`](Self::detect), judged at `now` (epoch milliseconds).
    pub async fn detect_at(&self, now: i64) -> Vec<StaleConversation> {
        let candidates = match conversation::find_stale_candidates(
            self.db.pool(),
            now,
            self.config.stale_threshold_ms(),
            self.config.repeated_failure_threshold,
            self.config.batch_size,
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!("Stale conversation scan failed: {}", e);
                return Vec::new();
            }
        };

        let ctx = ClassificationContext {
            now,
            repeated_failure_threshold: self.config.repeated_failure_threshold,
        };

        let stale: Vec<StaleConversation> = candidates
            .into_iter()
            .filter_map(|candidate| diagnose(candidate, &ctx))
            .collect();

        if stale.is_empty() {
            debug!("No stale conversations found");
        } else {
            info!(count = stale.len(), "Detected stale conversations");
        }

        stale
    }
}

fn diagnose(candidate: StaleCandidate, ctx: &ClassificationContext) -> Option<StaleConversation> {
    let conversation = candidate.conversation;
    if !has_stuck_trigger(&conversation, ctx) {
        return None;
    }

    let waited_ms = candidate
        .last_customer_message_at
        .map_or(0, |at| ctx.now.saturating_sub(at).max(0));
    let stuck_reason = classify(&conversation, ctx);

    debug!(
        conversation_id = %conversation.id,
        reason = %stuck_reason,
        waited_ms,
        "Classified stale conversation"
    );

    Some(StaleConversation {
        conversation_id: conversation.id,
        organization_id: conversation.organization_id,
        status: conversation.status,
        stuck_reason,
        stale_duration: Duration::from_millis(u64::try_from(waited_ms).unwrap_or(0)),
        processing_attempts: conversation.processing_attempts,
        processing_error_count: conversation.processing_error_count,
        last_processing_error: conversation.last_processing_error,
    })
}
