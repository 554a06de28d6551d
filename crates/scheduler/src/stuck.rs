//! Stuck-reason classification and retry backoff.
//!
//! Classification is an ordered rule table evaluated top-down; the first
//! matching rule names the reason. The order is the severity ranking.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use database::{Conversation, ConversationStatus};
use serde::{Deserialize, Serialize};

/// Base delay for the first retry after repeated failures.
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound on the retry delay.
pub const BACKOFF_CAP_MS: u64 = 60_000;

/// Why a conversation is considered stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StuckReason {
    /// Processing keeps failing.
    RepeatedFailures,
    /// A worker claimed the conversation and its lease ran out.
    LockExpired,
    /// Cooldown ended but nothing flagged the conversation for processing.
    CooldownStuck,
    /// Input is pending and nobody holds the conversation.
    AbandonedProcessing,
    /// The customer is waiting and none of the above explains why.
    NoResponseTimeout,
}

impl StuckReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepeatedFailures => "REPEATED_FAILURES",
            Self::LockExpired => "LOCK_EXPIRED",
            Self::CooldownStuck => "COOLDOWN_STUCK",
            Self::AbandonedProcessing => "ABANDONED_PROCESSING",
            Self::NoResponseTimeout => "NO_RESPONSE_TIMEOUT",
        }
    }
}

impl fmt::Display for StuckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StuckReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REPEATED_FAILURES" => Ok(Self::RepeatedFailures),
            "LOCK_EXPIRED" => Ok(Self::LockExpired),
            "COOLDOWN_STUCK" => Ok(Self::CooldownStuck),
            "ABANDONED_PROCESSING" => Ok(Self::AbandonedProcessing),
            "NO_RESPONSE_TIMEOUT" => Ok(Self::NoResponseTimeout),
            other => Err(format!("unknown stuck reason: {}", other)),
        }
    }
}

/// Point in time and thresholds a conversation is judged against.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationContext {
    /// Epoch milliseconds.
    pub now: i64,
    pub repeated_failure_threshold: i64,
}

type Rule = (StuckReason, fn(&Conversation, &ClassificationContext) -> bool);

/// Classification rules, most severe first.
pub const CLASSIFICATION_RULES: [Rule; 5] = [
    (StuckReason::RepeatedFailures, has_repeated_failures),
    (StuckReason::LockExpired, has_expired_lock),
    (StuckReason::CooldownStuck, has_stuck_cooldown),
    (StuckReason::AbandonedProcessing, is_abandoned),
    (StuckReason::NoResponseTimeout, always),
];

fn has_repeated_failures(c: &Conversation, ctx: &ClassificationContext) -> bool {
    c.processing_error_count >= ctx.repeated_failure_threshold
}

// A processing conversation without any deadline is treated as expired.
fn has_expired_lock(c: &Conversation, ctx: &ClassificationContext) -> bool {
    c.status == ConversationStatus::Processing && !c.has_live_lease(ctx.now)
}

fn has_stuck_cooldown(c: &Conversation, ctx: &ClassificationContext) -> bool {
    !c.needs_processing && c.cooldown_until.is_some_and(|until| until <= ctx.now)
}

fn is_abandoned(c: &Conversation, ctx: &ClassificationContext) -> bool {
    c.needs_processing && !c.has_live_lease(ctx.now)
}

fn always(_: &Conversation, _: &ClassificationContext) -> bool {
    true
}

/// Assign the single most severe reason.
pub fn classify(conversation: &Conversation, ctx: &ClassificationContext) -> StuckReason {
    CLASSIFICATION_RULES
        .iter()
        .find(|(_, matches)| matches(conversation, ctx))
        .map(|(reason, _)| *reason)
        .unwrap_or(StuckReason::NoResponseTimeout)
}

/// Whether any stuck trigger holds.
///
/// Only the explicit triggers count here; the catch-all timeout rule applies
/// to conversations that were already flagged.
pub fn has_stuck_trigger(conversation: &Conversation, ctx: &ClassificationContext) -> bool {
    conversation.is_stuck
        || CLASSIFICATION_RULES
            .iter()
            .filter(|(reason, _)| *reason != StuckReason::NoResponseTimeout)
            .any(|(_, matches)| matches(conversation, ctx))
}

/// Retry delay after `error_count` consecutive failures:
/// `min(1000 * 2^error_count, 60000)` milliseconds.
pub fn backoff_delay(error_count: i64) -> Duration {
    let exponent = u32::try_from(error_count.max(0)).unwrap_or(u32::MAX);
    let delay = 2u64
        .checked_pow(exponent)
        .and_then(|factor| factor.checked_mul(BACKOFF_BASE_MS))
        .map_or(BACKOFF_CAP_MS, |ms| ms.min(BACKOFF_CAP_MS));
    Duration::from_millis(delay)
}
