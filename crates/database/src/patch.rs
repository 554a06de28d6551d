//! Partial-field updates for conversations.
//!
//! Writers never replace a whole row. A [`ConversationPatch`] names exactly
//! the fields to change, and an [`UpdateGuard`] adds the conditions the row
//! must still satisfy for the update to apply.

use crate::models::ConversationStatus;

/// A set of field changes to apply to one conversation.
///
/// `None` leaves a field untouched. For nullable columns the inner `Option`
/// is the new value, so `Some(None)` clears the column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationPatch {
    pub status: Option<ConversationStatus>,
    pub needs_processing: Option<bool>,
    pub processing_locked_until: Option<Option<i64>>,
    pub processing_locked_by: Option<Option<String>>,
    pub cooldown_until: Option<Option<i64>>,
    pub is_stuck: Option<bool>,
    pub stuck_reason: Option<Option<String>>,
    pub stuck_detected_at: Option<Option<i64>>,
}

impl ConversationPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ConversationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn needs_processing(mut self, needs_processing: bool) -> Self {
        self.needs_processing = Some(needs_processing);
        self
    }

    /// Drop any lease, live or expired.
    pub fn clear_lease(mut self) -> Self {
        self.processing_locked_until = Some(None);
        self.processing_locked_by = Some(None);
        self
    }

    pub fn cooldown_until(mut self, until: i64) -> Self {
        self.cooldown_until = Some(Some(until));
        self
    }

    pub fn clear_cooldown(mut self) -> Self {
        self.cooldown_until = Some(None);
        self
    }

    /// Invalidate the cached stuck classification.
    ///
    /// Every write that resolves a stuck condition goes through here so the
    /// markers cannot outlive the condition they describe.
    pub fn clear_stuck_markers(mut self) -> Self {
        self.is_stuck = Some(false);
        self.stuck_reason = Some(None);
        self.stuck_detected_at = Some(None);
        self
    }
}

/// Conditions a row must satisfy for a patch to apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateGuard {
    /// Require no human owner and an `open`/`processing` status.
    pub automatable: bool,
}

impl UpdateGuard {
    /// No conditions beyond the conversation id.
    pub fn none() -> Self {
        Self::default()
    }

    /// The row must still be eligible for automated handling.
    pub fn automatable() -> Self {
        Self { automatable: true }
    }
}
