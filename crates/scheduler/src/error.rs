//! Error types for scheduler operations.

use database::DatabaseError;
use thiserror::Error;

/// Errors that can occur while scheduling, processing or recovering
/// conversations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Conversation store failure.
    #[error("store error: {0}")]
    Database(#[from] DatabaseError),

    /// The processing pipeline failed on a conversation.
    #[error("processing failed: {0}")]
    Processing(String),
}
