//! Conversation store errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("store query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// No conversation with this id.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// `create_conversation` was called with an id already in use.
    #[error("conversation already exists: {0}")]
    ConversationExists(String),
}

impl DatabaseError {
    /// Translate constraint violations on writes that name `conversation_id`.
    ///
    /// A unique violation means the id is taken; a foreign key violation
    /// means it does not exist.
    pub(crate) fn for_conversation(err: sqlx::Error, conversation_id: &str) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return Self::ConversationExists(conversation_id.to_string());
            }
            if db_err.is_foreign_key_violation() {
                return Self::ConversationNotFound(conversation_id.to_string());
            }
        }
        Self::Sqlx(err)
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
