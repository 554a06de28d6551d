//! Conversation message log.

use sqlx::types::Json;
use sqlx::SqlitePool;

use crate::error::DatabaseError;
use crate::models::{Message, NewMessage};
use crate::{now_millis, Result};

/// Append a message to a conversation log, timestamped now.
pub async fn append_message(
    pool: &SqlitePool,
    conversation_id: &str,
    message: &NewMessage,
) -> Result<Message> {
    append_message_at(pool, conversation_id, message, now_millis()).await
}

/// Append a message with an explicit creation time (epoch milliseconds).
///
/// Fails with [`DatabaseError::ConversationNotFound`] if the conversation
/// does not exist.
pub async fn append_message_at(
    pool: &SqlitePool,
    conversation_id: &str,
    message: &NewMessage,
    created_at: i64,
) -> Result<Message> {
    let record = sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages (conversation_id, content, message_type, metadata, created_at)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id, conversation_id, content, message_type, metadata, created_at
        "#,
    )
    .bind(conversation_id)
    .bind(&message.content)
    .bind(message.message_type)
    .bind(Json(&message.metadata))
    .bind(created_at)
    .fetch_one(pool)
    .await
    .map_err(|e| DatabaseError::for_conversation(e, conversation_id))?;

    Ok(record)
}

/// List a conversation's messages, oldest first.
pub async fn list_messages(pool: &SqlitePool, conversation_id: &str) -> Result<Vec<Message>> {
    let rows = sqlx::query_as::<_, Message>(
        r#"
        SELECT id, conversation_id, content, message_type, metadata, created_at
        FROM messages
        WHERE conversation_id = ?
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
