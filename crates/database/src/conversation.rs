//! Conversation persistence and processing-control updates.
//!
//! Every mutation here is a targeted, conditional `UPDATE`. Coordination
//! between workers relies entirely on these row-level predicates.

use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::{DatabaseError, Result};
use crate::models::{Conversation, ConversationStatus, StaleCandidate, StuckReasonCount};
use crate::now_millis;
use crate::patch::{ConversationPatch, UpdateGuard};

/// Create a new open conversation.
pub async fn create_conversation(
    pool: &SqlitePool,
    id: &str,
    organization_id: &str,
) -> Result<Conversation> {
    let now = now_millis();
    sqlx::query(
        r#"
        INSERT INTO conversations (id, organization_id, status, created_at, updated_at)
        VALUES (?, ?, 'open', ?, ?)
        "#,
    )
    .bind(id)
    .bind(organization_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::for_conversation(e, id))?;

    get_conversation(pool, id).await
}

/// Get a conversation by ID.
pub async fn get_conversation(pool: &SqlitePool, id: &str) -> Result<Conversation> {
    find_conversation(pool, id)
        .await?
        .ok_or_else(|| DatabaseError::ConversationNotFound(id.to_string()))
}

/// Get a conversation by ID, or `None` if it does not exist.
pub async fn find_conversation(pool: &SqlitePool, id: &str) -> Result<Option<Conversation>> {
    let conversation = sqlx::query_as::<_, Conversation>(
        r#"
        SELECT *
        FROM conversations
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(conversation)
}

/// Scan for conversations whose customer has been waiting longer than
/// `threshold_ms` and that show at least one stuck trigger.
///
/// Rows are schedulable, unassigned, out of cooldown, not recovered within
/// the last threshold window, and their latest customer/bot/human message is
/// a customer message older than the threshold. The trigger filter runs
/// before `LIMIT`, so idle rows that are merely waiting cannot fill a batch.
/// Oldest wait first.
pub async fn find_stale_candidates(
    pool: &SqlitePool,
    now: i64,
    threshold_ms: i64,
    repeated_failure_threshold: i64,
    limit: i64,
) -> Result<Vec<StaleCandidate>> {
    let cutoff = now - threshold_ms;
    let rows = sqlx::query_as::<_, StaleCandidate>(
        r#"
        SELECT *
        FROM (
            SELECT
                c.*,
                (
                    SELECT m.message_type
                    FROM messages m
                    WHERE m.conversation_id = c.id
                      AND m.message_type IN ('customer', 'bot', 'human')
                    ORDER BY m.created_at DESC, m.id DESC
                    LIMIT 1
                ) AS last_message_type,
                (
                    SELECT MAX(m.created_at)
                    FROM messages m
                    WHERE m.conversation_id = c.id
                      AND m.message_type = 'customer'
                ) AS last_customer_message_at
            FROM conversations c
            WHERE c.status IN ('open', 'processing')
              AND c.assigned_user_id IS NULL
              AND (c.cooldown_until IS NULL OR c.cooldown_until <= ?)
              AND (c.last_recovery_attempt_at IS NULL OR c.last_recovery_attempt_at < ?)
              AND (
                  c.is_stuck = 1
                  OR c.processing_error_count >= ?
                  OR (c.status = 'processing'
                      AND (c.processing_locked_until IS NULL OR c.processing_locked_until <= ?))
                  OR (c.needs_processing = 1
                      AND (c.processing_locked_until IS NULL OR c.processing_locked_until <= ?))
                  OR (c.needs_processing = 0
                      AND c.cooldown_until IS NOT NULL AND c.cooldown_until <= ?)
              )
        )
        WHERE last_message_type = 'customer'
          AND last_customer_message_at < ?
        ORDER BY last_customer_message_at ASC, id ASC
        LIMIT ?
        "#,
    )
    .bind(now)
    .bind(cutoff)
    .bind(repeated_failure_threshold)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Conversations with pending customer input that a worker may claim now.
pub async fn find_ready_for_processing(
    pool: &SqlitePool,
    now: i64,
    limit: i64,
) -> Result<Vec<Conversation>> {
    let rows = sqlx::query_as::<_, Conversation>(
        r#"
        SELECT *
        FROM conversations
        WHERE needs_processing = 1
          AND status IN ('open', 'processing')
          AND assigned_user_id IS NULL
          AND (cooldown_until IS NULL OR cooldown_until <= ?)
          AND (processing_locked_until IS NULL OR processing_locked_until <= ?)
        ORDER BY updated_at ASC, id ASC
        LIMIT ?
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Apply a partial update, subject to `guard`.
///
/// Returns `false` when the conversation does not exist or no longer matches
/// the guard. `updated_at` is always touched.
pub async fn update_fields(
    pool: &SqlitePool,
    id: &str,
    patch: &ConversationPatch,
    guard: &UpdateGuard,
) -> Result<bool> {
    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE conversations SET updated_at = ");
    builder.push_bind(now_millis());

    if let Some(status) = patch.status {
        builder.push(", status = ").push_bind(status);
    }
    if let Some(needs_processing) = patch.needs_processing {
        builder.push(", needs_processing = ").push_bind(needs_processing);
    }
    if let Some(until) = patch.processing_locked_until {
        builder.push(", processing_locked_until = ").push_bind(until);
    }
    if let Some(ref by) = patch.processing_locked_by {
        builder.push(", processing_locked_by = ").push_bind(by.clone());
    }
    if let Some(until) = patch.cooldown_until {
        builder.push(", cooldown_until = ").push_bind(until);
    }
    if let Some(is_stuck) = patch.is_stuck {
        builder.push(", is_stuck = ").push_bind(is_stuck);
    }
    if let Some(ref reason) = patch.stuck_reason {
        builder.push(", stuck_reason = ").push_bind(reason.clone());
    }
    if let Some(detected_at) = patch.stuck_detected_at {
        builder.push(", stuck_detected_at = ").push_bind(detected_at);
    }

    builder.push(" WHERE id = ").push_bind(id.to_string());
    if guard.automatable {
        builder.push(" AND assigned_user_id IS NULL AND status IN ('open', 'processing')");
    }

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// Atomically claim the processing lease.
///
/// Succeeds only if the conversation is unassigned, schedulable, has pending
/// input, is out of cooldown, and nobody holds a live lease. On success the
/// conversation moves to `processing` and its pending-input flag is consumed.
pub async fn claim_conversation(
    pool: &SqlitePool,
    id: &str,
    worker_id: &str,
    now: i64,
    lease_ttl_ms: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE conversations
        SET status = 'processing',
            needs_processing = 0,
            processing_locked_until = ?,
            processing_locked_by = ?,
            processing_attempts = processing_attempts + 1,
            updated_at = ?
        WHERE id = ?
          AND assigned_user_id IS NULL
          AND status IN ('open', 'processing')
          AND needs_processing = 1
          AND (cooldown_until IS NULL OR cooldown_until <= ?)
          AND (processing_locked_until IS NULL OR processing_locked_until <= ?)
        "#,
    )
    .bind(now + lease_ttl_ms)
    .bind(worker_id)
    .bind(now)
    .bind(id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Release the lease after a successful run.
///
/// Only the lease holder can complete. Resets the failure streak and clears
/// the stuck markers, since the conversation demonstrably made progress.
pub async fn complete_processing(
    pool: &SqlitePool,
    id: &str,
    worker_id: &str,
    status: ConversationStatus,
    cooldown_until: Option<i64>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE conversations
        SET status = ?,
            processing_locked_until = NULL,
            processing_locked_by = NULL,
            cooldown_until = ?,
            processing_error_count = 0,
            last_processing_error = NULL,
            last_processing_error_at = NULL,
            is_stuck = 0,
            stuck_reason = NULL,
            stuck_detected_at = NULL,
            updated_at = ?
        WHERE id = ? AND processing_locked_by = ?
        "#,
    )
    .bind(status)
    .bind(cooldown_until)
    .bind(now_millis())
    .bind(id)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Release the lease after a failed run and put the input back in the queue.
pub async fn record_processing_failure(
    pool: &SqlitePool,
    id: &str,
    worker_id: &str,
    error: &str,
    now: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE conversations
        SET status = CASE WHEN status = 'processing' THEN 'open' ELSE status END,
            needs_processing = 1,
            processing_locked_until = NULL,
            processing_locked_by = NULL,
            processing_error_count = processing_error_count + 1,
            last_processing_error = ?,
            last_processing_error_at = ?,
            updated_at = ?
        WHERE id = ? AND processing_locked_by = ?
        "#,
    )
    .bind(error)
    .bind(now)
    .bind(now)
    .bind(id)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Start a recovery attempt.
///
/// Increments `recovery_attempts`, stamps the attempt time and records the
/// classification in the stuck markers, but only if `recovery_attempts`
/// still equals `expected_attempts` and the conversation is still eligible
/// for automation. Returns `false` if another pass got there first.
pub async fn begin_recovery_attempt(
    pool: &SqlitePool,
    id: &str,
    expected_attempts: i64,
    stuck_reason: &str,
    now: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE conversations
        SET recovery_attempts = recovery_attempts + 1,
            last_recovery_attempt_at = ?,
            is_stuck = 1,
            stuck_reason = ?,
            stuck_detected_at = COALESCE(stuck_detected_at, ?),
            updated_at = ?
        WHERE id = ?
          AND recovery_attempts = ?
          AND assigned_user_id IS NULL
          AND status IN ('open', 'processing')
        "#,
    )
    .bind(now)
    .bind(stuck_reason)
    .bind(now)
    .bind(now)
    .bind(id)
    .bind(expected_attempts)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Operator reset of every processing, cooldown, error and stuck field.
///
/// Scoped by organization. This is the only place `recovery_attempts` goes
/// back to zero. Returns `None` if the conversation does not exist within
/// the organization.
pub async fn manual_recovery(
    pool: &SqlitePool,
    id: &str,
    organization_id: &str,
) -> Result<Option<Conversation>> {
    let result = sqlx::query(
        r#"
        UPDATE conversations
        SET status = 'open',
            needs_processing = 1,
            processing_locked_until = NULL,
            processing_locked_by = NULL,
            cooldown_until = NULL,
            processing_error_count = 0,
            last_processing_error = NULL,
            last_processing_error_at = NULL,
            is_stuck = 0,
            stuck_reason = NULL,
            stuck_detected_at = NULL,
            recovery_attempts = 0,
            last_recovery_attempt_at = NULL,
            updated_at = ?
        WHERE id = ? AND organization_id = ?
        "#,
    )
    .bind(now_millis())
    .bind(id)
    .bind(organization_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    find_conversation(pool, id).await
}

/// Hand a conversation to a human agent, or take it back with `None`.
pub async fn assign_user(pool: &SqlitePool, id: &str, user_id: Option<&str>) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE conversations
        SET assigned_user_id = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(user_id)
    .bind(now_millis())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::ConversationNotFound(id.to_string()));
    }

    Ok(())
}

/// List conversations currently flagged as stuck in an organization.
pub async fn list_stuck_conversations(
    pool: &SqlitePool,
    organization_id: &str,
) -> Result<Vec<Conversation>> {
    let rows = sqlx::query_as::<_, Conversation>(
        r#"
        SELECT *
        FROM conversations
        WHERE organization_id = ? AND is_stuck = 1
        ORDER BY stuck_detected_at ASC, id ASC
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Count flagged conversations in an organization grouped by reason.
pub async fn count_stuck_by_reason(
    pool: &SqlitePool,
    organization_id: &str,
) -> Result<Vec<StuckReasonCount>> {
    let rows = sqlx::query_as::<_, StuckReasonCount>(
        r#"
        SELECT COALESCE(stuck_reason, 'UNKNOWN') AS stuck_reason, COUNT(*) AS count
        FROM conversations
        WHERE organization_id = ? AND is_stuck = 1
        GROUP BY COALESCE(stuck_reason, 'UNKNOWN')
        ORDER BY count DESC, stuck_reason ASC
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
