//! SQLite conversation store for the conversation scheduler.
//!
//! This crate provides async operations over conversations, their
//! processing-control fields, and their message logs using SQLx with SQLite.
//! Every write is a targeted, conditional update so that concurrent workers
//! coordinate through row predicates alone.
//!
//! # Example
//!
//! ```no_run
//! use database::{conversation, message, Database, MessageType, NewMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Connect and run migrations
//!     let db = Database::connect("sqlite:scheduler.db?mode=rwc").await?;
//!     db.migrate().await?;
//!
//!     // Open a conversation and log the customer's first message
//!     conversation::create_conversation(db.pool(), "conv-1", "org-1").await?;
//!     message::append_message(
//!         db.pool(),
//!         "conv-1",
//!         &NewMessage::new("My order never arrived", MessageType::Customer),
//!     )
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod conversation;
pub mod error;
pub mod message;
pub mod models;
pub mod patch;

pub use error::{DatabaseError, Result};
pub use models::{
    Conversation, ConversationStatus, Message, MessageType, NewMessage, StaleCandidate,
    StuckReasonCount,
};
pub use patch::{ConversationPatch, UpdateGuard};

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Current wall-clock time in epoch milliseconds, the unit of every stored
/// timestamp.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle to the conversation store shared by workers and the stale detector.
///
/// Cheap to clone; clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Enough for a processing tick and a bounded recovery tick side by side.
    pub const DEFAULT_POOL_SIZE: u32 = 10;

    /// How long a write waits on another process's lock before failing.
    ///
    /// Every scheduler write is a single short statement, so contention
    /// resolves well within this.
    const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open the store at `url` (`sqlite:path?mode=rwc`, or `sqlite::memory:`).
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_pool_size(url, Self::DEFAULT_POOL_SIZE).await
    }

    /// Open the store with an explicit connection count.
    ///
    /// File-backed stores run in WAL mode so that readers (the stale
    /// detector) do not block the lease writes of other worker processes.
    /// Foreign keys are enforced so messages cannot outlive their
    /// conversation.
    pub async fn connect_with_pool_size(url: &str, pool_size: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Self::BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        info!(url, pool_size, "Opened conversation store");
        Ok(Self { pool })
    }

    /// Bring the conversation and message tables up to date. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Conversation store schema is current");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection. Later queries fail with a pool error.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_repeatable() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();

        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversations")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_file_store_uses_wal_and_foreign_keys() {
        let path = std::env::temp_dir().join(format!(
            "conversation-store-{}-{}.db",
            std::process::id(),
            now_millis()
        ));
        let db = Database::connect(&format!("sqlite:{}", path.display()))
            .await
            .unwrap();

        let mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);

        db.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }

    #[tokio::test]
    async fn test_conversation_lifecycle_roundtrip() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        conversation::create_conversation(db.pool(), "conv-1", "org-1")
            .await
            .unwrap();
        conversation::assign_user(db.pool(), "conv-1", Some("agent-1"))
            .await
            .unwrap();
        let fetched = conversation::get_conversation(db.pool(), "conv-1")
            .await
            .unwrap();
        assert_eq!(fetched.assigned_user_id.as_deref(), Some("agent-1"));
        assert!(!fetched.is_automatable());

        conversation::assign_user(db.pool(), "conv-1", None).await.unwrap();
        let fetched = conversation::get_conversation(db.pool(), "conv-1")
            .await
            .unwrap();
        assert!(fetched.is_automatable());

        let missing = conversation::assign_user(db.pool(), "nope", None).await;
        assert!(matches!(missing, Err(DatabaseError::ConversationNotFound(_))));
    }
}
