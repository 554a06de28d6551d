//! Conversation processing scheduler with stale detection and recovery.
//!
//! This crate drives automated handling of customer conversations stored by
//! the [`database`] crate. Workers claim conversations through short leases;
//! a periodic stale detector finds conversations whose processing appears
//! abandoned, and the recovery engine remediates them or hands them to a
//! human once automated recovery is exhausted.
//!
//! # Features
//!
//! - Atomic lease claims so at most one worker processes a conversation
//! - Ordered stuck-reason classification (failures, expired locks, stuck
//!   cooldowns, abandoned input, plain timeouts)
//! - Reason-specific remediation with persisted exponential retry-after
//! - Escalation to a human with a customer notice, an internal diagnostic
//!   and a status-change notification
//! - Never touches conversations assigned to a human
//!
//! # Architecture
//!
//! ```text
//!  processing interval                 detection interval
//!          ↓                                   ↓
//! ┌──────────────────────┐       ┌──────────────────────────────┐
//! │  find ready rows     │       │  StaleDetector               │
//! │         ↓            │       │    scan + classify           │
//! │  LeasedProcessor     │       │         ↓                    │
//! │    claim lease       │       │  RecoveryEngine              │
//! │    run handler       │       │    requeue / retry-after     │
//! │    complete / fail   │       │    or escalate → sink        │
//! └──────────────────────┘       └──────────────────────────────┘
//!                     ↘               ↙
//!                  conversations + messages (SQLite)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use scheduler::{
//!     ConversationHandler, HandlerOutcome, LeasedProcessor, LoggingSink, SchedulerConfig,
//!     SchedulerDriver, SchedulerError,
//! };
//!
//! struct Replier;
//!
//! #[async_trait]
//! impl ConversationHandler for Replier {
//!     async fn handle(
//!         &self,
//!         conversation: &Conversation,
//!     ) -> Result<HandlerOutcome, SchedulerError> {
//!         // Generate and send a reply
//!         Ok(HandlerOutcome::responded(Duration::from_secs(10)))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = database::Database::connect("sqlite:scheduler.db?mode=rwc").await?;
//!     db.migrate().await?;
//!
//!     let config = SchedulerConfig::from_env();
//!     let processor = LeasedProcessor::new(db.clone(), Replier, config.lease_ttl);
//!     let driver = SchedulerDriver::new(db, processor, LoggingSink, config);
//!
//!     driver.run_with_shutdown(async { let _ = tokio::signal::ctrl_c().await; }).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod detector;
pub mod driver;
pub mod error;
pub mod lease;
pub mod recovery;
pub mod sink;
pub mod stuck;

pub use config::SchedulerConfig;
pub use detector::{StaleConversation, StaleDetector};
pub use driver::{ProcessingTickSummary, RecoveryTickSummary, SchedulerDriver};
pub use error::SchedulerError;
pub use lease::{
    ConversationHandler, ConversationProcessor, HandlerOutcome, LeasedProcessor, NoOpProcessor,
    ProcessOutcome,
};
pub use recovery::{
    RecoveryAction, RecoveryEngine, RecoveryResult, ESCALATION_CUSTOMER_MESSAGE,
};
pub use sink::{BroadcastSink, EscalationSink, LoggingSink, NoOpSink, StatusChangedEvent};
pub use stuck::{backoff_delay, classify, ClassificationContext, StuckReason};
