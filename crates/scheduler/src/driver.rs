//! Periodic driver for the processing and recovery loops.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use database::{conversation, now_millis, Database};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::detector::StaleDetector;
use crate::lease::{ConversationProcessor, ProcessOutcome};
use crate::recovery::{RecoveryAction, RecoveryEngine};
use crate::sink::EscalationSink;

/// Counts from one processing tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingTickSummary {
    pub ready: usize,
    pub completed: usize,
    pub already_claimed: usize,
    pub failed: usize,
    /// Conversations the processor could not even attempt.
    pub errors: usize,
}

/// Counts from one recovery tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryTickSummary {
    pub detected: usize,
    pub succeeded: usize,
    pub actions: HashMap<RecoveryAction, usize>,
}

impl RecoveryTickSummary {
    pub fn count(&self, action: RecoveryAction) -> usize {
        self.actions.get(&action).copied().unwrap_or(0)
    }
}

/// Runs the processing pipeline and the stale detector on their own
/// intervals until shut down.
pub struct SchedulerDriver<P: ConversationProcessor, N: EscalationSink> {
    db: Database,
    processor: P,
    detector: StaleDetector,
    recovery: RecoveryEngine<N>,
    config: SchedulerConfig,
}

impl<P: ConversationProcessor, N: EscalationSink> SchedulerDriver<P, N> {
    pub fn new(db: Database, processor: P, sink: N, config: SchedulerConfig) -> Self {
        Self::with_shared_sink(db, processor, Arc::new(sink), config)
    }

    /// Create a driver whose escalation sink is shared with other components.
    pub fn with_shared_sink(
        db: Database,
        processor: P,
        sink: Arc<N>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            detector: StaleDetector::new(db.clone(), config.clone()),
            recovery: RecoveryEngine::with_shared_sink(db.clone(), sink, config.clone()),
            db,
            processor,
            config,
        }
    }

    pub fn recovery(&self) -> &RecoveryEngine<N> {
        &self.recovery
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Hand every ready conversation to the processor, one at a time.
    pub async fn run_processing_tick(&self) -> ProcessingTickSummary {
        let ready = match conversation::find_ready_for_processing(
            self.db.pool(),
            now_millis(),
            self.config.batch_size,
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!("Ready conversation scan failed: {}", e);
                return ProcessingTickSummary::default();
            }
        };

        let mut summary = ProcessingTickSummary {
            ready: ready.len(),
            ..Default::default()
        };

        for target in &ready {
            match self.processor.process(target).await {
                Ok(ProcessOutcome::Completed { .. }) => summary.completed += 1,
                Ok(ProcessOutcome::AlreadyClaimed) => summary.already_claimed += 1,
                Ok(ProcessOutcome::Failed { .. }) => summary.failed += 1,
                Err(e) => {
                    warn!(conversation_id = %target.id, "Could not process conversation: {}", e);
                    summary.errors += 1;
                }
            }
        }

        if summary.ready > 0 {
            info!(
                ready = summary.ready,
                completed = summary.completed,
                failed = summary.failed,
                "Processing tick finished"
            );
        }

        summary
    }

    /// Detect stale conversations and recover them with bounded concurrency.
    pub async fn run_recovery_tick(&self) -> RecoveryTickSummary {
        let stale = self.detector.detect().await;
        let mut summary = RecoveryTickSummary {
            detected: stale.len(),
            ..Default::default()
        };
        if stale.is_empty() {
            return summary;
        }

        let dry_run = self.config.dry_run;
        let results: Vec<_> = stream::iter(stale.iter())
            .map(|target| self.recovery.recover(target, dry_run))
            .buffer_unordered(self.config.recovery_concurrency.max(1))
            .collect()
            .await;

        for result in results {
            if result.success {
                summary.succeeded += 1;
            }
            *summary.actions.entry(result.action).or_insert(0) += 1;
        }

        info!(
            detected = summary.detected,
            succeeded = summary.succeeded,
            escalated = summary.count(RecoveryAction::EscalatedToHuman),
            "Recovery tick finished"
        );

        summary
    }

    /// Run processing ticks until `shutdown` flips to `true`.
    pub async fn run_processing_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.processing_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    self.run_processing_tick().await;
                }
            }
        }

        debug!("Processing loop stopped");
    }

    /// Run recovery ticks until `shutdown` flips to `true`.
    pub async fn run_recovery_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.detection_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    self.run_recovery_tick().await;
                }
            }
        }

        debug!("Recovery loop stopped");
    }

    /// Run both loops until `shutdown_signal` resolves.
    ///
    /// A tick already in progress finishes before its loop exits.
    pub async fn run_with_shutdown<S>(&self, shutdown_signal: S)
    where
        S: Future<Output = ()> + Send,
    {
        info!(
            processing_interval_ms = self.config.processing_interval.as_millis() as u64,
            detection_interval_ms = self.config.detection_interval.as_millis() as u64,
            dry_run = self.config.dry_run,
            "Starting conversation scheduler"
        );

        let (tx, rx) = watch::channel(false);
        let signal = async move {
            shutdown_signal.await;
            info!("Shutdown signal received, stopping scheduler");
            let _ = tx.send(true);
        };

        tokio::join!(
            signal,
            self.run_processing_loop(rx.clone()),
            self.run_recovery_loop(rx),
        );

        info!("Conversation scheduler stopped");
    }
}
