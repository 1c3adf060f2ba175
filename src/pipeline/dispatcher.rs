//! Background dispatcher.
//!
//! Each poll cycle claims a batch of queued applications, drives every item
//! through the stages with bounded concurrency, and writes the result back
//! under the claim token. A write whose claim was taken over in the meantime
//! is discarded, so an item is never finished twice.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::stages::{self, StagePolicy};
use crate::collaborator::Collaborator;
use crate::config::WorkerConfig;
use crate::heartbeat::{Heartbeat, HeartbeatFile, ShutdownRecord};
use crate::state_machine::{StateMachine, TerminalOutcome, Transition, WorkItem};
use crate::store::{StoreError, WorkStore};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Items worked on at once within a cycle.
    pub concurrency: usize,
    /// A `processing` claim older than this is considered abandoned.
    pub claim_ttl: Duration,
    pub stages: StagePolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            batch_size: 5,
            max_attempts: 3,
            concurrency: 2,
            claim_ttl: Duration::from_secs(900),
            stages: StagePolicy::default(),
        }
    }
}

impl From<&WorkerConfig> for DispatchConfig {
    fn from(worker: &WorkerConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(worker.poll_interval_secs),
            batch_size: worker.batch_size,
            max_attempts: worker.max_attempts,
            concurrency: worker.concurrency,
            claim_ttl: Duration::from_secs(worker.claim_ttl_secs),
            stages: StagePolicy {
                ai_timeout: Duration::from_secs(worker.ai_timeout_secs),
                min_match_score: worker.min_match_score,
                reuse_cached_analysis: worker.reuse_cached_analysis,
            },
        }
    }
}

/// Tally of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub claimed: usize,
    pub materials_ready: usize,
    pub not_viable: usize,
    /// Released to `queued` after a retryable failure.
    pub retried: usize,
    pub failed: usize,
    /// Results discarded because another dispatcher took the claim over.
    pub claim_lost: usize,
    /// Claims handed back untouched because shutdown was requested.
    pub released: usize,
    pub store_errors: usize,
}

impl CycleSummary {
    fn record(&mut self, result: ItemResult) {
        match result {
            ItemResult::Completed(TerminalOutcome::MaterialsReady) => self.materials_ready += 1,
            ItemResult::Completed(TerminalOutcome::NotViable) => self.not_viable += 1,
            ItemResult::Completed(TerminalOutcome::Failed(_)) => self.failed += 1,
            ItemResult::Retried => self.retried += 1,
            ItemResult::Released => self.released += 1,
            ItemResult::ClaimLost => self.claim_lost += 1,
            ItemResult::StoreError => self.store_errors += 1,
        }
    }
}

#[derive(Debug)]
enum ItemResult {
    Completed(TerminalOutcome),
    Retried,
    Released,
    ClaimLost,
    StoreError,
}

pub struct Dispatcher<S, C> {
    store: S,
    collaborator: C,
    config: DispatchConfig,
    heartbeat: Option<HeartbeatFile>,
}

impl<S: WorkStore, C: Collaborator> Dispatcher<S, C> {
    pub fn new(store: S, collaborator: C, config: DispatchConfig) -> Self {
        Self {
            store,
            collaborator,
            config,
            heartbeat: None,
        }
    }

    /// Publish a heartbeat to `file` after every cycle.
    pub fn with_heartbeat(mut self, file: HeartbeatFile) -> Self {
        self.heartbeat = Some(file);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Poll until `cancel` fires. In-flight items finish; claimed items
    /// that have not started are released.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut heartbeat = Heartbeat::new(std::process::id(), Utc::now());
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            max_attempts = self.config.max_attempts,
            "Dispatcher started",
        );
        self.beat(&heartbeat);

        while !cancel.is_cancelled() {
            match self.run_cycle(&cancel).await {
                Ok(summary) => {
                    heartbeat.last_poll_at = Some(Utc::now());
                    heartbeat.cycles += 1;
                    heartbeat.last_cycle = Some(summary);
                }
                Err(e) => tracing::error!(error = %e, "Poll cycle failed"),
            }
            self.beat(&heartbeat);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        heartbeat.shutdown = Some(ShutdownRecord {
            at: Utc::now(),
            clean: true,
        });
        self.beat(&heartbeat);
        tracing::info!(cycles = heartbeat.cycles, "Dispatcher shutting down");
    }

    /// One poll cycle. Only a failed claim is an error; per-item problems
    /// are counted in the summary.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, StoreError> {
        let now = Utc::now();
        let stale_before = TimeDelta::from_std(self.config.claim_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let batch = self
            .store
            .claim_batch(self.config.batch_size, now, stale_before)
            .await?;
        let mut summary = CycleSummary {
            claimed: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            tracing::debug!("No queued applications");
            return Ok(summary);
        }
        tracing::info!(claimed = batch.len(), "Claimed applications");

        let results: Vec<ItemResult> = stream::iter(batch)
            .map(|item| self.process(item, cancel))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        for result in results {
            summary.record(result);
        }

        tracing::info!(
            claimed = summary.claimed,
            materials_ready = summary.materials_ready,
            not_viable = summary.not_viable,
            retried = summary.retried,
            failed = summary.failed,
            claim_lost = summary.claim_lost,
            released = summary.released,
            "Poll cycle complete",
        );
        Ok(summary)
    }

    async fn process(&self, mut item: WorkItem, cancel: &CancellationToken) -> ItemResult {
        let span = tracing::info_span!(
            "application",
            id = %item.id,
            attempt = item.meta.attempt_count,
        );
        async move {
            let Some(token) = item.meta.claim_token else {
                tracing::error!("Claimed item carries no claim token");
                return ItemResult::StoreError;
            };

            if cancel.is_cancelled() {
                if let Err(e) = StateMachine::release_unstarted(&mut item, Utc::now()) {
                    tracing::error!(error = %e, "Could not release unstarted claim");
                    return ItemResult::StoreError;
                }
                tracing::info!("Released unstarted claim");
                return self.commit(&item, token).await.map_or_else(|r| r, |()| ItemResult::Released);
            }

            let outcome =
                stages::run(&self.store, &self.collaborator, &item, &self.config.stages).await;
            let transition = match StateMachine::next(
                &mut item,
                outcome,
                self.config.max_attempts,
                Utc::now(),
            ) {
                Ok(transition) => transition,
                Err(e) => {
                    tracing::error!(error = %e, "Rejected state transition");
                    return ItemResult::StoreError;
                }
            };

            let result = match transition {
                Transition::Retry { attempt, reason } => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        reason = %reason,
                        "Attempt failed; released for retry",
                    );
                    ItemResult::Retried
                }
                Transition::Complete(outcome) => {
                    match &outcome {
                        TerminalOutcome::Failed(kind) => {
                            tracing::error!(reason = %kind, "Application failed")
                        }
                        _ => tracing::info!(status = %item.status, "Application finished"),
                    }
                    ItemResult::Completed(outcome)
                }
            };

            self.commit(&item, token).await.map_or_else(|r| r, |()| result)
        }
        .instrument(span)
        .await
    }

    async fn commit(&self, item: &WorkItem, token: Uuid) -> Result<(), ItemResult> {
        match self.store.commit(item, token).await {
            Ok(()) => Ok(()),
            Err(StoreError::ClaimLost(_)) => {
                tracing::warn!("Claim was taken over; discarding this result");
                Err(ItemResult::ClaimLost)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to write result");
                Err(ItemResult::StoreError)
            }
        }
    }

    fn beat(&self, heartbeat: &Heartbeat) {
        if let Some(file) = &self.heartbeat {
            if let Err(e) = file.write(heartbeat) {
                tracing::warn!(path = %file.path().display(), error = %e, "Failed to write heartbeat");
            }
        }
    }
}
