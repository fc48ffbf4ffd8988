//! Durable delayed-action scheduler.
//!
//! A pool of workers polls the `scheduled_actions` table, claims due rows
//! with `FOR UPDATE SKIP LOCKED`, hands each to the lifecycle engine and
//! persists the outcome. Because pending work lives in the database, a
//! restart loses nothing: [`ActionScheduler::recover_stalled`] puts any row
//! left `running` by the previous process back in the queue.

use std::{sync::Arc, time::Duration};

use cartback_core::{
    models::{ActionStatus, ScheduledAction},
    Clock,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::{ActionOutcome, LifecycleEngine},
    error::{RecoveryError, Result},
    storage::LeadStorage,
};

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent polling workers.
    pub worker_count: usize,

    /// Maximum actions claimed per poll.
    pub batch_size: usize,

    /// Wait between polls when nothing is due.
    pub poll_interval: Duration,

    /// How long a claim stays valid before another worker may take over.
    pub lease_timeout: Duration,

    /// Wait after a failed poll before trying again.
    pub error_backoff: Duration,

    /// Maximum time `shutdown` waits for workers.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(5 * 60),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Workers currently running.
    pub active_workers: usize,
    /// Actions claimed and executed.
    pub actions_processed: u64,
    /// Actions that completed.
    pub completed: u64,
    /// Actions that found nothing to do.
    pub skipped: u64,
    /// Actions put back for a later attempt.
    pub rescheduled: u64,
    /// Actions that gave up.
    pub failed: u64,
    /// Executions aborted by a store error, left for lease expiry.
    pub errors: u64,
}

/// Polls the action table and drives the engine.
pub struct ActionScheduler {
    engine: Arc<LifecycleEngine>,
    storage: Arc<dyn LeadStorage>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    stats: Arc<RwLock<SchedulerStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl ActionScheduler {
    /// Creates a scheduler over the engine's store and clock.
    pub fn new(engine: Arc<LifecycleEngine>, config: SchedulerConfig) -> Self {
        Self {
            storage: engine.storage(),
            clock: engine.clock(),
            engine,
            config,
            stats: Arc::new(RwLock::new(SchedulerStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    /// Returns actions left `running` by a previous process to `pending`.
    ///
    /// Call once before [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns `Store` if the sweep fails.
    pub async fn recover_stalled(&self) -> Result<u64> {
        let recovered = self.storage.recover_stalled().await?;
        if recovered > 0 {
            warn!(recovered, "returned stalled actions to the queue");
        } else {
            debug!("no stalled actions found");
        }
        Ok(recovered)
    }

    /// Spawns the worker pool. Returns immediately.
    pub async fn start(&mut self) {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "starting action scheduler"
        );

        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let worker = self.worker(worker_id);
            let stats = self.stats.clone();

            self.worker_handles.push(tokio::spawn(async move {
                worker.run().await;
                stats.write().await.active_workers -= 1;
            }));
        }
    }

    /// Claims and executes one batch in the caller's task.
    ///
    /// Returns the number of actions processed.
    ///
    /// # Errors
    ///
    /// Returns `Store` if claiming fails.
    pub async fn process_batch(&self) -> Result<usize> {
        self.worker(0).process_batch().await
    }

    /// Signals workers to stop and waits up to the shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if workers are still running when the timeout
    /// expires.
    pub async fn shutdown(mut self) -> Result<()> {
        info!(workers = self.worker_handles.len(), "shutting down action scheduler");
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let join_all = async {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "scheduler worker panicked");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, join_all).await {
            Ok(()) => {
                info!("action scheduler stopped");
                Ok(())
            },
            Err(_) => Err(RecoveryError::internal(format!(
                "scheduler workers still running after {}s",
                self.config.shutdown_timeout.as_secs()
            ))),
        }
    }

    /// Snapshot of the counters.
    pub async fn stats(&self) -> SchedulerStats {
        self.stats.read().await.clone()
    }

    fn worker(&self, id: usize) -> SchedulerWorker {
        SchedulerWorker {
            id,
            engine: self.engine.clone(),
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
            cancellation_token: self.cancellation_token.clone(),
        }
    }
}

struct SchedulerWorker {
    id: usize,
    engine: Arc<LifecycleEngine>,
    storage: Arc<dyn LeadStorage>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    stats: Arc<RwLock<SchedulerStats>>,
    cancellation_token: CancellationToken,
}

impl SchedulerWorker {
    async fn run(&self) {
        debug!(worker_id = self.id, "scheduler worker started");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let wait = match self.process_batch().await {
                Ok(0) => self.config.poll_interval,
                Ok(_) => continue,
                Err(error) => {
                    error!(worker_id = self.id, %error, "failed to claim scheduled actions");
                    self.config.error_backoff
                },
            };

            tokio::select! {
                () = self.clock.sleep(wait) => {}
                () = self.cancellation_token.cancelled() => break,
            }
        }

        debug!(worker_id = self.id, "scheduler worker stopped");
    }

    async fn process_batch(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let lease = chrono::Duration::from_std(self.config.lease_timeout)
            .map_err(|_| RecoveryError::configuration("lease timeout out of range"))?;

        let actions = self.storage.claim_due_actions(self.config.batch_size, now, lease).await?;
        let claimed = actions.len();
        if claimed > 0 {
            debug!(worker_id = self.id, claimed, "claimed due actions");
        }

        for action in actions {
            self.process_action(&action).await;
        }

        Ok(claimed)
    }

    async fn process_action(&self, action: &ScheduledAction) {
        let outcome = match self.engine.execute(action).await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(
                    worker_id = self.id,
                    action_id = %action.id,
                    kind = %action.kind,
                    %error,
                    "action execution aborted, will retry after lease expiry"
                );
                let mut stats = self.stats.write().await;
                stats.actions_processed += 1;
                stats.errors += 1;
                return;
            },
        };

        if let Err(error) = self.persist(action, &outcome).await {
            error!(action_id = %action.id, %error, "failed to persist action outcome");
        }

        let mut stats = self.stats.write().await;
        stats.actions_processed += 1;
        match outcome {
            ActionOutcome::Completed => stats.completed += 1,
            ActionOutcome::Skipped { .. } => stats.skipped += 1,
            ActionOutcome::Rescheduled { .. } => stats.rescheduled += 1,
            ActionOutcome::Failed { .. } => stats.failed += 1,
        }
    }

    async fn persist(&self, action: &ScheduledAction, outcome: &ActionOutcome) -> Result<()> {
        let now = self.clock.now_utc();

        match outcome {
            ActionOutcome::Completed => {
                self.storage.finish_action(action.id, ActionStatus::Completed, None, now).await?;
            },
            ActionOutcome::Skipped { reason } => {
                debug!(action_id = %action.id, kind = %action.kind, %reason, "action skipped");
                self.storage
                    .finish_action(action.id, ActionStatus::Skipped, Some(reason.clone()), now)
                    .await?;
            },
            ActionOutcome::Rescheduled { fire_at, reason } => {
                self.storage.reschedule_action(action.id, *fire_at, reason.clone()).await?;
            },
            ActionOutcome::Failed { error } => {
                self.storage
                    .finish_action(action.id, ActionStatus::Failed, Some(error.clone()), now)
                    .await?;
            },
        }

        Ok(())
    }
}
