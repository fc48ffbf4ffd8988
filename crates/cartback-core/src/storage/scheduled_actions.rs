//! Repository for durable scheduled actions.
//!
//! Actions are claimed with `FOR UPDATE SKIP LOCKED` so any number of
//! scheduler workers (or processes) can poll the same table without ever
//! handing one action to two workers. A claim is a lease: a `running` row
//! whose `claimed_at` is older than the lease timeout is claimable again.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{ActionId, ActionStatus, LeadEmail, ScheduledAction},
};

const ACTION_COLUMNS: &str = "id, lead_email, kind, reminder_number, fire_at, status, attempts, \
                              last_error, claimed_at, created_at, completed_at";

/// Scheduled action database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts an action within a transaction.
    ///
    /// Each (lead, kind, reminder number) can be scheduled once. Returns
    /// `false` when an identical action already exists.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        action: &ScheduledAction,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_actions (
                id, lead_email, kind, reminder_number, fire_at, status,
                attempts, last_error, claimed_at, created_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (lead_email, kind, reminder_number) DO NOTHING
            "#,
        )
        .bind(action.id)
        .bind(&action.lead_email)
        .bind(action.kind.kind_name())
        .bind(action.kind.reminder_number())
        .bind(action.fire_at)
        .bind(action.status)
        .bind(action.attempts)
        .bind(&action.last_error)
        .bind(action.claimed_at)
        .bind(action.created_at)
        .bind(action.completed_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Claims up to `batch_size` actions that are due at `now`.
    ///
    /// Picks pending actions whose `fire_at` has passed, plus running
    /// actions whose lease expired (the worker holding them died). Claimed
    /// rows move to `running` with `attempts` incremented. Oldest `fire_at`
    /// first.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_due(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<ScheduledAction>> {
        let mut tx = self.pool.begin().await?;
        let lease_cutoff = now - lease;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM scheduled_actions
            WHERE (status = 'pending' AND fire_at <= $1)
               OR (status = 'running' AND claimed_at < $2)
            ORDER BY fire_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(lease_cutoff)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let query = format!(
            r#"
            UPDATE scheduled_actions
            SET status = 'running', attempts = attempts + 1, claimed_at = $2
            WHERE id = ANY($1)
            RETURNING {ACTION_COLUMNS}
            "#
        );
        let mut actions = sqlx::query_as::<_, ScheduledAction>(&query)
            .bind(&ids)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        actions.sort_by_key(|a| a.fire_at);
        Ok(actions)
    }

    /// Moves a claimed action to a finished status.
    ///
    /// `status` should be one of `completed`, `skipped` or `failed`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn finish(
        &self,
        id: ActionId,
        status: ActionStatus,
        last_error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        debug_assert!(status.is_finished());

        sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = $2,
                last_error = COALESCE($3, last_error),
                completed_at = $4,
                claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(last_error)
        .bind(at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Puts a claimed action back to `pending` with a new `fire_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reschedule(
        &self,
        id: ActionId,
        fire_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = 'pending', fire_at = $2, last_error = $3, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(fire_at)
        .bind(last_error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns every `running` action to `pending`.
    ///
    /// Run once at startup, before any worker claims: whatever was running
    /// belonged to a process that no longer exists. Returns the number of
    /// actions recovered.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn recover_stalled(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = 'pending', claimed_at = NULL
            WHERE status = 'running'
            "#,
        )
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Lists the actions scheduled for a lead, earliest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_lead(&self, email: &LeadEmail) -> Result<Vec<ScheduledAction>> {
        let query = format!(
            r#"
            SELECT {ACTION_COLUMNS}
            FROM scheduled_actions
            WHERE lead_email = $1
            ORDER BY fire_at ASC, reminder_number ASC
            "#
        );
        let actions = sqlx::query_as::<_, ScheduledAction>(&query)
            .bind(email)
            .fetch_all(&*self.pool)
            .await?;

        Ok(actions)
    }
}
