//! Repository for lead rows.
//!
//! Status changes are written as conditional updates so two writers racing
//! on the same lead (verifier firing while a purchase webhook lands) can
//! never move a purchased lead back into recovery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Lead, LeadEmail},
};

/// Lead database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Looks a lead up by email.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_email(&self, email: &LeadEmail) -> Result<Option<Lead>> {
        let lead = sqlx::query_as::<_, Lead>(
            r#"
            SELECT email, status, captured_at, updated_at, purchased_at
            FROM leads
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(lead)
    }

    /// Inserts a lead unless one with the same email exists.
    ///
    /// Returns `false` when the email was already captured; the existing row
    /// is left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_if_absent_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        lead: &Lead,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leads (email, status, captured_at, updated_at, purchased_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(&lead.email)
        .bind(lead.status)
        .bind(lead.captured_at)
        .bind(lead.updated_at)
        .bind(lead.purchased_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves a lead to `purchased` from any state.
    ///
    /// Idempotent: a lead that is already purchased keeps its original
    /// `purchased_at`. Returns `false` when no lead has this email.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_purchased(&self, email: &LeadEmail, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leads
            SET status = 'purchased',
                purchased_at = COALESCE(purchased_at, $2),
                updated_at = CASE WHEN status = 'purchased' THEN updated_at ELSE $2 END
            WHERE email = $1
            "#,
        )
        .bind(email)
        .bind(at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves a lead from `initiated` to `in_recovery`.
    ///
    /// Returns `false` if the lead is in any other state, which is how a
    /// concurrent purchase wins the race.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_in_recovery_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        email: &LeadEmail,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leads
            SET status = 'in_recovery', updated_at = $2
            WHERE email = $1 AND status = 'initiated'
            "#,
        )
        .bind(email)
        .bind(at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
