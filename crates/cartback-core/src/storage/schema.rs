//! Table and index definitions for leads and scheduled actions.
//!
//! Every statement is `IF NOT EXISTS`, so [`ensure`] can run on each start.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS leads (
        email TEXT PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'initiated'
            CHECK (status IN ('initiated', 'purchased', 'in_recovery')),
        captured_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        purchased_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_actions (
        id UUID PRIMARY KEY,
        lead_email TEXT NOT NULL REFERENCES leads(email),
        kind TEXT NOT NULL CHECK (kind IN ('verify_purchase', 'send_reminder')),
        reminder_number INTEGER NOT NULL DEFAULT 0,
        fire_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'running', 'completed', 'skipped', 'failed')),
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        claimed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        UNIQUE(lead_email, kind, reminder_number)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_scheduled_actions_due
    ON scheduled_actions(fire_at)
    WHERE status IN ('pending', 'running')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_scheduled_actions_lead
    ON scheduled_actions(lead_email, fire_at)
    "#,
];

/// Creates the lead and scheduled action tables and their indexes.
///
/// # Errors
///
/// Returns `CoreError::Database` if any statement fails.
pub async fn ensure(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
