//! PostgreSQL repositories for leads and scheduled actions.
//!
//! All SQL lives in this module. Callers that need several writes to land
//! together open a transaction with [`Storage::begin`] and use the
//! `_in_tx` variants.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

pub mod leads;
pub mod scheduled_actions;
pub mod schema;

use crate::error::Result;

/// Repository container sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Lead repository.
    pub leads: Arc<leads::Repository>,

    /// Scheduled action repository.
    pub scheduled_actions: Arc<scheduled_actions::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a storage instance over `pool`.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            leads: Arc::new(leads::Repository::new(pool.clone())),
            scheduled_actions: Arc::new(scheduled_actions::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Starts a transaction on the shared pool.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if no connection can be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Creates any missing tables and indexes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if a statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        schema::ensure(&self.pool).await
    }

    /// Verifies database connectivity with `SELECT 1`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}
