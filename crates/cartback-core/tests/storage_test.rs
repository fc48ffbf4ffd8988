//! Repository tests against a real PostgreSQL server.
//!
//! Each test creates its own database from `DATABASE_URL` and drops it at
//! the end. Without `DATABASE_URL` the tests return early.

use std::collections::HashSet;

use cartback_core::{
    models::{ActionKind, ActionStatus, Lead, LeadEmail, LeadStatus, ScheduledAction},
    storage::{schema, Storage},
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use uuid::Uuid;

struct TestDatabase {
    storage: Storage,
    admin_options: PgConnectOptions,
    database_name: String,
}

impl TestDatabase {
    /// Creates a fresh database with the schema applied, or `None` when no
    /// server is configured.
    async fn create() -> Option<Self> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set, skipping PostgreSQL test");
            return None;
        };
        let admin_options: PgConnectOptions = url.parse().expect("invalid DATABASE_URL");
        let database_name = format!("cartback_test_{}", Uuid::new_v4().simple());

        let admin_pool = admin_pool(&admin_options).await;
        sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
            .execute(&admin_pool)
            .await
            .expect("failed to create test database");
        admin_pool.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect_with(admin_options.clone().database(&database_name))
            .await
            .expect("failed to connect to test database");
        schema::ensure(&pool).await.expect("failed to create schema");

        Some(Self { storage: Storage::new(pool), admin_options, database_name })
    }

    async fn drop_database(self) {
        self.storage.pool().close().await;

        let admin_pool = admin_pool(&self.admin_options).await;
        let _ = sqlx::query(&format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.database_name
        ))
        .execute(&admin_pool)
        .await;
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\"", self.database_name))
            .execute(&admin_pool)
            .await
            .expect("failed to drop test database");
        admin_pool.close().await;
    }
}

async fn admin_pool(options: &PgConnectOptions) -> PgPool {
    PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect_with(options.clone())
        .await
        .expect("failed to connect to PostgreSQL")
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap()
}

fn email(raw: &str) -> LeadEmail {
    LeadEmail::parse(raw).unwrap()
}

/// Inserts a lead with its verification action, as capture does.
async fn capture(storage: &Storage, raw: &str, verify_at: DateTime<Utc>) -> ScheduledAction {
    let lead = Lead::new(email(raw), t0());
    let verify = ScheduledAction::new(email(raw), ActionKind::VerifyPurchase, verify_at, t0());

    let mut tx = storage.begin().await.unwrap();
    assert!(storage.leads.insert_if_absent_in_tx(&mut tx, &lead).await.unwrap());
    assert!(storage.scheduled_actions.create_in_tx(&mut tx, &verify).await.unwrap());
    tx.commit().await.unwrap();

    verify
}

#[tokio::test]
async fn schema_can_be_applied_twice() {
    let Some(db) = TestDatabase::create().await else { return };

    db.storage.ensure_schema().await.unwrap();
    db.storage.health_check().await.unwrap();

    db.drop_database().await;
}

#[tokio::test]
async fn duplicate_email_is_not_inserted() {
    let Some(db) = TestDatabase::create().await else { return };
    capture(&db.storage, "a@x.com", t0()).await;

    let later = Lead::new(email("a@x.com"), t0() + Duration::hours(1));
    let mut tx = db.storage.begin().await.unwrap();
    let inserted = db.storage.leads.insert_if_absent_in_tx(&mut tx, &later).await.unwrap();
    tx.commit().await.unwrap();

    assert!(!inserted);
    let stored = db.storage.leads.find_by_email(&email("a@x.com")).await.unwrap().unwrap();
    assert_eq!(stored.captured_at, t0());
    assert_eq!(stored.status, LeadStatus::Initiated);

    db.drop_database().await;
}

#[tokio::test]
async fn same_kind_and_number_is_scheduled_once() {
    let Some(db) = TestDatabase::create().await else { return };
    capture(&db.storage, "a@x.com", t0()).await;

    let reminder = |at| ScheduledAction::new(email("a@x.com"), ActionKind::SendReminder(1), at, t0());
    let mut tx = db.storage.begin().await.unwrap();
    let first = db.storage.scheduled_actions.create_in_tx(&mut tx, &reminder(t0())).await.unwrap();
    let second = db
        .storage
        .scheduled_actions
        .create_in_tx(&mut tx, &reminder(t0() + Duration::days(1)))
        .await
        .unwrap();
    let other = db
        .storage
        .scheduled_actions
        .create_in_tx(
            &mut tx,
            &ScheduledAction::new(email("a@x.com"), ActionKind::SendReminder(2), t0(), t0()),
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(first);
    assert!(!second);
    assert!(other);
    assert_eq!(db.storage.scheduled_actions.find_by_lead(&email("a@x.com")).await.unwrap().len(), 3);

    db.drop_database().await;
}

#[tokio::test]
async fn claim_takes_only_due_actions_and_counts_attempts() {
    let Some(db) = TestDatabase::create().await else { return };
    let due = capture(&db.storage, "due@x.com", t0()).await;
    capture(&db.storage, "later@x.com", t0() + Duration::minutes(20)).await;

    let claimed =
        db.storage.scheduled_actions.claim_due(10, t0(), Duration::minutes(5)).await.unwrap();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, due.id);
    assert_eq!(claimed[0].status, ActionStatus::Running);
    assert_eq!(claimed[0].attempts, 1);
    assert_eq!(claimed[0].claimed_at, Some(t0()));

    let again =
        db.storage.scheduled_actions.claim_due(10, t0(), Duration::minutes(5)).await.unwrap();
    assert!(again.is_empty());

    db.drop_database().await;
}

#[tokio::test]
async fn claim_respects_batch_size_and_fire_order() {
    let Some(db) = TestDatabase::create().await else { return };
    let early = capture(&db.storage, "early@x.com", t0() - Duration::minutes(10)).await;
    capture(&db.storage, "mid@x.com", t0() - Duration::minutes(5)).await;
    capture(&db.storage, "late@x.com", t0()).await;

    let claimed =
        db.storage.scheduled_actions.claim_due(1, t0(), Duration::minutes(5)).await.unwrap();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, early.id);

    db.drop_database().await;
}

#[tokio::test]
async fn expired_lease_is_claimable_again() {
    let Some(db) = TestDatabase::create().await else { return };
    let action = capture(&db.storage, "a@x.com", t0()).await;
    let lease = Duration::minutes(5);
    let repo = &db.storage.scheduled_actions;

    assert_eq!(repo.claim_due(10, t0(), lease).await.unwrap().len(), 1);
    assert!(repo.claim_due(10, t0() + Duration::minutes(1), lease).await.unwrap().is_empty());

    let reclaimed = repo.claim_due(10, t0() + Duration::minutes(6), lease).await.unwrap();

    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, action.id);
    assert_eq!(reclaimed[0].attempts, 2);

    db.drop_database().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_claims_never_share_an_action() {
    let Some(db) = TestDatabase::create().await else { return };
    for i in 0..20 {
        capture(&db.storage, &format!("lead{i}@x.com"), t0()).await;
    }
    let repo = db.storage.scheduled_actions.clone();
    let other = db.storage.scheduled_actions.clone();

    let (a, b) = tokio::join!(
        tokio::spawn(async move { repo.claim_due(15, t0(), Duration::minutes(5)).await }),
        tokio::spawn(async move { other.claim_due(15, t0(), Duration::minutes(5)).await }),
    );
    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();

    let ids: HashSet<_> = a.iter().chain(&b).map(|action| action.id).collect();
    assert_eq!(ids.len(), a.len() + b.len());
    assert_eq!(ids.len(), 20);

    db.drop_database().await;
}

#[tokio::test]
async fn finish_and_reschedule_release_the_claim() {
    let Some(db) = TestDatabase::create().await else { return };
    let first = capture(&db.storage, "a@x.com", t0()).await;
    let second = capture(&db.storage, "b@x.com", t0()).await;
    let repo = &db.storage.scheduled_actions;
    repo.claim_due(10, t0(), Duration::minutes(5)).await.unwrap();

    repo.finish(first.id, ActionStatus::Failed, Some("provider down"), t0()).await.unwrap();
    repo.reschedule(second.id, t0() + Duration::minutes(2), "verifier timeout").await.unwrap();

    let finished = repo.find_by_lead(&email("a@x.com")).await.unwrap().remove(0);
    assert_eq!(finished.status, ActionStatus::Failed);
    assert_eq!(finished.last_error.as_deref(), Some("provider down"));
    assert_eq!(finished.completed_at, Some(t0()));
    assert!(finished.claimed_at.is_none());

    let pending = repo.find_by_lead(&email("b@x.com")).await.unwrap().remove(0);
    assert_eq!(pending.status, ActionStatus::Pending);
    assert_eq!(pending.fire_at, t0() + Duration::minutes(2));
    assert_eq!(pending.attempts, 1);

    assert!(repo.claim_due(10, t0() + Duration::minutes(1), Duration::minutes(5)).await.unwrap().is_empty());
    let retried = repo.claim_due(10, t0() + Duration::minutes(2), Duration::minutes(5)).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].id, second.id);
    assert_eq!(retried[0].attempts, 2);

    db.drop_database().await;
}

#[tokio::test]
async fn recover_stalled_requeues_running_actions() {
    let Some(db) = TestDatabase::create().await else { return };
    capture(&db.storage, "a@x.com", t0()).await;
    capture(&db.storage, "b@x.com", t0()).await;
    capture(&db.storage, "c@x.com", t0() + Duration::days(1)).await;
    let repo = &db.storage.scheduled_actions;
    repo.claim_due(10, t0(), Duration::minutes(5)).await.unwrap();

    assert_eq!(repo.recover_stalled().await.unwrap(), 2);

    let reclaimed = repo.claim_due(10, t0(), Duration::minutes(5)).await.unwrap();
    assert_eq!(reclaimed.len(), 2);
    assert!(reclaimed.iter().all(|action| action.attempts == 2));

    db.drop_database().await;
}

#[tokio::test]
async fn purchase_keeps_the_first_purchase_time() {
    let Some(db) = TestDatabase::create().await else { return };
    capture(&db.storage, "a@x.com", t0()).await;
    let leads = &db.storage.leads;

    assert!(leads.mark_purchased(&email("a@x.com"), t0() + Duration::hours(1)).await.unwrap());
    assert!(leads.mark_purchased(&email("a@x.com"), t0() + Duration::hours(2)).await.unwrap());
    assert!(!leads.mark_purchased(&email("nobody@x.com"), t0()).await.unwrap());

    let lead = leads.find_by_email(&email("a@x.com")).await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Purchased);
    assert_eq!(lead.purchased_at, Some(t0() + Duration::hours(1)));
    assert_eq!(lead.updated_at, t0() + Duration::hours(1));
    assert!(leads.find_by_email(&email("nobody@x.com")).await.unwrap().is_none());

    db.drop_database().await;
}

#[tokio::test]
async fn recovery_cannot_start_after_purchase() {
    let Some(db) = TestDatabase::create().await else { return };
    capture(&db.storage, "bought@x.com", t0()).await;
    capture(&db.storage, "abandoned@x.com", t0()).await;
    let leads = &db.storage.leads;
    leads.mark_purchased(&email("bought@x.com"), t0()).await.unwrap();

    let mut tx = db.storage.begin().await.unwrap();
    let lost = leads.mark_in_recovery_in_tx(&mut tx, &email("bought@x.com"), t0()).await.unwrap();
    let won = leads.mark_in_recovery_in_tx(&mut tx, &email("abandoned@x.com"), t0()).await.unwrap();
    let twice =
        leads.mark_in_recovery_in_tx(&mut tx, &email("abandoned@x.com"), t0()).await.unwrap();
    tx.commit().await.unwrap();

    assert!(!lost);
    assert!(won);
    assert!(!twice);
    let bought = leads.find_by_email(&email("bought@x.com")).await.unwrap().unwrap();
    assert_eq!(bought.status, LeadStatus::Purchased);
    let abandoned = leads.find_by_email(&email("abandoned@x.com")).await.unwrap().unwrap();
    assert_eq!(abandoned.status, LeadStatus::InRecovery);

    db.drop_database().await;
}
