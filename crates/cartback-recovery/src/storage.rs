//! Storage seam between the lifecycle engine and PostgreSQL.
//!
//! The engine and scheduler only talk to [`LeadStorage`]. Production uses
//! [`PostgresLeadStorage`] over `cartback_core::storage::Storage`; tests use
//! the in-memory [`mock::MockLeadStorage`] so lifecycle scenarios run
//! without a database.

use std::{future::Future, pin::Pin, sync::Arc};

use cartback_core::{
    error::Result,
    models::{ActionId, ActionStatus, Lead, LeadEmail, ScheduledAction},
};
use chrono::{DateTime, Duration, Utc};

/// Boxed future returned by every storage operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence operations needed by the lifecycle engine and scheduler.
pub trait LeadStorage: Send + Sync + 'static {
    /// Finds a lead by exact email.
    fn find_lead(&self, email: LeadEmail) -> StoreFuture<'_, Option<Lead>>;

    /// Creates a lead and its verification action atomically.
    ///
    /// Returns `false` (and writes nothing) when the email already exists.
    fn create_lead(&self, lead: Lead, verify: ScheduledAction) -> StoreFuture<'_, bool>;

    /// Moves a lead to purchased. Idempotent.
    ///
    /// Returns `false` when no lead exists for the email.
    fn mark_purchased(&self, email: LeadEmail, at: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// Moves a lead from initiated to in-recovery and schedules `reminders`
    /// in the same transaction.
    ///
    /// Returns `false` without scheduling anything when the lead is no
    /// longer initiated.
    fn begin_recovery(
        &self,
        email: LeadEmail,
        at: DateTime<Utc>,
        reminders: Vec<ScheduledAction>,
    ) -> StoreFuture<'_, bool>;

    /// Claims due actions, marking them running.
    ///
    /// Running actions whose claim is older than `lease` count as due.
    fn claim_due_actions(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreFuture<'_, Vec<ScheduledAction>>;

    /// Records a finished status (`completed`, `skipped` or `failed`).
    fn finish_action(
        &self,
        id: ActionId,
        status: ActionStatus,
        last_error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()>;

    /// Returns a claimed action to pending with a new fire time.
    fn reschedule_action(
        &self,
        id: ActionId,
        fire_at: DateTime<Utc>,
        last_error: String,
    ) -> StoreFuture<'_, ()>;

    /// Returns every running action to pending. Startup only.
    fn recover_stalled(&self) -> StoreFuture<'_, u64>;

    /// Lists actions for a lead, earliest first.
    fn actions_for_lead(&self, email: LeadEmail) -> StoreFuture<'_, Vec<ScheduledAction>>;

    /// Checks store connectivity.
    fn health_check(&self) -> StoreFuture<'_, ()>;
}

/// PostgreSQL implementation over the core repositories.
pub struct PostgresLeadStorage {
    storage: Arc<cartback_core::storage::Storage>,
}

impl PostgresLeadStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<cartback_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl LeadStorage for PostgresLeadStorage {
    fn find_lead(&self, email: LeadEmail) -> StoreFuture<'_, Option<Lead>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.leads.find_by_email(&email).await })
    }

    fn create_lead(&self, lead: Lead, verify: ScheduledAction) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            let mut tx = storage.begin().await?;

            if !storage.leads.insert_if_absent_in_tx(&mut tx, &lead).await? {
                tx.rollback().await?;
                return Ok(false);
            }
            storage.scheduled_actions.create_in_tx(&mut tx, &verify).await?;

            tx.commit().await?;
            Ok(true)
        })
    }

    fn mark_purchased(&self, email: LeadEmail, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.leads.mark_purchased(&email, at).await })
    }

    fn begin_recovery(
        &self,
        email: LeadEmail,
        at: DateTime<Utc>,
        reminders: Vec<ScheduledAction>,
    ) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            let mut tx = storage.begin().await?;

            if !storage.leads.mark_in_recovery_in_tx(&mut tx, &email, at).await? {
                tx.rollback().await?;
                return Ok(false);
            }
            for reminder in &reminders {
                storage.scheduled_actions.create_in_tx(&mut tx, reminder).await?;
            }

            tx.commit().await?;
            Ok(true)
        })
    }

    fn claim_due_actions(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreFuture<'_, Vec<ScheduledAction>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_actions.claim_due(batch_size, now, lease).await })
    }

    fn finish_action(
        &self,
        id: ActionId,
        status: ActionStatus,
        last_error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.scheduled_actions.finish(id, status, last_error.as_deref(), at).await
        })
    }

    fn reschedule_action(
        &self,
        id: ActionId,
        fire_at: DateTime<Utc>,
        last_error: String,
    ) -> StoreFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_actions.reschedule(id, fire_at, &last_error).await })
    }

    fn recover_stalled(&self) -> StoreFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_actions.recover_stalled().await })
    }

    fn actions_for_lead(&self, email: LeadEmail) -> StoreFuture<'_, Vec<ScheduledAction>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_actions.find_by_lead(&email).await })
    }

    fn health_check(&self) -> StoreFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.health_check().await })
    }
}

pub mod mock {
    //! In-memory storage for lifecycle tests.
    //!
    //! Mirrors the PostgreSQL semantics the engine depends on: unique
    //! emails, unique (lead, kind) actions, the conditional recovery
    //! transition and lease-based claiming.

    use std::{collections::HashMap, sync::Arc};

    use cartback_core::{
        error::{CoreError, Result},
        models::{ActionKind, LeadStatus},
    };
    use chrono::{DateTime, Duration, Utc};
    use tokio::sync::RwLock;

    use super::{ActionId, ActionStatus, Lead, LeadEmail, LeadStorage, ScheduledAction, StoreFuture};

    #[derive(Default)]
    struct State {
        leads: HashMap<LeadEmail, Lead>,
        actions: HashMap<ActionId, ScheduledAction>,
    }

    impl State {
        fn has_action(&self, email: &LeadEmail, kind: ActionKind) -> bool {
            self.actions.values().any(|a| &a.lead_email == email && a.kind == kind)
        }
    }

    /// In-memory lead store with failure injection.
    #[derive(Clone, Default)]
    pub struct MockLeadStorage {
        state: Arc<RwLock<State>>,
        claim_error: Arc<RwLock<Option<String>>>,
        unavailable: Arc<RwLock<bool>>,
        latency: Arc<RwLock<std::time::Duration>>,
    }

    impl MockLeadStorage {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next claim fail with a database error.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Makes every operation fail until switched back.
        pub async fn set_unavailable(&self, unavailable: bool) {
            *self.unavailable.write().await = unavailable;
        }

        /// Delays every operation by `latency`.
        pub async fn set_latency(&self, latency: std::time::Duration) {
            *self.latency.write().await = latency;
        }

        /// Inserts a lead directly, bypassing capture.
        pub async fn insert_lead(&self, lead: Lead) {
            self.state.write().await.leads.insert(lead.email.clone(), lead);
        }

        /// Inserts an action directly, bypassing the engine.
        pub async fn insert_action(&self, action: ScheduledAction) {
            self.state.write().await.actions.insert(action.id, action);
        }

        /// Current status of a lead, if any.
        pub async fn lead_status(&self, email: &LeadEmail) -> Option<LeadStatus> {
            self.state.read().await.leads.get(email).map(|l| l.status)
        }

        /// Number of stored leads.
        pub async fn lead_count(&self) -> usize {
            self.state.read().await.leads.len()
        }

        /// Every stored action, earliest fire time first.
        pub async fn all_actions(&self) -> Vec<ScheduledAction> {
            let mut actions: Vec<_> = self.state.read().await.actions.values().cloned().collect();
            actions.sort_by_key(|a| (a.fire_at, a.kind.reminder_number()));
            actions
        }

        async fn check_available(&self) -> Result<()> {
            let latency = *self.latency.read().await;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if *self.unavailable.read().await {
                return Err(CoreError::Database("connection refused".to_string()));
            }
            Ok(())
        }
    }

    impl LeadStorage for MockLeadStorage {
        fn find_lead(&self, email: LeadEmail) -> StoreFuture<'_, Option<Lead>> {
            Box::pin(async move {
                self.check_available().await?;
                Ok(self.state.read().await.leads.get(&email).cloned())
            })
        }

        fn create_lead(&self, lead: Lead, verify: ScheduledAction) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                self.check_available().await?;
                let mut state = self.state.write().await;

                if state.leads.contains_key(&lead.email) {
                    return Ok(false);
                }
                if !state.has_action(&verify.lead_email, verify.kind) {
                    state.actions.insert(verify.id, verify);
                }
                state.leads.insert(lead.email.clone(), lead);

                Ok(true)
            })
        }

        fn mark_purchased(&self, email: LeadEmail, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                self.check_available().await?;
                let mut state = self.state.write().await;

                let Some(lead) = state.leads.get_mut(&email) else {
                    return Ok(false);
                };
                if lead.status != LeadStatus::Purchased {
                    lead.status = LeadStatus::Purchased;
                    lead.updated_at = at;
                }
                lead.purchased_at.get_or_insert(at);

                Ok(true)
            })
        }

        fn begin_recovery(
            &self,
            email: LeadEmail,
            at: DateTime<Utc>,
            reminders: Vec<ScheduledAction>,
        ) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                self.check_available().await?;
                let mut state = self.state.write().await;

                match state.leads.get_mut(&email) {
                    Some(lead) if lead.status == LeadStatus::Initiated => {
                        lead.status = LeadStatus::InRecovery;
                        lead.updated_at = at;
                    },
                    _ => return Ok(false),
                }
                for reminder in reminders {
                    if !state.has_action(&reminder.lead_email, reminder.kind) {
                        state.actions.insert(reminder.id, reminder);
                    }
                }

                Ok(true)
            })
        }

        fn claim_due_actions(
            &self,
            batch_size: usize,
            now: DateTime<Utc>,
            lease: Duration,
        ) -> StoreFuture<'_, Vec<ScheduledAction>> {
            Box::pin(async move {
                if let Some(error) = self.claim_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }
                self.check_available().await?;

                let lease_cutoff = now - lease;
                let mut state = self.state.write().await;

                let mut due: Vec<&mut ScheduledAction> = state
                    .actions
                    .values_mut()
                    .filter(|a| match a.status {
                        ActionStatus::Pending => a.fire_at <= now,
                        ActionStatus::Running => a.claimed_at.is_some_and(|c| c < lease_cutoff),
                        _ => false,
                    })
                    .collect();
                due.sort_by_key(|a| a.fire_at);

                let claimed = due
                    .into_iter()
                    .take(batch_size)
                    .map(|action| {
                        action.status = ActionStatus::Running;
                        action.attempts += 1;
                        action.claimed_at = Some(now);
                        action.clone()
                    })
                    .collect();

                Ok(claimed)
            })
        }

        fn finish_action(
            &self,
            id: ActionId,
            status: ActionStatus,
            last_error: Option<String>,
            at: DateTime<Utc>,
        ) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.check_available().await?;
                if let Some(action) = self.state.write().await.actions.get_mut(&id) {
                    action.status = status;
                    if last_error.is_some() {
                        action.last_error = last_error;
                    }
                    action.completed_at = Some(at);
                    action.claimed_at = None;
                }
                Ok(())
            })
        }

        fn reschedule_action(
            &self,
            id: ActionId,
            fire_at: DateTime<Utc>,
            last_error: String,
        ) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.check_available().await?;
                if let Some(action) = self.state.write().await.actions.get_mut(&id) {
                    action.status = ActionStatus::Pending;
                    action.fire_at = fire_at;
                    action.last_error = Some(last_error);
                    action.claimed_at = None;
                }
                Ok(())
            })
        }

        fn recover_stalled(&self) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                self.check_available().await?;
                let mut recovered = 0;
                for action in self.state.write().await.actions.values_mut() {
                    if action.status == ActionStatus::Running {
                        action.status = ActionStatus::Pending;
                        action.claimed_at = None;
                        recovered += 1;
                    }
                }
                Ok(recovered)
            })
        }

        fn actions_for_lead(&self, email: LeadEmail) -> StoreFuture<'_, Vec<ScheduledAction>> {
            Box::pin(async move {
                self.check_available().await?;
                let mut actions: Vec<_> = self
                    .state
                    .read()
                    .await
                    .actions
                    .values()
                    .filter(|a| a.lead_email == email)
                    .cloned()
                    .collect();
                actions.sort_by_key(|a| (a.fire_at, a.kind.reminder_number()));
                Ok(actions)
            })
        }

        fn health_check(&self) -> StoreFuture<'_, ()> {
            Box::pin(async move { self.check_available().await })
        }
    }

    #[cfg(test)]
    mod tests {
        use cartback_core::models::ActionKind;

        use super::*;

        fn email(raw: &str) -> LeadEmail {
            LeadEmail::parse(raw).unwrap()
        }

        #[tokio::test]
        async fn duplicate_lead_is_rejected() {
            let store = MockLeadStorage::new();
            let now = Utc::now();
            let e = email("a@x.com");

            let verify = ScheduledAction::new(e.clone(), ActionKind::VerifyPurchase, now, now);
            assert!(store.create_lead(Lead::new(e.clone(), now), verify.clone()).await.unwrap());
            assert!(!store.create_lead(Lead::new(e.clone(), now), verify).await.unwrap());

            assert_eq!(store.lead_count().await, 1);
            assert_eq!(store.all_actions().await.len(), 1);
        }

        #[tokio::test]
        async fn recovery_does_not_overwrite_purchase() {
            let store = MockLeadStorage::new();
            let now = Utc::now();
            let e = email("a@x.com");
            store.insert_lead(Lead::new(e.clone(), now)).await;

            assert!(store.mark_purchased(e.clone(), now).await.unwrap());
            let reminder = ScheduledAction::new(e.clone(), ActionKind::SendReminder(1), now, now);
            assert!(!store.begin_recovery(e.clone(), now, vec![reminder]).await.unwrap());

            assert_eq!(store.lead_status(&e).await, Some(LeadStatus::Purchased));
            assert!(store.all_actions().await.is_empty());
        }

        #[tokio::test]
        async fn expired_leases_are_reclaimed() {
            let store = MockLeadStorage::new();
            let now = Utc::now();
            let mut action =
                ScheduledAction::new(email("a@x.com"), ActionKind::VerifyPurchase, now, now);
            action.status = ActionStatus::Running;
            action.claimed_at = Some(now - Duration::minutes(10));
            store.insert_action(action).await;

            let fresh = store.claim_due_actions(10, now, Duration::minutes(15)).await.unwrap();
            assert!(fresh.is_empty());

            let reclaimed = store.claim_due_actions(10, now, Duration::minutes(5)).await.unwrap();
            assert_eq!(reclaimed.len(), 1);
            assert_eq!(reclaimed[0].attempts, 1);
        }

        #[tokio::test]
        async fn claim_error_is_consumed_once() {
            let store = MockLeadStorage::new();
            store.inject_claim_error("deadlock detected").await;

            let now = Utc::now();
            assert!(store.claim_due_actions(1, now, Duration::minutes(5)).await.is_err());
            assert!(store.claim_due_actions(1, now, Duration::minutes(5)).await.is_ok());
        }
    }
}
