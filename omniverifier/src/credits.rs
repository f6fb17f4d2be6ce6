//! Credit account surface.
//!
//! Thin service over the store's ledger operations: advisory reservation
//! checks, purchases, referral rewards and subscription provisioning.
//! Authoritative deduction happens inside `start_batch`, not here.

use std::sync::Arc;

use crate::errors::Result;
use crate::store::{CreditHistoryEntry, CreditSummary, Store};
use crate::types::{CheckType, CreditEvent, Timestamp, UserId};

pub struct CreditService<S> {
    store: Arc<S>,
}

impl<S: Store> CreditService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Current balances across both pools.
    pub async fn summary(&self, user: UserId, check_type: CheckType) -> Result<CreditSummary> {
        self.store.credit_summary(user, check_type).await
    }

    /// Advisory check that `n` credits are available. No mutation.
    pub async fn reserve_only(
        &self,
        user: UserId,
        check_type: CheckType,
        n: i64,
    ) -> Result<(bool, i64)> {
        let summary = self.store.credit_summary(user, check_type).await?;
        Ok((summary.total() >= n, summary.total()))
    }

    /// Credit a purchase to the one-off pool.
    pub async fn purchase(&self, user: UserId, check_type: CheckType, amount: i64) -> Result<i64> {
        self.store
            .grant_credits(user, check_type, amount, CreditEvent::Purchase)
            .await
    }

    /// Credit a referral reward to the one-off pool.
    pub async fn referral_reward(
        &self,
        user: UserId,
        check_type: CheckType,
        amount: i64,
    ) -> Result<i64> {
        self.store
            .grant_credits(user, check_type, amount, CreditEvent::ReferReward)
            .await
    }

    /// Install or replace the subscription bucket for a check-type.
    pub async fn set_subscription(
        &self,
        user: UserId,
        check_type: CheckType,
        credits: i64,
        expires_at: Timestamp,
    ) -> Result<()> {
        self.store
            .set_subscription(user, check_type, credits, expires_at)
            .await
    }

    /// Ledger lines, newest first.
    pub async fn history(&self, user: UserId) -> Result<Vec<CreditHistoryEntry>> {
        self.store.credit_history(user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::test_support::user;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn reserve_only_sums_both_pools_without_mutating() {
        let store = Arc::new(InMemoryStore::new());
        let service = CreditService::new(store.clone());
        let owner = user();

        service
            .set_subscription(
                owner,
                CheckType::Deliverable,
                40,
                Utc::now() + Duration::days(30),
            )
            .await
            .unwrap();
        service.purchase(owner, CheckType::Deliverable, 10).await.unwrap();

        let (ok, total) = service
            .reserve_only(owner, CheckType::Deliverable, 50)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(total, 50);

        let (ok, total) = service
            .reserve_only(owner, CheckType::Deliverable, 51)
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(total, 50);

        // Reservation checks never consume anything.
        let summary = service.summary(owner, CheckType::Deliverable).await.unwrap();
        assert_eq!(summary.subscription_left, 40);
        assert_eq!(summary.one_off_balance, 10);
    }

    #[tokio::test]
    async fn grants_are_recorded_in_history() {
        let store = Arc::new(InMemoryStore::new());
        let service = CreditService::new(store.clone());
        let owner = user();

        service.purchase(owner, CheckType::Catchall, 100).await.unwrap();
        service
            .referral_reward(owner, CheckType::Catchall, 25)
            .await
            .unwrap();

        let history = service.history(owner).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, CreditEvent::ReferReward);
        assert_eq!(history[0].credits_used, 25);
        assert_eq!(history[1].event_type, CreditEvent::Purchase);
        assert_eq!(history[1].credits_used, 100);
    }
}
