//! Greedy FIFO packer.
//!
//! Runs periodically per check-type: coalesces queued emails across user
//! batches into provider batches, oldest user batch first, under the
//! concurrent-batch cap and the create-batch rate budget. A user batch larger
//! than the per-batch cap spans multiple provider batches across cycles;
//! smaller user batches coalesce into one.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::governor::RateGovernor;
use crate::provider::VerificationProvider;
use crate::store::{Assignment, NewProviderBatch, Store};
use crate::types::{CheckType, RequestKind};

pub struct Packer<S, P> {
    store: Arc<S>,
    provider: Arc<P>,
    governor: Arc<RateGovernor<S>>,
    config: EngineConfig,
    check_type: CheckType,
}

impl<S, P> Packer<S, P>
where
    S: Store + 'static,
    P: VerificationProvider + 'static,
{
    pub fn new(
        store: Arc<S>,
        provider: Arc<P>,
        governor: Arc<RateGovernor<S>>,
        config: EngineConfig,
        check_type: CheckType,
    ) -> Self {
        Self {
            store,
            provider,
            governor,
            config,
            check_type,
        }
    }

    /// Run the packer loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(check_type = %self.check_type, "Starting packer loop");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.pack_cycle().await {
                        Ok(created) if created > 0 => {
                            tracing::debug!(check_type = %self.check_type, created, "Packer cycle finished");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(check_type = %self.check_type, error = %e, "Packer cycle failed");
                        }
                    }
                    // Counter hygiene; correctness never depends on it.
                    if let Err(e) = self.governor.prune().await {
                        tracing::debug!(error = %e, "Rate counter pruning failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!(check_type = %self.check_type, "Packer loop shutting down");
                    return;
                }
            }
        }
    }

    /// One scheduling cycle. Returns the number of provider batches created.
    #[tracing::instrument(skip(self), fields(check_type = %self.check_type))]
    pub async fn pack_cycle(&self) -> Result<usize> {
        let open = self.store.count_open_provider_batches(self.check_type).await?;
        let mut capacity = self
            .config
            .max_concurrent_provider_batches
            .saturating_sub(open.max(0) as usize);
        let mut created = 0;

        while capacity > 0 {
            let decision = self
                .governor
                .check(self.check_type, RequestKind::CreateBatch)
                .await?;
            if !decision.can_proceed {
                tracing::debug!(
                    current = decision.current,
                    limit = decision.limit,
                    "Create-batch budget exhausted, deferring"
                );
                break;
            }

            let pool = self
                .store
                .fetch_packable(self.check_type, self.config.max_emails_per_provider_batch as i64)
                .await?;
            if pool.is_empty() {
                break;
            }

            let emails: Vec<String> = pool.iter().map(|p| p.email_stripped.clone()).collect();
            let provider_batch_id = match self.provider.create_batch(self.check_type, &emails).await
            {
                Ok(id) => id,
                Err(e) => {
                    // Nothing was assigned; the pool is retried next cycle.
                    tracing::warn!(error = %e, "Provider batch submission failed");
                    break;
                }
            };

            // Pool order is FIFO, so the first row belongs to the oldest batch.
            let primary_batch_id = pool[0].batch_id;
            let assignments: Vec<Assignment> = pool
                .iter()
                .map(|p| Assignment {
                    email_id: p.email_id,
                    batch_id: p.batch_id,
                })
                .collect();
            let email_count = assignments.len();

            self.store
                .record_provider_batch(NewProviderBatch {
                    provider_batch_id: provider_batch_id.clone(),
                    check_type: self.check_type,
                    primary_batch_id,
                    assignments,
                })
                .await?;
            self.governor
                .record(self.check_type, RequestKind::CreateBatch, 1)
                .await?;

            tracing::info!(
                provider_batch_id = %provider_batch_id,
                email_count,
                primary_batch_id = %primary_batch_id,
                "Submitted provider batch"
            );

            capacity -= 1;
            created += 1;
        }

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::provider::{MockCall, MockProvider};
    use crate::store::InMemoryStore;
    use crate::test_support::*;

    fn packer(
        store: &Arc<InMemoryStore>,
        provider: &Arc<MockProvider>,
        config: EngineConfig,
    ) -> Packer<InMemoryStore, MockProvider> {
        let governor = Arc::new(RateGovernor::new(store.clone(), &config));
        Packer::new(
            store.clone(),
            provider.clone(),
            governor,
            config,
            CheckType::Deliverable,
        )
    }

    fn submitted_emails(provider: &MockProvider) -> Vec<Vec<String>> {
        provider
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::CreateBatch { emails, .. } => Some(emails),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn coalesces_across_user_batches_fifo() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());

        let older = started_batch(&store, user(), CheckType::Deliverable, &addresses("older", 3)).await;
        let newer = started_batch(&store, user(), CheckType::Deliverable, &addresses("newer", 4)).await;

        let created = packer(&store, &provider, engine_config())
            .pack_cycle()
            .await
            .unwrap();
        assert_eq!(created, 1);

        let submissions = submitted_emails(&provider);
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].len(), 7);
        // FIFO at user-batch granularity: the older batch's emails lead.
        assert!(submissions[0][0].starts_with("older"));
        assert!(submissions[0][3].starts_with("newer"));

        // Primary user batch is the older one.
        let open = store
            .list_open_provider_batches(CheckType::Deliverable)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].primary_batch_id, older.id);
        assert_eq!(open[0].email_count, 7);

        // Both owning batches advanced to processing.
        for id in [older.id, newer.id] {
            assert_eq!(
                store.get_batch(id).await.unwrap().status,
                crate::types::BatchStatus::Processing
            );
        }
    }

    #[tokio::test]
    async fn oversized_batch_spans_cycles() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let config = EngineConfig {
            max_emails_per_provider_batch: 10,
            max_concurrent_provider_batches: 1,
            ..engine_config()
        };

        started_batch(&store, user(), CheckType::Deliverable, &addresses("big", 15)).await;
        let packer = packer(&store, &provider, config);

        // First cycle: one full provider batch, then capacity is exhausted.
        assert_eq!(packer.pack_cycle().await.unwrap(), 1);
        assert_eq!(packer.pack_cycle().await.unwrap(), 0);

        let submissions = submitted_emails(&provider);
        assert_eq!(submissions[0].len(), 10);

        // Completing the in-flight batch frees capacity for the remainder.
        let open = store
            .list_open_provider_batches(CheckType::Deliverable)
            .await
            .unwrap();
        let records: Vec<_> = submissions[0]
            .iter()
            .map(|e| deliverable_record(e, "deliverable", "accepted", false, "google"))
            .collect();
        store
            .apply_provider_results(&open[0].provider_batch_id, &records)
            .await
            .unwrap();

        assert_eq!(packer.pack_cycle().await.unwrap(), 1);
        let submissions = submitted_emails(&provider);
        assert_eq!(submissions[1].len(), 5);
    }

    #[tokio::test]
    async fn respects_concurrent_batch_cap() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let config = EngineConfig {
            max_emails_per_provider_batch: 1,
            max_concurrent_provider_batches: 2,
            ..engine_config()
        };

        started_batch(&store, user(), CheckType::Deliverable, &addresses("cap", 6)).await;
        let packer = packer(&store, &provider, config);

        assert_eq!(packer.pack_cycle().await.unwrap(), 2);
        assert_eq!(
            store
                .count_open_provider_batches(CheckType::Deliverable)
                .await
                .unwrap(),
            2
        );
        // Cap reached: further cycles create nothing.
        assert_eq!(packer.pack_cycle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rate_limit_pressure_allows_exactly_one_more() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let config = EngineConfig {
            max_emails_per_provider_batch: 1,
            ..engine_config()
        };
        let governor = Arc::new(RateGovernor::new(store.clone(), &config));
        let packer = Packer::new(
            store.clone(),
            provider.clone(),
            governor.clone(),
            config,
            CheckType::Deliverable,
        );

        started_batch(&store, user(), CheckType::Deliverable, &addresses("rl", 5)).await;

        // 179 creates already recorded in the window: budget for exactly one.
        governor
            .record(CheckType::Deliverable, RequestKind::CreateBatch, 179)
            .await
            .unwrap();

        assert_eq!(packer.pack_cycle().await.unwrap(), 1);
        // The following cycle's check fails and the packer sleeps.
        assert_eq!(packer.pack_cycle().await.unwrap(), 0);
        assert_eq!(provider.created_batches(), 1);
    }

    #[tokio::test]
    async fn excludes_inflight_paused_and_cached_emails() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let config = engine_config();

        started_batch(&store, user(), CheckType::Deliverable, &addresses("x", 4)).await;
        let packer = packer(&store, &provider, config);

        assert_eq!(packer.pack_cycle().await.unwrap(), 1);
        // Everything is in flight now; nothing left to pack.
        assert_eq!(packer.pack_cycle().await.unwrap(), 0);

        // A paused batch contributes nothing either.
        let paused = started_batch(&store, user(), CheckType::Deliverable, &addresses("y", 2)).await;
        service(&store).pause_batch(paused.id).await.unwrap();
        assert_eq!(packer.pack_cycle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_submission_assigns_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        provider.script_create(Err(crate::provider::ProviderError::RateLimited));

        started_batch(&store, user(), CheckType::Deliverable, &addresses("f", 3)).await;
        let packer = packer(&store, &provider, engine_config());

        assert_eq!(packer.pack_cycle().await.unwrap(), 0);
        assert_eq!(
            store
                .count_open_provider_batches(CheckType::Deliverable)
                .await
                .unwrap(),
            0
        );

        // The pool is intact: the next cycle packs it with a healthy provider.
        assert_eq!(packer.pack_cycle().await.unwrap(), 1);
        let open = store
            .list_open_provider_batches(CheckType::Deliverable)
            .await
            .unwrap();
        assert_eq!(open[0].email_count, 3);
    }
}
