//! Provider-batch lifecycle poller.
//!
//! Per check-type, polls every open provider batch oldest-first and drives
//! the state machine: progress replies advance `pending → processing`,
//! completion fetches and applies results, terminal errors fail the batch.
//! Rate-limit and server errors defer with capped exponential backoff;
//! payment-class errors dead-letter immediately; batches open beyond the
//! configured timeout are declared failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::completion::CompletionHooks;
use crate::config::EngineConfig;
use crate::errors::Result;
use crate::governor::RateGovernor;
use crate::provider::{ProviderBatchState, ProviderError, VerificationProvider};
use crate::store::{ProviderBatch, Store};
use crate::types::{CheckType, RequestKind};

pub struct LifecyclePoller<S, P> {
    store: Arc<S>,
    provider: Arc<P>,
    governor: Arc<RateGovernor<S>>,
    hooks: CompletionHooks,
    config: EngineConfig,
    check_type: CheckType,
}

impl<S, P> LifecyclePoller<S, P>
where
    S: Store + 'static,
    P: VerificationProvider + 'static,
{
    pub fn new(
        store: Arc<S>,
        provider: Arc<P>,
        governor: Arc<RateGovernor<S>>,
        hooks: CompletionHooks,
        config: EngineConfig,
        check_type: CheckType,
    ) -> Self {
        Self {
            store,
            provider,
            governor,
            hooks,
            config,
            check_type,
        }
    }

    /// Run the poller loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(check_type = %self.check_type, "Starting lifecycle poller");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_cycle().await {
                        tracing::error!(check_type = %self.check_type, error = %e, "Lifecycle poll cycle failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!(check_type = %self.check_type, "Lifecycle poller shutting down");
                    return;
                }
            }
        }
    }

    /// Exponential backoff after `attempts` consecutive poll failures.
    fn backoff_after(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16) as u32;
        let backoff = self
            .config
            .poll_backoff
            .saturating_mul(2u32.saturating_pow(exponent));
        backoff.min(self.config.max_poll_backoff)
    }

    /// One poll pass over every open provider batch.
    #[tracing::instrument(skip(self), fields(check_type = %self.check_type))]
    pub async fn poll_cycle(&self) -> Result<()> {
        let open = self.store.list_open_provider_batches(self.check_type).await?;
        let now = Utc::now();

        for batch in open {
            let age = (now - batch.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age > self.config.provider_batch_timeout {
                tracing::warn!(
                    provider_batch_id = %batch.provider_batch_id,
                    age_secs = age.as_secs(),
                    "Provider batch exceeded timeout, failing"
                );
                self.store
                    .fail_provider_batch(&batch.provider_batch_id)
                    .await?;
                continue;
            }

            // Respect the backoff window after failed polls.
            if batch.poll_attempts > 0 {
                let resume_at = batch.updated_at
                    + chrono::Duration::from_std(self.backoff_after(batch.poll_attempts))
                        .unwrap_or_default();
                if now < resume_at {
                    continue;
                }
            }

            let decision = self
                .governor
                .check(self.check_type, RequestKind::CheckStatus)
                .await?;
            if !decision.can_proceed {
                tracing::debug!("Status-poll budget exhausted, deferring remaining batches");
                break;
            }
            self.governor
                .record(self.check_type, RequestKind::CheckStatus, 1)
                .await?;

            match self
                .provider
                .check_status(self.check_type, &batch.provider_batch_id)
                .await
            {
                Ok(ProviderBatchState::Pending) => {}
                Ok(ProviderBatchState::Processing { processed }) => {
                    self.store
                        .mark_provider_progress(&batch.provider_batch_id, processed)
                        .await?;
                }
                Ok(ProviderBatchState::Completed) => {
                    self.ingest_results(&batch).await?;
                }
                Ok(ProviderBatchState::Failed { reason }) => {
                    tracing::warn!(
                        provider_batch_id = %batch.provider_batch_id,
                        reason = reason.as_deref().unwrap_or("unspecified"),
                        "Provider reported terminal batch failure"
                    );
                    self.store
                        .fail_provider_batch(&batch.provider_batch_id)
                        .await?;
                }
                Err(e) => self.handle_poll_error(&batch, e).await?,
            }
        }

        Ok(())
    }

    /// Download and apply a completion payload, then fire hooks for every
    /// user batch this application completed.
    async fn ingest_results(&self, batch: &ProviderBatch) -> Result<()> {
        let decision = self
            .governor
            .check(self.check_type, RequestKind::DownloadResults)
            .await?;
        if !decision.can_proceed {
            // The provider batch stays open; the next cycle sees Completed again.
            tracing::debug!(
                provider_batch_id = %batch.provider_batch_id,
                "Download budget exhausted, deferring result ingestion"
            );
            return Ok(());
        }
        self.governor
            .record(self.check_type, RequestKind::DownloadResults, 1)
            .await?;

        let records = match self
            .provider
            .download_results(self.check_type, &batch.provider_batch_id)
            .await
        {
            Ok(records) => records,
            Err(e) => return self.handle_poll_error(batch, e).await,
        };

        let outcome = self
            .store
            .apply_provider_results(&batch.provider_batch_id, &records)
            .await?;
        tracing::info!(
            provider_batch_id = %batch.provider_batch_id,
            applied = outcome.applied,
            skipped = outcome.skipped,
            completed_batches = outcome.completed.len(),
            "Applied provider results"
        );

        for completed in &outcome.completed {
            self.hooks.fire(completed).await;
        }
        Ok(())
    }

    async fn handle_poll_error(&self, batch: &ProviderBatch, error: ProviderError) -> Result<()> {
        match error {
            ProviderError::PaymentRequired(msg) => {
                tracing::error!(
                    provider_batch_id = %batch.provider_batch_id,
                    message = %msg,
                    "Provider requires payment; dead-lettering batch"
                );
                self.store
                    .fail_provider_batch(&batch.provider_batch_id)
                    .await?;
            }
            e if e.is_retriable() => {
                let attempts = self
                    .store
                    .bump_poll_attempts(&batch.provider_batch_id)
                    .await?;
                if attempts > self.config.max_poll_retries {
                    tracing::warn!(
                        provider_batch_id = %batch.provider_batch_id,
                        attempts,
                        error = %e,
                        "Retries exhausted, failing provider batch"
                    );
                    self.store
                        .fail_provider_batch(&batch.provider_batch_id)
                        .await?;
                } else {
                    tracing::warn!(
                        provider_batch_id = %batch.provider_batch_id,
                        attempts,
                        error = %e,
                        "Poll failed, backing off"
                    );
                }
            }
            e => {
                tracing::error!(
                    provider_batch_id = %batch.provider_batch_id,
                    error = %e,
                    "Terminal provider error, failing batch"
                );
                self.store
                    .fail_provider_batch(&batch.provider_batch_id)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::test_support::RecordingHook;
    use crate::provider::MockProvider;
    use crate::store::InMemoryStore;
    use crate::test_support::*;
    use crate::types::{BatchStatus, ProviderBatchStatus};

    struct Fixture {
        store: Arc<InMemoryStore>,
        provider: Arc<MockProvider>,
        hook: Arc<RecordingHook>,
        poller: Arc<LifecyclePoller<InMemoryStore, MockProvider>>,
        packer: crate::packer::Packer<InMemoryStore, MockProvider>,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let governor = Arc::new(RateGovernor::new(store.clone(), &config));
        let hook = Arc::new(RecordingHook::default());
        let hooks = crate::completion::CompletionHooks::new().with(hook.clone());
        let poller = Arc::new(LifecyclePoller::new(
            store.clone(),
            provider.clone(),
            governor.clone(),
            hooks,
            config.clone(),
            CheckType::Deliverable,
        ));
        let packer = crate::packer::Packer::new(
            store.clone(),
            provider.clone(),
            governor,
            config,
            CheckType::Deliverable,
        );
        Fixture {
            store,
            provider,
            hook,
            poller,
            packer,
        }
    }

    #[tokio::test]
    async fn completion_applies_results_and_fires_hook_once() {
        let f = fixture(engine_config());
        let batch =
            started_batch(&f.store, user(), CheckType::Deliverable, &addresses("ok", 3)).await;
        f.packer.pack_cycle().await.unwrap();

        let open = f
            .store
            .list_open_provider_batches(CheckType::Deliverable)
            .await
            .unwrap();
        let pb_id = open[0].provider_batch_id.clone();
        f.provider
            .script_status(pb_id.clone(), Ok(ProviderBatchState::Completed));
        let records: Vec<_> = addresses("ok", 3)
            .iter()
            .map(|e| deliverable_record(e, "deliverable", "accepted", false, "google"))
            .collect();
        f.provider.script_results(pb_id.clone(), Ok(records.clone()));

        f.poller.poll_cycle().await.unwrap();

        let completed = f.store.get_batch(batch.id).await.unwrap();
        assert_eq!(completed.status, BatchStatus::Completed);
        for assoc in f.store.get_batch_emails(batch.id).await.unwrap() {
            assert!(assoc.did_complete);
        }
        assert_eq!(f.hook.events.lock().len(), 1);

        // Applying the same completion payload again is a no-op.
        let duplicate = f
            .store
            .apply_provider_results(&pb_id, &records)
            .await
            .unwrap();
        assert_eq!(duplicate.applied, 0);
        assert!(duplicate.completed.is_empty());
        assert_eq!(f.hook.events.lock().len(), 1);

        // Nothing left open; the next cycle makes no provider calls.
        let calls_before = f.provider.call_count();
        f.poller.poll_cycle().await.unwrap();
        assert_eq!(f.provider.call_count(), calls_before);
    }

    #[tokio::test]
    async fn progress_reply_advances_to_processing() {
        let f = fixture(engine_config());
        started_batch(&f.store, user(), CheckType::Deliverable, &addresses("pr", 4)).await;
        f.packer.pack_cycle().await.unwrap();

        let open = f
            .store
            .list_open_provider_batches(CheckType::Deliverable)
            .await
            .unwrap();
        let pb_id = open[0].provider_batch_id.clone();
        assert_eq!(open[0].status, ProviderBatchStatus::Pending);

        f.provider
            .script_status(pb_id.clone(), Ok(ProviderBatchState::Processing { processed: 2 }));
        f.poller.poll_cycle().await.unwrap();

        let open = f
            .store
            .list_open_provider_batches(CheckType::Deliverable)
            .await
            .unwrap();
        assert_eq!(open[0].status, ProviderBatchStatus::Processing);
        assert_eq!(open[0].processed, 2);
    }

    #[tokio::test]
    async fn retries_exhaust_then_fail_and_release_emails() {
        let f = fixture(engine_config());
        let batch =
            started_batch(&f.store, user(), CheckType::Deliverable, &addresses("rt", 2)).await;
        f.packer.pack_cycle().await.unwrap();

        let open = f
            .store
            .list_open_provider_batches(CheckType::Deliverable)
            .await
            .unwrap();
        let pb_id = open[0].provider_batch_id.clone();
        f.provider.script_status(
            pb_id.clone(),
            Err(ProviderError::Http {
                status: 503,
                body: "unavailable".into(),
            }),
        );

        // max_poll_retries failures are tolerated; the next one is terminal.
        for _ in 0..engine_config().max_poll_retries {
            f.poller.poll_cycle().await.unwrap();
            assert_eq!(
                f.store
                    .list_open_provider_batches(CheckType::Deliverable)
                    .await
                    .unwrap()
                    .len(),
                1
            );
        }
        f.poller.poll_cycle().await.unwrap();
        assert!(
            f.store
                .list_open_provider_batches(CheckType::Deliverable)
                .await
                .unwrap()
                .is_empty()
        );

        // The user batch stays processing and no hook fired.
        assert_eq!(
            f.store.get_batch(batch.id).await.unwrap().status,
            BatchStatus::Processing
        );
        assert!(f.hook.events.lock().is_empty());

        // Released assignments make the emails packable again.
        let packable = f
            .store
            .fetch_packable(CheckType::Deliverable, 100)
            .await
            .unwrap();
        assert_eq!(packable.len(), 2);
    }

    #[tokio::test]
    async fn partial_failure_leaves_other_batches_running() {
        let config = EngineConfig {
            max_emails_per_provider_batch: 2,
            max_poll_retries: 0,
            ..engine_config()
        };
        let f = fixture(config);
        let batch =
            started_batch(&f.store, user(), CheckType::Deliverable, &addresses("pf", 4)).await;
        f.packer.pack_cycle().await.unwrap();

        let open = f
            .store
            .list_open_provider_batches(CheckType::Deliverable)
            .await
            .unwrap();
        assert_eq!(open.len(), 2);
        let (first, second) = (
            open[0].provider_batch_id.clone(),
            open[1].provider_batch_id.clone(),
        );

        // First provider batch fails terminally; second completes.
        f.provider.script_status(
            first.clone(),
            Err(ProviderError::Http {
                status: 500,
                body: "boom".into(),
            }),
        );
        f.provider
            .script_status(second.clone(), Ok(ProviderBatchState::Completed));
        let records: Vec<_> = addresses("pf", 4)[2..]
            .iter()
            .map(|e| deliverable_record(e, "deliverable", "accepted", false, "google"))
            .collect();
        f.provider.script_results(second.clone(), Ok(records));

        f.poller.poll_cycle().await.unwrap();

        // Progress reflects the completed half; the batch is not complete and
        // no hook fired.
        let progress = f.store.batch_progress(batch.id).await.unwrap();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 2);
        assert_eq!(
            f.store.get_batch(batch.id).await.unwrap().status,
            BatchStatus::Processing
        );
        assert!(f.hook.events.lock().is_empty());
    }

    #[tokio::test]
    async fn payment_required_dead_letters_without_retry() {
        let f = fixture(engine_config());
        started_batch(&f.store, user(), CheckType::Deliverable, &addresses("pay", 2)).await;
        f.packer.pack_cycle().await.unwrap();

        let open = f
            .store
            .list_open_provider_batches(CheckType::Deliverable)
            .await
            .unwrap();
        f.provider.script_status(
            open[0].provider_batch_id.clone(),
            Err(ProviderError::PaymentRequired("credits exhausted".into())),
        );

        f.poller.poll_cycle().await.unwrap();
        assert!(
            f.store
                .list_open_provider_batches(CheckType::Deliverable)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn timed_out_batches_fail_without_polling() {
        let config = EngineConfig {
            provider_batch_timeout: Duration::ZERO,
            ..engine_config()
        };
        let f = fixture(config);
        started_batch(&f.store, user(), CheckType::Deliverable, &addresses("to", 2)).await;
        f.packer.pack_cycle().await.unwrap();
        let calls_after_pack = f.provider.call_count();

        f.poller.poll_cycle().await.unwrap();

        assert!(
            f.store
                .list_open_provider_batches(CheckType::Deliverable)
                .await
                .unwrap()
                .is_empty()
        );
        // The timeout path never touched the provider.
        assert_eq!(f.provider.call_count(), calls_after_pack);
    }
}
