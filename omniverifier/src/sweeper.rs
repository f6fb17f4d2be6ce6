//! Stuck-batch sweeper.
//!
//! Closes the gap left when a result application crashed between flipping
//! associations and checking completion: any `processing`, non-archived user
//! batch whose associations are all complete is completed here, through the
//! same conditional update the result applier uses, so the hook still fires
//! exactly once.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::completion::CompletionHooks;
use crate::config::EngineConfig;
use crate::errors::Result;
use crate::store::Store;
use crate::types::CheckType;

pub struct StuckBatchSweeper<S> {
    store: Arc<S>,
    hooks: CompletionHooks,
    config: EngineConfig,
    check_type: CheckType,
}

impl<S: Store + 'static> StuckBatchSweeper<S> {
    pub fn new(
        store: Arc<S>,
        hooks: CompletionHooks,
        config: EngineConfig,
        check_type: CheckType,
    ) -> Self {
        Self {
            store,
            hooks,
            config,
            check_type,
        }
    }

    /// Run the sweeper loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(check_type = %self.check_type, "Starting stuck-batch sweeper");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_cycle().await {
                        tracing::error!(check_type = %self.check_type, error = %e, "Sweep cycle failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!(check_type = %self.check_type, "Sweeper shutting down");
                    return;
                }
            }
        }
    }

    /// One sweep pass. Returns how many batches were completed.
    pub async fn sweep_cycle(&self) -> Result<usize> {
        let completed = self.store.sweep_stuck_batches(self.check_type).await?;
        for batch in &completed {
            tracing::warn!(
                batch_id = %batch.id,
                "Completed stuck user batch (all associations done but status never advanced)"
            );
            self.hooks.fire(batch).await;
        }
        Ok(completed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::test_support::RecordingHook;
    use crate::store::{AssociationEntry, InMemoryStore, NewUserBatch, Store};
    use crate::test_support::*;
    use crate::types::BatchStatus;

    fn sweeper(
        store: &Arc<InMemoryStore>,
        hook: &Arc<RecordingHook>,
    ) -> StuckBatchSweeper<InMemoryStore> {
        StuckBatchSweeper::new(
            store.clone(),
            CompletionHooks::new().with(hook.clone()),
            engine_config(),
            CheckType::Deliverable,
        )
    }

    /// A batch whose associations all finished but whose status never moved
    /// past `processing` (result application crashed before completion).
    async fn stuck_batch(store: &Arc<InMemoryStore>) -> crate::store::UserBatch {
        let batch = store
            .create_batch(NewUserBatch {
                user_id: user(),
                check_type: CheckType::Deliverable,
                title: "stuck".into(),
                source_meta: None,
            })
            .await
            .unwrap();
        let interned = store.intern_emails(&addresses("stuck", 2)).await.unwrap();
        let entries: Vec<AssociationEntry> = interned
            .iter()
            .map(|e| AssociationEntry {
                email_id: e.id,
                email_nominal: e.email_stripped.clone(),
                used_cached: false,
                did_complete: true,
            })
            .collect();
        store.add_batch_emails(batch.id, entries).await.unwrap();
        store
            .transition_batch(batch.id, &[BatchStatus::Draft], BatchStatus::Queued)
            .await
            .unwrap();
        store
            .transition_batch(batch.id, &[BatchStatus::Queued], BatchStatus::Processing)
            .await
            .unwrap();
        batch
    }

    #[tokio::test]
    async fn completes_stuck_batches_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let hook = Arc::new(RecordingHook::default());
        let batch = stuck_batch(&store).await;

        let sweeper = sweeper(&store, &hook);
        assert_eq!(sweeper.sweep_cycle().await.unwrap(), 1);
        assert_eq!(
            store.get_batch(batch.id).await.unwrap().status,
            BatchStatus::Completed
        );
        assert_eq!(hook.events.lock().len(), 1);

        // Second pass finds nothing; the hook does not fire again.
        assert_eq!(sweeper.sweep_cycle().await.unwrap(), 0);
        assert_eq!(hook.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn ignores_incomplete_empty_and_archived_batches() {
        let store = Arc::new(InMemoryStore::new());
        let hook = Arc::new(RecordingHook::default());

        // Still has incomplete associations.
        let running =
            started_batch(&store, user(), CheckType::Deliverable, &addresses("run", 2)).await;
        store
            .transition_batch(running.id, &[BatchStatus::Queued], BatchStatus::Processing)
            .await
            .unwrap();

        // No associations at all.
        let empty = store
            .create_batch(NewUserBatch {
                user_id: user(),
                check_type: CheckType::Deliverable,
                title: "empty".into(),
                source_meta: None,
            })
            .await
            .unwrap();
        store
            .transition_batch(empty.id, &[BatchStatus::Draft], BatchStatus::Processing)
            .await
            .unwrap();

        // Complete but archived.
        let archived = stuck_batch(&store).await;
        store.set_batch_archived(archived.id, true).await.unwrap();

        let sweeper = sweeper(&store, &hook);
        assert_eq!(sweeper.sweep_cycle().await.unwrap(), 0);
        assert!(hook.events.lock().is_empty());
    }
}
