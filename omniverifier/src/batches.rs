//! Batch submission surface.
//!
//! The operations the (out-of-scope) HTTP shell calls into: submitting a
//! batch of raw addresses, starting it (reserve, deduct, queue), pausing,
//! resuming and archiving. Addresses failing validation are silently dropped
//! from a submission; duplicates collapsing to one stripped form keep the
//! latest nominal. Cached results short-circuit at insertion, so a fully
//! cached batch completes inside start without ever touching the packer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::completion::CompletionHooks;
use crate::config::EngineConfig;
use crate::email;
use crate::errors::{Error, Result};
use crate::store::{AssociationEntry, NewUserBatch, SourceMeta, Store, UserBatch};
use crate::types::{BatchProgress, BatchStatus, CheckType, GlobalEmailId, UserBatchId, UserId};

pub struct BatchService<S> {
    store: Arc<S>,
    hooks: CompletionHooks,
    config: EngineConfig,
}

impl<S: Store> BatchService<S> {
    pub fn new(store: Arc<S>, hooks: CompletionHooks, config: EngineConfig) -> Self {
        Self {
            store,
            hooks,
            config,
        }
    }

    /// Create a draft batch from raw addresses.
    #[tracing::instrument(skip(self, addresses, source_meta), fields(user_id = %user_id, check_type = %check_type, submitted = addresses.len()))]
    pub async fn submit_batch(
        &self,
        user_id: UserId,
        check_type: CheckType,
        title: String,
        addresses: &[String],
        source_meta: Option<SourceMeta>,
    ) -> Result<UserBatch> {
        // Collapse to stripped forms; the latest nominal wins per address.
        let mut order: Vec<String> = Vec::new();
        let mut nominal_by_stripped: HashMap<String, String> = HashMap::new();
        for raw in addresses {
            let Some(stripped) = email::normalise(raw) else {
                continue;
            };
            if !nominal_by_stripped.contains_key(&stripped) {
                order.push(stripped.clone());
            }
            nominal_by_stripped.insert(stripped, raw.trim().to_string());
        }

        if order.is_empty() {
            return Err(Error::BadRequest(
                "submission contains no valid email addresses".into(),
            ));
        }

        let dropped = addresses.len() - nominal_by_stripped.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped invalid or duplicate addresses");
        }

        let batch = self
            .store
            .create_batch(NewUserBatch {
                user_id,
                check_type,
                title,
                source_meta,
            })
            .await?;

        let interned = self.store.intern_emails(&order).await?;
        let ids: Vec<GlobalEmailId> = interned.iter().map(|e| e.id).collect();
        let cached: HashSet<GlobalEmailId> = self
            .store
            .get_results(check_type, &ids)
            .await?
            .into_iter()
            .map(|r| r.email_id())
            .collect();

        let entries: Vec<AssociationEntry> = interned
            .iter()
            .map(|e| {
                let is_cached = cached.contains(&e.id);
                AssociationEntry {
                    email_id: e.id,
                    email_nominal: nominal_by_stripped[&e.email_stripped].clone(),
                    used_cached: is_cached,
                    did_complete: is_cached,
                }
            })
            .collect();
        self.store.add_batch_emails(batch.id, entries).await?;

        self.store.get_batch(batch.id).await
    }

    /// Start a draft batch: advisory reserve, authoritative deduction, then
    /// queue. A fully cached batch completes here without a provider batch.
    #[tracing::instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn start_batch(&self, batch_id: UserBatchId) -> Result<UserBatch> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.status != BatchStatus::Draft {
            return Err(Error::InvalidTransition {
                batch_id,
                from: batch.status,
                to: BatchStatus::Queued,
            });
        }

        // Advisory reservation; the deduction below is authoritative.
        let summary = self
            .store
            .credit_summary(batch.user_id, batch.check_type)
            .await?;
        if summary.total() < batch.total_emails {
            return Err(Error::InsufficientCredits {
                required: batch.total_emails,
                available: summary.total(),
            });
        }

        let receipt = self
            .store
            .deduct_for_batch(
                batch.user_id,
                batch.check_type,
                batch_id,
                self.config.subscription_consumes_before_oneoff,
            )
            .await?;
        tracing::info!(
            deducted = receipt.total_deducted,
            subscription_used = receipt.subscription_used,
            one_off_used = receipt.one_off_used,
            "Deducted credits for batch"
        );

        if !self
            .store
            .transition_batch(batch_id, &[BatchStatus::Draft], BatchStatus::Queued)
            .await?
        {
            return Err(Error::InvalidTransition {
                batch_id,
                from: batch.status,
                to: BatchStatus::Queued,
            });
        }

        // Full-cache short-circuit: nothing left for the packer to do.
        let progress = self.store.batch_progress(batch_id).await?;
        if progress.total > 0
            && progress.completed == progress.total
            && self
                .store
                .transition_batch(batch_id, &[BatchStatus::Queued], BatchStatus::Completed)
                .await?
        {
            let completed = self.store.get_batch(batch_id).await?;
            self.hooks.fire(&completed).await;
        }

        self.store.get_batch(batch_id).await
    }

    /// Pause a batch. Paused batches are excluded from packer selection;
    /// their in-flight provider batches run to terminal status regardless.
    pub async fn pause_batch(&self, batch_id: UserBatchId) -> Result<UserBatch> {
        let allowed = [
            BatchStatus::Draft,
            BatchStatus::Queued,
            BatchStatus::Processing,
        ];
        if !self
            .store
            .transition_batch(batch_id, &allowed, BatchStatus::Paused)
            .await?
        {
            let batch = self.store.get_batch(batch_id).await?;
            return Err(Error::InvalidTransition {
                batch_id,
                from: batch.status,
                to: BatchStatus::Paused,
            });
        }
        self.store.get_batch(batch_id).await
    }

    /// Resume a paused batch into `processing`.
    pub async fn resume_batch(&self, batch_id: UserBatchId) -> Result<UserBatch> {
        if !self
            .store
            .transition_batch(batch_id, &[BatchStatus::Paused], BatchStatus::Processing)
            .await?
        {
            let batch = self.store.get_batch(batch_id).await?;
            return Err(Error::InvalidTransition {
                batch_id,
                from: batch.status,
                to: BatchStatus::Processing,
            });
        }
        self.store.get_batch(batch_id).await
    }

    /// Archive a batch, removing it from packer selection permanently.
    pub async fn archive_batch(&self, batch_id: UserBatchId) -> Result<()> {
        self.store.set_batch_archived(batch_id, true).await
    }

    /// Association totals for progress display.
    pub async fn progress(&self, batch_id: UserBatchId) -> Result<BatchProgress> {
        self.store.batch_progress(batch_id).await
    }
}
