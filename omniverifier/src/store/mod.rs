//! Storage trait for the batching engine.
//!
//! The store is the single source of truth: all multi-row mutations happen
//! inside one of its operations, and the non-trivial invariants (at-most-once
//! result application, exactly-once completion) live behind this interface
//! rather than in the loops that call it. Two implementations ship: Postgres
//! for production and an in-memory store for tests and single-process runs.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::Result;
use crate::provider::ProviderRecord;
use crate::types::{
    BatchProgress, BatchStatus, CheckType, CreditEvent, ExportKind, GlobalEmailId, ProviderBatchId,
    RequestKind, Timestamp, UserBatchId, UserId,
};

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::InMemoryStore;
pub use models::*;
pub use postgres::PostgresStore;

/// Durable state operations used by the engine loops and the batch service.
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // User batches
    // ------------------------------------------------------------------

    /// Create a user batch in `draft`.
    async fn create_batch(&self, new: NewUserBatch) -> Result<UserBatch>;

    /// Fetch a user batch by id.
    async fn get_batch(&self, id: UserBatchId) -> Result<UserBatch>;

    /// Upsert association rows for a batch and set `total_emails` to the
    /// resulting association count. On conflict the latest nominal wins.
    async fn add_batch_emails(
        &self,
        batch_id: UserBatchId,
        entries: Vec<AssociationEntry>,
    ) -> Result<()>;

    /// All association rows of a batch.
    async fn get_batch_emails(&self, batch_id: UserBatchId) -> Result<Vec<BatchEmailAssociation>>;

    /// Conditionally move a batch from one of `from` to `to`. Returns whether
    /// the update won; `completed_at` is stamped when `to` is `Completed`.
    async fn transition_batch(
        &self,
        id: UserBatchId,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool>;

    /// Archive or unarchive a batch. Archived batches are never packed.
    async fn set_batch_archived(&self, id: UserBatchId, archived: bool) -> Result<()>;

    /// Association totals for progress display.
    async fn batch_progress(&self, id: UserBatchId) -> Result<BatchProgress>;

    // ------------------------------------------------------------------
    // Global emails and cached results
    // ------------------------------------------------------------------

    /// Intern stripped addresses, creating rows on first sight. Returns one
    /// entry per distinct input address.
    async fn intern_emails(&self, stripped: &[String]) -> Result<Vec<GlobalEmail>>;

    /// Cached results of the given check-type for the given addresses.
    async fn get_results(
        &self,
        check_type: CheckType,
        email_ids: &[GlobalEmailId],
    ) -> Result<Vec<VerificationResult>>;

    // ------------------------------------------------------------------
    // Packer
    // ------------------------------------------------------------------

    /// Provider batches currently `pending` or `processing`.
    async fn count_open_provider_batches(&self, check_type: CheckType) -> Result<i64>;

    /// Up to `limit` packable emails in FIFO order: owning batch `queued` or
    /// `processing`, not archived, association neither cached nor complete,
    /// and the email not already assigned to a provider batch of this
    /// check-type. Ordered by `(batch.created_at, batch.id, email_id)`.
    async fn fetch_packable(&self, check_type: CheckType, limit: i64) -> Result<Vec<PackableEmail>>;

    /// Atomically record a submitted provider batch: insert the tracking row
    /// (`pending`), insert assignment rows, and move the distinct owning user
    /// batches from `queued` to `processing`.
    async fn record_provider_batch(&self, new: NewProviderBatch) -> Result<()>;

    // ------------------------------------------------------------------
    // Provider-batch lifecycle
    // ------------------------------------------------------------------

    /// Open provider batches of a check-type, oldest first.
    async fn list_open_provider_batches(&self, check_type: CheckType) -> Result<Vec<ProviderBatch>>;

    /// Record progress from a non-terminal status reply and advance the
    /// batch to `processing`. Resets the poll failure streak.
    async fn mark_provider_progress(&self, id: &ProviderBatchId, processed: i64) -> Result<()>;

    /// Count a failed status poll; returns the new attempt count.
    async fn bump_poll_attempts(&self, id: &ProviderBatchId) -> Result<i32>;

    /// Terminally fail a provider batch and release its assignment rows so
    /// the packer picks the emails up again. Owning user batches stay
    /// `processing`.
    async fn fail_provider_batch(&self, id: &ProviderBatchId) -> Result<()>;

    /// Apply a completion payload in one transaction. The provider batch is
    /// conditionally marked `completed` first; if that update does not win,
    /// this is a duplicate delivery and nothing else happens. Otherwise
    /// results are upserted, matching associations across all batches of the
    /// check-type get `did_complete = 1`, and every affected user batch whose
    /// incomplete count reached zero is completed via the conditional
    /// `processing → completed` update and returned.
    async fn apply_provider_results(
        &self,
        id: &ProviderBatchId,
        records: &[ProviderRecord],
    ) -> Result<ApplyOutcome>;

    // ------------------------------------------------------------------
    // Stuck-batch sweeper
    // ------------------------------------------------------------------

    /// Complete `processing` user batches that have at least one association
    /// and none incomplete. Uses the same conditional update as result
    /// application, so each batch is returned at most once across all
    /// completion paths.
    async fn sweep_stuck_batches(&self, check_type: CheckType) -> Result<Vec<UserBatch>>;

    // ------------------------------------------------------------------
    // Credit ledger
    // ------------------------------------------------------------------

    /// Advisory sum of non-expired subscription credits and the one-off
    /// balance. No mutation.
    async fn credit_summary(&self, user: UserId, check_type: CheckType) -> Result<CreditSummary>;

    /// Authoritative deduction for a batch: counts the batch's associations,
    /// consumes subscription credits first (oldest expiry first) and one-off
    /// credits for the remainder, under row locks, and appends a usage
    /// history line. Fails with `InsufficientCredits` without mutating.
    async fn deduct_for_batch(
        &self,
        user: UserId,
        check_type: CheckType,
        batch_id: UserBatchId,
        subscription_first: bool,
    ) -> Result<DeductionReceipt>;

    /// Add one-off credits (purchase or referral reward) and append history.
    /// Returns the new one-off balance.
    async fn grant_credits(
        &self,
        user: UserId,
        check_type: CheckType,
        amount: i64,
        event: CreditEvent,
    ) -> Result<i64>;

    /// Install or replace the user's subscription bucket for a check-type.
    async fn set_subscription(
        &self,
        user: UserId,
        check_type: CheckType,
        credits: i64,
        expires_at: Timestamp,
    ) -> Result<()>;

    /// Ledger lines for a user, newest first.
    async fn credit_history(&self, user: UserId) -> Result<Vec<CreditHistoryEntry>>;

    // ------------------------------------------------------------------
    // Rate counters
    // ------------------------------------------------------------------

    /// Sum of recorded requests since `since` for one counter key.
    async fn rate_window_sum(
        &self,
        check_type: CheckType,
        kind: RequestKind,
        since: Timestamp,
    ) -> Result<i64>;

    /// Record `n` provider requests against a counter key.
    async fn record_rate(&self, check_type: CheckType, kind: RequestKind, n: i64) -> Result<()>;

    /// Delete counter rows older than `older_than`; returns how many.
    async fn prune_rate_counters(&self, older_than: Timestamp) -> Result<u64>;

    // ------------------------------------------------------------------
    // Enrichment
    // ------------------------------------------------------------------

    /// Create or reset the progress row to `processing`.
    async fn begin_enrichment(&self, batch_id: UserBatchId, check_type: CheckType) -> Result<()>;

    /// Checkpoint the processed-row counter.
    async fn update_enrichment_rows(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
        rows: i64,
    ) -> Result<()>;

    /// Mark the run `completed`.
    async fn complete_enrichment(&self, batch_id: UserBatchId, check_type: CheckType)
    -> Result<()>;

    /// Mark the run `failed` with an error message.
    async fn fail_enrichment(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
        error: &str,
    ) -> Result<()>;

    /// Current progress row, if any.
    async fn get_enrichment(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
    ) -> Result<Option<EnrichmentProgress>>;

    /// Stripped address → cached result for every association of the batch,
    /// in the batch's check-type. This is the in-memory join side of the
    /// enrichment pipeline.
    async fn enrichment_results(
        &self,
        batch_id: UserBatchId,
    ) -> Result<HashMap<String, VerificationResult>>;

    /// Record export metadata for a batch. Conditional: only the first
    /// writer wins; returns whether this call was it.
    async fn record_exports(
        &self,
        batch_id: UserBatchId,
        exports: HashMap<ExportKind, ExportObjectMeta>,
    ) -> Result<bool>;
}
