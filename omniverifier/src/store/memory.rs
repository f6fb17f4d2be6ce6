//! In-memory store implementation.
//!
//! Mirrors the Postgres semantics exactly, including the conditional updates
//! behind the exactly-once completion guarantee. Suitable for tests and
//! single-process runs; state is lost on restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use sqlx::types::Json;
use uuid::Uuid;

use crate::email;
use crate::errors::{Error, Result};
use crate::provider::ProviderRecord;
use crate::types::{
    BatchProgress, BatchStatus, CheckType, CreditEvent, EnrichmentStatus, ExportKind,
    GlobalEmailId, ProviderBatchId, ProviderBatchStatus, RequestKind, Timestamp, UserBatchId,
    UserId, VerdictStatus,
};

use async_trait::async_trait;

use super::models::*;
use super::Store;

#[derive(Default)]
struct State {
    next_email_id: i64,
    emails_by_stripped: HashMap<String, GlobalEmailId>,
    emails: HashMap<GlobalEmailId, String>,
    batches: HashMap<UserBatchId, UserBatch>,
    associations: HashMap<(UserBatchId, GlobalEmailId), BatchEmailAssociation>,
    deliverable_results: HashMap<GlobalEmailId, DeliverableResult>,
    catchall_results: HashMap<GlobalEmailId, CatchallResult>,
    provider_batches: HashMap<ProviderBatchId, ProviderBatch>,
    provider_batch_emails: Vec<ProviderBatchEmail>,
    accounts: HashMap<(UserId, CheckType), i64>,
    subscriptions: HashMap<(UserId, CheckType), SubscriptionCredits>,
    history: Vec<CreditHistoryEntry>,
    rate_counters: Vec<(CheckType, RequestKind, i64, Timestamp)>,
    enrichment: HashMap<(UserBatchId, CheckType), EnrichmentProgress>,
}

impl State {
    fn batch_mut(&mut self, id: UserBatchId) -> Result<&mut UserBatch> {
        self.batches.get_mut(&id).ok_or(Error::NotFound {
            resource: "UserBatch",
            id: id.to_string(),
        })
    }

    fn incomplete_count(&self, batch_id: UserBatchId) -> i64 {
        self.associations
            .values()
            .filter(|a| a.batch_id == batch_id && !a.did_complete)
            .count() as i64
    }

    fn association_count(&self, batch_id: UserBatchId) -> i64 {
        self.associations
            .values()
            .filter(|a| a.batch_id == batch_id)
            .count() as i64
    }

    /// The exactly-once completion path shared by result application and the
    /// sweeper: a conditional `processing → completed` update.
    fn try_complete(&mut self, batch_id: UserBatchId) -> Option<UserBatch> {
        if self.incomplete_count(batch_id) != 0 {
            return None;
        }
        let batch = self.batches.get_mut(&batch_id)?;
        if batch.status != BatchStatus::Processing {
            return None;
        }
        batch.status = BatchStatus::Completed;
        batch.completed_at = Some(Utc::now());
        Some(batch.clone())
    }

    fn upsert_result(&mut self, check_type: CheckType, email_id: GlobalEmailId, record: &ProviderRecord) {
        let now = Utc::now();
        match check_type {
            CheckType::Deliverable => {
                self.deliverable_results.insert(
                    email_id,
                    DeliverableResult {
                        email_id,
                        status: VerdictStatus::parse(record.status.as_deref().unwrap_or("unknown")),
                        reason: record.reason.clone().unwrap_or_else(|| "unknown".into()),
                        is_catchall: record.is_catchall.as_deref().is_some_and(|v| v != "no"),
                        score: record.score.unwrap_or(0),
                        provider: record.provider.clone().unwrap_or_else(|| "other".into()),
                        updated_at: now,
                    },
                );
            }
            CheckType::Catchall => {
                self.catchall_results.insert(
                    email_id,
                    CatchallResult {
                        email_id,
                        status: VerdictStatus::parse(record.status.as_deref().unwrap_or("unknown")),
                        toxicity: record.toxicity.unwrap_or(0),
                        updated_at: now,
                    },
                );
            }
        }
    }

    fn result_for(&self, check_type: CheckType, email_id: GlobalEmailId) -> Option<VerificationResult> {
        match check_type {
            CheckType::Deliverable => self
                .deliverable_results
                .get(&email_id)
                .cloned()
                .map(VerificationResult::Deliverable),
            CheckType::Catchall => self
                .catchall_results
                .get(&email_id)
                .cloned()
                .map(VerificationResult::Catchall),
        }
    }
}

/// In-memory implementation of the [`Store`] trait.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_batch(&self, new: NewUserBatch) -> Result<UserBatch> {
        let batch = UserBatch {
            id: UserBatchId(Uuid::new_v4()),
            user_id: new.user_id,
            check_type: new.check_type,
            title: new.title,
            status: BatchStatus::Draft,
            total_emails: 0,
            is_archived: false,
            source_meta: new.source_meta.map(Json),
            export_meta: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.state.write().batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn get_batch(&self, id: UserBatchId) -> Result<UserBatch> {
        self.state
            .read()
            .batches
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound {
                resource: "UserBatch",
                id: id.to_string(),
            })
    }

    async fn add_batch_emails(
        &self,
        batch_id: UserBatchId,
        entries: Vec<AssociationEntry>,
    ) -> Result<()> {
        let mut state = self.state.write();
        state.batch_mut(batch_id)?;
        for entry in entries {
            state.associations.insert(
                (batch_id, entry.email_id),
                BatchEmailAssociation {
                    batch_id,
                    email_id: entry.email_id,
                    email_nominal: entry.email_nominal,
                    used_cached: entry.used_cached,
                    did_complete: entry.did_complete,
                },
            );
        }
        let total = state.association_count(batch_id);
        state.batch_mut(batch_id)?.total_emails = total;
        Ok(())
    }

    async fn get_batch_emails(&self, batch_id: UserBatchId) -> Result<Vec<BatchEmailAssociation>> {
        let state = self.state.read();
        let mut rows: Vec<_> = state
            .associations
            .values()
            .filter(|a| a.batch_id == batch_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.email_id);
        Ok(rows)
    }

    async fn transition_batch(
        &self,
        id: UserBatchId,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool> {
        let mut state = self.state.write();
        let batch = state.batch_mut(id)?;
        if !from.contains(&batch.status) {
            return Ok(false);
        }
        batch.status = to;
        if to == BatchStatus::Completed {
            batch.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn set_batch_archived(&self, id: UserBatchId, archived: bool) -> Result<()> {
        self.state.write().batch_mut(id)?.is_archived = archived;
        Ok(())
    }

    async fn batch_progress(&self, id: UserBatchId) -> Result<BatchProgress> {
        let state = self.state.read();
        let total = state.association_count(id);
        let completed = total - state.incomplete_count(id);
        Ok(BatchProgress { total, completed })
    }

    async fn intern_emails(&self, stripped: &[String]) -> Result<Vec<GlobalEmail>> {
        let mut state = self.state.write();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for address in stripped {
            if !seen.insert(address.clone()) {
                continue;
            }
            let id = match state.emails_by_stripped.get(address) {
                Some(id) => *id,
                None => {
                    state.next_email_id += 1;
                    let id = GlobalEmailId(state.next_email_id);
                    state.emails_by_stripped.insert(address.clone(), id);
                    state.emails.insert(id, address.clone());
                    id
                }
            };
            out.push(GlobalEmail {
                id,
                email_stripped: address.clone(),
            });
        }
        Ok(out)
    }

    async fn get_results(
        &self,
        check_type: CheckType,
        email_ids: &[GlobalEmailId],
    ) -> Result<Vec<VerificationResult>> {
        let state = self.state.read();
        Ok(email_ids
            .iter()
            .filter_map(|id| state.result_for(check_type, *id))
            .collect())
    }

    async fn count_open_provider_batches(&self, check_type: CheckType) -> Result<i64> {
        let state = self.state.read();
        Ok(state
            .provider_batches
            .values()
            .filter(|pb| pb.check_type == check_type && pb.status.is_open())
            .count() as i64)
    }

    async fn fetch_packable(&self, check_type: CheckType, limit: i64) -> Result<Vec<PackableEmail>> {
        let state = self.state.read();

        let assigned: HashSet<GlobalEmailId> = state
            .provider_batch_emails
            .iter()
            .filter(|pbe| {
                state
                    .provider_batches
                    .get(&pbe.provider_batch_id)
                    .is_some_and(|pb| pb.check_type == check_type)
            })
            .map(|pbe| pbe.email_id)
            .collect();

        let mut pool: Vec<(Timestamp, UserBatchId, GlobalEmailId)> = state
            .associations
            .values()
            .filter(|a| !a.used_cached && !a.did_complete && !assigned.contains(&a.email_id))
            .filter_map(|a| {
                let batch = state.batches.get(&a.batch_id)?;
                let packable = batch.check_type == check_type
                    && !batch.is_archived
                    && matches!(batch.status, BatchStatus::Queued | BatchStatus::Processing);
                packable.then_some((batch.created_at, a.batch_id, a.email_id))
            })
            .collect();

        pool.sort();
        pool.truncate(limit.max(0) as usize);

        Ok(pool
            .into_iter()
            .map(|(_, batch_id, email_id)| PackableEmail {
                batch_id,
                email_id,
                email_stripped: state.emails[&email_id].clone(),
            })
            .collect())
    }

    async fn record_provider_batch(&self, new: NewProviderBatch) -> Result<()> {
        let mut state = self.state.write();
        let now = Utc::now();

        state.provider_batches.insert(
            new.provider_batch_id.clone(),
            ProviderBatch {
                provider_batch_id: new.provider_batch_id.clone(),
                check_type: new.check_type,
                primary_batch_id: new.primary_batch_id,
                status: ProviderBatchStatus::Pending,
                email_count: new.assignments.len() as i64,
                processed: 0,
                poll_attempts: 0,
                created_at: now,
                updated_at: now,
            },
        );

        let mut owners = HashSet::new();
        for assignment in &new.assignments {
            owners.insert(assignment.batch_id);
            state.provider_batch_emails.push(ProviderBatchEmail {
                provider_batch_id: new.provider_batch_id.clone(),
                email_id: assignment.email_id,
                batch_id: assignment.batch_id,
            });
        }
        for owner in owners {
            if let Some(batch) = state.batches.get_mut(&owner) {
                if batch.status == BatchStatus::Queued {
                    batch.status = BatchStatus::Processing;
                }
            }
        }
        Ok(())
    }

    async fn list_open_provider_batches(&self, check_type: CheckType) -> Result<Vec<ProviderBatch>> {
        let state = self.state.read();
        let mut open: Vec<_> = state
            .provider_batches
            .values()
            .filter(|pb| pb.check_type == check_type && pb.status.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|pb| pb.created_at);
        Ok(open)
    }

    async fn mark_provider_progress(&self, id: &ProviderBatchId, processed: i64) -> Result<()> {
        let mut state = self.state.write();
        if let Some(pb) = state.provider_batches.get_mut(id) {
            if pb.status.is_open() {
                pb.status = ProviderBatchStatus::Processing;
                pb.processed = processed;
                pb.poll_attempts = 0;
                pb.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn bump_poll_attempts(&self, id: &ProviderBatchId) -> Result<i32> {
        let mut state = self.state.write();
        let pb = state.provider_batches.get_mut(id).ok_or(Error::NotFound {
            resource: "ProviderBatch",
            id: id.to_string(),
        })?;
        pb.poll_attempts += 1;
        pb.updated_at = Utc::now();
        Ok(pb.poll_attempts)
    }

    async fn fail_provider_batch(&self, id: &ProviderBatchId) -> Result<()> {
        let mut state = self.state.write();
        if let Some(pb) = state.provider_batches.get_mut(id) {
            pb.status = ProviderBatchStatus::Failed;
            pb.updated_at = Utc::now();
        }
        // Release assignments so the packer re-packs these emails.
        state
            .provider_batch_emails
            .retain(|pbe| &pbe.provider_batch_id != id);
        Ok(())
    }

    async fn apply_provider_results(
        &self,
        id: &ProviderBatchId,
        records: &[ProviderRecord],
    ) -> Result<ApplyOutcome> {
        let mut state = self.state.write();

        // Mark completed first; losing this update means a duplicate delivery.
        let check_type = {
            let pb = state.provider_batches.get_mut(id).ok_or(Error::NotFound {
                resource: "ProviderBatch",
                id: id.to_string(),
            })?;
            if !pb.status.is_open() {
                return Ok(ApplyOutcome::duplicate());
            }
            pb.status = ProviderBatchStatus::Completed;
            pb.processed = pb.email_count;
            pb.updated_at = Utc::now();
            pb.check_type
        };

        // Resolve stripped addresses through this batch's assignment rows.
        let assigned: HashMap<String, GlobalEmailId> = state
            .provider_batch_emails
            .iter()
            .filter(|pbe| &pbe.provider_batch_id == id)
            .map(|pbe| (state.emails[&pbe.email_id].clone(), pbe.email_id))
            .collect();
        let assignment_owners: HashSet<UserBatchId> = state
            .provider_batch_emails
            .iter()
            .filter(|pbe| &pbe.provider_batch_id == id)
            .map(|pbe| pbe.batch_id)
            .collect();

        let mut outcome = ApplyOutcome::default();
        let mut resolved = Vec::new();
        for record in records {
            let Some(stripped) = email::normalise(&record.email) else {
                tracing::warn!(email = %record.email, "Skipping malformed result record");
                outcome.skipped += 1;
                continue;
            };
            let Some(email_id) = assigned.get(&stripped).copied() else {
                tracing::warn!(email = %stripped, "Skipping result for unassigned address");
                outcome.skipped += 1;
                continue;
            };
            state.upsert_result(check_type, email_id, record);
            resolved.push(email_id);
            outcome.applied += 1;
        }

        // Flip associations across every batch of this check-type that holds
        // one of the resolved addresses.
        let resolved_set: HashSet<GlobalEmailId> = resolved.iter().copied().collect();
        let mut affected: HashSet<UserBatchId> = assignment_owners;
        let touched: Vec<(UserBatchId, GlobalEmailId)> = state
            .associations
            .values()
            .filter(|a| resolved_set.contains(&a.email_id) && !a.did_complete)
            .filter(|a| {
                state
                    .batches
                    .get(&a.batch_id)
                    .is_some_and(|b| b.check_type == check_type)
            })
            .map(|a| (a.batch_id, a.email_id))
            .collect();
        for (batch_id, email_id) in touched {
            if let Some(assoc) = state.associations.get_mut(&(batch_id, email_id)) {
                assoc.did_complete = true;
            }
            affected.insert(batch_id);
        }

        let mut candidates: Vec<UserBatchId> = affected.into_iter().collect();
        candidates.sort();
        for batch_id in candidates {
            if let Some(batch) = state.try_complete(batch_id) {
                outcome.completed.push(batch);
            }
        }

        Ok(outcome)
    }

    async fn sweep_stuck_batches(&self, check_type: CheckType) -> Result<Vec<UserBatch>> {
        let mut state = self.state.write();
        let candidates: Vec<UserBatchId> = state
            .batches
            .values()
            .filter(|b| {
                b.check_type == check_type
                    && b.status == BatchStatus::Processing
                    && !b.is_archived
            })
            .map(|b| b.id)
            .collect();

        let mut completed = Vec::new();
        for batch_id in candidates {
            if state.association_count(batch_id) == 0 {
                continue;
            }
            if let Some(batch) = state.try_complete(batch_id) {
                completed.push(batch);
            }
        }
        Ok(completed)
    }

    async fn credit_summary(&self, user: UserId, check_type: CheckType) -> Result<CreditSummary> {
        let state = self.state.read();
        let now = Utc::now();
        let subscription_left = state
            .subscriptions
            .get(&(user, check_type))
            .filter(|s| s.expires_at > now)
            .map(|s| s.credits_left)
            .unwrap_or(0);
        let one_off_balance = state.accounts.get(&(user, check_type)).copied().unwrap_or(0);
        Ok(CreditSummary {
            subscription_left,
            one_off_balance,
        })
    }

    async fn deduct_for_batch(
        &self,
        user: UserId,
        check_type: CheckType,
        batch_id: UserBatchId,
        subscription_first: bool,
    ) -> Result<DeductionReceipt> {
        let mut state = self.state.write();
        let now = Utc::now();
        let required = state.association_count(batch_id);

        let subscription_left = state
            .subscriptions
            .get(&(user, check_type))
            .filter(|s| s.expires_at > now)
            .map(|s| s.credits_left)
            .unwrap_or(0);
        let one_off_balance = state.accounts.get(&(user, check_type)).copied().unwrap_or(0);

        let available = subscription_left + one_off_balance;
        if required > available {
            return Err(Error::InsufficientCredits {
                required,
                available,
            });
        }

        let (subscription_used, one_off_used) = if subscription_first {
            let sub = subscription_left.min(required);
            (sub, required - sub)
        } else {
            let one_off = one_off_balance.min(required);
            (required - one_off, one_off)
        };

        if subscription_used > 0 {
            let sub = state
                .subscriptions
                .get_mut(&(user, check_type))
                .expect("subscription row exists when credits were available");
            sub.credits_left -= subscription_used;
        }
        if one_off_used > 0 {
            *state.accounts.entry((user, check_type)).or_insert(0) -= one_off_used;
        }

        state.history.push(CreditHistoryEntry {
            user_id: user,
            check_type,
            credits_used: required,
            event_type: CreditEvent::Usage,
            batch_id: Some(batch_id),
            used_at: now,
        });

        Ok(DeductionReceipt {
            total_deducted: required,
            subscription_used,
            one_off_used,
            remaining_total: available - required,
        })
    }

    async fn grant_credits(
        &self,
        user: UserId,
        check_type: CheckType,
        amount: i64,
        event: CreditEvent,
    ) -> Result<i64> {
        let mut state = self.state.write();
        let balance = state.accounts.entry((user, check_type)).or_insert(0);
        *balance += amount;
        let new_balance = *balance;
        state.history.push(CreditHistoryEntry {
            user_id: user,
            check_type,
            credits_used: amount,
            event_type: event,
            batch_id: None,
            used_at: Utc::now(),
        });
        Ok(new_balance)
    }

    async fn set_subscription(
        &self,
        user: UserId,
        check_type: CheckType,
        credits: i64,
        expires_at: Timestamp,
    ) -> Result<()> {
        self.state.write().subscriptions.insert(
            (user, check_type),
            SubscriptionCredits {
                user_id: user,
                check_type,
                credits_start: credits,
                credits_left: credits,
                expires_at,
            },
        );
        Ok(())
    }

    async fn credit_history(&self, user: UserId) -> Result<Vec<CreditHistoryEntry>> {
        let mut rows: Vec<_> = self
            .state
            .read()
            .history
            .iter()
            .filter(|h| h.user_id == user)
            .cloned()
            .collect();
        rows.reverse();
        Ok(rows)
    }

    async fn rate_window_sum(
        &self,
        check_type: CheckType,
        kind: RequestKind,
        since: Timestamp,
    ) -> Result<i64> {
        let state = self.state.read();
        Ok(state
            .rate_counters
            .iter()
            .filter(|(t, k, _, start)| *t == check_type && *k == kind && *start >= since)
            .map(|(_, _, n, _)| n)
            .sum())
    }

    async fn record_rate(&self, check_type: CheckType, kind: RequestKind, n: i64) -> Result<()> {
        self.state
            .write()
            .rate_counters
            .push((check_type, kind, n, Utc::now()));
        Ok(())
    }

    async fn prune_rate_counters(&self, older_than: Timestamp) -> Result<u64> {
        let mut state = self.state.write();
        let before = state.rate_counters.len();
        state.rate_counters.retain(|(_, _, _, start)| *start >= older_than);
        Ok((before - state.rate_counters.len()) as u64)
    }

    async fn begin_enrichment(&self, batch_id: UserBatchId, check_type: CheckType) -> Result<()> {
        self.state.write().enrichment.insert(
            (batch_id, check_type),
            EnrichmentProgress {
                batch_id,
                check_type,
                status: EnrichmentStatus::Processing,
                rows_processed: 0,
                total_rows: None,
                started_at: Utc::now(),
                completed_at: None,
                error_message: None,
            },
        );
        Ok(())
    }

    async fn update_enrichment_rows(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
        rows: i64,
    ) -> Result<()> {
        if let Some(progress) = self
            .state
            .write()
            .enrichment
            .get_mut(&(batch_id, check_type))
        {
            progress.rows_processed = rows;
        }
        Ok(())
    }

    async fn complete_enrichment(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
    ) -> Result<()> {
        if let Some(progress) = self
            .state
            .write()
            .enrichment
            .get_mut(&(batch_id, check_type))
        {
            progress.status = EnrichmentStatus::Completed;
            progress.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fail_enrichment(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
        error: &str,
    ) -> Result<()> {
        if let Some(progress) = self
            .state
            .write()
            .enrichment
            .get_mut(&(batch_id, check_type))
        {
            progress.status = EnrichmentStatus::Failed;
            progress.completed_at = Some(Utc::now());
            progress.error_message = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_enrichment(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
    ) -> Result<Option<EnrichmentProgress>> {
        Ok(self
            .state
            .read()
            .enrichment
            .get(&(batch_id, check_type))
            .cloned())
    }

    async fn enrichment_results(
        &self,
        batch_id: UserBatchId,
    ) -> Result<HashMap<String, VerificationResult>> {
        let state = self.state.read();
        let batch = state.batches.get(&batch_id).ok_or(Error::NotFound {
            resource: "UserBatch",
            id: batch_id.to_string(),
        })?;

        let mut map = HashMap::new();
        for assoc in state.associations.values() {
            if assoc.batch_id != batch_id {
                continue;
            }
            if let Some(result) = state.result_for(batch.check_type, assoc.email_id) {
                map.insert(state.emails[&assoc.email_id].clone(), result);
            }
        }
        Ok(map)
    }

    async fn record_exports(
        &self,
        batch_id: UserBatchId,
        exports: HashMap<ExportKind, ExportObjectMeta>,
    ) -> Result<bool> {
        let mut state = self.state.write();
        let batch = state.batch_mut(batch_id)?;
        if batch.export_meta.is_some() {
            return Ok(false);
        }
        batch.export_meta = Some(Json(
            exports
                .into_iter()
                .map(|(kind, meta)| (kind.as_str().to_string(), meta))
                .collect(),
        ));
        Ok(true)
    }
}
