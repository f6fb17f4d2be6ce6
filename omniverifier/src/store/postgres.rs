//! PostgreSQL implementation of the [`Store`] trait.
//!
//! All multi-row mutations run inside transactions; credit deduction takes
//! row locks, and both completion paths go through the same conditional
//! `processing → completed` update so the hook fires exactly once.

use std::collections::{HashMap, HashSet};

use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::email;
use crate::errors::{Error, Result};
use crate::provider::ProviderRecord;
use crate::types::{
    BatchProgress, BatchStatus, CheckType, CreditEvent, ExportKind, GlobalEmailId, ProviderBatchId,
    RequestKind, Timestamp, UserBatchId, UserId, VerdictStatus,
};

use async_trait::async_trait;

use super::Store;
use super::models::*;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool with the configured settings and run migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool.max_connections)
            .min_connections(config.pool.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(
                config.pool.acquire_timeout_secs,
            ))
            .idle_timeout(std::time::Duration::from_secs(config.pool.idle_timeout_secs))
            .connect(&config.url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to run migrations: {e}")))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_strings(statuses: &[BatchStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_batch(&self, new: NewUserBatch) -> Result<UserBatch> {
        let batch = sqlx::query_as::<_, UserBatch>(
            r#"
            INSERT INTO user_batches (user_id, check_type, title, source_meta)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(new.check_type)
        .bind(&new.title)
        .bind(new.source_meta.map(Json))
        .fetch_one(&self.pool)
        .await?;

        Ok(batch)
    }

    async fn get_batch(&self, id: UserBatchId) -> Result<UserBatch> {
        sqlx::query_as::<_, UserBatch>("SELECT * FROM user_batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
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
        let mut tx = self.pool.begin().await?;

        let email_ids: Vec<i64> = entries.iter().map(|e| e.email_id.0).collect();
        let nominals: Vec<String> = entries.iter().map(|e| e.email_nominal.clone()).collect();
        let cached: Vec<bool> = entries.iter().map(|e| e.used_cached).collect();
        let complete: Vec<bool> = entries.iter().map(|e| e.did_complete).collect();

        sqlx::query(
            r#"
            INSERT INTO batch_emails (batch_id, email_id, email_nominal, used_cached, did_complete)
            SELECT $1::uuid, * FROM UNNEST($2::bigint[], $3::text[], $4::boolean[], $5::boolean[])
            ON CONFLICT (batch_id, email_id) DO UPDATE SET
                email_nominal = EXCLUDED.email_nominal,
                used_cached = EXCLUDED.used_cached,
                did_complete = EXCLUDED.did_complete
            "#,
        )
        .bind(batch_id)
        .bind(&email_ids)
        .bind(&nominals)
        .bind(&cached)
        .bind(&complete)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE user_batches
            SET total_emails = (SELECT COUNT(*) FROM batch_emails WHERE batch_id = $1)
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_batch_emails(&self, batch_id: UserBatchId) -> Result<Vec<BatchEmailAssociation>> {
        let rows = sqlx::query_as::<_, BatchEmailAssociation>(
            "SELECT * FROM batch_emails WHERE batch_id = $1 ORDER BY email_id ASC",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn transition_batch(
        &self,
        id: UserBatchId,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE user_batches
            SET status = $2,
                completed_at = CASE WHEN $2 = 'completed' THEN NOW() ELSE completed_at END
            WHERE id = $1 AND status = ANY($3::text[])
            "#,
        )
        .bind(id)
        .bind(to)
        .bind(status_strings(from))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn set_batch_archived(&self, id: UserBatchId, archived: bool) -> Result<()> {
        sqlx::query("UPDATE user_batches SET is_archived = $2 WHERE id = $1")
            .bind(id)
            .bind(archived)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn batch_progress(&self, id: UserBatchId) -> Result<BatchProgress> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE did_complete) AS completed
            FROM batch_emails
            WHERE batch_id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(BatchProgress {
            total: row.try_get::<i64, _>("total").map_err(Error::from)?,
            completed: row.try_get::<i64, _>("completed").map_err(Error::from)?,
        })
    }

    async fn intern_emails(&self, stripped: &[String]) -> Result<Vec<GlobalEmail>> {
        let mut distinct = Vec::new();
        let mut seen = HashSet::new();
        for address in stripped {
            if seen.insert(address.as_str()) {
                distinct.push(address.clone());
            }
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO global_emails (email_stripped)
            SELECT * FROM UNNEST($1::text[])
            ON CONFLICT (email_stripped) DO NOTHING
            "#,
        )
        .bind(&distinct)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query_as::<_, GlobalEmail>(
            "SELECT id, email_stripped FROM global_emails WHERE email_stripped = ANY($1::text[])",
        )
        .bind(&distinct)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        // Preserve input order.
        let by_stripped: HashMap<&str, &GlobalEmail> = rows
            .iter()
            .map(|e| (e.email_stripped.as_str(), e))
            .collect();
        Ok(distinct
            .iter()
            .filter_map(|address| by_stripped.get(address.as_str()).copied().cloned())
            .collect())
    }

    async fn get_results(
        &self,
        check_type: CheckType,
        email_ids: &[GlobalEmailId],
    ) -> Result<Vec<VerificationResult>> {
        let ids: Vec<i64> = email_ids.iter().map(|id| id.0).collect();
        match check_type {
            CheckType::Deliverable => {
                let rows = sqlx::query_as::<_, DeliverableResult>(
                    "SELECT * FROM deliverable_results WHERE email_id = ANY($1::bigint[])",
                )
                .bind(&ids)
                .fetch_all(&self.pool)
                .await?;
                Ok(rows.into_iter().map(VerificationResult::Deliverable).collect())
            }
            CheckType::Catchall => {
                let rows = sqlx::query_as::<_, CatchallResult>(
                    "SELECT * FROM catchall_results WHERE email_id = ANY($1::bigint[])",
                )
                .bind(&ids)
                .fetch_all(&self.pool)
                .await?;
                Ok(rows.into_iter().map(VerificationResult::Catchall).collect())
            }
        }
    }

    async fn count_open_provider_batches(&self, check_type: CheckType) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM provider_batches
            WHERE check_type = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(check_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn fetch_packable(&self, check_type: CheckType, limit: i64) -> Result<Vec<PackableEmail>> {
        let rows = sqlx::query_as::<_, PackableEmail>(
            r#"
            SELECT be.batch_id, be.email_id, ge.email_stripped
            FROM batch_emails be
            JOIN user_batches ub ON ub.id = be.batch_id
            JOIN global_emails ge ON ge.id = be.email_id
            WHERE ub.check_type = $1
              AND ub.status IN ('queued', 'processing')
              AND ub.is_archived = FALSE
              AND be.used_cached = FALSE
              AND be.did_complete = FALSE
              AND NOT EXISTS (
                  SELECT 1
                  FROM provider_batch_emails pbe
                  JOIN provider_batches pb ON pb.provider_batch_id = pbe.provider_batch_id
                  WHERE pbe.email_id = be.email_id AND pb.check_type = $1
              )
            ORDER BY ub.created_at ASC, ub.id ASC, be.email_id ASC
            LIMIT $2
            "#,
        )
        .bind(check_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_provider_batch(&self, new: NewProviderBatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO provider_batches
                (provider_batch_id, check_type, primary_batch_id, status, email_count)
            VALUES ($1, $2, $3, 'pending', $4)
            "#,
        )
        .bind(&new.provider_batch_id)
        .bind(new.check_type)
        .bind(new.primary_batch_id)
        .bind(new.assignments.len() as i64)
        .execute(&mut *tx)
        .await?;

        let email_ids: Vec<i64> = new.assignments.iter().map(|a| a.email_id.0).collect();
        let batch_ids: Vec<Uuid> = new.assignments.iter().map(|a| a.batch_id.0).collect();
        sqlx::query(
            r#"
            INSERT INTO provider_batch_emails (provider_batch_id, email_id, batch_id)
            SELECT $1::text, * FROM UNNEST($2::bigint[], $3::uuid[])
            "#,
        )
        .bind(&new.provider_batch_id)
        .bind(&email_ids)
        .bind(&batch_ids)
        .execute(&mut *tx)
        .await?;

        let owners: Vec<Uuid> = new
            .assignments
            .iter()
            .map(|a| a.batch_id.0)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sqlx::query(
            "UPDATE user_batches SET status = 'processing' WHERE id = ANY($1::uuid[]) AND status = 'queued'",
        )
        .bind(&owners)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_open_provider_batches(&self, check_type: CheckType) -> Result<Vec<ProviderBatch>> {
        let rows = sqlx::query_as::<_, ProviderBatch>(
            r#"
            SELECT * FROM provider_batches
            WHERE check_type = $1 AND status IN ('pending', 'processing')
            ORDER BY created_at ASC
            "#,
        )
        .bind(check_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_provider_progress(&self, id: &ProviderBatchId, processed: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE provider_batches
            SET status = 'processing', processed = $2, poll_attempts = 0, updated_at = NOW()
            WHERE provider_batch_id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(processed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_poll_attempts(&self, id: &ProviderBatchId) -> Result<i32> {
        let attempts: i32 = sqlx::query_scalar(
            r#"
            UPDATE provider_batches
            SET poll_attempts = poll_attempts + 1, updated_at = NOW()
            WHERE provider_batch_id = $1
            RETURNING poll_attempts
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound {
            resource: "ProviderBatch",
            id: id.to_string(),
        })?;
        Ok(attempts)
    }

    async fn fail_provider_batch(&self, id: &ProviderBatchId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE provider_batches
            SET status = 'failed', updated_at = NOW()
            WHERE provider_batch_id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        // Release assignments so the packer re-packs these emails.
        sqlx::query("DELETE FROM provider_batch_emails WHERE provider_batch_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, records), fields(provider_batch_id = %id, count = records.len()))]
    async fn apply_provider_results(
        &self,
        id: &ProviderBatchId,
        records: &[ProviderRecord],
    ) -> Result<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;

        // Mark completed first; losing this update means a duplicate delivery.
        let check_type: Option<CheckType> = sqlx::query_scalar(
            r#"
            UPDATE provider_batches
            SET status = 'completed', processed = email_count, updated_at = NOW()
            WHERE provider_batch_id = $1 AND status IN ('pending', 'processing')
            RETURNING check_type
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(check_type) = check_type else {
            tracing::debug!(provider_batch_id = %id, "Completion already applied, skipping");
            return Ok(ApplyOutcome::duplicate());
        };

        // Resolve stripped addresses through this batch's assignment rows.
        let assignment_rows = sqlx::query(
            r#"
            SELECT ge.email_stripped, pbe.email_id, pbe.batch_id
            FROM provider_batch_emails pbe
            JOIN global_emails ge ON ge.id = pbe.email_id
            WHERE pbe.provider_batch_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let mut assigned: HashMap<String, GlobalEmailId> = HashMap::new();
        let mut owners: HashSet<UserBatchId> = HashSet::new();
        for row in assignment_rows {
            let stripped: String = row.try_get("email_stripped").map_err(Error::from)?;
            let email_id: GlobalEmailId = row.try_get("email_id").map_err(Error::from)?;
            let batch_id: UserBatchId = row.try_get("batch_id").map_err(Error::from)?;
            assigned.insert(stripped, email_id);
            owners.insert(batch_id);
        }

        let mut outcome = ApplyOutcome::default();
        let mut resolved: Vec<i64> = Vec::new();
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

            match check_type {
                CheckType::Deliverable => {
                    sqlx::query(
                        r#"
                        INSERT INTO deliverable_results
                            (email_id, status, reason, is_catchall, score, provider, updated_at)
                        VALUES ($1, $2, $3, $4, $5, $6, NOW())
                        ON CONFLICT (email_id) DO UPDATE SET
                            status = EXCLUDED.status,
                            reason = EXCLUDED.reason,
                            is_catchall = EXCLUDED.is_catchall,
                            score = EXCLUDED.score,
                            provider = EXCLUDED.provider,
                            updated_at = EXCLUDED.updated_at
                        "#,
                    )
                    .bind(email_id)
                    .bind(VerdictStatus::parse(
                        record.status.as_deref().unwrap_or("unknown"),
                    ))
                    .bind(record.reason.as_deref().unwrap_or("unknown"))
                    .bind(record.is_catchall.as_deref().is_some_and(|v| v != "no"))
                    .bind(record.score.unwrap_or(0))
                    .bind(record.provider.as_deref().unwrap_or("other"))
                    .execute(&mut *tx)
                    .await?;
                }
                CheckType::Catchall => {
                    sqlx::query(
                        r#"
                        INSERT INTO catchall_results (email_id, status, toxicity, updated_at)
                        VALUES ($1, $2, $3, NOW())
                        ON CONFLICT (email_id) DO UPDATE SET
                            status = EXCLUDED.status,
                            toxicity = EXCLUDED.toxicity,
                            updated_at = EXCLUDED.updated_at
                        "#,
                    )
                    .bind(email_id)
                    .bind(VerdictStatus::parse(
                        record.status.as_deref().unwrap_or("unknown"),
                    ))
                    .bind(record.toxicity.unwrap_or(0))
                    .execute(&mut *tx)
                    .await?;
                }
            }

            resolved.push(email_id.0);
            outcome.applied += 1;
        }

        // Flip associations across every batch of this check-type that holds
        // one of the resolved addresses.
        let touched: Vec<UserBatchId> = sqlx::query_scalar(
            r#"
            UPDATE batch_emails be
            SET did_complete = TRUE
            FROM user_batches ub
            WHERE ub.id = be.batch_id
              AND ub.check_type = $1
              AND be.email_id = ANY($2::bigint[])
              AND be.did_complete = FALSE
            RETURNING be.batch_id
            "#,
        )
        .bind(check_type)
        .bind(&resolved)
        .fetch_all(&mut *tx)
        .await?;

        let mut candidates: Vec<UserBatchId> = owners
            .into_iter()
            .chain(touched)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        candidates.sort();

        for batch_id in candidates {
            let completed = sqlx::query_as::<_, UserBatch>(
                r#"
                UPDATE user_batches
                SET status = 'completed', completed_at = NOW()
                WHERE id = $1
                  AND status = 'processing'
                  AND NOT EXISTS (
                      SELECT 1 FROM batch_emails
                      WHERE batch_id = $1 AND did_complete = FALSE
                  )
                RETURNING *
                "#,
            )
            .bind(batch_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(batch) = completed {
                outcome.completed.push(batch);
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn sweep_stuck_batches(&self, check_type: CheckType) -> Result<Vec<UserBatch>> {
        let completed = sqlx::query_as::<_, UserBatch>(
            r#"
            UPDATE user_batches ub
            SET status = 'completed', completed_at = NOW()
            WHERE ub.check_type = $1
              AND ub.status = 'processing'
              AND ub.is_archived = FALSE
              AND EXISTS (SELECT 1 FROM batch_emails be WHERE be.batch_id = ub.id)
              AND NOT EXISTS (
                  SELECT 1 FROM batch_emails be
                  WHERE be.batch_id = ub.id AND be.did_complete = FALSE
              )
            RETURNING *
            "#,
        )
        .bind(check_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(completed)
    }

    async fn credit_summary(&self, user: UserId, check_type: CheckType) -> Result<CreditSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE((
                    SELECT SUM(credits_left) FROM subscription_credits
                    WHERE user_id = $1 AND check_type = $2 AND expires_at > NOW()
                ), 0)::bigint AS subscription_left,
                COALESCE((
                    SELECT balance FROM credit_accounts
                    WHERE user_id = $1 AND check_type = $2
                ), 0)::bigint AS one_off_balance
            "#,
        )
        .bind(user)
        .bind(check_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(CreditSummary {
            subscription_left: row.try_get("subscription_left").map_err(Error::from)?,
            one_off_balance: row.try_get("one_off_balance").map_err(Error::from)?,
        })
    }

    #[tracing::instrument(skip(self), fields(user = %user, check_type = %check_type, batch_id = %batch_id))]
    async fn deduct_for_batch(
        &self,
        user: UserId,
        check_type: CheckType,
        batch_id: UserBatchId,
        subscription_first: bool,
    ) -> Result<DeductionReceipt> {
        let mut tx = self.pool.begin().await?;

        let required: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM batch_emails WHERE batch_id = $1")
                .bind(batch_id)
                .fetch_one(&mut *tx)
                .await?;

        // Row-lock the subscription buckets, oldest expiry first.
        let subscriptions = sqlx::query_as::<_, SubscriptionCredits>(
            r#"
            SELECT * FROM subscription_credits
            WHERE user_id = $1 AND check_type = $2 AND expires_at > NOW()
            ORDER BY expires_at ASC
            FOR UPDATE
            "#,
        )
        .bind(user)
        .bind(check_type)
        .fetch_all(&mut *tx)
        .await?;

        let one_off_balance: i64 = sqlx::query_scalar(
            "SELECT balance FROM credit_accounts WHERE user_id = $1 AND check_type = $2 FOR UPDATE",
        )
        .bind(user)
        .bind(check_type)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(0);

        let subscription_left: i64 = subscriptions.iter().map(|s| s.credits_left).sum();
        let available = subscription_left + one_off_balance;
        if required > available {
            return Err(Error::InsufficientCredits {
                required,
                available,
            });
        }

        let (mut subscription_need, one_off_used) = if subscription_first {
            let sub = subscription_left.min(required);
            (sub, required - sub)
        } else {
            let one_off = one_off_balance.min(required);
            (required - one_off, one_off)
        };
        let subscription_used = subscription_need;

        for bucket in &subscriptions {
            if subscription_need == 0 {
                break;
            }
            let take = bucket.credits_left.min(subscription_need);
            sqlx::query(
                r#"
                UPDATE subscription_credits
                SET credits_left = credits_left - $3
                WHERE user_id = $1 AND check_type = $2 AND expires_at = $4
                "#,
            )
            .bind(user)
            .bind(check_type)
            .bind(take)
            .bind(bucket.expires_at)
            .execute(&mut *tx)
            .await?;
            subscription_need -= take;
        }

        if one_off_used > 0 {
            sqlx::query(
                r#"
                UPDATE credit_accounts
                SET balance = balance - $3
                WHERE user_id = $1 AND check_type = $2
                "#,
            )
            .bind(user)
            .bind(check_type)
            .bind(one_off_used)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO credit_history (user_id, check_type, credits_used, event_type, batch_id)
            VALUES ($1, $2, $3, 'usage', $4)
            "#,
        )
        .bind(user)
        .bind(check_type)
        .bind(required)
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;

        let balance: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO credit_accounts (user_id, check_type, balance)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, check_type)
            DO UPDATE SET balance = credit_accounts.balance + EXCLUDED.balance
            RETURNING balance
            "#,
        )
        .bind(user)
        .bind(check_type)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO credit_history (user_id, check_type, credits_used, event_type)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user)
        .bind(check_type)
        .bind(amount)
        .bind(event)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(balance)
    }

    async fn set_subscription(
        &self,
        user: UserId,
        check_type: CheckType,
        credits: i64,
        expires_at: Timestamp,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_credits (user_id, check_type, credits_start, credits_left, expires_at)
            VALUES ($1, $2, $3, $3, $4)
            ON CONFLICT (user_id, check_type) DO UPDATE SET
                credits_start = EXCLUDED.credits_start,
                credits_left = EXCLUDED.credits_left,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(user)
        .bind(check_type)
        .bind(credits)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn credit_history(&self, user: UserId) -> Result<Vec<CreditHistoryEntry>> {
        let rows = sqlx::query_as::<_, CreditHistoryEntry>(
            r#"
            SELECT user_id, check_type, credits_used, event_type, batch_id, used_at
            FROM credit_history
            WHERE user_id = $1
            ORDER BY used_at DESC
            "#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn rate_window_sum(
        &self,
        check_type: CheckType,
        kind: RequestKind,
        since: Timestamp,
    ) -> Result<i64> {
        let sum: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(request_count), 0)::bigint
            FROM rate_counters
            WHERE verification_type = $1 AND request_type = $2 AND window_start >= $3
            "#,
        )
        .bind(check_type)
        .bind(kind)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    async fn record_rate(&self, check_type: CheckType, kind: RequestKind, n: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_counters (verification_type, request_type, request_count)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(check_type)
        .bind(kind)
        .bind(n)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_rate_counters(&self, older_than: Timestamp) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM rate_counters WHERE window_start < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn begin_enrichment(&self, batch_id: UserBatchId, check_type: CheckType) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO enrichment_progress (batch_id, check_type, status, rows_processed, started_at)
            VALUES ($1, $2, 'processing', 0, NOW())
            ON CONFLICT (batch_id, check_type) DO UPDATE SET
                status = 'processing',
                rows_processed = 0,
                started_at = NOW(),
                completed_at = NULL,
                error_message = NULL
            "#,
        )
        .bind(batch_id)
        .bind(check_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_enrichment_rows(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
        rows: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE enrichment_progress
            SET rows_processed = $3
            WHERE batch_id = $1 AND check_type = $2
            "#,
        )
        .bind(batch_id)
        .bind(check_type)
        .bind(rows)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_enrichment(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE enrichment_progress
            SET status = 'completed', completed_at = NOW()
            WHERE batch_id = $1 AND check_type = $2
            "#,
        )
        .bind(batch_id)
        .bind(check_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_enrichment(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE enrichment_progress
            SET status = 'failed', completed_at = NOW(), error_message = $3
            WHERE batch_id = $1 AND check_type = $2
            "#,
        )
        .bind(batch_id)
        .bind(check_type)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_enrichment(
        &self,
        batch_id: UserBatchId,
        check_type: CheckType,
    ) -> Result<Option<EnrichmentProgress>> {
        let row = sqlx::query_as::<_, EnrichmentProgress>(
            "SELECT * FROM enrichment_progress WHERE batch_id = $1 AND check_type = $2",
        )
        .bind(batch_id)
        .bind(check_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn enrichment_results(
        &self,
        batch_id: UserBatchId,
    ) -> Result<HashMap<String, VerificationResult>> {
        let batch = self.get_batch(batch_id).await?;

        #[derive(sqlx::FromRow)]
        struct DeliverableRow {
            email_stripped: String,
            #[sqlx(flatten)]
            result: DeliverableResult,
        }

        #[derive(sqlx::FromRow)]
        struct CatchallRow {
            email_stripped: String,
            #[sqlx(flatten)]
            result: CatchallResult,
        }

        let mut map = HashMap::new();
        match batch.check_type {
            CheckType::Deliverable => {
                let rows = sqlx::query_as::<_, DeliverableRow>(
                    r#"
                    SELECT ge.email_stripped, r.*
                    FROM batch_emails be
                    JOIN global_emails ge ON ge.id = be.email_id
                    JOIN deliverable_results r ON r.email_id = be.email_id
                    WHERE be.batch_id = $1
                    "#,
                )
                .bind(batch_id)
                .fetch_all(&self.pool)
                .await?;
                for row in rows {
                    map.insert(
                        row.email_stripped,
                        VerificationResult::Deliverable(row.result),
                    );
                }
            }
            CheckType::Catchall => {
                let rows = sqlx::query_as::<_, CatchallRow>(
                    r#"
                    SELECT ge.email_stripped, r.*
                    FROM batch_emails be
                    JOIN global_emails ge ON ge.id = be.email_id
                    JOIN catchall_results r ON r.email_id = be.email_id
                    WHERE be.batch_id = $1
                    "#,
                )
                .bind(batch_id)
                .fetch_all(&self.pool)
                .await?;
                for row in rows {
                    map.insert(row.email_stripped, VerificationResult::Catchall(row.result));
                }
            }
        }
        Ok(map)
    }

    async fn record_exports(
        &self,
        batch_id: UserBatchId,
        exports: HashMap<ExportKind, ExportObjectMeta>,
    ) -> Result<bool> {
        let by_name: HashMap<String, ExportObjectMeta> = exports
            .into_iter()
            .map(|(kind, meta)| (kind.as_str().to_string(), meta))
            .collect();

        let rows_affected = sqlx::query(
            "UPDATE user_batches SET export_meta = $2 WHERE id = $1 AND export_meta IS NULL",
        )
        .bind(batch_id)
        .bind(Json(by_name))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }
}
