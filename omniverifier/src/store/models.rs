//! Persisted entity types and the input/output shapes of store operations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::types::{
    BatchStatus, CheckType, CreditEvent, EnrichmentStatus, GlobalEmailId, Outcome, ProviderBatchId,
    ProviderBatchStatus, Timestamp, UserBatchId, UserId, VerdictStatus,
};

/// An interned stripped address. Append-only; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct GlobalEmail {
    pub id: GlobalEmailId,
    pub email_stripped: String,
}

/// Metadata describing the customer-uploaded source object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub s3_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub column_mapping: ColumnMapping,
}

/// Column positions within the uploaded source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Zero-based index of the email column
    pub email: usize,
}

/// Metadata recorded per generated export object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportObjectMeta {
    pub s3_key: String,
    pub generated_at: Timestamp,
    /// Data row count of the export
    pub size: i64,
    pub status: EnrichmentStatus,
}

/// A customer-submitted collection of addresses of one check-type.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserBatch {
    pub id: UserBatchId,
    pub user_id: UserId,
    pub check_type: CheckType,
    pub title: String,
    pub status: BatchStatus,
    pub total_emails: i64,
    pub is_archived: bool,
    pub source_meta: Option<Json<SourceMeta>>,
    pub export_meta: Option<Json<HashMap<String, ExportObjectMeta>>>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

/// Input for creating a user batch.
#[derive(Debug, Clone)]
pub struct NewUserBatch {
    pub user_id: UserId,
    pub check_type: CheckType,
    pub title: String,
    pub source_meta: Option<SourceMeta>,
}

/// Membership of one interned address in one user batch.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct BatchEmailAssociation {
    pub batch_id: UserBatchId,
    pub email_id: GlobalEmailId,
    pub email_nominal: String,
    pub used_cached: bool,
    pub did_complete: bool,
}

/// Input row for [`add_batch_emails`](super::Store::add_batch_emails).
#[derive(Debug, Clone)]
pub struct AssociationEntry {
    pub email_id: GlobalEmailId,
    pub email_nominal: String,
    pub used_cached: bool,
    pub did_complete: bool,
}

/// Stored deliverability verdict for one address.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeliverableResult {
    pub email_id: GlobalEmailId,
    pub status: VerdictStatus,
    pub reason: String,
    pub is_catchall: bool,
    pub score: i32,
    pub provider: String,
    pub updated_at: Timestamp,
}

/// Stored catch-all verdict for one address.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CatchallResult {
    pub email_id: GlobalEmailId,
    pub status: VerdictStatus,
    pub toxicity: i32,
    pub updated_at: Timestamp,
}

/// A cached verification result of either check-type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Deliverable(DeliverableResult),
    Catchall(CatchallResult),
}

impl VerificationResult {
    pub fn email_id(&self) -> GlobalEmailId {
        match self {
            VerificationResult::Deliverable(r) => r.email_id,
            VerificationResult::Catchall(r) => r.email_id,
        }
    }

    pub fn check_type(&self) -> CheckType {
        match self {
            VerificationResult::Deliverable(_) => CheckType::Deliverable,
            VerificationResult::Catchall(_) => CheckType::Catchall,
        }
    }

    /// Raw stored status, used by the enrichment row filter.
    pub fn status(&self) -> VerdictStatus {
        match self {
            VerificationResult::Deliverable(r) => r.status,
            VerificationResult::Catchall(r) => r.status,
        }
    }

    /// User-visible translation of this result.
    pub fn outcome(&self) -> Outcome {
        match self {
            VerificationResult::Deliverable(r) => {
                if r.is_catchall
                    || (r.status == VerdictStatus::Risky && r.reason == "low_deliverability")
                {
                    Outcome::CatchAll
                } else if r.status == VerdictStatus::Deliverable {
                    Outcome::Valid
                } else {
                    Outcome::Invalid
                }
            }
            VerificationResult::Catchall(r) => match r.status {
                VerdictStatus::Deliverable => Outcome::Good,
                VerdictStatus::Risky => Outcome::Risky,
                _ => Outcome::Bad,
            },
        }
    }

    /// Mail-server column value for deliverable exports; `other` is blanked.
    pub fn mail_server(&self) -> Option<&str> {
        match self {
            VerificationResult::Deliverable(r) if r.provider != "other" => Some(&r.provider),
            _ => None,
        }
    }
}

/// A unit sent to the external verification API; may contain emails from
/// multiple user batches.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderBatch {
    pub provider_batch_id: ProviderBatchId,
    pub check_type: CheckType,
    pub primary_batch_id: UserBatchId,
    pub status: ProviderBatchStatus,
    pub email_count: i64,
    pub processed: i64,
    pub poll_attempts: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Resolves which user batch owned an email within a provider batch.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ProviderBatchEmail {
    pub provider_batch_id: ProviderBatchId,
    pub email_id: GlobalEmailId,
    pub batch_id: UserBatchId,
}

/// One email eligible for packing, in FIFO order.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PackableEmail {
    pub batch_id: UserBatchId,
    pub email_id: GlobalEmailId,
    pub email_stripped: String,
}

/// Input recorded atomically after a successful provider submission.
#[derive(Debug, Clone)]
pub struct NewProviderBatch {
    pub provider_batch_id: ProviderBatchId,
    pub check_type: CheckType,
    pub primary_batch_id: UserBatchId,
    pub assignments: Vec<Assignment>,
}

/// One `(email, owning user batch)` pair inside a provider batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub email_id: GlobalEmailId,
    pub batch_id: UserBatchId,
}

/// Result of applying a completion payload.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Records written to the result cache
    pub applied: usize,
    /// Records skipped (malformed or unresolvable)
    pub skipped: usize,
    /// User batches this application completed, exactly once each
    pub completed: Vec<UserBatch>,
}

impl ApplyOutcome {
    /// A duplicate delivery: the provider batch was already completed.
    pub fn duplicate() -> Self {
        Self::default()
    }
}

/// Advisory view of a user's available credits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditSummary {
    pub subscription_left: i64,
    pub one_off_balance: i64,
}

impl CreditSummary {
    pub fn total(&self) -> i64 {
        self.subscription_left + self.one_off_balance
    }
}

/// Receipt of an authoritative deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeductionReceipt {
    pub total_deducted: i64,
    pub subscription_used: i64,
    pub one_off_used: i64,
    /// Credits remaining across both pools after the deduction
    pub remaining_total: i64,
}

/// Subscription credit bucket; use-or-lose, spent before one-off credits.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SubscriptionCredits {
    pub user_id: UserId,
    pub check_type: CheckType,
    pub credits_start: i64,
    pub credits_left: i64,
    pub expires_at: Timestamp,
}

/// Ledger line.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CreditHistoryEntry {
    pub user_id: UserId,
    pub check_type: CheckType,
    pub credits_used: i64,
    pub event_type: CreditEvent,
    pub batch_id: Option<UserBatchId>,
    pub used_at: Timestamp,
}

/// Progress row for one enrichment run.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct EnrichmentProgress {
    pub batch_id: UserBatchId,
    pub check_type: CheckType,
    pub status: EnrichmentStatus,
    pub rows_processed: i64,
    pub total_rows: Option<i64>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;

    fn deliverable(
        status: VerdictStatus,
        reason: &str,
        is_catchall: bool,
        provider: &str,
    ) -> VerificationResult {
        VerificationResult::Deliverable(DeliverableResult {
            email_id: GlobalEmailId(1),
            status,
            reason: reason.to_string(),
            is_catchall,
            score: 0,
            provider: provider.to_string(),
            updated_at: Utc::now(),
        })
    }

    fn catchall(status: VerdictStatus) -> VerificationResult {
        VerificationResult::Catchall(CatchallResult {
            email_id: GlobalEmailId(1),
            status,
            toxicity: 0,
            updated_at: Utc::now(),
        })
    }

    #[rstest]
    #[case(VerdictStatus::Deliverable, "accepted", false, Outcome::Valid)]
    #[case(VerdictStatus::Deliverable, "accepted", true, Outcome::CatchAll)]
    #[case(VerdictStatus::Risky, "low_deliverability", false, Outcome::CatchAll)]
    #[case(VerdictStatus::Risky, "low_quality", false, Outcome::Invalid)]
    #[case(VerdictStatus::Undeliverable, "rejected", false, Outcome::Invalid)]
    #[case(VerdictStatus::Unknown, "unknown", false, Outcome::Invalid)]
    fn deliverable_translation(
        #[case] status: VerdictStatus,
        #[case] reason: &str,
        #[case] is_catchall: bool,
        #[case] expected: Outcome,
    ) {
        assert_eq!(
            deliverable(status, reason, is_catchall, "google").outcome(),
            expected
        );
    }

    #[rstest]
    #[case(VerdictStatus::Deliverable, Outcome::Good)]
    #[case(VerdictStatus::Risky, Outcome::Risky)]
    #[case(VerdictStatus::Undeliverable, Outcome::Bad)]
    #[case(VerdictStatus::Unknown, Outcome::Bad)]
    fn catchall_translation(#[case] status: VerdictStatus, #[case] expected: Outcome) {
        assert_eq!(catchall(status).outcome(), expected);
    }

    #[test]
    fn other_mail_server_is_blanked() {
        assert_eq!(
            deliverable(VerdictStatus::Deliverable, "ok", false, "google").mail_server(),
            Some("google")
        );
        assert_eq!(
            deliverable(VerdictStatus::Deliverable, "ok", false, "other").mail_server(),
            None
        );
    }
}
