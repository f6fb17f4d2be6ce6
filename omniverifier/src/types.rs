//! Identifier and status types shared across the engine.
//!
//! The check-type is a closed enum rather than a table-name string: every
//! repository method that touches per-type state takes a [`CheckType`] and
//! dispatches internally, so call sites stay generic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The verification product a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CheckType {
    /// Deliverability classification of individual addresses.
    Deliverable,
    /// Catch-all toxicity scoring of accepting domains.
    Catchall,
}

impl CheckType {
    pub const ALL: [CheckType; 2] = [CheckType::Deliverable, CheckType::Catchall];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Deliverable => "deliverable",
            CheckType::Catchall => "catchall",
        }
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for a user.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

impl From<Uuid> for UserId {
    fn from(uuid: Uuid) -> Self {
        UserId(uuid)
    }
}

impl std::ops::Deref for UserId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a user batch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserBatchId(pub Uuid);

impl From<Uuid> for UserBatchId {
    fn from(uuid: Uuid) -> Self {
        UserBatchId(uuid)
    }
}

impl std::ops::Deref for UserBatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for UserBatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifier of an interned stripped address. Append-only, never recycled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct GlobalEmailId(pub i64);

impl From<i64> for GlobalEmailId {
    fn from(id: i64) -> Self {
        GlobalEmailId(id)
    }
}

impl std::fmt::Display for GlobalEmailId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned by the external verification provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct ProviderBatchId(pub String);

impl From<String> for ProviderBatchId {
    fn from(id: String) -> Self {
        ProviderBatchId(id)
    }
}

impl From<&str> for ProviderBatchId {
    fn from(id: &str) -> Self {
        ProviderBatchId(id.to_string())
    }
}

impl std::ops::Deref for ProviderBatchId {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ProviderBatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a user batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BatchStatus {
    Draft,
    Queued,
    Processing,
    Paused,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Draft => "draft",
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a provider batch.
///
/// ```text
/// pending ──first-progress──► processing ──terminal-ok──► completed
///    │                             │
///    └────────── terminal-error ───┴──► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProviderBatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProviderBatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderBatchStatus::Pending => "pending",
            ProviderBatchStatus::Processing => "processing",
            ProviderBatchStatus::Completed => "completed",
            ProviderBatchStatus::Failed => "failed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ProviderBatchStatus::Pending | ProviderBatchStatus::Processing
        )
    }
}

impl std::fmt::Display for ProviderBatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of an enrichment run for one `(batch, check_type)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    Processing,
    Completed,
    Failed,
}

/// Ledger event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CreditEvent {
    Usage,
    Purchase,
    ReferReward,
}

/// The three provider request kinds subject to rate governance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RequestKind {
    CreateBatch,
    CheckStatus,
    DownloadResults,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::CreateBatch => "create_batch",
            RequestKind::CheckStatus => "check_status",
            RequestKind::DownloadResults => "download_results",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw deliverability classification as stored from provider replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum VerdictStatus {
    Deliverable,
    Undeliverable,
    Risky,
    Unknown,
}

impl VerdictStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "deliverable" => VerdictStatus::Deliverable,
            "undeliverable" => VerdictStatus::Undeliverable,
            "risky" => VerdictStatus::Risky,
            _ => VerdictStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Deliverable => "deliverable",
            VerdictStatus::Undeliverable => "undeliverable",
            VerdictStatus::Risky => "risky",
            VerdictStatus::Unknown => "unknown",
        }
    }
}

/// User-visible translation of a stored result, used for export partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Valid,
    CatchAll,
    Invalid,
    Good,
    Risky,
    Bad,
}

impl Outcome {
    /// Label written into the synthesised status column.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Valid => "Valid",
            Outcome::CatchAll => "Catch-All",
            Outcome::Invalid => "Invalid",
            Outcome::Good => "Good",
            Outcome::Risky => "Risky",
            Outcome::Bad => "Bad",
        }
    }

    /// The filtered export this outcome lands in, next to `all_emails`.
    pub fn partition(&self) -> ExportKind {
        match self {
            Outcome::Valid => ExportKind::ValidOnly,
            Outcome::CatchAll => ExportKind::CatchallOnly,
            Outcome::Invalid => ExportKind::InvalidOnly,
            Outcome::Good => ExportKind::GoodOnly,
            Outcome::Risky => ExportKind::RiskyOnly,
            Outcome::Bad => ExportKind::BadOnly,
        }
    }
}

/// Named export artifacts produced by enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    AllEmails,
    ValidOnly,
    InvalidOnly,
    CatchallOnly,
    GoodOnly,
    BadOnly,
    RiskyOnly,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::AllEmails => "all_emails",
            ExportKind::ValidOnly => "valid_only",
            ExportKind::InvalidOnly => "invalid_only",
            ExportKind::CatchallOnly => "catchall_only",
            ExportKind::GoodOnly => "good_only",
            ExportKind::BadOnly => "bad_only",
            ExportKind::RiskyOnly => "risky_only",
        }
    }
}

impl std::fmt::Display for ExportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion timestamp pair carried by a few progress queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub total: i64,
    pub completed: i64,
}

impl BatchProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.completed as f64 / self.total as f64) * 100.0
        }
    }
}

/// Timestamps are UTC everywhere in the engine.
pub type Timestamp = DateTime<Utc>;
