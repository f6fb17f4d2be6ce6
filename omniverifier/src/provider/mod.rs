//! Verification provider abstraction.
//!
//! The engine talks to the external verification API through the
//! [`VerificationProvider`] trait, enabling testability with a mock
//! implementation. Three request kinds exist — batch creation, status
//! polling and result download — and every call is subject to rate
//! governance by the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CheckType, ProviderBatchId};

pub mod http;
pub mod mock;

pub use http::ReqwestProvider;
pub use mock::{MockCall, MockProvider};

/// Errors from the provider client, classified for the lifecycle policy:
/// rate limits and 5xx defer with backoff, payment-required dead-letters,
/// anything else terminal fails the batch.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 429-class reply; retry after backoff
    #[error("provider rate limited the request")]
    RateLimited,

    /// 402-class reply; dead-letter, never retried
    #[error("provider rejected the request for payment reasons: {0}")]
    PaymentRequired(String),

    /// Non-2xx reply outside the classes above
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Transport-level failure
    #[error("provider request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Reply body did not parse
    #[error("provider reply was malformed: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether the lifecycle poller should back off and try again.
    pub fn is_retriable(&self) -> bool {
        match self {
            ProviderError::RateLimited | ProviderError::Network(_) => true,
            ProviderError::Http { status, .. } => *status >= 500,
            ProviderError::PaymentRequired(_) | ProviderError::Malformed(_) => false,
        }
    }
}

/// Status reported by the provider for one of its batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderBatchState {
    /// Accepted but not started
    Pending,
    /// In progress; `processed` counts verified addresses so far
    Processing { processed: i64 },
    /// Finished; results are ready for download
    Completed,
    /// Terminal failure on the provider side
    Failed { reason: Option<String> },
}

/// One verification record from a completion payload.
///
/// Unknown fields are ignored; missing fields default downstream
/// (`status`/`reason` to `unknown`, `score`/`toxicity` to 0, catch-all
/// derived from the raw flag not being `"no"`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub email: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub is_catchall: Option<String>,
    #[serde(default)]
    pub score: Option<i32>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub toxicity: Option<i32>,
}

/// Client for the external verification API.
#[async_trait]
pub trait VerificationProvider: Send + Sync {
    /// Submit a batch of stripped addresses; returns the provider's batch id.
    async fn create_batch(
        &self,
        check_type: CheckType,
        emails: &[String],
    ) -> Result<ProviderBatchId, ProviderError>;

    /// Poll the status of a previously created batch.
    async fn check_status(
        &self,
        check_type: CheckType,
        id: &ProviderBatchId,
    ) -> Result<ProviderBatchState, ProviderError>;

    /// Download the completion payload of a finished batch.
    async fn download_results(
        &self,
        check_type: CheckType,
        id: &ProviderBatchId,
    ) -> Result<Vec<ProviderRecord>, ProviderError>;
}
