//! Sliding-window rate governor for provider API calls.
//!
//! Contract: before any provider call, succeed [`RateGovernor::check`] and
//! then [`RateGovernor::record`]. The window is the trailing 60 seconds; the
//! usable budget is the per-minute limit minus a buffer.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::store::Store;
use crate::types::{CheckType, RequestKind};

/// Length of the sliding window the counters are summed over.
const WINDOW_SECONDS: i64 = 60;

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether one more request fits in the window
    pub can_proceed: bool,
    /// Requests recorded in the current window
    pub current: i64,
    /// Usable budget (per-minute limit minus buffer)
    pub limit: i64,
}

pub struct RateGovernor<S> {
    store: Arc<S>,
    limit: i64,
}

impl<S: Store> RateGovernor<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            store,
            limit: config.rate_limit_per_minute - config.rate_limit_buffer,
        }
    }

    /// Sum the window and decide whether one more request fits.
    pub async fn check(&self, check_type: CheckType, kind: RequestKind) -> Result<RateDecision> {
        let since = Utc::now() - Duration::seconds(WINDOW_SECONDS);
        let current = self.store.rate_window_sum(check_type, kind, since).await?;
        Ok(RateDecision {
            can_proceed: current + 1 <= self.limit,
            current,
            limit: self.limit,
        })
    }

    /// Record `n` requests against the window.
    pub async fn record(&self, check_type: CheckType, kind: RequestKind, n: i64) -> Result<()> {
        self.store.record_rate(check_type, kind, n).await
    }

    /// Drop counter rows that can no longer affect any window. Optional
    /// hygiene; correctness does not depend on it.
    pub async fn prune(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::seconds(WINDOW_SECONDS * 2);
        self.store.prune_rate_counters(cutoff).await
    }
}
