//! Completion hook fan-out.
//!
//! A hook fires once per user-batch completion, from whichever path won the
//! conditional status update (result application, the sweeper, or a fully
//! cached start). Hooks are fire-and-forget: implementations handle their own
//! failures, and nothing they do reverts a completion.

use std::sync::Arc;

use async_trait::async_trait;

use crate::store::UserBatch;
use crate::types::{CheckType, UserBatchId, UserId};

/// Callback invoked once per user-batch completion.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_batch_completed(
        &self,
        user_id: UserId,
        check_type: CheckType,
        batch_id: UserBatchId,
        title: &str,
    );
}

/// Ordered collection of hooks sharing one completion event.
#[derive(Clone, Default)]
pub struct CompletionHooks {
    hooks: Vec<Arc<dyn CompletionHook>>,
}

impl CompletionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Fire every hook for a completed batch.
    pub async fn fire(&self, batch: &UserBatch) {
        tracing::info!(
            batch_id = %batch.id,
            user_id = %batch.user_id,
            check_type = %batch.check_type,
            title = %batch.title,
            "User batch completed"
        );
        for hook in &self.hooks {
            hook.on_batch_completed(batch.user_id, batch.check_type, batch.id, &batch.title)
                .await;
        }
    }
}

/// Notification stub: the delivery transport lives outside the engine, so
/// completion events are surfaced as structured log lines here.
pub struct LogNotifier;

#[async_trait]
impl CompletionHook for LogNotifier {
    async fn on_batch_completed(
        &self,
        user_id: UserId,
        check_type: CheckType,
        batch_id: UserBatchId,
        title: &str,
    ) {
        tracing::info!(
            user_id = %user_id,
            check_type = %check_type,
            batch_id = %batch_id,
            title = %title,
            "Batch completion notification"
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Records every completion event it receives.
    #[derive(Default)]
    pub struct RecordingHook {
        pub events: Mutex<Vec<(UserId, CheckType, UserBatchId, String)>>,
    }

    #[async_trait]
    impl CompletionHook for RecordingHook {
        async fn on_batch_completed(
            &self,
            user_id: UserId,
            check_type: CheckType,
            batch_id: UserBatchId,
            title: &str,
        ) {
            self.events
                .lock()
                .push((user_id, check_type, batch_id, title.to_string()));
        }
    }
}
