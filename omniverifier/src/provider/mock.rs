//! Mock provider for testing.
//!
//! Allows scripting batch ids, status sequences and result payloads without
//! real HTTP calls, and records every call made.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{CheckType, ProviderBatchId};

use async_trait::async_trait;

use super::{ProviderBatchState, ProviderError, ProviderRecord, VerificationProvider};

/// Record of a call made to the mock provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateBatch {
        check_type: CheckType,
        emails: Vec<String>,
    },
    CheckStatus {
        check_type: CheckType,
        id: ProviderBatchId,
    },
    DownloadResults {
        check_type: CheckType,
        id: ProviderBatchId,
    },
}

#[derive(Default)]
struct MockState {
    create_replies: Vec<Result<ProviderBatchId, ProviderError>>,
    status_replies: HashMap<ProviderBatchId, Vec<Result<ProviderBatchState, ProviderError>>>,
    results: HashMap<ProviderBatchId, Result<Vec<ProviderRecord>, ProviderError>>,
    calls: Vec<MockCall>,
    created: u64,
}

/// Scripted provider. Creation replies are consumed FIFO; when the script is
/// empty, batch ids are generated (`pb-1`, `pb-2`, …). Status replies are
/// consumed FIFO per batch id, repeating the last entry once drained.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_create(&self, reply: Result<ProviderBatchId, ProviderError>) {
        self.state.lock().create_replies.push(reply);
    }

    pub fn script_status(
        &self,
        id: impl Into<ProviderBatchId>,
        reply: Result<ProviderBatchState, ProviderError>,
    ) {
        self.state
            .lock()
            .status_replies
            .entry(id.into())
            .or_default()
            .push(reply);
    }

    pub fn script_results(
        &self,
        id: impl Into<ProviderBatchId>,
        reply: Result<Vec<ProviderRecord>, ProviderError>,
    ) {
        self.state.lock().results.insert(id.into(), reply);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn created_batches(&self) -> usize {
        let state = self.state.lock();
        state
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::CreateBatch { .. }))
            .count()
    }
}

fn clone_state_reply(
    reply: &Result<ProviderBatchState, ProviderError>,
) -> Result<ProviderBatchState, ProviderError> {
    match reply {
        Ok(state) => Ok(state.clone()),
        Err(e) => Err(clone_error(e)),
    }
}

fn clone_error(e: &ProviderError) -> ProviderError {
    match e {
        ProviderError::RateLimited => ProviderError::RateLimited,
        ProviderError::PaymentRequired(msg) => ProviderError::PaymentRequired(msg.clone()),
        ProviderError::Http { status, body } => ProviderError::Http {
            status: *status,
            body: body.clone(),
        },
        // reqwest errors are not cloneable; surface an equivalent HTTP 599
        ProviderError::Network(e) => ProviderError::Http {
            status: 599,
            body: e.to_string(),
        },
        ProviderError::Malformed(msg) => ProviderError::Malformed(msg.clone()),
    }
}

#[async_trait]
impl VerificationProvider for MockProvider {
    async fn create_batch(
        &self,
        check_type: CheckType,
        emails: &[String],
    ) -> Result<ProviderBatchId, ProviderError> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::CreateBatch {
            check_type,
            emails: emails.to_vec(),
        });
        if !state.create_replies.is_empty() {
            return state.create_replies.remove(0);
        }
        state.created += 1;
        Ok(ProviderBatchId(format!("pb-{}", state.created)))
    }

    async fn check_status(
        &self,
        check_type: CheckType,
        id: &ProviderBatchId,
    ) -> Result<ProviderBatchState, ProviderError> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::CheckStatus {
            check_type,
            id: id.clone(),
        });
        let queue = state
            .status_replies
            .get_mut(id)
            .ok_or_else(|| ProviderError::Malformed(format!("no scripted status for {id}")))?;
        if queue.len() > 1 {
            Ok(queue.remove(0)?)
        } else {
            clone_state_reply(queue.first().expect("status queue is non-empty"))
        }
    }

    async fn download_results(
        &self,
        check_type: CheckType,
        id: &ProviderBatchId,
    ) -> Result<Vec<ProviderRecord>, ProviderError> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::DownloadResults {
            check_type,
            id: id.clone(),
        });
        match state.results.get(id) {
            Some(Ok(records)) => Ok(records.clone()),
            Some(Err(e)) => Err(clone_error(e)),
            None => Err(ProviderError::Malformed(format!(
                "no scripted results for {id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_batch_ids_when_unscripted() {
        let mock = MockProvider::new();
        let a = mock
            .create_batch(CheckType::Deliverable, &["a@x.com".into()])
            .await
            .unwrap();
        let b = mock
            .create_batch(CheckType::Deliverable, &["b@x.com".into()])
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(mock.created_batches(), 2);
    }

    #[tokio::test]
    async fn status_script_drains_fifo_and_repeats_last() {
        let mock = MockProvider::new();
        mock.script_status("pb", Ok(ProviderBatchState::Pending));
        mock.script_status("pb", Ok(ProviderBatchState::Completed));

        let id = ProviderBatchId::from("pb");
        assert_eq!(
            mock.check_status(CheckType::Deliverable, &id).await.unwrap(),
            ProviderBatchState::Pending
        );
        assert_eq!(
            mock.check_status(CheckType::Deliverable, &id).await.unwrap(),
            ProviderBatchState::Completed
        );
        // Drained: the last reply repeats
        assert_eq!(
            mock.check_status(CheckType::Deliverable, &id).await.unwrap(),
            ProviderBatchState::Completed
        );
    }
}
