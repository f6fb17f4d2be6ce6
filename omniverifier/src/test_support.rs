//! Shared fixtures for the engine tests.

use std::sync::Arc;

use uuid::Uuid;

use crate::batches::BatchService;
use crate::completion::CompletionHooks;
use crate::config::EngineConfig;
use crate::provider::ProviderRecord;
use crate::store::{InMemoryStore, NewProviderBatch, Assignment, Store, UserBatch};
use crate::types::{CheckType, CreditEvent, UserId};

/// Engine config with fast loops, small caps left at their defaults.
pub(crate) fn engine_config() -> EngineConfig {
    EngineConfig {
        poll_interval: std::time::Duration::from_millis(10),
        poll_backoff: std::time::Duration::ZERO,
        ..EngineConfig::default()
    }
}

pub(crate) fn user() -> UserId {
    UserId(Uuid::new_v4())
}

/// `prefix0@example.com .. prefix{n-1}@example.com`
pub(crate) fn addresses(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}{i}@example.com")).collect()
}

pub(crate) fn service(store: &Arc<InMemoryStore>) -> BatchService<InMemoryStore> {
    BatchService::new(store.clone(), CompletionHooks::new(), engine_config())
}

pub(crate) fn service_with_hooks(
    store: &Arc<InMemoryStore>,
    hooks: CompletionHooks,
) -> BatchService<InMemoryStore> {
    BatchService::new(store.clone(), hooks, engine_config())
}

/// Submit and start a batch with enough one-off credits granted up front.
pub(crate) async fn started_batch(
    store: &Arc<InMemoryStore>,
    owner: UserId,
    check_type: CheckType,
    raw_addresses: &[String],
) -> UserBatch {
    store
        .grant_credits(
            owner,
            check_type,
            raw_addresses.len() as i64,
            CreditEvent::Purchase,
        )
        .await
        .unwrap();
    let batch = service(store)
        .submit_batch(
            owner,
            check_type,
            "test batch".into(),
            raw_addresses,
            None,
        )
        .await
        .unwrap();
    service(store).start_batch(batch.id).await.unwrap()
}

pub(crate) fn deliverable_record(
    email: &str,
    status: &str,
    reason: &str,
    is_catchall: bool,
    provider: &str,
) -> ProviderRecord {
    ProviderRecord {
        email: email.to_string(),
        status: Some(status.to_string()),
        reason: Some(reason.to_string()),
        is_catchall: Some(if is_catchall { "yes" } else { "no" }.to_string()),
        score: Some(80),
        provider: Some(provider.to_string()),
        toxicity: None,
    }
}

/// Seed the deliverable result cache by running a throwaway batch through a
/// provider batch and applying the given records.
pub(crate) async fn seed_deliverable_results(
    store: &Arc<InMemoryStore>,
    records: &[ProviderRecord],
) {
    let owner = user();
    let raw: Vec<String> = records.iter().map(|r| r.email.clone()).collect();
    let batch = started_batch(store, owner, CheckType::Deliverable, &raw).await;

    let interned = store.intern_emails(&raw).await.unwrap();
    let assignments: Vec<Assignment> = interned
        .iter()
        .map(|e| Assignment {
            email_id: e.id,
            batch_id: batch.id,
        })
        .collect();
    let provider_batch_id: crate::types::ProviderBatchId =
        format!("seed-{}", Uuid::new_v4()).into();
    store
        .record_provider_batch(NewProviderBatch {
            provider_batch_id: provider_batch_id.clone(),
            check_type: CheckType::Deliverable,
            primary_batch_id: batch.id,
            assignments,
        })
        .await
        .unwrap();
    store
        .apply_provider_results(&provider_batch_id, records)
        .await
        .unwrap();
}
