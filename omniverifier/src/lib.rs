//! Email-verification batching engine.
//!
//! Customers submit user batches of addresses; the engine de-duplicates
//! against a global result cache, coalesces still-unverified addresses into
//! provider batches under concurrency and rate limits, polls the provider's
//! lifecycle, attributes returned results back to the originating user
//! batches, and on completion joins the uploaded source file against the
//! cache to produce partitioned CSV exports.
//!
//! The moving parts are worker loops over a shared [`Store`]:
//! - [`Packer`] — greedy FIFO collector of queued emails into provider
//!   batches (per check-type).
//! - [`LifecyclePoller`] — drives each provider batch through
//!   `pending → processing → completed | failed` and ingests results.
//! - [`StuckBatchSweeper`] — completes user batches whose associations all
//!   finished but whose status never advanced.
//! - [`EnrichmentWorkers`] — per-batch export generation, launched from the
//!   completion hook.
//!
//! [`BatchService`] and [`CreditService`] are the call-in surface for the
//! HTTP shell that fronts the engine; HTTP itself is out of scope here.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use omniverifier::{
//!     BatchService, CompletionHooks, EngineConfig, InMemoryStore, UserId,
//! };
//! use omniverifier::types::CheckType;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let service = BatchService::new(store, CompletionHooks::new(), EngineConfig::default());
//!
//!     let batch = service
//!         .submit_batch(
//!             UserId(uuid::Uuid::new_v4()),
//!             CheckType::Deliverable,
//!             "launch list".into(),
//!             &["alice@example.com".into(), "bob+tag@example.com".into()],
//!             None,
//!         )
//!         .await?;
//!     println!("created batch {} with {} emails", batch.id, batch.total_emails);
//!     Ok(())
//! }
//! ```

pub mod batches;
pub mod completion;
pub mod config;
pub mod credits;
pub mod email;
pub mod enrichment;
pub mod errors;
pub mod governor;
pub mod lifecycle;
pub mod objstore;
pub mod packer;
pub mod provider;
pub mod store;
pub mod sweeper;
pub mod telemetry;
#[cfg(test)]
pub(crate) mod test_support;
pub mod types;

pub use batches::BatchService;
pub use completion::{CompletionHook, CompletionHooks, LogNotifier};
pub use config::{Args, Config, EngineConfig};
pub use credits::CreditService;
pub use enrichment::EnrichmentWorkers;
pub use errors::{DbError, Error, Result};
pub use governor::RateGovernor;
pub use lifecycle::LifecyclePoller;
pub use objstore::{LocalObjectStore, ObjectStore, S3ObjectStore};
pub use packer::Packer;
pub use provider::{
    MockProvider, ProviderBatchState, ProviderError, ProviderRecord, ReqwestProvider,
    VerificationProvider,
};
pub use store::{InMemoryStore, PostgresStore, Store};
pub use sweeper::StuckBatchSweeper;
pub use types::{CheckType, GlobalEmailId, ProviderBatchId, UserBatchId, UserId};
