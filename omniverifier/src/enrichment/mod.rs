//! Enrichment worker pool.
//!
//! Joins a batch's uploaded source file against the result cache and emits
//! the `all_emails` export plus one partition per translated outcome. At
//! most one run per `(batch_id, check_type)` is in flight at a time; the
//! registry is process-local, and the export-metadata write is conditional
//! so racing processes converge on one winner.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use async_trait::async_trait;

use crate::completion::CompletionHook;
use crate::config::EngineConfig;
use crate::email;
use crate::errors::{Error, Result};
use crate::objstore::ObjectStore;
use crate::store::{ExportObjectMeta, Store, VerificationResult};
use crate::types::{
    CheckType, EnrichmentStatus, ExportKind, UserBatchId, UserId, VerdictStatus,
};

mod pipeline;

use pipeline::{ExportWriter, is_spreadsheet, source_rows};

/// In-memory join entry; `emitted` is the duplicate-dedupe flag.
struct Enriched {
    result: VerificationResult,
    emitted: bool,
}

pub struct EnrichmentWorkers<S, O> {
    store: Arc<S>,
    objects: Arc<O>,
    config: EngineConfig,
    in_flight: Arc<DashMap<(UserBatchId, CheckType), ()>>,
}

impl<S, O> Clone for EnrichmentWorkers<S, O> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            objects: self.objects.clone(),
            config: self.config.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<S, O> EnrichmentWorkers<S, O>
where
    S: Store + 'static,
    O: ObjectStore + 'static,
{
    pub fn new(store: Arc<S>, objects: Arc<O>, config: EngineConfig) -> Self {
        Self {
            store,
            objects,
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Launch an enrichment run unless one is already in flight for this key.
    pub fn trigger(&self, batch_id: UserBatchId, check_type: CheckType) {
        if self
            .in_flight
            .insert((batch_id, check_type), ())
            .is_some()
        {
            tracing::debug!(batch_id = %batch_id, check_type = %check_type, "Enrichment already running, skipping");
            return;
        }

        let workers = self.clone();
        tokio::spawn(async move {
            if let Err(e) = workers.enrich(batch_id, check_type).await {
                tracing::error!(batch_id = %batch_id, check_type = %check_type, error = %e, "Enrichment failed");
                if let Err(mark_err) = workers
                    .store
                    .fail_enrichment(batch_id, check_type, &e.to_string())
                    .await
                {
                    tracing::error!(batch_id = %batch_id, error = %mark_err, "Failed to record enrichment failure");
                }
            }
            workers.in_flight.remove(&(batch_id, check_type));
        });
    }

    /// Run the pipeline to completion. Public so tests can drive it without
    /// the spawn-and-forget wrapper.
    #[tracing::instrument(skip(self), fields(batch_id = %batch_id, check_type = %check_type))]
    pub async fn enrich(&self, batch_id: UserBatchId, check_type: CheckType) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        let Some(source) = batch.source_meta.as_ref().map(|json| json.0.clone()) else {
            tracing::debug!(batch_id = %batch_id, "Batch has no source object, skipping enrichment");
            return Ok(());
        };

        self.store.begin_enrichment(batch_id, check_type).await?;

        // The in-memory side of the join; bounded by batch size.
        let mut results: HashMap<String, Enriched> = self
            .store
            .enrichment_results(batch_id)
            .await?
            .into_iter()
            .map(|(stripped, result)| (stripped, Enriched { result, emitted: false }))
            .collect();

        let bytes = self.objects.get(&source.s3_key).await?;
        let mut rows = source_rows(bytes, is_spreadsheet(&source))?;

        let headers = rows
            .next()
            .transpose()?
            .ok_or_else(|| Error::EnrichmentSource("source file is empty".into()))?;
        let email_idx = source.column_mapping.email;
        if email_idx >= headers.len() {
            return Err(Error::EnrichmentSource(format!(
                "email column index {email_idx} exceeds header count {}",
                headers.len()
            )));
        }

        let mut extended = headers;
        match check_type {
            CheckType::Deliverable => {
                extended.push("OmniVerifier Status".to_string());
                extended.push("OmniVerifier Mail Server".to_string());
            }
            CheckType::Catchall => {
                extended.push("Catch-All Status".to_string());
            }
        }

        let partition_kinds: [ExportKind; 3] = match check_type {
            CheckType::Deliverable => [
                ExportKind::ValidOnly,
                ExportKind::InvalidOnly,
                ExportKind::CatchallOnly,
            ],
            CheckType::Catchall => [
                ExportKind::GoodOnly,
                ExportKind::BadOnly,
                ExportKind::RiskyOnly,
            ],
        };
        let mut all_emails = ExportWriter::new(ExportKind::AllEmails, extended.clone());
        let mut partitions: HashMap<ExportKind, ExportWriter> = partition_kinds
            .into_iter()
            .map(|kind| (kind, ExportWriter::new(kind, extended.clone())))
            .collect();

        let interval = self.config.enrichment_progress_interval_rows.max(1) as i64;
        let mut rows_processed: i64 = 0;

        for row in rows {
            let row = row?;
            rows_processed += 1;
            if rows_processed % interval == 0 {
                self.store
                    .update_enrichment_rows(batch_id, check_type, rows_processed)
                    .await?;
            }

            let Some(cell) = row.get(email_idx) else {
                continue;
            };
            let Some(stripped) = email::normalise(cell) else {
                continue;
            };
            let Some(entry) = results.get_mut(&stripped) else {
                continue;
            };
            if entry.emitted {
                continue;
            }
            if !matches!(
                entry.result.status(),
                VerdictStatus::Deliverable | VerdictStatus::Undeliverable | VerdictStatus::Risky
            ) {
                continue;
            }
            entry.emitted = true;

            let outcome = entry.result.outcome();
            let mut enriched = row.clone();
            enriched.push(outcome.label().to_string());
            if check_type == CheckType::Deliverable {
                enriched.push(entry.result.mail_server().unwrap_or("").to_string());
            }

            all_emails.write_row(&enriched)?;
            if let Some(partition) = partitions.get_mut(&outcome.partition()) {
                partition.write_row(&enriched)?;
            }
        }

        self.store
            .update_enrichment_rows(batch_id, check_type, rows_processed)
            .await?;

        let mut writers = vec![all_emails];
        writers.extend(partitions.into_values());

        let mut exports: HashMap<ExportKind, ExportObjectMeta> = HashMap::new();
        for writer in writers {
            let Some(file) = writer.finish()? else {
                continue;
            };
            let key = format!("exports/{}/{}.csv", batch.id.0, file.kind);
            self.objects
                .put(&key, file.bytes, "text/csv; charset=utf-8")
                .await?;
            exports.insert(
                file.kind,
                ExportObjectMeta {
                    s3_key: key,
                    generated_at: Utc::now(),
                    size: file.rows,
                    status: EnrichmentStatus::Completed,
                },
            );
        }

        if !exports.is_empty() && !self.store.record_exports(batch_id, exports).await? {
            tracing::debug!(batch_id = %batch_id, "Another writer already recorded export metadata");
        }

        self.store.complete_enrichment(batch_id, check_type).await?;
        tracing::info!(rows_processed, "Enrichment completed");
        Ok(())
    }

    /// Presigned URL for uploading a source object.
    pub async fn source_upload_url(&self, key: &str) -> Result<String> {
        self.objects
            .presign_put(key, self.config.upload_url_ttl)
            .await
    }

    /// Presigned download URL for a generated export of a completed batch.
    pub async fn export_download_url(
        &self,
        batch_id: UserBatchId,
        kind: ExportKind,
    ) -> Result<String> {
        let batch = self.store.get_batch(batch_id).await?;
        let meta = batch
            .export_meta
            .as_ref()
            .and_then(|exports| exports.0.get(kind.as_str()))
            .ok_or(Error::NotFound {
                resource: "Export",
                id: format!("{batch_id}/{kind}"),
            })?;
        self.objects
            .presign_get(&meta.s3_key, self.config.export_url_ttl)
            .await
    }
}

#[async_trait]
impl<S, O> CompletionHook for EnrichmentWorkers<S, O>
where
    S: Store + 'static,
    O: ObjectStore + 'static,
{
    async fn on_batch_completed(
        &self,
        _user_id: UserId,
        check_type: CheckType,
        batch_id: UserBatchId,
        _title: &str,
    ) {
        self.trigger(batch_id, check_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::LocalObjectStore;
    use crate::store::{ColumnMapping, InMemoryStore, SourceMeta};
    use crate::test_support::*;

    const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

    fn source_meta(key: &str, email_column: usize) -> SourceMeta {
        SourceMeta {
            s3_key: key.to_string(),
            upload_timestamp: None,
            file_size: None,
            mime_type: "text/csv".to_string(),
            file_name: Some("upload.csv".to_string()),
            column_mapping: ColumnMapping {
                email: email_column,
            },
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        objects: Arc<LocalObjectStore>,
        workers: EnrichmentWorkers<InMemoryStore, LocalObjectStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let objects = Arc::new(LocalObjectStore::new(dir.path()));
        let workers = EnrichmentWorkers::new(store.clone(), objects.clone(), engine_config());
        Fixture {
            store,
            objects,
            workers,
            _dir: dir,
        }
    }

    async fn seeded_deliverable_fixture() -> Fixture {
        let f = fixture();
        seed_deliverable_results(
            &f.store,
            &[
                deliverable_record("a@x.com", "deliverable", "accepted", false, "google"),
                deliverable_record("b@x.com", "undeliverable", "rejected", false, "other"),
                deliverable_record("c@x.com", "risky", "low_deliverability", false, "other"),
            ],
        )
        .await;
        f
    }

    async fn batch_with_source(
        f: &Fixture,
        addresses: &[&str],
        source: &str,
        email_column: usize,
    ) -> crate::store::UserBatch {
        let key = "uploads/source.csv";
        f.objects
            .put(key, source.as_bytes().to_vec(), "text/csv")
            .await
            .unwrap();
        let raw: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        service(&f.store)
            .submit_batch(
                user(),
                CheckType::Deliverable,
                "enrich me".into(),
                &raw,
                Some(source_meta(key, email_column)),
            )
            .await
            .unwrap()
    }

    fn export_sizes(batch: &crate::store::UserBatch) -> HashMap<String, i64> {
        batch
            .export_meta
            .as_ref()
            .expect("export metadata recorded")
            .0
            .iter()
            .map(|(kind, meta)| (kind.clone(), meta.size))
            .collect()
    }

    #[tokio::test]
    async fn partitions_deliverable_batch_with_bom_and_headers() {
        let f = seeded_deliverable_fixture().await;
        let batch = batch_with_source(
            &f,
            &["a@x.com", "b@x.com", "c@x.com"],
            "email,name\na@x.com,Alice\nb@x.com,Bob\nc@x.com,Carol\n",
            0,
        )
        .await;

        f.workers.enrich(batch.id, CheckType::Deliverable).await.unwrap();

        let progress = f
            .store
            .get_enrichment(batch.id, CheckType::Deliverable)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.status, EnrichmentStatus::Completed);
        assert_eq!(progress.rows_processed, 3);
        let batch = f.store.get_batch(batch.id).await.unwrap();
        let sizes = export_sizes(&batch);
        assert_eq!(sizes["all_emails"], 3);
        assert_eq!(sizes["valid_only"], 1);
        assert_eq!(sizes["invalid_only"], 1);
        assert_eq!(sizes["catchall_only"], 1);

        let all = f
            .objects
            .get(&format!("exports/{}/all_emails.csv", batch.id.0))
            .await
            .unwrap();
        assert!(all.starts_with(UTF8_BOM));
        let text = String::from_utf8(all[3..].to_vec()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "email,name,OmniVerifier Status,OmniVerifier Mail Server"
        );
        assert_eq!(text.lines().count(), 4);

        let valid = f
            .objects
            .get(&format!("exports/{}/valid_only.csv", batch.id.0))
            .await
            .unwrap();
        let valid_text = String::from_utf8(valid[3..].to_vec()).unwrap();
        assert!(valid_text.contains("a@x.com,Alice,Valid,google"));

        let invalid = f
            .objects
            .get(&format!("exports/{}/invalid_only.csv", batch.id.0))
            .await
            .unwrap();
        let invalid_text = String::from_utf8(invalid[3..].to_vec()).unwrap();
        // Provider `other` is blanked in the mail-server column.
        assert!(invalid_text.contains("b@x.com,Bob,Invalid,"));

        let catchall = f
            .objects
            .get(&format!("exports/{}/catchall_only.csv", batch.id.0))
            .await
            .unwrap();
        let catchall_text = String::from_utf8(catchall[3..].to_vec()).unwrap();
        assert!(catchall_text.contains("c@x.com,Carol,Catch-All,"));
    }

    #[tokio::test]
    async fn duplicate_source_rows_are_emitted_once() {
        let f = seeded_deliverable_fixture().await;
        let batch = batch_with_source(
            &f,
            &["a@x.com", "b@x.com"],
            "email\na@x.com\nA@X.com\nb@x.com\n",
            0,
        )
        .await;

        f.workers.enrich(batch.id, CheckType::Deliverable).await.unwrap();

        let batch = f.store.get_batch(batch.id).await.unwrap();
        let sizes = export_sizes(&batch);
        assert_eq!(sizes["all_emails"], 2);

        let progress = f
            .store
            .get_enrichment(batch.id, CheckType::Deliverable)
            .await
            .unwrap()
            .unwrap();
        // All three data rows were read, even though one was deduplicated.
        assert_eq!(progress.rows_processed, 3);
        assert_eq!(progress.status, EnrichmentStatus::Completed);
    }

    #[tokio::test]
    async fn rows_without_usable_results_are_dropped() {
        let f = fixture();
        seed_deliverable_results(
            &f.store,
            &[deliverable_record("u@x.com", "unknown", "unknown", false, "other")],
        )
        .await;
        let batch = batch_with_source(&f, &["u@x.com"], "email\nu@x.com\nmissing@x.com\n", 0).await;

        f.workers.enrich(batch.id, CheckType::Deliverable).await.unwrap();

        let batch = f.store.get_batch(batch.id).await.unwrap();
        // Nothing qualified: no export objects, no metadata.
        assert!(batch.export_meta.is_none());
        let progress = f
            .store
            .get_enrichment(batch.id, CheckType::Deliverable)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.status, EnrichmentStatus::Completed);
        assert_eq!(progress.rows_processed, 2);
    }

    #[tokio::test]
    async fn bad_email_column_fails_the_run() {
        let f = seeded_deliverable_fixture().await;
        let batch =
            batch_with_source(&f, &["a@x.com"], "email,name\na@x.com,Alice\n", 7).await;

        f.workers.trigger(batch.id, CheckType::Deliverable);

        // Poll for the failure the spawned worker records.
        let mut failed = false;
        for _ in 0..100 {
            if let Some(progress) = f
                .store
                .get_enrichment(batch.id, CheckType::Deliverable)
                .await
                .unwrap()
            {
                if progress.status == EnrichmentStatus::Failed {
                    assert!(
                        progress
                            .error_message
                            .as_deref()
                            .unwrap_or_default()
                            .contains("email column index")
                    );
                    failed = true;
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(failed, "enrichment did not fail within the timeout");
        assert!(f.store.get_batch(batch.id).await.unwrap().export_meta.is_none());
    }

    #[tokio::test]
    async fn export_urls_resolve_recorded_objects() {
        let f = seeded_deliverable_fixture().await;
        let batch = batch_with_source(
            &f,
            &["a@x.com"],
            "email\na@x.com\n",
            0,
        )
        .await;
        f.workers.enrich(batch.id, CheckType::Deliverable).await.unwrap();

        let url = f
            .workers
            .export_download_url(batch.id, ExportKind::ValidOnly)
            .await
            .unwrap();
        assert!(url.contains("valid_only.csv"));

        // Unknown partitions surface as not-found.
        assert!(
            f.workers
                .export_download_url(batch.id, ExportKind::GoodOnly)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn batch_without_source_is_skipped() {
        let f = fixture();
        let raw = vec!["n@x.com".to_string()];
        let batch = service(&f.store)
            .submit_batch(user(), CheckType::Deliverable, "no source".into(), &raw, None)
            .await
            .unwrap();

        f.workers.enrich(batch.id, CheckType::Deliverable).await.unwrap();
        assert!(
            f.store
                .get_enrichment(batch.id, CheckType::Deliverable)
                .await
                .unwrap()
                .is_none()
        );
    }
}
