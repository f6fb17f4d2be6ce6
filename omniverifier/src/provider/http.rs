//! Production provider client using reqwest.

use std::time::Duration;

use serde::Deserialize;

use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::types::{CheckType, ProviderBatchId};

use super::{ProviderBatchState, ProviderError, ProviderRecord, VerificationProvider};

/// HTTP client for the verification provider API.
#[derive(Clone)]
pub struct ReqwestProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl ReqwestProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: config.request_timeout,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req.timeout(self.timeout);
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    async fn classify(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match status {
            429 => Err(ProviderError::RateLimited),
            402 => Err(ProviderError::PaymentRequired(body)),
            _ => Err(ProviderError::Http { status, body }),
        }
    }
}

#[derive(Deserialize)]
struct CreateBatchReply {
    batch_id: String,
}

#[derive(Deserialize)]
struct StatusReply {
    status: String,
    #[serde(default)]
    processed: Option<i64>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ResultsReply {
    results: Vec<ProviderRecord>,
}

#[async_trait]
impl VerificationProvider for ReqwestProvider {
    #[tracing::instrument(skip(self, emails), fields(check_type = %check_type, count = emails.len()))]
    async fn create_batch(
        &self,
        check_type: CheckType,
        emails: &[String],
    ) -> Result<ProviderBatchId, ProviderError> {
        let url = format!("{}/v1/batches", self.endpoint);
        let response = self
            .authorize(self.client.post(&url))
            .json(&serde_json::json!({
                "type": check_type.as_str(),
                "emails": emails,
            }))
            .send()
            .await?;

        let response = Self::classify(response).await?;
        let reply: CreateBatchReply = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        tracing::info!(provider_batch_id = %reply.batch_id, "Created provider batch");
        Ok(ProviderBatchId(reply.batch_id))
    }

    #[tracing::instrument(skip(self), fields(check_type = %check_type, provider_batch_id = %id))]
    async fn check_status(
        &self,
        check_type: CheckType,
        id: &ProviderBatchId,
    ) -> Result<ProviderBatchState, ProviderError> {
        let url = format!("{}/v1/batches/{}/status", self.endpoint, id);
        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = Self::classify(response).await?;
        let reply: StatusReply = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let state = match reply.status.as_str() {
            "pending" => ProviderBatchState::Pending,
            "processing" => ProviderBatchState::Processing {
                processed: reply.processed.unwrap_or(0),
            },
            "completed" => ProviderBatchState::Completed,
            "failed" => ProviderBatchState::Failed {
                reason: reply.reason,
            },
            other => {
                return Err(ProviderError::Malformed(format!(
                    "unknown batch status '{other}'"
                )));
            }
        };
        Ok(state)
    }

    #[tracing::instrument(skip(self), fields(check_type = %check_type, provider_batch_id = %id))]
    async fn download_results(
        &self,
        check_type: CheckType,
        id: &ProviderBatchId,
    ) -> Result<Vec<ProviderRecord>, ProviderError> {
        let url = format!("{}/v1/batches/{}/results", self.endpoint, id);
        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = Self::classify(response).await?;
        let reply: ResultsReply = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        tracing::info!(count = reply.results.len(), "Downloaded provider results");
        Ok(reply.results)
    }
}
