//! S3 storage backend.
//!
//! Source files arrive through presigned PUT URLs; exports are uploaded
//! multipart with 5 MiB parts and bounded concurrency, and served through
//! presigned GET URLs.

use std::time::Duration;

use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use futures::StreamExt;

use async_trait::async_trait;

use crate::config::ObjectStoreConfig;
use crate::errors::{Error, Result};

use super::ObjectStore;

/// Multipart part size for export uploads.
const PART_SIZE: usize = 5 * 1024 * 1024;
/// Concurrent part uploads per export.
const UPLOAD_CONCURRENCY: usize = 4;

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the ambient AWS environment and the configured
    /// bucket (honouring a custom endpoint for S3-compatible stores).
    pub async fn from_config(config: &ObjectStoreConfig) -> Result<Self> {
        let ObjectStoreConfig::S3 { bucket, endpoint } = config else {
            return Err(Error::ObjectStore(
                "object store config is not the s3 backend".into(),
            ));
        };

        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = match endpoint {
            Some(url) => {
                let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
                    .endpoint_url(url)
                    .force_path_style(true)
                    .build();
                Client::from_conf(s3_config)
            }
            None => Client::new(&sdk_config),
        };

        Ok(Self::new(client, bucket.clone()))
    }

    async fn put_multipart(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("create multipart '{key}': {e}")))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| Error::ObjectStore("multipart upload id missing".into()))?
            .to_string();

        let parts: Vec<(i32, Bytes)> = bytes
            .chunks(PART_SIZE)
            .enumerate()
            .map(|(i, chunk)| (i as i32 + 1, bytes.slice_ref(chunk)))
            .collect();

        let uploads = futures::stream::iter(parts.into_iter().map(|(part_number, chunk)| {
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            async move {
                let part = client
                    .upload_part()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk))
                    .send()
                    .await
                    .map_err(|e| {
                        Error::ObjectStore(format!("upload part {part_number} of '{key}': {e}"))
                    })?;
                Ok::<_, Error>(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(part.e_tag().map(|t| t.to_string()))
                        .build(),
                )
            }
        }))
        .buffered(UPLOAD_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

        let mut completed = Vec::with_capacity(uploads.len());
        for upload_result in uploads {
            match upload_result {
                Ok(part) => completed.push(part),
                Err(e) => {
                    let _ = self
                        .client
                        .abort_multipart_upload()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(&upload_id)
                        .send()
                        .await;
                    return Err(e);
                }
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("complete multipart '{key}': {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let bytes = Bytes::from(bytes);
        if bytes.len() > PART_SIZE {
            return self.put_multipart(key, bytes, content_type).await;
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("put '{key}': {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("get '{key}': {e}")))?;
        let body = object
            .body
            .collect()
            .await
            .map_err(|e| Error::ObjectStore(format!("read body of '{key}': {e}")))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(Error::ObjectStore(format!("head '{key}': {service_error}")))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("delete '{key}': {e}")))?;
        Ok(())
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(
                PresigningConfig::expires_in(ttl)
                    .map_err(|e| Error::ObjectStore(e.to_string()))?,
            )
            .await
            .map_err(|e| Error::ObjectStore(format!("presign put '{key}': {e}")))?;
        Ok(presigned.uri().to_string())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(
                PresigningConfig::expires_in(ttl)
                    .map_err(|e| Error::ObjectStore(e.to_string()))?,
            )
            .await
            .map_err(|e| Error::ObjectStore(format!("presign get '{key}': {e}")))?;
        Ok(presigned.uri().to_string())
    }
}
