// PackMirror - Mirror Git Repositories to Object Storage
// Copyright (C) 2025 PackMirror Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.

//! AWS S3 storage backend implementation
//!
//! Provides a [`StorageBackend`] implementation for AWS S3 with:
//! - AWS SDK configuration using credential chains (environment, IAM, profiles)
//! - Custom endpoint support for S3-compatible services (MinIO, LocalStack)
//! - Streaming uploads that switch to multipart when a body outgrows one part
//! - Ranged reads via the HTTP `Range` header
//! - Server-side copies and batched deletion (single deletes ride the same
//!   `DeleteObjects` path the prefix purge uses)
//! - Per-request retries with capped exponential backoff; failures that
//!   retrying cannot fix (missing key, bad range) fail fast
//! - Validation of the mirror's own key shapes before anything is sent
//!
//! # Configuration
//!
//! Credentials and region come from the AWS SDK's usual chain:
//! 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, etc.)
//! 2. IAM role credentials (if running on EC2, ECS, Lambda, etc.)
//! 3. AWS profiles (~/.aws/credentials and ~/.aws/config)
//!
//! # Examples
//!
//! ```rust,no_run
//! use packmirror_storage::{StorageBackend, s3::S3Backend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = S3Backend::new("my-bucket").await?;
//!     storage.put("HEAD", b"ref: refs/heads/main\n").await?;
//!     assert!(storage.exists("HEAD").await?);
//!     Ok(())
//! }
//! ```

use crate::{ByteStream, StorageBackend};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Largest number of keys one DeleteObjects request may carry.
const DELETE_BATCH_MAX: usize = 1000;

/// Ceiling for the retry backoff.
const RETRY_DELAY_CAP_MS: u64 = 5_000;

/// Configuration for the S3 backend
#[derive(Clone, Debug)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,

    /// Optional custom S3 endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,

    /// Part size for streaming multipart uploads, in bytes (default: 32MB).
    /// Also the most payload a streamed upload ever buffers at once.
    pub part_size: u64,

    /// Attempts per request before a transient failure becomes an error
    /// (default: 3)
    pub max_retries: u32,

    /// Backoff after the first failed attempt, in milliseconds; doubles per
    /// attempt up to a fixed cap (default: 100ms)
    pub initial_retry_delay_ms: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        S3Config {
            bucket: String::new(),
            endpoint: None,
            part_size: 32 * 1024 * 1024,
            max_retries: 3,
            initial_retry_delay_ms: 100,
        }
    }
}

/// AWS S3 storage backend
///
/// Implements the [`StorageBackend`] trait using AWS S3.
/// Supports both standard S3 and S3-compatible services.
///
/// # Thread Safety
///
/// This implementation is `Send + Sync` and can be safely shared across
/// threads and async tasks.
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    config: Arc<S3Config>,
    stats: Arc<S3Stats>,
}

/// Internal statistics for the S3 backend
#[derive(Debug)]
struct S3Stats {
    total_bytes_uploaded: AtomicU64,
    total_bytes_downloaded: AtomicU64,
    total_objects_deleted: AtomicU64,
}

impl S3Stats {
    fn new() -> Self {
        S3Stats {
            total_bytes_uploaded: AtomicU64::new(0),
            total_bytes_downloaded: AtomicU64::new(0),
            total_objects_deleted: AtomicU64::new(0),
        }
    }
}

impl S3Backend {
    /// Create a new S3 backend with the given bucket name
    ///
    /// Uses automatic AWS credential and region detection.
    pub async fn new(bucket: impl Into<String>) -> Result<Self> {
        let config = S3Config {
            bucket: bucket.into(),
            ..Default::default()
        };
        Self::with_config(config).await
    }

    /// Create a new S3 backend with custom configuration
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use packmirror_storage::s3::{S3Backend, S3Config};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> anyhow::Result<()> {
    /// let config = S3Config {
    ///     bucket: "my-bucket".to_string(),
    ///     endpoint: Some("http://127.0.0.1:9000".to_string()),
    ///     ..Default::default()
    /// };
    /// let storage = S3Backend::with_config(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_config(config: S3Config) -> Result<Self> {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;

        let client = if let Some(endpoint) = &config.endpoint {
            debug!("Using custom S3 endpoint: {}", endpoint);
            let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
                .endpoint_url(endpoint.clone())
                .force_path_style(true)
                .build();
            Client::from_conf(s3_config)
        } else {
            Client::new(&sdk_config)
        };

        client
            .head_bucket()
            .bucket(&config.bucket)
            .send()
            .await
            .context(format!(
                "Failed to verify S3 bucket access: {}",
                config.bucket
            ))?;

        debug!(
            "Successfully connected to S3 bucket: {} with region: {:?}",
            config.bucket,
            sdk_config.region()
        );

        Ok(S3Backend {
            client,
            config: Arc::new(config),
            stats: Arc::new(S3Stats::new()),
        })
    }

    /// Get current statistics as (uploaded, downloaded, deleted)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.total_bytes_uploaded.load(Ordering::Relaxed),
            self.stats.total_bytes_downloaded.load(Ordering::Relaxed),
            self.stats.total_objects_deleted.load(Ordering::Relaxed),
        )
    }

    /// Check a key against the shapes the mirror writes.
    ///
    /// Every key is slash-separated printable segments with no empty or
    /// relative parts. The content-addressed keys additionally carry fixed
    /// hex shapes (`objects/<xx>/<38-hex>`, `lfs/objects/<aa>/<bb>/<64-hex>`
    /// with matching fan-out, `mirror_tmp/raw/<40-hex>`); a violation there
    /// means a digest got mangled upstream, not a storage problem.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(anyhow!("key cannot be empty"));
        }
        if key.starts_with('/') {
            return Err(anyhow!("key cannot start with '/': {key}"));
        }

        let segments: Vec<&str> = key.split('/').collect();
        for segment in &segments {
            if segment.is_empty() {
                return Err(anyhow!("key has an empty segment: {key}"));
            }
            if *segment == "." || *segment == ".." {
                return Err(anyhow!("key has a relative segment: {key}"));
            }
            if !segment.bytes().all(|b| b.is_ascii_graphic()) {
                return Err(anyhow!("key has blank or non-printable characters: {key}"));
            }
        }

        match segments.as_slice() {
            [.., "lfs", "objects", a, b, oid] => {
                let (a, b, oid) = (*a, *b, *oid);
                let fan_out_matches =
                    oid.len() == 64 && &oid[0..2] == a && &oid[2..4] == b;
                if !(hex_segment(a, 2) && hex_segment(b, 2) && hex_segment(oid, 64) && fan_out_matches)
                {
                    return Err(anyhow!("malformed large-file key: {key}"));
                }
            }
            [.., "objects", fan, rest] => {
                if !(hex_segment(fan, 2) && hex_segment(rest, 38)) {
                    return Err(anyhow!("malformed loose-object key: {key}"));
                }
            }
            [.., "mirror_tmp", "raw", digest] => {
                if !hex_segment(digest, 40) {
                    return Err(anyhow!("malformed raw-object key: {key}"));
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Send one request, retrying transient failures with capped backoff.
    ///
    /// `send` builds and fires a fresh request per attempt. Failures that a
    /// retry cannot fix (missing key, bad range) surface immediately so a
    /// delta resolver hitting an absent base does not stall through the
    /// whole backoff schedule.
    async fn request<T, F, Fut>(&self, action: &'static str, target: &str, mut send: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>> + Send,
    {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match send().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let permanent = is_permanent(&format!("{e:#}"));
                    if permanent || attempt >= attempts {
                        return Err(e).with_context(|| {
                            if permanent {
                                format!("S3 {action} for {target} failed")
                            } else {
                                format!("S3 {action} for {target} failed after {attempts} attempts")
                            }
                        });
                    }
                    let delay = backoff_delay(self.config.initial_retry_delay_ms, attempt);
                    warn!(
                        action,
                        target,
                        attempt,
                        "S3 request failed: {e}; retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Download an object, in full or one window of it. `get` and
    /// `get_range` are the same request apart from the `Range` header.
    async fn fetch(&self, key: &str, range: Option<String>) -> Result<Vec<u8>> {
        Self::validate_key(key)?;

        let data = self
            .request("GetObject", key, || {
                let mut request = self
                    .client
                    .get_object()
                    .bucket(&self.config.bucket)
                    .key(key);
                if let Some(range) = &range {
                    request = request.range(range);
                }
                async move {
                    let response = request
                        .send()
                        .await
                        .map_err(|e| anyhow!("GetObject failed: {e}"))?;
                    let body = response
                        .body
                        .collect()
                        .await
                        .map_err(|e| anyhow!("reading object body failed: {e}"))?;
                    Ok(body.into_bytes().to_vec())
                }
            })
            .await?;

        self.stats
            .total_bytes_downloaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    /// Delete a batch of keys with one DeleteObjects request.
    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        debug_assert!(keys.len() <= DELETE_BATCH_MAX);

        let mut identifiers = Vec::with_capacity(keys.len());
        for key in keys {
            identifiers.push(
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|e| anyhow!("invalid delete identifier {key}: {e}"))?,
            );
        }
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .build()
            .map_err(|e| anyhow!("invalid delete request: {e}"))?;

        let label = if keys.len() == 1 {
            keys[0].clone()
        } else {
            format!("{} keys", keys.len())
        };
        self.request("DeleteObjects", &label, || {
            let request = self
                .client
                .delete_objects()
                .bucket(&self.config.bucket)
                .delete(delete.clone());
            async move {
                request
                    .send()
                    .await
                    .map_err(|e| anyhow!("DeleteObjects failed: {e}"))?;
                Ok(())
            }
        })
        .await?;

        self.stats
            .total_objects_deleted
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.config.bucket)
            .field("endpoint", &self.config.endpoint)
            .field("part_size", &self.config.part_size)
            .finish()
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.fetch(key, None).await
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            Self::validate_key(key)?;
            return Ok(Vec::new());
        }

        // HTTP Range is inclusive on both ends.
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        let data = self.fetch(key, Some(range)).await?;
        if data.len() as u64 != len {
            return Err(anyhow!(
                "ranged read of {} returned {} bytes, wanted {}",
                key,
                data.len(),
                len
            ));
        }
        Ok(data)
    }

    async fn get_stream(&self, key: &str) -> Result<ByteStream<'static>> {
        Self::validate_key(key)?;

        // Only the initial send is retried; once the body is streaming,
        // a failure surfaces through the stream itself.
        let response = self
            .request("GetObject", key, || {
                let request = self
                    .client
                    .get_object()
                    .bucket(&self.config.bucket)
                    .key(key);
                async move {
                    request
                        .send()
                        .await
                        .map_err(|e| anyhow!("GetObject failed: {e}"))
                }
            })
            .await?;

        let stats = self.stats.clone();
        let stream = futures::stream::try_unfold(response.body, move |mut body| {
            let stats = stats.clone();
            async move {
                match body.try_next().await {
                    Ok(Some(bytes)) => {
                        stats
                            .total_bytes_downloaded
                            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        Ok(Some((bytes, body)))
                    }
                    Ok(None) => Ok(None),
                    Err(e) => Err(anyhow!("reading object body failed: {e}")),
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        Self::validate_key(key)?;

        if data.len() as u64 <= self.config.part_size {
            return self.put_simple(key, data).await;
        }

        // Large bodies take the same multipart path as unknown-length streams.
        let chunk = Bytes::copy_from_slice(data);
        let body = futures::stream::once(async move { Ok::<_, anyhow::Error>(chunk) });
        self.put_stream(key, Box::pin(body)).await
    }

    async fn put_stream(&self, key: &str, mut data: ByteStream<'_>) -> Result<()> {
        Self::validate_key(key)?;

        let part_size = self.config.part_size as usize;
        let mut buf: Vec<u8> = Vec::new();
        let mut ended = false;

        // Buffer up to one part before deciding between a single put and a
        // multipart upload; the total length is not known in advance.
        while buf.len() <= part_size {
            match data.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e).context("streamed upload source failed"),
                None => {
                    ended = true;
                    break;
                }
            }
        }

        if ended {
            return self.put_simple(key, &buf).await;
        }

        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to initiate multipart upload: {}", e))?;

        let upload_id = multipart
            .upload_id()
            .ok_or_else(|| anyhow!("No upload ID returned from S3"))?
            .to_string();

        debug!("Initiated multipart upload for {}: {}", key, upload_id);

        match self.stream_parts(key, &upload_id, buf, &mut data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Abandon the partial upload so the key never holds it.
                let abort = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort_err) = abort {
                    warn!("Failed to abort multipart upload {}: {}", upload_id, abort_err);
                }
                Err(e)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Self::validate_key(key)?;

        self.request("HeadObject", key, || {
            let request = self
                .client
                .head_object()
                .bucket(&self.config.bucket)
                .key(key);
            async move {
                match request.send().await {
                    Ok(_) => Ok(true),
                    // A missing key is an answer, not a failure; emulators
                    // sometimes phrase the 404 as a generic service error.
                    Err(e) => {
                        let service_not_found = matches!(
                            &e,
                            SdkError::ServiceError(ctx) if ctx.err().is_not_found()
                        );
                        if service_not_found || is_permanent(&e.to_string()) {
                            Ok(false)
                        } else {
                            Err(anyhow!("HeadObject failed: {e}"))
                        }
                    }
                }
            }
        })
        .await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        Self::validate_key(from)?;
        Self::validate_key(to)?;

        let source = format!("{}/{}", self.config.bucket, from);
        self.request("CopyObject", to, || {
            let request = self
                .client
                .copy_object()
                .bucket(&self.config.bucket)
                .copy_source(&source)
                .key(to);
            async move {
                request
                    .send()
                    .await
                    .map_err(|e| anyhow!("CopyObject failed: {e}"))?;
                Ok(())
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Self::validate_key(key)?;
        self.delete_keys(&[key.to_string()]).await
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        // Each page is retried on its own; an already-listed page is never
        // fetched again.
        loop {
            let page_token = token.clone();
            let page = self
                .request("ListObjectsV2", prefix, || {
                    let mut request = self.client.list_objects_v2().bucket(&self.config.bucket);
                    if !prefix.is_empty() {
                        request = request.prefix(prefix);
                    }
                    if let Some(t) = &page_token {
                        request = request.continuation_token(t);
                    }
                    async move {
                        request
                            .send()
                            .await
                            .map_err(|e| anyhow!("ListObjectsV2 failed: {e}"))
                    }
                })
                .await?;

            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }

            token = if page.is_truncated() == Some(true) {
                page.next_continuation_token().map(str::to_string)
            } else {
                None
            };
            if token.is_none() {
                break;
            }
        }

        keys.sort();
        debug!("Found {} objects with prefix: '{}'", keys.len(), prefix);
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let keys = self.list_objects(prefix).await?;
        if keys.is_empty() {
            return Ok(());
        }

        debug!("Deleting {} objects under prefix: '{}'", keys.len(), prefix);
        for batch in keys.chunks(DELETE_BATCH_MAX) {
            self.delete_keys(batch).await?;
        }
        Ok(())
    }
}

// Helper methods for S3Backend (not part of StorageBackend trait)
impl S3Backend {
    /// Upload small objects using direct put_object
    async fn put_simple(&self, key: &str, data: &[u8]) -> Result<()> {
        debug!("Putting object to S3: {} ({} bytes)", key, data.len());

        // Bytes clones are reference-counted, so retries re-send the same
        // buffer without copying it.
        let body = Bytes::copy_from_slice(data);
        self.request("PutObject", key, || {
            let request = self
                .client
                .put_object()
                .bucket(&self.config.bucket)
                .key(key)
                .body(body.clone().into());
            async move {
                request
                    .send()
                    .await
                    .map_err(|e| anyhow!("PutObject failed: {e}"))?;
                Ok(())
            }
        })
        .await?;

        self.stats
            .total_bytes_uploaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Drain the remaining stream into sequential multipart parts and
    /// complete the upload. The first part arrives pre-buffered.
    async fn stream_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut buf: Vec<u8>,
        data: &mut ByteStream<'_>,
    ) -> Result<()> {
        let part_size = self.config.part_size as usize;
        let mut completed: Vec<CompletedPart> = Vec::new();
        let mut part_number: i32 = 1;
        let mut ended = false;

        loop {
            while !ended && buf.len() < part_size {
                match data.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Err(e).context("streamed upload source failed"),
                    None => ended = true,
                }
            }

            let part: Vec<u8> = if buf.len() > part_size {
                let rest = buf.split_off(part_size);
                std::mem::replace(&mut buf, rest)
            } else {
                std::mem::take(&mut buf)
            };

            if part.is_empty() && ended {
                break;
            }

            debug!(
                "Uploading part {} ({} bytes) for key: {}",
                part_number,
                part.len(),
                key
            );

            let part_len = part.len() as u64;
            let response = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(Bytes::from(part).into())
                .send()
                .await
                .map_err(|e| anyhow!("Failed to upload part {}: {}", part_number, e))?;

            let etag = response
                .e_tag()
                .ok_or_else(|| anyhow!("No ETag returned for part {}", part_number))?
                .to_string();

            completed.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build(),
            );
            self.stats
                .total_bytes_uploaded
                .fetch_add(part_len, Ordering::Relaxed);
            part_number += 1;

            if ended && buf.is_empty() {
                break;
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| anyhow!("Failed to complete multipart upload: {}", e))?;

        debug!("Successfully completed multipart upload for {}", key);
        Ok(())
    }
}

fn hex_segment(segment: &str, len: usize) -> bool {
    segment.len() == len && segment.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Failures that no amount of retrying fixes: the object or bucket is not
/// there, or the request asked for bytes that do not exist.
fn is_permanent(message: &str) -> bool {
    let message = message.to_lowercase();
    ["nosuchkey", "nosuchbucket", "notfound", "not found", "404", "invalidrange"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Backoff for the given (1-based) failed attempt: doubles from the initial
/// delay, capped at [`RETRY_DELAY_CAP_MS`].
fn backoff_delay(initial_ms: u64, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    let millis = initial_ms
        .saturating_mul(1u64 << doublings)
        .min(RETRY_DELAY_CAP_MS);
    Duration::from_millis(millis)
}
