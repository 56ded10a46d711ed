//! S3-compatible remote backend.
//!
//! Works against AWS S3 and S3-compatible services (Backblaze B2, MinIO,
//! Tigris, ...). Objects live under an optional key prefix which acts as
//! the remote root.
//!
//! # Metadata
//!
//! S3 listings don't include user metadata, so every listed object is
//! followed by a `HeadObject` request to read the writer tag and the
//! BLAKE3 fingerprint. Those requests run concurrently, bounded by the
//! backend's request semaphore. Objects uploaded by other tooling have no
//! BLAKE3 metadata; their fingerprint falls back to the ETag (namespaced,
//! see [`Fingerprint::opaque`]). An object deleted between the listing and
//! its `HeadObject` is left out.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via the configuration file (or its
//! environment overrides): `key_id` and `key_secret`.

use crate::{
    Backend,
    backend::{Blob, BoxAsyncRead, RemoteEntryStream},
    error::{ErrorKind, Result},
    models::{ClientId, FINGERPRINT_METADATA_KEY, Fingerprint, RemoteEntry, WRITER_METADATA_KEY},
    path::{to_key, validate as validate_path},
};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::DisplayErrorContext,
    primitives::{ByteStream, DateTime},
};
use exn::{OptionExt, ResultExt};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;
/// How many `HeadObject` requests a listing keeps in flight.
const LIST_METADATA_CONCURRENCY: usize = 16;

/// S3-compatible remote backend.
///
/// # Examples
///
/// ```no_run
/// use cloudsync_storage::backend::S3Backend;
///
/// # async fn example() {
/// let backend = S3Backend::new(
///     "s3://my-bucket/sync",
///     "my-bucket",
///     Some("sync".to_string()),
///     "us-west-004",
///     Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// ).await.unwrap();
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (the remote root)
    /// * `region` - AWS region or provider-specific region (e.g., "us-west-004" for Backblaze)
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - AWS/provider access key ID
    /// * `key_secret` - AWS/provider secret access key
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix
            .filter(|p| !p.trim_matches('/').is_empty())
            .map(|p| to_key(Path::new(&p)))
            .transpose()?;
        let region = Region::new(region.into());
        let credentials = Credentials::new(key_id, key_secret, None, None, "cloudsync-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(region)
            // Configure retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Use path-style addressing for better compatibility with
            // S3-compatible services (Backblaze, MinIO, etc.)
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Ok(Self {
            name: name.into(),
            client: Client::from_conf(config_builder.build()),
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    /// Construct the full S3 key from a relative path.
    fn full_key(&self, path: &Path) -> Result<String> {
        Ok(join_key(self.prefix.as_deref(), &to_key(path)?))
    }

    /// Strip the configured prefix from an S3 key to get the relative path.
    fn relative_path(&self, key: &str) -> Result<PathBuf> {
        validate_path(strip_key(self.prefix.as_deref(), key))
    }

    /// Prefix used for listings; always ends in `/` so that `sync` doesn't
    /// also match `sync-old/...`.
    fn list_prefix(&self) -> Option<String> {
        self.prefix.as_ref().map(|p| format!("{p}/"))
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("request limiter closed".to_string()))
    }

    /// Stream every object key under the prefix, skipping directory markers.
    fn list_keys(&self) -> impl futures::Stream<Item = Result<String>> + Send + '_ {
        stream! {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(self.list_prefix())
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(exn::Exn::from(ErrorKind::Network(DisplayErrorContext(&e).to_string())));
                        return;
                    },
                };
                for object in page.contents() {
                    match object.key() {
                        Some(key) if !key.ends_with('/') => yield Ok(key.to_string()),
                        _ => {},
                    }
                }
            }
        }
    }

    /// `HeadObject` for a full key, mapped to a [`RemoteEntry`].
    async fn head(&self, key: &str) -> Result<RemoteEntry> {
        let path = self.relative_path(key)?;
        let _permit = self.acquire_permit().await?;
        let head = self.client.head_object().bucket(&self.bucket).key(key).send().await.map_err(|e| {
            let not_found = e.as_service_error().is_some_and(|se| se.is_not_found());
            match not_found {
                true => exn::Exn::from(ErrorKind::NotFound(path.clone())),
                false => exn::Exn::from(ErrorKind::Network(DisplayErrorContext(&e).to_string())),
            }
        })?;
        let size = head.content_length().unwrap_or(0).max(0) as u64;
        entry_from_parts(path, head.metadata(), head.e_tag(), head.last_modified(), size)
    }
}

#[async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream(&self) -> RemoteEntryStream<'_> {
        Box::pin(
            self.list_keys()
                .map_ok(move |key| async move { skip_vanished(&key, self.head(&key).await) })
                .try_buffer_unordered(LIST_METADATA_CONCURRENCY)
                .try_filter_map(|entry| futures::future::ready(Ok(entry))),
        )
    }

    async fn get(&self, path: &Path) -> Result<Blob> {
        let key = self.full_key(path)?;
        let path = validate_path(path)?;
        let _permit = self.acquire_permit().await?;
        let output = self.client.get_object().bucket(&self.bucket).key(&key).send().await.map_err(|e| {
            let not_found = e.as_service_error().is_some_and(|se| se.is_no_such_key());
            match not_found {
                true => exn::Exn::from(ErrorKind::NotFound(path.clone())),
                false => exn::Exn::from(ErrorKind::Network(DisplayErrorContext(&e).to_string())),
            }
        })?;
        let size = output.content_length().unwrap_or(0).max(0) as u64;
        let entry = entry_from_parts(path, output.metadata(), output.e_tag(), output.last_modified(), size)?;
        Ok(Blob {
            entry,
            content: Box::pin(output.body.into_async_read()),
        })
    }

    async fn put(&self, path: &Path, mut content: BoxAsyncRead, writer: &ClientId) -> Result<()> {
        let key = self.full_key(path)?;
        // PutObject needs a known content length, so the upload is buffered.
        let mut data = Vec::new();
        content.read_to_end(&mut data).await.map_err(|e| ErrorKind::from_io(e, path))?;
        let fingerprint = Fingerprint::of(&data);
        let _permit = self.acquire_permit().await?;
        tracing::debug!(bucket = %self.bucket, key = %key, bytes = data.len(), "PutObject");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .metadata(WRITER_METADATA_KEY, writer.as_str())
            .metadata(FINGERPRINT_METADATA_KEY, fingerprint.as_str())
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| ErrorKind::Network(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| ErrorKind::Network(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<RemoteEntry> {
        let key = self.full_key(path)?;
        self.head(&key).await
    }
}

fn join_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
        None => key.to_string(),
    }
}

fn strip_key<'k>(prefix: Option<&str>, key: &'k str) -> &'k str {
    match prefix {
        Some(prefix) => {
            let prefix_normalized = prefix.trim_end_matches('/');
            key.strip_prefix(prefix_normalized).and_then(|s| s.strip_prefix('/')).unwrap_or(key)
        },
        None => key,
    }
}

/// An object deleted by another writer between the listing and its
/// `HeadObject` is left out of the listing.
fn skip_vanished(key: &str, head: Result<RemoteEntry>) -> Result<Option<RemoteEntry>> {
    match head {
        Ok(entry) => Ok(Some(entry)),
        Err(e) if e.is_not_found() => {
            tracing::debug!(key, "object vanished during listing");
            Ok(None)
        },
        Err(e) => Err(e),
    }
}

/// Convert AWS DateTime to OffsetDateTime.
fn parse_datetime(dt: &DateTime) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
        .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string()))
}

/// Build a [`RemoteEntry`] from the pieces `HeadObject`/`GetObject` return.
fn entry_from_parts(
    path: PathBuf,
    metadata: Option<&HashMap<String, String>>,
    e_tag: Option<&str>,
    last_modified: Option<&DateTime>,
    size: u64,
) -> Result<RemoteEntry> {
    let modified = last_modified
        .ok_or_raise(|| ErrorKind::BackendError(format!("no last-modified for {}", path.display())))
        .and_then(parse_datetime)?;
    let fingerprint = match metadata.and_then(|m| m.get(FINGERPRINT_METADATA_KEY)) {
        Some(digest) => Fingerprint::new(digest.as_str()),
        None => {
            let e_tag = e_tag.ok_or_raise(|| ErrorKind::BackendError(format!("no ETag for {}", path.display())))?;
            Fingerprint::opaque("etag", e_tag.trim_matches('"'))
        },
    };
    let writer = metadata.and_then(|m| m.get(WRITER_METADATA_KEY)).map(|w| ClientId::new(w.as_str()));
    Ok(RemoteEntry::new(path, fingerprint, modified, size).with_writer(writer))
}
