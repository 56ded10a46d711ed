//! Remote blob store trait and implementations.
//!
//! This module defines the [`Backend`] trait, the interface the sync engine
//! uses to talk to the remote replica. Every operation addresses objects by
//! a path relative to the backend's configured root.

#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::Result;
use crate::models::{ClientId, RemoteEntry};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;

pub type RemoteEntryStream<'a> = Pin<Box<dyn Stream<Item = Result<RemoteEntry>> + Send + 'a>>;
/// Owned byte stream handed across the storage boundary.
///
/// Whoever holds it owns it; dropping it closes the underlying file or
/// connection.
pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send + 'static>>;

/// Content and metadata of a fetched object.
pub struct Blob {
    pub entry: RemoteEntry,
    pub content: BoxAsyncRead,
}

/// Unified interface for remote blob stores.
///
/// # Path Handling
/// All paths are relative to the backend root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations
/// enforce this validation.
///
/// # Writer Tags
/// [`put()`](Self::put) records the writing machine's [`ClientId`] in the
/// object's metadata under [`WRITER_METADATA_KEY`](crate::WRITER_METADATA_KEY),
/// and every listing reports it back in [`RemoteEntry::writer`]. The engine
/// relies on this to tell its own uploads apart from other writers'.
///
/// # Examples
///
/// ```
/// use cloudsync_storage::{Backend, error::Result};
///
/// async fn remote_size(backend: &dyn Backend) -> Result<u64> {
///     let entries = backend.list_all().await?;
///     Ok(entries.iter().map(|entry| entry.size).sum())
/// }
/// ```
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name of the configured backend, used for logging only.
    fn name(&self) -> &str;

    /// Full recursive listing under the backend root.
    ///
    /// Default implementation collects [`list_stream()`](Self::list_stream)
    /// into a [`Vec`]; the first error aborts the listing.
    async fn list_all(&self) -> Result<Vec<RemoteEntry>> {
        self.list_stream().try_collect().await
    }

    /// Stream every object under the backend root, with fingerprint,
    /// modification time and writer tag populated.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// # use cloudsync_storage::{Backend, error::Result};
    /// # async fn example(backend: &dyn Backend) -> Result<()> {
    /// let mut stream = backend.list_stream();
    /// while let Some(entry) = stream.try_next().await? {
    ///     println!("{} {}", entry.path.display(), entry.fingerprint);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream(&self) -> RemoteEntryStream<'_>;

    /// Fetch an object's metadata and content.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn get(&self, path: &Path) -> Result<Blob>;

    /// Store `content` at `path`, overwriting any existing object and
    /// stamping it with `writer`.
    ///
    /// The stream is consumed (and therefore closed) by this call.
    async fn put(&self, path: &Path, content: BoxAsyncRead, writer: &ClientId) -> Result<()>;

    /// Delete an object.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Get object metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn stat(&self, path: &Path) -> Result<RemoteEntry>;
}
