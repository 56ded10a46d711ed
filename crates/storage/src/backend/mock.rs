//! In-memory remote backend for testing.

use super::{Blob, BoxAsyncRead, RemoteEntryStream};
use crate::Backend;
use crate::error::{ErrorKind, Result};
use crate::models::{ClientId, Fingerprint, RemoteEntry};
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

struct Object {
    modified: OffsetDateTime,
    writer: Option<ClientId>,
    data: Vec<u8>,
}

/// In-memory remote backend for testing.
///
/// Objects are stored in a `HashMap` behind a [`RwLock`], so all trait
/// methods can operate on `&self` without external synchronisation. Tests
/// can control timestamps and writer tags directly, and make individual
/// paths fail to exercise error handling.
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<PathBuf, Object>>,
    failing: RwLock<HashSet<PathBuf>>,
    fail_listing: RwLock<bool>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with untagged objects.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = OffsetDateTime::now_utc();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                // The panic here is DELIBERATE. MockBackend is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, Object { modified: now, writer: None, data: data.into() });
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
            failing: RwLock::new(HashSet::new()),
            fail_listing: RwLock::new(false),
        }
    }

    /// Insert (or replace) an object with full control over its metadata.
    ///
    /// Panics on an invalid path, same as [`with_files`](Self::with_files).
    pub async fn insert(
        &self,
        path: impl AsRef<Path>,
        data: impl Into<Vec<u8>>,
        modified: OffsetDateTime,
        writer: Option<ClientId>,
    ) {
        let path = validate_path(path.as_ref()).expect("MockBackend::insert: invalid path");
        self.storage.write().await.insert(path, Object { modified, writer, data: data.into() });
    }

    /// Remove an object behind the engine's back, as another client would.
    pub async fn remove(&self, path: impl AsRef<Path>) -> bool {
        self.storage.write().await.remove(path.as_ref()).is_some()
    }

    /// Raw contents of an object, or `None` if it doesn't exist.
    pub async fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.storage.read().await.get(path).map(|object| object.data.clone())
    }

    /// Make every operation on `path` fail with a backend error.
    pub async fn fail_on(&self, path: impl Into<PathBuf>) {
        self.failing.write().await.insert(path.into());
    }

    /// Make listings fail (or succeed again).
    pub async fn fail_listing(&self, fail: bool) {
        *self.fail_listing.write().await = fail;
    }

    async fn check(&self, path: &Path) -> Result<()> {
        if self.failing.read().await.contains(path) {
            exn::bail!(ErrorKind::BackendError(format!("injected failure for {}", path.display())));
        }
        Ok(())
    }

    fn entry(path: &Path, object: &Object) -> RemoteEntry {
        RemoteEntry::new(path, Fingerprint::of(&object.data), object.modified, object.data.len() as u64)
            .with_writer(object.writer.clone())
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream(&self) -> RemoteEntryStream<'_> {
        Box::pin(stream! {
            if *self.fail_listing.read().await {
                yield Err(exn::Exn::from(ErrorKind::Network("injected listing failure".to_string())));
                return;
            }
            // Snapshot entries under the read lock, then drop it before
            // yielding to avoid holding the lock across yield points.
            let entries: Vec<RemoteEntry> = {
                let guard = self.storage.read().await;
                guard.iter().map(|(path, object)| Self::entry(path, object)).collect()
            };
            for entry in entries {
                yield Ok(entry);
            }
        })
    }

    async fn get(&self, path: &Path) -> Result<Blob> {
        let path = validate_path(path)?;
        self.check(&path).await?;
        let guard = self.storage.read().await;
        let object = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(Blob {
            entry: Self::entry(&path, object),
            content: Box::pin(Cursor::new(object.data.clone())),
        })
    }

    async fn put(&self, path: &Path, mut content: BoxAsyncRead, writer: &ClientId) -> Result<()> {
        let path = validate_path(path)?;
        self.check(&path).await?;
        let mut data = Vec::new();
        content.read_to_end(&mut data).await.or_raise(|| ErrorKind::BackendError("reading upload".to_string()))?;
        let object = Object {
            modified: OffsetDateTime::now_utc(),
            writer: Some(writer.clone()),
            data,
        };
        self.storage.write().await.insert(path, object);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        self.check(&path).await?;
        // Same as S3: deleting a missing object is not an error.
        self.storage.write().await.remove(&path);
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<RemoteEntry> {
        let path = validate_path(path)?;
        self.check(&path).await?;
        let guard = self.storage.read().await;
        let object = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(Self::entry(&path, object))
    }
}
