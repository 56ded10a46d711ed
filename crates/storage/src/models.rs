//! Replica models.
//!
//! These types describe what a listing observed on either replica. They are
//! captured into a snapshot once per cycle and never mutated afterwards.

use derive_more::Display;
use std::path::PathBuf;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Object metadata key holding the [`ClientId`] of the last writer.
pub const WRITER_METADATA_KEY: &str = "writer-client-id";
/// Object metadata key holding the BLAKE3 [`Fingerprint`] of the content.
pub const FINGERPRINT_METADATA_KEY: &str = "blake3";

const HASH_BUFFER_BYTES: usize = 64 * 1024;

/// Content fingerprint used purely for change detection.
///
/// Local files and objects written by cloudsync carry a BLAKE3 hex digest.
/// Objects written by other tooling may carry an opaque value (see
/// [`Fingerprint::opaque`]) which never compares equal to a digest.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);
impl Fingerprint {
    /// Fingerprint of an in-memory buffer.
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        Self(blake3::hash(bytes.as_ref()).to_hex().to_string())
    }

    /// Wrap a fingerprint previously produced by [`Fingerprint::of`] (read
    /// back from object metadata, for example).
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// A fingerprint from some other hashing scheme, namespaced so it can
    /// only ever equal another fingerprint from that same scheme.
    pub fn opaque(scheme: &str, value: impl AsRef<str>) -> Self {
        Self(format!("{scheme}:{}", value.as_ref()))
    }

    /// Stream a reader to the end, returning its fingerprint and length.
    pub async fn from_reader<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<(Self, u64)> {
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; HASH_BUFFER_BYTES];
        let mut total = 0u64;
        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            total += read as u64;
        }
        Ok((Self(hasher.finalize().to_hex().to_string()), total))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity of the machine that last wrote a remote object.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);
impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One remote object, as seen by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Relative path from the remote root
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    /// Last modified timestamp as reported by the store
    pub modified: OffsetDateTime,
    /// Object size in bytes
    pub size: u64,
    /// Who last wrote this object; `None` for objects from other tooling.
    pub writer: Option<ClientId>,
}
impl RemoteEntry {
    pub fn new(path: impl Into<PathBuf>, fingerprint: Fingerprint, modified: OffsetDateTime, size: u64) -> Self {
        Self {
            path: path.into(),
            fingerprint,
            modified,
            size,
            writer: None,
        }
    }

    pub fn with_writer(mut self, writer: Option<ClientId>) -> Self {
        self.writer = writer;
        self
    }

    /// Whether `client` was the last machine to write this object.
    pub fn written_by(&self, client: &ClientId) -> bool {
        self.writer.as_ref() == Some(client)
    }
}

/// One regular file in the local tree, as seen by a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    /// Relative path from the local root
    pub path: PathBuf,
    /// BLAKE3 of the whole file, computed during the walk
    pub fingerprint: Fingerprint,
    pub modified: OffsetDateTime,
    pub size: u64,
}
impl LocalEntry {
    pub fn new(path: impl Into<PathBuf>, fingerprint: Fingerprint, modified: OffsetDateTime, size: u64) -> Self {
        Self {
            path: path.into(),
            fingerprint,
            modified,
            size,
        }
    }
}
