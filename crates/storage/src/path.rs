//! Relative path handling shared by both replicas.
//!
//! Every path that crosses the storage boundary is relative to a replica
//! root. Paths coming from a remote listing or a directory walk are
//! normalized here before they become snapshot keys, so the local and remote
//! sides of the same file always compare equal.

use crate::error::{ErrorKind, Result};
use exn::OptionExt;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Validates and normalizes a path relative to a replica root.
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Returns
/// Returns the normalized path if valid, or [`InvalidPath`](crate::error::ErrorKind::InvalidPath)
/// if it is empty or would leave the root.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use cloudsync_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("photos/2024/beach.jpg").is_ok());
/// assert!(validate_path("notes/../todo.txt").is_ok()); // (never leaves the root)
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err());
/// assert!(validate_path("a\0b").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("wrong/../docs/./report.pdf/").unwrap(),
///     Path::new("docs/report.pdf")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    Ok(segments(path.as_ref())?.into_iter().collect())
}

/// Render a path as an object key: validated, always `/`-separated.
pub fn to_key(path: &Path) -> Result<String> {
    let parts = segments(path)?
        .into_iter()
        .map(|part| part.to_str().ok_or_raise(|| ErrorKind::InvalidPath(path.to_path_buf())))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

/// Resolve `.` and `..` lexically, never climbing above the root.
fn segments(path: &Path) -> Result<Vec<&OsStr>> {
    let invalid = || ErrorKind::InvalidPath(path.to_path_buf());
    let mut resolved = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir | Component::RootDir => {},
            Component::ParentDir => {
                resolved.pop().ok_or_raise(invalid)?;
            },
            // NUL survives `components()` on Unix but truncates at the syscall.
            Component::Normal(name) if name.as_encoded_bytes().contains(&0) => exn::bail!(invalid()),
            Component::Normal(name) => resolved.push(name),
            Component::Prefix(_) => exn::bail!(invalid()),
        }
    }
    if resolved.is_empty() {
        exn::bail!(invalid());
    }
    Ok(resolved)
}
