use crate::error::{ErrorKind, Result};
use cloudsync_storage::{Backend, LocalEntry, LocalTree, RemoteEntry};
use exn::ResultExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Point-in-time listing of both replicas.
///
/// Built fresh each cycle and never modified afterwards; the engine keeps
/// the latest one around as the baseline for the next diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub remote: BTreeMap<PathBuf, RemoteEntry>,
    pub local: BTreeMap<PathBuf, LocalEntry>,
    /// `None` for the empty snapshot a fresh engine starts from.
    pub captured_at: Option<OffsetDateTime>,
}

impl Snapshot {
    /// The baseline before the first cycle: every path will look added.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(remote: impl IntoIterator<Item = RemoteEntry>, local: impl IntoIterator<Item = LocalEntry>) -> Self {
        Self {
            remote: remote.into_iter().map(|entry| (entry.path.clone(), entry)).collect(),
            local: local.into_iter().map(|entry| (entry.path.clone(), entry)).collect(),
            captured_at: Some(OffsetDateTime::now_utc()),
        }
    }

    /// List the remote replica, then the local one.
    ///
    /// Paths under any of the `exclude` prefixes (trash locations) are left
    /// out of the respective side.
    #[tracing::instrument(level = "debug", skip_all, fields(backend = backend.name()))]
    pub async fn capture(
        backend: &dyn Backend,
        local: &LocalTree,
        exclude_remote: &[PathBuf],
        exclude_local: &[PathBuf],
    ) -> Result<Self> {
        let remote = backend.list_all().await.or_raise(|| ErrorKind::ListRemote)?;
        let remote = remote.into_iter().filter(|entry| !is_excluded(&entry.path, exclude_remote));
        let local = local.list_all(exclude_local).await.or_raise(|| ErrorKind::ListLocal)?;
        let snapshot = Self::new(remote, local);
        tracing::debug!(remote = snapshot.remote.len(), local = snapshot.local.len(), "captured snapshot");
        Ok(snapshot)
    }

    pub fn is_empty(&self) -> bool {
        self.remote.is_empty() && self.local.is_empty()
    }
}

fn is_excluded(path: &Path, exclude: &[PathBuf]) -> bool {
    exclude.iter().any(|prefix| path.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_storage::backend::MockBackend;
    use std::path::Path;

    #[tokio::test]
    async fn test_capture_lists_both_sides() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("local.txt"), b"local").unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".trash/1")).unwrap();
        std::fs::write(temp_dir.path().join(".trash/1/gone.txt"), b"gone").unwrap();
        let tree = LocalTree::new(temp_dir.path()).unwrap();
        let backend = MockBackend::with_files([
            ("remote.txt", Vec::from(*b"remote")),
            (".trash/5/old.txt", Vec::from(*b"old")),
        ]);

        let trash = [PathBuf::from(".trash")];
        let snapshot = Snapshot::capture(&backend, &tree, &trash, &trash).await.unwrap();
        assert_eq!(snapshot.remote.keys().collect::<Vec<_>>(), vec![Path::new("remote.txt")]);
        assert_eq!(snapshot.local.keys().collect::<Vec<_>>(), vec![Path::new("local.txt")]);
        assert!(snapshot.captured_at.is_some());
    }

    #[tokio::test]
    async fn test_capture_fails_with_remote_listing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tree = LocalTree::new(temp_dir.path()).unwrap();
        let backend = MockBackend::default();
        backend.fail_listing(true).await;
        let err = Snapshot::capture(&backend, &tree, &[], &[]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ListRemote));
    }

    #[test]
    fn test_empty() {
        let snapshot = Snapshot::empty();
        assert!(snapshot.is_empty());
        assert!(snapshot.captured_at.is_none());
    }
}
