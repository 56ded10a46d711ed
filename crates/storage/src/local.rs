//! Local replica: directory walk, hashing and file operations.
//!
//! [`LocalTree`] is the local counterpart to a remote [`Backend`](crate::Backend).
//! It walks regular files under an absolute root and fingerprints each one
//! by reading its full contents, and it provides the handful of file
//! operations the executor needs (open, atomic write, delete, move).

use crate::backend::BoxAsyncRead;
use crate::error::{ErrorKind, Result};
use crate::models::{Fingerprint, LocalEntry};
use crate::path::validate as validate_path;
use async_stream::stream;
use exn::ResultExt;
use futures::{Stream, TryStreamExt};
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use time::OffsetDateTime;
use tokio::fs::{self, DirEntry};
use tokio::io::AsyncWriteExt;

/// Suffix of the temporary files downloads are streamed into.
pub const PARTIAL_SUFFIX: &str = ".cloudsync-part";

pub type LocalEntryStream<'a> = Pin<Box<dyn Stream<Item = Result<LocalEntry>> + Send + 'a>>;

enum WalkEntry {
    File(LocalEntry),
    Descend(PathBuf),
    Skip,
}

/// The local directory tree being kept in sync.
///
/// All paths passed to its methods are relative to the root and validated
/// with [`validate_path`](crate::validate_path).
///
/// # Examples
///
/// ```no_run
/// use cloudsync_storage::LocalTree;
///
/// # async fn example() {
/// let tree = LocalTree::new("/home/me/Sync").unwrap();
/// for entry in tree.list_all(&[]).await.unwrap() {
///     println!("{} {}", entry.path.display(), entry.fingerprint);
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
}
impl LocalTree {
    /// Open the local tree rooted at `root`, creating the directory if it
    /// doesn't exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute or is not a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        // Collecting components drops any trailing separator.
        let root: PathBuf = root.as_ref().components().collect();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Use non-async here; it'll only happen once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| ErrorKind::from_io(e, &root))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the absolute path for a relative path.
    pub fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Convert an absolute path back to a path relative to the root.
    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    /// Walk every regular file below the root, skipping anything under one
    /// of the `exclude` prefixes (relative to the root) and partial
    /// downloads. Each file is fingerprinted as it is yielded.
    pub fn list_stream<'a>(&'a self, exclude: &'a [PathBuf]) -> LocalEntryStream<'a> {
        let mut stack = vec![self.root.clone()];
        Box::pin(stream! {
            while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::from_io(err, &current)));
                        continue;
                    }
                };
                loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break,
                        Err(e) => { yield Err(exn::Exn::from(ErrorKind::from_io(e, &current))); continue; },
                    };
                    match self.process_entry(entry, exclude).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    /// Collect [`list_stream()`](Self::list_stream); the first error aborts
    /// the walk.
    pub async fn list_all(&self, exclude: &[PathBuf]) -> Result<Vec<LocalEntry>> {
        self.list_stream(exclude).try_collect().await
    }

    async fn process_entry(&self, entry: DirEntry, exclude: &[PathBuf]) -> Result<WalkEntry> {
        let path = entry.path();
        // `DirEntry::metadata` doesn't follow symlinks, so links (and
        // anything else that isn't a plain file or directory) are skipped.
        let metadata = entry.metadata().await.map_err(|e| ErrorKind::from_io(e, &path))?;
        let relative = self.relative_path(&path)?;
        if exclude.iter().any(|prefix| relative.starts_with(prefix)) {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        if metadata.is_file() && !is_partial(&relative) {
            return Ok(WalkEntry::File(self.hash_file(&path, relative, &metadata).await?));
        }
        Ok(WalkEntry::Skip)
    }

    async fn hash_file(&self, absolute: &Path, relative: PathBuf, metadata: &Metadata) -> Result<LocalEntry> {
        let modified: OffsetDateTime = metadata.modified().map_err(ErrorKind::Io)?.into();
        let file = fs::File::open(absolute).await.map_err(|e| ErrorKind::from_io(e, &relative))?;
        let (fingerprint, size) = Fingerprint::from_reader(file).await.map_err(|e| ErrorKind::from_io(e, &relative))?;
        Ok(LocalEntry::new(relative, fingerprint, modified, size))
    }

    /// Re-read a single file, or `None` if it doesn't exist (any more).
    pub async fn stat(&self, path: &Path) -> Result<Option<LocalEntry>> {
        let relative = validate_path(path)?;
        let absolute = self.root.join(&relative);
        let metadata = match fs::metadata(&absolute).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => exn::bail!(ErrorKind::from_io(e, path)),
        };
        Ok(Some(self.hash_file(&absolute, relative, &metadata).await?))
    }

    /// Open a file for streaming reads.
    pub async fn open(&self, path: &Path) -> Result<BoxAsyncRead> {
        let absolute = self.absolute_path(path)?;
        let file = fs::File::open(&absolute).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(Box::pin(file))
    }

    /// Stream `content` into `path`, replacing any existing file.
    ///
    /// Parent directories are created as needed. The content lands in a
    /// sibling partial file first and is renamed into place once complete,
    /// so an interrupted transfer never leaves a truncated file behind.
    pub async fn write(&self, path: &Path, mut content: BoxAsyncRead) -> Result<u64> {
        let absolute = self.absolute_path(path)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, path))?;
        }
        let partial = partial_path(&absolute)?;
        let result = async {
            let mut file = fs::File::create(&partial).await?;
            let written = tokio::io::copy(&mut content, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&partial, &absolute).await?;
            Ok::<_, std::io::Error>(written)
        }
        .await;
        match result {
            Ok(written) => Ok(written),
            Err(e) => {
                // Best effort, the partial file is ignored by the walk anyway.
                _ = fs::remove_file(&partial).await;
                exn::bail!(ErrorKind::from_io(e, path))
            },
        }
    }

    /// Delete a file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    pub async fn delete(&self, path: &Path) -> Result<()> {
        let absolute = self.absolute_path(path)?;
        Ok(fs::remove_file(&absolute).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    /// Move a file to an absolute destination (used for the trash),
    /// creating the destination's parent directories.
    pub async fn move_to(&self, path: &Path, destination: &Path) -> Result<()> {
        let absolute = self.absolute_path(path)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, destination))?;
        }
        Ok(relocate(&absolute, destination).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }
}

/// Rename, or copy then remove when `to` is on another filesystem.
async fn relocate(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to).await {
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            tracing::debug!(from = %from.display(), to = %to.display(), "rename crosses devices, copying");
            copy_then_remove(from, to).await
        },
        result => result,
    }
}

async fn copy_then_remove(from: &Path, to: &Path) -> std::io::Result<()> {
    let copied = async {
        fs::copy(from, to).await?;
        fs::File::open(to).await?.sync_all().await
    }
    .await;
    if let Err(e) = copied {
        _ = fs::remove_file(to).await;
        return Err(e);
    }
    fs::remove_file(from).await
}

fn is_partial(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
}

/// `dir/name.txt` becomes `dir/.name.txt.cloudsync-part`.
fn partial_path(absolute: &Path) -> Result<PathBuf> {
    let name = absolute
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidPath(absolute.to_path_buf())))?;
    Ok(absolute.with_file_name(format!(".{name}{PARTIAL_SUFFIX}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: &'static [u8]) -> BoxAsyncRead {
        Box::pin(Cursor::new(data))
    }

    fn tree() -> (tempfile::TempDir, LocalTree) {
        let temp_dir = tempfile::tempdir().unwrap();
        let tree = LocalTree::new(temp_dir.path()).unwrap();
        (temp_dir, tree)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalTree::new(temp_dir.path()).is_ok());
        assert!(LocalTree::new("relative/path").is_err());
        assert!(LocalTree::new("./relative").is_err());
    }

    #[test]
    fn test_new_strips_trailing_separator() {
        let temp_dir = tempfile::tempdir().unwrap();
        let with_slash = format!("{}/", temp_dir.path().display());
        let tree = LocalTree::new(&with_slash).unwrap();
        assert_eq!(tree.root(), temp_dir.path());
    }

    #[test]
    fn test_absolute_path() {
        let (temp_dir, tree) = tree();
        let expected = temp_dir.path().join("docs/report.pdf");
        assert_eq!(tree.absolute_path(Path::new("docs/report.pdf")).unwrap(), expected);
        // Path traversal is prevented
        assert!(tree.absolute_path(Path::new("../etc/passwd")).is_err());
    }

    #[tokio::test]
    async fn test_write_and_list() {
        let (_temp_dir, tree) = tree();
        tree.write(Path::new("a/b/c.txt"), reader(b"hello")).await.unwrap();
        tree.write(Path::new("top.txt"), reader(b"world")).await.unwrap();
        let mut entries = tree.list_all(&[]).await.unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, Path::new("a/b/c.txt"));
        assert_eq!(entries[0].fingerprint, Fingerprint::of(b"hello"));
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[1].path, Path::new("top.txt"));
    }

    #[tokio::test]
    async fn test_write_overwrites_and_leaves_no_partial() {
        let (temp_dir, tree) = tree();
        tree.write(Path::new("file.txt"), reader(b"one")).await.unwrap();
        tree.write(Path::new("file.txt"), reader(b"two")).await.unwrap();
        assert_eq!(std::fs::read(temp_dir.path().join("file.txt")).unwrap(), b"two");
        assert!(!temp_dir.path().join(".file.txt.cloudsync-part").exists());
    }

    #[tokio::test]
    async fn test_list_skips_partials_and_excluded() {
        let (temp_dir, tree) = tree();
        std::fs::write(temp_dir.path().join(".x.txt.cloudsync-part"), b"partial").unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".trash/123")).unwrap();
        std::fs::write(temp_dir.path().join(".trash/123/old.txt"), b"old").unwrap();
        std::fs::write(temp_dir.path().join("kept.txt"), b"kept").unwrap();
        let entries = tree.list_all(&[PathBuf::from(".trash")]).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, Path::new("kept.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_skips_symlinks() {
        let (temp_dir, tree) = tree();
        std::fs::write(temp_dir.path().join("real.txt"), b"real").unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("real.txt"), temp_dir.path().join("link.txt")).unwrap();
        let entries = tree.list_all(&[]).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, Path::new("real.txt"));
    }

    #[tokio::test]
    async fn test_list_empty_directory() {
        let (_temp_dir, tree) = tree();
        assert!(tree.list_all(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stat() {
        let (_temp_dir, tree) = tree();
        assert!(tree.stat(Path::new("missing.txt")).await.unwrap().is_none());
        tree.write(Path::new("file.txt"), reader(b"data")).await.unwrap();
        let entry = tree.stat(Path::new("file.txt")).await.unwrap().unwrap();
        assert_eq!(entry.fingerprint, Fingerprint::of(b"data"));
        // Directories are not files
        tree.write(Path::new("dir/inner.txt"), reader(b"x")).await.unwrap();
        assert!(tree.stat(Path::new("dir")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_temp_dir, tree) = tree();
        tree.write(Path::new("file.txt"), reader(b"data")).await.unwrap();
        tree.delete(Path::new("file.txt")).await.unwrap();
        assert!(tree.stat(Path::new("file.txt")).await.unwrap().is_none());
        let err = tree.delete(Path::new("file.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_move_to() {
        let (temp_dir, tree) = tree();
        tree.write(Path::new("file.txt"), reader(b"data")).await.unwrap();
        let destination = temp_dir.path().join(".trash/1/file.txt");
        tree.move_to(Path::new("file.txt"), &destination).await.unwrap();
        assert!(destination.exists());
        assert!(tree.stat(Path::new("file.txt")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_copy_then_remove() {
        let (temp_dir, tree) = tree();
        let elsewhere = tempfile::tempdir().unwrap();
        tree.write(Path::new("file.txt"), reader(b"data")).await.unwrap();
        let destination = elsewhere.path().join("file.txt");
        copy_then_remove(&temp_dir.path().join("file.txt"), &destination).await.unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"data");
        assert!(tree.stat(Path::new("file.txt")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_copy_then_remove_keeps_source_on_failure() {
        let (temp_dir, tree) = tree();
        tree.write(Path::new("file.txt"), reader(b"data")).await.unwrap();
        // Parent doesn't exist, so the copy fails.
        let destination = temp_dir.path().join("missing/dir/file.txt");
        assert!(copy_then_remove(&temp_dir.path().join("file.txt"), &destination).await.is_err());
        assert!(!destination.exists());
        assert!(tree.stat(Path::new("file.txt")).await.unwrap().is_some());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_move_to_other_filesystem() {
        use std::os::unix::fs::MetadataExt;

        let (temp_dir, tree) = tree();
        let Ok(elsewhere) = tempfile::tempdir_in("/dev/shm") else {
            return;
        };
        let device = |path: &Path| std::fs::metadata(path).unwrap().dev();
        if device(temp_dir.path()) == device(elsewhere.path()) {
            return;
        }
        tree.write(Path::new("a.txt"), reader(b"data")).await.unwrap();
        let destination = elsewhere.path().join("trash/1/a.txt");
        tree.move_to(Path::new("a.txt"), &destination).await.unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"data");
        assert!(tree.stat(Path::new("a.txt")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_path_security() {
        let (_temp_dir, tree) = tree();
        assert!(tree.open(Path::new("../etc/passwd")).await.is_err());
        assert!(tree.write(Path::new("../escape"), reader(b"data")).await.is_err());
        assert!(tree.delete(Path::new("../../file")).await.is_err());
    }
}
