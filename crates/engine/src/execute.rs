//! Carrying out planned actions against the two replicas.
//!
//! Actions run one at a time, in the order they were planned. What happens
//! when one fails is down to the [`FailurePolicy`]: by default the rest of
//! the batch is abandoned (nothing is rolled back).

use crate::error::{Error, ErrorKind, Result};
use crate::reconcile::Action;
use cloudsync_storage::{BackendHandle, ClientId, LocalEntry, LocalTree, RemoteEntry};
use derive_more::Display;
use exn::ResultExt;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop at the first failing action.
    #[default]
    AbortOnFirst,
    /// Attempt every action and collect every error.
    ContinueAll,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    #[display("already in sync")]
    AlreadyInSync,
    /// The local file was modified after the remote object it would have
    /// been replaced with.
    #[display("local file is newer")]
    LocalNewer,
    #[display("already gone")]
    AlreadyGone,
}

/// What a successful action actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Bytes copied between replicas.
    Transferred(u64),
    Deleted,
    /// Moved (or copied, for the remote) into the trash at this location.
    Trashed(PathBuf),
    Skipped(SkipReason),
}

/// Where deleted files go instead of disappearing.
#[derive(Debug, Clone, Default)]
pub struct Trash {
    /// Absolute directory for local deletes.
    pub local: Option<PathBuf>,
    /// Key prefix, relative to the remote root, for remote deletes.
    pub remote: Option<PathBuf>,
}
impl Trash {
    /// The local trash relative to `root`, when it lives inside it.
    pub fn local_exclude(&self, root: &Path) -> Option<PathBuf> {
        let relative = self.local.as_ref()?.strip_prefix(root).ok()?;
        (!relative.as_os_str().is_empty()).then(|| relative.to_path_buf())
    }

    pub fn remote_exclude(&self) -> Option<PathBuf> {
        self.remote.clone()
    }
}

/// `<trash>/<unix timestamp>/<path>`
fn trash_path(trash: &Path, path: &Path) -> PathBuf {
    trash.join(OffsetDateTime::now_utc().unix_timestamp().to_string()).join(path)
}

/// The result of one batch.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub completed: Vec<(Action, Outcome)>,
    pub errors: Vec<Error>,
    /// Actions left untouched after an abort.
    pub not_attempted: usize,
}
impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn count(&self, matches: impl Fn(&Outcome) -> bool) -> usize {
        self.completed.iter().filter(|(_, outcome)| matches(outcome)).count()
    }

    pub fn transferred(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Transferred(_)))
    }

    pub fn deleted(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Deleted))
    }

    pub fn trashed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Trashed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped(_)))
    }

    pub fn log_summary(&self) {
        tracing::info!(
            transferred = self.transferred(),
            deleted = self.deleted(),
            trashed = self.trashed(),
            skipped = self.skipped(),
            failed = self.errors.len(),
            not_attempted = self.not_attempted,
            "executed actions"
        );
    }
}

/// Runs actions against a remote backend and the local tree.
pub struct Executor {
    backend: BackendHandle,
    local: LocalTree,
    client_id: ClientId,
    policy: FailurePolicy,
    trash: Trash,
}

impl Executor {
    pub fn new(backend: BackendHandle, local: LocalTree, client_id: ClientId) -> Self {
        Self {
            backend,
            local,
            client_id,
            policy: FailurePolicy::default(),
            trash: Trash::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_trash(mut self, trash: Trash) -> Self {
        self.trash = trash;
        self
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    pub fn local(&self) -> &LocalTree {
        &self.local
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn trash(&self) -> &Trash {
        &self.trash
    }

    /// Execute `actions` in order.
    #[tracing::instrument(level = "debug", skip_all, fields(actions = actions.len()))]
    pub async fn execute(&self, actions: Vec<Action>) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let total = actions.len();
        for (index, action) in actions.into_iter().enumerate() {
            tracing::info!(action = %action, "executing");
            match action.execute(self).await {
                Ok(outcome) => {
                    tracing::debug!(action = %action, outcome = ?outcome, "action complete");
                    report.completed.push((action, outcome));
                },
                Err(e) => {
                    tracing::error!(action = %action, error = ?e, "action failed");
                    report.errors.push(e);
                    if self.policy == FailurePolicy::AbortOnFirst {
                        report.not_attempted = total - index - 1;
                        break;
                    }
                },
            }
        }
        report
    }
}

impl Action {
    /// Perform this action.
    pub async fn execute(&self, executor: &Executor) -> Result<Outcome> {
        let result = match self {
            Self::Upload { path, local, remote } => upload(executor, path, local, remote.as_ref()).await,
            Self::Download { path, remote, .. } => download(executor, path, remote).await,
            Self::DeleteLocal { path, .. } => delete_local(executor, path).await,
            Self::DeleteRemote { path, .. } => delete_remote(executor, path).await,
        };
        result.or_raise(|| ErrorKind::Action(self.to_string()))
    }
}

async fn upload(executor: &Executor, path: &Path, local: &LocalEntry, remote: Option<&RemoteEntry>) -> Result<Outcome> {
    if remote.is_some_and(|remote| remote.fingerprint == local.fingerprint) {
        return Ok(Outcome::Skipped(SkipReason::AlreadyInSync));
    }
    let content = executor.local.open(path).await.or_raise(|| ErrorKind::Storage)?;
    executor.backend.put(path, content, &executor.client_id).await.or_raise(|| ErrorKind::Storage)?;
    Ok(Outcome::Transferred(local.size))
}

async fn download(executor: &Executor, path: &Path, remote: &RemoteEntry) -> Result<Outcome> {
    // The local file may have changed since the scan.
    if let Some(current) = executor.local.stat(path).await.or_raise(|| ErrorKind::Storage)? {
        if current.fingerprint == remote.fingerprint {
            return Ok(Outcome::Skipped(SkipReason::AlreadyInSync));
        }
        if current.modified > remote.modified {
            tracing::warn!(path = %path.display(), "local file modified after the remote copy, not overwriting");
            return Ok(Outcome::Skipped(SkipReason::LocalNewer));
        }
    }
    let blob = executor.backend.get(path).await.or_raise(|| ErrorKind::Storage)?;
    let written = executor.local.write(path, blob.content).await.or_raise(|| ErrorKind::Storage)?;
    Ok(Outcome::Transferred(written))
}

async fn delete_local(executor: &Executor, path: &Path) -> Result<Outcome> {
    let result = match &executor.trash.local {
        Some(trash) => {
            let destination = trash_path(trash, path);
            executor.local.move_to(path, &destination).await.map(|()| Outcome::Trashed(destination))
        },
        None => executor.local.delete(path).await.map(|()| Outcome::Deleted),
    };
    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) if e.is_not_found() => {
            tracing::warn!(path = %path.display(), "local file already deleted");
            Ok(Outcome::Skipped(SkipReason::AlreadyGone))
        },
        Err(e) => Err(e).or_raise(|| ErrorKind::Storage),
    }
}

async fn delete_remote(executor: &Executor, path: &Path) -> Result<Outcome> {
    let Some(trash) = &executor.trash.remote else {
        executor.backend.delete(path).await.or_raise(|| ErrorKind::Storage)?;
        return Ok(Outcome::Deleted);
    };
    let blob = match executor.backend.get(path).await {
        Ok(blob) => blob,
        Err(e) if e.is_not_found() => return Ok(Outcome::Skipped(SkipReason::AlreadyGone)),
        Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
    };
    let destination = trash_path(trash, path);
    executor.backend.put(&destination, blob.content, &executor.client_id).await.or_raise(|| ErrorKind::Storage)?;
    executor.backend.delete(path).await.or_raise(|| ErrorKind::Storage)?;
    Ok(Outcome::Trashed(destination))
}
