use crate::diff::diff;
use crate::error::Result;
use crate::execute::{ExecutionReport, Executor};
use crate::reconcile::plan;
use crate::snapshot::Snapshot;
use derive_more::Display;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    #[display("idle")]
    Idle,
    #[display("running")]
    Running,
}

/// Drives repeated scan, diff, decide, execute cycles.
///
/// The syncer owns the baseline [`Snapshot`]. It is replaced after every
/// cycle that managed to list both replicas, whether or not every action
/// succeeded; a failed listing keeps the previous one.
pub struct Syncer {
    executor: Executor,
    snapshot: Snapshot,
    state: LoopState,
    interval: Duration,
    exclude_remote: Vec<PathBuf>,
    exclude_local: Vec<PathBuf>,
}

impl Syncer {
    pub fn new(executor: Executor, interval: Duration) -> Self {
        let exclude_local = executor.trash().local_exclude(executor.local().root()).into_iter().collect();
        let exclude_remote = executor.trash().remote_exclude().into_iter().collect();
        Self {
            executor,
            snapshot: Snapshot::empty(),
            state: LoopState::Idle,
            interval,
            exclude_remote,
            exclude_local,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The baseline the next cycle diffs against.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Run a single cycle.
    ///
    /// Listing failures are returned as errors. Action failures are not;
    /// they're in the returned report.
    #[tracing::instrument(name = "cycle", skip(self), fields(client = %self.executor.client_id()))]
    pub async fn run_once(&mut self) -> Result<ExecutionReport> {
        self.state = LoopState::Running;
        let result = self.cycle().await;
        self.state = LoopState::Idle;
        result
    }

    async fn cycle(&mut self) -> Result<ExecutionReport> {
        tracing::info!("starting sync cycle");
        let current = Snapshot::capture(
            self.executor.backend().as_ref(),
            self.executor.local(),
            &self.exclude_remote,
            &self.exclude_local,
        )
        .await?;
        tracing::info!(remote = current.remote.len(), local = current.local.len(), "listed replicas");
        let entries = diff(&current, &self.snapshot);
        let actions = plan(&entries, self.executor.client_id());
        tracing::info!(changed = entries.len(), actions = actions.len(), "reconciled");
        let report = self.executor.execute(actions).await;
        self.snapshot = current;
        report.log_summary();
        Ok(report)
    }

    /// Cycle forever, sleeping for the configured interval in between.
    pub async fn run(&mut self) {
        tracing::info!(interval = ?self.interval, "sync loop started");
        loop {
            match self.run_once().await {
                Ok(report) if !report.is_success() => {
                    tracing::warn!(failed = report.errors.len(), "cycle finished with failed actions");
                },
                Ok(_) => {},
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = ?e, "cycle aborted, keeping the previous snapshot");
                },
                Err(e) => tracing::error!(error = ?e, "cycle aborted, keeping the previous snapshot"),
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::execute::{FailurePolicy, Trash};
    use cloudsync_storage::backend::MockBackend;
    use cloudsync_storage::{ClientId, LocalTree};
    use std::path::Path;
    use std::sync::Arc;
    use time::OffsetDateTime;

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        root: PathBuf,
        backend: Arc<MockBackend>,
        syncer: Syncer,
    }

    fn fixture_with(backend: MockBackend, trash: impl FnOnce(&Path) -> Trash) -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().to_path_buf();
        let backend = Arc::new(backend);
        let executor = Executor::new(backend.clone(), LocalTree::new(&root).unwrap(), ClientId::new("me"))
            .with_policy(FailurePolicy::AbortOnFirst)
            .with_trash(trash(&root));
        Fixture {
            _temp_dir: temp_dir,
            root,
            backend,
            syncer: Syncer::new(executor, Duration::from_secs(30)),
        }
    }

    fn fixture(backend: MockBackend) -> Fixture {
        fixture_with(backend, |_| Trash::default())
    }

    fn rendered(report: &ExecutionReport) -> Vec<String> {
        report.completed.iter().map(|(action, _)| action.to_string()).collect()
    }

    impl Fixture {
        fn write(&self, path: &str, content: &str) {
            let absolute = self.root.join(path);
            std::fs::create_dir_all(absolute.parent().unwrap()).unwrap();
            std::fs::write(absolute, content).unwrap();
        }

        fn read(&self, path: &str) -> Option<String> {
            std::fs::read_to_string(self.root.join(path)).ok()
        }

        async fn converge(&mut self) {
            self.syncer.run_once().await.unwrap();
            let report = self.syncer.run_once().await.unwrap();
            assert!(report.completed.is_empty(), "expected convergence, got {:?}", rendered(&report));
        }
    }

    #[tokio::test]
    async fn test_bootstrap_then_converged() {
        let mut f = fixture(MockBackend::with_files([("remote.txt", Vec::from(*b"from remote"))]));
        f.write("local.txt", "from local");
        let report = f.syncer.run_once().await.unwrap();
        assert!(report.is_success());
        assert_eq!(rendered(&report), vec!["upload:local.txt", "download:remote.txt"]);
        assert_eq!(f.read("remote.txt").as_deref(), Some("from remote"));
        assert_eq!(f.backend.contents(Path::new("local.txt")).await.unwrap(), b"from local");
        assert_eq!(f.syncer.state(), LoopState::Idle);

        // Nothing changed since: no more work.
        let report = f.syncer.run_once().await.unwrap();
        assert!(report.completed.is_empty());
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_own_upload_deleted_locally_is_not_resurrected() {
        let mut f = fixture(MockBackend::default());
        f.write("a.txt", "mine");
        // Upload happens, but the snapshot it's recorded in predates it.
        f.syncer.run_once().await.unwrap();
        std::fs::remove_file(f.root.join("a.txt")).unwrap();
        let report = f.syncer.run_once().await.unwrap();
        assert_eq!(rendered(&report), vec!["delete-remote:a.txt"]);
        assert!(f.backend.contents(Path::new("a.txt")).await.is_none());
        assert!(f.read("a.txt").is_none());
    }

    #[tokio::test]
    async fn test_pure_remote_deletion() {
        let mut f = fixture(MockBackend::with_files([("a.txt", Vec::from(*b"shared"))]));
        f.converge().await;
        assert!(f.backend.remove("a.txt").await);
        let report = f.syncer.run_once().await.unwrap();
        assert_eq!(rendered(&report), vec!["delete-local:a.txt"]);
        assert!(f.read("a.txt").is_none());
    }

    #[tokio::test]
    async fn test_remote_edit_by_other_client_downloads() {
        let mut f = fixture(MockBackend::with_files([("a.txt", Vec::from(*b"v1"))]));
        f.converge().await;
        let later = OffsetDateTime::now_utc() + time::Duration::hours(1);
        f.backend.insert("a.txt", "v2", later, Some(ClientId::new("other"))).await;
        let report = f.syncer.run_once().await.unwrap();
        assert_eq!(rendered(&report), vec!["download:a.txt"]);
        assert_eq!(f.read("a.txt").as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_restart_degrades_to_merge() {
        let mut f = fixture(MockBackend::default());
        f.write("c.txt", "local copy");
        let later = OffsetDateTime::now_utc() + time::Duration::hours(1);
        f.backend.insert("c.txt", "remote copy", later, None).await;
        let report = f.syncer.run_once().await.unwrap();
        assert_eq!(rendered(&report), vec!["download:c.txt"]);
        assert_eq!(f.read("c.txt").as_deref(), Some("remote copy"));
    }

    #[tokio::test]
    async fn test_restart_downloads_remote_only_file() {
        let mut f = fixture(MockBackend::with_files([("c.txt", Vec::from(*b"remote copy"))]));
        let report = f.syncer.run_once().await.unwrap();
        assert_eq!(rendered(&report), vec!["download:c.txt"]);
        assert_eq!(f.read("c.txt").as_deref(), Some("remote copy"));
    }

    #[tokio::test]
    async fn test_listing_failure_keeps_snapshot() {
        let mut f = fixture(MockBackend::with_files([("a.txt", Vec::from(*b"x"))]));
        f.converge().await;
        let before = f.syncer.snapshot().clone();
        f.backend.fail_listing(true).await;
        let err = f.syncer.run_once().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ListRemote));
        assert_eq!(f.syncer.snapshot(), &before);
        assert_eq!(f.syncer.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_failed_actions_still_replace_snapshot() {
        let mut f = fixture(MockBackend::default());
        f.write("a.txt", "a");
        f.write("b.txt", "b");
        f.backend.fail_on("a.txt").await;
        let report = f.syncer.run_once().await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.not_attempted, 1);
        let recorded: Vec<_> = f.syncer.snapshot().local.keys().cloned().collect();
        assert_eq!(recorded, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
    }

    #[tokio::test]
    async fn test_trash_is_not_synced() {
        let mut f = fixture_with(MockBackend::default(), |root| Trash {
            local: Some(root.join(".trash")),
            remote: Some(PathBuf::from(".trash")),
        });
        f.backend.insert("gone-remotely.txt", "r", OffsetDateTime::now_utc(), None).await;
        f.write("gone-locally.txt", "l");
        f.converge().await;

        assert!(f.backend.remove("gone-remotely.txt").await);
        std::fs::remove_file(f.root.join("gone-locally.txt")).unwrap();
        let report = f.syncer.run_once().await.unwrap();
        assert_eq!(report.trashed(), 2);
        assert!(f.root.join(".trash").is_dir());

        // Both trashes now hold a file; neither is picked up as new content.
        let report = f.syncer.run_once().await.unwrap();
        assert!(report.completed.is_empty(), "{:?}", rendered(&report));
    }
}
