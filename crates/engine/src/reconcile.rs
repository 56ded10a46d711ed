//! The per-path decision table.
//!
//! [`decide`] turns one [`DiffEntry`] into at most one [`Action`]. Rules are
//! checked in order and the first match wins:
//!
//! | # | Local     | Remote                         | Action         |
//! |---|-----------|--------------------------------|----------------|
//! | 1 | removed   | removed                        | none           |
//! | 2 | updated   | removed                        | upload         |
//! | 3 | unchanged | removed                        | delete local   |
//! | 4 | absent    | removed                        | none           |
//! | 5 | removed   | updated, written by this client| delete remote  |
//! | 6 | removed   | updated, anyone else           | download       |
//! | 7 | removed   | unchanged                      | delete remote  |
//! | 8 | present   | absent (or the other way round)| copy across    |
//! | 9 | present   | present, same fingerprint      | none           |
//! |10 | present   | present, local strictly newer  | upload         |
//! |11 | present   | present, otherwise             | download       |
//!
//! Rules 5 and 6 stop a machine from resurrecting a file it uploaded and
//! then deleted. Rule 6 also means a file deleted locally on one machine
//! while another machine rewrote it comes back; the rewrite wins.

use crate::diff::{DiffEntry, Side};
use cloudsync_storage::{ClientId, LocalEntry, RemoteEntry};
use derive_more::Display;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A single replica operation, carrying the entries it was decided from.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum Action {
    /// Copy the local file to the remote replica.
    #[display("upload:{}", path.display())]
    Upload {
        path: PathBuf,
        local: LocalEntry,
        /// The remote entry being overwritten, if any.
        remote: Option<RemoteEntry>,
    },
    /// Copy the remote object to the local replica.
    #[display("download:{}", path.display())]
    Download {
        path: PathBuf,
        remote: RemoteEntry,
        /// The local file being overwritten, if any.
        local: Option<LocalEntry>,
    },
    #[display("delete-local:{}", path.display())]
    DeleteLocal { path: PathBuf, local: LocalEntry },
    #[display("delete-remote:{}", path.display())]
    DeleteRemote { path: PathBuf, remote: RemoteEntry },
}
impl Action {
    pub fn path(&self) -> &Path {
        match self {
            Self::Upload { path, .. }
            | Self::Download { path, .. }
            | Self::DeleteLocal { path, .. }
            | Self::DeleteRemote { path, .. } => path,
        }
    }
}

/// Decide what, if anything, to do about one changed path.
pub fn decide(entry: &DiffEntry, client: &ClientId) -> Option<Action> {
    let path = entry.path.clone();
    match (&entry.local, &entry.remote) {
        // 1
        (Side::Removed, Side::Removed) => None,
        // 2
        (Side::Updated(local), Side::Removed) => Some(Action::Upload {
            path,
            local: local.clone(),
            remote: None,
        }),
        // 3
        (Side::Unchanged(local), Side::Removed) => Some(Action::DeleteLocal {
            path,
            local: local.clone(),
        }),
        // 4
        (Side::Absent, Side::Removed) => None,
        // 5, 6
        (Side::Removed, Side::Updated(remote)) => match remote.written_by(client) {
            true => Some(Action::DeleteRemote {
                path,
                remote: remote.clone(),
            }),
            false => Some(Action::Download {
                path,
                remote: remote.clone(),
                local: None,
            }),
        },
        // 7
        (Side::Removed, Side::Unchanged(remote)) => Some(Action::DeleteRemote {
            path,
            remote: remote.clone(),
        }),
        (Side::Removed, Side::Absent) => None,
        // 8
        (Side::Updated(local) | Side::Unchanged(local), Side::Absent) => Some(Action::Upload {
            path,
            local: local.clone(),
            remote: None,
        }),
        (Side::Absent, Side::Updated(remote) | Side::Unchanged(remote)) => Some(Action::Download {
            path,
            remote: remote.clone(),
            local: None,
        }),
        (Side::Absent, Side::Absent) => None,
        // 9, 10, 11
        (Side::Updated(local) | Side::Unchanged(local), Side::Updated(remote) | Side::Unchanged(remote)) => {
            if local.fingerprint == remote.fingerprint {
                None
            } else if local.modified > remote.modified {
                Some(Action::Upload {
                    path,
                    local: local.clone(),
                    remote: Some(remote.clone()),
                })
            } else {
                Some(Action::Download {
                    path,
                    remote: remote.clone(),
                    local: Some(local.clone()),
                })
            }
        },
    }
}

/// Decide every entry, in path order.
pub fn plan(entries: &BTreeMap<PathBuf, DiffEntry>, client: &ClientId) -> Vec<Action> {
    let actions: Vec<Action> = entries.values().filter_map(|entry| decide(entry, client)).collect();
    tracing::debug!(changed = entries.len(), actions = actions.len(), "planned actions");
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{Change, diff};
    use crate::diff::tests::{local, remote};
    use crate::snapshot::Snapshot;
    use rstest::rstest;
    use time::OffsetDateTime;
    use time::macros::datetime;

    const EARLY: OffsetDateTime = datetime!(2024-01-01 10:00 UTC);
    const LATE: OffsetDateTime = datetime!(2024-01-01 11:00 UTC);

    fn me() -> ClientId {
        ClientId::new("me")
    }

    fn at<T>(mut entry: T, set: impl FnOnce(&mut T)) -> T {
        set(&mut entry);
        entry
    }

    fn local_at(path: &str, content: &str, modified: OffsetDateTime) -> LocalEntry {
        at(local(path, content), |e| e.modified = modified)
    }

    fn remote_at(path: &str, content: &str, modified: OffsetDateTime) -> RemoteEntry {
        at(remote(path, content), |e| e.modified = modified)
    }

    fn entry(local: Side<LocalEntry>, remote: Side<RemoteEntry>) -> DiffEntry {
        DiffEntry {
            path: PathBuf::from("a.txt"),
            local,
            remote,
        }
    }

    fn kind(action: &Option<Action>) -> &'static str {
        match action {
            None => "none",
            Some(Action::Upload { .. }) => "upload",
            Some(Action::Download { .. }) => "download",
            Some(Action::DeleteLocal { .. }) => "delete-local",
            Some(Action::DeleteRemote { .. }) => "delete-remote",
        }
    }

    #[rstest]
    #[case::rule_1(Side::Removed, Side::Removed, "none")]
    #[case::rule_2(Side::Updated(local("a.txt", "new")), Side::Removed, "upload")]
    #[case::rule_3(Side::Unchanged(local("a.txt", "x")), Side::Removed, "delete-local")]
    #[case::rule_4(Side::Absent, Side::Removed, "none")]
    #[case::rule_7(Side::Removed, Side::Unchanged(remote("a.txt", "x")), "delete-remote")]
    #[case::removed_locally_never_remote(Side::Removed, Side::Absent, "none")]
    #[case::rule_8_local_only(Side::Updated(local("a.txt", "x")), Side::Absent, "upload")]
    #[case::rule_8_remote_only(Side::Absent, Side::Updated(remote("a.txt", "x")), "download")]
    #[case::rule_9(Side::Updated(local("a.txt", "x")), Side::Updated(remote("a.txt", "x")), "none")]
    #[case::rule_9_unchanged_local(Side::Unchanged(local("a.txt", "x")), Side::Updated(remote("a.txt", "x")), "none")]
    #[case::rule_9_local_newer(
        Side::Updated(local_at("a.txt", "x", LATE)),
        Side::Updated(remote_at("a.txt", "x", EARLY)),
        "none"
    )]
    #[case::rule_9_remote_newer(
        Side::Updated(local_at("a.txt", "x", EARLY)),
        Side::Updated(remote_at("a.txt", "x", LATE)),
        "none"
    )]
    #[case::rule_10(
        Side::Updated(local_at("a.txt", "mine", LATE)),
        Side::Updated(remote_at("a.txt", "theirs", EARLY)),
        "upload"
    )]
    #[case::rule_11(
        Side::Updated(local_at("a.txt", "mine", EARLY)),
        Side::Updated(remote_at("a.txt", "theirs", LATE)),
        "download"
    )]
    #[case::tie_goes_to_remote(
        Side::Updated(local_at("a.txt", "mine", EARLY)),
        Side::Updated(remote_at("a.txt", "theirs", EARLY)),
        "download"
    )]
    #[case::remote_edit_of_unchanged_local(
        Side::Unchanged(local_at("a.txt", "old", LATE)),
        Side::Updated(remote_at("a.txt", "new", EARLY)),
        "upload"
    )]
    fn test_decision_table(
        #[case] local: Side<LocalEntry>,
        #[case] remote: Side<RemoteEntry>,
        #[case] expected: &str,
    ) {
        assert_eq!(kind(&decide(&entry(local, remote), &me())), expected);
    }

    #[test]
    fn test_own_upload_deleted_locally_is_deleted_remotely() {
        let mine = remote("a.txt", "x").with_writer(Some(me()));
        let action = decide(&entry(Side::Removed, Side::Updated(mine.clone())), &me());
        assert_eq!(
            action,
            Some(Action::DeleteRemote {
                path: PathBuf::from("a.txt"),
                remote: mine
            })
        );
    }

    #[rstest]
    #[case::other_writer(Some(ClientId::new("someone-else")))]
    #[case::untagged(None)]
    fn test_foreign_update_wins_over_local_delete(#[case] writer: Option<ClientId>) {
        // A local delete racing another machine's rewrite brings the file back.
        let theirs = remote("a.txt", "x").with_writer(writer);
        let action = decide(&entry(Side::Removed, Side::Updated(theirs)), &me());
        assert_eq!(kind(&action), "download");
    }

    #[test]
    fn test_display() {
        let action = decide(&entry(Side::Updated(local("a.txt", "x")), Side::Absent), &me()).unwrap();
        assert_eq!(action.to_string(), "upload:a.txt");
        assert_eq!(action.path(), Path::new("a.txt"));
    }

    #[test]
    fn test_converged_replicas_plan_nothing() {
        let snapshot = Snapshot::new(
            [remote("a.txt", "1"), remote("b/c.txt", "2")],
            [local("a.txt", "1"), local("b/c.txt", "2")],
        );
        assert!(plan(&diff(&snapshot, &snapshot), &me()).is_empty());
    }

    #[test]
    fn test_bootstrap_merge() {
        let current = Snapshot::new(
            [remote("remote-only.txt", "r"), remote("both.txt", "same")],
            [local("local-only.txt", "l"), local("both.txt", "same")],
        );
        let actions = plan(&diff(&current, &Snapshot::empty()), &me());
        let rendered: Vec<String> = actions.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["upload:local-only.txt", "download:remote-only.txt"]);
    }

    #[rstest]
    #[case::local_newer(LATE, EARLY)]
    #[case::remote_newer(EARLY, LATE)]
    fn test_bootstrap_equal_content_ignores_timestamps(
        #[case] local_modified: OffsetDateTime,
        #[case] remote_modified: OffsetDateTime,
    ) {
        let current = Snapshot::new(
            [remote_at("both.txt", "same", remote_modified)],
            [local_at("both.txt", "same", local_modified)],
        );
        assert!(plan(&diff(&current, &Snapshot::empty()), &me()).is_empty());
    }

    #[test]
    fn test_pure_remote_deletion() {
        let prior = Snapshot::new([remote("a.txt", "x")], [local("a.txt", "x")]);
        let current = Snapshot::new([], [local("a.txt", "x")]);
        let actions = plan(&diff(&current, &prior), &me());
        assert_eq!(
            actions,
            vec![Action::DeleteLocal {
                path: PathBuf::from("a.txt"),
                local: local("a.txt", "x")
            }]
        );
    }

    #[test]
    fn test_concurrent_edit_local_newer() {
        let prior = Snapshot::new([remote_at("b.txt", "v1", EARLY)], [local_at("b.txt", "v1", EARLY)]);
        let current = Snapshot::new([remote_at("b.txt", "v2-remote", EARLY)], [local_at("b.txt", "v2-local", LATE)]);
        let entries = diff(&current, &prior);
        let entry = &entries[Path::new("b.txt")];
        assert_eq!((entry.local.change(), entry.remote.change()), (Change::Updated, Change::Updated));
        let actions = plan(&entries, &me());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].to_string(), "upload:b.txt");
    }

    #[test]
    fn test_restart_degrades_to_merge() {
        let current = Snapshot::new([remote_at("c.txt", "remote", LATE)], [local_at("c.txt", "local", EARLY)]);
        let actions = plan(&diff(&current, &Snapshot::empty()), &me());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].to_string(), "download:c.txt");
    }

    #[test]
    fn test_restart_downloads_remote_only() {
        let current = Snapshot::new([remote("c.txt", "remote")], []);
        let actions = plan(&diff(&current, &Snapshot::empty()), &me());
        assert_eq!(
            actions,
            vec![Action::Download {
                path: PathBuf::from("c.txt"),
                remote: remote("c.txt", "remote"),
                local: None,
            }]
        );
    }

    #[test]
    fn test_at_most_one_action_per_path() {
        let prior = Snapshot::new(
            [remote("a", "1"), remote("b", "1"), remote("c", "1"), remote("d", "1")],
            [local("a", "1"), local("b", "1"), local("c", "1"), local("e", "1")],
        );
        let current = Snapshot::new(
            [remote("a", "2"), remote("c", "1"), remote("f", "1")],
            [local("a", "3"), local("b", "1"), local("d", "1"), local("e", "2")],
        );
        let entries = diff(&current, &prior);
        let actions = plan(&entries, &me());
        let mut paths: Vec<&Path> = actions.iter().map(Action::path).collect();
        let total = paths.len();
        paths.dedup();
        assert_eq!(paths.len(), total);
        assert!(total <= entries.len());
    }
}
