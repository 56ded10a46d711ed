//! Change detection between two snapshots.
//!
//! Each replica is compared against its own previous listing, independently
//! of the other replica. Only fingerprints matter here; timestamps are left
//! for the reconciler to break ties with.

use crate::snapshot::Snapshot;
use cloudsync_storage::{Fingerprint, LocalEntry, RemoteEntry};
use derive_more::Display;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// How a path changed on one replica since the previous snapshot.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    #[display("none")]
    None,
    /// Added, or its fingerprint differs.
    #[display("updated")]
    Updated,
    #[display("removed")]
    Removed,
}

/// One replica's view of a path: the classification plus the current entry
/// when the path still exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Side<T> {
    /// Not present in either snapshot.
    Absent,
    Unchanged(T),
    Updated(T),
    Removed,
}
impl<T> Side<T> {
    pub fn change(&self) -> Change {
        match self {
            Self::Absent | Self::Unchanged(_) => Change::None,
            Self::Updated(_) => Change::Updated,
            Self::Removed => Change::Removed,
        }
    }

    /// The entry in the new snapshot, if the path exists there.
    pub fn entry(&self) -> Option<&T> {
        match self {
            Self::Unchanged(entry) | Self::Updated(entry) => Some(entry),
            Self::Absent | Self::Removed => None,
        }
    }
}

/// Everything known about one path that changed on at least one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: PathBuf,
    pub local: Side<LocalEntry>,
    pub remote: Side<RemoteEntry>,
}

trait Fingerprinted: Clone {
    fn fingerprint(&self) -> &Fingerprint;
}
impl Fingerprinted for LocalEntry {
    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}
impl Fingerprinted for RemoteEntry {
    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

/// Classify every path of one replica.
fn classify<T: Fingerprinted>(
    current: &BTreeMap<PathBuf, T>,
    prior: &BTreeMap<PathBuf, T>,
) -> BTreeMap<PathBuf, Side<T>> {
    let mut sides = BTreeMap::new();
    for (path, entry) in current {
        let side = match prior.get(path) {
            Some(before) if before.fingerprint() == entry.fingerprint() => Side::Unchanged(entry.clone()),
            // Either new, or never matched against the prior listing.
            _ => Side::Updated(entry.clone()),
        };
        sides.insert(path.clone(), side);
    }
    for path in prior.keys() {
        if !current.contains_key(path) {
            sides.insert(path.clone(), Side::Removed);
        }
    }
    sides
}

/// Compare `current` against `prior`, returning one entry per path that
/// changed on at least one side, ordered by path.
///
/// An empty `prior` (first cycle, or after a restart) makes every current
/// path `Updated`, which turns the following reconciliation into a two-way
/// merge.
pub fn diff(current: &Snapshot, prior: &Snapshot) -> BTreeMap<PathBuf, DiffEntry> {
    let mut local = classify(&current.local, &prior.local);
    let mut remote = classify(&current.remote, &prior.remote);
    let paths: BTreeSet<PathBuf> = local.keys().chain(remote.keys()).cloned().collect();
    let mut entries = BTreeMap::new();
    for path in paths {
        let local = local.remove(&path).unwrap_or(Side::Absent);
        let remote = remote.remove(&path).unwrap_or(Side::Absent);
        if local.change() == Change::None && remote.change() == Change::None {
            continue;
        }
        entries.insert(path.clone(), DiffEntry { path, local, remote });
    }
    entries
}
