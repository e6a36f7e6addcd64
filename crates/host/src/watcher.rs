//! Filesystem watches on open repositories.
//!
//! Each watched repository directory gets one recursive watcher. Events are
//! pushed onto the dispatch loop as `HostCommand::RepoFileChanged`, which fans
//! them out to every window bound to that path. A watch lives until every
//! window that asked for it has closed.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use pocketrag_protocol::SessionId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control_plane::HostCommand;

struct RepoWatch {
    _watcher: RecommendedWatcher,
    owners: BTreeSet<SessionId>,
}

pub struct RepoWatchers {
    watchers: HashMap<PathBuf, RepoWatch>,
    commands: mpsc::Sender<HostCommand>,
}

impl RepoWatchers {
    pub fn new(commands: mpsc::Sender<HostCommand>) -> Self {
        Self {
            watchers: HashMap::new(),
            commands,
        }
    }

    /// Watch `repo_path` recursively on behalf of `owner`, replacing any existing
    /// watch on it. Owners of the replaced watch are kept.
    pub fn watch(&mut self, owner: SessionId, repo_path: &Path) -> notify::Result<()> {
        let commands = self.commands.clone();
        let watched = repo_path.to_path_buf();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !matches_supported_event_kind(&event.kind) {
                        return;
                    }
                    let cmd = HostCommand::RepoFileChanged {
                        repo_path: watched.clone(),
                    };
                    if commands.try_send(cmd).is_err() {
                        debug!(
                            component = "watcher",
                            event = "watcher.event.dropped",
                            path = %watched.display(),
                            "Command channel full or closed, dropping file event"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        component = "watcher",
                        event = "watcher.fs_event_error",
                        error = %err,
                        "Repository watcher event error"
                    );
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(repo_path, RecursiveMode::Recursive)?;

        let mut owners = self
            .watchers
            .remove(repo_path)
            .map(|previous| previous.owners)
            .unwrap_or_default();
        owners.insert(owner);
        info!(
            component = "watcher",
            event = "watcher.started",
            path = %repo_path.display(),
            owner,
            "Watching repository directory"
        );
        self.watchers.insert(
            repo_path.to_path_buf(),
            RepoWatch {
                _watcher: watcher,
                owners,
            },
        );
        Ok(())
    }

    /// Forget `owner`. Watches no other window asked for are stopped; returns how many.
    pub fn release(&mut self, owner: SessionId) -> usize {
        let before = self.watchers.len();
        self.watchers.retain(|path, watch| {
            watch.owners.remove(&owner);
            let keep = !watch.owners.is_empty();
            if !keep {
                info!(
                    component = "watcher",
                    event = "watcher.stopped",
                    path = %path.display(),
                    owner,
                    "Stopped watching repository directory"
                );
            }
            keep
        });
        before - self.watchers.len()
    }

    /// Stop watching `repo_path`. Returns `false` if it was not watched.
    pub fn unwatch(&mut self, repo_path: &Path) -> bool {
        let removed = self.watchers.remove(repo_path).is_some();
        if removed {
            info!(
                component = "watcher",
                event = "watcher.stopped",
                path = %repo_path.display(),
                "Stopped watching repository directory"
            );
        }
        removed
    }

    pub fn is_watching(&self, repo_path: &Path) -> bool {
        self.watchers.contains_key(repo_path)
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn clear(&mut self) {
        self.watchers.clear();
    }
}

fn matches_supported_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn file_changes_reach_the_command_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let mut watchers = RepoWatchers::new(tx);

        watchers.watch(1, dir.path()).unwrap();
        assert!(watchers.is_watching(dir.path()));
        std::fs::write(dir.path().join("notes.md"), "hello").unwrap();

        let cmd = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no file event")
            .unwrap();
        match cmd {
            HostCommand::RepoFileChanged { repo_path } => assert_eq!(repo_path, dir.path()),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rewatch_replaces_and_unwatch_removes() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let mut watchers = RepoWatchers::new(tx);

        watchers.watch(1, dir.path()).unwrap();
        watchers.watch(2, dir.path()).unwrap();
        assert_eq!(watchers.len(), 1);

        assert!(watchers.unwatch(dir.path()));
        assert!(!watchers.unwatch(dir.path()));
        assert!(!watchers.is_watching(dir.path()));
    }

    #[tokio::test]
    async fn release_stops_watches_only_when_no_owner_is_left() {
        let shared = tempfile::tempdir().unwrap();
        let private = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let mut watchers = RepoWatchers::new(tx);

        watchers.watch(1, shared.path()).unwrap();
        watchers.watch(2, shared.path()).unwrap();
        watchers.watch(1, private.path()).unwrap();

        assert_eq!(watchers.release(1), 1);
        assert!(watchers.is_watching(shared.path()));
        assert!(!watchers.is_watching(private.path()));

        assert_eq!(watchers.release(2), 1);
        assert_eq!(watchers.release(2), 0);
        assert_eq!(watchers.len(), 0);
    }

    #[test]
    fn missing_directory_fails_to_watch() {
        let (tx, _rx) = mpsc::channel(1);
        let mut watchers = RepoWatchers::new(tx);
        assert!(watchers.watch(1, Path::new("/nonexistent/pocketrag/repo")).is_err());
        assert_eq!(watchers.len(), 0);
    }
}
