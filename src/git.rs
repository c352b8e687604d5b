// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Git working copy as a [`RepositorySource`].
//!
//! Reads `HEAD` directly instead of shelling out to `git`, and learns about
//! status changes from a filesystem watch on the git directory.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::client::repository::RepositorySource;
use crate::disposable::Subscription;

/// Length of the abbreviated hash reported for a detached `HEAD`.
const SHORT_HASH_LEN: usize = 7;

/// Finds the git directory for `start` or its nearest ancestor.
///
/// Handles both `.git` directories and the `.git` files used by worktrees
/// and submodules (`gitdir: <path>`).
#[must_use]
pub fn find_git_dir(start: &Path) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        let candidate = dir.join(".git");
        if candidate.is_dir() {
            return Some(candidate);
        }
        if candidate.is_file() {
            let content = std::fs::read_to_string(&candidate).ok()?;
            let target = content.trim().strip_prefix("gitdir:")?.trim();
            let target = Path::new(target);
            return Some(if target.is_absolute() {
                target.to_path_buf()
            } else {
                dir.join(target)
            });
        }
        None
    })
}

/// Extracts the branch from the contents of a `HEAD` file.
///
/// `ref: refs/heads/main` yields `main`; a detached `HEAD` yields the short
/// hash.
#[must_use]
pub fn parse_head(content: &str) -> Option<String> {
    let content = content.trim();
    if let Some(reference) = content.strip_prefix("ref:") {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        return Some(
            reference
                .strip_prefix("refs/heads/")
                .unwrap_or(reference)
                .to_string(),
        );
    }

    if content.len() >= SHORT_HASH_LEN && content.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(content[..SHORT_HASH_LEN].to_string());
    }
    None
}

/// Reads the current branch of the repository at `git_dir`.
#[must_use]
pub fn read_branch(git_dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(git_dir.join("HEAD")).ok()?;
    parse_head(&content)
}

/// Files whose changes can move the checked-out branch or the working copy
/// status.
const WATCHED_FILES: [&str; 2] = ["HEAD", "index"];

fn is_status_event(event: &Event) -> bool {
    !matches!(event.kind, EventKind::Access(_))
        && event.paths.iter().any(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| WATCHED_FILES.contains(&name))
        })
}

/// A git working copy that publishes status changes.
#[derive(Debug)]
pub struct GitRepository {
    git_dir: PathBuf,
    changes: broadcast::Sender<()>,
}

impl GitRepository {
    /// Repository whose git directory is `git_dir`.
    pub fn open(git_dir: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            git_dir: git_dir.into(),
            changes,
        }
    }

    /// Repository containing `start`, if any.
    #[must_use]
    pub fn discover(start: &Path) -> Option<Self> {
        let git_dir = find_git_dir(start)?;
        debug!("Found git directory {}", git_dir.display());
        Some(Self::open(git_dir))
    }

    /// The git directory.
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Watches the git directory and notifies subscribers whenever `HEAD` or
    /// the index is written. Notifications stop when the returned watch is
    /// released or dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform watcher cannot be created or the git
    /// directory cannot be watched.
    pub fn watch(&self) -> notify::Result<RepositoryWatch> {
        let changes = self.changes.clone();
        let git_dir = self.git_dir.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) if is_status_event(&event) => {
                    trace!("Repository status changed: {}", git_dir.display());
                    let _ = changes.send(());
                }
                Ok(_) => {}
                Err(e) => warn!("Repository watcher error: {}", e),
            }
        })?;
        watcher.watch(&self.git_dir, RecursiveMode::NonRecursive)?;
        debug!("Watching {}", self.git_dir.display());

        Ok(RepositoryWatch {
            watcher: Mutex::new(Some(watcher)),
        })
    }
}

/// A live filesystem watch on a git directory.
pub struct RepositoryWatch {
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Subscription for RepositoryWatch {
    fn unsubscribe(&mut self) {
        let watcher = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(watcher);
    }

    fn is_active(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl RepositorySource for GitRepository {
    fn status_changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    fn branch(&self) -> Option<String> {
        read_branch(&self.git_dir)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn init(dir: &Path, head: &str) -> PathBuf {
        let git_dir = dir.join(".git");
        std::fs::create_dir_all(&git_dir).unwrap();
        std::fs::write(git_dir.join("HEAD"), head).unwrap();
        git_dir
    }

    #[test]
    fn test_parse_head_branch() {
        assert_eq!(parse_head("ref: refs/heads/main\n").as_deref(), Some("main"));
        assert_eq!(
            parse_head("ref: refs/heads/feature/login").as_deref(),
            Some("feature/login")
        );
        assert_eq!(
            parse_head("ref: refs/remotes/origin/x").as_deref(),
            Some("refs/remotes/origin/x")
        );
    }

    #[test]
    fn test_parse_head_detached_and_garbage() {
        assert_eq!(
            parse_head("0123456789abcdef0123456789abcdef01234567").as_deref(),
            Some("0123456")
        );
        assert_eq!(parse_head("ref:"), None);
        assert_eq!(parse_head("not a head"), None);
        assert_eq!(parse_head(""), None);
    }

    #[test]
    fn test_find_git_dir_from_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let git_dir = init(dir.path(), "ref: refs/heads/main\n");
        let nested = dir.path().join("src").join("App");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_git_dir(&nested), Some(git_dir.clone()));
        assert_eq!(read_branch(&git_dir).as_deref(), Some("main"));
    }

    #[test]
    fn test_find_git_dir_follows_gitdir_file() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("store");
        std::fs::create_dir_all(&real).unwrap();
        std::fs::write(real.join("HEAD"), "ref: refs/heads/wt\n").unwrap();

        let worktree = dir.path().join("worktree");
        std::fs::create_dir_all(&worktree).unwrap();
        std::fs::write(worktree.join(".git"), "gitdir: ../store\n").unwrap();

        let found = find_git_dir(&worktree).unwrap();
        assert_eq!(read_branch(&found).as_deref(), Some("wt"));
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_status_events_are_head_and_index_writes() {
        use notify::event::{AccessKind, CreateKind, ModifyKind};

        let modify = EventKind::Modify(ModifyKind::Any);
        assert!(is_status_event(&event(modify, "/r/.git/HEAD")));
        assert!(is_status_event(&event(modify, "/r/.git/index")));
        assert!(is_status_event(&event(
            EventKind::Create(CreateKind::File),
            "/r/.git/HEAD"
        )));

        assert!(!is_status_event(&event(modify, "/r/.git/index.lock")));
        assert!(!is_status_event(&event(modify, "/r/.git/FETCH_HEAD")));
        assert!(!is_status_event(&event(
            EventKind::Access(AccessKind::Any),
            "/r/.git/HEAD"
        )));
    }

    #[tokio::test]
    async fn test_watch_reports_branch_switch() {
        let dir = tempfile::tempdir().unwrap();
        let git_dir = init(dir.path(), "ref: refs/heads/main\n");
        let repository = GitRepository::open(&git_dir);
        let mut changes = repository.status_changes();

        let mut watch = repository.watch().unwrap();
        assert!(watch.is_active());
        std::fs::write(git_dir.join("HEAD"), "ref: refs/heads/feature\n").unwrap();

        let notified = tokio::time::timeout(Duration::from_secs(5), changes.recv()).await;
        assert!(matches!(notified, Ok(Ok(()))));
        assert_eq!(repository.branch().as_deref(), Some("feature"));

        watch.unsubscribe();
        assert!(!watch.is_active());
    }

    #[test]
    fn test_watch_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let repository = GitRepository::open(dir.path().join("absent"));
        assert!(repository.watch().is_err());
    }
}
