// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Restarts the server when the checked-out branch changes.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::editor::EditorEnvironment;

/// Editor command that restarts the analysis server.
pub const RESTART_COMMAND: &str = "omnisharp-atom:restart-server";

/// A version-control working copy.
pub trait RepositorySource: Send + Sync {
    /// Fires whenever the working copy's status may have changed.
    fn status_changes(&self) -> broadcast::Receiver<()>;

    /// Currently checked-out branch, if it can be read.
    fn branch(&self) -> Option<String>;
}

/// Remembers the last branch seen and reports genuine changes only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchTracker {
    last_seen: Option<String>,
}

impl BranchTracker {
    /// A tracker that has seen nothing; the first branch counts as a change.
    #[must_use]
    pub const fn new() -> Self {
        Self { last_seen: None }
    }

    /// A tracker that already considers `branch` current.
    #[must_use]
    pub const fn starting_at(branch: Option<String>) -> Self {
        Self { last_seen: branch }
    }

    /// Records `branch`. Returns true when it differs from the previous one.
    pub fn observe(&mut self, branch: &str) -> bool {
        if self.last_seen.as_deref() == Some(branch) {
            return false;
        }
        self.last_seen = Some(branch.to_string());
        true
    }

    /// The last branch recorded.
    #[must_use]
    pub fn last_seen(&self) -> Option<&str> {
        self.last_seen.as_deref()
    }
}

/// Dispatches [`RESTART_COMMAND`] through `environment` once per branch
/// change reported by `repository`.
///
/// The branch checked out when this is called is the baseline; status
/// changes that leave it in place dispatch nothing. The subscription is
/// taken before the task starts, so notifications sent right after this call
/// are not missed. The task ends when the repository stops publishing.
pub fn watch_repository(
    repository: Arc<dyn RepositorySource>,
    environment: Arc<dyn EditorEnvironment>,
) -> JoinHandle<()> {
    let mut changes = repository.status_changes();
    let mut tracker = BranchTracker::starting_at(repository.branch());

    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                // Missed notifications collapse into one re-read.
                Ok(()) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }

            let Some(branch) = repository.branch() else {
                debug!("Repository status changed with no readable branch");
                continue;
            };

            if tracker.observe(&branch) {
                info!("Branch changed to {}, restarting analysis server", branch);
                environment.dispatch(RESTART_COMMAND);
            }
        }
        debug!("Repository watch finished");
    })
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use crate::editor::Document;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct FakeRepository {
        sender: Mutex<Option<broadcast::Sender<()>>>,
        branch: Mutex<Option<String>>,
    }

    impl FakeRepository {
        fn on(branch: Option<&str>) -> Arc<Self> {
            let (sender, _) = broadcast::channel(16);
            Arc::new(Self {
                sender: Mutex::new(Some(sender)),
                branch: Mutex::new(branch.map(str::to_string)),
            })
        }

        fn notify(&self, branch: Option<&str>) {
            *self.branch.lock().unwrap() = branch.map(str::to_string);
            if let Some(sender) = self.sender.lock().unwrap().as_ref() {
                sender.send(()).unwrap();
            }
        }

        fn close(&self) {
            self.sender.lock().unwrap().take();
        }
    }

    impl RepositorySource for FakeRepository {
        fn status_changes(&self) -> broadcast::Receiver<()> {
            self.sender.lock().unwrap().as_ref().unwrap().subscribe()
        }

        fn branch(&self) -> Option<String> {
            self.branch.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct RecordingEnvironment {
        dispatched: Mutex<Vec<String>>,
    }

    impl EditorEnvironment for RecordingEnvironment {
        fn active_document(&self) -> Option<Arc<dyn Document>> {
            None
        }

        fn project_paths(&self) -> Vec<PathBuf> {
            Vec::new()
        }

        fn dispatch(&self, command: &str) {
            self.dispatched.lock().unwrap().push(command.to_string());
        }
    }

    #[test]
    fn test_tracker_filters_repeats() {
        let mut tracker = BranchTracker::new();
        assert!(tracker.observe("main"));
        assert!(!tracker.observe("main"));
        assert!(!tracker.observe("main"));
        assert!(tracker.observe("feature"));
        assert!(tracker.observe("main"));
        assert_eq!(tracker.last_seen(), Some("main"));
    }

    async fn run(initial: Option<&str>, notifications: &[Option<&str>]) -> Vec<String> {
        let repository = FakeRepository::on(initial);
        let environment = Arc::new(RecordingEnvironment::default());
        let handle = watch_repository(repository.clone(), environment.clone());

        for branch in notifications {
            repository.notify(*branch);
            // Let the watcher read the branch before it is overwritten.
            tokio::task::yield_now().await;
        }
        repository.close();
        handle.await.unwrap();

        environment.dispatched.lock().unwrap().clone()
    }

    #[test]
    fn test_tracker_starting_at_branch() {
        let mut tracker = BranchTracker::starting_at(Some("main".to_string()));
        assert!(!tracker.observe("main"));
        assert!(tracker.observe("feature"));
    }

    #[tokio::test]
    async fn test_unchanged_branch_never_restarts() {
        let dispatched = run(Some("main"), &[Some("main"), Some("main"), Some("main")]).await;
        assert!(dispatched.is_empty(), "{dispatched:?}");
    }

    #[tokio::test]
    async fn test_each_new_branch_restarts_once() {
        let dispatched = run(
            Some("main"),
            &[Some("main"), Some("feature"), Some("feature"), Some("main")],
        )
        .await;
        assert_eq!(dispatched.len(), 2);
        assert!(dispatched.iter().all(|c| c == RESTART_COMMAND));
    }

    #[tokio::test]
    async fn test_unreadable_branch_is_ignored() {
        let dispatched = run(Some("main"), &[None, Some("main"), None, Some("feature")]).await;
        assert_eq!(dispatched, vec![RESTART_COMMAND.to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_baseline_counts_first_branch() {
        let dispatched = run(None, &[Some("main"), Some("main")]).await;
        assert_eq!(dispatched.len(), 1);
    }
}
