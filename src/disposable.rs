// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Ownership of subscriptions and background tasks.
//!
//! Everything a client starts (stream reporters and repository watches)
//! is registered in a [`SubscriptionSet`]. Disposing the set releases each
//! entry exactly once; entries added afterwards are released on the spot.

use tokio::task::JoinHandle;
use tracing::debug;

/// Something that can be released.
pub trait Subscription: Send + Sync {
    /// Releases the underlying resource. Called at most once by
    /// [`SubscriptionSet`].
    fn unsubscribe(&mut self);

    /// Whether the resource is still live.
    fn is_active(&self) -> bool;
}

impl Subscription for JoinHandle<()> {
    fn unsubscribe(&mut self) {
        self.abort();
    }

    fn is_active(&self) -> bool {
        !self.is_finished()
    }
}

/// A subscription that runs a closure when released.
pub struct FnSubscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl FnSubscription {
    /// Wraps `release`.
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Subscription for FnSubscription {
    fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    fn is_active(&self) -> bool {
        self.release.is_some()
    }
}

/// The set of live subscriptions owned by one client.
#[derive(Default)]
pub struct SubscriptionSet {
    entries: Vec<Box<dyn Subscription>>,
    disposed: bool,
}

impl SubscriptionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subscription`. After disposal it is released immediately
    /// instead.
    pub fn add(&mut self, subscription: impl Subscription + 'static) {
        let mut subscription: Box<dyn Subscription> = Box::new(subscription);
        if self.disposed {
            debug!("Subscription added after disposal, releasing immediately");
            subscription.unsubscribe();
            return;
        }
        self.entries.push(subscription);
    }

    /// Releases every registered subscription, in registration order.
    /// Further calls do nothing.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        let count = self.entries.len();
        for mut subscription in self.entries.drain(..) {
            subscription.unsubscribe();
        }
        debug!("Released {} subscriptions", count);
    }

    /// Number of subscriptions awaiting release.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing awaits release.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether [`Self::dispose`] has run.
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Number of registered subscriptions that still report themselves live.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|s| s.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct Probe {
        releases: Arc<AtomicUsize>,
        active: bool,
    }

    impl Probe {
        fn new(releases: &Arc<AtomicUsize>) -> Self {
            Self {
                releases: Arc::clone(releases),
                active: true,
            }
        }
    }

    impl Subscription for Probe {
        fn unsubscribe(&mut self) {
            self.active = false;
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    #[test]
    fn test_dispose_releases_each_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut set = SubscriptionSet::new();
        set.add(Probe::new(&releases));
        set.add(Probe::new(&releases));
        set.add(Probe::new(&releases));
        assert_eq!(set.len(), 3);
        assert_eq!(set.active_count(), 3);

        set.dispose();
        assert_eq!(releases.load(Ordering::SeqCst), 3);
        assert!(set.is_empty());
        assert!(set.is_disposed());

        set.dispose();
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_add_after_dispose_releases_immediately() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut set = SubscriptionSet::new();
        set.dispose();

        set.add(Probe::new(&releases));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_fn_subscription_runs_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&releases);
        let mut subscription = FnSubscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(subscription.is_active());
        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    /// Flips its flag when the owning task is torn down.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_task_subscription_aborts() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));
        let handle = tokio::spawn(async move {
            let _flag = flag;
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;

        let mut set = SubscriptionSet::new();
        set.add(handle);
        assert_eq!(set.active_count(), 1);
        set.dispose();
        assert!(set.is_empty());

        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dropped.load(Ordering::SeqCst), "aborted task kept running");
    }
}
