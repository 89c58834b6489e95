//! Teardown actions run when the harness exits.
//!
//! Components that acquire something needing release (the running index
//! server, the scratch directory) register an action here. The entry point
//! calls [`CleanupRegistry::run_all`] on every exit path: normal return,
//! command error and Ctrl-C.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Entry {
    label: String,
    action: CleanupAction,
}

/// Outcome of [`CleanupRegistry::run_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Number of actions that completed successfully.
    pub succeeded: usize,
    /// Labels of actions that returned an error or panicked, in run order.
    pub failed: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Ordered list of teardown actions.
///
/// Actions run last-in, first-out. Each action runs at most once: `run_all`
/// removes the actions it runs, so calling it again only runs actions
/// registered since.
#[derive(Default)]
pub struct CleanupRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` under `label`, which is used in log messages.
    pub fn register<F, Fut>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.into();
        debug!(cleanup = %label, "registered cleanup action");
        let action: CleanupAction = Box::new(move || action().boxed());
        self.lock().push(Entry { label, action });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run every registered action in reverse registration order.
    ///
    /// A failing or panicking action is logged and skipped; the remaining
    /// actions still run. Actions registered while this runs are picked up
    /// before it returns.
    pub async fn run_all(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        loop {
            let batch = std::mem::take(&mut *self.lock());
            if batch.is_empty() {
                break;
            }

            for Entry { label, action } in batch.into_iter().rev() {
                debug!(cleanup = %label, "running cleanup action");
                let outcome = AssertUnwindSafe(async move { action().await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => report.succeeded += 1,
                    Ok(Err(e)) => {
                        warn!(cleanup = %label, error = %format!("{e:#}"), "cleanup action failed");
                        report.failed.push(label);
                    }
                    Err(_) => {
                        warn!(cleanup = %label, "cleanup action panicked");
                        report.failed.push(label);
                    }
                }
            }
        }

        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        // A panic while holding the lock cannot leave the Vec inconsistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<String> = self.lock().iter().map(|e| e.label.clone()).collect();
        f.debug_struct("CleanupRegistry")
            .field("actions", &labels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    async fn record(log: Log, name: &'static str) -> Result<()> {
        log.lock().unwrap().push(name);
        Ok(())
    }

    async fn record_then_fail(log: Log, name: &'static str) -> Result<()> {
        log.lock().unwrap().push(name);
        anyhow::bail!("{name} cleanup broke")
    }

    async fn explode() -> Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn runs_in_reverse_order_even_when_one_fails() {
        let registry = CleanupRegistry::new();
        let log = Log::default();

        // Registered first, so it runs last.
        let l = Arc::clone(&log);
        registry.register("first", move || record_then_fail(l, "first"));
        let l = Arc::clone(&log);
        registry.register("second", move || record(l, "second"));
        let l = Arc::clone(&log);
        registry.register("third", move || record(l, "third"));

        let report = registry.run_all().await;

        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, vec!["first".to_string()]);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn failure_of_first_run_action_does_not_stop_rest() {
        let registry = CleanupRegistry::new();
        let log = Log::default();

        let l = Arc::clone(&log);
        registry.register("a", move || record(l, "a"));
        let l = Arc::clone(&log);
        registry.register("b", move || record(l, "b"));
        let l = Arc::clone(&log);
        registry.register("c", move || record_then_fail(l, "c"));

        let report = registry.run_all().await;

        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn panicking_action_is_contained() {
        let registry = CleanupRegistry::new();
        let log = Log::default();

        let l = Arc::clone(&log);
        registry.register("survivor", move || record(l, "survivor"));
        registry.register("panics", explode);

        let report = registry.run_all().await;

        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
        assert_eq!(report.failed, vec!["panics".to_string()]);
    }

    #[tokio::test]
    async fn actions_run_exactly_once() {
        let registry = CleanupRegistry::new();
        let log = Log::default();

        let l = Arc::clone(&log);
        registry.register("once", move || record(l, "once"));

        assert_eq!(registry.len(), 1);
        registry.run_all().await;
        assert!(registry.is_empty());
        let second = registry.run_all().await;

        assert_eq!(*log.lock().unwrap(), vec!["once"]);
        assert_eq!(second, CleanupReport::default());
    }

    #[tokio::test]
    async fn empty_registry_is_clean() {
        let registry = CleanupRegistry::new();
        let report = registry.run_all().await;
        assert!(report.is_clean());
        assert_eq!(report.succeeded, 0);
    }

    #[test]
    fn debug_lists_labels() {
        let registry = CleanupRegistry::new();
        let log = Log::default();
        registry.register("stop server", move || record(log, "stop server"));
        let debug = format!("{registry:?}");
        assert!(debug.contains("stop server"));
    }
}
