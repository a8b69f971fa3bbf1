//! Ordered best-effort teardown steps.

use std::fmt::Display;
use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, warn};
use serde::Serialize;

/// A teardown step that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub step: &'static str,
    pub error: String,
}

/// Outcome of running a [`CompensatingActions`] list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub completed: Vec<&'static str>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Steps run strictly in insertion order; a failing step is recorded and the
/// next one still runs.
#[derive(Default)]
pub struct CompensatingActions<'a> {
    steps: Vec<(&'static str, BoxFuture<'a, Result<(), String>>)>,
}

impl<'a> CompensatingActions<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Queue a step. The future is not polled until [`Self::run`].
    pub fn push<F, E>(&mut self, step: &'static str, action: F) -> &mut Self
    where
        F: Future<Output = Result<(), E>> + Send + 'a,
        E: Display,
    {
        self.steps
            .push((step, action.map(|r| r.map_err(|e| e.to_string())).boxed()));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step and log the failures against `subject`.
    pub async fn run(self, subject: &str) -> CleanupReport {
        let mut report = CleanupReport::default();

        for (step, action) in self.steps {
            match action.await {
                Ok(()) => {
                    debug!("Cleanup step '{}' for {} succeeded", step, subject);
                    report.completed.push(step);
                }
                Err(error) => {
                    warn!("Cleanup step '{}' for {} failed: {}", step, subject, error);
                    report.failures.push(CleanupFailure { step, error });
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn failures_do_not_abort_later_steps() {
        let order = Mutex::new(Vec::new());

        let mut actions = CompensatingActions::new();
        actions
            .push("stop", async {
                order.lock().unwrap().push("stop");
                Err::<(), _>("container wedged")
            })
            .push("discard", async {
                order.lock().unwrap().push("discard");
                Ok::<(), String>(())
            });
        assert_eq!(actions.len(), 2);

        let report = actions.run("session s1").await;

        assert_eq!(*order.lock().unwrap(), vec!["stop", "discard"]);
        assert_eq!(report.completed, vec!["discard"]);
        assert_eq!(
            report.failures,
            vec![CleanupFailure {
                step: "stop",
                error: "container wedged".to_string()
            }]
        );
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn steps_are_lazy_until_run() {
        let ran = Mutex::new(false);
        {
            let mut actions = CompensatingActions::new();
            actions.push("never", async {
                *ran.lock().unwrap() = true;
                Ok::<(), String>(())
            });
        }
        assert!(!*ran.lock().unwrap());

        let empty = CompensatingActions::new();
        assert!(empty.is_empty());
        assert!(empty.run("nothing").await.is_clean());
    }
}
