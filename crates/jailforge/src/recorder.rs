//! All-or-nothing execution of provisioning steps.

use std::sync::Arc;

use async_trait::async_trait;
use jailforge_common::ForgeResult;

/// A unit of provisioning work that can be undone.
///
/// Steps take `&self` so the caller can keep a handle to a step and read what
/// it produced (a jail id, a root path) after the recorder has run it.
#[async_trait]
pub trait Step: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Forward action.
    async fn execute(&self) -> ForgeResult<()>;

    /// Undo a successful [`Step::execute`].
    async fn compensate(&self) -> ForgeResult<()>;
}

/// Runs steps in order and unwinds them in reverse when one fails.
#[derive(Default)]
pub struct Recorder {
    executed: Vec<Arc<dyn Step>>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.executed.iter().map(|s| s.name()))
            .finish()
    }
}

impl Recorder {
    /// An empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute `step` and remember it.
    ///
    /// If the step fails it is not remembered, every step executed so far is
    /// compensated, and the step's error is returned.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing step.
    pub async fn run(&mut self, step: Arc<dyn Step>) -> ForgeResult<()> {
        tracing::info!(step = step.name(), "Running step");

        match step.execute().await {
            Ok(()) => {
                tracing::info!(step = step.name(), "Step done");
                self.executed.push(step);
                Ok(())
            }
            Err(err) => {
                tracing::error!(step = step.name(), error = %err, "Step failed, rolling back");
                self.rollback().await;
                Err(err)
            }
        }
    }

    /// Compensate every executed step, most recent first.
    ///
    /// Compensation failures are logged and do not stop the unwinding.
    pub async fn rollback(&mut self) {
        while let Some(step) = self.executed.pop() {
            tracing::info!(step = step.name(), "Compensating step");
            if let Err(err) = step.compensate().await {
                tracing::error!(step = step.name(), error = %err, "Compensation failed");
            }
        }
    }

    /// Names of executed steps, in execution order.
    #[must_use]
    pub fn steps(&self) -> Vec<&str> {
        self.executed.iter().map(|s| s.name()).collect()
    }

    /// Number of executed steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.executed.len()
    }

    /// Whether nothing has been executed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jailforge_common::ForgeError;
    use parking_lot::Mutex;

    struct Probe {
        name: String,
        fail: bool,
        fail_compensate: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Probe {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                fail: false,
                fail_compensate: false,
                log: Arc::clone(log),
            }
        }
    }

    #[async_trait]
    impl Step for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self) -> ForgeResult<()> {
            self.log.lock().push(format!("run {}", self.name));
            if self.fail {
                return Err(ForgeError::Internal {
                    message: format!("{} broke", self.name),
                });
            }
            Ok(())
        }

        async fn compensate(&self) -> ForgeResult<()> {
            self.log.lock().push(format!("undo {}", self.name));
            if self.fail_compensate {
                return Err(ForgeError::Internal {
                    message: "cannot undo".to_string(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failure_unwinds_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut recorder = Recorder::new();

        for name in ["a", "b", "c"] {
            recorder.run(Arc::new(Probe::new(name, &log))).await.unwrap();
        }
        let mut failing = Probe::new("d", &log);
        failing.fail = true;
        let err = recorder.run(Arc::new(failing)).await.unwrap_err();

        assert!(matches!(err, ForgeError::Internal { ref message } if message == "d broke"));
        assert!(recorder.is_empty());
        assert_eq!(
            *log.lock(),
            vec!["run a", "run b", "run c", "run d", "undo c", "undo b", "undo a"]
        );
    }

    #[tokio::test]
    async fn compensation_errors_do_not_stop_unwinding() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut recorder = Recorder::new();

        recorder.run(Arc::new(Probe::new("a", &log))).await.unwrap();
        let mut stubborn = Probe::new("b", &log);
        stubborn.fail_compensate = true;
        recorder.run(Arc::new(stubborn)).await.unwrap();
        assert_eq!(recorder.steps(), vec!["a", "b"]);

        recorder.rollback().await;
        assert_eq!(*log.lock(), vec!["run a", "run b", "undo b", "undo a"]);
        assert_eq!(recorder.len(), 0);
    }

    #[tokio::test]
    async fn first_step_failure_compensates_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut recorder = Recorder::new();
        let mut failing = Probe::new("a", &log);
        failing.fail = true;

        assert!(recorder.run(Arc::new(failing)).await.is_err());
        assert_eq!(*log.lock(), vec!["run a"]);
    }
}
