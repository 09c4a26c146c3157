//! Ordered single-shard writes with compensations.
//!
//! Shards never share a transaction. A [`Saga`] runs each write as a step
//! and records how to undo it. When a later step fails, the recorded
//! compensations run newest first and the original error is returned. A
//! compensation that itself fails is logged at `error` level with its label,
//! which names the rows left for repair.

use std::future::Future;

use futures_util::future::BoxFuture;

use crate::StorageError;

struct Compensation<'a> {
    label: String,
    action: BoxFuture<'a, Result<(), StorageError>>,
}

#[must_use = "a saga must be committed or aborted"]
pub struct Saga<'a> {
    name: &'static str,
    compensations: Vec<Compensation<'a>>,
}

impl<'a> Saga<'a> {
    pub fn begin(name: &'static str) -> Self {
        tracing::debug!(saga = name, "saga started");
        Self {
            name,
            compensations: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs one write. On failure every registered compensation runs before
    /// the error is returned.
    pub async fn step<T, F>(&mut self, label: &str, write: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match write.await {
            Ok(value) => Ok(value),
            Err(error) => {
                tracing::warn!(saga = self.name, step = label, error = %error, "saga step failed");
                self.rollback().await;
                Err(error)
            }
        }
    }

    /// Registers the undo action for the step that just succeeded. The
    /// future is only polled if the saga rolls back.
    pub fn on_rollback<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: Future<Output = Result<(), StorageError>> + Send + 'a,
    {
        self.compensations.push(Compensation {
            label: label.into(),
            action: Box::pin(action),
        });
    }

    /// Rolls back and returns `error`. Used when a precondition fails between steps.
    pub async fn abort<T>(mut self, error: StorageError) -> Result<T, StorageError> {
        tracing::warn!(saga = self.name, error = %error, "saga aborted");
        self.rollback().await;
        Err(error)
    }

    pub fn commit(self) {
        tracing::debug!(
            saga = self.name,
            steps = self.compensations.len(),
            "saga committed"
        );
    }

    async fn rollback(&mut self) {
        while let Some(compensation) = self.compensations.pop() {
            if let Err(error) = compensation.action.await {
                tracing::error!(
                    saga = self.name,
                    compensation = %compensation.label,
                    error = %error,
                    "compensation failed, rows need repair"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn record<'a>(
        log: &'a Mutex<Vec<String>>,
        entry: &'static str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a {
        async move {
            log.lock().expect("lock").push(entry.to_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_step_runs_compensations_newest_first() {
        let log = Mutex::new(Vec::new());
        let mut saga = Saga::begin("test");

        saga.step("first", async { Ok::<_, StorageError>(1) })
            .await
            .expect("first");
        saga.on_rollback("undo first", record(&log, "undo first"));
        saga.step("second", async { Ok::<_, StorageError>(2) })
            .await
            .expect("second");
        saga.on_rollback("undo second", record(&log, "undo second"));

        let result = saga
            .step("third", async { Err::<(), _>(StorageError::Unavailable) })
            .await;
        assert_eq!(result, Err(StorageError::Unavailable));
        assert_eq!(
            *log.lock().expect("lock"),
            vec!["undo second".to_owned(), "undo first".to_owned()]
        );
    }

    #[tokio::test]
    async fn committed_saga_never_compensates() {
        let log = Mutex::new(Vec::new());
        let mut saga = Saga::begin("test");
        saga.step("only", async { Ok::<_, StorageError>(()) })
            .await
            .expect("step");
        saga.on_rollback("undo", record(&log, "undo"));
        saga.commit();
        assert!(log.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn failing_compensation_does_not_stop_the_rest() {
        let log = Mutex::new(Vec::new());
        let mut saga = Saga::begin("test");
        saga.on_rollback("undo a", record(&log, "undo a"));
        saga.on_rollback("undo b", async { Err(StorageError::Unavailable) });

        let result: Result<(), _> = saga.abort(StorageError::AlreadyExists).await;
        assert_eq!(result, Err(StorageError::AlreadyExists));
        assert_eq!(*log.lock().expect("lock"), vec!["undo a".to_owned()]);
    }
}
