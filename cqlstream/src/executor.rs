//! Presents a uniform async `execute`/`fetch` surface over a [`Driver`], bounding in-flight
//! concurrency with a semaphore and classifying failures as recoverable or fatal.
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::trace;

use crate::{Driver, Error, Executable, ReadResult, WriteResult};

/// Latency and attempt-count metadata recorded alongside each execution.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionStats {
    /// Wall-clock time spent awaiting the driver's response.
    pub latency: std::time::Duration,
}

/// Bounds in-flight requests to a configured driver and classifies its failures.
///
/// The adapter never retries; retries are the driver's own responsibility.
pub struct Executor {
    driver: Arc<dyn Driver + Send + Sync>,
    in_flight: Arc<Semaphore>,
}

impl Executor {
    /// Creates an executor bounding concurrent requests to `max_in_flight`.
    pub fn new(driver: Arc<dyn Driver + Send + Sync>, max_in_flight: usize) -> Self {
        Executor {
            driver,
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Executes a statement or batch, returning its outcome and execution stats.
    ///
    /// A recoverable driver failure is returned as `Ok(WriteResult::Failure { .. })`; an
    /// unrecoverable one propagates as `Err(Error::Unrecoverable(..))`, bypassing the error
    /// counter entirely.
    pub async fn execute(&self, executable: Executable) -> Result<(WriteResult, ExecutionStats), Error> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| Error::ExecutionError("executor semaphore closed".into()))?;

        let started = Instant::now();
        let result = self.driver.execute_async(&executable).await?;
        let stats = ExecutionStats {
            latency: started.elapsed(),
        };
        trace!(latency_us = stats.latency.as_micros(), "statement executed");
        Ok((result, stats))
    }

    /// Fetches the next page of rows for an unload query.
    pub async fn fetch(
        &self,
        cql: &str,
        page_state: Option<&[u8]>,
    ) -> Result<((ReadResult, Option<Vec<u8>>), ExecutionStats), Error> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| Error::ExecutionError("executor semaphore closed".into()))?;

        let started = Instant::now();
        let result = self.driver.fetch_async(cql, page_state).await?;
        let stats = ExecutionStats {
            latency: started.elapsed(),
        };
        Ok((result, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::driver::mock::MockDriver;
    use crate::Statement;

    #[tokio::test]
    async fn successful_execution_reports_success() {
        let executor = Executor::new(Arc::new(MockDriver::new(3)), 4);
        let (result, _) = executor
            .execute(Executable::Single(Statement::simple("select 1")))
            .await
            .unwrap();
        assert!(matches!(result, WriteResult::Success { .. }));
    }

    #[tokio::test]
    async fn recoverable_failure_does_not_propagate_as_error() {
        let executor = Executor::new(Arc::new(MockDriver::failing_every(3, 1)), 4);
        let (result, _) = executor
            .execute(Executable::Single(Statement::simple("select 1")))
            .await
            .unwrap();
        assert!(matches!(result, WriteResult::Failure { .. }));
    }

    #[tokio::test]
    async fn bounds_concurrency_to_max_in_flight() {
        let executor = Arc::new(Executor::new(Arc::new(MockDriver::new(3)), 1));
        let a = executor.clone();
        let b = executor.clone();
        let (ra, rb) = tokio::join!(
            a.execute(Executable::Single(Statement::simple("select 1"))),
            b.execute(Executable::Single(Statement::simple("select 1")))
        );
        assert!(ra.is_ok());
        assert!(rb.is_ok());
    }
}
