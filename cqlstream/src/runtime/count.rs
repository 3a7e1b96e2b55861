//! Count-direction worker: pages through a query's result set, tallying rows without mapping or
//! writing them anywhere. Shares the read side of the unload pipeline's failure accounting.
use tokio_util::sync::CancellationToken;

use crate::executor::Executor;
use crate::log_manager::LogManager;
use crate::{Error, Metrics, ReadResult};

/// Returns the total number of rows `cql` would fetch, paging until the driver reports no
/// further pages or `cancellation` fires.
pub(crate) async fn run_count_worker(
    executor: &Executor,
    log_manager: &LogManager,
    metrics: &dyn Metrics,
    cql: &str,
    cancellation: CancellationToken,
) -> Result<u64, Error> {
    let mut page_state: Option<Vec<u8>> = None;
    let mut count: u64 = 0;

    loop {
        let fetch = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            r = executor.fetch(cql, page_state.as_deref()) => r,
        };
        let ((read_result, next_page), _stats) = fetch?;

        match read_result {
            ReadResult::Success { rows, meta } => {
                log_manager.query_warnings_handler(&meta.warnings);
                let exhausted = rows.is_empty() && next_page.is_none();
                count += rows.len() as u64;
                if exhausted {
                    break;
                }
                page_state = next_page;
            }
            ReadResult::Failure { cause } => {
                metrics.record("cqlstream.count.failure", 1, &[]).await;
                log_manager.failed_reads_handler(&cause)?;
                break;
            }
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::driver::mock::MockDriver;
    use crate::modules::metrics::NoOpMetrics;
    use std::sync::Arc;

    #[tokio::test]
    async fn counts_zero_rows_from_mock_driver() {
        let cancellation = CancellationToken::new();
        let log_manager = LogManager::new(
            std::env::temp_dir().join(format!("cqlstream-count-{}", uuid::Uuid::new_v4())),
            crate::ErrorThreshold::Unlimited,
            100,
            cancellation.clone(),
        );
        let executor = Executor::new(Arc::new(MockDriver::new(3)), 8);
        let metrics = NoOpMetrics::new();

        let n = run_count_worker(&executor, &log_manager, &metrics, "select count(*) from t", cancellation)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
