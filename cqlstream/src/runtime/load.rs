//! Load-direction stage pipeline: read -> total -> handle failed records -> map -> handle
//! unmappable statements -> (optional batch) -> execute -> account.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::batcher::StatementBatcher;
use crate::config::BatchConfig;
use crate::executor::Executor;
use crate::log_manager::LogManager;
use crate::mapper::SimpleMapper;
use crate::{Connector, Driver, Error, Executable, ExecutionMeta, Metrics, PreparedStatement, Record, WriteResult};

/// Runs one resource to completion, mapping, batching, and executing every record read from
/// `connector` until it reports [`Error::EndOfInput`] or `cancellation` fires.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_load_worker(
    connector: &mut (dyn Connector + Send + Sync),
    mapper: &SimpleMapper,
    driver: &dyn Driver,
    executor: &Executor,
    log_manager: &LogManager,
    metrics: &dyn Metrics,
    prepared: &PreparedStatement,
    batch_config: &BatchConfig,
    dry_run: bool,
    cancellation: CancellationToken,
) -> Result<(), Error> {
    let mut batcher = batch_config
        .enabled
        .then(|| StatementBatcher::new(batch_config.mode, batch_config.max_batch_statements, batch_config.max_batch_size_bytes));

    loop {
        let record = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            r = connector.read() => r,
        };
        let record = match record {
            Ok(r) => r,
            Err(Error::EndOfInput) => break,
            Err(e) => return Err(e),
        };
        log_manager.total_items_counter();

        if let Record::Error { provenance, cause } = &record {
            log_manager.failed_records_handler(provenance, cause)?;
            continue;
        }

        let record = Arc::new(record);
        let statement = match mapper.to_statement(&record, prepared) {
            Ok(s) => s,
            Err(e) => {
                log_manager.unmappable_statements_handler(record.provenance(), &e.to_string())?;
                continue;
            }
        };

        match batcher.as_mut() {
            Some(batcher) => {
                for batch in batcher.offer(statement, driver) {
                    let executable = StatementBatcher::into_executable(batch);
                    execute_and_account(executor, log_manager, metrics, executable, dry_run).await?;
                }
            }
            None => {
                execute_and_account(executor, log_manager, metrics, Executable::Single(statement), dry_run).await?;
            }
        }
    }

    if let Some(batcher) = batcher.as_mut() {
        for batch in batcher.flush_all() {
            let executable = StatementBatcher::into_executable(batch);
            execute_and_account(executor, log_manager, metrics, executable, dry_run).await?;
        }
    }

    trace!("load worker drained");
    Ok(())
}

/// Executes one [`Executable`] (or, in dry-run, synthesizes a successful result without
/// touching the driver) and routes its outcome through the warning/CAS/failure gates.
///
/// Returns `Err` only for a fatal, threshold-exceeding, or unrecoverable failure; recoverable
/// failures are fully accounted for and absorbed here.
pub(crate) async fn execute_and_account(
    executor: &Executor,
    log_manager: &LogManager,
    metrics: &dyn Metrics,
    executable: Executable,
    dry_run: bool,
) -> Result<(), Error> {
    let result = if dry_run {
        WriteResult::Success {
            executable,
            meta: ExecutionMeta::default(),
        }
    } else {
        let (result, _stats) = executor.execute(executable).await?;
        result
    };

    match result {
        WriteResult::Success { executable, meta } => {
            log_manager.query_warnings_handler(&meta.warnings);
            metrics.record("cqlstream.writes.success", executable.statements().len() as u64, &[]).await;

            if meta.has_cas_failure() {
                let applied_rows = meta.applied_rows.unwrap_or_default();
                log_manager.cas_failure_handler(&executable, &applied_rows)?;
                record_applied_positions(log_manager, &executable, &applied_rows);
            } else {
                for statement in executable.statements() {
                    log_manager.result_positions_handler(statement);
                }
            }
            Ok(())
        }
        WriteResult::Failure { executable, cause } => {
            metrics.record("cqlstream.writes.failure", executable.statements().len() as u64, &[]).await;
            log_manager.failed_writes_handler(&executable, &cause)
        }
    }
}

fn record_applied_positions(log_manager: &LogManager, executable: &Executable, applied_rows: &[crate::AppliedRow]) {
    let statements = executable.statements();
    for row in applied_rows.iter().filter(|r| r.was_applied) {
        if let Some(statement) = statements.get(row.statement_index) {
            log_manager.result_positions_handler(statement);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::modules::connectors::mock::MockConnector;
    use crate::modules::driver::mock::MockDriver;
    use crate::modules::metrics::NoOpMetrics;
    use crate::{FieldMap, Provenance};
    use std::path::PathBuf;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cqlstream-load-{}", uuid::Uuid::new_v4()))
    }

    fn record(resource: &str, position: u64, field: &str, value: &str) -> Record {
        let mut fields = FieldMap::new();
        let _ = fields.insert(field.to_string(), serde_yaml::Value::String(value.to_string()));
        Record::Ok {
            provenance: Provenance {
                resource: Arc::from(resource),
                position,
                source: Some(Arc::from(value)),
            },
            fields,
        }
    }

    #[tokio::test]
    async fn drains_connector_and_records_positions() {
        let dir = scratch_dir();
        let cancellation = CancellationToken::new();
        let log_manager = LogManager::new(dir.clone(), crate::ErrorThreshold::Unlimited, 100, cancellation.clone());
        let driver = MockDriver::new(3);
        let executor = Executor::new(Arc::new(MockDriver::new(3)), 8);
        let mapper = SimpleMapper::parse(Some("a = col_a"), &[]).unwrap();
        let mut connector = MockConnector::new(
            "mock:///a",
            vec![record("mock:///a", 1, "a", "hello"), record("mock:///a", 2, "a", "world")],
        );
        let prepared = PreparedStatement {
            id: Arc::from("id"),
            cql: Arc::from("insert into t (col_a) values (?)"),
        };
        let metrics = NoOpMetrics::new();

        run_load_worker(
            &mut connector,
            &mapper,
            &driver,
            &executor,
            &log_manager,
            &metrics,
            &prepared,
            &BatchConfig::default(),
            false,
            cancellation,
        )
        .await
        .unwrap();

        log_manager.close().unwrap();
        let positions = std::fs::read_to_string(dir.join("positions.txt")).unwrap();
        assert_eq!(positions.trim(), "mock:///a:1-2");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn mapping_failure_is_logged_not_fatal() {
        let dir = scratch_dir();
        let cancellation = CancellationToken::new();
        let log_manager = LogManager::new(dir.clone(), crate::ErrorThreshold::Unlimited, 100, cancellation.clone());
        let driver = MockDriver::new(3);
        let executor = Executor::new(Arc::new(MockDriver::new(3)), 8);
        // Mapping requires field "missing", which the record does not carry.
        let mapper = SimpleMapper::parse(Some("missing = col_a"), &[]).unwrap();
        let mut connector = MockConnector::new("mock:///a", vec![record("mock:///a", 1, "a", "hello")]);
        let prepared = PreparedStatement {
            id: Arc::from("id"),
            cql: Arc::from("insert into t (col_a) values (?)"),
        };
        let metrics = NoOpMetrics::new();

        run_load_worker(
            &mut connector,
            &mapper,
            &driver,
            &executor,
            &log_manager,
            &metrics,
            &prepared,
            &BatchConfig::default(),
            false,
            cancellation,
        )
        .await
        .unwrap();

        assert_eq!(log_manager.error_count(), 1);
        log_manager.close().unwrap();
        let bad = std::fs::read_to_string(dir.join("mapping.bad")).unwrap();
        assert_eq!(bad.lines().count(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn dry_run_never_calls_the_driver() {
        let dir = scratch_dir();
        let cancellation = CancellationToken::new();
        let log_manager = LogManager::new(dir.clone(), crate::ErrorThreshold::Unlimited, 100, cancellation.clone());
        let driver = MockDriver::failing_every(3, 1);
        let executor = Executor::new(Arc::new(MockDriver::failing_every(3, 1)), 8);
        let mapper = SimpleMapper::parse(Some("a = col_a"), &[]).unwrap();
        let mut connector = MockConnector::new("mock:///a", vec![record("mock:///a", 1, "a", "hello")]);
        let prepared = PreparedStatement {
            id: Arc::from("id"),
            cql: Arc::from("insert into t (col_a) values (?)"),
        };
        let metrics = NoOpMetrics::new();

        run_load_worker(
            &mut connector,
            &mapper,
            &driver,
            &executor,
            &log_manager,
            &metrics,
            &prepared,
            &BatchConfig::default(),
            true,
            cancellation,
        )
        .await
        .unwrap();

        // A driver that fails every call would have recorded an error if it had been invoked.
        assert_eq!(log_manager.error_count(), 0);
        log_manager.close().unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
