//! Unload-direction stage pipeline: fetch -> handle failed reads -> handle query warnings ->
//! map row to record -> handle unmappable records -> write -> record position.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::executor::Executor;
use crate::log_manager::LogManager;
use crate::mapper::SimpleMapper;
use crate::{Connector, Error, Metrics, Provenance, ReadResult, Record};

/// Pages through `cql`'s result set, writing every mapped row back through `connector` until the
/// driver reports no further pages or `cancellation` fires.
pub(crate) async fn run_unload_worker(
    connector: &mut (dyn Connector + Send + Sync),
    mapper: &SimpleMapper,
    executor: &Executor,
    log_manager: &LogManager,
    metrics: &dyn Metrics,
    cql: &str,
    resource: &str,
    cancellation: CancellationToken,
) -> Result<(), Error> {
    let mut page_state: Option<Vec<u8>> = None;
    let mut position: u64 = 0;

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

                for row in rows {
                    log_manager.total_items_counter();
                    position += 1;
                    match mapper.to_fields(&row) {
                        Ok(fields) => {
                            let record = Record::Ok {
                                provenance: Provenance {
                                    resource: Arc::from(resource),
                                    position,
                                    source: None,
                                },
                                fields,
                            };
                            connector.write(&record).await?;
                            metrics.record("cqlstream.unload.success", 1, &[]).await;
                            log_manager.record_position(resource, position);
                        }
                        Err(e) => {
                            metrics.record("cqlstream.unload.mapping_failure", 1, &[]).await;
                            log_manager.unmappable_records_handler(&e.to_string())?;
                        }
                    }
                }

                if exhausted {
                    break;
                }
                page_state = next_page;
            }
            ReadResult::Failure { cause } => {
                metrics.record("cqlstream.unload.failure", 1, &[]).await;
                log_manager.failed_reads_handler(&cause)?;
                break;
            }
        }
    }

    trace!(resource, position, "unload worker drained");
    Ok(())
}
