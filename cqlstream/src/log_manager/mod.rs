//! Observes every failure point in the pipeline, writes durable diagnostic artifacts under one
//! operation directory, and enforces configurable stop-the-world error/warning thresholds.
mod files;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::position::PositionTracker;
use crate::{AppliedRow, Error, ErrorThreshold, Executable, Provenance, Statement};

use files::LazyFile;

/// One of the pipeline-stage sinks the log manager exposes, kept only for structured logging of
/// which gate produced a given diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Category {
    Connector,
    MappingLoad,
    MappingUnload,
    Load,
    Unload,
    Paxos,
}

impl Category {
    fn bad_file(self) -> Option<&'static str> {
        match self {
            Category::Connector => Some("connector.bad"),
            Category::MappingLoad => Some("mapping.bad"),
            Category::MappingUnload => None,
            Category::Load => Some("load.bad"),
            Category::Unload => None,
            Category::Paxos => Some("paxos.bad"),
        }
    }

    fn error_log(self) -> &'static str {
        match self {
            Category::Connector => "connector-errors.log",
            Category::MappingLoad => "mapping-errors.log",
            Category::MappingUnload => "mapping-errors.log",
            Category::Load => "load-errors.log",
            Category::Unload => "unload-errors.log",
            Category::Paxos => "paxos-errors.log",
        }
    }
}

/// Collects error/warning counts, bad-record files, structured error logs, and restart positions
/// for one load/unload/count run.
///
/// All counters are atomic and every file writer is independently mutex-guarded; the log manager
/// itself holds no other mutable state.
pub struct LogManager {
    dir: PathBuf,
    connector_bad: LazyFile,
    mapping_bad: LazyFile,
    load_bad: LazyFile,
    paxos_bad: LazyFile,
    connector_errors: LazyFile,
    mapping_errors: LazyFile,
    load_errors: LazyFile,
    unload_errors: LazyFile,
    paxos_errors: LazyFile,
    positions: PositionTracker,
    total_items: AtomicU64,
    data_errors: AtomicU64,
    query_warnings_seen: AtomicU64,
    warning_suppressed: AtomicBool,
    max_errors: ErrorThreshold,
    max_query_warnings: u64,
    cancellation: CancellationToken,
}

impl LogManager {
    /// Creates a log manager rooted at `dir` (the operation directory, already named
    /// `<output_root>/<executionId>/`).
    pub fn new(dir: PathBuf, max_errors: ErrorThreshold, max_query_warnings: u64, cancellation: CancellationToken) -> Self {
        LogManager {
            connector_bad: LazyFile::new(&dir, "connector.bad"),
            mapping_bad: LazyFile::new(&dir, "mapping.bad"),
            load_bad: LazyFile::new(&dir, "load.bad"),
            paxos_bad: LazyFile::new(&dir, "paxos.bad"),
            connector_errors: LazyFile::new(&dir, "connector-errors.log"),
            mapping_errors: LazyFile::new(&dir, "mapping-errors.log"),
            load_errors: LazyFile::new(&dir, "load-errors.log"),
            unload_errors: LazyFile::new(&dir, "unload-errors.log"),
            paxos_errors: LazyFile::new(&dir, "paxos-errors.log"),
            positions: PositionTracker::new(),
            total_items: AtomicU64::new(0),
            data_errors: AtomicU64::new(0),
            query_warnings_seen: AtomicU64::new(0),
            warning_suppressed: AtomicBool::new(false),
            max_errors,
            max_query_warnings,
            cancellation,
            dir,
        }
    }

    /// The operation directory this log manager writes artifacts under.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current data-error count, across every category.
    pub fn error_count(&self) -> u64 {
        self.data_errors.load(Ordering::Acquire)
    }

    fn bad_writer(&self, category: Category) -> Option<&LazyFile> {
        match category {
            Category::Connector => Some(&self.connector_bad),
            Category::MappingLoad => Some(&self.mapping_bad),
            Category::MappingUnload => None,
            Category::Load => Some(&self.load_bad),
            Category::Unload => None,
            Category::Paxos => Some(&self.paxos_bad),
        }
    }

    fn error_writer(&self, category: Category) -> &LazyFile {
        match category {
            Category::Connector => &self.connector_errors,
            Category::MappingLoad | Category::MappingUnload => &self.mapping_errors,
            Category::Load => &self.load_errors,
            Category::Unload => &self.unload_errors,
            Category::Paxos => &self.paxos_errors,
        }
    }

    /// Appends one structured entry for `category`, plus the raw `source` line (if present) to
    /// its bad file, and records `position` against `resource` when given. An error record with
    /// no source text still logs and records a position, but writes nothing to the bad file
    /// (see DESIGN.md).
    fn log_entry(
        &self,
        category: Category,
        resource: Option<&str>,
        position: Option<u64>,
        source: Option<&str>,
        causes: &[String],
    ) -> Result<(), Error> {
        if let (Some(writer), Some(src)) = (self.bad_writer(category), source) {
            writer.append(&format!("{src}\n"))?;
        }
        self.error_writer(category).append(&render_block(resource, position, source, causes))?;
        if let (Some(r), Some(p)) = (resource, position) {
            self.positions.record(r, p);
        }
        Ok(())
    }

    /// Increments the data-error counter and, if the configured threshold is now exceeded,
    /// cancels all active workers and returns [`Error::TooManyErrors`].
    fn record_error_and_check_threshold(&self) -> Result<(), Error> {
        let errors = self.data_errors.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.total_items.load(Ordering::Acquire);
        if self.max_errors.should_stop(errors, total) {
            let msg = self.max_errors.abort_message();
            self.cancellation.cancel();
            return Err(Error::TooManyErrors(msg));
        }
        Ok(())
    }

    /// `failed_records_handler`: a record the connector tagged as unparseable.
    pub fn failed_records_handler(&self, provenance: &Provenance, cause: &str) -> Result<(), Error> {
        self.log_entry(
            Category::Connector,
            Some(&provenance.resource),
            Some(provenance.position),
            provenance.source.as_deref(),
            &[cause.to_string()],
        )?;
        self.record_error_and_check_threshold()
    }

    /// `unmappable_statements_handler`: a record whose load-direction mapping failed.
    pub fn unmappable_statements_handler(&self, provenance: &Provenance, cause: &str) -> Result<(), Error> {
        self.log_entry(
            Category::MappingLoad,
            Some(&provenance.resource),
            Some(provenance.position),
            provenance.source.as_deref(),
            &[cause.to_string()],
        )?;
        self.record_error_and_check_threshold()
    }

    /// `unmappable_records_handler`: a fetched row whose unload-direction mapping failed. No
    /// source text or position exists for a row that never had upstream provenance.
    pub fn unmappable_records_handler(&self, cause: &str) -> Result<(), Error> {
        self.log_entry(Category::MappingUnload, None, None, None, &[cause.to_string()])?;
        self.record_error_and_check_threshold()
    }

    /// `failed_writes_handler`: a [`Executable`] whose execution failed, unwound to its
    /// constituent statements so each mapped statement's source and position are recovered. Each
    /// constituent statement counts separately against the error threshold, mirroring
    /// `cas_failure_handler`'s per-row accounting.
    pub fn failed_writes_handler(&self, executable: &Executable, cause: &str) -> Result<(), Error> {
        for statement in executable.statements() {
            self.log_failed_statement(Category::Load, statement, cause)?;
        }
        for _ in 0..executable.statements().len() {
            self.record_error_and_check_threshold()?;
        }
        Ok(())
    }

    /// CAS/paxos handling: a successful batch whose conditional update did not apply for one or
    /// more constituent rows. Each non-applied row is logged and counted, grouped under a
    /// `Failed conditional updates:` header.
    pub fn cas_failure_handler(&self, executable: &Executable, applied_rows: &[AppliedRow]) -> Result<(), Error> {
        let statements = executable.statements();
        let failing: Vec<&AppliedRow> = applied_rows.iter().filter(|r| !r.was_applied).collect();
        if failing.is_empty() {
            return Ok(());
        }
        self.paxos_errors.append("Failed conditional updates:\n")?;
        for row in failing {
            if let Some(statement) = statements.get(row.statement_index) {
                self.log_failed_statement(Category::Paxos, statement, "conditional check failed")?;
            }
        }
        for _ in 0..applied_rows.iter().filter(|r| !r.was_applied).count() {
            self.record_error_and_check_threshold()?;
        }
        Ok(())
    }

    fn log_failed_statement(&self, category: Category, statement: &Statement, cause: &str) -> Result<(), Error> {
        let provenance = statement.record.as_ref().map(|r| r.provenance());
        self.log_entry(
            category,
            provenance.map(|p| p.resource.as_ref()),
            provenance.map(|p| p.position),
            statement.source_line().as_deref(),
            &[cause.to_string()],
        )
    }

    /// `failed_reads_handler`: an unload fetch that failed. No source or position exists for a
    /// read that never produced rows.
    pub fn failed_reads_handler(&self, cause: &str) -> Result<(), Error> {
        self.log_entry(Category::Unload, None, None, None, &[cause.to_string()])?;
        self.record_error_and_check_threshold()
    }

    /// `query_warnings_handler`: logs up to `max_query_warnings` warnings at WARN, then a single
    /// suppression notice, and never logs again for the remainder of the run.
    pub fn query_warnings_handler(&self, warnings: &[String]) {
        for message in warnings {
            let seen = self.query_warnings_seen.fetch_add(1, Ordering::AcqRel) + 1;
            if seen <= self.max_query_warnings {
                warn!(warning = %message, "server returned a query warning");
            } else if !self.warning_suppressed.swap(true, Ordering::AcqRel) {
                warn!("subsequent warnings will not be logged");
            }
        }
    }

    /// `result_positions_handler`: records the position of a statement whose execution
    /// succeeded.
    pub fn result_positions_handler(&self, statement: &Statement) {
        if let Some(record) = &statement.record {
            let provenance = record.provenance();
            self.positions.record(&provenance.resource, provenance.position);
        }
    }

    /// Records a position directly against `resource`, for callers with no [`Statement`] to
    /// recover provenance from (the unload path writes rows straight from the driver, with no
    /// back-reference to a source statement).
    pub fn record_position(&self, resource: &str, position: u64) {
        self.positions.record(resource, position);
    }

    /// `total_items_counter`: increments the run-wide total-items counter. Called once per
    /// record, independent of its eventual outcome.
    pub fn total_items_counter(&self) {
        self.total_items.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns a [`CancellationToken`] that fires once a threshold has been crossed, for the
    /// orchestrator to race against other suspension points.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// `termination_handler`: flushes every opened file and writes `positions.txt`, once, on
    /// pipeline shutdown. Idempotent-safe to call even if no artifact was ever opened.
    pub fn close(&self) -> Result<(), Error> {
        for writer in [
            &self.connector_bad,
            &self.mapping_bad,
            &self.load_bad,
            &self.paxos_bad,
            &self.connector_errors,
            &self.mapping_errors,
            &self.load_errors,
            &self.unload_errors,
            &self.paxos_errors,
        ] {
            writer.close()?;
        }
        let lines = self.positions.render();
        if !lines.is_empty() {
            std::fs::create_dir_all(&self.dir)?;
            let mut rendered = lines.join("\n");
            rendered.push('\n');
            std::fs::write(self.dir.join("positions.txt"), rendered)?;
        }
        Ok(())
    }
}

/// Renders one structured error-log entry: `Resource:`/`Position:`/`Source:` (each only if
/// present) followed by the cause chain, then a trailing blank line separating it from the next
/// entry.
fn render_block(resource: Option<&str>, position: Option<u64>, source: Option<&str>, causes: &[String]) -> String {
    let mut out = String::new();
    if let Some(r) = resource {
        out.push_str(&format!("Resource: {r}\n"));
    }
    if let Some(p) = position {
        out.push_str(&format!("Position: {p}\n"));
    }
    if let Some(s) = source {
        out.push_str(&format!("Source: {s}\n"));
    }
    for cause in causes {
        out.push_str(cause);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldMap, Record, Statement, StatementBody};
    use std::sync::Arc;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cqlstream-logmgr-{}", uuid::Uuid::new_v4()))
    }

    fn provenance(resource: &str, position: u64, source: Option<&str>) -> Provenance {
        Provenance {
            resource: Arc::from(resource),
            position,
            source: source.map(Arc::from),
        }
    }

    #[test]
    fn threshold_at_zero_aborts_on_first_mapping_error() {
        let dir = scratch_dir();
        let mgr = LogManager::new(dir.clone(), ErrorThreshold::Absolute(0), 100, CancellationToken::new());
        mgr.total_items_counter();
        let prov = provenance("file:///f1.csv", 1, Some("bad,line"));
        let err = mgr.unmappable_statements_handler(&prov, "missing field").unwrap_err();
        assert!(matches!(err, Error::TooManyErrors(msg) if msg == "Too many errors, the maximum allowed is 0."));
        assert!(mgr.cancellation.is_cancelled());
        mgr.close().unwrap();
        let bad = std::fs::read_to_string(dir.join("mapping.bad")).unwrap();
        assert_eq!(bad, "bad,line\n");
        let positions = std::fs::read_to_string(dir.join("positions.txt")).unwrap();
        assert_eq!(positions, "file:///f1.csv:1\n");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn batched_write_failure_unwinds_to_constituents() {
        let dir = scratch_dir();
        let mgr = LogManager::new(dir.clone(), ErrorThreshold::Absolute(1), 100, CancellationToken::new());
        let statements: Vec<Statement> = (1..=3)
            .map(|i| {
                let record = Arc::new(Record::Ok {
                    provenance: provenance("file:///f.csv", i, Some(&format!("line{i}"))),
                    fields: FieldMap::new(),
                });
                Statement {
                    body: StatementBody::Simple { cql: Arc::from("insert ...") },
                    record: Some(record),
                    routing_key: None,
                }
            })
            .collect();
        for _ in 0..3 {
            mgr.total_items_counter();
        }
        let batch = Executable::Batch(crate::Batch {
            batch_type: crate::BatchType::Unlogged,
            statements,
        });
        let err = mgr.failed_writes_handler(&batch, "timeout").unwrap_err();
        assert!(matches!(err, Error::TooManyErrors(_)));
        mgr.close().unwrap();
        let bad = std::fs::read_to_string(dir.join("load.bad")).unwrap();
        assert_eq!(bad.lines().count(), 3);
        let log = std::fs::read_to_string(dir.join("load-errors.log")).unwrap();
        assert_eq!(log.matches("Resource:").count(), 3);
        assert_eq!(log.matches("Position:").count(), 3);
        assert_eq!(log.matches("Source:").count(), 3);
        let positions = std::fs::read_to_string(dir.join("positions.txt")).unwrap();
        assert_eq!(positions.lines().count(), 1);
        assert_eq!(positions.trim(), "file:///f.csv:1-3");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn ratio_threshold_does_not_abort_below_min_sample() {
        let dir = scratch_dir();
        let mgr = LogManager::new(
            dir.clone(),
            ErrorThreshold::Ratio { r: 0.01, min_sample: 100 },
            100,
            CancellationToken::new(),
        );
        for i in 1..=3u64 {
            mgr.total_items_counter();
            let prov = provenance("file:///f.csv", i, Some("line"));
            mgr.failed_records_handler(&prov, "parse error").unwrap();
        }
        assert_eq!(mgr.error_count(), 3);
        assert!(!mgr.cancellation.is_cancelled());
        mgr.close().unwrap();
        let bad = std::fs::read_to_string(dir.join("connector.bad")).unwrap();
        assert_eq!(bad.lines().count(), 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn ratio_threshold_aborts_once_min_sample_is_reached() {
        // 102 identical failures against ratio(0.01, 100). `should_stop` evaluates
        // `total_items >= min_sample`, so the 100th failure is the one that both crosses the
        // sample floor and the ratio (100/100 > 0.01); the run aborts there and never sees
        // failures 101-102, leaving exactly 100 entries on disk.
        let dir = scratch_dir();
        let mgr = LogManager::new(
            dir.clone(),
            ErrorThreshold::Ratio { r: 0.01, min_sample: 100 },
            100,
            CancellationToken::new(),
        );
        let mut aborted_at = None;
        for i in 1..=102u64 {
            mgr.total_items_counter();
            let prov = provenance("file:///f.csv", i, Some("line"));
            if let Err(err) = mgr.failed_records_handler(&prov, "parse error") {
                assert!(matches!(err, Error::TooManyErrors(_)));
                aborted_at = Some(i);
                break;
            }
        }
        assert_eq!(aborted_at, Some(100));
        assert_eq!(mgr.error_count(), 100);
        assert!(mgr.cancellation.is_cancelled());
        mgr.close().unwrap();
        let bad = std::fs::read_to_string(dir.join("connector.bad")).unwrap();
        assert_eq!(bad.lines().count(), 100);
        let positions = std::fs::read_to_string(dir.join("positions.txt")).unwrap();
        assert_eq!(positions.trim(), "file:///f.csv:1-100");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cas_partial_failure_groups_under_header() {
        let dir = scratch_dir();
        let mgr = LogManager::new(dir.clone(), ErrorThreshold::Absolute(2), 100, CancellationToken::new());
        let statements: Vec<Statement> = (1..=3)
            .map(|i| Statement {
                body: StatementBody::Simple { cql: Arc::from("insert ... if not exists") },
                record: Some(Arc::new(Record::Ok {
                    provenance: provenance("file:///f.csv", i, Some(&format!("row{i}"))),
                    fields: FieldMap::new(),
                })),
                routing_key: None,
            })
            .collect();
        let batch = Executable::Batch(crate::Batch {
            batch_type: crate::BatchType::Unlogged,
            statements,
        });
        let applied = vec![
            AppliedRow { was_applied: false, statement_index: 0 },
            AppliedRow { was_applied: false, statement_index: 1 },
            AppliedRow { was_applied: false, statement_index: 2 },
        ];
        let err = mgr.cas_failure_handler(&batch, &applied).unwrap_err();
        assert!(matches!(err, Error::TooManyErrors(_)));
        mgr.close().unwrap();
        let bad = std::fs::read_to_string(dir.join("paxos.bad")).unwrap();
        assert_eq!(bad.lines().count(), 3);
        let log = std::fs::read_to_string(dir.join("paxos-errors.log")).unwrap();
        assert!(log.starts_with("Failed conditional updates:\n"));
        assert_eq!(log.matches("Resource:").count(), 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn query_warnings_cap_suppresses_after_limit() {
        let dir = scratch_dir();
        let mgr = LogManager::new(dir.clone(), ErrorThreshold::Unlimited, 1, CancellationToken::new());
        mgr.query_warnings_handler(&["first".into(), "second".into()]);
        mgr.query_warnings_handler(&["third".into()]);
        assert_eq!(mgr.query_warnings_seen.load(Ordering::Acquire), 3);
        assert!(mgr.warning_suppressed.load(Ordering::Acquire));
        mgr.close().unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn error_record_with_no_source_still_records_position_but_not_bad_file() {
        let dir = scratch_dir();
        let mgr = LogManager::new(dir.clone(), ErrorThreshold::Unlimited, 100, CancellationToken::new());
        let prov = provenance("file:///f.csv", 5, None);
        mgr.failed_records_handler(&prov, "truncated row").unwrap();
        mgr.close().unwrap();
        assert!(!dir.join("connector.bad").exists());
        let positions = std::fs::read_to_string(dir.join("positions.txt")).unwrap();
        assert_eq!(positions.trim(), "file:///f.csv:5");
        let log = std::fs::read_to_string(dir.join("connector-errors.log")).unwrap();
        assert!(log.contains("Position: 5"));
        assert!(!log.contains("Source:"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
