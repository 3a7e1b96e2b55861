//! Streaming execution core for a bulk CQL data loader/unloader.
//!
//! This crate owns the hardest part of a bulk load/unload tool: a
//! backpressured, concurrent pipeline that turns [`Record`]s into
//! [`Statement`]s, batches them by routing affinity, executes them against a
//! cluster with bounded in-flight concurrency, and enforces configurable
//! error thresholds with complete failure accounting (bad-records files,
//! per-error logs, restart positions).
//!
//! Connector plugins, the CQL driver wire protocol, type-conversion codecs,
//! and CLI argument parsing are external collaborators, each substitutable
//! behind a narrow trait defined in this crate.
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod batcher;
pub mod config;
pub mod executor;
pub mod log_manager;
pub(crate) mod modules;
pub mod position;
mod runtime;

pub use modules::connectors;
pub use modules::driver;
pub use modules::mapper;
pub use modules::metrics;
pub use runtime::{Direction, RunSummary, Runtime};

/// Reserved resource URI used internally for shutdown signaling between stage workers.
pub(crate) const SHUTDOWN_RESOURCE: &str = "cqlstream:///shutdown";

/// Provenance carried by every [`Record`]: where it came from and its place within that
/// resource's stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Provenance {
    /// The resource URI the record was read from (file, stdin, a network endpoint, ...).
    pub resource: Arc<str>,
    /// Monotonically increasing, 1-based position of this record within `resource`.
    pub position: u64,
    /// The original source-line text, when the connector can recover it.
    pub source: Option<Arc<str>>,
}

/// An ordered map of named fields. Field values use [`serde_yaml::Value`] since the concrete
/// text/JSON-to-CQL codec is an external collaborator (see [`mapper`]).
pub type FieldMap = indexmap::IndexMap<String, serde_yaml::Value>;

/// A single record read from (load direction) or destined for (unload direction) a resource.
///
/// Records are immutable after emission. An `Error` record carries a cause and, when available,
/// the raw source line, but never fields — a record that failed to parse has nothing to map.
#[derive(Clone, Debug)]
pub enum Record {
    /// A successfully parsed record with its field values.
    Ok {
        /// Provenance triple for this record.
        provenance: Provenance,
        /// The record's field values.
        fields: FieldMap,
    },
    /// A record that failed to parse from its source.
    Error {
        /// Provenance triple for this record (fields are never populated on error).
        provenance: Provenance,
        /// Human-readable cause of the parse failure.
        cause: String,
    },
}

impl Record {
    /// Returns this record's provenance triple.
    pub fn provenance(&self) -> &Provenance {
        match self {
            Record::Ok { provenance, .. } | Record::Error { provenance, .. } => provenance,
        }
    }
}

/// A 64-bit routing token, as produced by a [`Driver`]'s partitioner.
pub type Token = u64;

/// An opaque cluster node identifier returned by [`Driver::replicas`].
pub type NodeId = Arc<str>;

/// A single scalar value bound into a prepared statement.
///
/// This is intentionally minimal: the core does not reshape or validate CQL types, it only
/// needs enough structure to estimate statement size and to render malformed-value diagnostics.
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    /// UTF-8 text.
    Text(String),
    /// A signed 64-bit integer.
    BigInt(i64),
    /// A 64-bit floating point value.
    Double(f64),
    /// A boolean.
    Boolean(bool),
    /// Opaque bytes, used for blobs and for values a codec could not deserialize.
    Blob(Vec<u8>),
    /// A CQL NULL.
    Null,
}

/// A handle to a statement prepared against the cluster.
#[derive(Clone, Debug)]
pub struct PreparedStatement {
    /// Driver-assigned opaque identifier for the prepared statement.
    pub id: Arc<str>,
    /// The CQL text the statement was prepared from (kept for diagnostics).
    pub cql: Arc<str>,
}

/// The executable body of a [`Statement`], independent of its record back-reference.
#[derive(Clone, Debug)]
pub enum StatementBody {
    /// A prepared statement bound with positional values.
    Prepared {
        /// The prepared statement handle.
        statement: PreparedStatement,
        /// Bound values, in prepare-time order.
        values: Vec<CqlValue>,
    },
    /// A simple (unprepared) CQL statement.
    Simple {
        /// The raw CQL text.
        cql: Arc<str>,
    },
}

impl StatementBody {
    /// Estimated wire size in bytes, used by the batcher to respect `max_batch_size_bytes`.
    pub fn estimated_size(&self) -> usize {
        match self {
            StatementBody::Prepared { statement, values } => {
                statement.cql.len()
                    + values
                        .iter()
                        .map(|v| match v {
                            CqlValue::Text(s) => s.len(),
                            CqlValue::Blob(b) => b.len(),
                            _ => 8,
                        })
                        .sum::<usize>()
            }
            StatementBody::Simple { cql } => cql.len(),
        }
    }
}

/// A database-bound command. A *mapped* statement keeps a back-reference to the originating
/// [`Record`] so its source can be recovered on failure; a *simple* statement carries none.
#[derive(Clone, Debug)]
pub struct Statement {
    /// The CQL body to execute.
    pub body: StatementBody,
    /// Back-reference to the originating record, present for mapped statements.
    pub record: Option<Arc<Record>>,
    /// Routing key used for token-aware batching, when known.
    pub routing_key: Option<Vec<u8>>,
}

impl Statement {
    /// Creates a simple statement with no record back-reference.
    pub fn simple(cql: impl Into<Arc<str>>) -> Self {
        Statement {
            body: StatementBody::Simple { cql: cql.into() },
            record: None,
            routing_key: None,
        }
    }

    /// Returns the raw source line of the originating record, if this is a mapped statement
    /// whose record carries one.
    pub fn source_line(&self) -> Option<Arc<str>> {
        self.record
            .as_ref()
            .and_then(|r| r.provenance().source.clone())
    }
}

/// Logged vs. unlogged CQL batch type. Batches default to `Unlogged` unless declared otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchType {
    /// An atomic (logged) batch — all statements commit together, at a coordination cost.
    Logged,
    /// A non-atomic (unlogged) batch — statements are grouped only to amortize round-trips.
    Unlogged,
}

/// An ordered collection of up to N statements sharing a routing affinity.
#[derive(Clone, Debug)]
pub struct Batch {
    /// Logged or unlogged.
    pub batch_type: BatchType,
    /// The constituent statements, each retaining its own record back-reference.
    pub statements: Vec<Statement>,
}

impl Batch {
    /// Total estimated size in bytes of all constituent statements.
    pub fn estimated_size(&self) -> usize {
        self.statements.iter().map(|s| s.body.estimated_size()).sum()
    }
}

/// Either a single statement or a batch, as submitted to the [`executor`].
#[derive(Clone, Debug)]
pub enum Executable {
    /// A single statement.
    Single(Statement),
    /// A batch of statements sharing routing affinity.
    Batch(Batch),
}

impl Executable {
    /// Returns the constituent statements, whether this is a single statement or a batch.
    pub fn statements(&self) -> Vec<&Statement> {
        match self {
            Executable::Single(s) => vec![s],
            Executable::Batch(b) => b.statements.iter().collect(),
        }
    }
}

/// A row returned for a conditional (CAS / "paxos") update, indicating whether it applied.
#[derive(Clone, Debug)]
pub struct AppliedRow {
    /// Whether this row's condition (`IF [NOT] EXISTS` / `IF ...`) was satisfied.
    pub was_applied: bool,
    /// Index of the statement within the enclosing batch this row corresponds to.
    pub statement_index: usize,
}

/// Execution metadata attached to a successful [`WriteResult`] or [`ReadResult`].
#[derive(Clone, Debug, Default)]
pub struct ExecutionMeta {
    /// Server-side warnings returned with the response.
    pub warnings: Vec<String>,
    /// For conditional updates, the rows indicating per-statement application.
    pub applied_rows: Option<Vec<AppliedRow>>,
}

impl ExecutionMeta {
    /// Returns `true` when this was a conditional update and any constituent row failed to
    /// apply.
    pub fn has_cas_failure(&self) -> bool {
        self.applied_rows
            .as_ref()
            .is_some_and(|rows| rows.iter().any(|r| !r.was_applied))
    }
}

/// Outcome of executing a [`Executable`] against the cluster.
#[derive(Clone, Debug)]
pub enum WriteResult {
    /// The statement or batch executed successfully.
    Success {
        /// What was executed.
        executable: Executable,
        /// Execution metadata (warnings, CAS application).
        meta: ExecutionMeta,
    },
    /// The statement or batch failed with a recoverable driver error.
    Failure {
        /// What was executed.
        executable: Executable,
        /// Human-readable cause.
        cause: String,
    },
}

/// A row read back from the cluster during an unload run, prior to row-to-record mapping.
#[derive(Clone, Debug, Default)]
pub struct Row {
    /// Column values by name.
    pub columns: indexmap::IndexMap<String, CqlValue>,
}

/// Outcome of fetching a page of rows during an unload run.
#[derive(Clone, Debug)]
pub enum ReadResult {
    /// Rows were fetched successfully.
    Success {
        /// The fetched rows.
        rows: Vec<Row>,
        /// Execution metadata (warnings).
        meta: ExecutionMeta,
    },
    /// The fetch failed with a recoverable driver error.
    Failure {
        /// Human-readable cause.
        cause: String,
    },
}

/// Policy converting an error count into a stop signal.
#[derive(Clone, Copy, Debug)]
pub enum ErrorThreshold {
    /// Never stop on errors.
    Unlimited,
    /// Stop once strictly more than `k` errors have been observed. `k = 0` means "stop on the
    /// first error".
    Absolute(u64),
    /// Stop once `errors / total_items > r`, provided `total_items >= min_sample`.
    Ratio {
        /// The maximum tolerated error ratio.
        r: f64,
        /// The minimum number of total items observed before the ratio is evaluated.
        min_sample: u64,
    },
}

impl ErrorThreshold {
    /// Parses a threshold from its configuration-surface string form: `"unlimited"`, an integer
    /// (`absolute`), or a percentage like `"2%"` (`ratio`, with `min_sample` defaulting to 100).
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("unlimited") || trimmed == "-1" {
            return Ok(ErrorThreshold::Unlimited);
        }
        if let Some(pct) = trimmed.strip_suffix('%') {
            let value: f64 = pct
                .parse()
                .map_err(|_| Error::ConfigFailedValidation(format!("invalid ratio: {raw}")))?;
            return Ok(ErrorThreshold::Ratio {
                r: value / 100.0,
                min_sample: 100,
            });
        }
        let value: u64 = trimmed
            .parse()
            .map_err(|_| Error::ConfigFailedValidation(format!("invalid maxErrors: {raw}")))?;
        Ok(ErrorThreshold::Absolute(value))
    }

    /// Returns `true` if, given the current error and total-item counts, the run should abort.
    pub fn should_stop(&self, errors: u64, total_items: u64) -> bool {
        match *self {
            ErrorThreshold::Unlimited => false,
            ErrorThreshold::Absolute(k) => errors > k,
            ErrorThreshold::Ratio { r, min_sample } => {
                total_items >= min_sample && (errors as f64 / total_items as f64) > r
            }
        }
    }

    /// Renders the user-visible abort message for this threshold, e.g.
    /// `"Too many errors, the maximum allowed is {k}."`.
    pub fn abort_message(&self) -> String {
        match *self {
            ErrorThreshold::Unlimited => "Too many errors.".into(),
            ErrorThreshold::Absolute(k) => format!("Too many errors, the maximum allowed is {k}."),
            ErrorThreshold::Ratio { r, min_sample } => format!(
                "Too many errors, the maximum allowed ratio is {r} (minimum sample {min_sample})."
            ),
        }
    }
}

/// Feature flags a connector may declare support for via [`Connector::supports`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectorFeature {
    /// Records carry a positional index in addition to named fields.
    IndexedRecords,
    /// Records are constructed from a prior mapping step rather than raw field text.
    MappedRecords,
}

/// Field name/type metadata a connector can describe about the records it produces.
#[derive(Clone, Debug, Default)]
pub struct RecordMetadata {
    /// Declared field names, in encounter order.
    pub field_names: Vec<String>,
}

/// Closer trait used by connectors, writers, and drivers to optionally release resources before
/// pipeline shutdown.
#[async_trait]
pub trait Closer {
    /// Gracefully release resources prior to shutdown.
    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// A source of [`Record`]s (load direction) that also accepts records for writing out
/// (unload direction). A given implementation typically only supports one direction
/// meaningfully and returns [`Error::ConnectorError`] from the other.
///
/// `init`/`close` are lifecycle hooks; `read` pulls the next record one at a time. The
/// thread-per-resource concurrency regime is realized by running one connector instance per
/// resource rather than a nested stream-of-streams.
#[async_trait]
pub trait Connector: Closer {
    /// Prepares the connector for reading or writing, e.g. opening file handles.
    async fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Returns the next record, or [`Error::EndOfInput`] once the resource is exhausted.
    async fn read(&mut self) -> Result<Record, Error> {
        Err(Error::ConnectorError("connector does not support reading".into()))
    }

    /// The URI of the resource the connector is currently reading from or writing to.
    fn current_resource(&self) -> &str;

    /// Writes a record out (unload direction).
    async fn write(&mut self, _record: &Record) -> Result<(), Error> {
        Err(Error::ConnectorError("connector does not support writing".into()))
    }

    /// An estimate of how many resources this connector will enumerate. `0` means unknown and is
    /// treated as "large" by the orchestrator when choosing a scheduling regime.
    fn estimated_resource_count(&self) -> usize {
        1
    }

    /// Whether this connector supports a given optional feature.
    fn supports(&self, _feature: ConnectorFeature) -> bool {
        false
    }

    /// Describes the fields this connector's records carry, when known ahead of time.
    fn record_metadata(&self) -> RecordMetadata {
        RecordMetadata::default()
    }
}

/// The minimum surface a CQL driver adapter must expose.
///
/// `token_for`/`replicas` back the statement batcher's routing-affinity grouping; `prepare`/
/// `execute_async` back the executor adapter.
#[async_trait]
pub trait Driver: Closer {
    /// Prepares a CQL statement, returning a reusable handle.
    async fn prepare(&self, cql: &str) -> Result<PreparedStatement, Error>;

    /// Executes a single statement or batch, returning its write outcome.
    async fn execute_async(&self, executable: &Executable) -> Result<WriteResult, Error>;

    /// Fetches the next page of rows for an unload query.
    async fn fetch_async(&self, cql: &str, page_state: Option<&[u8]>) -> Result<(ReadResult, Option<Vec<u8>>), Error>;

    /// Computes the routing token for a given routing key.
    fn token_for(&self, routing_key: &[u8]) -> Token;

    /// Returns the replica set responsible for a given token.
    fn replicas(&self, token: Token) -> Vec<NodeId>;
}

/// A passive observability sink for pipeline-level counters.
///
/// A pluggable backend registered the same way as connectors/drivers, defaulting to a no-op so
/// the core never requires an observability stack to run.
#[async_trait]
pub trait Metrics: Closer {
    /// Records one named counter increment, with an optional set of label key/value pairs.
    async fn record(&self, name: &str, value: u64, labels: &[(&str, &str)]);
}

/// Errors surfaced anywhere in the pipeline.
///
/// Kinds 1-7 of the error taxonomy (connector, mapping, write, read, CAS, query warning) are
/// recovered locally by the log manager; kinds 8-9 (`Unrecoverable`, `TooManyErrors`) are fatal
/// and propagate to the orchestrator.
#[derive(Debug, Error)]
pub enum Error {
    /// YAML parsing/serialization failure in the declarative configuration.
    #[error("unable to serialize YAML object")]
    UnableToSerializeYamlObject(
        #[from]
        #[source]
        serde_yaml::Error,
    ),

    /// JSON serialization failure, used as a jsonschema validation pre-step.
    #[error("unable to serialize JSON object")]
    UnableToSerializeJsonObject(
        #[from]
        #[source]
        serde_json::Error,
    ),

    /// I/O failure reading/writing a resource or a diagnostic artifact.
    #[error("I/O error: {0}")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),

    /// Validation errors discovered by jsonschema evaluation of a module's configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal pipeline execution failure not otherwise classified.
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// The connector has no further records and will not be read from again.
    #[error("end of input reached")]
    EndOfInput,

    /// Unable to secure an internal mutex/lock.
    #[error("internal error: unable to secure lock")]
    UnableToSecureLock,

    /// A plugin of the same category has already been registered under this name.
    #[error("duplicate registered name: {0}")]
    DuplicateRegisteredName(String),

    /// The jsonschema configuration supplied for a module is itself invalid.
    #[error("invalid validation schema: {0}")]
    InvalidValidationSchema(String),

    /// Configuration provided to a module failed validation.
    #[error("configuration validation failed: {0}")]
    ConfigFailedValidation(String),

    /// No module is registered under the requested name.
    #[error("configuration item not found: {0}")]
    ConfigurationItemNotFound(String),

    /// Failure to send to an internal pipeline channel.
    #[error("pipeline channel send error: {0}")]
    UnableToSendToChannel(String),

    /// Failure to receive from an internal channel.
    #[error("channel receive error")]
    RecvChannelError(
        #[from]
        #[source]
        flume::RecvError,
    ),

    /// Error encountered reading from a connector.
    #[error("connector error: {0}")]
    ConnectorError(String),

    /// Record-to-statement mapping failed on the load path.
    #[error("mapping error (load): {0}")]
    MappingErrorLoad(String),

    /// Row-to-record mapping failed on the unload path.
    #[error("mapping error (unload): {0}")]
    MappingErrorUnload(String),

    /// Recoverable driver failure on execute (timeout, unavailable, write/read timeout).
    #[error("write error: {0}")]
    WriteError(String),

    /// Recoverable driver failure on fetch.
    #[error("read error: {0}")]
    ReadError(String),

    /// Argument validation, protocol error, or a programming-error root cause. Bypasses the
    /// error threshold and aborts the run immediately.
    #[error("unrecoverable driver error: {0}")]
    Unrecoverable(String),

    /// Emitted by the log manager once the configured error or warning threshold is crossed.
    /// Cancels all active workers.
    #[error("{0}")]
    TooManyErrors(String),

    /// Conditional check (`IF [NOT] EXISTS`) failed for a constituent statement.
    #[error("conditional check failed")]
    ConditionalCheckFailed,
}

/// Drains a possibly-nested error's `source()` chain into a flat list of display strings,
/// innermost cause last, used to render the `*-errors.log` cause chain.
pub fn cause_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut cur = err.source();
    while let Some(e) = cur {
        chain.push(e.to_string());
        cur = e.source();
    }
    chain
}

impl fmt::Display for ConnectorFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorFeature::IndexedRecords => write!(f, "INDEXED_RECORDS"),
            ConnectorFeature::MappedRecords => write!(f, "MAPPED_RECORDS"),
        }
    }
}

/// Map type used for generic string-keyed configuration overlays (`dotted.key=value` CLI
/// overrides land here before being merged into the parsed YAML tree).
pub type Overrides = HashMap<String, String>;
