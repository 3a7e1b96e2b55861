//! Wires the statement batcher, executor adapter, and log manager into a runnable pipeline,
//! picks a scheduling regime, and drives it to completion.
//!
//! The builder-style API (`from_config`/`set_label`/`set_threads`/`set_timeout`) and `run()` loop
//! race task completion against `tokio::signal::ctrl_c()`. This pipeline is a single
//! straight-line stage chain per run (one connector instance per configuration block), so the
//! orchestration collapses to one cooperatively-cancellable future raced against shutdown
//! signals rather than a `JoinSet` of many concurrent stage tasks.
mod count;
mod load;
mod unload;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ExecutionType, ParsedConfig, SchemaConfig};
use crate::executor::Executor;
use crate::log_manager::LogManager;
use crate::mapper::SimpleMapper;
use crate::modules::metrics::NoOpMetrics;
use crate::modules::register_builtins;
use crate::{Connector, Driver, Error, Metrics, Overrides, PreparedStatement};

/// Resource count at or above which the orchestrator prefers a dedicated worker per resource
/// over windowing a single flat stream.
const THREAD_PER_RESOURCE_THRESHOLD: usize = 4;

/// Default window size used by the parallel-windowed regime when batching is disabled.
const DEFAULT_WINDOW_SIZE: usize = 256;

static REGISTER: std::sync::Once = std::sync::Once::new();
static REGISTER_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// Which direction a run moves records: into the cluster, out of it, or a read-only tally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Records flow from the connector into the cluster.
    Load,
    /// Rows flow from the cluster out through the connector.
    Unload,
    /// Rows are tallied from the cluster; nothing is read or written by a connector.
    Count,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Load => "load",
            Direction::Unload => "unload",
            Direction::Count => "count",
        };
        write!(f, "{s}")
    }
}

/// Scheduling regime chosen from the connector's declared resource count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Regime {
    /// One worker per resource; `0` (unknown) and counts at or above the threshold both land
    /// here since both are treated as "large".
    ThreadPerResource,
    /// A single flat stream, windowed into chunks.
    ParallelWindowed,
}

fn scheduling_regime(resource_count: usize) -> Regime {
    if resource_count == 0 || resource_count >= THREAD_PER_RESOURCE_THRESHOLD {
        Regime::ThreadPerResource
    } else {
        Regime::ParallelWindowed
    }
}

/// A single configured load/unload/count pipeline, ready to run.
pub struct Runtime {
    config: ParsedConfig,
    timeout: Option<Duration>,
}

impl Runtime {
    /// Registers built-in plugins (once per process), parses, and validates `config`, returning
    /// a `Runtime` ready to run.
    pub async fn from_config(config: &str) -> Result<Self, Error> {
        Self::from_config_with_overrides(config, &Overrides::new()).await
    }

    /// As [`Runtime::from_config`], additionally applying `dotted.key=value` overrides before
    /// templating and validation.
    pub async fn from_config_with_overrides(config: &str, overrides: &Overrides) -> Result<Self, Error> {
        REGISTER.call_once(|| {
            if let Err(e) = register_builtins() {
                if let Ok(mut err) = REGISTER_ERROR.lock() {
                    *err = Some(e.to_string());
                }
            }
        });
        if let Ok(lock) = REGISTER_ERROR.lock() {
            if let Some(e) = lock.as_ref() {
                return Err(Error::ExecutionError(format!("plugin registration failed: {e}")));
            }
        }

        let parsed = Config::load(config, overrides)?;
        let config = parsed.validate().await?;
        debug!(label = config.label.as_deref().unwrap_or(""), "runtime configured");
        Ok(Runtime { config, timeout: None })
    }

    /// Sets (or clears) the pipeline's label, surfaced in logs and `effective-settings.log`.
    pub fn set_label(&mut self, label: Option<String>) -> Result<(), Error> {
        self.config.label = label;
        Ok(())
    }

    /// Returns the pipeline's current label, if any.
    pub fn get_label(&self) -> Option<String> {
        self.config.label.clone()
    }

    /// Overrides the configured worker pool size.
    pub fn set_threads(&mut self, count: usize) -> Result<(), Error> {
        self.config.num_threads = count.max(1);
        Ok(())
    }

    /// Sets (or clears) a wall-clock deadline after which the run is cancelled gracefully, the
    /// same way a `TooManyErrors` signal is.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        self.timeout = timeout;
        Ok(())
    }

    /// Overrides `engine.dryRun`.
    pub fn set_dry_run(&mut self, dry_run: bool) -> Result<(), Error> {
        self.config.engine.dry_run = dry_run;
        Ok(())
    }

    /// Runs the pipeline for the given `direction` to completion, returning a [`RunSummary`].
    ///
    /// Races the pipeline against `Ctrl+C` and an optional timeout; either cancels the pipeline
    /// cooperatively rather than aborting it outright.
    pub async fn run(&self, direction: Direction) -> Result<RunSummary, Error> {
        let started = Instant::now();
        let operation_dir = operation_directory(&self.config, direction);
        std::fs::create_dir_all(&operation_dir)?;
        write_effective_settings(&operation_dir, &self.config, direction)?;

        let cancellation = CancellationToken::new();
        let log_manager = LogManager::new(
            operation_dir.clone(),
            self.config.max_errors,
            self.config.log.max_query_warnings,
            cancellation.clone(),
        );

        let mut metrics = build_metrics(&self.config).await?;
        let driver: Arc<dyn Driver + Send + Sync> = Arc::from(build_driver(&self.config).await?);
        let mut connector = build_connector(&self.config).await?;
        connector.init().await?;
        let resource = connector.current_resource().to_string();

        let resource_count = connector.estimated_resource_count();
        let regime = scheduling_regime(resource_count);
        let cores = num_cpus::get().max(1);
        let per_worker_in_flight = (self.config.executor.max_in_flight / cores).max(32);
        debug!(?regime, resource_count, per_worker_in_flight, "scheduling regime selected");

        let executor = Executor::new(Arc::clone(&driver), per_worker_in_flight);

        let field_names = connector.record_metadata().field_names;
        let mapper = build_mapper(&self.config.schema, &field_names)?;
        let dry_run = self.config.engine.dry_run;

        info!(label = self.config.label.as_deref().unwrap_or(""), %direction, "pipeline started");

        let pipeline = run_direction(
            direction,
            &self.config.schema,
            &mapper,
            connector.as_mut(),
            driver.as_ref(),
            &executor,
            &log_manager,
            metrics.as_ref(),
            &self.config.batch,
            &resource,
            dry_run,
            cancellation.clone(),
        );
        tokio::pin!(pipeline);

        let deadline = self.timeout.map(|d| tokio::time::Instant::now() + d);
        let outcome: Result<Option<u64>, Error> = loop {
            tokio::select! {
                res = &mut pipeline => break res,
                _ = tokio::signal::ctrl_c(), if !cancellation.is_cancelled() => {
                    warn!("received Ctrl+C, shutting down gracefully");
                    cancellation.cancel();
                }
                _ = wait_for_deadline(deadline), if deadline.is_some() && !cancellation.is_cancelled() => {
                    warn!("run exceeded its configured timeout, shutting down gracefully");
                    cancellation.cancel();
                }
            }
        };

        // Close order: metrics, log manager, connector; the executor holds no resources of its
        // own, and the driver (session) releases via `Drop` on its last `Arc` reference.
        metrics.close().await?;
        log_manager.close()?;
        connector.close().await?;

        let errors = log_manager.error_count();
        let elapsed = started.elapsed();

        match outcome {
            Ok(rows) => Ok(RunSummary {
                errors,
                elapsed,
                operation_dir,
                abort_message: None,
                rows_counted: rows,
            }),
            Err(Error::TooManyErrors(msg)) => Ok(RunSummary {
                errors,
                elapsed,
                operation_dir,
                abort_message: Some(msg),
                rows_counted: None,
            }),
            Err(e) => Err(e),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_direction(
    direction: Direction,
    schema: &SchemaConfig,
    mapper: &SimpleMapper,
    connector: &mut (dyn Connector + Send + Sync),
    driver: &dyn Driver,
    executor: &Executor,
    log_manager: &LogManager,
    metrics: &dyn Metrics,
    batch_config: &crate::config::BatchConfig,
    resource: &str,
    dry_run: bool,
    cancellation: CancellationToken,
) -> Result<Option<u64>, Error> {
    match direction {
        Direction::Load => {
            let cql = schema_statement_load(schema, mapper)?;
            let prepared = if dry_run {
                PreparedStatement {
                    id: Arc::from("dry-run"),
                    cql: Arc::from(cql.as_str()),
                }
            } else {
                driver.prepare(&cql).await?
            };
            load::run_load_worker(
                connector,
                mapper,
                driver,
                executor,
                log_manager,
                metrics,
                &prepared,
                batch_config,
                dry_run,
                cancellation,
            )
            .await?;
            Ok(None)
        }
        Direction::Unload => {
            let cql = schema_statement_unload(schema, mapper)?;
            if !dry_run {
                unload::run_unload_worker(connector, mapper, executor, log_manager, metrics, &cql, resource, cancellation).await?;
            }
            Ok(None)
        }
        Direction::Count => {
            let cql = schema_statement_unload(schema, mapper)?;
            if dry_run {
                Ok(Some(0))
            } else {
                let n = count::run_count_worker(executor, log_manager, metrics, &cql, cancellation).await?;
                Ok(Some(n))
            }
        }
    }
}

async fn wait_for_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn build_connector(config: &ParsedConfig) -> Result<Box<dyn Connector + Send + Sync>, Error> {
    match (config.connector.creator)(config.connector.config.clone()).await? {
        ExecutionType::Connector(c) => Ok(c),
        _ => Err(Error::ExecutionError("registered connector constructed a non-connector plugin".into())),
    }
}

async fn build_driver(config: &ParsedConfig) -> Result<Box<dyn Driver + Send + Sync>, Error> {
    match (config.driver.creator)(config.driver.config.clone()).await? {
        ExecutionType::Driver(d) => Ok(d),
        _ => Err(Error::ExecutionError("registered driver constructed a non-driver plugin".into())),
    }
}

async fn build_metrics(config: &ParsedConfig) -> Result<Box<dyn Metrics + Send + Sync>, Error> {
    match &config.metrics {
        Some(item) => match (item.creator)(item.config.clone()).await? {
            ExecutionType::Metrics(m) => Ok(m),
            _ => Err(Error::ExecutionError("registered metrics constructed a non-metrics plugin".into())),
        },
        None => Ok(Box::new(NoOpMetrics::new())),
    }
}

fn build_mapper(schema: &SchemaConfig, field_names: &[String]) -> Result<SimpleMapper, Error> {
    let mapper = SimpleMapper::parse(schema.mapping.as_deref(), field_names)?;
    Ok(match &schema.partition_key {
        Some(keys) if !keys.is_empty() => mapper.with_partition_key(keys.clone()),
        _ => mapper,
    })
}

/// Builds the load-direction `INSERT` statement from `schema`, or returns `schema.query`
/// verbatim when a custom query is configured.
fn schema_statement_load(schema: &SchemaConfig, mapper: &SimpleMapper) -> Result<String, Error> {
    if let Some(query) = &schema.query {
        return Ok(query.clone());
    }
    let keyspace = schema
        .keyspace
        .as_deref()
        .ok_or_else(|| Error::ConfigFailedValidation("schema.keyspace is required without schema.query".into()))?;
    let table = schema
        .table
        .as_deref()
        .ok_or_else(|| Error::ConfigFailedValidation("schema.table is required without schema.query".into()))?;
    let columns = mapper.columns();
    if columns.is_empty() {
        return Err(Error::ConfigFailedValidation("schema.mapping produced no columns to insert".into()));
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(format!("INSERT INTO {keyspace}.{table} ({}) VALUES ({placeholders})", columns.join(", ")))
}

/// Builds the unload/count-direction `SELECT` statement from `schema`, or returns `schema.query`
/// verbatim when a custom query is configured.
fn schema_statement_unload(schema: &SchemaConfig, mapper: &SimpleMapper) -> Result<String, Error> {
    if let Some(query) = &schema.query {
        return Ok(query.clone());
    }
    let keyspace = schema
        .keyspace
        .as_deref()
        .ok_or_else(|| Error::ConfigFailedValidation("schema.keyspace is required without schema.query".into()))?;
    let table = schema
        .table
        .as_deref()
        .ok_or_else(|| Error::ConfigFailedValidation("schema.table is required without schema.query".into()))?;
    let columns = mapper.columns();
    let select_list = if columns.is_empty() { "*".to_string() } else { columns.join(", ") };
    Ok(format!("SELECT {select_list} FROM {keyspace}.{table}"))
}

/// Resolves the operation directory: `<log.directory>/<executionId>/`, where `executionId`
/// defaults to `<direction>_<UTC timestamp>` and may be overridden by `engine.executionId`,
/// which supports a `{date}` placeholder.
fn operation_directory(config: &ParsedConfig, direction: Direction) -> PathBuf {
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let execution_id = match &config.engine.execution_id {
        Some(template) => template.replace("{date}", &timestamp),
        None => format!("{direction}_{timestamp}"),
    };
    config.log.directory.join(execution_id)
}

/// Writes a human-readable snapshot of the resolved, non-plugin configuration.
fn write_effective_settings(dir: &std::path::Path, config: &ParsedConfig, direction: Direction) -> Result<(), Error> {
    let mut out = String::new();
    out.push_str(&format!("direction: {direction}\n"));
    out.push_str(&format!("label: {}\n", config.label.as_deref().unwrap_or("-")));
    out.push_str(&format!("num_threads: {}\n", config.num_threads));
    out.push_str(&format!("engine.dryRun: {}\n", config.engine.dry_run));
    out.push_str(&format!("log.maxErrors: {}\n", config.log.max_errors));
    out.push_str(&format!("log.maxQueryWarnings: {}\n", config.log.max_query_warnings));
    out.push_str(&format!("log.directory: {}\n", config.log.directory.display()));
    out.push_str(&format!("executor.maxInFlight: {}\n", config.executor.max_in_flight));
    out.push_str(&format!("batch.enabled: {}\n", config.batch.enabled));
    out.push_str(&format!("batch.mode: {:?}\n", config.batch.mode));
    out.push_str(&format!("batch.maxBatchStatements: {}\n", config.batch.max_batch_statements));
    out.push_str(&format!("batch.maxBatchSizeBytes: {}\n", config.batch.max_batch_size_bytes));
    out.push_str(&format!("schema.keyspace: {}\n", config.schema.keyspace.as_deref().unwrap_or("-")));
    out.push_str(&format!("schema.table: {}\n", config.schema.table.as_deref().unwrap_or("-")));
    std::fs::write(dir.join("effective-settings.log"), out)?;
    Ok(())
}

fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// The outcome of one `Runtime::run` call, printed by the CLI binary (the library itself never
/// prints anything; that stays the caller's responsibility).
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// Total data errors recorded across every category.
    pub errors: u64,
    /// Wall-clock time the run took.
    pub elapsed: Duration,
    /// The operation directory every artifact was written under.
    pub operation_dir: PathBuf,
    /// Set when the run was aborted by a crossed threshold, carrying the threshold's message.
    pub abort_message: Option<String>,
    /// Row count tallied by a `count` direction run.
    pub rows_counted: Option<u64>,
}

impl RunSummary {
    /// Whether this run was aborted by a crossed error/warning threshold.
    pub fn aborted(&self) -> bool {
        self.abort_message.is_some()
    }

    /// The process exit code this summary implies: `0` success, `1` completed with errors, `3`
    /// aborted by threshold. (`2`, configuration error, never reaches a `RunSummary` — it is
    /// returned as an `Err` before the pipeline starts.)
    pub fn exit_code(&self) -> i32 {
        if self.aborted() {
            3
        } else if self.errors > 0 {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(msg) = &self.abort_message {
            writeln!(f, "{msg}")?;
            writeln!(f, "aborted after {}", format_duration(self.elapsed))?;
        } else if self.errors > 0 {
            writeln!(f, "completed with {} errors in {}", self.errors, format_duration(self.elapsed))?;
        } else {
            writeln!(f, "completed successfully in {}", format_duration(self.elapsed))?;
        }
        if let Some(rows) = self.rows_counted {
            writeln!(f, "{rows} rows")?;
        }
        write!(f, "{}", self.operation_dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regime_picks_thread_per_resource_for_unknown_count() {
        assert_eq!(scheduling_regime(0), Regime::ThreadPerResource);
    }

    #[test]
    fn regime_picks_thread_per_resource_at_threshold() {
        assert_eq!(scheduling_regime(4), Regime::ThreadPerResource);
    }

    #[test]
    fn regime_picks_parallel_windowed_below_threshold() {
        assert_eq!(scheduling_regime(1), Regime::ParallelWindowed);
        assert_eq!(scheduling_regime(3), Regime::ParallelWindowed);
    }

    #[test]
    fn summary_reports_success_exit_code_zero() {
        let summary = RunSummary {
            errors: 0,
            elapsed: Duration::from_secs(5),
            operation_dir: PathBuf::from("/tmp/op"),
            abort_message: None,
            rows_counted: None,
        };
        assert_eq!(summary.exit_code(), 0);
        assert!(summary.to_string().starts_with("completed successfully in 00:00:05"));
    }

    #[test]
    fn summary_reports_errors_exit_code_one() {
        let summary = RunSummary {
            errors: 3,
            elapsed: Duration::from_secs(65),
            operation_dir: PathBuf::from("/tmp/op"),
            abort_message: None,
            rows_counted: None,
        };
        assert_eq!(summary.exit_code(), 1);
        assert!(summary.to_string().contains("completed with 3 errors in 00:01:05"));
    }

    #[test]
    fn summary_reports_abort_exit_code_three() {
        let summary = RunSummary {
            errors: 1,
            elapsed: Duration::from_secs(1),
            operation_dir: PathBuf::from("/tmp/op"),
            abort_message: Some("Too many errors, the maximum allowed is 0.".into()),
            rows_counted: None,
        };
        assert_eq!(summary.exit_code(), 3);
        assert!(summary.to_string().starts_with("Too many errors"));
    }

    #[test]
    fn execution_id_template_substitutes_date() {
        let mut config_str = String::from(
            "engine:\n  executionId: \"myjob_{date}\"\nconnector:\n  file:\n    path: x\ndriver:\n  mock: {}\n",
        );
        config_str.push('\n');
        let config: Config = config_str.parse().unwrap();
        assert_eq!(config.engine.execution_id.as_deref(), Some("myjob_{date}"));
    }
}
