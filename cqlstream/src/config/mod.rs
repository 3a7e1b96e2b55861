//! Declarative YAML configuration: parsing, environment templating, and per-plugin schema
//! validation.
use handlebars::Handlebars;
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, trace};

use core::future::Future;
use std::pin::Pin;

use crate::batcher::BatchMode;
use crate::{Connector, Driver, Error, ErrorThreshold, Metrics, Overrides};

mod registration;
mod validate;
pub use registration::register_plugin;
pub(crate) use validate::parse_configuration_item;

/// Callback provides the pinned async function that creates the module supplied to the
/// runtime from its validated configuration value.
pub type Callback = fn(Value) -> Pin<Box<dyn Future<Output = Result<ExecutionType, Error>> + Send>>;

/// Plugin category used for registration of cqlstream modules.
#[derive(PartialEq, Eq, Hash, Clone)]
pub enum ItemType {
    /// [crate::Connector] variant.
    Connector,
    /// [crate::Driver] variant.
    Driver,
    /// [crate::Metrics] backend variant.
    Metrics,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ItemType::Connector => "connector",
            ItemType::Driver => "driver",
            ItemType::Metrics => "metrics",
        };
        write!(f, "{}", msg)
    }
}

/// Holds the constructed implementation of a registered plugin, ready for use by the runtime.
pub enum ExecutionType {
    /// [crate::Connector] variant.
    Connector(Box<dyn Connector + Send + Sync>),
    /// [crate::Driver] variant.
    Driver(Box<dyn Driver + Send + Sync>),
    /// Metrics backend variant.
    Metrics(Box<dyn Metrics + Send + Sync>),
}

static ENV: Lazy<Mutex<HashMap<ItemType, HashMap<String, RegisteredItem>>>> = Lazy::new(|| {
    let mut m = HashMap::new();
    let _ = m.insert(ItemType::Connector, HashMap::new());
    let _ = m.insert(ItemType::Driver, HashMap::new());
    let _ = m.insert(ItemType::Metrics, HashMap::new());
    Mutex::new(m)
});

/// Parsed and validated configuration item, held by the registry.
#[derive(Clone)]
pub(crate) struct RegisteredItem {
    pub creator: Callback,
    pub format: ConfigSpec,
}

/// A registered item paired with the (validated, still-raw) YAML value it will be constructed
/// from.
#[derive(Clone)]
pub(crate) struct ParsedRegisteredItem {
    pub creator: Callback,
    pub config: Value,
}

/// Unparsed single-key configuration item (e.g. the `connector:` or `driver:` block) prior to
/// validation.
#[derive(Debug, Deserialize, Serialize, Default)]
pub(crate) struct Item {
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// `log.*` settings controlling the log manager.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Data error threshold, absolute count or `N%` ratio form.
    #[serde(default = "LogConfig::default_max_errors")]
    pub max_errors: String,
    /// Warning threshold (absolute count).
    #[serde(default = "LogConfig::default_max_query_warnings")]
    pub max_query_warnings: u64,
    /// Output root directory for the operation directory.
    #[serde(default = "LogConfig::default_directory")]
    pub directory: PathBuf,
    /// Statement/row formatting verbosity, `0..=3`.
    #[serde(default)]
    pub verbosity: u8,
}

impl LogConfig {
    fn default_max_errors() -> String {
        "unlimited".into()
    }
    fn default_max_query_warnings() -> u64 {
        100
    }
    fn default_directory() -> PathBuf {
        PathBuf::from("./logs")
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            max_errors: Self::default_max_errors(),
            max_query_warnings: Self::default_max_query_warnings(),
            directory: Self::default_directory(),
            verbosity: 0,
        }
    }
}

/// `executor.*` settings controlling concurrency bounds.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Global in-flight statement cap, divided across workers.
    #[serde(default = "ExecutorConfig::default_max_in_flight")]
    pub max_in_flight: usize,
    /// Optional rate cap, in statements per second.
    pub max_per_second: Option<u64>,
}

impl ExecutorConfig {
    fn default_max_in_flight() -> usize {
        // mirrors dsbulk's default of 1024 concurrent requests
        1024
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            max_in_flight: Self::default_max_in_flight(),
            max_per_second: None,
        }
    }
}

/// `batch.*` settings controlling the statement batcher.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    /// Whether statements are grouped into batches at all. The pipeline stage is optional;
    /// disabling it sends each statement to the executor individually.
    #[serde(default = "BatchConfig::default_enabled")]
    pub enabled: bool,
    /// `PARTITION_KEY` or `REPLICA_SET` grouping mode.
    #[serde(default)]
    pub mode: BatchMode,
    /// Number of groups the batcher may hold open concurrently before forcing a flush.
    #[serde(default = "BatchConfig::default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum statements per output batch.
    #[serde(default = "BatchConfig::default_max_batch_statements")]
    pub max_batch_statements: usize,
    /// Maximum estimated byte size per output batch.
    #[serde(default = "BatchConfig::default_max_batch_size_bytes")]
    pub max_batch_size_bytes: usize,
}

impl BatchConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_buffer_size() -> usize {
        128
    }
    fn default_max_batch_statements() -> usize {
        32
    }
    fn default_max_batch_size_bytes() -> usize {
        65536
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            enabled: Self::default_enabled(),
            mode: BatchMode::default(),
            buffer_size: Self::default_buffer_size(),
            max_batch_statements: Self::default_max_batch_statements(),
            max_batch_size_bytes: Self::default_max_batch_size_bytes(),
        }
    }
}

/// `schema.*` settings describing the load/unload target.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SchemaConfig {
    /// Target keyspace.
    pub keyspace: Option<String>,
    /// Target table.
    pub table: Option<String>,
    /// Field-to-column mapping expression, e.g. `field1 = col1, field2 = col2`.
    pub mapping: Option<String>,
    /// A fully custom CQL query, used instead of `keyspace`/`table`/`mapping` when present.
    pub query: Option<String>,
    /// Record fields that form the partition key, used to derive a statement's routing key for
    /// token-aware batching. Required for `batch.mode: partitionKey`/`replicaSet` to have any
    /// effect beyond grouping everything into a single partition.
    pub partition_key: Option<Vec<String>>,
}

/// `engine.*` settings controlling the overall run.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Skip execution, validating mapping only.
    #[serde(default)]
    pub dry_run: bool,
    /// Template for the operation directory name. Supports `{date}` substitution.
    pub execution_id: Option<String>,
}

/// Unparsed top-level configuration, as loaded from YAML.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Optional pipeline label, surfaced in logs and `effective-settings.log`.
    pub label: Option<String>,
    /// Worker pool size; defaults to the number of CPU cores.
    pub num_threads: Option<usize>,
    /// `engine.*` settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// `log.*` settings.
    #[serde(default)]
    pub log: LogConfig,
    /// `executor.*` settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// `batch.*` settings.
    #[serde(default)]
    pub batch: BatchConfig,
    /// `schema.*` settings.
    #[serde(default)]
    pub schema: SchemaConfig,
    /// `connector:` single-key block, following the [crate::Connector] trait.
    #[serde(default)]
    pub connector: Item,
    /// `driver:` single-key block, following the [crate::Driver] trait.
    #[serde(default)]
    pub driver: Item,
    /// Optional `metrics:` single-key block.
    pub metrics: Option<Item>,
}

impl FromStr for Config {
    type Err = Error;
    fn from_str(conf: &str) -> Result<Self, Self::Err> {
        let environment_variables: HashMap<String, String> = env::vars().collect();

        let mut handle_bars = Handlebars::new();
        handle_bars.set_strict_mode(true);

        let populated_config = handle_bars
            .render_template(conf, &environment_variables)
            .map_err(|e| Error::ConfigFailedValidation(format!("{e}")))?;

        let config: Config = serde_yaml::from_str(&populated_config)?;
        Ok(config)
    }
}

impl Config {
    /// Loads configuration from a YAML string, then applies `dotted.key=value` CLI overrides
    /// before templating and parsing into a `Config`.
    pub fn load(raw: &str, overrides: &Overrides) -> Result<Self, Error> {
        let merged = apply_overrides(raw, overrides)?;
        Config::from_str(&merged)
    }

    /// Validates the configuration, resolving each plugin block against the registry.
    ///
    /// Plugins must be registered with the registry prior to calling `validate`; this happens
    /// automatically when constructing a [`crate::Runtime`] via `from_config`.
    pub async fn validate(self) -> Result<ParsedConfig, Error> {
        if self.connector.extra.len() != 1 {
            error!("connector must contain exactly one entry");
            return Err(Error::Validation(
                "connector must contain exactly one entry".into(),
            ));
        }
        if self.driver.extra.len() != 1 {
            error!("driver must contain exactly one entry");
            return Err(Error::Validation(
                "driver must contain exactly one entry".into(),
            ));
        }

        let connector = parse_configuration_item(ItemType::Connector, &self.connector.extra).await?;
        let driver = parse_configuration_item(ItemType::Driver, &self.driver.extra).await?;

        let metrics = match &self.metrics {
            Some(item) => Some(parse_configuration_item(ItemType::Metrics, &item.extra).await?),
            None => None,
        };

        let max_errors = ErrorThreshold::parse(&self.log.max_errors)?;
        let num_threads = self.num_threads.unwrap_or_else(num_cpus::get);
        trace!("num threads are {}", num_threads);
        debug!("configuration is valid");

        Ok(ParsedConfig {
            label: self.label,
            num_threads,
            engine: self.engine,
            log: self.log,
            max_errors,
            executor: self.executor,
            batch: self.batch,
            schema: self.schema,
            connector,
            driver,
            metrics,
        })
    }
}

/// Parsed and validated configuration, ready to build a [`crate::Runtime`] from.
#[derive(Clone)]
pub struct ParsedConfig {
    /// Optional pipeline label.
    pub label: Option<String>,
    /// Worker pool size.
    pub num_threads: usize,
    /// `engine.*` settings.
    pub engine: EngineConfig,
    /// `log.*` settings.
    pub log: LogConfig,
    /// Parsed `log.maxErrors` threshold.
    pub max_errors: ErrorThreshold,
    /// `executor.*` settings.
    pub executor: ExecutorConfig,
    /// `batch.*` settings.
    pub batch: BatchConfig,
    /// `schema.*` settings.
    pub schema: SchemaConfig,
    /// Resolved connector plugin and its validated configuration.
    pub(crate) connector: ParsedRegisteredItem,
    /// Resolved driver plugin and its validated configuration.
    pub(crate) driver: ParsedRegisteredItem,
    /// Resolved metrics plugin and its validated configuration, if configured.
    pub(crate) metrics: Option<ParsedRegisteredItem>,
}

/// Applies `dotted.key=value` overrides to a raw YAML document by walking (and creating, if
/// absent) the nested mapping path each override names.
pub fn apply_overrides(raw: &str, overrides: &Overrides) -> Result<String, Error> {
    if overrides.is_empty() {
        return Ok(raw.to_string());
    }
    let mut root: Value = serde_yaml::from_str(raw)?;
    for (path, value) in overrides {
        set_by_path(&mut root, path, value);
    }
    Ok(serde_yaml::to_string(&root)?)
}

fn set_by_path(root: &mut Value, path: &str, value: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut cursor = root;
    for segment in &segments[..segments.len() - 1] {
        if !matches!(cursor, Value::Mapping(_)) {
            *cursor = Value::Mapping(serde_yaml::Mapping::new());
        }
        let Value::Mapping(map) = cursor else {
            unreachable!()
        };
        cursor = map
            .entry(Value::String((*segment).to_string()))
            .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
    }
    if !matches!(cursor, Value::Mapping(_)) {
        *cursor = Value::Mapping(serde_yaml::Mapping::new());
    }
    let Value::Mapping(map) = cursor else {
        unreachable!()
    };
    let parsed_value: Value =
        serde_yaml::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    let _ = map.insert(
        Value::String(segments[segments.len() - 1].to_string()),
        parsed_value,
    );
}

/// A compiled JSON Schema used to validate one plugin's configuration block.
///
/// Uses `Arc` internally so cloning is cheap and the schema is only compiled once.
pub struct ConfigSpec {
    raw_schema: String,
    schema: Arc<JSONSchema>,
}

impl std::fmt::Debug for ConfigSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSpec")
            .field("raw_schema", &self.raw_schema)
            .finish()
    }
}

impl Clone for ConfigSpec {
    fn clone(&self) -> Self {
        ConfigSpec {
            raw_schema: self.raw_schema.clone(),
            schema: Arc::clone(&self.schema),
        }
    }
}

impl ConfigSpec {
    /// Compiles a validation schema, given in YAML (converted internally to JSON for the
    /// `jsonschema` crate).
    pub fn from_schema(conf: &str) -> Result<Self, Error> {
        let v: Value = serde_yaml::from_str(conf)?;
        let intermediate = serde_json::to_string(&v)?;
        let f: serde_json::Value = serde_json::from_str(&intermediate)?;

        let schema: JSONSchema = match JSONSchema::options().with_draft(Draft::Draft7).compile(&f) {
            Ok(js) => js,
            Err(e) => return Err(Error::InvalidValidationSchema(format!("{e}"))),
        };

        trace!("json schema is valid");

        Ok(ConfigSpec {
            raw_schema: conf.into(),
            schema: Arc::new(schema),
        })
    }

    /// Validates a YAML configuration block against this schema.
    pub fn validate(&self, content: &str) -> Result<(), Error> {
        let v: Value = serde_yaml::from_str(content)?;
        let intermediate = serde_json::to_string(&v)?;
        let f: serde_json::Value = serde_json::from_str(&intermediate)?;
        let result = self.schema.validate(&f);
        if let Err(errors) = result {
            let errs: Vec<String> = errors.into_iter().map(|i| format!("{i}")).collect();
            error!(
                number_of_failures = errs.len(),
                errors = errs.join(" "),
                "validation failed"
            );
            return Err(Error::ConfigFailedValidation(errs.join(" ")));
        }
        Ok(())
    }
}
