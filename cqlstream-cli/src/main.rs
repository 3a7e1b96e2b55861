//! Command-line front end for the `cqlstream` streaming execution core: parses a declarative
//! configuration file, wires it to a [`Runtime`], and drives one `load`/`unload`/`count` run or
//! validates a configuration without running it.
use std::fs;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use cqlstream::{Direction, Error, Overrides, Runtime};

#[derive(Parser)]
#[command(name = "cqlstream")]
#[command(bin_name = "cqlstream")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Logging verbosity; unset disables the subscriber entirely.
    #[arg(long, value_enum, default_value = "none", global = true)]
    log_level: LogLevel,
}

#[derive(clap::ValueEnum, Clone, Default, Debug)]
enum LogLevel {
    Info,
    Debug,
    Trace,
    Error,
    #[default]
    None,
}

#[derive(Subcommand)]
enum Command {
    /// Stream records from a connector into the cluster.
    Load(RunArgs),
    /// Stream rows out of the cluster through a connector.
    Unload(RunArgs),
    /// Tally the rows a query would return, without writing them anywhere.
    Count(RunArgs),
    /// Parse and validate one or more configuration files without running them.
    Validate(ValidateArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the configuration file.
    #[arg(short = 'f', long = "config")]
    config: String,
    /// Overrides `engine.executionId`; supports a `{date}` placeholder.
    #[arg(long = "executionId")]
    execution_id: Option<String>,
    /// Skip execution; validate mapping only.
    #[arg(long = "dryRun")]
    dry_run: bool,
    /// Shorthand for overriding the configured connector name.
    #[arg(short = 'c', long = "connector")]
    connector: Option<String>,
    /// Abort the run gracefully after this many seconds.
    #[arg(long = "timeoutSeconds")]
    timeout_seconds: Option<u64>,
    /// Optional pipeline label, surfaced in logs and `effective-settings.log`.
    #[arg(long)]
    label: Option<String>,
    /// `dotted.key=value` configuration overrides, applied before templating.
    #[arg(value_parser = parse_override)]
    overrides: Vec<(String, String)>,
}

#[derive(Args)]
struct ValidateArgs {
    /// Configuration files to validate.
    #[arg(short = 'f', long = "config")]
    config: Vec<String>,
}

fn parse_override(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected dotted.key=value, got `{raw}`"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_subscriber(&cli.log_level);

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            exit_code(2)
        }
    }
}

async fn dispatch(command: Command) -> Result<ExitCode, Error> {
    match command {
        Command::Validate(args) => validate(args).await,
        Command::Load(args) => run(Direction::Load, args).await,
        Command::Unload(args) => run(Direction::Unload, args).await,
        Command::Count(args) => run(Direction::Count, args).await,
    }
}

async fn validate(args: ValidateArgs) -> Result<ExitCode, Error> {
    let mut failures = Vec::new();
    for path in &args.config {
        let raw = read_config(path)?;
        if let Err(e) = Runtime::from_config(&raw).await {
            failures.push(format!("{path}: {e}"));
        }
    }

    if failures.is_empty() {
        println!("configuration is valid");
        return Ok(exit_code(0));
    }
    for f in &failures {
        eprintln!("{f}");
    }
    Ok(exit_code(2))
}

async fn run(direction: Direction, args: RunArgs) -> Result<ExitCode, Error> {
    let raw = read_config(&args.config)?;
    let raw = match &args.connector {
        Some(name) => select_connector(&raw, name)?,
        None => raw,
    };

    let mut overrides: Overrides = args.overrides.into_iter().collect();
    if let Some(execution_id) = &args.execution_id {
        let _ = overrides.insert("engine.executionId".to_string(), execution_id.clone());
    }

    let mut runtime = Runtime::from_config_with_overrides(&raw, &overrides).await?;
    if let Some(label) = args.label {
        runtime.set_label(Some(label))?;
    }
    if args.dry_run {
        runtime.set_dry_run(true)?;
    }
    if let Some(secs) = args.timeout_seconds {
        runtime.set_timeout(Some(Duration::from_secs(secs)))?;
    }

    let summary = runtime.run(direction).await?;
    println!("{summary}");
    Ok(exit_code(summary.exit_code()))
}

/// Applies `-c <connector>`: the `connector:` block is keyed by the plugin's own registered
/// name (no separate `name` field to override), so selecting a different connector means
/// replacing the block's single key outright. An existing block already keyed by `name` is left
/// untouched, so `-c` combines with trailing `connector.<name>.field=value` overrides to fill in
/// settings for a freshly selected connector.
fn select_connector(raw: &str, name: &str) -> Result<String, Error> {
    let mut root: serde_yaml::Value = serde_yaml::from_str(raw)?;
    let serde_yaml::Value::Mapping(root_map) = &mut root else {
        return Err(Error::ConfigFailedValidation("configuration root must be a mapping".into()));
    };

    let already_selected = root_map
        .get("connector")
        .and_then(|c| c.as_mapping())
        .is_some_and(|m| m.len() == 1 && m.contains_key(name));
    if !already_selected {
        let mut block = serde_yaml::Mapping::new();
        let _ = block.insert(serde_yaml::Value::String(name.to_string()), serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
        let _ = root_map.insert(serde_yaml::Value::String("connector".to_string()), serde_yaml::Value::Mapping(block));
    }

    Ok(serde_yaml::to_string(&root)?)
}

fn read_config(path: &str) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|e| Error::ConfigurationItemNotFound(format!("cannot read {path}: {e}")))
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn setup_subscriber(log_level: &LogLevel) {
    let level = match log_level {
        LogLevel::Debug => Some(LevelFilter::DEBUG),
        LogLevel::Error => Some(LevelFilter::ERROR),
        LogLevel::Info => Some(LevelFilter::INFO),
        LogLevel::Trace => Some(LevelFilter::TRACE),
        LogLevel::None => None,
    };

    let Some(level) = level else { return };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::OFF.into())
        .from_env()
        .unwrap_or_else(|_| EnvFilter::new(""))
        .add_directive(format!("cqlstream={level}").parse().expect("valid directive"));

    tracing_subscriber::fmt().with_env_filter(filter).compact().json().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_parses_dotted_key_value() {
        assert_eq!(parse_override("log.maxErrors=5").unwrap(), ("log.maxErrors".to_string(), "5".to_string()));
    }

    #[test]
    fn override_rejects_missing_equals() {
        assert!(parse_override("log.maxErrors").is_err());
    }

    #[test]
    fn select_connector_replaces_differing_block() {
        let raw = "connector:\n  file:\n    path: in.csv\n";
        let merged = select_connector(raw, "stdin").unwrap();
        let v: serde_yaml::Value = serde_yaml::from_str(&merged).unwrap();
        let connector = v.get("connector").unwrap().as_mapping().unwrap();
        assert_eq!(connector.len(), 1);
        assert!(connector.contains_key("stdin"));
    }

    #[test]
    fn select_connector_preserves_matching_block() {
        let raw = "connector:\n  file:\n    path: in.csv\n";
        let merged = select_connector(raw, "file").unwrap();
        let v: serde_yaml::Value = serde_yaml::from_str(&merged).unwrap();
        assert_eq!(v.get("connector").unwrap().get("file").unwrap().get("path").unwrap().as_str(), Some("in.csv"));
    }

    #[test]
    fn exit_code_maps_i32_to_exit_code() {
        let _ = exit_code(0);
        let _ = exit_code(3);
    }
}
