use async_trait::async_trait;
use cqlstream_macros::registration_fn;
use serde_yaml::Value;
use tokio::io::{AsyncWriteExt, Stdout};

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Closer, Connector, Error, Record};

const STDOUT_RESOURCE: &str = "stdout:///";

/// Writes records to standard output, one line per record (unload direction).
pub struct StdoutConnector {
    stdout: Stdout,
}

impl Closer for StdoutConnector {
    // `tokio::io::Stdout` flushes its own buffering internally; nothing further to release.
}

#[async_trait]
impl Connector for StdoutConnector {
    async fn write(&mut self, record: &Record) -> Result<(), Error> {
        let line = match record {
            Record::Ok { fields, .. } => serde_yaml::to_string(fields)?.trim_end().to_string(),
            Record::Error { cause, .. } => {
                return Err(Error::ConnectorError(format!("cannot write error record: {cause}")))
            }
        };
        self.stdout
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(Error::from)
    }

    fn current_resource(&self) -> &str {
        STDOUT_RESOURCE
    }
}

#[registration_fn]
fn create_stdout(_conf: Value) -> Result<ExecutionType, Error> {
    Ok(ExecutionType::Connector(Box::new(StdoutConnector {
        stdout: tokio::io::stdout(),
    })))
}

pub(super) fn register_stdout() -> Result<(), Error> {
    let config = "type: object";
    let conf_spec = ConfigSpec::from_schema(config)?;
    register_plugin("stdout".into(), ItemType::Connector, conf_spec, create_stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_plugin() {
        register_stdout().unwrap();
    }
}
