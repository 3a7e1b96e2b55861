use async_trait::async_trait;
use cqlstream_macros::registration_fn;
use serde_yaml::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Closer, Connector, Error, Provenance, Record};

const STDIN_RESOURCE: &str = "stdin:///";

/// Reads newline-delimited records from standard input as a single resource.
///
/// Grounded on `modules::inputs::stdin::StdIn`, adapted to `tokio::io` (already a dependency of
/// this crate) rather than `async_std`.
pub struct StdinConnector {
    lines: tokio::io::Lines<BufReader<Stdin>>,
    position: u64,
    exhausted: bool,
}

impl Closer for StdinConnector {}

#[async_trait]
impl Connector for StdinConnector {
    async fn read(&mut self) -> Result<Record, Error> {
        if self.exhausted {
            return Err(Error::EndOfInput);
        }
        match self.lines.next_line().await {
            Ok(Some(line)) => {
                self.position += 1;
                Ok(Record::Ok {
                    provenance: Provenance {
                        resource: std::sync::Arc::from(STDIN_RESOURCE),
                        position: self.position,
                        source: Some(std::sync::Arc::from(line.as_str())),
                    },
                    fields: Default::default(),
                })
            }
            Ok(None) => {
                self.exhausted = true;
                Err(Error::EndOfInput)
            }
            Err(e) => {
                self.exhausted = true;
                Err(Error::ConnectorError(format!("stdin: {e}")))
            }
        }
    }

    fn current_resource(&self) -> &str {
        STDIN_RESOURCE
    }
}

#[registration_fn]
fn create_stdin(_conf: Value) -> Result<ExecutionType, Error> {
    Ok(ExecutionType::Connector(Box::new(StdinConnector {
        lines: BufReader::new(tokio::io::stdin()).lines(),
        position: 0,
        exhausted: false,
    })))
}

pub(super) fn register_stdin() -> Result<(), Error> {
    let config = "type: object";
    let conf_spec = ConfigSpec::from_schema(config)?;
    register_plugin("stdin".into(), ItemType::Connector, conf_spec, create_stdin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_plugin() {
        register_stdin().unwrap();
    }
}
