use async_trait::async_trait;
use cqlstream_macros::registration_fn;
use serde::Deserialize;
use serde_yaml::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::sync::Arc;
use tracing::debug;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Closer, Connector, Error, Provenance, Record};

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum WriteMode {
    #[default]
    Truncate,
    Append,
}

#[derive(Deserialize)]
struct FileConnectorConfig {
    path: String,
    #[serde(default)]
    write_mode: WriteMode,
}

enum Mode {
    Read {
        lines: std::io::Lines<BufReader<File>>,
        position: u64,
        exhausted: bool,
    },
    Write {
        writer: BufWriter<File>,
    },
}

/// Reads or writes newline-delimited records from/to a single file. One `FileConnector`
/// instance covers exactly one resource; the URI is the file path prefixed with `file://`.
///
/// The read side is grounded on `modules::inputs::file::FileReader`'s `BufReader::lines()`
/// approach. The teacher has no file-writing output module to ground the write side on, so the
/// `write_mode` truncate/append choice has no teacher precedent; it's a direct translation of
/// spec.md's load-direction requirement to let an operator pick either open mode.
pub struct FileConnector {
    resource: Arc<str>,
    mode: Mode,
}

impl Closer for FileConnector {
    // No extra resources to release beyond what `Drop` on the underlying file handles already
    // does.
}

#[async_trait]
impl Connector for FileConnector {
    async fn read(&mut self) -> Result<Record, Error> {
        let Mode::Read {
            lines,
            position,
            exhausted,
        } = &mut self.mode
        else {
            return Err(Error::ConnectorError("connector opened in write mode".into()));
        };
        if *exhausted {
            return Err(Error::EndOfInput);
        }
        match lines.next() {
            Some(Ok(line)) => {
                *position += 1;
                let provenance = Provenance {
                    resource: Arc::clone(&self.resource),
                    position: *position,
                    source: Some(Arc::from(line.as_str())),
                };
                Ok(Record::Ok {
                    provenance,
                    fields: Default::default(),
                })
            }
            Some(Err(e)) => {
                *exhausted = true;
                Err(Error::ConnectorError(format!("{}: {e}", self.resource)))
            }
            None => {
                *exhausted = true;
                Err(Error::EndOfInput)
            }
        }
    }

    async fn write(&mut self, record: &Record) -> Result<(), Error> {
        let Mode::Write { writer } = &mut self.mode else {
            return Err(Error::ConnectorError("connector opened in read mode".into()));
        };
        let line = match record {
            Record::Ok { fields, .. } => serde_yaml::to_string(fields)
                .map_err(Error::from)?
                .trim_end()
                .to_string(),
            Record::Error { cause, .. } => {
                return Err(Error::ConnectorError(format!("cannot write error record: {cause}")))
            }
        };
        writeln!(writer, "{line}").map_err(Error::from)
    }

    fn current_resource(&self) -> &str {
        &self.resource
    }
}

#[registration_fn]
fn create_file(conf: Value) -> Result<ExecutionType, Error> {
    let c: FileConnectorConfig = serde_yaml::from_value(conf)?;
    let resource: Arc<str> = Arc::from(format!("file://{}", c.path));

    // Presence of the target file decides direction: an existing file is a load source, a
    // missing one (about to be created) is an unload destination. Ambiguous only when a load
    // source legitimately doesn't exist yet, in which case the caller should use `write_mode`.
    let connector = if std::path::Path::new(&c.path).exists() && c.write_mode == WriteMode::Truncate
    {
        let file = File::open(&c.path).map_err(Error::from)?;
        debug!(path = c.path, "opened file connector for reading");
        FileConnector {
            resource,
            mode: Mode::Read {
                lines: BufReader::new(file).lines(),
                position: 0,
                exhausted: false,
            },
        }
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(c.write_mode == WriteMode::Append)
            .truncate(c.write_mode == WriteMode::Truncate)
            .open(&c.path)
            .map_err(Error::from)?;
        debug!(path = c.path, "opened file connector for writing");
        FileConnector {
            resource,
            mode: Mode::Write {
                writer: BufWriter::new(file),
            },
        }
    };

    Ok(ExecutionType::Connector(Box::new(connector)))
}

pub(super) fn register_file() -> Result<(), Error> {
    let config = "type: object
properties:
  path:
    type: string
  write_mode:
    type: string
required:
  - path";
    let conf_spec = ConfigSpec::from_schema(config)?;
    register_plugin("file".into(), ItemType::Connector, conf_spec, create_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_plugin() {
        register_file().unwrap();
    }

    #[tokio::test]
    async fn reads_lines_with_position_and_source() {
        let dir = std::env::temp_dir().join(format!("cqlstream-test-{}", uuid::Uuid::new_v4()));
        std::fs::write(&dir, "a,1\nb,2\n").unwrap();

        let file = File::open(&dir).unwrap();
        let mut connector = FileConnector {
            resource: Arc::from("file:///test"),
            mode: Mode::Read {
                lines: BufReader::new(file).lines(),
                position: 0,
                exhausted: false,
            },
        };

        let r1 = connector.read().await.unwrap();
        assert_eq!(r1.provenance().position, 1);
        let r2 = connector.read().await.unwrap();
        assert_eq!(r2.provenance().position, 2);
        assert!(matches!(connector.read().await, Err(Error::EndOfInput)));

        std::fs::remove_file(&dir).ok();
    }
}
