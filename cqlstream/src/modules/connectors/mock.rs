//! An in-memory connector used by the orchestrator's own test suite: replays a fixed `Vec`
//! instead of touching real I/O so pipeline tests stay deterministic and fast.
use async_trait::async_trait;
use std::sync::Arc;

use crate::{Closer, Connector, Error, Provenance, Record};

/// Replays a fixed set of records, one resource's worth at a time.
pub struct MockConnector {
    resource: Arc<str>,
    records: std::vec::IntoIter<Record>,
    written: Vec<Record>,
}

impl MockConnector {
    /// Creates a mock connector that will yield `records` in order under `resource`, stamping
    /// provenance if a record does not already carry the expected resource name.
    pub fn new(resource: impl Into<Arc<str>>, records: Vec<Record>) -> Self {
        MockConnector {
            resource: resource.into(),
            records: records.into_iter(),
            written: Vec::new(),
        }
    }

    /// Returns every record passed to `write` so far, for assertion in tests.
    pub fn written(&self) -> &[Record] {
        &self.written
    }
}

impl Closer for MockConnector {}

#[async_trait]
impl Connector for MockConnector {
    async fn read(&mut self) -> Result<Record, Error> {
        self.records.next().ok_or(Error::EndOfInput)
    }

    async fn write(&mut self, record: &Record) -> Result<(), Error> {
        self.written.push(record.clone());
        Ok(())
    }

    fn current_resource(&self) -> &str {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_records_then_ends() {
        let provenance = Provenance {
            resource: Arc::from("mock:///a"),
            position: 1,
            source: Some(Arc::from("x")),
        };
        let mut connector = MockConnector::new(
            "mock:///a",
            vec![Record::Ok {
                provenance,
                fields: Default::default(),
            }],
        );
        assert!(connector.read().await.is_ok());
        assert!(matches!(connector.read().await, Err(Error::EndOfInput)));
    }
}
