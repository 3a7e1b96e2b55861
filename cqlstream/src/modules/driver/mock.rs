use async_trait::async_trait;
use cqlstream_macros::registration_fn;
use rustc_hash::FxHasher;
use serde::Deserialize;
use serde_yaml::Value;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{
    Closer, Driver, Error, Executable, ExecutionMeta, NodeId, PreparedStatement, ReadResult, Row,
    Token, WriteResult,
};

/// An in-memory token-ring simulation, used by default for `count`/dry-run flows and by the
/// crate's own test suite when no real cluster is available.
///
/// Token computation is grounded on the influxdb_iox partitioner's pattern of hashing a routing
/// key to a destination (`other_examples` retrieval pack): a deterministic hash of the routing
/// key stands in for a real partitioner's murmur3 token.
pub struct MockDriver {
    replica_set_size: usize,
    total_nodes: usize,
    prepared_counter: AtomicUsize,
    /// When `Some(n)`, every nth call to `execute_async` reports a failure instead of success,
    /// letting tests drive the log manager's threshold logic without a real cluster.
    fail_every: Option<usize>,
    call_counter: AtomicUsize,
}

impl MockDriver {
    /// Creates a driver simulating a ring of `total_nodes` nodes with a replica set size of 3
    /// (or `total_nodes`, whichever is smaller).
    pub fn new(total_nodes: usize) -> Self {
        MockDriver {
            replica_set_size: total_nodes.min(3).max(1),
            total_nodes: total_nodes.max(1),
            prepared_counter: AtomicUsize::new(0),
            fail_every: None,
            call_counter: AtomicUsize::new(0),
        }
    }

    /// Creates a driver that fails every `n`th execution, for exercising threshold logic.
    pub fn failing_every(total_nodes: usize, n: usize) -> Self {
        MockDriver {
            fail_every: Some(n.max(1)),
            ..MockDriver::new(total_nodes)
        }
    }
}

impl Closer for MockDriver {}

#[async_trait]
impl Driver for MockDriver {
    async fn prepare(&self, cql: &str) -> Result<PreparedStatement, Error> {
        let id = self.prepared_counter.fetch_add(1, Ordering::Relaxed);
        Ok(PreparedStatement {
            id: std::sync::Arc::from(format!("mock-prepared-{id}")),
            cql: std::sync::Arc::from(cql),
        })
    }

    async fn execute_async(&self, executable: &Executable) -> Result<WriteResult, Error> {
        let call = self.call_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(n) = self.fail_every {
            if call % n == 0 {
                return Ok(WriteResult::Failure {
                    executable: executable.clone(),
                    cause: "mock driver simulated timeout".into(),
                });
            }
        }
        Ok(WriteResult::Success {
            executable: executable.clone(),
            meta: ExecutionMeta::default(),
        })
    }

    async fn fetch_async(
        &self,
        _cql: &str,
        _page_state: Option<&[u8]>,
    ) -> Result<(ReadResult, Option<Vec<u8>>), Error> {
        Ok((
            ReadResult::Success {
                rows: Vec::<Row>::new(),
                meta: ExecutionMeta::default(),
            },
            None,
        ))
    }

    fn token_for(&self, routing_key: &[u8]) -> Token {
        let mut hasher = FxHasher::default();
        routing_key.hash(&mut hasher);
        hasher.finish()
    }

    fn replicas(&self, token: Token) -> Vec<NodeId> {
        let primary = (token as usize) % self.total_nodes;
        (0..self.replica_set_size)
            .map(|i| std::sync::Arc::from(format!("node-{}", (primary + i) % self.total_nodes)))
            .collect()
    }
}

#[derive(Deserialize, Default)]
struct MockDriverConfig {
    #[serde(default = "MockDriverConfig::default_nodes")]
    nodes: usize,
}

impl MockDriverConfig {
    fn default_nodes() -> usize {
        3
    }
}

#[registration_fn]
fn create_mock(conf: Value) -> Result<ExecutionType, Error> {
    let c: MockDriverConfig = serde_yaml::from_value(conf)?;
    Ok(ExecutionType::Driver(Box::new(MockDriver::new(c.nodes))))
}

pub(super) fn register_mock() -> Result<(), Error> {
    let config = "type: object
properties:
  nodes:
    type: integer";
    let conf_spec = ConfigSpec::from_schema(config)?;
    register_plugin("mock".into(), ItemType::Driver, conf_spec, create_mock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_plugin() {
        register_mock().unwrap();
    }

    #[test]
    fn token_for_is_deterministic() {
        let driver = MockDriver::new(4);
        assert_eq!(driver.token_for(b"key"), driver.token_for(b"key"));
    }

    #[test]
    fn replicas_returns_configured_set_size() {
        let driver = MockDriver::new(6);
        let token = driver.token_for(b"key");
        assert_eq!(driver.replicas(token).len(), 3);
    }

    #[tokio::test]
    async fn failing_every_n_reports_failure_on_schedule() {
        let driver = MockDriver::failing_every(3, 2);
        let stmt = crate::Statement::simple("select 1");
        let exe = Executable::Single(stmt);
        let r1 = driver.execute_async(&exe).await.unwrap();
        assert!(matches!(r1, WriteResult::Success { .. }));
        let r2 = driver.execute_async(&exe).await.unwrap();
        assert!(matches!(r2, WriteResult::Failure { .. }));
    }
}
