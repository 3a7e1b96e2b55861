//! Groups statements sharing routing affinity into batches bounded by count and estimated size.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{BatchType, Batch, Driver, Executable, Statement};

/// Routing-affinity grouping strategy, selected by the `batch.mode` configuration key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum BatchMode {
    /// Group statements sharing the same routing token.
    #[default]
    #[serde(rename = "PARTITION_KEY")]
    PartitionKey,
    /// Group statements sharing the same replica set.
    #[serde(rename = "REPLICA_SET")]
    ReplicaSet,
}

/// Key a statement groups under, derived from its routing key via the configured mode.
type GroupKey = String;

struct Group {
    statements: Vec<Statement>,
    size_bytes: usize,
    /// Insertion order of the group's first element, used to break flush ties deterministically.
    first_seen: usize,
}

/// Accumulates statements into routing-affinity groups and flushes them into [`Batch`]es once a
/// group's bounds are reached, or on demand (window close / upstream completion).
pub struct StatementBatcher {
    mode: BatchMode,
    max_batch_statements: usize,
    max_batch_size_bytes: usize,
    groups: IndexMap<GroupKey, Group>,
    sequence: usize,
}

impl StatementBatcher {
    /// Creates a batcher with the given bounds and grouping mode.
    pub fn new(mode: BatchMode, max_batch_statements: usize, max_batch_size_bytes: usize) -> Self {
        StatementBatcher {
            mode,
            max_batch_statements: max_batch_statements.max(1),
            max_batch_size_bytes: max_batch_size_bytes.max(1),
            groups: IndexMap::new(),
            sequence: 0,
        }
    }

    fn group_key(&self, statement: &Statement, driver: &dyn Driver) -> GroupKey {
        let Some(routing_key) = &statement.routing_key else {
            // Statements with no routing key form their own singleton group, keyed uniquely so
            // they never coalesce with one another.
            return format!("__unrouted_{}", self.sequence);
        };
        match self.mode {
            BatchMode::PartitionKey => format!("tok:{}", driver.token_for(routing_key)),
            BatchMode::ReplicaSet => {
                let token = driver.token_for(routing_key);
                let mut replicas: Vec<String> = driver
                    .replicas(token)
                    .into_iter()
                    .map(|n| n.to_string())
                    .collect();
                replicas.sort();
                format!("rs:{}", replicas.join(","))
            }
        }
    }

    /// Offers one statement to the batcher. Returns any batches that became ready as a result
    /// (normally zero or one, but a single oversized statement can flush its group immediately).
    pub fn offer(&mut self, statement: Statement, driver: &dyn Driver) -> Vec<Batch> {
        let key = self.group_key(&statement, driver);
        let size = statement.body.estimated_size();
        self.sequence += 1;
        let seq = self.sequence;

        let group = self.groups.entry(key.clone()).or_insert_with(|| Group {
            statements: Vec::new(),
            size_bytes: 0,
            first_seen: seq,
        });
        group.statements.push(statement);
        group.size_bytes += size;

        let mut ready = Vec::new();
        if group.statements.len() >= self.max_batch_statements || group.size_bytes >= self.max_batch_size_bytes {
            if let Some(batch) = self.flush_group(&key) {
                ready.push(batch);
            }
        }
        ready
    }

    fn flush_group(&mut self, key: &str) -> Option<Batch> {
        let group = self.groups.shift_remove(key)?;
        if group.statements.is_empty() {
            return None;
        }
        Some(Batch {
            batch_type: BatchType::Unlogged,
            statements: group.statements,
        })
    }

    /// Flushes every open group, in ascending order of first-insertion sequence (a deterministic
    /// tie-break), and returns the resulting batches.
    pub fn flush_all(&mut self) -> Vec<Batch> {
        let mut keys: Vec<(usize, String)> = self
            .groups
            .iter()
            .map(|(k, g)| (g.first_seen, k.clone()))
            .collect();
        keys.sort_by_key(|(seq, _)| *seq);

        keys.into_iter()
            .filter_map(|(_, k)| self.flush_group(&k))
            .collect()
    }

    /// Wraps a flushed batch into an [`Executable`], unwrapping singleton batches back into a
    /// single statement.
    pub fn into_executable(batch: Batch) -> Executable {
        if batch.statements.len() == 1 {
            Executable::Single(batch.statements.into_iter().next().expect("len checked"))
        } else {
            Executable::Batch(batch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::driver::mock::MockDriver;
    use crate::StatementBody;
    use std::sync::Arc;

    fn stmt(routing_key: Option<Vec<u8>>) -> Statement {
        Statement {
            body: StatementBody::Simple {
                cql: Arc::from("insert into t (k) values (?)"),
            },
            record: None,
            routing_key,
        }
    }

    #[test]
    fn flushes_on_max_statements() {
        let driver = MockDriver::new(3);
        let mut batcher = StatementBatcher::new(BatchMode::PartitionKey, 2, 1_000_000);
        let key = b"same-key".to_vec();

        assert!(batcher.offer(stmt(Some(key.clone())), &driver).is_empty());
        let ready = batcher.offer(stmt(Some(key)), &driver);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].statements.len(), 2);
    }

    #[test]
    fn every_statement_appears_exactly_once() {
        let driver = MockDriver::new(3);
        let mut batcher = StatementBatcher::new(BatchMode::PartitionKey, 3, 1_000_000);
        let mut flushed = Vec::new();
        for i in 0..10 {
            let key = format!("key-{}", i % 4).into_bytes();
            flushed.extend(batcher.offer(stmt(Some(key)), &driver));
        }
        flushed.extend(batcher.flush_all());
        let total: usize = flushed.iter().map(|b| b.statements.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn singleton_batch_unwraps_to_single_statement() {
        let batch = Batch {
            batch_type: BatchType::Unlogged,
            statements: vec![stmt(None)],
        };
        assert!(matches!(
            StatementBatcher::into_executable(batch),
            Executable::Single(_)
        ));
    }

    #[test]
    fn flush_all_orders_by_first_insertion() {
        let driver = MockDriver::new(3);
        let mut batcher = StatementBatcher::new(BatchMode::PartitionKey, 100, 1_000_000);
        let _ = batcher.offer(stmt(Some(b"b".to_vec())), &driver);
        let _ = batcher.offer(stmt(Some(b"a".to_vec())), &driver);
        let _ = batcher.offer(stmt(Some(b"b".to_vec())), &driver);

        let flushed = batcher.flush_all();
        // "b" was seen first, so its batch (2 statements) flushes before "a"'s (1 statement).
        assert_eq!(flushed[0].statements.len(), 2);
        assert_eq!(flushed[1].statements.len(), 1);
    }
}
