//! Parses `field1 = col1, field2 = col2` mapping expressions and applies them in both
//! directions: record fields to bound statement values (load), and result rows back to record
//! fields (unload).
use std::sync::Arc;

use crate::{CqlValue, Error, FieldMap, PreparedStatement, Record, Row, Statement, StatementBody};

/// One `field = column` pair from a parsed mapping expression.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldColumn {
    /// The record field name.
    pub field: String,
    /// The target column name.
    pub column: String,
}

/// A parsed `schema.mapping` expression.
#[derive(Clone, Debug)]
pub struct SimpleMapper {
    pairs: Vec<FieldColumn>,
    partition_key: Vec<String>,
}

impl SimpleMapper {
    /// Parses a mapping expression of the form `field1 = col1, field2 = col2`. When
    /// `mapping` is `None`, falls back to an identity mapping derived from `fields` (field name
    /// equals column name), matching dsbulk's behavior when no explicit mapping is given.
    pub fn parse(mapping: Option<&str>, fields: &[String]) -> Result<Self, Error> {
        match mapping {
            Some(expr) => {
                let mut pairs = Vec::new();
                for clause in expr.split(',') {
                    let clause = clause.trim();
                    if clause.is_empty() {
                        continue;
                    }
                    let mut parts = clause.splitn(2, '=');
                    let field = parts
                        .next()
                        .ok_or_else(|| Error::MappingErrorLoad(format!("invalid mapping clause: {clause}")))?
                        .trim()
                        .to_string();
                    let column = parts
                        .next()
                        .ok_or_else(|| Error::MappingErrorLoad(format!("invalid mapping clause: {clause}")))?
                        .trim()
                        .to_string();
                    pairs.push(FieldColumn { field, column });
                }
                Ok(SimpleMapper { pairs, partition_key: Vec::new() })
            }
            None => Ok(SimpleMapper {
                pairs: fields
                    .iter()
                    .map(|f| FieldColumn {
                        field: f.clone(),
                        column: f.clone(),
                    })
                    .collect(),
                partition_key: Vec::new(),
            }),
        }
    }

    /// Declares which record fields form the partition key, used to populate a mapped
    /// statement's `routing_key` for token-aware batching.
    pub fn with_partition_key(mut self, partition_key: Vec<String>) -> Self {
        self.partition_key = partition_key;
        self
    }

    /// The target columns, in mapping order, used to build the load `INSERT` or unload `SELECT`
    /// statement text.
    pub fn columns(&self) -> Vec<String> {
        self.pairs.iter().map(|p| p.column.clone()).collect()
    }

    /// Builds a prepared statement binding from a record's fields, in mapping order.
    ///
    /// Fails with [`Error::MappingErrorLoad`] if a mapped field is absent from the record.
    pub fn to_statement(&self, record: &Arc<Record>, prepared: &PreparedStatement) -> Result<Statement, Error> {
        let Record::Ok { fields, .. } = record.as_ref() else {
            return Err(Error::MappingErrorLoad("record failed to parse upstream".into()));
        };

        let mut values = Vec::with_capacity(self.pairs.len());
        for pair in &self.pairs {
            let value = fields
                .get(&pair.field)
                .ok_or_else(|| Error::MappingErrorLoad(format!("missing field: {}", pair.field)))?;
            values.push(yaml_to_cql(value));
        }

        let routing_key = if self.partition_key.is_empty() {
            None
        } else {
            let mut bytes = Vec::new();
            for key in &self.partition_key {
                let value = fields
                    .get(key)
                    .ok_or_else(|| Error::MappingErrorLoad(format!("missing partition key field: {key}")))?;
                bytes.extend(yaml_value_bytes(value));
            }
            Some(bytes)
        };

        Ok(Statement {
            body: StatementBody::Prepared {
                statement: prepared.clone(),
                values,
            },
            record: Some(Arc::clone(record)),
            routing_key,
        })
    }

    /// Converts a result row back into record fields, in mapping order.
    ///
    /// Fails with [`Error::MappingErrorUnload`] if a mapped column is absent from the row.
    pub fn to_fields(&self, row: &Row) -> Result<FieldMap, Error> {
        let mut fields = FieldMap::new();
        for pair in &self.pairs {
            let value = row
                .columns
                .get(&pair.column)
                .ok_or_else(|| Error::MappingErrorUnload(format!("missing column: {}", pair.column)))?;
            let _ = fields.insert(pair.field.clone(), cql_to_yaml(value));
        }
        Ok(fields)
    }
}

fn yaml_to_cql(value: &serde_yaml::Value) -> CqlValue {
    match value {
        serde_yaml::Value::String(s) => CqlValue::Text(s.clone()),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CqlValue::BigInt(i)
            } else {
                CqlValue::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_yaml::Value::Bool(b) => CqlValue::Boolean(*b),
        serde_yaml::Value::Null => CqlValue::Null,
        other => CqlValue::Text(serde_yaml::to_string(other).unwrap_or_default()),
    }
}

fn cql_to_yaml(value: &CqlValue) -> serde_yaml::Value {
    match value {
        CqlValue::Text(s) => serde_yaml::Value::String(s.clone()),
        CqlValue::BigInt(i) => serde_yaml::Value::Number((*i).into()),
        CqlValue::Double(f) => serde_yaml::Value::Number((*f).into()),
        CqlValue::Boolean(b) => serde_yaml::Value::Bool(*b),
        CqlValue::Blob(b) => serde_yaml::Value::String(format!("0x{}", hex_encode(b))),
        CqlValue::Null => serde_yaml::Value::Null,
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn yaml_value_bytes(value: &serde_yaml::Value) -> Vec<u8> {
    match value {
        serde_yaml::Value::String(s) => s.as_bytes().to_vec(),
        serde_yaml::Value::Number(n) => n.to_string().into_bytes(),
        serde_yaml::Value::Bool(b) => vec![*b as u8],
        other => serde_yaml::to_string(other).unwrap_or_default().into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Provenance;

    fn prepared() -> PreparedStatement {
        PreparedStatement {
            id: Arc::from("id"),
            cql: Arc::from("insert into t (a, b) values (?, ?)"),
        }
    }

    #[test]
    fn parses_explicit_mapping() {
        let m = SimpleMapper::parse(Some("field1 = col1, field2 = col2"), &[]).unwrap();
        assert_eq!(
            m.pairs,
            vec![
                FieldColumn {
                    field: "field1".into(),
                    column: "col1".into()
                },
                FieldColumn {
                    field: "field2".into(),
                    column: "col2".into()
                },
            ]
        );
    }

    #[test]
    fn identity_mapping_when_none_given() {
        let m = SimpleMapper::parse(None, &["a".into(), "b".into()]).unwrap();
        assert_eq!(m.pairs[0].field, m.pairs[0].column);
    }

    #[test]
    fn to_statement_fails_on_missing_field() {
        let m = SimpleMapper::parse(Some("a = col_a"), &[]).unwrap();
        let record = Arc::new(Record::Ok {
            provenance: Provenance {
                resource: Arc::from("file:///f"),
                position: 1,
                source: None,
            },
            fields: FieldMap::new(),
        });
        assert!(matches!(
            m.to_statement(&record, &prepared()),
            Err(Error::MappingErrorLoad(_))
        ));
    }

    #[test]
    fn to_statement_binds_mapped_values() {
        let m = SimpleMapper::parse(Some("a = col_a"), &[]).unwrap();
        let mut fields = FieldMap::new();
        let _ = fields.insert("a".to_string(), serde_yaml::Value::String("hello".into()));
        let record = Arc::new(Record::Ok {
            provenance: Provenance {
                resource: Arc::from("file:///f"),
                position: 1,
                source: None,
            },
            fields,
        });
        let stmt = m.to_statement(&record, &prepared()).unwrap();
        match stmt.body {
            StatementBody::Prepared { values, .. } => {
                assert_eq!(values, vec![CqlValue::Text("hello".into())]);
            }
            _ => panic!("expected prepared statement"),
        }
    }

    #[test]
    fn to_fields_fails_on_missing_column() {
        let m = SimpleMapper::parse(Some("a = col_a"), &[]).unwrap();
        let row = Row::default();
        assert!(matches!(m.to_fields(&row), Err(Error::MappingErrorUnload(_))));
    }

    #[test]
    fn columns_returns_mapping_order() {
        let m = SimpleMapper::parse(Some("field1 = col1, field2 = col2"), &[]).unwrap();
        assert_eq!(m.columns(), vec!["col1".to_string(), "col2".to_string()]);
    }

    #[test]
    fn partition_key_populates_routing_key() {
        let m = SimpleMapper::parse(Some("a = col_a, b = col_b"), &[]).unwrap().with_partition_key(vec!["a".into()]);
        let mut fields = FieldMap::new();
        let _ = fields.insert("a".to_string(), serde_yaml::Value::String("pk".into()));
        let _ = fields.insert("b".to_string(), serde_yaml::Value::String("other".into()));
        let record = Arc::new(Record::Ok {
            provenance: Provenance {
                resource: Arc::from("file:///f"),
                position: 1,
                source: None,
            },
            fields,
        });
        let stmt = m.to_statement(&record, &prepared()).unwrap();
        assert_eq!(stmt.routing_key, Some(b"pk".to_vec()));
    }
}
