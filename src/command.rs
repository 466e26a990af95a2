//! Request/response data model and the replicated command codec.
//!
//! Every log entry payload is a [`Command`] framed in a small versioned
//! envelope: one tag byte, one version byte, a big-endian u32 payload
//! length, then a bincode payload whose schema is picked by the tag.

use std::collections::BTreeMap;
use std::time::Duration;

use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// A single SQL scalar, as carried in statements and result rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Value::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

/// One SQL statement plus its bound parameters.
///
/// A statement with no parameters may contain several SQL statements in one
/// string (a dump); it is executed with SQLite's batch interface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub parameters: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(sql: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            parameters,
        }
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

/// A batch of mutating statements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub statements: Vec<Statement>,
    /// Record per-statement elapsed time.
    pub timings: bool,
    /// All-or-nothing: wrap the batch in a transaction that rolls back on
    /// the first error.
    pub atomic: bool,
}

impl ExecuteRequest {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self {
            statements,
            timings: false,
            atomic: false,
        }
    }

    pub fn atomic(mut self, yes: bool) -> Self {
        self.atomic = yes;
        self
    }

    pub fn timings(mut self, yes: bool) -> Self {
        self.timings = yes;
        self
    }
}

/// Outcome of one mutating statement. `error` is `None` on success; SQL
/// failures land here and never abort the apply loop.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub last_insert_id: i64,
    pub rows_affected: u64,
    pub error: Option<String>,
    pub time: Option<f64>,
}

impl ExecuteResult {
    pub(crate) fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Per-read consistency level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Local read, possibly stale. Optionally bounded by freshness.
    None,
    /// Leader-local read, no barrier.
    Weak,
    /// Linearizable read through a consensus barrier.
    Strong,
}

/// A batch of read-only statements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub statements: Vec<Statement>,
    pub timings: bool,
    /// Wrap the reads in a single transaction.
    pub atomic: bool,
    pub level: Consistency,
    /// Maximum tolerated staleness for `None` reads; zero disables the
    /// check. Ignored for `Weak` and `Strong`.
    pub freshness: Duration,
}

impl QueryRequest {
    pub fn new(statements: Vec<Statement>, level: Consistency) -> Self {
        Self {
            statements,
            timings: false,
            atomic: false,
            level,
            freshness: Duration::ZERO,
        }
    }

    pub fn atomic(mut self, yes: bool) -> Self {
        self.atomic = yes;
        self
    }

    pub fn timings(mut self, yes: bool) -> Self {
        self.timings = yes;
        self
    }

    pub fn freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }
}

/// Rows produced by one read statement.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub types: Vec<String>,
    pub values: Vec<Vec<Value>>,
    pub error: Option<String>,
    pub time: Option<f64>,
}

impl QueryResult {
    pub(crate) fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// The replicated log-entry payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Execute {
        request: ExecuteRequest,
    },
    /// Retained for linearizable reads proposed through the log. The store
    /// normally takes the cheaper barrier path instead.
    Query {
        request: QueryRequest,
    },
    MetadataSet {
        node_id: String,
        pairs: BTreeMap<String, String>,
    },
    MetadataDelete {
        node_id: String,
    },
}

/// What the apply loop hands back to the proposer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CommandResult {
    None,
    Execute(Vec<ExecuteResult>),
    Query(Vec<QueryResult>),
}

pub const CODEC_VERSION: u8 = 1;

const TAG_EXECUTE: u8 = 0x01;
const TAG_QUERY: u8 = 0x02;
const TAG_METADATA_SET: u8 = 0x03;
const TAG_METADATA_DELETE: u8 = 0x04;

const ENVELOPE_HEADER: usize = 1 + 1 + 4;

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (tag, payload) = match self {
            Command::Execute { request } => (TAG_EXECUTE, bincode::serialize(request)),
            Command::Query { request } => (TAG_QUERY, bincode::serialize(request)),
            Command::MetadataSet { node_id, pairs } => {
                (TAG_METADATA_SET, bincode::serialize(&(node_id, pairs)))
            }
            Command::MetadataDelete { node_id } => {
                (TAG_METADATA_DELETE, bincode::serialize(node_id))
            }
        };
        let payload = payload.map_err(|e| StoreError::Encoding(e.to_string()))?;

        let mut buf = Vec::with_capacity(ENVELOPE_HEADER + payload.len());
        buf.push(tag);
        buf.push(CODEC_VERSION);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < ENVELOPE_HEADER {
            return Err(StoreError::Encoding(format!(
                "command envelope truncated: {} bytes",
                data.len()
            )));
        }
        let tag = data[0];
        let version = data[1];
        if version != CODEC_VERSION {
            return Err(StoreError::Encoding(format!(
                "unsupported command version {version}"
            )));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&data[2..6]);
        let len = u32::from_be_bytes(len) as usize;
        let payload = &data[ENVELOPE_HEADER..];
        if payload.len() != len {
            return Err(StoreError::Encoding(format!(
                "command payload length mismatch: header says {len}, got {}",
                payload.len()
            )));
        }

        let decode_err = |e: bincode::Error| StoreError::Encoding(e.to_string());
        match tag {
            TAG_EXECUTE => Ok(Command::Execute {
                request: bincode::deserialize(payload).map_err(decode_err)?,
            }),
            TAG_QUERY => Ok(Command::Query {
                request: bincode::deserialize(payload).map_err(decode_err)?,
            }),
            TAG_METADATA_SET => {
                let (node_id, pairs) = bincode::deserialize(payload).map_err(decode_err)?;
                Ok(Command::MetadataSet { node_id, pairs })
            }
            TAG_METADATA_DELETE => Ok(Command::MetadataDelete {
                node_id: bincode::deserialize(payload).map_err(decode_err)?,
            }),
            unknown => Err(StoreError::Encoding(format!(
                "unknown command tag {unknown:#04x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: Command) {
        let bytes = cmd.encode().unwrap();
        assert_eq!(Command::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn encode_decode_roundtrip() {
        roundtrip(Command::Execute {
            request: ExecuteRequest::new(vec![
                Statement::new("CREATE TABLE foo (id INTEGER)"),
                Statement::with_parameters(
                    "INSERT INTO foo VALUES(?)",
                    vec![Value::Integer(1)],
                ),
            ])
            .atomic(true),
        });
        roundtrip(Command::Query {
            request: QueryRequest::new(
                vec![Statement::new("SELECT * FROM foo")],
                Consistency::Strong,
            )
            .freshness(Duration::from_nanos(1)),
        });
        roundtrip(Command::MetadataSet {
            node_id: "node-1".to_string(),
            pairs: [("dsn".to_string(), "db=1".to_string())].into_iter().collect(),
        });
        roundtrip(Command::MetadataDelete {
            node_id: "node-1".to_string(),
        });
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = Command::MetadataDelete {
            node_id: "n".to_string(),
        }
        .encode()
        .unwrap();
        bytes[0] = 0x7f;
        match Command::decode(&bytes) {
            Err(StoreError::Encoding(msg)) => assert!(msg.contains("unknown command tag")),
            other => panic!("expected encoding error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = Command::MetadataDelete {
            node_id: "n".to_string(),
        }
        .encode()
        .unwrap();
        bytes[1] = CODEC_VERSION + 1;
        assert!(matches!(
            Command::decode(&bytes),
            Err(StoreError::Encoding(_))
        ));
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let bytes = Command::MetadataDelete {
            node_id: "n".to_string(),
        }
        .encode()
        .unwrap();
        assert!(matches!(
            Command::decode(&bytes[..bytes.len() - 1]),
            Err(StoreError::Encoding(_))
        ));
        assert!(matches!(
            Command::decode(&bytes[..3]),
            Err(StoreError::Encoding(_))
        ));
    }
}
