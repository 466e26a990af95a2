use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::backup::Backup;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use uuid::Uuid;

use crate::command::{ExecuteRequest, ExecuteResult, QueryRequest, QueryResult, Statement, Value};
use crate::dump::dump_sql;
use crate::error::{Result, StoreError};

/// How database bytes are produced for a backup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupFormat {
    /// The raw SQLite file image.
    Binary,
    /// A replayable textual dump.
    Sql,
}

/// Everything needed to rebuild this node's replicated state, captured in a
/// single actor message so it is consistent with respect to apply.
pub(crate) struct SnapshotContents {
    pub last_applied: Option<String>,
    pub membership: Option<String>,
    pub node_meta: BTreeMap<String, BTreeMap<String, String>>,
    pub db_bytes: Vec<u8>,
}

/// Database actor.
///
/// Owns the only writable SQLite connection plus the replicated node
/// metadata map. `rusqlite::Connection` is not `Sync` and SQLite wants a
/// single writer, so the actor lives on a dedicated thread and every state
/// transition — apply, local reads, snapshot capture, restore — is a
/// message on its queue. This is the single-threaded apply discipline the
/// rest of the store relies on.
struct DbActor {
    conn: Connection,
    /// `None` for memory-backed stores.
    db_path: Option<PathBuf>,
    /// Scratch space for `VACUUM INTO` images.
    scratch_dir: PathBuf,
    /// Per-node key/value metadata, replicated through the log.
    node_meta: BTreeMap<String, BTreeMap<String, String>>,
}

pub(crate) enum DbMessage {
    Execute {
        req: ExecuteRequest,
        resp: oneshot::Sender<Vec<ExecuteResult>>,
    },
    Query {
        req: QueryRequest,
        resp: oneshot::Sender<Vec<QueryResult>>,
    },
    Backup {
        format: BackupFormat,
        resp: oneshot::Sender<Result<Vec<u8>>>,
    },
    MergeNodeMeta {
        node_id: String,
        pairs: BTreeMap<String, String>,
        resp: oneshot::Sender<()>,
    },
    DeleteNodeMeta {
        node_id: String,
        resp: oneshot::Sender<()>,
    },
    NodeMeta {
        node_id: String,
        key: String,
        resp: oneshot::Sender<String>,
    },
    UpsertMeta {
        key: String,
        value: String,
        resp: oneshot::Sender<Result<()>>,
    },
    GetMeta {
        key: String,
        resp: oneshot::Sender<Result<Option<String>>>,
    },
    Snapshot {
        resp: oneshot::Sender<Result<SnapshotContents>>,
    },
    Restore {
        node_meta: BTreeMap<String, BTreeMap<String, String>>,
        db_file: PathBuf,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

/// Handle to the database actor. `Clone + Send`; every caller thread talks
/// to the same single-writer connection through it.
#[derive(Clone)]
pub(crate) struct DbHandle {
    sender: mpsc::Sender<DbMessage>,
}

impl DbHandle {
    /// Opens the database and spawns the actor thread. Message processing
    /// stops when `Close` is received or every handle is dropped.
    ///
    /// `reset_meta` drops any recorded apply position: a database file
    /// imported from a backup carries the source cluster's position, which
    /// means nothing to a node starting with an empty log.
    pub(crate) fn spawn(
        db_path: Option<PathBuf>,
        scratch_dir: PathBuf,
        reset_meta: bool,
    ) -> Result<Self> {
        let conn = match &db_path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _store_meta (key TEXT PRIMARY KEY, value TEXT)",
        )?;
        if reset_meta {
            conn.execute_batch("DELETE FROM _store_meta")?;
        }
        std::fs::create_dir_all(&scratch_dir)?;

        let (tx, mut rx) = mpsc::channel(64);
        let _ = thread::Builder::new()
            .name("raftsql-db".to_string())
            .spawn(move || {
                let mut actor = DbActor {
                    conn,
                    db_path,
                    scratch_dir,
                    node_meta: BTreeMap::new(),
                };
                while let Some(msg) = rx.blocking_recv() {
                    if actor.handle(msg) {
                        break;
                    }
                }
            })?;

        Ok(Self { sender: tx })
    }

    pub(crate) async fn execute(&self, req: ExecuteRequest) -> Result<Vec<ExecuteResult>> {
        let (tx, rx) = oneshot::channel();
        self.send(DbMessage::Execute { req, resp: tx }).await?;
        rx.await.map_err(|_| actor_gone())
    }

    pub(crate) async fn query(&self, req: QueryRequest) -> Result<Vec<QueryResult>> {
        let (tx, rx) = oneshot::channel();
        self.send(DbMessage::Query { req, resp: tx }).await?;
        rx.await.map_err(|_| actor_gone())
    }

    pub(crate) async fn backup(&self, format: BackupFormat) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.send(DbMessage::Backup { format, resp: tx }).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub(crate) async fn merge_node_meta(
        &self,
        node_id: String,
        pairs: BTreeMap<String, String>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DbMessage::MergeNodeMeta {
            node_id,
            pairs,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())
    }

    pub(crate) async fn delete_node_meta(&self, node_id: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DbMessage::DeleteNodeMeta { node_id, resp: tx }).await?;
        rx.await.map_err(|_| actor_gone())
    }

    pub(crate) async fn node_meta(&self, node_id: String, key: String) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.send(DbMessage::NodeMeta {
            node_id,
            key,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())
    }

    pub(crate) async fn upsert_meta(&self, key: String, value: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DbMessage::UpsertMeta {
            key,
            value,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub(crate) async fn get_meta(&self, key: String) -> Result<Option<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(DbMessage::GetMeta { key, resp: tx }).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub(crate) async fn snapshot(&self) -> Result<SnapshotContents> {
        let (tx, rx) = oneshot::channel();
        self.send(DbMessage::Snapshot { resp: tx }).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub(crate) async fn restore(
        &self,
        node_meta: BTreeMap<String, BTreeMap<String, String>>,
        db_file: PathBuf,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DbMessage::Restore {
            node_meta,
            db_file,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Stops the actor. With `wait`, resolves only after every message
    /// queued before the close has been processed.
    pub(crate) async fn close(&self, wait: bool) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(DbMessage::Close { resp: tx }).await.is_err() {
            return;
        }
        if wait {
            let _ = rx.await;
        }
    }

    async fn send(&self, msg: DbMessage) -> Result<()> {
        self.sender.send(msg).await.map_err(|_| actor_gone())
    }
}

fn actor_gone() -> StoreError {
    StoreError::Shutdown
}

/// SQLite reports failures with a useful message in the error payload;
/// surface that text alone so callers see `no such table: foo` and friends.
fn error_text(e: &rusqlite::Error) -> String {
    match e {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.clone(),
        other => other.to_string(),
    }
}

impl DbActor {
    /// Returns `true` when the actor should stop.
    fn handle(&mut self, msg: DbMessage) -> bool {
        match msg {
            DbMessage::Execute { req, resp } => {
                let _ = resp.send(self.execute(&req));
            }
            DbMessage::Query { req, resp } => {
                let _ = resp.send(self.query(&req));
            }
            DbMessage::Backup { format, resp } => {
                let _ = resp.send(self.backup(format));
            }
            DbMessage::MergeNodeMeta {
                node_id,
                pairs,
                resp,
            } => {
                self.node_meta.entry(node_id).or_default().extend(pairs);
                let _ = resp.send(());
            }
            DbMessage::DeleteNodeMeta { node_id, resp } => {
                self.node_meta.remove(&node_id);
                let _ = resp.send(());
            }
            DbMessage::NodeMeta {
                node_id,
                key,
                resp,
            } => {
                let value = self
                    .node_meta
                    .get(&node_id)
                    .and_then(|m| m.get(&key))
                    .cloned()
                    .unwrap_or_default();
                let _ = resp.send(value);
            }
            DbMessage::UpsertMeta { key, value, resp } => {
                let _ = resp.send(self.upsert_meta(&key, &value));
            }
            DbMessage::GetMeta { key, resp } => {
                let _ = resp.send(self.get_meta(&key));
            }
            DbMessage::Snapshot { resp } => {
                let _ = resp.send(self.snapshot());
            }
            DbMessage::Restore {
                node_meta,
                db_file,
                resp,
            } => {
                let _ = resp.send(self.restore(node_meta, &db_file));
            }
            DbMessage::Close { resp } => {
                let _ = resp.send(());
                return true;
            }
        }
        false
    }

    fn execute(&mut self, req: &ExecuteRequest) -> Vec<ExecuteResult> {
        let mut results = Vec::with_capacity(req.statements.len());
        if req.atomic {
            if let Err(e) = self.conn.execute_batch("BEGIN") {
                let msg = error_text(&e);
                return req
                    .statements
                    .iter()
                    .map(|_| ExecuteResult::failed(msg.clone()))
                    .collect();
            }
            let mut failed = false;
            for stmt in &req.statements {
                if failed {
                    results.push(ExecuteResult::failed("statement skipped".to_string()));
                    continue;
                }
                match self.execute_statement(stmt, req.timings) {
                    Ok(r) => results.push(r),
                    Err(e) => {
                        results.push(ExecuteResult::failed(error_text(&e)));
                        failed = true;
                    }
                }
            }
            let end = if failed { "ROLLBACK" } else { "COMMIT" };
            if let Err(e) = self.conn.execute_batch(end) {
                debug!(error = %e, "failed to end execute transaction");
            }
        } else {
            for stmt in &req.statements {
                match self.execute_statement(stmt, req.timings) {
                    Ok(r) => results.push(r),
                    Err(e) => results.push(ExecuteResult::failed(error_text(&e))),
                }
            }
        }
        results
    }

    fn execute_statement(
        &mut self,
        stmt: &Statement,
        timings: bool,
    ) -> rusqlite::Result<ExecuteResult> {
        let start = Instant::now();
        if stmt.parameters.is_empty() {
            // The statement text may be a whole dump; the batch interface
            // walks every statement in it.
            self.conn.execute_batch(&stmt.sql)?;
        } else {
            let mut prepared = self.conn.prepare(&stmt.sql)?;
            prepared.execute(params_from_iter(stmt.parameters.iter()))?;
        }
        Ok(ExecuteResult {
            last_insert_id: self.conn.last_insert_rowid(),
            rows_affected: self.conn.changes(),
            error: None,
            time: timings.then(|| start.elapsed().as_secs_f64()),
        })
    }

    fn query(&mut self, req: &QueryRequest) -> Vec<QueryResult> {
        if req.atomic {
            if let Err(e) = self.conn.execute_batch("BEGIN") {
                let msg = error_text(&e);
                return req
                    .statements
                    .iter()
                    .map(|_| QueryResult::failed(msg.clone()))
                    .collect();
            }
        }
        let mut results = Vec::with_capacity(req.statements.len());
        for stmt in &req.statements {
            match self.query_statement(stmt, req.timings) {
                Ok(r) => results.push(r),
                Err(e) => results.push(QueryResult::failed(error_text(&e))),
            }
        }
        if req.atomic {
            if let Err(e) = self.conn.execute_batch("COMMIT") {
                debug!(error = %e, "failed to end query transaction");
            }
        }
        results
    }

    fn query_statement(
        &mut self,
        stmt: &Statement,
        timings: bool,
    ) -> rusqlite::Result<QueryResult> {
        let start = Instant::now();
        let mut prepared = self.conn.prepare(&stmt.sql)?;
        let columns: Vec<String> = prepared
            .column_names()
            .iter()
            .map(|c| c.to_string())
            .collect();
        let types: Vec<String> = prepared
            .columns()
            .iter()
            .map(|c| {
                c.decl_type()
                    .map(|t| t.to_ascii_lowercase())
                    .unwrap_or_default()
            })
            .collect();
        let ncols = prepared.column_count();

        let mut values = Vec::new();
        let mut rows = prepared.query(params_from_iter(stmt.parameters.iter()))?;
        while let Some(row) = rows.next()? {
            let mut out = Vec::with_capacity(ncols);
            for i in 0..ncols {
                out.push(Value::from(row.get_ref(i)?));
            }
            values.push(out);
        }

        Ok(QueryResult {
            columns,
            types,
            values,
            error: None,
            time: timings.then(|| start.elapsed().as_secs_f64()),
        })
    }

    fn backup(&mut self, format: BackupFormat) -> Result<Vec<u8>> {
        match format {
            BackupFormat::Binary => match self.db_path.clone() {
                // File-backed stores hand out the database file exactly.
                Some(path) => Ok(std::fs::read(path)?),
                None => self.vacuum_bytes(),
            },
            BackupFormat::Sql => {
                let mut buf = Vec::new();
                dump_sql(&self.conn, &mut buf)?;
                Ok(buf)
            }
        }
    }

    /// Materializes a compact single-file image of the database, which
    /// works for memory-backed connections too.
    fn vacuum_bytes(&mut self) -> Result<Vec<u8>> {
        let path = self
            .scratch_dir
            .join(format!("vacuum-{}.db", Uuid::new_v4()));
        let path_str = path.to_string_lossy().into_owned();
        self.conn
            .execute("VACUUM INTO ?1", [path_str.as_str()])
            .map_err(|e| StoreError::Storage(error_text(&e)))?;
        let bytes = std::fs::read(&path)?;
        let _ = std::fs::remove_file(&path);
        Ok(bytes)
    }

    fn snapshot(&mut self) -> Result<SnapshotContents> {
        Ok(SnapshotContents {
            last_applied: self.get_meta("last_applied")?,
            membership: self.get_meta("last_membership")?,
            node_meta: self.node_meta.clone(),
            db_bytes: self.vacuum_bytes()?,
        })
    }

    fn restore(
        &mut self,
        node_meta: BTreeMap<String, BTreeMap<String, String>>,
        db_file: &std::path::Path,
    ) -> Result<()> {
        // Abandon any transaction a half-applied dump may have left open;
        // the incoming image replaces that state wholesale.
        let _ = self.conn.execute_batch("ROLLBACK");

        let src = Connection::open(db_file)?;
        {
            let backup = Backup::new(&src, &mut self.conn)
                .map_err(|e| StoreError::Storage(error_text(&e)))?;
            backup
                .run_to_completion(64, Duration::from_millis(25), None)
                .map_err(|e| StoreError::Storage(error_text(&e)))?;
        }
        self.node_meta = node_meta;
        Ok(())
    }

    fn upsert_meta(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO _store_meta (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )
            .map_err(|e| {
                error!(key, error = %e, "failed to persist store metadata");
                StoreError::Storage(error_text(&e))
            })?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM _store_meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| StoreError::Storage(error_text(&e)))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Consistency;

    fn spawn_mem() -> (DbHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let handle = DbHandle::spawn(None, dir.path().join("tmp"), false).unwrap();
        (handle, dir)
    }

    fn exec_req(sql: &str) -> ExecuteRequest {
        ExecuteRequest::new(vec![Statement::new(sql)])
    }

    fn query_req(sql: &str) -> QueryRequest {
        QueryRequest::new(vec![Statement::new(sql)], Consistency::None)
    }

    const DUMP: &str = "PRAGMA foreign_keys=OFF;
BEGIN TRANSACTION;
CREATE TABLE foo (id INTEGER NOT NULL PRIMARY KEY, name TEXT);
COMMIT;
";

    #[tokio::test]
    async fn sql_errors_are_reported_per_statement() {
        let (db, _dir) = spawn_mem();
        let results = db
            .execute(exec_req("INSERT INTO foo(id, name) VALUES(1, 'fiona')"))
            .await
            .unwrap();
        assert_eq!(results[0].error.as_deref(), Some("no such table: foo"));
    }

    #[tokio::test]
    async fn failed_dump_leaves_transaction_open() {
        let (db, _dir) = spawn_mem();

        let r = db.execute(exec_req(DUMP)).await.unwrap();
        assert!(r[0].error.is_none());

        let r = db.execute(exec_req(DUMP)).await.unwrap();
        assert_eq!(r[0].error.as_deref(), Some("table foo already exists"));

        // The failed run aborted between BEGIN and COMMIT.
        let r = db.execute(exec_req(DUMP)).await.unwrap();
        assert_eq!(
            r[0].error.as_deref(),
            Some("cannot start a transaction within a transaction")
        );

        let r = db.execute(exec_req("ROLLBACK")).await.unwrap();
        assert!(r[0].error.is_none());

        let r = db.execute(exec_req(DUMP)).await.unwrap();
        assert_eq!(r[0].error.as_deref(), Some("table foo already exists"));
    }

    #[tokio::test]
    async fn atomic_batch_rolls_back_and_skips() {
        let (db, _dir) = spawn_mem();
        db.execute(exec_req("CREATE TABLE foo (id INTEGER PRIMARY KEY)"))
            .await
            .unwrap();

        let req = ExecuteRequest::new(vec![
            Statement::new("INSERT INTO foo VALUES(1)"),
            Statement::new("INSERT INTO nope VALUES(1)"),
            Statement::new("INSERT INTO foo VALUES(2)"),
        ])
        .atomic(true);
        let results = db.execute(req).await.unwrap();
        assert!(results[0].error.is_none());
        assert_eq!(results[1].error.as_deref(), Some("no such table: nope"));
        assert_eq!(results[2].error.as_deref(), Some("statement skipped"));

        let rows = db.query(query_req("SELECT count(*) FROM foo")).await.unwrap();
        assert_eq!(rows[0].values, vec![vec![Value::Integer(0)]]);
    }

    #[tokio::test]
    async fn parameters_and_timings() {
        let (db, _dir) = spawn_mem();
        db.execute(exec_req("CREATE TABLE foo (id INTEGER, name TEXT)"))
            .await
            .unwrap();

        let req = ExecuteRequest::new(vec![Statement::with_parameters(
            "INSERT INTO foo VALUES(?1, ?2)",
            vec![Value::Integer(7), Value::Text("fiona".to_string())],
        )])
        .timings(true);
        let results = db.execute(req).await.unwrap();
        assert!(results[0].error.is_none());
        assert_eq!(results[0].rows_affected, 1);
        assert!(results[0].time.is_some());

        let rows = db
            .query(query_req("SELECT id, name FROM foo"))
            .await
            .unwrap();
        assert_eq!(rows[0].columns, vec!["id", "name"]);
        assert_eq!(rows[0].types, vec!["integer", "text"]);
        assert_eq!(
            rows[0].values,
            vec![vec![Value::Integer(7), Value::Text("fiona".to_string())]]
        );
    }
}
