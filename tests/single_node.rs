//! Single-node store behavior: execute/query semantics, error surfacing,
//! transactions, and backups.

use std::time::Duration;

use uuid::Uuid;

use raftsql::{
    BackupFormat, ClusterRouter, Consistency, ExecuteRequest, QueryRequest, Statement, Store,
    StoreConfig, StoreError, Value,
};

fn new_config(in_memory: bool, dir: &std::path::Path) -> StoreConfig {
    let id = format!("node-{}", Uuid::new_v4());
    let addr = format!("{id}.cluster.local");
    StoreConfig::new(&id, &addr, dir).in_memory(in_memory)
}

async fn open_leader(in_memory: bool) -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = new_config(in_memory, dir.path());
    let store = Store::open(config, ClusterRouter::new(), true)
        .await
        .unwrap();
    store.wait_for_leader(Duration::from_secs(10)).await.unwrap();
    (store, dir)
}

fn exec_req(statements: &[&str]) -> ExecuteRequest {
    ExecuteRequest::new(statements.iter().map(|s| Statement::new(*s)).collect())
}

fn query_req(sql: &str, level: Consistency) -> QueryRequest {
    QueryRequest::new(vec![Statement::new(sql)], level)
}

const SIMPLE_DUMP: &str = "PRAGMA foreign_keys=OFF;
BEGIN TRANSACTION;
CREATE TABLE foo (id integer not null primary key, name text);
INSERT INTO \"foo\" VALUES(1,'fiona');
COMMIT;
";

const CREATE_DUMP: &str = "PRAGMA foreign_keys=OFF;
BEGIN TRANSACTION;
CREATE TABLE foo (id INTEGER NOT NULL PRIMARY KEY, name TEXT);
COMMIT;
";

#[tokio::test]
async fn open_store_single_node() {
    let (store, _dir) = open_leader(true).await;

    assert!(store.is_leader());
    assert_eq!(store.state(), raftsql::State::Leader);
    assert_eq!(store.leader_addr(), store.addr());
    assert_eq!(store.leader_id(), store.id());

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn open_close_is_idempotent() {
    let (store, _dir) = open_leader(true).await;
    store.close(true).await.unwrap();
    store.close(true).await.unwrap();

    assert_eq!(store.state(), raftsql::State::Shutdown);
    let err = store.execute(&exec_req(&["CREATE TABLE t (x INT)"])).await;
    assert!(matches!(err, Err(StoreError::Shutdown)));
}

#[tokio::test]
async fn execute_then_query() {
    let (store, _dir) = open_leader(true).await;

    let results = store
        .execute(&exec_req(&[
            "CREATE TABLE foo (id INTEGER NOT NULL PRIMARY KEY, name TEXT)",
            "INSERT INTO foo(id, name) VALUES(1, 'fiona')",
        ]))
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.error.is_none()));

    let rows = store
        .query(&query_req("SELECT * FROM foo", Consistency::None))
        .await
        .unwrap();
    assert_eq!(rows[0].columns, vec!["id", "name"]);
    assert_eq!(
        rows[0].values,
        vec![vec![Value::Integer(1), Value::Text("fiona".to_string())]]
    );

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn execute_on_file_backed_store() {
    let (store, _dir) = open_leader(false).await;

    store
        .execute(&exec_req(&[
            "CREATE TABLE foo (id INTEGER NOT NULL PRIMARY KEY, name TEXT)",
            "INSERT INTO foo(id, name) VALUES(1, 'fiona')",
        ]))
        .await
        .unwrap();

    for _ in 0..3 {
        let rows = store
            .query(&query_req("SELECT * FROM foo", Consistency::None))
            .await
            .unwrap();
        assert_eq!(rows[0].columns, vec!["id", "name"]);
        assert_eq!(
            rows[0].values,
            vec![vec![Value::Integer(1), Value::Text("fiona".to_string())]]
        );
    }

    store.close(true).await.unwrap();
}

/// Database-level errors are reported per statement; the call succeeds.
#[tokio::test]
async fn sql_errors_do_not_fail_the_call() {
    let (store, _dir) = open_leader(true).await;

    let results = store
        .execute(&exec_req(&["INSERT INTO foo(id, name) VALUES(1, 'fiona')"]))
        .await
        .unwrap();
    assert_eq!(results[0].error.as_deref(), Some("no such table: foo"));

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn transactions_on_execute_and_query() {
    let (store, _dir) = open_leader(true).await;

    let req = ExecuteRequest::new(vec![
        Statement::new("CREATE TABLE foo (id INTEGER NOT NULL PRIMARY KEY, name TEXT)"),
        Statement::new("INSERT INTO foo(id, name) VALUES(1, 'fiona')"),
    ])
    .atomic(true);
    let results = store.execute(&req).await.unwrap();
    assert!(results.iter().all(|r| r.error.is_none()));

    for level in [Consistency::None, Consistency::Weak, Consistency::Strong] {
        let req = QueryRequest::new(vec![Statement::new("SELECT * FROM foo")], level).atomic(true);
        let rows = store.query(&req).await.unwrap();
        assert_eq!(rows[0].columns, vec!["id", "name"]);
        assert_eq!(
            rows[0].values,
            vec![vec![Value::Integer(1), Value::Text("fiona".to_string())]]
        );
    }

    store.close(true).await.unwrap();
}

/// An atomic batch with a failing statement must leave no trace (and the
/// statements after the failure are skipped).
#[tokio::test]
async fn atomic_batch_rolls_back_on_error() {
    let (store, _dir) = open_leader(true).await;

    store
        .execute(&exec_req(&["CREATE TABLE foo (id INTEGER PRIMARY KEY)"]))
        .await
        .unwrap();

    let req = ExecuteRequest::new(vec![
        Statement::new("INSERT INTO foo VALUES(1)"),
        Statement::new("INSERT INTO nope VALUES(1)"),
        Statement::new("INSERT INTO foo VALUES(2)"),
    ])
    .atomic(true);
    let results = store.execute(&req).await.unwrap();
    assert!(results[0].error.is_none());
    assert_eq!(results[1].error.as_deref(), Some("no such table: nope"));
    assert_eq!(results[2].error.as_deref(), Some("statement skipped"));

    let rows = store
        .query(&query_req("SELECT count(*) FROM foo", Consistency::Strong))
        .await
        .unwrap();
    assert_eq!(rows[0].values, vec![vec![Value::Integer(0)]]);

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn load_dump_as_single_statement() {
    let (store, _dir) = open_leader(true).await;

    let results = store.execute(&exec_req(&[SIMPLE_DUMP])).await.unwrap();
    assert!(results[0].error.is_none());

    let rows = store
        .query(&query_req("SELECT * FROM foo", Consistency::Strong))
        .await
        .unwrap();
    assert_eq!(rows[0].columns, vec!["id", "name"]);
    assert_eq!(
        rows[0].values,
        vec![vec![Value::Integer(1), Value::Text("fiona".to_string())]]
    );

    store.close(true).await.unwrap();
}

/// Replaying a dump that conflicts with existing state walks through the
/// full abort story: the failed run leaves its transaction open, plain
/// `execute` exposes it, and `execute_or_abort` resets it.
#[tokio::test]
async fn load_dump_abort_on_error() {
    let (store, _dir) = open_leader(true).await;

    let r = store.execute(&exec_req(&[CREATE_DUMP])).await.unwrap();
    assert!(r[0].error.is_none());

    let r = store.execute(&exec_req(&[CREATE_DUMP])).await.unwrap();
    assert_eq!(r[0].error.as_deref(), Some("table foo already exists"));

    let r = store.execute(&exec_req(&[CREATE_DUMP])).await.unwrap();
    assert_eq!(
        r[0].error.as_deref(),
        Some("cannot start a transaction within a transaction")
    );

    let r = store
        .execute_or_abort(&exec_req(&[CREATE_DUMP]))
        .await
        .unwrap();
    assert_eq!(
        r[0].error.as_deref(),
        Some("cannot start a transaction within a transaction")
    );

    // The abort reset the connection, so the original failure is back.
    let r = store.execute(&exec_req(&[CREATE_DUMP])).await.unwrap();
    assert_eq!(r[0].error.as_deref(), Some("table foo already exists"));

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn load_dump_with_no_statements() {
    let (store, _dir) = open_leader(true).await;

    let dump = "PRAGMA foreign_keys=OFF;\nBEGIN TRANSACTION;\nCOMMIT;\n";
    let results = store.execute(&exec_req(&[dump])).await.unwrap();
    assert!(results[0].error.is_none());

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn load_empty_dump_and_empty_batch() {
    let (store, _dir) = open_leader(true).await;

    let results = store.execute(&exec_req(&[""])).await.unwrap();
    assert!(results[0].error.is_none());

    let results = store.execute(&ExecuteRequest::new(Vec::new())).await.unwrap();
    assert!(results.is_empty());

    store.close(true).await.unwrap();
}

/// A binary backup of a file-backed store is the database file, byte for
/// byte.
#[tokio::test]
async fn backup_binary_file_backed() {
    let (store, dir) = open_leader(false).await;

    store.execute(&exec_req(&[SIMPLE_DUMP])).await.unwrap();

    let mut backup = Vec::new();
    store
        .backup(true, BackupFormat::Binary, &mut backup)
        .await
        .unwrap();

    let db_file = std::fs::read(dir.path().join("db.sqlite")).unwrap();
    assert_eq!(backup, db_file);

    store.close(true).await.unwrap();
}

/// A fresh node opened over a binary backup serves the same rows as the
/// source.
#[tokio::test]
async fn backup_binary_restores_into_fresh_node() {
    let (store, _dir) = open_leader(false).await;
    store.execute(&exec_req(&[SIMPLE_DUMP])).await.unwrap();

    let mut backup = Vec::new();
    store
        .backup(true, BackupFormat::Binary, &mut backup)
        .await
        .unwrap();
    store.close(true).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("db.sqlite"), &backup).unwrap();
    let config = new_config(false, dir.path());
    let fresh = Store::open(config, ClusterRouter::new(), true)
        .await
        .unwrap();
    fresh.wait_for_leader(Duration::from_secs(10)).await.unwrap();

    let rows = fresh
        .query(&query_req("SELECT * FROM foo", Consistency::None))
        .await
        .unwrap();
    assert_eq!(rows[0].columns, vec!["id", "name"]);
    assert_eq!(
        rows[0].values,
        vec![vec![Value::Integer(1), Value::Text("fiona".to_string())]]
    );

    fresh.close(true).await.unwrap();
}

/// A binary backup of a memory-backed store is a valid SQLite image with
/// the same contents.
#[tokio::test]
async fn backup_binary_memory_backed() {
    let (store, dir) = open_leader(true).await;

    store.execute(&exec_req(&[SIMPLE_DUMP])).await.unwrap();

    let mut backup = Vec::new();
    store
        .backup(true, BackupFormat::Binary, &mut backup)
        .await
        .unwrap();

    let path = dir.path().join("backup.db");
    std::fs::write(&path, &backup).unwrap();
    let conn = rusqlite::Connection::open(&path).unwrap();
    let name: String = conn
        .query_row("SELECT name FROM foo WHERE id = 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(name, "fiona");

    store.close(true).await.unwrap();
}

/// A SQL backup round-trips the exact dump text that was loaded.
#[tokio::test]
async fn backup_sql_text() {
    let (store, _dir) = open_leader(true).await;

    store.execute(&exec_req(&[SIMPLE_DUMP])).await.unwrap();

    let mut backup = Vec::new();
    store
        .backup(true, BackupFormat::Sql, &mut backup)
        .await
        .unwrap();
    assert_eq!(String::from_utf8(backup).unwrap(), SIMPLE_DUMP);

    store.close(true).await.unwrap();
}

/// Without a leader there is nothing consistent to back up.
#[tokio::test]
async fn backup_leader_only_refused_without_leader() {
    let dir = tempfile::tempdir().unwrap();
    let config = new_config(true, dir.path());
    let store = Store::open(config, ClusterRouter::new(), false)
        .await
        .unwrap();

    let mut sink = Vec::new();
    let err = store.backup(true, BackupFormat::Binary, &mut sink).await;
    assert!(matches!(err, Err(StoreError::NotLeader)));

    // A local backup is still allowed.
    store
        .backup(false, BackupFormat::Binary, &mut sink)
        .await
        .unwrap();

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn parameterized_statements_and_timings() {
    let (store, _dir) = open_leader(true).await;

    store
        .execute(&exec_req(&["CREATE TABLE foo (id INTEGER, name TEXT)"]))
        .await
        .unwrap();

    let req = ExecuteRequest::new(vec![Statement::with_parameters(
        "INSERT INTO foo(id, name) VALUES(?1, ?2)",
        vec![Value::Integer(3), Value::Text("eve".to_string())],
    )])
    .timings(true);
    let results = store.execute(&req).await.unwrap();
    assert!(results[0].error.is_none());
    assert_eq!(results[0].rows_affected, 1);
    assert!(results[0].time.is_some());

    let req = QueryRequest::new(
        vec![Statement::with_parameters(
            "SELECT name FROM foo WHERE id = ?1",
            vec![Value::Integer(3)],
        )],
        Consistency::Weak,
    )
    .timings(true);
    let rows = store.query(&req).await.unwrap();
    assert_eq!(rows[0].values, vec![vec![Value::Text("eve".to_string())]]);
    assert!(rows[0].time.is_some());

    store.close(true).await.unwrap();
}

#[tokio::test]
async fn last_insert_id_is_reported() {
    let (store, _dir) = open_leader(true).await;

    store
        .execute(&exec_req(&[
            "CREATE TABLE foo (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)",
        ]))
        .await
        .unwrap();
    let results = store
        .execute(&exec_req(&["INSERT INTO foo(name) VALUES('fiona')"]))
        .await
        .unwrap();
    assert_eq!(results[0].last_insert_id, 1);

    let results = store
        .execute(&exec_req(&["INSERT INTO foo(name) VALUES('declan')"]))
        .await
        .unwrap();
    assert_eq!(results[0].last_insert_id, 2);

    store.close(true).await.unwrap();
}
