//! Textual backup writer, equivalent to `sqlite3 .dump` for the schema
//! objects this store manages.

use std::io::Write;

use rusqlite::Connection;

use crate::error::Result;

/// Writes a SQL dump of `conn` that can be replayed into an empty database:
/// `PRAGMA foreign_keys=OFF;`, a transaction wrapping the schema `CREATE`
/// statements and one `INSERT` per row, then `COMMIT;`. Row literals are
/// produced with SQLite's own `quote()` so the output matches the canonical
/// dump format byte for byte.
pub(crate) fn dump_sql(conn: &Connection, w: &mut dyn Write) -> Result<()> {
    w.write_all(b"PRAGMA foreign_keys=OFF;\n")?;
    w.write_all(b"BEGIN TRANSACTION;\n")?;

    let mut tables = Vec::new();
    {
        let mut stmt =
            conn.prepare("SELECT name, sql FROM sqlite_master WHERE type = 'table' AND sql NOT NULL")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let sql: String = row.get(1)?;
            tables.push((name, sql));
        }
    }

    for (name, sql) in tables {
        if name == "sqlite_sequence" {
            w.write_all(b"DELETE FROM sqlite_sequence;\n")?;
            continue;
        }
        if is_internal(&name) {
            continue;
        }
        writeln!(w, "{sql};")?;

        let columns = table_columns(conn, &name)?;
        if columns.is_empty() {
            continue;
        }
        let quoted = columns
            .iter()
            .map(|c| format!("quote(\"{}\")", ident(c)))
            .collect::<Vec<_>>()
            .join(" || ',' || ");
        let select = format!(
            "SELECT 'INSERT INTO \"{t}\" VALUES(' || {quoted} || ')' FROM \"{t}\"",
            t = ident(&name),
        );
        let mut stmt = conn.prepare(&select)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let line: String = row.get(0)?;
            writeln!(w, "{line};")?;
        }
    }

    // Indexes, triggers and views come after the data they refer to.
    let mut stmt = conn.prepare(
        "SELECT sql, tbl_name FROM sqlite_master \
         WHERE sql NOT NULL AND type IN ('index', 'trigger', 'view')",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let sql: String = row.get(0)?;
        let tbl: String = row.get(1)?;
        if is_internal(&tbl) {
            continue;
        }
        writeln!(w, "{sql};")?;
    }

    w.write_all(b"COMMIT;\n")?;
    Ok(())
}

/// Tables the store keeps for itself are not part of the user's data.
fn is_internal(name: &str) -> bool {
    name.starts_with("sqlite_") || name.starts_with("_store_")
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let mut rows = stmt.query([table])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(0)?);
    }
    Ok(columns)
}

fn ident(name: &str) -> String {
    name.replace('"', "\"\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_matches_canonical_form() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE foo (id integer not null primary key, name text);
             INSERT INTO foo VALUES(1,'fiona');",
        )
        .unwrap();

        let mut out = Vec::new();
        dump_sql(&conn, &mut out).unwrap();
        let exp = "PRAGMA foreign_keys=OFF;
BEGIN TRANSACTION;
CREATE TABLE foo (id integer not null primary key, name text);
INSERT INTO \"foo\" VALUES(1,'fiona');
COMMIT;
";
        assert_eq!(String::from_utf8(out).unwrap(), exp);
    }

    #[test]
    fn dump_skips_store_tables_and_quotes_values() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE _store_meta (key TEXT PRIMARY KEY, value TEXT);
             INSERT INTO _store_meta VALUES('last_applied','{}');
             CREATE TABLE t (a TEXT, b REAL);
             INSERT INTO t VALUES('it''s',1.5);",
        )
        .unwrap();

        let mut out = Vec::new();
        dump_sql(&conn, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("_store_meta"));
        assert!(text.contains("INSERT INTO \"t\" VALUES('it''s',1.5);"));
    }

    #[test]
    fn empty_database_dumps_header_only() {
        let conn = Connection::open_in_memory().unwrap();
        let mut out = Vec::new();
        dump_sql(&conn, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "PRAGMA foreign_keys=OFF;\nBEGIN TRANSACTION;\nCOMMIT;\n"
        );
    }
}
