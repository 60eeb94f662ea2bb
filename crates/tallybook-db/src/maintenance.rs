use rusqlite::Connection;
use serde::Serialize;
use tallybook_common::{Error, Result};
use tracing::{debug, warn};

/// Outcome of `PRAGMA integrity_check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub ok: bool,
    /// Problems reported by SQLite; empty when `ok`.
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub name: String,
    pub rows: i64,
}

/// Size and per-table row counts of a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub tables: Vec<TableStats>,
    pub page_count: i64,
    pub page_size: i64,
    pub size_bytes: i64,
}

pub fn check_integrity(conn: &Connection) -> Result<IntegrityReport> {
    let mut stmt = conn
        .prepare("PRAGMA integrity_check")
        .map_err(|e| Error::Database(format!("failed to prepare integrity check: {e}")))?;
    let messages = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| Error::Database(format!("integrity check failed to run: {e}")))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::Database(format!("failed to read integrity check: {e}")))?;

    let ok = messages.len() == 1 && messages[0] == "ok";
    if ok {
        debug!("database integrity check passed");
        return Ok(IntegrityReport {
            ok,
            problems: Vec::new(),
        });
    }
    warn!(problems = messages.len(), "database integrity check failed");
    Ok(IntegrityReport {
        ok,
        problems: messages,
    })
}

/// Row counts for every user table, ordered by name, plus page usage.
pub fn database_stats(conn: &Connection) -> Result<DatabaseStats> {
    let names: Vec<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(|e| Error::Database(format!("failed to list tables: {e}")))?;
        stmt.query_map([], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to list tables: {e}")))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| Error::Database(format!("failed to list tables: {e}")))?
    };

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let rows: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM \"{}\"", name.replace('"', "\"\"")),
                [],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to count rows in {name}: {e}")))?;
        tables.push(TableStats { name, rows });
    }

    let pragma = |name: &str| -> Result<i64> {
        conn.query_row(&format!("PRAGMA {name}"), [], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to read {name}: {e}")))
    };
    let page_count = pragma("page_count")?;
    let page_size = pragma("page_size")?;

    Ok(DatabaseStats {
        tables,
        page_count,
        page_size,
        size_bytes: page_count * page_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_database_passes_integrity_check() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);").unwrap();

        let report = check_integrity(&conn).unwrap();
        assert!(report.ok);
        assert!(report.problems.is_empty());
    }

    #[test]
    fn stats_count_rows_per_table_in_name_order() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE subscriptions (id INTEGER PRIMARY KEY);
             CREATE TABLE expenses (id INTEGER PRIMARY KEY AUTOINCREMENT);
             CREATE TABLE \"odd \"\"name\" (id INTEGER);
             INSERT INTO expenses DEFAULT VALUES;
             INSERT INTO expenses DEFAULT VALUES;
             INSERT INTO subscriptions DEFAULT VALUES;",
        )
        .unwrap();

        let stats = database_stats(&conn).unwrap();
        let rows: Vec<_> = stats
            .tables
            .iter()
            .map(|t| (t.name.as_str(), t.rows))
            .collect();
        assert_eq!(
            rows,
            vec![("expenses", 2), ("odd \"name", 0), ("subscriptions", 1)]
        );
        assert!(stats.page_count > 0);
        assert_eq!(stats.size_bytes, stats.page_count * stats.page_size);
    }
}
