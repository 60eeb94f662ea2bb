use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tallybook_common::{Error, Result};
use tracing::info;

/// Open (creating if needed) the database file with the pragmas every
/// Tallybook connection uses.
pub fn open_database(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    info!("opening database at {}", db_path.display());
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::Database(format!(
                "failed to create data directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let conn = Connection::open(db_path)
        .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
    configure(&conn, busy_timeout)?;
    Ok(conn)
}

/// Open an existing database without creating it or changing its journal mode.
pub fn open_read_only(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if !db_path.is_file() {
        return Err(Error::NotFound(db_path.display().to_string()));
    }
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| Error::Database(format!("failed to open database read-only: {e}")))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()
        .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
    configure(&conn, Duration::from_secs(5))?;
    Ok(conn)
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
    Ok(())
}
