use chrono::{DateTime, FixedOffset};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tracing::{debug, info};

use super::error::{MigrationError, MigrationResult};
use super::models::{AppliedMigration, MigrationDefinition};

pub const LEDGER_TABLE: &str = "schema_migrations";

const LEDGER_INDEXES: [&str; 3] = [
    "idx_schema_migrations_name",
    "idx_schema_migrations_applied_at",
    "idx_schema_migrations_version",
];

const LEDGER_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    version TEXT NOT NULL,
    description TEXT,
    checksum TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    execution_time_ms INTEGER,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_schema_migrations_name
    ON schema_migrations(name);

CREATE INDEX IF NOT EXISTS idx_schema_migrations_applied_at
    ON schema_migrations(applied_at);

CREATE INDEX IF NOT EXISTS idx_schema_migrations_version
    ON schema_migrations(version);
";

const SELECT_COLUMNS: &str =
    "id, name, version, description, checksum, applied_at, execution_time_ms, created_at";

/// Timestamp layout stored in `applied_at`. Sorts lexically within one offset.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Append-only record of applied migrations, stored in `schema_migrations`.
pub struct MigrationLedger;

impl MigrationLedger {
    /// Create the ledger table and its indexes. A no-op, issuing no writes, when they
    /// already exist.
    pub fn initialize(conn: &Connection) -> MigrationResult<()> {
        let present = count_schema_objects(conn)
            .map_err(|e| MigrationError::Initialization(format!("failed to inspect schema: {e}")))?;
        if present == 1 + LEDGER_INDEXES.len() {
            debug!("migration ledger already initialized");
            return Ok(());
        }

        conn.execute_batch(LEDGER_SCHEMA_SQL).map_err(|e| {
            MigrationError::Initialization(format!("failed to create {LEDGER_TABLE}: {e}"))
        })?;
        info!("migration ledger {LEDGER_TABLE} initialized");
        Ok(())
    }

    /// Whether the ledger table exists at all.
    pub fn exists(conn: &Connection) -> MigrationResult<bool> {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![LEDGER_TABLE],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n > 0)
        .map_err(|e| MigrationError::Ledger(format!("failed to inspect schema: {e}")))
    }

    /// All records in the order they were recorded. `applied_at` strings are not
    /// comparable across offsets, so insertion order (`id`) is authoritative.
    pub fn get_applied(conn: &Connection) -> MigrationResult<Vec<AppliedMigration>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM {LEDGER_TABLE} ORDER BY id ASC"
            ))
            .map_err(|e| MigrationError::Ledger(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], row_to_applied)
            .map_err(|e| MigrationError::Ledger(format!("failed to query ledger: {e}")))?;

        let mut applied = Vec::new();
        for row in rows {
            applied.push(
                row.map_err(|e| MigrationError::Ledger(format!("failed to read ledger row: {e}")))?,
            );
        }
        Ok(applied)
    }

    pub fn is_applied(conn: &Connection, name: &str) -> MigrationResult<bool> {
        conn.query_row(
            &format!("SELECT 1 FROM {LEDGER_TABLE} WHERE name = ?1"),
            params![name],
            |_| Ok(()),
        )
        .optional()
        .map(|row| row.is_some())
        .map_err(|e| MigrationError::Ledger(format!("failed to look up {name}: {e}")))
    }

    pub fn find(conn: &Connection, name: &str) -> MigrationResult<Option<AppliedMigration>> {
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM {LEDGER_TABLE} WHERE name = ?1"),
            params![name],
            row_to_applied,
        )
        .optional()
        .map_err(|e| MigrationError::Ledger(format!("failed to look up {name}: {e}")))
    }

    /// Insert exactly one row for `definition`. A second row for the same name is
    /// rejected as `AlreadyRecorded`.
    pub fn record(
        conn: &Connection,
        definition: &MigrationDefinition,
        applied_at: &DateTime<FixedOffset>,
        execution_time_ms: u64,
    ) -> MigrationResult<()> {
        let description = Some(definition.description()).filter(|d| !d.is_empty());
        let elapsed = i64::try_from(execution_time_ms).unwrap_or(i64::MAX);

        conn.execute(
            &format!(
                "INSERT INTO {LEDGER_TABLE}
                    (name, version, description, checksum, applied_at, execution_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![
                definition.name(),
                definition.version(),
                description,
                definition.checksum(),
                format_timestamp(applied_at),
                elapsed,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref f, _) if is_duplicate_name(f) => {
                MigrationError::AlreadyRecorded {
                    name: definition.name().to_string(),
                    backup_path: None,
                }
            }
            other => MigrationError::Recording {
                name: definition.name().to_string(),
                cause: other.to_string(),
                backup_path: None,
            },
        })?;

        debug!(migration = definition.name(), "migration recorded in ledger");
        Ok(())
    }
}

/// Only a uniqueness breach means the row exists; trigger aborts and CHECK
/// failures share the constraint primary code.
fn is_duplicate_name(err: &rusqlite::ffi::Error) -> bool {
    err.code == ErrorCode::ConstraintViolation
        && matches!(
            err.extended_code,
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
}

fn count_schema_objects(conn: &Connection) -> rusqlite::Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master
         WHERE (type = 'table' AND name = ?1)
            OR (type = 'index' AND name IN (?2, ?3, ?4))",
        params![
            LEDGER_TABLE,
            LEDGER_INDEXES[0],
            LEDGER_INDEXES[1],
            LEDGER_INDEXES[2]
        ],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn row_to_applied(row: &Row<'_>) -> rusqlite::Result<AppliedMigration> {
    Ok(AppliedMigration {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        description: row.get(3)?,
        checksum: row.get(4)?,
        applied_at: row.get(5)?,
        execution_time_ms: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .timestamp_opt(1_700_000_000 + secs, 0)
            .unwrap()
    }

    fn def(name: &str) -> MigrationDefinition {
        MigrationDefinition::sql(name, "1.0.0", format!("{name} description"), "SELECT 1;")
    }

    fn table_sql(conn: &Connection) -> String {
        conn.query_row(
            "SELECT sql FROM sqlite_master WHERE name = 'schema_migrations'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn initialize_is_idempotent_and_keeps_rows() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationLedger::initialize(&conn).unwrap();
        let schema = table_sql(&conn);
        MigrationLedger::record(&conn, &def("001_a"), &at(0), 12).unwrap();

        for _ in 0..5 {
            MigrationLedger::initialize(&conn).unwrap();
        }

        assert_eq!(table_sql(&conn), schema);
        let applied = MigrationLedger::get_applied(&conn).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].name, "001_a");
        assert_eq!(applied[0].execution_time_ms, Some(12));
    }

    #[test]
    fn initialize_creates_all_indexes() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationLedger::initialize(&conn).unwrap();
        assert_eq!(count_schema_objects(&conn).unwrap(), 4);
        assert!(MigrationLedger::exists(&conn).unwrap());
    }

    #[test]
    fn initialize_repairs_a_missing_index() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationLedger::initialize(&conn).unwrap();
        conn.execute_batch("DROP INDEX idx_schema_migrations_version;")
            .unwrap();

        MigrationLedger::initialize(&conn).unwrap();
        assert_eq!(count_schema_objects(&conn).unwrap(), 4);
    }

    #[test]
    fn get_applied_keeps_recording_order_across_timezone_changes() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationLedger::initialize(&conn).unwrap();

        // Recorded first, in Tokyo: "2023-11-15T07:13:20.000+09:00".
        MigrationLedger::record(&conn, &def("001_a"), &at(0), 1).unwrap();
        // Recorded an hour later after switching to UTC: "2023-11-14T23:13:20...",
        // which sorts before the first row as a string.
        let utc = FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(1_700_000_000 + 3600, 0)
            .unwrap();
        MigrationLedger::record(&conn, &def("002_b"), &utc, 1).unwrap();

        let applied = MigrationLedger::get_applied(&conn).unwrap();
        let names: Vec<_> = applied.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["001_a", "002_b"]);
        assert!(applied[1].applied_at < applied[0].applied_at);
    }

    #[test]
    fn record_rejects_a_second_row_for_the_same_name() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationLedger::initialize(&conn).unwrap();
        MigrationLedger::record(&conn, &def("001_a"), &at(0), 5).unwrap();

        let err = MigrationLedger::record(&conn, &def("001_a"), &at(1), 5).unwrap_err();
        assert!(matches!(err, MigrationError::AlreadyRecorded { ref name, .. } if name == "001_a"));
        assert_eq!(MigrationLedger::get_applied(&conn).unwrap().len(), 1);
    }

    #[test]
    fn trigger_rejection_is_a_recording_failure_not_a_duplicate() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationLedger::initialize(&conn).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER freeze_ledger BEFORE INSERT ON schema_migrations
             BEGIN SELECT RAISE(ABORT, 'ledger is frozen'); END;",
        )
        .unwrap();

        let err = MigrationLedger::record(&conn, &def("001_a"), &at(0), 5).unwrap_err();
        match err {
            MigrationError::Recording { name, cause, .. } => {
                assert_eq!(name, "001_a");
                assert!(cause.contains("ledger is frozen"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn record_stores_fixed_offset_timestamp_and_metadata() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationLedger::initialize(&conn).unwrap();
        let definition = def("001_a");
        MigrationLedger::record(&conn, &definition, &at(0), 42).unwrap();

        let record = MigrationLedger::find(&conn, "001_a").unwrap().unwrap();
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.description.as_deref(), Some("001_a description"));
        assert_eq!(record.checksum, definition.checksum());
        assert!(record.applied_at.ends_with("+09:00"));
        assert_eq!(record.applied_at_parsed(), Some(at(0)));
        assert!(!record.created_at.is_empty());
    }

    #[test]
    fn is_applied_reflects_recorded_names() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationLedger::initialize(&conn).unwrap();
        assert!(!MigrationLedger::is_applied(&conn, "001_a").unwrap());

        MigrationLedger::record(&conn, &def("001_a"), &at(0), 0).unwrap();
        assert!(MigrationLedger::is_applied(&conn, "001_a").unwrap());
        assert!(MigrationLedger::find(&conn, "002_b").unwrap().is_none());
    }
}
