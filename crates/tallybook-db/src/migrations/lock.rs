use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{MigrationError, MigrationResult, is_busy};

pub const LOCK_TABLE: &str = "migration_lock";

const LOCK_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS migration_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    in_progress INTEGER NOT NULL DEFAULT 0,
    owner TEXT,
    acquired_at TEXT
);
";

/// Current contents of the in-progress flag row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    pub in_progress: bool,
    pub owner: Option<String>,
    pub acquired_at: Option<String>,
}

/// Cross-process "migration running" flag stored in the database itself.
///
/// The flag is checked and set inside a `BEGIN IMMEDIATE` transaction, so two
/// processes can never both observe it clear.
pub struct MigrationLock;

impl MigrationLock {
    pub fn initialize(conn: &Connection) -> MigrationResult<()> {
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![LOCK_TABLE],
                |row| row.get(0),
            )
            .map_err(|e| MigrationError::Initialization(format!("failed to inspect schema: {e}")))?;
        if exists > 0 {
            return Ok(());
        }

        conn.execute_batch(LOCK_SCHEMA_SQL).map_err(|e| {
            MigrationError::Initialization(format!("failed to create {LOCK_TABLE}: {e}"))
        })?;
        debug!("migration lock table created");
        Ok(())
    }

    /// Read the flag without taking any lock. `None` when the table does not exist yet.
    pub fn state(conn: &Connection) -> MigrationResult<Option<LockState>> {
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![LOCK_TABLE],
                |row| row.get(0),
            )
            .map_err(|e| MigrationError::Ledger(format!("failed to inspect schema: {e}")))?;
        if exists == 0 {
            return Ok(None);
        }
        read_state(conn).map_err(|e| MigrationError::Ledger(format!("failed to read lock: {e}")))
    }

    /// Set the flag for this process. Fails fast with `Concurrency` when another run
    /// holds the database write lock or the flag. A flag older than `stale_after` is
    /// assumed to belong to a crashed process and is taken over.
    pub fn acquire(
        conn: &Connection,
        stale_after: Option<Duration>,
    ) -> MigrationResult<MigrationLockGuard<'_>> {
        let owner = format!("{}:{}", std::process::id(), Uuid::new_v4());

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(|e| lock_error("failed to begin exclusive transaction", e))?;

        tx.execute(
            &format!("INSERT OR IGNORE INTO {LOCK_TABLE} (id, in_progress) VALUES (1, 0)"),
            [],
        )
        .map_err(|e| lock_error("failed to seed lock row", e))?;

        if let Some(current) = read_state(&tx).map_err(|e| lock_error("failed to read lock", e))? {
            if current.in_progress {
                let holder = current.owner.as_deref().unwrap_or("unknown");
                let since = current.acquired_at.as_deref().unwrap_or("unknown time");
                if !is_stale(current.acquired_at.as_deref(), stale_after) {
                    return Err(MigrationError::Concurrency(format!(
                        "migration flag held by {holder} since {since}"
                    )));
                }
                warn!("taking over stale migration flag held by {holder} since {since}");
            }
        }

        tx.execute(
            &format!(
                "UPDATE {LOCK_TABLE} SET in_progress = 1, owner = ?1, acquired_at = ?2 WHERE id = 1"
            ),
            params![owner, Utc::now().to_rfc3339()],
        )
        .map_err(|e| lock_error("failed to set migration flag", e))?;

        tx.commit()
            .map_err(|e| lock_error("failed to commit migration flag", e))?;

        info!(owner = %owner, "migration flag acquired");
        Ok(MigrationLockGuard {
            conn,
            owner,
            released: false,
        })
    }
}

/// Clears the in-progress flag when released or dropped.
pub struct MigrationLockGuard<'conn> {
    conn: &'conn Connection,
    owner: String,
    released: bool,
}

impl MigrationLockGuard<'_> {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Move `acquired_at` to now so a long run is not mistaken for a crashed one.
    /// Fails with `Concurrency` when another process has taken the flag over.
    pub fn refresh(&self) -> MigrationResult<()> {
        let touched = self
            .conn
            .execute(
                &format!(
                    "UPDATE {LOCK_TABLE} SET acquired_at = ?1
                     WHERE id = 1 AND in_progress = 1 AND owner = ?2"
                ),
                params![Utc::now().to_rfc3339(), self.owner],
            )
            .map_err(|e| lock_error("failed to refresh migration flag", e))?;

        if touched == 0 {
            return Err(MigrationError::Concurrency(format!(
                "migration flag is no longer held by {}",
                self.owner
            )));
        }
        debug!(owner = %self.owner, "migration flag refreshed");
        Ok(())
    }

    /// Clear the flag, reporting failures instead of logging them.
    pub fn release(mut self) -> MigrationResult<()> {
        self.released = true;
        clear_flag(self.conn, &self.owner)
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = clear_flag(self.conn, &self.owner) {
            warn!("failed to clear migration flag held by {}: {e}", self.owner);
        }
    }
}

fn clear_flag(conn: &Connection, owner: &str) -> MigrationResult<()> {
    let cleared = conn
        .execute(
            &format!(
                "UPDATE {LOCK_TABLE} SET in_progress = 0, owner = NULL, acquired_at = NULL
                 WHERE id = 1 AND owner = ?1"
            ),
            params![owner],
        )
        .map_err(|e| MigrationError::System(format!("failed to clear migration flag: {e}")))?;

    if cleared == 0 {
        warn!("migration flag no longer owned by {owner}; leaving it untouched");
    } else {
        debug!(owner = %owner, "migration flag released");
    }
    Ok(())
}

fn read_state(conn: &Connection) -> rusqlite::Result<Option<LockState>> {
    conn.query_row(
        &format!("SELECT in_progress, owner, acquired_at FROM {LOCK_TABLE} WHERE id = 1"),
        [],
        |row| {
            Ok(LockState {
                in_progress: row.get::<_, i64>(0)? != 0,
                owner: row.get(1)?,
                acquired_at: row.get(2)?,
            })
        },
    )
    .optional()
}

fn is_stale(acquired_at: Option<&str>, stale_after: Option<Duration>) -> bool {
    let Some(limit) = stale_after else {
        return false;
    };
    let Some(acquired) = acquired_at.and_then(|s| DateTime::parse_from_rfc3339(s).ok()) else {
        // A set flag without a readable timestamp cannot be aged.
        return false;
    };
    let age = Utc::now().signed_duration_since(acquired.with_timezone(&Utc));
    age.to_std().map(|age| age >= limit).unwrap_or(false)
}

fn lock_error(context: &str, e: rusqlite::Error) -> MigrationError {
    if is_busy(&e) {
        MigrationError::Concurrency(format!("database is locked by another migration run ({e})"))
    } else {
        MigrationError::System(format!("{context}: {e}"))
    }
}
