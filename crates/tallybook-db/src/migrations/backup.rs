use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use tallybook_common::Error;
use tracing::{debug, info, warn};

use super::error::{MigrationError, MigrationResult};

const BACKUP_EXTENSION: &str = "bak";

/// A snapshot file found in the backup directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Writes pre-migration snapshots of the database and enforces retention.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
    /// Snapshots to retain; 0 keeps all of them.
    keep: usize,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the live database into a timestamped file and verify it on disk.
    ///
    /// Uses `VACUUM INTO`, which produces a consistent copy even while other
    /// connections hold the database open in WAL mode.
    pub fn create_backup(&self, conn: &Connection, label: &str) -> MigrationResult<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            MigrationError::System(format!(
                "failed to create backup directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let file_name = format!(
            "{}_{}_{}.{BACKUP_EXTENSION}",
            database_stem(conn),
            Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            sanitize(label)
        );
        let path = self.dir.join(file_name);

        conn.execute("VACUUM INTO ?1", params![path.to_string_lossy().into_owned()])
            .map_err(|e| {
                MigrationError::System(format!(
                    "failed to write backup {} before {label}: {e}",
                    path.display()
                ))
            })?;

        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(MigrationError::System(format!(
                "backup {} is missing or empty after snapshot",
                path.display()
            )));
        }

        info!(path = %path.display(), size_bytes = size, "database backup created");
        Ok(path)
    }

    /// Backups in the directory, newest first.
    pub fn list_backups(&self) -> tallybook_common::Result<Vec<BackupFile>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BACKUP_EXTENSION) {
                continue;
            }
            let meta = std::fs::metadata(&path)?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            backups.push(BackupFile {
                path,
                size_bytes: meta.len(),
                modified,
            });
        }

        backups.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(backups)
    }

    /// Delete snapshots beyond the retention limit. Files in `protect` are never
    /// removed, even when that leaves more than `keep` behind. Returns the deleted paths.
    pub fn prune(&self, protect: &[PathBuf]) -> tallybook_common::Result<Vec<PathBuf>> {
        if self.keep == 0 {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for backup in self.list_backups()?.into_iter().skip(self.keep) {
            if protect.contains(&backup.path) {
                continue;
            }
            match std::fs::remove_file(&backup.path) {
                Ok(()) => {
                    debug!(path = %backup.path.display(), "old backup removed");
                    removed.push(backup.path);
                }
                Err(e) => warn!("failed to remove old backup {}: {e}", backup.path.display()),
            }
        }
        Ok(removed)
    }

    /// Overwrite `database` with the snapshot at `backup`.
    ///
    /// No connection to `database` may be open while this runs.
    pub fn restore(backup: &Path, database: &Path) -> tallybook_common::Result<()> {
        if !backup.is_file() {
            return Err(Error::NotFound(backup.display().to_string()));
        }

        for suffix in ["-wal", "-shm"] {
            let mut side = database.as_os_str().to_owned();
            side.push(suffix);
            let side = PathBuf::from(side);
            if side.exists() {
                std::fs::remove_file(&side).map_err(|e| {
                    Error::Backup(format!("failed to remove {}: {e}", side.display()))
                })?;
            }
        }

        std::fs::copy(backup, database).map_err(|e| {
            Error::Backup(format!(
                "failed to restore {} from {}: {e}",
                database.display(),
                backup.display()
            ))
        })?;

        info!(
            "database {} restored from {}",
            database.display(),
            backup.display()
        );
        Ok(())
    }
}

fn database_stem(conn: &Connection) -> String {
    conn.path()
        .filter(|p| !p.is_empty())
        .and_then(|p| Path::new(p).file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "memory".to_string())
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_conn(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE expenses (id INTEGER PRIMARY KEY, amount REAL);
             INSERT INTO expenses (amount) VALUES (1200.0), (480.5);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn backup_is_a_readable_copy_of_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let conn = seeded_conn(&dir.path().join("books.db"));
        let manager = BackupManager::new(dir.path().join("backups"), 5);

        let path = manager.create_backup(&conn, "002_add_user_authentication").unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("books_"));
        assert!(file_name.ends_with("_002_add_user_authentication.bak"));

        let copy = Connection::open(&path).unwrap();
        let count: i64 = copy
            .query_row("SELECT COUNT(*) FROM expenses", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn in_memory_databases_can_be_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER);").unwrap();

        let path = BackupManager::new(dir.path(), 0)
            .create_backup(&conn, "001 init/../x")
            .unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("memory_"));
        assert!(file_name.ends_with("_001_init____x.bak"));
        assert_eq!(path.parent(), Some(dir.path()));
    }

    #[test]
    fn unwritable_backup_location_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let conn = Connection::open_in_memory().unwrap();

        let err = BackupManager::new(&blocker, 1)
            .create_backup(&conn, "001")
            .unwrap_err();
        assert!(matches!(err, MigrationError::System(_)));
    }

    #[test]
    fn prune_keeps_newest_and_protected_backups() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a_1.bak", "a_2.bak", "a_3.bak", "a_4.bak", "a_5.bak", "books.db"] {
            std::fs::write(dir.path().join(name), b"snapshot").unwrap();
        }
        let manager = BackupManager::new(dir.path(), 2);
        let protected = vec![dir.path().join("a_1.bak"), dir.path().join("a_2.bak")];

        let removed = manager.prune(&protected).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(protected.iter().all(|p| p.exists()));
        assert!(dir.path().join("books.db").exists());
        assert_eq!(manager.list_backups().unwrap().len(), 4);
    }

    #[test]
    fn prune_with_zero_retention_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a_1.bak", "a_2.bak", "a_3.bak"] {
            std::fs::write(dir.path().join(name), b"snapshot").unwrap();
        }
        let manager = BackupManager::new(dir.path(), 0);
        assert!(manager.prune(&[]).unwrap().is_empty());
        assert_eq!(manager.list_backups().unwrap().len(), 3);
    }

    #[test]
    fn list_backups_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path().join("never-created"), 3);
        assert!(manager.list_backups().unwrap().is_empty());
    }

    #[test]
    fn restore_replaces_the_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("books.db");
        let manager = BackupManager::new(dir.path().join("backups"), 5);

        let backup = {
            let conn = seeded_conn(&db_path);
            let backup = manager.create_backup(&conn, "before").unwrap();
            conn.execute("DELETE FROM expenses", []).unwrap();
            backup
        };

        BackupManager::restore(&backup, &db_path).unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM expenses", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn restore_from_missing_backup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = BackupManager::restore(&dir.path().join("nope.db"), &dir.path().join("books.db"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
