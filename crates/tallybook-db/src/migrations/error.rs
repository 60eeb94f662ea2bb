use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failure of the startup migration engine.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("failed to initialize migration ledger: {0}")]
    Initialization(String),

    #[error("another migration run is in progress: {0}")]
    Concurrency(String),

    #[error("migration {name} failed: {cause}")]
    Execution {
        name: String,
        cause: String,
        backup_path: Option<PathBuf>,
    },

    #[error("checksum mismatch for migration {name}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
        backup_path: Option<PathBuf>,
    },

    #[error("system error: {0}")]
    System(String),

    #[error("duplicate migration name: {0}")]
    DuplicateMigrationName(String),

    #[error("migration {name} is already recorded in the ledger")]
    AlreadyRecorded {
        name: String,
        backup_path: Option<PathBuf>,
    },

    #[error("migration {name} was applied but could not be recorded: {cause}")]
    Recording {
        name: String,
        cause: String,
        backup_path: Option<PathBuf>,
    },

    #[error("ledger error: {0}")]
    Ledger(String),
}

pub type MigrationResult<T> = std::result::Result<T, MigrationError>;

/// Coarse classification used for logging and operator output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationErrorKind {
    Initialization,
    Concurrency,
    Execution,
    ChecksumMismatch,
    System,
    Registry,
    Ledger,
}

impl MigrationErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialization => "InitializationError",
            Self::Concurrency => "ConcurrencyError",
            Self::Execution => "ExecutionError",
            Self::ChecksumMismatch => "ChecksumMismatch",
            Self::System => "SystemError",
            Self::Registry => "RegistryError",
            Self::Ledger => "LedgerError",
        }
    }
}

impl std::fmt::Display for MigrationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MigrationError {
    pub fn kind(&self) -> MigrationErrorKind {
        match self {
            Self::Initialization(_) => MigrationErrorKind::Initialization,
            Self::Concurrency(_) => MigrationErrorKind::Concurrency,
            Self::Execution { .. } => MigrationErrorKind::Execution,
            Self::ChecksumMismatch { .. } => MigrationErrorKind::ChecksumMismatch,
            Self::System(_) => MigrationErrorKind::System,
            Self::DuplicateMigrationName(_) => MigrationErrorKind::Registry,
            Self::AlreadyRecorded { .. } | Self::Recording { .. } | Self::Ledger(_) => {
                MigrationErrorKind::Ledger
            }
        }
    }

    /// Only a concurrent run is worth retrying automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency(_))
    }

    /// Errors after which the application must not start.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Concurrency(_) | Self::System(_))
    }

    pub fn migration_name(&self) -> Option<&str> {
        match self {
            Self::Execution { name, .. }
            | Self::ChecksumMismatch { name, .. }
            | Self::AlreadyRecorded { name, .. }
            | Self::Recording { name, .. } => Some(name.as_str()),
            Self::DuplicateMigrationName(name) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn backup_path(&self) -> Option<&Path> {
        match self {
            Self::Execution { backup_path, .. }
            | Self::ChecksumMismatch { backup_path, .. }
            | Self::AlreadyRecorded { backup_path, .. }
            | Self::Recording { backup_path, .. } => backup_path.as_deref(),
            _ => None,
        }
    }

    /// Tie a failure that happened after `backup` was taken to the migration being
    /// attempted. A bare ledger failure becomes `Recording`; errors that cannot name a
    /// migration are returned unchanged.
    pub fn with_attempt(self, migration: &str, backup: &Path) -> Self {
        let attached = Some(backup.to_path_buf());
        match self {
            Self::Ledger(cause) => Self::Recording {
                name: migration.to_string(),
                cause,
                backup_path: attached,
            },
            Self::Execution { name, cause, .. } => Self::Execution {
                name,
                cause,
                backup_path: attached,
            },
            Self::ChecksumMismatch {
                name,
                expected,
                actual,
                ..
            } => Self::ChecksumMismatch {
                name,
                expected,
                actual,
                backup_path: attached,
            },
            Self::AlreadyRecorded { name, .. } => Self::AlreadyRecorded {
                name,
                backup_path: attached,
            },
            Self::Recording { name, cause, .. } => Self::Recording {
                name,
                cause,
                backup_path: attached,
            },
            other => other,
        }
    }

    pub(crate) fn execution(name: &str, cause: impl std::fmt::Display) -> Self {
        Self::Execution {
            name: name.to_string(),
            cause: cause.to_string(),
            backup_path: None,
        }
    }
}

/// True when SQLite refused the write lock because another connection holds it.
pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_concurrency_errors_are_retryable() {
        assert!(MigrationError::Concurrency("held".into()).is_retryable());
        assert!(!MigrationError::System("disk".into()).is_retryable());
        assert!(!MigrationError::execution("002", "boom").is_retryable());
    }

    #[test]
    fn execution_and_checksum_errors_are_fatal() {
        assert!(MigrationError::execution("002", "boom").is_fatal());
        assert!(
            MigrationError::ChecksumMismatch {
                name: "001".into(),
                expected: "a".into(),
                actual: "b".into(),
                backup_path: None,
            }
            .is_fatal()
        );
        assert!(!MigrationError::Concurrency("held".into()).is_fatal());
        assert!(!MigrationError::System("disk".into()).is_fatal());
    }

    #[test]
    fn backup_path_is_attached_to_migration_errors() {
        let path = Path::new("/tmp/backup.bak");
        let err = MigrationError::execution("002_add_user_authentication", "no such table")
            .with_attempt("002_add_user_authentication", path);
        assert_eq!(err.backup_path(), Some(path));
        assert_eq!(err.migration_name(), Some("002_add_user_authentication"));
        assert_eq!(err.kind().as_str(), "ExecutionError");

        let err = MigrationError::AlreadyRecorded {
            name: "001_create_basic_schema".into(),
            backup_path: None,
        }
        .with_attempt("001_create_basic_schema", path);
        assert_eq!(err.backup_path(), Some(path));

        let err = MigrationError::System("disk full".into()).with_attempt("002", path);
        assert!(err.backup_path().is_none());
    }

    #[test]
    fn ledger_failure_after_a_backup_names_the_migration() {
        let path = Path::new("/tmp/backup.bak");
        let err = MigrationError::Ledger("disk I/O error".into())
            .with_attempt("003_migrate_receipt_url", path);
        assert!(matches!(err, MigrationError::Recording { .. }));
        assert_eq!(err.migration_name(), Some("003_migrate_receipt_url"));
        assert_eq!(err.backup_path(), Some(path));
        assert_eq!(err.kind().as_str(), "LedgerError");
        assert!(err.is_fatal());
    }

    #[test]
    fn error_display_names_the_migration() {
        let err = MigrationError::execution("003_migrate_receipt_url", "no such column");
        assert_eq!(
            err.to_string(),
            "migration 003_migrate_receipt_url failed: no such column"
        );
    }
}
