use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use rusqlite::Connection;
use tallybook_config::{AppConfig, ConcurrencyMode};
use tallybook_db::migrations::{
    AutoMigrationOptions, AutoMigrationService, BackupManager, ConcurrencyPolicy, MigrationError,
    builtin_registry,
};
use tallybook_db::{open_database, open_read_only};

/// Exit status when another process is already migrating the database.
const EXIT_TEMPFAIL: i32 = 75;

pub fn open(config: &AppConfig) -> Result<Connection> {
    let path = config.database_path();
    open_database(&path, Duration::from_millis(config.database.busy_timeout_ms))
        .with_context(|| format!("failed to open {}", path.display()))
}

/// Read-only connection for inspection commands. `None` when the database file has
/// not been created yet; nothing is written to disk either way.
pub fn open_existing(config: &AppConfig) -> Result<Option<Connection>> {
    let path = config.database_path();
    if !path.is_file() {
        return Ok(None);
    }
    open_read_only(&path, Duration::from_millis(config.database.busy_timeout_ms))
        .map(Some)
        .with_context(|| format!("failed to open {}", path.display()))
}

pub fn migration_options(config: &AppConfig) -> Result<AutoMigrationOptions> {
    let m = &config.migrations;
    let timezone: Tz = m
        .timezone
        .parse()
        .map_err(|e| anyhow!("invalid migrations.timezone {:?}: {e}", m.timezone))?;

    let concurrency = match m.on_concurrent_run {
        ConcurrencyMode::Abort => ConcurrencyPolicy::Abort,
        ConcurrencyMode::Retry => ConcurrencyPolicy::Retry {
            attempts: m.retry_attempts,
            backoff: Duration::from_millis(m.retry_backoff_ms),
        },
    };

    Ok(AutoMigrationOptions {
        timezone,
        stale_lock_after: (m.stale_lock_after_secs > 0)
            .then(|| Duration::from_secs(m.stale_lock_after_secs)),
        slow_migration_threshold: (m.slow_migration_warn_ms > 0)
            .then(|| Duration::from_millis(m.slow_migration_warn_ms)),
        concurrency,
    })
}

pub fn build_service(config: &AppConfig) -> Result<AutoMigrationService> {
    let registry = builtin_registry().context("built-in migration catalog is invalid")?;
    let backups = BackupManager::new(config.backup_dir(), config.migrations.keep_backups);
    Ok(AutoMigrationService::new(
        registry,
        backups,
        migration_options(config)?,
    ))
}

/// A bare file name is looked up in the backup directory.
pub fn resolve_backup(backup_dir: &Path, backup: PathBuf) -> PathBuf {
    if backup.exists() || backup.components().count() > 1 {
        return backup;
    }
    backup_dir.join(backup)
}

pub fn exit_code(err: &MigrationError) -> i32 {
    if err.is_retryable() { EXIT_TEMPFAIL } else { 1 }
}
