use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, usually read from `~/.tallybook/config.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `~/.tallybook/data/tallybook.db`.
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5000,
        }
    }
}

/// What to do when another process is already migrating the same database.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    #[default]
    Abort,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MigrationConfig {
    /// Snapshot directory. Defaults to a `backups` directory next to the database.
    pub backup_dir: Option<PathBuf>,
    /// Number of snapshots to retain; 0 keeps all of them.
    pub keep_backups: usize,
    /// IANA zone used for `applied_at` timestamps in the ledger.
    pub timezone: String,
    /// Age after which an in-progress flag left by a dead process is taken over; 0 disables.
    pub stale_lock_after_secs: u64,
    pub slow_migration_warn_ms: u64,
    pub on_concurrent_run: ConcurrencyMode,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            backup_dir: None,
            keep_backups: 10,
            timezone: "Asia/Tokyo".to_string(),
            stale_lock_after_secs: 600,
            slow_migration_warn_ms: 1000,
            on_concurrent_run: ConcurrencyMode::Abort,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Resolved database file path.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| default_home().join("data").join("tallybook.db"))
    }

    /// Resolved backup directory.
    pub fn backup_dir(&self) -> PathBuf {
        if let Some(dir) = &self.migrations.backup_dir {
            return dir.clone();
        }
        self.database_path()
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| default_home().join("backups"))
    }
}

/// `~/.tallybook`, or `./.tallybook` when no home directory is known.
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tallybook")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_dir_defaults_next_to_database() {
        let mut config = AppConfig::default();
        config.database.path = Some(PathBuf::from("/var/lib/tallybook/app.db"));
        assert_eq!(
            config.backup_dir(),
            PathBuf::from("/var/lib/tallybook/backups")
        );

        config.migrations.backup_dir = Some(PathBuf::from("/mnt/snapshots"));
        assert_eq!(config.backup_dir(), PathBuf::from("/mnt/snapshots"));
    }

    #[test]
    fn concurrency_mode_uses_lowercase_names() {
        let mode: ConcurrencyMode = serde_yaml::from_str("retry").unwrap();
        assert_eq!(mode, ConcurrencyMode::Retry);
        assert_eq!(serde_yaml::to_string(&ConcurrencyMode::Abort).unwrap().trim(), "abort");
    }
}
