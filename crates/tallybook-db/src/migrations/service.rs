use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use super::backup::BackupManager;
use super::error::{MigrationError, MigrationResult};
use super::executor::MigrationExecutor;
use super::ledger::{MigrationLedger, format_timestamp};
use super::lock::MigrationLock;
use super::models::{
    AppliedMigration, AutoMigrationResult, MigrationDefinition, MigrationStatusReport,
};
use super::registry::MigrationRegistry;

/// Progress of a startup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Idle,
    Initializing,
    CheckingPending,
    Executing { index: usize, total: usize },
    Completed,
    Failed,
}

/// Reaction to another process holding the migration flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// Return `Concurrency` immediately.
    #[default]
    Abort,
    /// Try again up to `attempts` more times, sleeping `backoff * attempt` in between.
    Retry { attempts: u32, backoff: Duration },
}

#[derive(Debug, Clone)]
pub struct AutoMigrationOptions {
    /// Zone used for `applied_at` in the ledger.
    pub timezone: Tz,
    /// Take over an in-progress flag older than this.
    pub stale_lock_after: Option<Duration>,
    pub slow_migration_threshold: Option<Duration>,
    pub concurrency: ConcurrencyPolicy,
}

impl Default for AutoMigrationOptions {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Tokyo,
            stale_lock_after: Some(Duration::from_secs(600)),
            slow_migration_threshold: Some(Duration::from_secs(1)),
            concurrency: ConcurrencyPolicy::Abort,
        }
    }
}

/// Applies every pending migration once at application startup.
pub struct AutoMigrationService {
    registry: MigrationRegistry,
    backups: BackupManager,
    executor: MigrationExecutor,
    options: AutoMigrationOptions,
    state: MigrationState,
}

impl AutoMigrationService {
    pub fn new(
        registry: MigrationRegistry,
        backups: BackupManager,
        options: AutoMigrationOptions,
    ) -> Self {
        let executor = MigrationExecutor::new(options.slow_migration_threshold);
        Self {
            registry,
            backups,
            executor,
            options,
            state: MigrationState::Idle,
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Bring the schema up to date. Must be called once, before anything else
    /// touches the schema; a fatal error means the application must not start.
    pub fn run_startup_migrations(
        &mut self,
        conn: &Connection,
    ) -> MigrationResult<AutoMigrationResult> {
        let mut attempt = 0u32;
        loop {
            match self.run_once(conn) {
                Err(e) if e.is_retryable() => match self.options.concurrency {
                    ConcurrencyPolicy::Retry { attempts, backoff } if attempt < attempts => {
                        attempt += 1;
                        let wait = backoff * attempt;
                        warn!(
                            attempt = attempt,
                            max_attempts = attempts,
                            wait_ms = wait.as_millis() as u64,
                            "migration run in progress elsewhere, retrying: {e}"
                        );
                        std::thread::sleep(wait);
                    }
                    _ => return Err(e),
                },
                other => return other,
            }
        }
    }

    fn run_once(&mut self, conn: &Connection) -> MigrationResult<AutoMigrationResult> {
        self.state = MigrationState::Idle;
        let started = Instant::now();
        let mut backups_taken: Vec<PathBuf> = Vec::new();

        match self.drive(conn, &mut backups_taken) {
            Ok(mut result) => {
                self.transition(MigrationState::Completed);
                result.backup_path = backups_taken.last().cloned();
                result.total_execution_time_ms = started.elapsed().as_millis() as u64;

                // Every snapshot of this run survives retention, the pre-run one included.
                if !backups_taken.is_empty() {
                    if let Err(e) = self.backups.prune(&backups_taken) {
                        warn!("backup retention pass failed: {e}");
                    }
                }

                if result.is_noop() {
                    info!("database schema is up to date");
                } else {
                    info!(
                        applied = result.applied_migrations.len(),
                        total_ms = result.total_execution_time_ms,
                        "startup migrations completed"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                self.transition(MigrationState::Failed);
                let backup = e
                    .backup_path()
                    .map(|p| p.display().to_string())
                    .or_else(|| backups_taken.last().map(|p| p.display().to_string()))
                    .unwrap_or_else(|| "none".to_string());
                error!(
                    kind = %e.kind(),
                    migration = e.migration_name().unwrap_or("-"),
                    backup = %backup,
                    "startup migrations failed: {e}"
                );
                Err(e)
            }
        }
    }

    fn drive(
        &mut self,
        conn: &Connection,
        backups_taken: &mut Vec<PathBuf>,
    ) -> MigrationResult<AutoMigrationResult> {
        self.transition(MigrationState::Initializing);
        MigrationLedger::initialize(conn)?;
        MigrationLock::initialize(conn)?;

        // Released on every exit path by the guard's Drop.
        let guard = MigrationLock::acquire(conn, self.options.stale_lock_after)?;

        self.transition(MigrationState::CheckingPending);
        let applied = MigrationLedger::get_applied(conn)?;
        verify_recorded_checksums(&self.registry, &applied)?;

        let pending: Vec<MigrationDefinition> = pending_migrations(self.registry.available(), &applied)
            .into_iter()
            .cloned()
            .collect();
        let total = pending.len();
        if total > 0 {
            info!(
                pending = total,
                names = %pending.iter().map(|m| m.name()).collect::<Vec<_>>().join(", "),
                "applying pending migrations"
            );
        }

        let mut result = AutoMigrationResult::default();
        for (i, definition) in pending.iter().enumerate() {
            self.transition(MigrationState::Executing {
                index: i + 1,
                total,
            });
            guard.refresh()?;

            let backup = self.backups.create_backup(conn, definition.name())?;
            backups_taken.push(backup.clone());

            let mut executed = self
                .executor
                .execute(conn, definition)
                .map_err(|e| e.with_attempt(definition.name(), &backup))?;

            let applied_at = Utc::now()
                .with_timezone(&self.options.timezone)
                .fixed_offset();
            MigrationLedger::record(conn, definition, &applied_at, executed.execution_time_ms)
                .map_err(|e| e.with_attempt(definition.name(), &backup))?;
            executed.applied_at = Some(format_timestamp(&applied_at));

            info!(
                migration = definition.name(),
                version = definition.version(),
                execution_time_ms = executed.execution_time_ms,
                "migration applied"
            );
            result.applied_migrations.push(executed);
        }

        // Everything is committed and recorded; a flag left behind only delays the
        // next run until it goes stale.
        if let Err(e) = guard.release() {
            warn!("migrations applied but the migration flag could not be cleared: {e}");
        }
        Ok(result)
    }

    /// Compare the registry with the ledger without writing anything or taking locks.
    pub fn check_migration_status(
        &self,
        conn: &Connection,
    ) -> MigrationResult<MigrationStatusReport> {
        let applied = if MigrationLedger::exists(conn)? {
            MigrationLedger::get_applied(conn)?
        } else {
            Vec::new()
        };

        let pending_migrations = pending_migrations(self.registry.available(), &applied)
            .into_iter()
            .map(|m| m.name().to_string())
            .collect();

        let mut unknown_migrations = Vec::new();
        let mut checksum_mismatches = Vec::new();
        for record in &applied {
            match self.registry.find(&record.name) {
                Some(definition) if definition.checksum() != record.checksum => {
                    checksum_mismatches.push(record.name.clone());
                }
                Some(_) => {}
                None => unknown_migrations.push(record.name.clone()),
            }
        }

        let migration_in_progress = MigrationLock::state(conn)?
            .map(|s| s.in_progress)
            .unwrap_or(false);

        Ok(MigrationStatusReport {
            total_available: self.registry.len(),
            total_applied: applied.len(),
            pending_migrations,
            last_migration_date: applied.last().map(|m| m.applied_at.clone()),
            integrity_ok: checksum_mismatches.is_empty(),
            applied_migrations: applied,
            unknown_migrations,
            checksum_mismatches,
            migration_in_progress,
        })
    }

    fn transition(&mut self, next: MigrationState) {
        debug!(from = ?self.state, to = ?next, "migration state transition");
        self.state = next;
    }
}

/// Registry entries without a ledger row, in registry order.
pub fn pending_migrations<'a>(
    available: &'a [MigrationDefinition],
    applied: &[AppliedMigration],
) -> Vec<&'a MigrationDefinition> {
    let done: HashSet<&str> = applied.iter().map(|m| m.name.as_str()).collect();
    available
        .iter()
        .filter(|m| !done.contains(m.name()))
        .collect()
}

fn verify_recorded_checksums(
    registry: &MigrationRegistry,
    applied: &[AppliedMigration],
) -> MigrationResult<()> {
    for record in applied {
        let Some(definition) = registry.find(&record.name) else {
            warn!(
                migration = %record.name,
                "ledger contains a migration unknown to this build"
            );
            continue;
        };
        if definition.checksum() != record.checksum {
            return Err(MigrationError::ChecksumMismatch {
                name: record.name.clone(),
                expected: record.checksum.clone(),
                actual: definition.checksum().to_string(),
                backup_path: None,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str) -> MigrationDefinition {
        MigrationDefinition::sql(name, "1.0.0", "", "SELECT 1;")
    }

    fn record(name: &str, checksum: &str) -> AppliedMigration {
        AppliedMigration {
            id: 0,
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: None,
            checksum: checksum.to_string(),
            applied_at: "2024-01-01T00:00:00.000+09:00".to_string(),
            execution_time_ms: Some(1),
            created_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    #[test]
    fn pending_is_registry_minus_ledger_in_registry_order() {
        let available: Vec<_> = ["001_a", "002_b", "003_c", "004_d", "005_e"]
            .into_iter()
            .map(def)
            .collect();

        // every subset of the registry
        for mask in 0u32..(1 << available.len()) {
            let applied: Vec<_> = available
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, m)| record(m.name(), m.checksum()))
                .collect();

            let pending = pending_migrations(&available, &applied);
            assert_eq!(pending.len(), available.len() - applied.len());

            let expected: Vec<_> = available
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) == 0)
                .map(|(_, m)| m.name())
                .collect();
            let actual: Vec<_> = pending.iter().map(|m| m.name()).collect();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn unknown_ledger_rows_do_not_affect_pending() {
        let available = vec![def("001_a"), def("002_b")];
        let applied = vec![record("000_legacy", "x"), record("001_a", def("001_a").checksum())];
        let pending = pending_migrations(&available, &applied);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name(), "002_b");
    }

    #[test]
    fn recorded_checksum_drift_is_detected() {
        let registry = MigrationRegistry::new().with(def("001_a")).unwrap();
        let err = verify_recorded_checksums(&registry, &[record("001_a", "tampered")]).unwrap_err();
        assert!(matches!(err, MigrationError::ChecksumMismatch { ref name, .. } if name == "001_a"));

        let ok = record("001_a", def("001_a").checksum());
        assert!(verify_recorded_checksums(&registry, &[ok, record("999_x", "y")]).is_ok());
    }

    #[test]
    fn service_starts_idle() {
        let dir = std::env::temp_dir();
        let service = AutoMigrationService::new(
            MigrationRegistry::new(),
            BackupManager::new(dir, 1),
            AutoMigrationOptions::default(),
        );
        assert_eq!(service.state(), MigrationState::Idle);
    }
}
