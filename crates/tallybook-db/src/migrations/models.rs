use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use rusqlite::Transaction;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Rust-side transformation run inside the migration's transaction.
pub type TransformFn = dyn Fn(&Transaction<'_>) -> anyhow::Result<()> + Send + Sync;

/// The unit of work a migration performs.
#[derive(Clone)]
pub enum MigrationStep {
    /// A batch of SQL statements.
    Sql(String),
    /// Arbitrary Rust logic. `fingerprint` stands in for the code when hashing, so it
    /// must change whenever the behaviour of `apply` changes.
    Code {
        fingerprint: String,
        apply: Arc<TransformFn>,
    },
}

impl MigrationStep {
    fn kind(&self) -> &'static str {
        match self {
            Self::Sql(_) => "sql",
            Self::Code { .. } => "code",
        }
    }

    fn body(&self) -> &str {
        match self {
            Self::Sql(sql) => sql.as_str(),
            Self::Code { fingerprint, .. } => fingerprint.as_str(),
        }
    }

    pub(crate) fn apply(&self, tx: &Transaction<'_>) -> anyhow::Result<()> {
        match self {
            Self::Sql(sql) => tx.execute_batch(sql).map_err(Into::into),
            Self::Code { apply, .. } => apply(tx),
        }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(sql) => f.debug_tuple("Sql").field(&sql.len()).finish(),
            Self::Code { fingerprint, .. } => f
                .debug_struct("Code")
                .field("fingerprint", fingerprint)
                .finish_non_exhaustive(),
        }
    }
}

/// A registered migration. Immutable once built; the checksum is fixed at construction.
#[derive(Debug, Clone)]
pub struct MigrationDefinition {
    name: String,
    version: String,
    description: String,
    checksum: String,
    step: MigrationStep,
}

impl MigrationDefinition {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        step: MigrationStep,
    ) -> Self {
        let name = name.into();
        let version = version.into();
        let checksum = compute_checksum(&name, &version, &step);
        Self {
            name,
            version,
            description: description.into(),
            checksum,
            step,
        }
    }

    pub fn sql(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self::new(name, version, description, MigrationStep::Sql(sql.into()))
    }

    pub fn code<F>(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        fingerprint: impl Into<String>,
        apply: F,
    ) -> Self
    where
        F: Fn(&Transaction<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(
            name,
            version,
            description,
            MigrationStep::Code {
                fingerprint: fingerprint.into(),
                apply: Arc::new(apply),
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Checksum captured at registration time.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn step(&self) -> &MigrationStep {
        &self.step
    }

    /// Hash the migration's logic again, independent of the stored checksum.
    pub fn compute_checksum(&self) -> String {
        compute_checksum(&self.name, &self.version, &self.step)
    }
}

fn compute_checksum(name: &str, version: &str, step: &MigrationStep) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(version.as_bytes());
    hasher.update(b"|");
    hasher.update(step.kind().as_bytes());
    hasher.update(b"|");
    hasher.update(step.body().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A row of the `schema_migrations` ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub checksum: String,
    pub applied_at: String,
    pub execution_time_ms: Option<i64>,
    pub created_at: String,
}

impl AppliedMigration {
    pub fn applied_at_parsed(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.applied_at).ok()
    }
}

/// Outcome of applying a single migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationExecutionResult {
    pub name: String,
    pub version: String,
    pub execution_time_ms: u64,
    /// Filled in once the orchestrator has recorded the migration.
    pub applied_at: Option<String>,
}

/// Summary returned by a successful startup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoMigrationResult {
    pub applied_migrations: Vec<MigrationExecutionResult>,
    /// Snapshot taken before the last applied migration.
    pub backup_path: Option<PathBuf>,
    pub total_execution_time_ms: u64,
}

impl AutoMigrationResult {
    pub fn applied_names(&self) -> Vec<&str> {
        self.applied_migrations
            .iter()
            .map(|m| m.name.as_str())
            .collect()
    }

    pub fn is_noop(&self) -> bool {
        self.applied_migrations.is_empty()
    }
}

/// Read-only view of the ledger against the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatusReport {
    pub total_available: usize,
    pub total_applied: usize,
    pub pending_migrations: Vec<String>,
    pub applied_migrations: Vec<AppliedMigration>,
    /// Ledger rows with no matching registry entry, e.g. written by a newer binary.
    pub unknown_migrations: Vec<String>,
    pub checksum_mismatches: Vec<String>,
    pub last_migration_date: Option<String>,
    pub integrity_ok: bool,
    pub migration_in_progress: bool,
}

impl MigrationStatusReport {
    pub fn is_up_to_date(&self) -> bool {
        self.pending_migrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_for_identical_logic() {
        let a = MigrationDefinition::sql("001_init", "1.0.0", "first", "CREATE TABLE t (id INT);");
        let b = MigrationDefinition::sql("001_init", "1.0.0", "reworded", "CREATE TABLE t (id INT);");
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum(), a.compute_checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn checksum_changes_with_sql_body() {
        let a = MigrationDefinition::sql("001_init", "1.0.0", "", "CREATE TABLE t (id INT);");
        let b = MigrationDefinition::sql("001_init", "1.0.0", "", "CREATE TABLE t (id TEXT);");
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn code_checksum_follows_the_fingerprint() {
        let a = MigrationDefinition::code("003_fix", "1.2.0", "", "v1", |_| Ok(()));
        let b = MigrationDefinition::code("003_fix", "1.2.0", "", "v2", |_| Ok(()));
        let c = MigrationDefinition::code("003_fix", "1.2.0", "", "v1", |_| {
            anyhow::bail!("different closure, same fingerprint")
        });
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.checksum(), c.checksum());
    }

    #[test]
    fn sql_and_code_with_same_body_hash_differently() {
        let sql = MigrationDefinition::sql("004_x", "1", "", "body");
        let code = MigrationDefinition::code("004_x", "1", "", "body", |_| Ok(()));
        assert_ne!(sql.checksum(), code.checksum());
    }
}
