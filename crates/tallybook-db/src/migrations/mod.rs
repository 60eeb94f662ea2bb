//! Startup schema migrations.
//!
//! On startup the [`AutoMigrationService`] compares the [`MigrationRegistry`] with the
//! `schema_migrations` ledger and applies whatever is missing, in registration order,
//! one transaction per migration. A snapshot is written by the [`BackupManager`] before
//! each migration, and a flag row in `migration_lock` keeps a second process from
//! migrating the same database at the same time.

pub mod backup;
pub mod catalog;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod lock;
pub mod models;
pub mod registry;
pub mod service;

pub use backup::{BackupFile, BackupManager};
pub use catalog::builtin_registry;
pub use error::{MigrationError, MigrationErrorKind, MigrationResult};
pub use executor::MigrationExecutor;
pub use ledger::MigrationLedger;
pub use lock::{LockState, MigrationLock, MigrationLockGuard};
pub use models::{
    AppliedMigration, AutoMigrationResult, MigrationDefinition, MigrationExecutionResult,
    MigrationStatusReport, MigrationStep,
};
pub use registry::MigrationRegistry;
pub use service::{
    AutoMigrationOptions, AutoMigrationService, ConcurrencyPolicy, MigrationState,
    pending_migrations,
};
