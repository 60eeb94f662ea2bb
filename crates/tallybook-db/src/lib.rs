pub mod database;
pub mod maintenance;
pub mod migrations;

pub use database::{open_database, open_in_memory, open_read_only};
pub use maintenance::{DatabaseStats, IntegrityReport, TableStats, check_integrity, database_stats};
pub use migrations::{
    AutoMigrationOptions, AutoMigrationResult, AutoMigrationService, BackupManager,
    ConcurrencyPolicy, MigrationDefinition, MigrationError, MigrationRegistry,
    MigrationStatusReport, builtin_registry,
};
