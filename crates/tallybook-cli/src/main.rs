mod confirm;
mod report;
mod startup;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tallybook_config::{AppConfig, ConfigLoader, LoggingConfig};
use tallybook_db::migrations::{BackupManager, MigrationStatusReport};
use tallybook_db::{
    DatabaseStats, IntegrityReport, check_integrity, database_stats, open_in_memory,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tallybook", version, about = "Tallybook database migrations")]
struct Cli {
    /// Configuration file (.yml, .yaml or .toml)
    #[arg(long, global = true, env = "TALLYBOOK_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, overriding the configuration
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending migrations (the default)
    Migrate,
    /// Compare the ledger with the migrations built into this binary
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Take a manual backup of the database now
    Backup,
    /// List pre-migration backups, newest first
    Backups,
    /// Run SQLite's integrity check and report row counts per table
    Check {
        #[arg(long)]
        json: bool,
    },
    /// Replace the database with a backup
    Restore {
        /// Backup file, or its name inside the backup directory
        backup: PathBuf,
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::new()
        .with_path(cli.config.clone())
        .load()
        .context("failed to load configuration")?;
    if let Some(path) = cli.database {
        config.database.path = Some(path);
    }

    init_tracing(&config.logging);

    match cli.command.unwrap_or(Command::Migrate) {
        Command::Migrate => migrate(&config),
        Command::Status { json } => status(&config, json),
        Command::Backup => backup(&config),
        Command::Backups => backups(&config),
        Command::Check { json } => check(&config, json),
        Command::Restore { backup, yes } => restore(&config, backup, yes),
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn migrate(config: &AppConfig) -> Result<()> {
    let conn = startup::open(config)?;
    let mut service = startup::build_service(config)?;

    match service.run_startup_migrations(&conn) {
        Ok(result) => {
            report::print_migration_summary(&config.database_path(), &result);
            Ok(())
        }
        Err(e) => {
            report::print_failure(&e);
            std::process::exit(startup::exit_code(&e));
        }
    }
}

fn status(config: &AppConfig, json: bool) -> Result<()> {
    let service = startup::build_service(config)?;
    let report = match startup::open_existing(config)? {
        Some(conn) => service.check_migration_status(&conn)?,
        // An empty database reports every migration as pending.
        None => service.check_migration_status(&open_in_memory()?)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_status_or_missing(config, &report);
    }
    Ok(())
}

fn print_status_or_missing(config: &AppConfig, report: &MigrationStatusReport) {
    let database = config.database_path();
    if database.is_file() {
        report::print_status(&database, report);
    } else {
        report::print_never_migrated(&database, report);
    }
}

fn backup(config: &AppConfig) -> Result<()> {
    let database = config.database_path();
    if !database.is_file() {
        anyhow::bail!("database {} does not exist", database.display());
    }
    let conn = startup::open(config)?;
    let manager = BackupManager::new(config.backup_dir(), config.migrations.keep_backups);
    let path = manager
        .create_backup(&conn, "manual")
        .context("manual backup failed")?;
    println!("Backup written to {}", path.display());
    Ok(())
}

#[derive(Serialize)]
struct CheckOutput<'a> {
    integrity: &'a IntegrityReport,
    stats: &'a DatabaseStats,
}

fn check(config: &AppConfig, json: bool) -> Result<()> {
    let database = config.database_path();
    let Some(conn) = startup::open_existing(config)? else {
        anyhow::bail!("database {} does not exist", database.display());
    };
    let integrity = check_integrity(&conn)?;
    let stats = database_stats(&conn)?;

    if json {
        let out = CheckOutput {
            integrity: &integrity,
            stats: &stats,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        report::print_check(&database, &integrity, &stats);
    }

    if !integrity.ok {
        std::process::exit(1);
    }
    Ok(())
}

fn backups(config: &AppConfig) -> Result<()> {
    let manager = BackupManager::new(config.backup_dir(), config.migrations.keep_backups);
    let list = manager
        .list_backups()
        .with_context(|| format!("failed to list {}", manager.dir().display()))?;
    report::print_backups(manager.dir(), &list);
    Ok(())
}

fn restore(config: &AppConfig, backup: PathBuf, yes: bool) -> Result<()> {
    let database = config.database_path();
    let backup = startup::resolve_backup(&config.backup_dir(), backup);

    if !confirm::confirm_restore(&backup, &database, yes)? {
        println!("Restore cancelled.");
        return Ok(());
    }

    BackupManager::restore(&backup, &database)
        .with_context(|| format!("failed to restore from {}", backup.display()))?;
    info!("restore finished");
    println!("Restored {} from {}", database.display(), backup.display());
    Ok(())
}
