use std::path::Path;

use tallybook_db::migrations::{
    AutoMigrationResult, BackupFile, MigrationError, MigrationStatusReport,
};
use tallybook_db::{DatabaseStats, IntegrityReport};

const WIDTH: usize = 72;

/// Box-drawn panel; rows longer than the panel are cut with an ellipsis.
struct Panel {
    lines: Vec<String>,
    title: String,
}

impl Panel {
    fn new(title: impl Into<String>) -> Self {
        Self {
            lines: Vec::new(),
            title: title.into(),
        }
    }

    fn blank(&mut self) -> &mut Self {
        self.lines.push(String::new());
        self
    }

    fn line(&mut self, text: impl Into<String>) -> &mut Self {
        self.lines.push(text.into());
        self
    }

    fn field(&mut self, label: &str, value: impl AsRef<str>) -> &mut Self {
        self.lines.push(format!("{label:<12}{}", value.as_ref()));
        self
    }

    fn render(&self) -> String {
        let inner = WIDTH - 4; // "│ " + " │"
        let title_dashes = WIDTH.saturating_sub(self.title.chars().count() + 7);
        let mut out = format!("╭─── {} {}╮\n", self.title, "─".repeat(title_dashes));
        for line in &self.lines {
            out.push_str(&format!("│ {:<inner$} │\n", fit(line, inner)));
        }
        out.push_str(&format!("╰{}╯", "─".repeat(WIDTH - 2)));
        out
    }
}

fn fit(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

fn display_path(path: &Path) -> String {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => path.to_string_lossy().replace(&home, "~"),
        _ => path.to_string_lossy().to_string(),
    }
}

pub fn print_migration_summary(database: &Path, result: &AutoMigrationResult) {
    println!("{}", render_migration_summary(database, result));
}

fn render_migration_summary(database: &Path, result: &AutoMigrationResult) -> String {
    let version = env!("CARGO_PKG_VERSION");
    let mut panel = Panel::new(format!("Tallybook v{version}"));
    panel.blank().field("Database", display_path(database));

    if result.is_noop() {
        panel.field("Schema", "up to date");
    } else {
        panel
            .field("Applied", format!("{} migration(s)", result.applied_migrations.len()))
            .field("Total", format!("{} ms", result.total_execution_time_ms));
        if let Some(backup) = &result.backup_path {
            panel.field("Backup", display_path(backup));
        }
        panel.line("─".repeat(WIDTH - 6));
        for m in &result.applied_migrations {
            panel.line(format!(
                "  {:<36} {:>8} {:>7} ms",
                m.name, m.version, m.execution_time_ms
            ));
        }
    }
    panel.blank();
    panel.render()
}

pub fn print_failure(err: &MigrationError) {
    eprintln!("{}", render_failure(err));
}

fn render_failure(err: &MigrationError) -> String {
    let mut panel = Panel::new("Startup migrations failed");
    panel
        .blank()
        .field("Kind", err.kind().as_str())
        .field("Migration", err.migration_name().unwrap_or("-"))
        .field(
            "Backup",
            err.backup_path()
                .map(display_path)
                .unwrap_or_else(|| "none".to_string()),
        )
        .field("Cause", err.to_string());
    if err.is_retryable() {
        panel.blank().line("Another process is migrating this database; try again shortly.");
    } else if err.backup_path().is_some() {
        panel
            .blank()
            .line("The application must not start. Restore with:")
            .line("  tallybook restore <backup>");
    }
    panel.blank();
    panel.render()
}

pub fn print_status(database: &Path, report: &MigrationStatusReport) {
    println!("{}", render_status(database, report));
}

fn render_status(database: &Path, report: &MigrationStatusReport) -> String {
    let mut panel = Panel::new("Migration status");
    panel
        .blank()
        .field("Database", display_path(database))
        .field(
            "Applied",
            format!("{} of {}", report.total_applied, report.total_available),
        )
        .field(
            "Last run",
            report.last_migration_date.as_deref().unwrap_or("never"),
        )
        .field("Integrity", if report.integrity_ok { "ok" } else { "CHECKSUM MISMATCH" })
        .field(
            "Running",
            if report.migration_in_progress { "yes" } else { "no" },
        );

    if !report.pending_migrations.is_empty() {
        panel.field("Pending", report.pending_migrations.join(", "));
    }
    if !report.checksum_mismatches.is_empty() {
        panel.field("Mismatched", report.checksum_mismatches.join(", "));
    }
    if !report.unknown_migrations.is_empty() {
        panel.field("Unknown", report.unknown_migrations.join(", "));
    }
    panel.blank();
    panel.render()
}

pub fn print_never_migrated(database: &Path, report: &MigrationStatusReport) {
    println!("{}", render_never_migrated(database, report));
}

fn render_never_migrated(database: &Path, report: &MigrationStatusReport) -> String {
    let mut panel = Panel::new("Migration status");
    panel
        .blank()
        .field("Database", display_path(database))
        .field("Applied", "never migrated (database file does not exist)")
        .field("Pending", report.pending_migrations.join(", "))
        .blank();
    panel.render()
}

pub fn print_check(database: &Path, integrity: &IntegrityReport, stats: &DatabaseStats) {
    println!("{}", render_check(database, integrity, stats));
}

fn render_check(database: &Path, integrity: &IntegrityReport, stats: &DatabaseStats) -> String {
    let mut panel = Panel::new("Database check");
    panel
        .blank()
        .field("Database", display_path(database))
        .field("Integrity", if integrity.ok { "ok" } else { "FAILED" })
        .field(
            "Size",
            format!(
                "{} KiB ({} pages of {} bytes)",
                (stats.size_bytes.max(0) as u64).div_ceil(1024),
                stats.page_count,
                stats.page_size
            ),
        );
    for problem in &integrity.problems {
        panel.line(format!("  ! {problem}"));
    }
    if !stats.tables.is_empty() {
        panel.line("─".repeat(WIDTH - 6));
        for table in &stats.tables {
            panel.line(format!("  {:<44} {:>12} rows", table.name, table.rows));
        }
    }
    panel.blank();
    panel.render()
}

pub fn print_backups(dir: &Path, backups: &[BackupFile]) {
    let mut panel = Panel::new("Backups");
    panel.blank().field("Directory", display_path(dir));
    if backups.is_empty() {
        panel.field("Files", "none");
    } else {
        panel.line("─".repeat(WIDTH - 6));
        for b in backups {
            let name = b
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            panel.line(format!(
                "{} {:>10} KiB  {}",
                b.modified.format("%Y-%m-%d %H:%M"),
                b.size_bytes.div_ceil(1024),
                name
            ));
        }
    }
    panel.blank();
    println!("{}", panel.render());
}
