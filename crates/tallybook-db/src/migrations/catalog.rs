use rusqlite::{Transaction, params};
use tracing::debug;

use super::error::MigrationResult;
use super::models::MigrationDefinition;
use super::registry::MigrationRegistry;

pub const CREATE_BASIC_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    color TEXT NOT NULL DEFAULT '#6b7280',
    icon TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS expenses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL,
    amount REAL NOT NULL CHECK (amount > 0),
    category TEXT NOT NULL,
    description TEXT,
    receipt_path TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    amount REAL NOT NULL CHECK (amount > 0),
    billing_cycle TEXT NOT NULL CHECK (billing_cycle IN ('monthly', 'annual')),
    start_date TEXT NOT NULL,
    category TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    receipt_path TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_expenses_date ON expenses(date);
CREATE INDEX IF NOT EXISTS idx_expenses_category ON expenses(category);
CREATE INDEX IF NOT EXISTS idx_subscriptions_active ON subscriptions(is_active);

INSERT OR IGNORE INTO categories (name, color, icon) VALUES
    ('transport', '#3b82f6', 'train'),
    ('meals', '#f59e0b', 'utensils'),
    ('communication', '#8b5cf6', 'phone'),
    ('supplies', '#10b981', 'package'),
    ('entertainment', '#ef4444', 'gift'),
    ('other', '#6b7280', 'dots');
";

pub const ADD_USER_AUTHENTICATION_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    google_id TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL,
    name TEXT NOT NULL,
    picture_url TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Rows created before accounts existed belong to this user.
INSERT OR IGNORE INTO users (id, google_id, email, name)
    VALUES (1, 'default_user', 'default@localhost', 'Default User');

ALTER TABLE expenses ADD COLUMN user_id INTEGER NOT NULL DEFAULT 1;
ALTER TABLE subscriptions ADD COLUMN user_id INTEGER NOT NULL DEFAULT 1;

CREATE INDEX IF NOT EXISTS idx_expenses_user ON expenses(user_id, date);
CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_id, is_active);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
";

pub const DROP_RECEIPT_PATH_SQL: &str = "
ALTER TABLE expenses DROP COLUMN receipt_path;
ALTER TABLE subscriptions DROP COLUMN receipt_path;
";

/// Bump whenever `migrate_receipt_urls` changes behaviour.
const RECEIPT_URL_FINGERPRINT: &str =
    "003_migrate_receipt_url: add receipt_url to expenses and subscriptions; \
     copy http(s) receipt_path values verbatim, rewrite local paths as file:// URLs";

const RECEIPT_TABLES: [&str; 2] = ["expenses", "subscriptions"];

/// Every migration shipped with this build, in execution order.
pub fn builtin_registry() -> MigrationResult<MigrationRegistry> {
    MigrationRegistry::new()
        .with(MigrationDefinition::sql(
            "001_create_basic_schema",
            "1.0.0",
            "Create categories, expenses and subscriptions tables",
            CREATE_BASIC_SCHEMA_SQL,
        ))?
        .with(MigrationDefinition::sql(
            "002_add_user_authentication",
            "1.1.0",
            "Add users and sessions; scope expenses and subscriptions by user",
            ADD_USER_AUTHENTICATION_SQL,
        ))?
        .with(MigrationDefinition::code(
            "003_migrate_receipt_url",
            "1.2.0",
            "Move receipt references from local paths to URLs",
            RECEIPT_URL_FINGERPRINT,
            migrate_receipt_urls,
        ))?
        .with(MigrationDefinition::sql(
            "004_drop_receipt_path_column",
            "1.3.0",
            "Drop the legacy receipt_path columns",
            DROP_RECEIPT_PATH_SQL,
        ))
}

fn migrate_receipt_urls(tx: &Transaction<'_>) -> anyhow::Result<()> {
    for table in RECEIPT_TABLES {
        tx.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN receipt_url TEXT;"))?;

        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id, receipt_path FROM {table}
                 WHERE receipt_path IS NOT NULL AND TRIM(receipt_path) <> ''"
            ))?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        let mut update = tx.prepare(&format!("UPDATE {table} SET receipt_url = ?1 WHERE id = ?2"))?;
        for (id, path) in &rows {
            update.execute(params![receipt_url_from_path(path), id])?;
        }
        debug!(table = table, converted = rows.len(), "receipt paths converted to URLs");
    }
    Ok(())
}

/// Remote URLs are kept; local paths become `file://` URLs with forward slashes.
pub fn receipt_url_from_path(path: &str) -> String {
    let path = path.trim();
    let lower = path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("file://") {
        return path.to_string();
    }

    let normalized = path.replace('\\', "/");
    if normalized.starts_with('/') {
        format!("file://{normalized}")
    } else {
        format!("file:///{normalized}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_ordered_by_release() {
        let registry = builtin_registry().unwrap();
        let names: Vec<_> = registry.available().iter().map(|m| m.name()).collect();
        assert_eq!(
            names,
            vec![
                "001_create_basic_schema",
                "002_add_user_authentication",
                "003_migrate_receipt_url",
                "004_drop_receipt_path_column",
            ]
        );
    }

    #[test]
    fn builtin_checksums_are_deterministic() {
        let a = builtin_registry().unwrap();
        let b = builtin_registry().unwrap();
        for (x, y) in a.available().iter().zip(b.available()) {
            assert_eq!(x.checksum(), y.checksum());
        }
    }

    #[test]
    fn receipt_urls_keep_remote_links() {
        assert_eq!(
            receipt_url_from_path("https://cdn.example.com/r/1.png"),
            "https://cdn.example.com/r/1.png"
        );
        assert_eq!(receipt_url_from_path(" HTTP://x/y.jpg "), "HTTP://x/y.jpg");
    }

    #[test]
    fn receipt_urls_rewrite_local_paths() {
        assert_eq!(
            receipt_url_from_path("/home/me/receipts/a.pdf"),
            "file:///home/me/receipts/a.pdf"
        );
        assert_eq!(
            receipt_url_from_path("C:\\Users\\me\\receipt.png"),
            "file:///C:/Users/me/receipt.png"
        );
    }
}
