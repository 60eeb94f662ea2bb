use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use tallybook_common::{Error, Result};
use tracing::{debug, info};

use crate::model::{AppConfig, ConcurrencyMode, default_home};

const DB_PATH_ENV: &str = "TALLYBOOK_DB";

/// Locates, parses and validates the Tallybook configuration file.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `path` instead of the default location. A missing explicit file is an error.
    pub fn with_path(mut self, path: Option<PathBuf>) -> Self {
        self.explicit_path = path;
        self
    }

    pub fn default_path() -> PathBuf {
        default_home().join("config.yml")
    }

    pub fn load(&self) -> Result<AppConfig> {
        let mut config = match &self.explicit_path {
            Some(path) => Self::load_from(path)?,
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load_from(&path)?
                } else {
                    debug!("no config at {}, using defaults", path.display());
                    AppConfig::default()
                }
            }
        };

        apply_db_override(&mut config, std::env::var(DB_PATH_ENV).ok());
        validate(&config)?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("config loaded from {}", path.display());
        Ok(config)
    }
}

fn apply_db_override(config: &mut AppConfig, value: Option<String>) {
    if let Some(path) = value.filter(|v| !v.trim().is_empty()) {
        debug!("database path overridden by {DB_PATH_ENV}");
        config.database.path = Some(PathBuf::from(path));
    }
}

/// Reject settings the migration engine cannot honour.
pub fn validate(config: &AppConfig) -> Result<()> {
    config
        .migrations
        .timezone
        .parse::<Tz>()
        .map_err(|e| Error::Config(format!("invalid migrations.timezone: {e}")))?;

    if config.migrations.on_concurrent_run == ConcurrencyMode::Retry
        && config.migrations.retry_attempts == 0
    {
        return Err(Error::Config(
            "migrations.retry_attempts must be at least 1 when on_concurrent_run is retry".into(),
        ));
    }

    Ok(())
}
