use std::collections::HashSet;

use super::error::{MigrationError, MigrationResult};
use super::models::MigrationDefinition;

/// Ordered catalogue of the migrations this binary knows about.
///
/// Registration order is execution order. Entries are never re-sorted.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: Vec<MigrationDefinition>,
    names: HashSet<String>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: MigrationDefinition) -> MigrationResult<()> {
        if !self.names.insert(definition.name().to_string()) {
            return Err(MigrationError::DuplicateMigrationName(
                definition.name().to_string(),
            ));
        }
        self.migrations.push(definition);
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with(mut self, definition: MigrationDefinition) -> MigrationResult<Self> {
        self.register(definition)?;
        Ok(self)
    }

    pub fn available(&self) -> &[MigrationDefinition] {
        &self.migrations
    }

    pub fn find(&self, name: &str) -> Option<&MigrationDefinition> {
        self.migrations.iter().find(|m| m.name() == name)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
