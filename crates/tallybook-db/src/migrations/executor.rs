use std::time::{Duration, Instant};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use super::error::{MigrationError, MigrationResult};
use super::ledger::MigrationLedger;
use super::models::{MigrationDefinition, MigrationExecutionResult};

/// Applies one migration inside its own transaction.
///
/// Never writes to the ledger; recording is left to the caller once this returns `Ok`.
#[derive(Debug, Clone)]
pub struct MigrationExecutor {
    slow_threshold: Option<Duration>,
}

impl Default for MigrationExecutor {
    fn default() -> Self {
        Self {
            slow_threshold: Some(Duration::from_secs(1)),
        }
    }
}

impl MigrationExecutor {
    pub fn new(slow_threshold: Option<Duration>) -> Self {
        Self { slow_threshold }
    }

    pub fn execute(
        &self,
        conn: &Connection,
        definition: &MigrationDefinition,
    ) -> MigrationResult<MigrationExecutionResult> {
        let name = definition.name();
        let started = Instant::now();

        // Dropping `tx` on any early return rolls the migration back.
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(|e| MigrationError::execution(name, format!("failed to begin transaction: {e}")))?;

        debug!(migration = name, "running migration transform");
        definition
            .step()
            .apply(&tx)
            .map_err(|e| MigrationError::execution(name, format!("{e:#}")))?;

        verify_checksum(&tx, definition)?;

        tx.commit()
            .map_err(|e| MigrationError::execution(name, format!("failed to commit: {e}")))?;

        let elapsed = started.elapsed();
        if let Some(limit) = self.slow_threshold {
            if elapsed > limit {
                warn!(
                    migration = name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "migration exceeded the slow-migration threshold"
                );
            }
        }

        Ok(MigrationExecutionResult {
            name: name.to_string(),
            version: definition.version().to_string(),
            execution_time_ms: elapsed.as_millis() as u64,
            applied_at: None,
        })
    }
}

fn verify_checksum(tx: &Transaction<'_>, definition: &MigrationDefinition) -> MigrationResult<()> {
    let name = definition.name();
    let actual = definition.compute_checksum();
    if actual != definition.checksum() {
        return Err(MigrationError::ChecksumMismatch {
            name: name.to_string(),
            expected: definition.checksum().to_string(),
            actual,
            backup_path: None,
        });
    }

    match MigrationLedger::find(tx, name)? {
        Some(previous) if previous.checksum != actual => Err(MigrationError::ChecksumMismatch {
            name: name.to_string(),
            expected: previous.checksum,
            actual,
            backup_path: None,
        }),
        Some(_) => Err(MigrationError::AlreadyRecorded {
            name: name.to_string(),
            backup_path: None,
        }),
        None => Ok(()),
    }
}
