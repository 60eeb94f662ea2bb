use std::io::IsTerminal;
use std::path::Path;

use anyhow::{Context, Result, bail};
use dialoguer::Confirm;

/// Ask before overwriting the live database. `assume_yes` skips the prompt; without
/// it a non-interactive session refuses instead of guessing.
pub fn confirm_restore(backup: &Path, database: &Path, assume_yes: bool) -> Result<bool> {
    if !backup.is_file() {
        bail!("backup {} does not exist", backup.display());
    }
    if assume_yes {
        return Ok(true);
    }

    if !std::io::stdin().is_terminal() {
        println!("Non-interactive environment detected.");
        println!("Re-run with --yes to restore without a prompt:");
        println!(
            "  tallybook restore {} --yes",
            backup.display()
        );
        return Ok(false);
    }

    println!();
    println!("  Restore database");
    println!("  ----------------");
    println!("  from  {}", backup.display());
    println!("  into  {}", database.display());
    println!();
    println!("  Stop every Tallybook process using this database first.");
    println!();

    Confirm::new()
        .with_prompt("Overwrite the current database with this backup?")
        .default(false)
        .interact()
        .context("restore confirmation cancelled")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_backup_is_an_error_even_with_yes() {
        let dir = tempfile::tempdir().unwrap();
        let err = confirm_restore(&dir.path().join("gone.bak"), &dir.path().join("books.db"), true)
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn yes_skips_the_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("b.bak");
        std::fs::write(&backup, b"snapshot").unwrap();
        assert!(confirm_restore(&backup, &dir.path().join("books.db"), true).unwrap());
    }
}
