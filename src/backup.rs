use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::asar;
use crate::util;

/// What [`ensure_backup`] did with the backup slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupDecision {
    /// A backup already existed and was left untouched.
    Skip,
    /// The live archive was copied to the backup path.
    Create,
    /// The existing backup is the extraction source; the live archive was not read.
    Reuse,
}

/// Make sure a pristine copy of the live archive exists at `backup`.
///
/// An existing backup is never overwritten: the first copy ever taken is the
/// only one guaranteed to be unpatched.
pub fn ensure_backup(live: &Path, backup: &Path, reuse_existing: bool) -> Result<BackupDecision> {
    if reuse_existing {
        if !backup.is_file() {
            bail!("Backup to reuse does not exist: {}", backup.display());
        }
        info!(backup = %backup.display(), "reusing existing backup");
        backup_unpacked(live, backup)?;
        return Ok(BackupDecision::Reuse);
    }

    if backup.exists() {
        info!(backup = %backup.display(), "backup already exists; keeping it");
        if live.is_file() && util::hash_file(live)? != util::hash_file(backup)? {
            warn!(
                live = %live.display(),
                backup = %backup.display(),
                "live archive differs from the backup; the original backup is preserved"
            );
        }
        backup_unpacked(live, backup)?;
        return Ok(BackupDecision::Skip);
    }

    fs::copy(live, backup).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            live.display(),
            backup.display()
        )
    })?;

    let expected = util::hash_file(live)?;
    let actual = util::hash_file(backup)?;
    if expected != actual {
        let _ = fs::remove_file(backup);
        bail!(
            "Backup verification failed for {} (expected {}, got {})",
            backup.display(),
            expected.to_hex(),
            actual.to_hex()
        );
    }

    info!(backup = %backup.display(), hash = %expected.to_hex(), "created backup");
    backup_unpacked(live, backup)?;
    Ok(BackupDecision::Create)
}

/// Mirror `<live>.unpacked/` next to the backup so the backup extracts on its own.
///
/// The patched archive never carries unpacked entries, so the live directory
/// still holds the original files. An existing backup directory is kept.
fn backup_unpacked(live: &Path, backup: &Path) -> Result<()> {
    let source = asar::unpacked_dir(live);
    let target = asar::unpacked_dir(backup);
    if !source.is_dir() || target.exists() {
        return Ok(());
    }

    if let Err(e) = util::copy_tree_verified(&source, &target) {
        let _ = util::remove_dir_if_exists(&target);
        return Err(e).with_context(|| {
            format!("Failed to back up unpacked files to {}", target.display())
        });
    }
    info!(unpacked = %target.display(), "backed up unpacked files");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_byte_identical_copy() {
        let temp = tempfile::tempdir().unwrap();
        let live = temp.path().join("app.asar");
        let backup = temp.path().join("app.bak.asar");
        fs::write(&live, b"pristine archive bytes").unwrap();

        assert_eq!(ensure_backup(&live, &backup, false).unwrap(), BackupDecision::Create);
        assert_eq!(fs::read(&backup).unwrap(), b"pristine archive bytes");
    }

    #[test]
    fn test_second_call_never_changes_backup() {
        let temp = tempfile::tempdir().unwrap();
        let live = temp.path().join("app.asar");
        let backup = temp.path().join("app.bak.asar");
        fs::write(&live, b"original").unwrap();
        ensure_backup(&live, &backup, false).unwrap();

        fs::write(&live, b"patched since").unwrap();
        assert_eq!(ensure_backup(&live, &backup, false).unwrap(), BackupDecision::Skip);
        assert_eq!(fs::read(&backup).unwrap(), b"original");
    }

    #[test]
    fn test_reuse_does_not_read_live() {
        let temp = tempfile::tempdir().unwrap();
        let live = temp.path().join("missing.asar");
        let backup = temp.path().join("app.bak.asar");
        fs::write(&backup, b"original").unwrap();

        assert_eq!(ensure_backup(&live, &backup, true).unwrap(), BackupDecision::Reuse);
        assert!(!live.exists());
        assert_eq!(fs::read(&backup).unwrap(), b"original");
    }

    #[test]
    fn test_reuse_without_backup_fails() {
        let temp = tempfile::tempdir().unwrap();
        let live = temp.path().join("app.asar");
        fs::write(&live, b"x").unwrap();
        assert!(ensure_backup(&live, &temp.path().join("app.bak.asar"), true).is_err());
    }

    #[test]
    fn test_unpacked_files_follow_the_backup() {
        let temp = tempfile::tempdir().unwrap();
        let live = temp.path().join("app.asar");
        let backup = temp.path().join("app.bak.asar");
        fs::write(&live, b"original").unwrap();
        let unpacked = temp.path().join("app.asar.unpacked/build/Release");
        fs::create_dir_all(&unpacked).unwrap();
        fs::write(unpacked.join("addon.node"), b"\x7fELF native").unwrap();

        assert_eq!(ensure_backup(&live, &backup, false).unwrap(), BackupDecision::Create);
        assert_eq!(
            fs::read(temp.path().join("app.bak.asar.unpacked/build/Release/addon.node")).unwrap(),
            b"\x7fELF native"
        );
    }

    #[test]
    fn test_reuse_fills_in_missing_unpacked_backup() {
        let temp = tempfile::tempdir().unwrap();
        let live = temp.path().join("app.asar");
        let backup = temp.path().join("app.bak.asar");
        fs::write(&live, b"patched").unwrap();
        fs::write(&backup, b"original").unwrap();
        fs::create_dir_all(temp.path().join("app.asar.unpacked")).unwrap();
        fs::write(temp.path().join("app.asar.unpacked/addon.node"), b"native").unwrap();

        assert_eq!(ensure_backup(&live, &backup, true).unwrap(), BackupDecision::Reuse);
        assert_eq!(
            fs::read(temp.path().join("app.bak.asar.unpacked/addon.node")).unwrap(),
            b"native"
        );
    }

    #[test]
    fn test_existing_unpacked_backup_is_kept() {
        let temp = tempfile::tempdir().unwrap();
        let live = temp.path().join("app.asar");
        let backup = temp.path().join("app.bak.asar");
        fs::write(&live, b"patched").unwrap();
        fs::write(&backup, b"original").unwrap();
        fs::create_dir_all(temp.path().join("app.asar.unpacked")).unwrap();
        fs::write(temp.path().join("app.asar.unpacked/addon.node"), b"rebuilt").unwrap();
        fs::create_dir_all(temp.path().join("app.bak.asar.unpacked")).unwrap();
        fs::write(temp.path().join("app.bak.asar.unpacked/addon.node"), b"first").unwrap();

        ensure_backup(&live, &backup, false).unwrap();
        assert_eq!(
            fs::read(temp.path().join("app.bak.asar.unpacked/addon.node")).unwrap(),
            b"first"
        );
    }

    #[test]
    fn test_missing_live_archive_fails_without_backup() {
        let temp = tempfile::tempdir().unwrap();
        let backup = temp.path().join("app.bak.asar");
        assert!(ensure_backup(&temp.path().join("app.asar"), &backup, false).is_err());
        assert!(!backup.exists());
    }
}
