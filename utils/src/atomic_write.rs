//! Atomic file write via the temp-file + rename pattern.
//!
//! Readers either see the old contents or the new contents, never a partial
//! write. On Windows, rename-over-existing can fail, so overwrites fall back
//! to a backup-and-restore dance; [`recover_backup`] heals the window where a
//! crash leaves only the `.bak` behind.

use std::fs;
use std::io;
use std::path::Path;

use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy)]
pub struct AtomicWriteOptions {
    /// fsync the temp file before renaming it into place.
    pub sync_all: bool,
    /// Best-effort fsync of the parent directory after the rename.
    pub dir_sync: bool,
    /// Unix permission bits to apply to the final file.
    pub unix_mode: Option<u32>,
}

impl Default for AtomicWriteOptions {
    fn default() -> Self {
        Self {
            sync_all: true,
            dir_sync: false,
            unix_mode: None,
        }
    }
}

pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> io::Result<()> {
    atomic_write_with_options(path, bytes, AtomicWriteOptions::default())
}

pub fn atomic_write_with_options(
    path: impl AsRef<Path>,
    bytes: &[u8],
    options: AtomicWriteOptions,
) -> io::Result<()> {
    use std::io::Write;

    let path = path.as_ref();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    if options.sync_all {
        tmp.as_file().sync_all()?;
    }

    #[cfg(unix)]
    if let Some(mode) = options.unix_mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
    }

    if let Err(err) = tmp.persist(path) {
        if path.exists() {
            // Windows fallback: move the old file aside, then persist.
            let backup = path.with_extension("bak");
            let _ = fs::remove_file(&backup);
            fs::rename(path, &backup)?;

            if let Err(retry_err) = err.file.persist(path) {
                let _ = fs::rename(&backup, path);
                return Err(retry_err.error);
            }
            if let Err(e) = fs::remove_file(&backup) {
                tracing::warn!(
                    path = %backup.display(),
                    "Failed to remove .bak after atomic write: {e}"
                );
            }
        } else {
            return Err(err.error);
        }
    }

    if options.dir_sync {
        best_effort_sync_dir(parent);
    }

    Ok(())
}

/// Restore `path` from `path.bak` if a crash interrupted an overwrite mid-swap.
///
/// Only fires when the canonical file is missing and the backup exists, which
/// is exactly the window between the two renames above.
pub fn recover_backup(path: &Path) {
    let backup = path.with_extension("bak");
    if !path.exists() && backup.exists() {
        match fs::rename(&backup, path) {
            Ok(()) => {
                tracing::warn!(
                    path = %path.display(),
                    "Recovered .bak file from interrupted atomic write"
                );
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to recover .bak file: {e}");
            }
        }
    }
}

#[cfg(unix)]
fn best_effort_sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(path = %dir.display(), "Directory sync failed (best-effort): {e}");
    }
}

#[cfg(not(unix))]
fn best_effort_sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{AtomicWriteOptions, atomic_write, atomic_write_with_options, recover_backup};

    #[test]
    fn creates_new_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fresh.json");

        atomic_write(&path, b"{}").expect("write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "{}");
    }

    #[test]
    fn overwrites_existing_and_cleans_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.json");

        atomic_write(&path, b"one").expect("write one");
        atomic_write(&path, b"two").expect("write two");

        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        assert!(!path.with_extension("bak").exists());
    }

    #[test]
    fn recover_backup_restores_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.json");
        let backup = path.with_extension("bak");
        fs::write(&backup, b"salvaged").expect("write bak");

        recover_backup(&path);

        assert_eq!(fs::read_to_string(&path).expect("read"), "salvaged");
        assert!(!backup.exists());
    }

    #[test]
    fn recover_backup_leaves_healthy_file_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.json");
        fs::write(&path, b"current").expect("write");
        fs::write(path.with_extension("bak"), b"stale").expect("write bak");

        recover_backup(&path);

        assert_eq!(fs::read_to_string(&path).expect("read"), "current");
    }

    #[cfg(unix)]
    #[test]
    fn applies_unix_mode_when_configured() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("private.json");
        let opts = AtomicWriteOptions {
            sync_all: false,
            dir_sync: false,
            unix_mode: Some(0o600),
        };

        atomic_write_with_options(&path, b"x", opts).expect("write");

        let mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
