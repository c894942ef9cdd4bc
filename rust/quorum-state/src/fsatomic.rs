//! Atomic file writes and the state-directory path guard.
//!
//! Lock files, backups and archive exports all go through these helpers:
//! a write lands as `path + ".tmp"` followed by a rename, and every target
//! path must resolve beneath the state directory before anything touches
//! the filesystem.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, StateError};

/// Resolve `candidate` against the state directory and reject escapes.
///
/// Relative candidates are joined onto the state directory first. The
/// resolution is purely lexical (`..` and `.` components are folded
/// without following symlinks) so the guard also works for paths that do
/// not exist yet.
///
/// # Errors
///
/// Returns [`StateError::PathOutsideStateDir`] when the resolved path is
/// not beneath the state directory.
pub fn within_state_dir(state_dir: &Path, candidate: &Path) -> Result<PathBuf> {
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        state_dir.join(candidate)
    };
    let resolved = normalize(&absolute)
        .ok_or_else(|| StateError::PathOutsideStateDir(candidate.to_path_buf()))?;
    let root = normalize(state_dir)
        .ok_or_else(|| StateError::PathOutsideStateDir(state_dir.to_path_buf()))?;
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(StateError::PathOutsideStateDir(candidate.to_path_buf()))
    }
}

/// Fold `.` and `..` components lexically; `None` when `..` climbs past
/// the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Some(out)
}

/// Write `bytes` to `path` atomically.
///
/// The payload lands in `path.tmp` first and is renamed over the target.
/// Platforms that refuse to rename over an existing file get a second
/// attempt after the target is removed. The temp file is cleaned up on any
/// failure, and the parent directory is created (mode 0750) if absent.
pub fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_restricted(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    if let Err(err) = write_file(&tmp, bytes, mode) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Rename over an existing target is forbidden on some
            // platforms; clear the target and try once more.
            let _ = fs::remove_file(path);
            fs::rename(&tmp, path).map_err(|err| {
                let _ = fs::remove_file(&tmp);
                StateError::Io(err)
            })
        }
    }
}

fn write_file(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Create `dir` and its ancestors with mode 0750.
pub fn create_dir_restricted(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o750);
    }
    builder.create(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_accepts_paths_inside_the_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = within_state_dir(dir.path(), Path::new("archive/wf-1.json")).unwrap();
        assert!(resolved.starts_with(dir.path()));

        let absolute = dir.path().join("state.db.bak");
        assert!(within_state_dir(dir.path(), &absolute).is_ok());
    }

    #[test]
    fn guard_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        for escape in ["../outside", "archive/../../outside", "/etc/passwd"] {
            let err = within_state_dir(dir.path(), Path::new(escape)).unwrap_err();
            assert!(matches!(err, StateError::PathOutsideStateDir(_)), "{escape}");
        }
    }

    #[test]
    fn guard_folds_dot_components() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = within_state_dir(dir.path(), Path::new("./archive/./a.json")).unwrap();
        assert_eq!(resolved, dir.path().join("archive/a.json"));
    }

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/deep/out.json");

        atomic_write(&target, b"first", 0o600).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"first");

        atomic_write(&target, b"second", 0o600).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");

        // No temp file left behind.
        assert!(!dir.path().join("nested/deep/out.json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_applies_the_requested_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("locked.json");
        atomic_write(&target, b"{}", 0o600).unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
