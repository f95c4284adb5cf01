//! Filesystem utilities for drop-in detection, cleanup, and atomic writes.
//!
//! sqlitch coexists with prior Sqitch installations on the same tree: the
//! preferred filename (`sqitch.plan`, `sqitch.conf`) wins, the drop-in
//! alternative (`sqlitch.plan`, `sqlitch.conf`) is honored when it is alone,
//! and the presence of both is a user error, never a silent choice.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Preferred plan filename.
pub const PLAN_FILE: &str = "sqitch.plan";
/// Drop-in plan filename.
pub const PLAN_FILE_DROP_IN: &str = "sqlitch.plan";
/// Preferred configuration filename.
pub const CONFIG_FILE: &str = "sqitch.conf";
/// Drop-in configuration filename.
pub const CONFIG_FILE_DROP_IN: &str = "sqlitch.conf";

/// Both the preferred and the drop-in artifact exist.
#[derive(Debug, thiserror::Error)]
#[error("Found conflicting artifacts in {root}: {preferred} and {fallback}", root = .root.display())]
pub struct ArtifactConflictError {
    pub root: PathBuf,
    pub preferred: String,
    pub fallback: String,
}

/// The resolved artifact and whether it is a drop-in fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactResolution {
    /// Path of the artifact that exists, if any.
    pub path: Option<PathBuf>,
    /// True when the drop-in name was used.
    pub is_drop_in: bool,
    /// The filename that resolved.
    pub source_name: Option<String>,
}

impl ArtifactResolution {
    fn empty() -> Self {
        Self {
            path: None,
            is_drop_in: false,
            source_name: None,
        }
    }
}

/// Resolve one of a preferred/fallback filename pair within `root`.
pub fn resolve_artifact(
    root: &Path,
    preferred: &str,
    fallback: &str,
) -> Result<ArtifactResolution, ArtifactConflictError> {
    let preferred_path = root.join(preferred);
    let fallback_path = root.join(fallback);

    let has_preferred = preferred_path.exists();
    let has_fallback = fallback_path.exists();

    if has_preferred && has_fallback {
        return Err(ArtifactConflictError {
            root: root.to_path_buf(),
            preferred: preferred.to_string(),
            fallback: fallback.to_string(),
        });
    }

    if has_preferred {
        return Ok(ArtifactResolution {
            path: Some(preferred_path),
            is_drop_in: false,
            source_name: Some(preferred.to_string()),
        });
    }

    if has_fallback {
        return Ok(ArtifactResolution {
            path: Some(fallback_path),
            is_drop_in: true,
            source_name: Some(fallback.to_string()),
        });
    }

    Ok(ArtifactResolution::empty())
}

/// Resolve the plan file within `root`, preferring Sqitch naming.
pub fn resolve_plan_file(root: &Path) -> Result<ArtifactResolution, ArtifactConflictError> {
    resolve_artifact(root, PLAN_FILE, PLAN_FILE_DROP_IN)
}

/// Resolve the configuration file within `root`, preferring Sqitch naming.
pub fn resolve_config_file(root: &Path) -> Result<ArtifactResolution, ArtifactConflictError> {
    resolve_artifact(root, CONFIG_FILE, CONFIG_FILE_DROP_IN)
}

/// Remove the named artifacts from `root`, returning the paths removed.
///
/// Missing paths are ignored; removal is best-effort and idempotent.
pub fn cleanup_artifacts(root: &Path, names: &[&str]) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for name in names {
        let target = root.join(name);
        if remove_path(&target).unwrap_or(false) {
            removed.push(target);
        }
    }
    removed
}

/// Best-effort removal of a file, directory tree, or symlink.
///
/// Returns whether anything was removed.
pub fn remove_path(target: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", target.display()));
        }
    };

    if meta.is_dir() {
        fs::remove_dir_all(target)
            .with_context(|| format!("failed to remove directory {}", target.display()))?;
    } else {
        fs::remove_file(target)
            .with_context(|| format!("failed to remove {}", target.display()))?;
    }
    Ok(true)
}

/// Replace `path` atomically: write a temp sibling, fsync, rename into place.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(contents)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    fsync_parent_dir(path);

    Ok(())
}

// Advisory on POSIX; ignored where unsupported.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Ok(dir) = fs::File::open(parent)
    {
        dir.sync_all().ok();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn resolve_prefers_sqitch_naming() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join(PLAN_FILE), "%project=demo\n").expect("write");

        let res = resolve_plan_file(td.path()).expect("resolve");
        assert!(!res.is_drop_in);
        assert_eq!(res.source_name.as_deref(), Some(PLAN_FILE));
        assert_eq!(res.path, Some(td.path().join(PLAN_FILE)));
    }

    #[test]
    fn resolve_honors_drop_in_when_alone() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join(PLAN_FILE_DROP_IN), "%project=demo\n").expect("write");

        let res = resolve_plan_file(td.path()).expect("resolve");
        assert!(res.is_drop_in);
        assert_eq!(res.source_name.as_deref(), Some(PLAN_FILE_DROP_IN));
    }

    #[test]
    fn resolve_fails_when_both_exist() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join(CONFIG_FILE), "").expect("write");
        fs::write(td.path().join(CONFIG_FILE_DROP_IN), "").expect("write");

        let err = resolve_config_file(td.path()).expect_err("conflict");
        let msg = err.to_string();
        assert!(msg.contains(CONFIG_FILE));
        assert!(msg.contains(CONFIG_FILE_DROP_IN));
    }

    #[test]
    fn resolve_is_empty_when_neither_exists() {
        let td = tempdir().expect("tempdir");
        let res = resolve_plan_file(td.path()).expect("resolve");
        assert_eq!(res.path, None);
        assert_eq!(res.source_name, None);
    }

    #[test]
    fn cleanup_removes_files_and_trees() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("a.txt"), "x").expect("write");
        fs::create_dir_all(td.path().join("deploy/nested")).expect("mkdir");
        fs::write(td.path().join("deploy/nested/x.sql"), "SELECT 1;").expect("write");

        let removed = cleanup_artifacts(td.path(), &["a.txt", "deploy", "missing"]);
        assert_eq!(removed.len(), 2);
        assert!(!td.path().join("a.txt").exists());
        assert!(!td.path().join("deploy").exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("a.txt"), "x").expect("write");
        assert_eq!(cleanup_artifacts(td.path(), &["a.txt"]).len(), 1);
        assert_eq!(cleanup_artifacts(td.path(), &["a.txt"]).len(), 0);
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("sqitch.plan");
        atomic_write(&path, b"first\n").expect("write");
        atomic_write(&path, b"second\n").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second\n");
        assert!(!path.with_extension("tmp").exists());
    }
}
