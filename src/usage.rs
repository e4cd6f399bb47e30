//! Disk usage probe: recursive file-size summation under a directory.
//!
//! Advisory telemetry for quota enforcement. Quota comparisons use raw
//! byte counts; the GB figures are rounded for logging only.

use std::path::{Path, PathBuf};

pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Errors from probing a directory tree.
#[derive(Debug)]
pub enum UsageError {
    /// The root of the scan does not exist or cannot be opened.
    PathUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsageError::PathUnreadable { path, source } => {
                write!(f, "cannot scan directory {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for UsageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UsageError::PathUnreadable { source, .. } => Some(source),
        }
    }
}

/// Total bytes held by regular files under `root`.
///
/// Directories and symlinks contribute nothing to the sum, and symlinks
/// are not followed. Entries that cannot be read mid-scan are skipped;
/// only an unreadable root is an error.
pub fn dir_usage(root: &Path) -> Result<u64, UsageError> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    let mut at_root = true;

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(source) if at_root => {
                return Err(UsageError::PathUnreadable { path: dir, source });
            }
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    dir = %dir.display(),
                    "skipping unreadable directory during usage scan"
                );
                continue;
            }
        };
        at_root = false;

        for entry in entries.flatten() {
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable entry during usage scan");
                    continue;
                }
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                match entry.metadata() {
                    Ok(meta) => total += meta.len(),
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping unreadable file during usage scan");
                    }
                }
            }
        }
    }

    Ok(total)
}

/// Bytes as GB, rounded to two decimals. Telemetry only.
pub fn to_gb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_GB as f64 * 100.0).round() / 100.0
}

/// GB figure (e.g. from config) as raw bytes.
pub fn gb_to_bytes(gb: f64) -> u64 {
    (gb.max(0.0) * BYTES_PER_GB as f64) as u64
}

/// Log the current usage of `path` with a phase label describing what
/// has occurred (begin/finish/fail of a protected command).
pub fn log_usage(phase: &str, path: &Path) {
    match dir_usage(path) {
        Ok(bytes) => {
            tracing::info!(usage_gb = to_gb(bytes), path = %path.display(), "{phase}");
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "{phase} (usage unavailable)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_directory_is_zero() {
        let dir = tempdir().unwrap();
        assert_eq!(dir_usage(dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_sums_flat_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("b"), vec![0u8; 250]).unwrap();
        assert_eq!(dir_usage(dir.path()).unwrap(), 350);
    }

    #[test]
    fn test_sums_nested_files() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("one").join("two");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(dir.path().join("top"), vec![0u8; 10]).unwrap();
        std::fs::write(sub.join("deep"), vec![0u8; 30]).unwrap();
        assert_eq!(dir_usage(dir.path()).unwrap(), 40);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_excluded() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("real"), vec![0u8; 64]).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();
        assert_eq!(dir_usage(dir.path()).unwrap(), 64);
    }

    #[test]
    fn test_missing_root_is_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = dir_usage(&missing).unwrap_err();
        assert!(matches!(err, UsageError::PathUnreadable { .. }));
        assert!(err.to_string().contains("cannot scan"));
    }

    #[test]
    fn test_file_root_is_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, "data").unwrap();
        assert!(matches!(
            dir_usage(&file),
            Err(UsageError::PathUnreadable { .. })
        ));
    }

    #[test]
    fn test_probe_is_idempotent() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 123]).unwrap();
        let first = dir_usage(dir.path()).unwrap();
        let second = dir_usage(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_to_gb_rounds_two_decimals() {
        assert_eq!(to_gb(0), 0.0);
        assert_eq!(to_gb(BYTES_PER_GB), 1.0);
        assert_eq!(to_gb(BYTES_PER_GB / 2), 0.5);
        // 1.5 GB + a little should still round to 1.5
        assert_eq!(to_gb(BYTES_PER_GB + BYTES_PER_GB / 2 + 1024), 1.5);
    }

    #[test]
    fn test_gb_to_bytes_round_trip() {
        assert_eq!(gb_to_bytes(1.0), BYTES_PER_GB);
        assert_eq!(gb_to_bytes(0.0), 0);
        // negative input clamps to zero rather than wrapping
        assert_eq!(gb_to_bytes(-5.0), 0);
    }
}
