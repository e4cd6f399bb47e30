use crate::usage::{self, to_gb, UsageError, BYTES_PER_GB};
use std::path::{Path, PathBuf};

/// Free space held back from every quota so a full budget cannot drive
/// the node to zero.
pub const SAFETY_BUFFER_BYTES: u64 = 3 * BYTES_PER_GB;

/// Errors from resolving the effective quota.
#[derive(Debug)]
pub enum CapacityError {
    /// Filesystem statistics for the watched mount could not be read.
    /// Fatal precondition failure, never retried.
    CapacityUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Usage probe failed on the watched path.
    Usage(UsageError),
}

impl std::fmt::Display for CapacityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityError::CapacityUnreadable { path, source } => {
                write!(
                    f,
                    "cannot read free space for mount backing {}: {}",
                    path.display(),
                    source
                )
            }
            CapacityError::Usage(e) => write!(f, "usage probe failed: {}", e),
        }
    }
}

impl std::error::Error for CapacityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CapacityError::CapacityUnreadable { source, .. } => Some(source),
            CapacityError::Usage(e) => Some(e),
        }
    }
}

/// Shrink `requested` when the node cannot back it: the budget left until
/// the quota is reached must fit in the node's available space.
fn clamp_quota(requested: u64, already_used: u64, available: u64) -> u64 {
    let remaining = requested.saturating_sub(already_used);
    if remaining < available {
        requested
    } else {
        already_used.saturating_add(available)
    }
}

/// Resolve the effective quota for one invocation.
///
/// Queries the filesystem statistics of the mount backing `watch_path`
/// (not a mount-table listing), holds back [`SAFETY_BUFFER_BYTES`], and
/// shrinks the requested quota if the node's free space cannot support
/// the remaining budget.
pub fn resolve(requested: u64, watch_path: &Path) -> Result<u64, CapacityError> {
    let free = fs2::available_space(watch_path).map_err(|source| {
        CapacityError::CapacityUnreadable {
            path: watch_path.to_path_buf(),
            source,
        }
    })?;
    let available = free.saturating_sub(SAFETY_BUFFER_BYTES);
    let already_used = usage::dir_usage(watch_path).map_err(CapacityError::Usage)?;

    let effective = clamp_quota(requested, already_used, available);
    if effective < requested {
        tracing::warn!(
            requested_gb = to_gb(requested),
            available_gb = to_gb(available),
            used_gb = to_gb(already_used),
            effective_gb = to_gb(effective),
            "node free space cannot back the requested quota, shrinking"
        );
    } else {
        tracing::debug!(
            requested_gb = to_gb(requested),
            available_gb = to_gb(available),
            used_gb = to_gb(already_used),
            "requested quota fits within node free space"
        );
    }
    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GB: u64 = BYTES_PER_GB;

    #[test]
    fn test_quota_kept_when_node_has_headroom() {
        // 10 GB requested, 2 GB used, 20 GB available: remaining 8 < 20
        assert_eq!(clamp_quota(10 * GB, 2 * GB, 20 * GB), 10 * GB);
    }

    #[test]
    fn test_quota_shrunk_when_node_is_tight() {
        // 100 GB requested, 2 GB used, 5 GB available: shrink to 7 GB
        assert_eq!(clamp_quota(100 * GB, 2 * GB, 5 * GB), 7 * GB);
    }

    #[test]
    fn test_shrunk_quota_never_exceeds_node_capacity() {
        for &(requested, used, available) in &[
            (100 * GB, 0, 5 * GB),
            (100 * GB, 50 * GB, 1 * GB),
            (1 * GB, 10 * GB, 0),
            (0, 0, 0),
        ] {
            let effective = clamp_quota(requested, used, available);
            // whatever is granted beyond current usage fits in available space
            assert!(effective.saturating_sub(used) <= available);
        }
    }

    #[test]
    fn test_zero_available_caps_at_current_usage() {
        assert_eq!(clamp_quota(10 * GB, 4 * GB, 0), 4 * GB);
    }

    #[test]
    fn test_quota_already_consumed_is_kept() {
        // used beyond the request: remaining saturates to 0 < available
        assert_eq!(clamp_quota(5 * GB, 8 * GB, 20 * GB), 5 * GB);
    }

    #[test]
    fn test_resolve_on_real_filesystem() {
        let dir = tempdir().unwrap();
        // a tiny request always fits, so it comes back unchanged
        let effective = resolve(1024, dir.path()).unwrap();
        assert!(effective <= 1024);
    }

    #[test]
    fn test_resolve_missing_path_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        assert!(resolve(1024, &missing).is_err());
    }
}
