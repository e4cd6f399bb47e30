//! Archive extraction under the disk budget.
//!
//! Discovers `.tar.zst` archives under a source tree and unpacks each one
//! through the bounded runner. Archives that live inside the watched tree
//! are deleted once their contents are on disk, reclaiming the space they
//! occupy.

use crate::runner::{self, Outcome, RunError, RunOptions};
use std::path::{Path, PathBuf};

/// Errors from one extraction pass.
#[derive(Debug)]
pub enum ExtractError {
    /// The glob pattern over the source tree could not be built.
    Pattern { source: glob::PatternError },
    /// The runner refused to start (precondition failure).
    Run(RunError),
    /// An archive did not extract cleanly; the pass stops at it.
    Halted { archive: PathBuf, outcome: Outcome },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Pattern { source } => {
                write!(f, "bad archive search pattern: {}", source)
            }
            ExtractError::Run(e) => write!(f, "extraction could not start: {}", e),
            ExtractError::Halted { archive, outcome } => {
                write!(
                    f,
                    "extraction of {} halted: {:?}",
                    archive.display(),
                    outcome
                )
            }
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractError::Pattern { source } => Some(source),
            ExtractError::Run(e) => Some(e),
            ExtractError::Halted { .. } => None,
        }
    }
}

/// Counts from one extraction pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExtractReport {
    /// Archives unpacked successfully.
    pub extracted: usize,
    /// Archives deleted after unpacking.
    pub removed: usize,
}

/// All `.tar.zst` archives under `source_dir`, sorted for a deterministic
/// extraction order. A missing source directory simply yields no matches.
pub fn find_archives(source_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    let pattern = source_dir.join("**").join("*.tar.zst");
    let pattern = pattern.to_string_lossy().into_owned();
    let mut archives: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|source| ExtractError::Pattern { source })?
        .flatten()
        .collect();
    archives.sort();
    Ok(archives)
}

/// The tar invocation for one archive: zstd decode, unpack into `dest`.
fn tar_command(archive: &Path, dest: &Path) -> Vec<String> {
    vec![
        "tar".to_string(),
        "-I".to_string(),
        "zstd".to_string(),
        "-xf".to_string(),
        archive.display().to_string(),
        "-C".to_string(),
        dest.display().to_string(),
    ]
}

/// Unpack every `.tar.zst` archive under `source_dir` into `dest_dir`,
/// each run under the disk budget in `opts`.
///
/// A timeout, quota breach, or tar failure halts the pass; archives
/// already unpacked stay unpacked. Archives under the watched tree are
/// removed after a clean extraction.
pub async fn extract_archives(
    source_dir: &Path,
    dest_dir: &Path,
    opts: &RunOptions,
) -> Result<ExtractReport, ExtractError> {
    let archives = find_archives(source_dir)?;
    if archives.is_empty() {
        tracing::info!(source = %source_dir.display(), "no .tar.zst archives to extract");
        return Ok(ExtractReport::default());
    }

    let mut report = ExtractReport::default();
    for archive in archives {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive.display().to_string());
        let label = format!("unpacking '{name}'");

        match runner::run_guarded(&tar_command(&archive, dest_dir), &label, opts).await {
            Ok(Outcome::Completed) => report.extracted += 1,
            Ok(outcome) => return Err(ExtractError::Halted { archive, outcome }),
            Err(e) => return Err(ExtractError::Run(e)),
        }

        if archive.starts_with(&opts.watch_path) {
            match std::fs::remove_file(&archive) {
                Ok(()) => {
                    tracing::info!(
                        archive = %archive.display(),
                        "removed archive after extraction to reclaim space"
                    );
                    report.removed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        archive = %archive.display(),
                        "failed to remove extracted archive"
                    );
                }
            }
        }
    }

    Ok(report)
}
