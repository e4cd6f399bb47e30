use crate::usage::{self, to_gb};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Background quota check for one runner invocation.
///
/// Samples the watched directory's size at a fixed interval and trips a
/// flag once usage reaches the quota. The flag and the task belong to a
/// single invocation; nothing is shared across calls. The loop only ends
/// on its own after a breach, otherwise the runner tears it down via
/// [`QuotaMonitor::stop`].
pub struct QuotaMonitor {
    tripped: Arc<AtomicBool>,
    breach: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl QuotaMonitor {
    /// Spawn the sampling loop for one invocation.
    pub fn spawn(watch_path: PathBuf, quota_bytes: u64, poll_interval: Duration) -> Self {
        let tripped = Arc::new(AtomicBool::new(false));
        let breach = Arc::new(Notify::new());
        let flag = Arc::clone(&tripped);
        let notify = Arc::clone(&breach);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                ticker.tick().await;
                let used = match usage::dir_usage(&watch_path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        // the protected command may be churning the tree;
                        // a failed sample never trips the quota
                        tracing::debug!(error = %e, "usage sample failed, retrying next tick");
                        continue;
                    }
                };
                tracing::debug!(used_gb = to_gb(used), quota_gb = to_gb(quota_bytes), "usage sample");
                if used >= quota_bytes {
                    tracing::warn!(
                        used_gb = to_gb(used),
                        quota_gb = to_gb(quota_bytes),
                        path = %watch_path.display(),
                        "disk quota exceeded, requesting termination"
                    );
                    flag.store(true, Ordering::Release);
                    notify.notify_one();
                    break;
                }
            }
        });

        Self {
            tripped,
            breach,
            handle,
        }
    }

    /// Whether a sample has observed usage at or over the quota.
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Resolve once the quota is breached. Never resolves otherwise.
    pub async fn breached(&self) {
        while !self.tripped() {
            self.breach.notified().await;
        }
    }

    /// Tear down the sampling task and join it, returning the final state
    /// of the flag. Called on every runner exit path.
    pub async fn stop(self) -> bool {
        let Self {
            tripped, handle, ..
        } = self;
        handle.abort();
        // Cancelled is the normal join result; a tripped monitor has
        // already exited on its own.
        let _ = handle.await;
        tripped.load(Ordering::Acquire)
    }
}
