//! Sync-to-async bridge for FUSE callbacks.
//!
//! fuser drives the [`Filesystem`](fuser::Filesystem) trait from
//! synchronous threads, while the engine is async. Each callback hands
//! its future to the tokio runtime and blocks on a oneshot for the
//! result, with a deadline so a hung Pod cannot wedge the kernel's VFS
//! layer indefinitely.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::warn;

/// Counters for bridged operations, shared across all FUSE threads.
#[derive(Debug, Default)]
pub struct BridgeStats {
    operations_started: AtomicU64,
    operations_completed: AtomicU64,
    operations_timed_out: AtomicU64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> u64 {
        self.operations_started.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.operations_completed.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.operations_timed_out.load(Ordering::Relaxed)
    }
}

/// Failure modes of the bridge itself, distinct from engine errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Timeout(_) => libc::ETIMEDOUT,
            Self::Cancelled => libc::ECANCELED,
        }
    }
}

/// Runs `future` on the runtime and blocks the calling thread until it
/// completes or `timeout` elapses. On timeout the task is aborted so it
/// does not keep holding handles or locks.
///
/// Must not be called from within the runtime; FUSE callback threads
/// never are.
pub fn execute<F, T>(
    handle: &Handle,
    timeout: Duration,
    stats: Option<&BridgeStats>,
    future: F,
) -> Result<T, BridgeError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    if let Some(stats) = stats {
        stats.operations_started.fetch_add(1, Ordering::Relaxed);
    }

    let (tx, rx) = oneshot::channel();
    let task = handle.spawn(async move {
        let result = tokio::time::timeout(timeout, future).await;
        // Receiver gone means the FUSE thread already gave up.
        let _ = tx.send(result);
    });

    match rx.blocking_recv() {
        Ok(Ok(value)) => {
            if let Some(stats) = stats {
                stats.operations_completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(value)
        }
        Ok(Err(_elapsed)) => {
            if let Some(stats) = stats {
                stats.operations_timed_out.fetch_add(1, Ordering::Relaxed);
            }
            warn!(?timeout, "bridged operation timed out");
            task.abort();
            Err(BridgeError::Timeout(timeout))
        }
        Err(_) => {
            task.abort();
            Err(BridgeError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Runtime;

    #[test]
    fn test_execute_returns_value() {
        let rt = Runtime::new().unwrap();
        let result = execute(rt.handle(), Duration::from_secs(5), None, async { 41 + 1 });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_execute_times_out() {
        let rt = Runtime::new().unwrap();
        let stats = BridgeStats::new();
        let result = execute(
            rt.handle(),
            Duration::from_millis(20),
            Some(&stats),
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                0u8
            },
        );
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
        assert_eq!(stats.started(), 1);
        assert_eq!(stats.timed_out(), 1);
        assert_eq!(stats.completed(), 0);
    }

    #[test]
    fn test_stats_count_completions() {
        let rt = Runtime::new().unwrap();
        let stats = BridgeStats::new();
        for _ in 0..3 {
            execute(rt.handle(), Duration::from_secs(5), Some(&stats), async {}).unwrap();
        }
        assert_eq!(stats.started(), 3);
        assert_eq!(stats.completed(), 3);
        assert_eq!(stats.timed_out(), 0);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(
            BridgeError::Timeout(Duration::from_secs(1)).to_errno(),
            libc::ETIMEDOUT
        );
        assert_eq!(BridgeError::Cancelled.to_errno(), libc::ECANCELED);
    }
}
