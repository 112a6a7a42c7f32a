use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use switchyard_core::SwitchyardResult;
use tracing::warn;

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    failures: AtomicU64,
    total_micros: AtomicU64,
}

/// Latency and failure accounting for an agent's outbound calls
/// (database driver, completion API, ...).
#[derive(Clone, Default)]
pub struct CallTracker {
    counters: Arc<Counters>,
}

/// Snapshot of a [`CallTracker`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    pub calls: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `call`, recording its latency and whether it failed.
    pub async fn track<T, F>(&self, target: &str, call: F) -> SwitchyardResult<T>
    where
        F: Future<Output = SwitchyardResult<T>>,
    {
        let started = Instant::now();
        let result = call.await;
        let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_micros
            .fetch_add(micros, Ordering::Relaxed);
        if let Err(e) = &result {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!(target = %target, error = %e, "External call failed");
        }
        result
    }

    pub fn stats(&self) -> CallStats {
        let calls = self.counters.calls.load(Ordering::Relaxed);
        let avg_latency_ms = if calls == 0 {
            0.0
        } else {
            self.counters.total_micros.load(Ordering::Relaxed) as f64 / calls as f64 / 1000.0
        };
        CallStats {
            calls,
            failures: self.counters.failures.load(Ordering::Relaxed),
            avg_latency_ms,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use switchyard_core::SwitchyardError;

    #[tokio::test]
    async fn test_tracks_success_and_failure() {
        let tracker = CallTracker::new();
        let ok = tracker.track("db", async { Ok::<_, SwitchyardError>(5) }).await;
        assert_eq!(ok.ok(), Some(5));
        let err: SwitchyardResult<()> = tracker
            .track("db", async { Err(SwitchyardError::Timeout("slow".into())) })
            .await;
        assert!(err.is_err());

        let stats = tracker.stats();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let tracker = CallTracker::new();
        let clone = tracker.clone();
        let done = futures_util::FutureExt::now_or_never(clone.track("x", async { Ok(()) }));
        assert!(matches!(done, Some(Ok(()))));
        assert_eq!(tracker.stats().calls, 1);
    }
}
