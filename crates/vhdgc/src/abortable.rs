//! Abortable operations.
//!
//! A long-running backend call runs as its own task while the caller
//! polls the SR abort flag and an optional deadline. When either fires,
//! the task's cancellation token is cancelled and the task is aborted;
//! dropping its future kills any child process it spawned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vhdgc_core::AbortSignal;
use vhdgc_proto::{GcError, GcResult};

/// Abort flag of one SR plus its polling interval.
#[derive(Clone)]
pub struct AbortScope {
    sr_uuid: String,
    signal: Arc<dyn AbortSignal>,
    poll: Duration,
}

impl AbortScope {
    pub fn new(sr_uuid: &str, signal: Arc<dyn AbortSignal>, poll: Duration) -> Self {
        Self {
            sr_uuid: sr_uuid.to_string(),
            signal,
            poll,
        }
    }

    pub fn sr_uuid(&self) -> &str {
        &self.sr_uuid
    }

    pub fn signal(&self) -> &Arc<dyn AbortSignal> {
        &self.signal
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll
    }

    pub fn is_set(&self) -> bool {
        self.signal.test(&self.sr_uuid)
    }

    /// `Err(Aborted)` if the abort flag is raised.
    pub fn check(&self) -> GcResult<()> {
        if self.is_set() {
            info!("abort: flag set for SR {}", self.sr_uuid);
            return Err(GcError::Aborted);
        }
        Ok(())
    }

    /// Run `op` until it completes, the abort flag is raised, or
    /// `timeout` elapses.
    pub async fn run<T, F, Fut>(&self, timeout: Option<Duration>, op: F) -> GcResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = GcResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let token = CancellationToken::new();
        let mut handle = tokio::spawn(op(token.clone()));
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut handle => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) => {
                            error!("abort: abortable task failed: {}", e);
                            Err(GcError::failed(format!("abortable task failed: {}", e)))
                        }
                    };
                }
                _ = ticker.tick() => {
                    if self.is_set() {
                        info!("abort: killing abortable task for SR {}", self.sr_uuid);
                        token.cancel();
                        handle.abort();
                        return Err(GcError::Aborted);
                    }
                    if let Some(limit) = timeout {
                        if started.elapsed() >= limit {
                            error!("abort: task timed out after {:?}", limit);
                            token.cancel();
                            handle.abort();
                            return Err(GcError::failed(format!("timed out after {:?}", limit)));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use vhdgc_core::ipc::MemoryAbortFlag;

    use super::*;

    fn scope(flag: &MemoryAbortFlag) -> AbortScope {
        AbortScope::new("sr", Arc::new(flag.clone()), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_completes() {
        let flag = MemoryAbortFlag::new();
        let out = scope(&flag).run(None, |_| async { Ok(7) }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_abort_kills_task() {
        let flag = MemoryAbortFlag::new();
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        flag.set("sr").unwrap();

        let res = scope(&flag)
            .run(None, move |_| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                done.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(res, Err(GcError::Aborted));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_cancels_token() {
        let flag = MemoryAbortFlag::new();
        let seen = Arc::new(AtomicBool::new(false));
        let seen_in_task = seen.clone();
        let res = scope(&flag)
            .run(Some(Duration::from_millis(30)), move |token| async move {
                tokio::select! {
                    _ = token.cancelled() => seen_in_task.store(true, Ordering::SeqCst),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(GcError::Transient(_))));
        assert!(!res.unwrap_err().is_abort());
    }

    #[tokio::test]
    async fn test_error_passes_through() {
        let flag = MemoryAbortFlag::new();
        let res: GcResult<()> = scope(&flag)
            .run(None, |_| async { Err(GcError::failed("boom")) })
            .await;
        assert_eq!(res, Err(GcError::failed("boom")));
    }
}
