use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What the dispatched action wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    Done,
    /// Run again after the interval
    Retry,
    /// Stop the dispatcher
    Stop,
}

/// Runs an async action on a background task, at most once per `interval`.
///
/// Invocations while the action is pending or running collapse into one further run.
/// The action never overlaps itself.
pub(crate) struct RateLimitedDispatch {
    notify: Arc<Notify>,
    stop: CancellationToken,
}

impl RateLimitedDispatch {
    /// Must be called within a tokio runtime
    pub fn spawn<F, Fut>(interval: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Pass> + Send + 'static,
    {
        let notify = Arc::new(Notify::new());
        let stop = CancellationToken::new();

        let task_notify = Arc::clone(&notify);
        let task_stop = stop.clone();
        tokio::spawn(async move {
            let mut last_run: Option<Instant> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = task_stop.cancelled() => break,
                    _ = task_notify.notified() => {}
                }
                if let Some(last) = last_run {
                    tokio::select! {
                        biased;
                        _ = task_stop.cancelled() => break,
                        _ = tokio::time::sleep_until(last + interval) => {}
                    }
                }

                last_run = Some(Instant::now());
                match action().await {
                    Pass::Done => {}
                    Pass::Retry => task_notify.notify_one(),
                    Pass::Stop => break,
                }
            }
            debug!("Rate-limited dispatcher stopped");
        });

        Self { notify, stop }
    }

    /// Schedule a run without waiting for it
    pub fn invoke(&self) {
        self.notify.notify_one();
    }
}

impl Drop for RateLimitedDispatch {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_invocations_collapse_and_are_spaced() {
        let runs = Arc::new(AtomicUsize::new(0));
        let times = Arc::new(std::sync::Mutex::new(Vec::new()));
        let dispatch = {
            let runs = Arc::clone(&runs);
            let times = Arc::clone(&times);
            RateLimitedDispatch::spawn(Duration::from_millis(200), move || {
                runs.fetch_add(1, Ordering::SeqCst);
                times.lock().unwrap().push(Instant::now());
                async { Pass::Done }
            })
        };

        let start = Instant::now();
        dispatch.invoke();
        tokio::task::yield_now().await;
        for _ in 0..5 {
            dispatch.invoke();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let times = times.lock().unwrap();
        assert!(times[1] - times[0] >= Duration::from_millis(200));
        assert!(times[0] - start < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reschedules() {
        let runs = Arc::new(AtomicUsize::new(0));
        let _dispatch = {
            let runs = Arc::clone(&runs);
            let dispatch = RateLimitedDispatch::spawn(Duration::from_millis(100), move || {
                let n = runs.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Pass::Retry } else { Pass::Done } }
            });
            dispatch.invoke();
            dispatch
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task() {
        let runs = Arc::new(AtomicUsize::new(0));
        let dispatch = {
            let runs = Arc::clone(&runs);
            RateLimitedDispatch::spawn(Duration::from_millis(10), move || {
                runs.fetch_add(1, Ordering::SeqCst);
                async { Pass::Stop }
            })
        };
        dispatch.invoke();
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatch.invoke();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
