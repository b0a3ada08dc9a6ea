use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A one-shot, rearmable timer. `rearm` cancels any prior timer and
/// schedules the callback to fire once after `timeout`; `disarm` cancels
/// without firing. `timeout <= 0` is a no-op: the watchdog never expires,
/// matching the "never expire" semantics used for idle timeouts that
/// aren't configured.
pub struct IdleWatchdog {
    current: Option<(JoinHandle<()>, CancellationToken)>,
}

impl IdleWatchdog {
    pub fn new() -> Self {
        Self { current: None }
    }

    pub fn rearm<F, Fut>(&mut self, timeout: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        if timeout.is_zero() {
            return;
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    callback().await;
                }
                _ = task_token.cancelled() => {}
            }
        });
        self.current = Some((handle, token));
    }

    pub fn disarm(&mut self) {
        if let Some((handle, token)) = self.current.take() {
            token.cancel();
            handle.abort();
        }
    }
}

impl Default for IdleWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IdleWatchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_timeout() {
        let mut wd = IdleWatchdog::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        wd.rearm(Duration::from_millis(100), move || {
            let fired2 = fired2.clone();
            async move {
                fired2.store(true, Ordering::SeqCst);
            }
        });
        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_fire() {
        let mut wd = IdleWatchdog::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        wd.rearm(Duration::from_millis(100), move || {
            let fired2 = fired2.clone();
            async move {
                fired2.store(true, Ordering::SeqCst);
            }
        });
        wd.disarm();
        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn zero_timeout_never_fires() {
        let mut wd = IdleWatchdog::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        wd.rearm(Duration::ZERO, move || {
            let fired2 = fired2.clone();
            async move {
                fired2.store(true, Ordering::SeqCst);
            }
        });
        assert!(wd.current.is_none());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_cancels_previous_timer() {
        let mut wd = IdleWatchdog::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f1 = fired.clone();
        wd.rearm(Duration::from_millis(50), move || {
            let f1 = f1.clone();
            async move {
                f1.store(true, Ordering::SeqCst);
            }
        });
        let f2 = fired.clone();
        wd.rearm(Duration::from_millis(200), move || {
            let f2 = f2.clone();
            async move {
                f2.store(true, Ordering::SeqCst);
            }
        });
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
