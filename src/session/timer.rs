//! Scoped one-shot timers
//!
//! A [`GraceTimer`] fires its callback once after a delay unless it is cancelled first.
//! Dropping the timer cancels it, so whichever path releases the owning session also
//! disarms the timer.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One-shot timer cancelled on drop
#[derive(Debug)]
pub struct GraceTimer {
    id: u64,
    cancel: CancellationToken,
}

impl GraceTimer {
    /// Run `on_expire` after `after` unless the timer is cancelled or dropped first
    pub fn start<F>(id: u64, after: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => on_expire(),
            }
        });

        Self { id, cancel }
    }

    /// Identifier used to recognise stale expirations
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(self) {
        // Drop does the work
    }
}

impl Drop for GraceTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _timer = GraceTimer::start(1, Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = GraceTimer::start(2, Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timer.id(), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        timer.cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
