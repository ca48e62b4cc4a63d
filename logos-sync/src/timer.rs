//! Cancelable scheduled tasks.
//!
//! Every timer a component owns (reconnect backoff, keepalive, presence
//! flush, expiry sweep, lock auto-release) is a [`ScheduledTask`]: a tokio
//! task that is aborted when the handle is cancelled or dropped. Components
//! release all of their handles in a single `dispose()`.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Handle to a spawned timer task. Dropping it cancels the task.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `f` once after `delay`.
    ///
    /// Returns `None` outside a tokio runtime; callers treat that as
    /// "no timer" and rely on lazy checks instead.
    pub fn once<F, Fut>(delay: Duration, f: F) -> Option<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            f().await;
        })
    }

    /// Run `f` every `period`, first firing one period from now.
    pub fn every<F>(period: Duration, mut f: F) -> Option<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        Self::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                f();
            }
        })
    }

    /// Wrap an arbitrary background future.
    pub fn spawn<Fut>(fut: Fut) -> Option<Self>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        Some(Self {
            handle: Some(runtime.spawn(fut)),
        })
    }

    pub fn cancel(mut self) {
        self.abort();
    }

    /// Give up ownership without aborting. Used by a task that is replacing
    /// its own handle from inside itself.
    pub fn detach(mut self) {
        self.handle.take();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _task = ScheduledTask::once(Duration::from_millis(100), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let task = ScheduledTask::once(Duration::from_millis(50), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        task.cancel();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_repeats_until_dropped() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let task = ScheduledTask::every(Duration::from_secs(5), move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        drop(task);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_no_runtime_returns_none() {
        assert!(ScheduledTask::once(Duration::ZERO, || async {}).is_none());
    }
}
