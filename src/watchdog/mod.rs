use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    Alive,
    Expired,
}

/// Receives every status transition. Invoked with the watchdog's lock held,
/// so it must not call back into the watchdog.
pub type LivenessHook = Arc<dyn Fn(WatchdogStatus) + Send + Sync>;

/// Heartbeat monitor for the push channel.
///
/// Starts out `Expired`: nothing is known about the link until the first
/// snapshot arrives, so the first `reset()` reports `Alive`.
#[derive(Clone)]
pub struct LivenessWatchdog {
    inner: Arc<Mutex<WatchdogInner>>,
    timeout: Duration,
    notify: LivenessHook,
}

struct WatchdogInner {
    status: WatchdogStatus,
    timer: Option<JoinHandle<()>>,
    // Bumped on every arm/cancel so a timer that already woke up but lost the
    // race against disable() cannot expire the watchdog.
    generation: u64,
}

impl LivenessWatchdog {
    pub fn new(timeout: Duration, notify: LivenessHook) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WatchdogInner {
                status: WatchdogStatus::Expired,
                timer: None,
                generation: 0,
            })),
            timeout,
            notify,
        }
    }

    pub fn status(&self) -> WatchdogStatus {
        self.lock().status
    }

    /// Arms the expiry timer, replacing any running one.
    pub fn enable(&self) {
        let mut inner = self.lock();
        inner.cancel_timer();
        let generation = inner.generation;
        let watchdog = self.clone();
        let timeout = self.timeout;
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            watchdog.expire(generation);
        }));
    }

    /// Cancels the timer. Reports `Alive` if the watchdog had expired.
    pub fn disable(&self) {
        let mut inner = self.lock();
        inner.cancel_timer();
        if inner.status == WatchdogStatus::Expired {
            inner.status = WatchdogStatus::Alive;
            (self.notify)(WatchdogStatus::Alive);
        }
    }

    pub fn reset(&self) {
        self.disable();
        self.enable();
    }

    fn expire(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.timer = None;
        if inner.status == WatchdogStatus::Alive {
            inner.status = WatchdogStatus::Expired;
            tracing::warn!(
                timeout_ms = self.timeout.as_millis() as u64,
                "no state snapshot within watchdog timeout"
            );
            (self.notify)(WatchdogStatus::Expired);
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatchdogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WatchdogInner {
    fn cancel_timer(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn recorder() -> (LivenessHook, Arc<Mutex<Vec<WatchdogStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook: LivenessHook = Arc::new(move |status| sink.lock().unwrap().push(status));
        (hook, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn first_reset_reports_alive_once() {
        let (hook, seen) = recorder();
        let watchdog = LivenessWatchdog::new(Duration::from_millis(1500), hook);
        assert_eq!(watchdog.status(), WatchdogStatus::Expired);

        watchdog.reset();
        watchdog.reset();
        watchdog.reset();

        assert_eq!(*seen.lock().unwrap(), vec![WatchdogStatus::Alive]);
        assert_eq!(watchdog.status(), WatchdogStatus::Alive);
    }

    #[tokio::test(start_paused = true)]
    async fn resets_within_timeout_never_expire() {
        let (hook, seen) = recorder();
        let watchdog = LivenessWatchdog::new(Duration::from_millis(1500), hook);

        for _ in 0..20 {
            watchdog.reset();
            sleep(Duration::from_millis(750)).await;
        }

        assert_eq!(*seen.lock().unwrap(), vec![WatchdogStatus::Alive]);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_fires_once_and_next_reset_restores_once() {
        let (hook, seen) = recorder();
        let watchdog = LivenessWatchdog::new(Duration::from_millis(1500), hook);

        watchdog.reset();
        sleep(Duration::from_millis(1501)).await;
        assert_eq!(watchdog.status(), WatchdogStatus::Expired);

        // Re-arming while expired must not report a second expiry.
        watchdog.enable();
        sleep(Duration::from_millis(5000)).await;

        watchdog.reset();
        watchdog.reset();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                WatchdogStatus::Alive,
                WatchdogStatus::Expired,
                WatchdogStatus::Alive
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disable_cancels_pending_expiry() {
        let (hook, seen) = recorder();
        let watchdog = LivenessWatchdog::new(Duration::from_millis(100), hook);

        watchdog.reset();
        watchdog.disable();
        sleep(Duration::from_millis(1000)).await;

        assert_eq!(watchdog.status(), WatchdogStatus::Alive);
        assert_eq!(*seen.lock().unwrap(), vec![WatchdogStatus::Alive]);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_while_expired_reports_alive_without_rearming() {
        let (hook, seen) = recorder();
        let watchdog = LivenessWatchdog::new(Duration::from_millis(100), hook);

        watchdog.disable();
        sleep(Duration::from_millis(1000)).await;

        assert_eq!(*seen.lock().unwrap(), vec![WatchdogStatus::Alive]);
        assert_eq!(watchdog.status(), WatchdogStatus::Alive);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_cannot_expire() {
        let (hook, seen) = recorder();
        let watchdog = LivenessWatchdog::new(Duration::from_millis(100), hook);
        watchdog.reset();
        let stale = watchdog.lock().generation;
        watchdog.reset();

        watchdog.expire(stale);

        assert_eq!(watchdog.status(), WatchdogStatus::Alive);
        assert_eq!(*seen.lock().unwrap(), vec![WatchdogStatus::Alive]);
    }
}
