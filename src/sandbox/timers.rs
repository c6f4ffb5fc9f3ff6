//! Wrapped timer primitives.
//!
//! Callback faults are caught, logged and reported with the owning plugin
//! id. They never reach the host task that scheduled them.

use crate::core::error::panic_message;
use crate::core::Result;
use crate::sandbox::boundary::{FaultKind, FaultReporter};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle to a scheduled timer.
pub struct TimerHandle {
    id: Uuid,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Timer id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the timer. A callback already running is not interrupted.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the timer has finished or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Timer factory for one plugin.
pub struct PluginTimers {
    reporter: FaultReporter,
    active: Arc<AtomicBool>,
}

impl PluginTimers {
    /// Create timers for the plugin the reporter is tagged with.
    pub fn new(reporter: FaultReporter) -> Self {
        Self {
            reporter,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Run `callback` once after `delay`.
    pub fn set_timeout<F, Fut>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let reporter = self.reporter.clone();
        let active = self.active.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if active.load(Ordering::SeqCst) {
                run_guarded(&reporter, id, callback).await;
            }
        });
        TimerHandle { id, task }
    }

    /// Run `callback` every `period`, first after one period.
    pub fn set_interval<F, Fut>(&self, period: Duration, callback: F) -> TimerHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let reporter = self.reporter.clone();
        let active = self.active.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                if !active.load(Ordering::SeqCst) {
                    debug!(plugin_id = %reporter.plugin_id(), timer = %id, "interval stopped for removed plugin");
                    break;
                }
                run_guarded(&reporter, id, &callback).await;
            }
        });
        TimerHandle { id, task }
    }

    /// Stop firing callbacks. Callbacks already running complete.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Whether callbacks still fire.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

async fn run_guarded<F, Fut>(reporter: &FaultReporter, id: Uuid, callback: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let outcome = AssertUnwindSafe(async move { callback().await })
        .catch_unwind()
        .await;
    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };
    warn!(plugin_id = %reporter.plugin_id(), timer = %id, error = %message, "timer callback failed");
    reporter.report(FaultKind::Timer, &message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use crate::messaging::{events, EventBus};
    use std::sync::atomic::AtomicUsize;

    fn timers(bus: &Arc<EventBus>) -> PluginTimers {
        PluginTimers::new(FaultReporter::new("ticker", bus.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fault_is_reported_not_raised() {
        let bus = Arc::new(EventBus::default());
        let faults = Arc::new(AtomicUsize::new(0));
        let f = faults.clone();
        bus.on(events::PLUGIN_FAULT, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let t = timers(&bus);
        let failing = t.set_timeout(Duration::from_millis(10), || async {
            Err(Error::Internal("tick failed".to_string()))
        });
        let panicking = t.set_timeout(Duration::from_millis(20), || async {
            let missing: Option<()> = None;
            missing.expect("tick panicked");
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(failing.is_finished());
        assert!(panicking.is_finished());
        assert_eq!(faults.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_stops_after_deactivate() {
        let bus = Arc::new(EventBus::default());
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = timers(&bus);
        let counter = ticks.clone();
        let handle = t.set_interval(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(35)).await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected at least 3 ticks, saw {seen}");

        t.deactivate();
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let bus = Arc::new(EventBus::default());
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let handle = timers(&bus).set_timeout(Duration::from_millis(10), move || async move {
            f.store(true, Ordering::SeqCst);
            Ok(())
        });
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
