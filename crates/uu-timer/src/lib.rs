//! Named timers: cancelable, optionally repeating callbacks keyed by string id,
//! fired on a single serialized worker.

pub mod registry;
pub mod timer;
pub mod worker;

use std::{sync::Arc, time::Duration};

use tracing::instrument;
use uu_core::timer::TimerWorker;

pub use registry::TimerRegistry;
pub use timer::{NamedTimer, TimerCallback, TimerState, UserInfo};
pub use worker::TokioTimerWorker;

/// A timer worker plus the registry of timers scheduled on it.
///
/// Construct one per context; tests build their own around a
/// `ManualTimerWorker`, applications usually keep a single shared instance.
/// Dropping it cancels every timer still registered.
pub struct Timers {
    worker: Arc<dyn TimerWorker>,
    registry: TimerRegistry,
}

impl Timers {
    pub fn new(worker: Arc<dyn TimerWorker>) -> Self {
        Self {
            worker,
            registry: TimerRegistry::new(),
        }
    }

    pub fn registry(&self) -> &TimerRegistry {
        &self.registry
    }

    /// Build a timer in the `Idle` state without scheduling it.
    pub fn create_timer<F>(
        &self,
        timer_id: impl Into<String>,
        interval: Duration,
        repeat: bool,
        user_info: Option<UserInfo>,
        callback: F,
    ) -> NamedTimer
    where
        F: Fn(&NamedTimer, Option<&UserInfo>) + Send + Sync + 'static,
    {
        NamedTimer::new(
            timer_id.into(),
            interval,
            repeat,
            user_info,
            Arc::new(callback),
            Arc::clone(&self.worker),
            self.registry.downgrade(),
        )
    }

    /// Cancel any active timer with this id, then create and start a new one.
    /// The returned handle cancels it.
    #[instrument(skip(self, user_info, callback))]
    pub fn start_timer<F>(
        &self,
        timer_id: &str,
        interval: Duration,
        repeat: bool,
        user_info: Option<UserInfo>,
        callback: F,
    ) -> NamedTimer
    where
        F: Fn(&NamedTimer, Option<&UserInfo>) + Send + Sync + 'static,
    {
        self.cancel_active_timer(timer_id);
        let timer = self.create_timer(timer_id, interval, repeat, user_info, callback);
        timer.start();
        timer
    }

    pub fn find_active_timer(&self, timer_id: &str) -> Option<NamedTimer> {
        self.registry.find(timer_id)
    }

    pub fn list_active_timers(&self) -> Vec<NamedTimer> {
        self.registry.list_all()
    }

    pub fn cancel_active_timer(&self, timer_id: &str) {
        self.registry.cancel_active(timer_id);
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        // Pending tasks own their timer, which owns the worker.
        for timer in self.registry.list_all() {
            timer.cancel();
        }
    }
}
