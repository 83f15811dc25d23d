use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, error};
use uu_core::timer::{TaskId, TimerWorker};

use crate::registry::WeakRegistry;

/// Opaque caller context handed back to the callback on every fire.
pub type UserInfo = Arc<dyn Any + Send + Sync>;

/// Invoked on the worker thread each time the timer fires.
pub type TimerCallback = Arc<dyn Fn(&NamedTimer, Option<&UserInfo>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Constructed, not started.
    Idle,
    /// Registered, with one pending task on the worker.
    Scheduled,
    /// Unregistered; the callback has been dropped and will never run again.
    Cancelled,
}

/// A cancelable, optionally repeating delayed callback identified by a string id.
///
/// Cheap to clone; clones are handles to the same timer. `cancel` may be
/// called from any thread, including from inside the callback, and only
/// prevents future fires.
#[derive(Clone)]
pub struct NamedTimer {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    interval: Duration,
    repeat: bool,
    user_info: Option<UserInfo>,
    worker: Arc<dyn TimerWorker>,
    registry: WeakRegistry,
    schedule: Mutex<Schedule>,
}

struct Schedule {
    state: TimerState,
    /// Bumped on every schedule so tasks from an earlier round are inert.
    round: u64,
    pending: Option<TaskId>,
    last_fire_time: Option<DateTime<Utc>>,
    callback: Option<TimerCallback>,
}

impl NamedTimer {
    pub(crate) fn new(
        id: String,
        interval: Duration,
        repeat: bool,
        user_info: Option<UserInfo>,
        callback: TimerCallback,
        worker: Arc<dyn TimerWorker>,
        registry: WeakRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                interval,
                repeat,
                user_info,
                worker,
                registry,
                schedule: Mutex::new(Schedule {
                    state: TimerState::Idle,
                    round: 0,
                    pending: None,
                    last_fire_time: None,
                    callback: Some(callback),
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn repeat(&self) -> bool {
        self.inner.repeat
    }

    pub fn user_info(&self) -> Option<&UserInfo> {
        self.inner.user_info.as_ref()
    }

    pub fn state(&self) -> TimerState {
        self.lock().state
    }

    /// When the timer last entered `Scheduled`.
    pub fn last_fire_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_fire_time
    }

    /// Whether both handles refer to the same timer.
    pub fn ptr_eq(&self, other: &NamedTimer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, Schedule> {
        self.inner
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register and schedule the first fire. Only an `Idle` timer starts;
    /// any other timer registered under the same id is cancelled.
    pub fn start(&self) {
        {
            let mut schedule = self.lock();
            if schedule.state != TimerState::Idle {
                debug!(timer_id = %self.id(), state = ?schedule.state, "start ignored");
                return;
            }
            schedule.state = TimerState::Scheduled;
        }

        let registry = self.inner.registry.upgrade();
        if let Some(registry) = &registry {
            if let Some(previous) = registry.add(self.clone()) {
                if !previous.ptr_eq(self) {
                    previous.cancel();
                }
            }
        }

        let mut schedule = self.lock();
        if schedule.state == TimerState::Scheduled {
            self.schedule_next(&mut schedule);
            debug!(timer_id = %self.id(), interval = ?self.interval(), repeat = self.repeat(), "timer started");
        } else if let Some(registry) = registry {
            // Cancelled while registering.
            drop(schedule);
            registry.remove(self);
        }
    }

    /// Stop all future fires, unregister, and drop the callback. Idempotent.
    pub fn cancel(&self) {
        let pending = {
            let mut schedule = self.lock();
            if schedule.state == TimerState::Cancelled {
                return;
            }
            schedule.state = TimerState::Cancelled;
            schedule.callback = None;
            schedule.pending.take()
        };

        if let Some(task) = pending {
            self.inner.worker.remove(task);
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(self);
        }
        debug!(timer_id = %self.id(), "timer cancelled");
    }

    fn schedule_next(&self, schedule: &mut Schedule) {
        schedule.round += 1;
        schedule.last_fire_time = Some(Utc::now());

        let timer = self.clone();
        let round = schedule.round;
        schedule.pending = Some(
            self.inner
                .worker
                .post_delayed(self.inner.interval, Box::new(move || timer.fire(round))),
        );
    }

    fn fire(&self, round: u64) {
        let callback = {
            let mut schedule = self.lock();
            if schedule.state != TimerState::Scheduled || schedule.round != round {
                return;
            }
            schedule.pending = None;
            match schedule.callback.clone() {
                Some(callback) => callback,
                None => return,
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            callback(self, self.inner.user_info.as_ref())
        }));
        if let Err(payload) = outcome {
            error!(
                timer_id = %self.id(),
                panic = panic_message(payload.as_ref()),
                "timer callback panicked"
            );
        }

        if self.inner.repeat {
            let mut schedule = self.lock();
            if schedule.state == TimerState::Scheduled && schedule.round == round {
                self.schedule_next(&mut schedule);
            }
        } else {
            self.cancel();
        }
    }
}

impl fmt::Debug for NamedTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedTimer")
            .field("id", &self.inner.id)
            .field("interval", &self.inner.interval)
            .field("repeat", &self.inner.repeat)
            .field("state", &self.state())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
