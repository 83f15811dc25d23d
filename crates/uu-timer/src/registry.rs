use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use crate::timer::NamedTimer;

type TimerMap = HashMap<String, NamedTimer>;

/// Map from timer id to the single active timer for that id.
///
/// One lock guards the map and is held only for the map operation itself,
/// never while a timer callback runs. Clones share the same map.
#[derive(Debug, Default, Clone)]
pub struct TimerRegistry {
    timers: Arc<Mutex<TimerMap>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, TimerMap> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `timer` under its id, returning whatever it displaced.
    pub fn add(&self, timer: NamedTimer) -> Option<NamedTimer> {
        self.map().insert(timer.id().to_string(), timer)
    }

    /// Unregister `timer` if it is still the one registered under its id.
    /// Returns `true` when an entry was removed.
    pub fn remove(&self, timer: &NamedTimer) -> bool {
        let mut map = self.map();
        match map.get(timer.id()) {
            Some(current) if current.ptr_eq(timer) => {
                map.remove(timer.id());
                true
            }
            _ => false,
        }
    }

    pub fn find(&self, timer_id: &str) -> Option<NamedTimer> {
        self.map().get(timer_id).cloned()
    }

    /// Snapshot of the active timers, ordered by id.
    pub fn list_all(&self) -> Vec<NamedTimer> {
        let mut timers: Vec<NamedTimer> = self.map().values().cloned().collect();
        timers.sort_by(|a, b| a.id().cmp(b.id()));
        timers
    }

    /// Cancel the active timer for `timer_id`, if any.
    pub fn cancel_active(&self, timer_id: &str) {
        // Looked up first so the lock is released before cancel() re-enters.
        if let Some(timer) = self.find(timer_id) {
            timer.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.timers))
    }
}

/// Non-owning registry handle held by timers, so registered timers do not
/// keep their own registry alive.
#[derive(Debug, Clone)]
pub(crate) struct WeakRegistry(Weak<Mutex<TimerMap>>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<TimerRegistry> {
        self.0.upgrade().map(|timers| TimerRegistry { timers })
    }
}
