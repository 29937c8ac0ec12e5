use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LockStatus {
    pub held: bool,
    pub holder: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// A mutex that records who holds it, for diagnosing stuck schedulers.
///
/// Guards are not `Send`, so a guard can never be held across an await in a
/// spawned task.
pub struct ScheduleLock<T> {
    inner: Mutex<T>,
    holder: Mutex<Option<(&'static str, DateTime<Utc>)>>,
}

pub struct ScheduleGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    holder: &'a Mutex<Option<(&'static str, DateTime<Utc>)>>,
}

impl<T> ScheduleLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            holder: Mutex::new(None),
        }
    }

    pub fn lock(&self, label: &'static str) -> ScheduleGuard<'_, T> {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *self.lock_holder() = Some((label, Utc::now()));
        ScheduleGuard {
            guard,
            holder: &self.holder,
        }
    }

    fn lock_holder(&self) -> MutexGuard<'_, Option<(&'static str, DateTime<Utc>)>> {
        self.holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> LockStatus {
        match *self.lock_holder() {
            Some((label, since)) => LockStatus {
                held: true,
                holder: Some(label.to_string()),
                since: Some(since),
            },
            None => LockStatus::default(),
        }
    }
}

impl<T> Deref for ScheduleGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ScheduleGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ScheduleGuard<'_, T> {
    fn drop(&mut self) {
        *self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}
