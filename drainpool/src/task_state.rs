// SPDX-License-Identifier: MIT

//! Per-key lifecycle tracking for work handed to a pool.
//!
//! A key moves `Requested -> InProgress -> Done | Failed` and never goes back.
//! Only removing a terminal entry (`discard`) or re-requesting it makes the key
//! usable again. Waiters block on a condition variable that is signalled on
//! every transition; nobody polls.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::trace;

use crate::error::{PoolError, Result};
use crate::shared_state::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState<V> {
    Requested,
    InProgress,
    Done(V),
    Failed(String),
}

impl<V> TaskState<V> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done(_) | TaskState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Requested => "requested",
            TaskState::InProgress => "in-progress",
            TaskState::Done(_) => "done",
            TaskState::Failed(_) => "failed",
        }
    }
}

/// Answer to [`TaskStateTracker::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The key is now `Requested` and the caller owns the next transition.
    Admitted,
    /// The key is requested or in progress already.
    Active,
    /// The key is done and the request did not force a resubmission.
    AlreadyDone,
}

pub struct TaskStateTracker<K, V> {
    entries: Mutex<HashMap<K, TaskState<V>>>,
    changed: Condvar,
}

impl<K, V> Default for TaskStateTracker<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
        }
    }
}

impl<K, V> std::fmt::Debug for TaskStateTracker<K, V>
where
    K: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = lock(&self.entries);
        let states: Vec<(&K, &'static str)> =
            entries.iter().map(|(key, state)| (key, state.name())).collect();
        f.debug_struct("TaskStateTracker")
            .field("entries", &states)
            .finish()
    }
}

impl<K, V> TaskStateTracker<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` as `Requested`.
    ///
    /// Absent keys are always admitted and so are failed ones. A done key is
    /// only replaced when `force` is set. Requested and in-progress keys are
    /// never touched.
    pub fn request(&self, key: K, force: bool) -> Admission {
        let mut entries = lock(&self.entries);
        let admission = match entries.get(&key) {
            None | Some(TaskState::Failed(_)) => Admission::Admitted,
            Some(TaskState::Done(_)) if force => Admission::Admitted,
            Some(TaskState::Done(_)) => Admission::AlreadyDone,
            Some(TaskState::Requested) | Some(TaskState::InProgress) => Admission::Active,
        };
        if admission == Admission::Admitted {
            trace!("{key:?}: requested");
            entries.insert(key, TaskState::Requested);
            self.changed.notify_all();
        }
        admission
    }

    /// Drops a `Requested` entry whose work never got queued.
    pub fn withdraw(&self, key: &K) -> bool {
        let mut entries = lock(&self.entries);
        if !matches!(entries.get(key), Some(TaskState::Requested)) {
            return false;
        }
        entries.remove(key);
        self.changed.notify_all();
        true
    }

    /// `Requested -> InProgress`.
    pub fn start(&self, key: &K) -> Result<()> {
        let mut entries = lock(&self.entries);
        match entries.get_mut(key) {
            Some(state @ TaskState::Requested) => {
                *state = TaskState::InProgress;
                trace!("{key:?}: in progress");
                self.changed.notify_all();
                Ok(())
            }
            other => Err(invalid_transition(key, other.map(|s| s.name()), "in-progress")),
        }
    }

    /// `InProgress -> Done | Failed`.
    pub fn finish(&self, key: &K, outcome: std::result::Result<V, String>) -> Result<()> {
        let mut entries = lock(&self.entries);
        let next = match outcome {
            Ok(value) => TaskState::Done(value),
            Err(err) => TaskState::Failed(err),
        };
        match entries.get_mut(key) {
            Some(state @ TaskState::InProgress) => {
                trace!("{key:?}: {}", next.name());
                *state = next;
                self.changed.notify_all();
                Ok(())
            }
            other => Err(invalid_transition(key, other.map(|s| s.name()), next.name())),
        }
    }

    /// `None` means unknown.
    pub fn get_state(&self, key: &K) -> Option<TaskState<V>> {
        lock(&self.entries).get(key).cloned()
    }

    /// Blocks until `key` is terminal and returns that state.
    ///
    /// Returns `None` if the key is unknown, disappears while waiting, or the
    /// timeout passes first. `None` as timeout waits forever.
    pub fn wait_until_terminal(&self, key: &K, timeout: Option<Duration>) -> Option<TaskState<V>> {
        let entries = self.wait_for(key, timeout)?;
        entries.get(key).cloned()
    }

    fn wait_for(
        &self,
        key: &K,
        timeout: Option<Duration>,
    ) -> Option<MutexGuard<'_, HashMap<K, TaskState<V>>>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut entries = lock(&self.entries);
        loop {
            let terminal = match entries.get(key) {
                None => return None,
                Some(state) => state.is_terminal(),
            };
            if terminal {
                return Some(entries);
            }
            entries = match deadline {
                None => self
                    .changed
                    .wait(entries)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.changed
                        .wait_timeout(entries, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Returns the value of a done key.
    ///
    /// With `block` the call first waits for the key to become terminal. With
    /// `discard_on_fetch` a done entry is removed, so the key can be requested
    /// again. Failed and active keys yield `None` and stay where they are.
    pub fn fetch_result(&self, key: &K, block: bool, discard_on_fetch: bool) -> Option<V> {
        let mut entries = if block {
            self.wait_for(key, None)?
        } else {
            lock(&self.entries)
        };

        if !matches!(entries.get(key), Some(TaskState::Done(_))) {
            return None;
        }
        if !discard_on_fetch {
            return match entries.get(key) {
                Some(TaskState::Done(value)) => Some(value.clone()),
                _ => None,
            };
        }
        let removed = entries.remove(key);
        self.changed.notify_all();
        match removed {
            Some(TaskState::Done(value)) => Some(value),
            _ => None,
        }
    }

    /// Removes a terminal entry. Active entries are left alone.
    pub fn discard(&self, key: &K) -> Option<TaskState<V>> {
        let mut entries = lock(&self.entries);
        if !entries.get(key)?.is_terminal() {
            return None;
        }
        let removed = entries.remove(key);
        self.changed.notify_all();
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

fn invalid_transition<K: std::fmt::Debug>(
    key: &K,
    from: Option<&'static str>,
    to: &'static str,
) -> PoolError {
    PoolError::InvalidTransition {
        key: format!("{key:?}"),
        from: from.unwrap_or("unknown"),
        to,
    }
}
