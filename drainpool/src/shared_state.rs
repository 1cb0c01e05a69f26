// SPDX-License-Identifier: MIT

//! Singleton-with-shared-state.
//!
//! Every owner type gets one state object per process. The state is created
//! and initialized exactly once, under a lock scoped to that owner type, no
//! matter how many threads race to construct it. A failing initializer leaves
//! the state uninitialized so that a later attempt can retry.
//!
//! Two flavours are offered:
//! - [`SharedCell`], an explicit cell that can be owned by a service object
//!   and handed to workers by reference.
//! - [`acquire`] / [`lookup`], a process-wide registry keyed by the owner's
//!   [`TypeId`], for the few things that really are global (the log sink).
//!
//! An initializer must not call [`acquire`] for its own type. It may acquire
//! other types; the registry lock is never held while an initializer runs.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::debug;

use crate::error::{PoolError, Result};

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A slot that is initialized at most once, under mutual exclusion.
#[derive(Debug)]
pub struct SharedCell<T> {
    slot: Mutex<Option<Arc<T>>>,
    initialized: AtomicBool,
}

impl<T> Default for SharedCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedCell<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        if !self.is_initialized() {
            return None;
        }
        lock(&self.slot).clone()
    }

    /// Returns the shared state, running `init` first if nobody has
    /// successfully done so yet.
    ///
    /// The lock is released on every exit path, including an `init` that
    /// returns an error or panics. Side effects of a failed `init` are not
    /// rolled back, so initializers should be idempotent.
    pub fn get_or_try_init<F>(&self, init: F) -> anyhow::Result<Arc<T>>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        let mut slot = lock(&self.slot);
        if let Some(state) = slot.as_ref() {
            return Ok(state.clone());
        }

        let state = Arc::new(init()?);
        *slot = Some(state.clone());
        self.initialized.store(true, Ordering::Release);
        Ok(state)
    }
}

type AnyCell = Arc<dyn Any + Send + Sync>;

static REGISTRY: OnceLock<Mutex<HashMap<TypeId, AnyCell>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<TypeId, AnyCell>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

// No logging while the registry lock is held: the queue logger looks up its
// sink through this registry.
fn cell_for<T: Send + Sync + 'static>() -> Arc<SharedCell<T>> {
    let cell = lock(registry())
        .entry(TypeId::of::<T>())
        .or_insert_with(|| Arc::new(SharedCell::<T>::new()) as AnyCell)
        .clone();
    cell.downcast::<SharedCell<T>>()
        .unwrap_or_else(|_| unreachable!("registry entries are keyed by their own type"))
}

/// Returns the process-wide state of owner type `T`, initializing it with
/// `init` if this is the first successful acquisition.
pub fn acquire<T, F>(init: F) -> Result<Arc<T>>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> anyhow::Result<T>,
{
    cell_for::<T>()
        .get_or_try_init(|| {
            debug!("Initializing shared state for {}", type_name::<T>());
            init()
        })
        .map_err(|source| PoolError::InitializationFailed {
            owner: type_name::<T>(),
            source,
        })
}

/// Returns the process-wide state of `T` if it has been initialized.
pub fn lookup<T: Send + Sync + 'static>() -> Option<Arc<T>> {
    let cell = lock(REGISTRY.get()?).get(&TypeId::of::<T>())?.clone();
    cell.downcast::<SharedCell<T>>().ok()?.get()
}

pub fn is_initialized<T: Send + Sync + 'static>() -> bool {
    lookup::<T>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn cell_initializes_once_under_contention() {
        let cell = Arc::new(SharedCell::<usize>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    *cell
                        .get_or_try_init(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(42)
                        })
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cell.is_initialized());
    }

    #[test]
    fn failed_init_can_be_retried() {
        let cell = SharedCell::<String>::new();

        let err = cell
            .get_or_try_init(|| Err(anyhow::anyhow!("not yet")))
            .unwrap_err();
        assert_eq!(err.to_string(), "not yet");
        assert!(!cell.is_initialized());
        assert!(cell.get().is_none());

        let value = cell.get_or_try_init(|| Ok("ready".to_string())).unwrap();
        assert_eq!(value.as_str(), "ready");
    }

    #[test]
    fn panicking_init_does_not_deadlock() {
        let cell = Arc::new(SharedCell::<u8>::new());

        let c = cell.clone();
        let outcome = thread::spawn(move || {
            let _ = c.get_or_try_init(|| panic!("initializer blew up"));
        })
        .join();
        assert!(outcome.is_err());
        assert!(!cell.is_initialized());

        assert_eq!(*cell.get_or_try_init(|| Ok(7)).unwrap(), 7);
    }

    struct Owner {
        id: usize,
    }

    #[test]
    fn acquire_is_idempotent_per_owner_type() {
        let calls = AtomicUsize::new(0);
        let init = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Owner { id: 1 })
        };

        let first = acquire::<Owner, _>(init).unwrap();
        let second = acquire::<Owner, _>(|| Ok(Owner { id: 2 })).unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(is_initialized::<Owner>());
    }

    #[derive(Debug)]
    struct Flaky;

    #[test]
    fn acquire_reports_failed_initializer() {
        let err = acquire::<Flaky, _>(|| Err(anyhow::anyhow!("disk on fire"))).unwrap_err();
        assert!(matches!(err, PoolError::InitializationFailed { .. }));
        assert!(lookup::<Flaky>().is_none());

        assert!(acquire::<Flaky, _>(|| Ok(Flaky)).is_ok());
        assert!(lookup::<Flaky>().is_some());
    }

    struct Unused;

    #[test]
    fn lookup_of_unknown_owner_is_none() {
        assert!(lookup::<Unused>().is_none());
    }
}
