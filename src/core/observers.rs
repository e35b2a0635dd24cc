//! Observer registry for status and offline-mode notifications.
//!
//! `subscribe` hands back a [`Subscription`]; the callback stays registered
//! until that handle is dropped or [`Subscription::unsubscribe`] is called.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

use crate::core::lock;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entries<E> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<E>)>,
}

pub struct Observers<E> {
    entries: Arc<Mutex<Entries<E>>>,
}

impl<E: 'static> Observers<E> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut entries = lock(&self.entries);
            let id = entries.next_id;
            entries.next_id += 1;
            entries.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Entries<E>>> = Arc::downgrade(&self.entries);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(entries) = weak.upgrade() {
                    lock(&entries).callbacks.retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    /// Invokes every callback with `event`. A panicking callback is logged
    /// and skipped; the remaining callbacks still run.
    pub fn notify(&self, event: &E) {
        // Snapshot so callbacks may subscribe or unsubscribe while running.
        let callbacks: Vec<Callback<E>> = lock(&self.entries)
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!("status subscriber panicked; continuing with remaining subscribers");
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer handle returned by `subscribe`.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keeps the callback registered for as long as the registry lives.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
