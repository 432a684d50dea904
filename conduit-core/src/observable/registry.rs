//! Subscription Registry
//!
//! The set of subscriptions a pipe fans out to.
//!
//! # Locking
//!
//! One mutex guards the whole collection. It is held for structural changes
//! and for a fan-out pass, and never while a subscriber callback runs: a pass
//! only pushes values into per-subscription queues.
//!
//! Lock order: a publish already holds the pipe's closed flag for reading
//! when it takes the registry lock. When a caller needs the value cell as
//! well (subscribing with send-on-subscribe), the registry lock is taken
//! first and the value cell second. Nothing acquires them the other way round.
//!
//! # Pruning
//!
//! Entries are removed eagerly by [`SubscriptionRegistry::remove`] and lazily
//! by [`SubscriptionRegistry::add`] and [`SubscriptionRegistry::for_each`],
//! which both drop every entry they find inactive. A subscription terminated
//! from its own handle is therefore gone after the next subscribe or fan-out,
//! so the registry never holds more dead entries than it did live ones.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::subscription::{SubscriptionId, SubscriptionState};

struct RegistryState<T>
where
    T: Clone + Send + Sync + 'static,
{
    entries: IndexMap<SubscriptionId, Arc<SubscriptionState<T>>>,
    /// Set once the owning pipe closes. A sealed registry accepts nothing.
    sealed: bool,
}

/// Concurrency-safe collection of subscriptions, keyed by ID.
pub(crate) struct SubscriptionRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Mutex<RegistryState<T>>,
}

impl<T> SubscriptionRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryState {
                entries: IndexMap::new(),
                sealed: false,
            }),
        }
    }

    /// Register a subscription.
    ///
    /// Inactive entries are pruned first. `on_insert` runs under the registry
    /// lock just before insertion, so no fan-out pass can interleave between
    /// it and the insert. Returns `false` (without running `on_insert`) if the
    /// registry is sealed.
    pub(crate) fn add<F>(&self, subscription: Arc<SubscriptionState<T>>, on_insert: F) -> bool
    where
        F: FnOnce(&SubscriptionState<T>),
    {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }

        inner.entries.retain(|_, existing| existing.is_active());
        on_insert(&subscription);
        inner.entries.insert(subscription.id(), subscription);
        true
    }

    /// Remove a subscription by ID. No-op if absent.
    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<Arc<SubscriptionState<T>>> {
        self.inner.lock().entries.swap_remove(&id)
    }

    /// Visit every active subscription, pruning inactive ones.
    ///
    /// Returns the number of entries pruned during this pass.
    pub(crate) fn for_each<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&SubscriptionState<T>),
    {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();

        inner.entries.retain(|_, subscription| {
            if !subscription.is_active() {
                return false;
            }
            f(&**subscription);
            true
        });

        before - inner.entries.len()
    }

    /// Seal the registry and terminate every entry.
    ///
    /// Termination happens under the lock, so once this returns no fan-out
    /// pass can reach any of the drained subscriptions. Returns how many
    /// entries were drained; a second call drains nothing.
    pub(crate) fn seal(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.sealed = true;

        let drained = inner.entries.len();
        for (_, subscription) in inner.entries.drain(..) {
            subscription.terminate();
        }
        drained
    }

    /// Number of entries currently held, including any not yet pruned.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
