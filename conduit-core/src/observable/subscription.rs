//! Subscription handles.
//!
//! A [`Subscription`] represents one consumer registered on a pipe. It owns
//! the consumer's callback and the queue that feeds the consumer's delivery
//! task. The receiving half of the queue waits in the subscription until a
//! delivery task claims it, so a spawn the runtime refused can be retried
//! elsewhere.
//!
//! # Lifecycle
//!
//! A subscription starts active and is terminated exactly once, either by
//! [`Subscription::unsubscribe`], by [`Pipe::unsubscribe`](super::Pipe::unsubscribe)
//! or when the owning pipe closes. Termination flips the atomic `active` flag
//! with a compare-and-swap and then releases the callback, both ends of the
//! queue and the back-reference to the pipe. The flag is the single source of truth:
//! it is re-checked immediately before every invocation, so no call starts
//! after termination, while a call that is already running may complete.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::error::CallbackFailure;
use super::pipe::PipeShared;

/// Callback receiving published values.
pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Unique identifier for a subscription.
///
/// Only equality is meaningful. IDs come from a process-wide atomic counter,
/// so they are unique across pipes and threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.raw())
    }
}

/// Shared state behind a subscription.
///
/// Held by the caller's [`Subscription`], by the pipe's registry and by the
/// subscription's delivery task.
pub(crate) struct SubscriptionState<T>
where
    T: Clone + Send + Sync + 'static,
{
    id: SubscriptionId,
    active: AtomicBool,
    callback: Mutex<Option<Callback<T>>>,
    /// Sender feeding the delivery task. Dropping it ends the task.
    queue: Mutex<Option<mpsc::UnboundedSender<T>>>,
    /// Receiver waiting for a delivery task to claim it.
    inbox: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
    /// Non-owning link to the pipe, read only to find the failure handler.
    owner: Mutex<Option<Weak<PipeShared<T>>>>,
}

impl<T> SubscriptionState<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an active subscription with an empty queue.
    pub(crate) fn new(callback: Callback<T>, owner: Weak<PipeShared<T>>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: SubscriptionId::new(),
            active: AtomicBool::new(true),
            callback: Mutex::new(Some(callback)),
            queue: Mutex::new(Some(tx)),
            inbox: Mutex::new(Some(rx)),
            owner: Mutex::new(Some(owner)),
        })
    }

    /// Create a subscription that was never active.
    pub(crate) fn terminated() -> Arc<Self> {
        Arc::new(Self {
            id: SubscriptionId::new(),
            active: AtomicBool::new(false),
            callback: Mutex::new(None),
            queue: Mutex::new(None),
            inbox: Mutex::new(None),
            owner: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether this subscription was created by the given pipe.
    pub(crate) fn belongs_to(&self, pipe: &Weak<PipeShared<T>>) -> bool {
        self.owner
            .lock()
            .as_ref()
            .is_some_and(|owner| owner.ptr_eq(pipe))
    }

    /// Hand the queue's receiver to a delivery task. Only the first caller
    /// gets it.
    pub(crate) fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<T>> {
        self.inbox.lock().take()
    }

    /// Whether no delivery task has claimed the queue yet.
    pub(crate) fn inbox_unclaimed(&self) -> bool {
        self.inbox.lock().is_some()
    }

    /// Queue a value for delivery. Returns `false` if the subscription is no
    /// longer accepting values.
    pub(crate) fn enqueue(&self, value: T) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.queue.lock().as_ref() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Invoke the callback with a value, isolating any panic.
    ///
    /// Returns `true` only if the callback ran and returned normally.
    pub(crate) fn invoke(&self, value: T) -> bool {
        let callback = match self.callback.lock().clone() {
            Some(callback) => callback,
            None => return false,
        };
        if !self.is_active() {
            return false;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
            Ok(()) => true,
            Err(payload) => {
                self.report(CallbackFailure::from_panic(self.id, payload));
                false
            }
        }
    }

    /// Forward a failure to the owning pipe's failure handler, if any.
    fn report(&self, failure: CallbackFailure) {
        let owner = self.owner.lock().as_ref().and_then(Weak::upgrade);
        match owner.as_ref().and_then(|pipe| pipe.failure_handler()) {
            Some(handler) => handler(failure),
            None => tracing::debug!(
                subscription = %self.id,
                error = %failure,
                "subscriber callback panicked, no failure handler configured"
            ),
        }
    }

    /// Deactivate the subscription and release everything it holds.
    ///
    /// Returns `true` if this call performed the transition.
    pub(crate) fn terminate(&self) -> bool {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.callback.lock().take();
        self.queue.lock().take();
        self.inbox.lock().take();
        self.owner.lock().take();
        true
    }
}

/// Terminates the subscription if its delivery task stops before the queue
/// is closed, so a subscription never looks active without a task behind it.
struct DeliveryGuard<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    state: &'a SubscriptionState<T>,
    drained: bool,
}

impl<T> Drop for DeliveryGuard<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.drained && self.state.terminate() {
            tracing::warn!(
                subscription = %self.state.id(),
                "delivery runtime shut down, subscription terminated"
            );
        }
    }
}

/// Drain a subscription's queue, invoking its callback once per value.
///
/// Each invocation runs on the blocking pool and is awaited before the next
/// value is taken, which keeps the subscriber's stream in publish order while
/// a slow callback only ever stalls its own queue.
pub(crate) async fn deliver<T>(state: Arc<SubscriptionState<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    let Some(mut rx) = state.take_inbox() else {
        return;
    };
    let mut guard = DeliveryGuard {
        state: &*state,
        drained: false,
    };

    while let Some(value) = rx.recv().await {
        if !state.is_active() {
            break;
        }

        let target = Arc::clone(&state);
        if tokio::task::spawn_blocking(move || target.invoke(value))
            .await
            .is_err()
        {
            // The runtime is shutting down; the guard terminates us.
            return;
        }
    }

    guard.drained = true;
    tracing::trace!(subscription = %state.id(), "delivery task finished");
}

/// A consumer's registration on a pipe.
///
/// Cloning yields another handle to the same registration. Dropping every
/// handle does not unsubscribe; call [`Subscription::unsubscribe`] or
/// [`Pipe::unsubscribe`](super::Pipe::unsubscribe) to stop deliveries.
pub struct Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    state: Arc<SubscriptionState<T>>,
}

impl<T> Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_state(state: Arc<SubscriptionState<T>>) -> Self {
        Self { state }
    }

    pub(crate) fn state(&self) -> &Arc<SubscriptionState<T>> {
        &self.state
    }

    /// Get the subscription's unique ID.
    pub fn id(&self) -> SubscriptionId {
        self.state.id()
    }

    /// Whether the subscription still receives values.
    ///
    /// A subscription rejected at creation (closed pipe or missing callback)
    /// reports `false` from the start.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Stop receiving values.
    ///
    /// Idempotent. The pipe drops its entry on its next fan-out pass; use
    /// [`Pipe::unsubscribe`](super::Pipe::unsubscribe) to remove it eagerly.
    pub fn unsubscribe(&self) {
        if self.state.terminate() {
            tracing::debug!(subscription = %self.state.id(), "unsubscribed");
        }
    }
}

impl<T> Clone for Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .finish()
    }
}
