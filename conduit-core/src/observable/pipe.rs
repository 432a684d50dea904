//! Pipe Implementation
//!
//! A Pipe holds the most recently published value and multicasts every new
//! value to its subscribers.
//!
//! # How Pipes Work
//!
//! 1. `publish` stores the value in the pipe's cell, then takes one pass over
//!    the registry and pushes a copy into each subscription's queue.
//!
//! 2. Each subscription's delivery task pops values in order and runs the
//!    callback on the blocking pool, inside an unwind boundary.
//!
//! 3. `subscribe` registers a new subscription and, when configured to, queues
//!    the current value for it in the same critical section as the insert.
//!
//! 4. `close` seals the registry and terminates every subscription. The pipe
//!    keeps its last value.
//!
//! # Closing
//!
//! The closed flag lives behind a reader/writer lock. Every publish holds it
//! for reading from the check to the end of its fan-out, and `close` takes it
//! for writing. Once `close` returns no publish is in flight and none can
//! start, so the stored value is final.
//!
//! # Ordering
//!
//! Values from one publisher reach each subscriber in publish order, because
//! every fan-out pass appends to the subscriber's FIFO queue under the
//! registry lock. Different subscribers progress independently.
//!
//! The send-on-subscribe value is queued while the registry lock is held, so a
//! concurrent publish lands either before it (the subscriber gets the new
//! value, possibly twice) or after it (old value first, then new). A new value
//! is never followed by a stale one.
//!
//! # Thread Safety
//!
//! Every operation may be called from any thread. Locks are held only for
//! bookkeeping, never while a callback runs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::cell::ValueCell;
use super::config::PipeConfig;
use super::dispatch::Dispatcher;
use super::error::{FailureHandler, PipeError};
use super::registry::SubscriptionRegistry;
use super::subscription::{Callback, Subscription, SubscriptionState};
use super::{Observable, Publishable, Subscribable};

/// Counter for generating unique pipe IDs.
static PIPE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique pipe ID.
fn next_pipe_id() -> u64 {
    PIPE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// State shared by every clone of a pipe.
pub(crate) struct PipeShared<T>
where
    T: Clone + Send + Sync + 'static,
{
    id: u64,
    send_on_subscribe: bool,
    on_callback_failure: Option<FailureHandler>,
    cell: ValueCell<T>,
    registry: SubscriptionRegistry<T>,
    /// Close gate; see the module docs.
    closed: RwLock<bool>,
    dispatcher: Dispatcher,
}

impl<T> PipeShared<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn failure_handler(&self) -> Option<&FailureHandler> {
        self.on_callback_failure.as_ref()
    }

    fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    fn close(&self) {
        {
            let mut closed = self.closed.write();
            if *closed {
                return;
            }
            *closed = true;
        }

        let terminated = self.registry.seal();
        tracing::debug!(pipe = self.id, terminated, "pipe closed");
    }
}

impl<T> Drop for PipeShared<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.close();
    }
}

/// A thread-safe observable value with multicast delivery.
///
/// # Type Parameters
///
/// - `T`: The published value type. Each subscriber receives its own clone.
///
/// # Example
///
/// ```rust,ignore
/// let pipe = Pipe::with_value(1);
///
/// let subscription = pipe.subscribe(|v| println!("got {v}"));
///
/// pipe.publish(2);  // Prints "got 2" from a delivery task
/// assert_eq!(pipe.value(), Some(2));
///
/// pipe.unsubscribe(&subscription);
/// pipe.close();
/// ```
pub struct Pipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    shared: Arc<PipeShared<T>>,
}

impl<T> Pipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a pipe from a configuration.
    ///
    /// # Panics
    ///
    /// Panics if no runtime is configured or ambient and the shared dispatch
    /// runtime cannot be started. Use [`Pipe::try_new`] to handle that case.
    pub fn new(config: PipeConfig<T>) -> Self {
        match Self::try_new(config) {
            Ok(pipe) => pipe,
            Err(err) => panic!("{err}"),
        }
    }

    /// Create a pipe from a configuration, reporting runtime start-up errors.
    pub fn try_new(config: PipeConfig<T>) -> Result<Self, PipeError> {
        let PipeConfig {
            initial_value,
            send_on_subscribe,
            on_callback_failure,
            runtime,
        } = config;

        let shared = PipeShared {
            id: next_pipe_id(),
            send_on_subscribe,
            on_callback_failure,
            cell: ValueCell::new(initial_value),
            registry: SubscriptionRegistry::new(),
            closed: RwLock::new(false),
            dispatcher: Dispatcher::resolve(runtime)?,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Create a pipe that already holds `value`.
    pub fn with_value(value: T) -> Self {
        Self::new(PipeConfig {
            initial_value: Some(value),
            ..PipeConfig::default()
        })
    }

    /// Get the pipe's unique ID.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Store a value and deliver it to every subscriber.
    ///
    /// Returns as soon as the value is queued; there is no completion signal.
    /// Does nothing once the pipe is closed, and a publish already past that
    /// check finishes before [`Pipe::close`] returns.
    pub fn publish(&self, value: T) {
        let shared = &self.shared;
        let closed = shared.closed.read();
        if *closed {
            return;
        }

        shared.cell.set(value.clone());

        let mut queued = 0usize;
        let pruned = shared.registry.for_each(|subscription| {
            if subscription.enqueue(value.clone()) {
                queued += 1;
            }
        });
        drop(closed);

        tracing::trace!(pipe = shared.id, queued, pruned, "published value");
    }

    /// Publish every value of an iterator, in order.
    pub fn publish_all<I>(&self, values: I)
    where
        I: IntoIterator<Item = T>,
    {
        for value in values {
            self.publish(value);
        }
    }

    /// Register a callback for every value published from now on.
    ///
    /// On a closed pipe the returned subscription is already inactive.
    pub fn subscribe<F>(&self, callback: F) -> Subscription<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);
        self.subscribe_with(Some(callback))
    }

    /// Register an optional callback.
    ///
    /// A missing callback, or a closed pipe, yields an inactive subscription
    /// rather than an error, so callers can always check
    /// [`Subscription::is_active`].
    pub fn subscribe_with(&self, callback: Option<Callback<T>>) -> Subscription<T> {
        let shared = &self.shared;
        let callback = match callback {
            Some(callback) if !shared.is_closed() => callback,
            _ => return Subscription::from_state(SubscriptionState::terminated()),
        };

        let state = SubscriptionState::new(callback, Arc::downgrade(shared));
        let send_current = shared.send_on_subscribe;

        let added = shared.registry.add(Arc::clone(&state), |subscription| {
            if send_current {
                if let Some(current) = shared.cell.get() {
                    subscription.enqueue(current);
                }
            }
        });

        if !added {
            // Lost a race with close.
            state.terminate();
            return Subscription::from_state(state);
        }

        if let Err(err) = shared.dispatcher.spawn_delivery(&state) {
            state.terminate();
            shared.registry.remove(state.id());
            tracing::warn!(
                pipe = shared.id,
                subscription = %state.id(),
                error = %err,
                "could not start delivery"
            );
            return Subscription::from_state(state);
        }
        tracing::debug!(pipe = shared.id, subscription = %state.id(), "subscribed");

        Subscription::from_state(state)
    }

    /// Terminate a subscription and remove it from this pipe.
    ///
    /// Does nothing once the pipe is closed, or for a subscription that
    /// belongs to another pipe.
    pub fn unsubscribe(&self, subscription: &Subscription<T>) {
        let shared = &self.shared;
        if shared.is_closed() {
            return;
        }

        let state = subscription.state();
        if state.belongs_to(&Arc::downgrade(shared)) {
            state.terminate();
        }

        if shared.registry.remove(state.id()).is_some() {
            tracing::debug!(pipe = shared.id, subscription = %state.id(), "unsubscribed");
        }
    }

    /// The current value, or `None` if nothing has been set.
    ///
    /// Keeps working after the pipe is closed.
    pub fn value(&self) -> Option<T> {
        self.shared.cell.get()
    }

    /// Terminate every subscription and stop accepting values.
    ///
    /// Idempotent. Waits for publishes already in progress, so the value seen
    /// after this returns is the one the pipe keeps. Callbacks already running
    /// are not waited for.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether the pipe has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of registry entries, including terminated ones not yet pruned.
    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.len()
    }
}

impl<T> Default for Pipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(PipeConfig::default())
    }
}

impl<T> Clone for Pipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Pipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.shared.id)
            .field("has_value", &self.shared.cell.is_set())
            .field("subscriber_count", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Subscribable<T> for Pipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn subscribe_with(&self, callback: Option<Callback<T>>) -> Subscription<T> {
        Pipe::subscribe_with(self, callback)
    }

    fn unsubscribe(&self, subscription: &Subscription<T>) {
        Pipe::unsubscribe(self, subscription);
    }
}

impl<T> Publishable<T> for Pipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn publish(&self, value: T) {
        Pipe::publish(self, value);
    }
}

impl<T> Observable<T> for Pipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn value(&self) -> Option<T> {
        Pipe::value(self)
    }

    fn close(&self) {
        Pipe::close(self);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::CallbackFailure;
    use std::sync::atomic::{AtomicBool, AtomicI32};
    use std::sync::mpsc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn recorder<T: Send + 'static>() -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
        mpsc::channel()
    }

    #[test]
    fn new_pipe_has_no_value() {
        let pipe: Pipe<i32> = Pipe::default();
        assert_eq!(pipe.value(), None);
        assert!(!pipe.is_closed());
    }

    #[test]
    fn initial_value_is_visible() {
        let pipe = Pipe::with_value(7);
        assert_eq!(pipe.value(), Some(7));
    }

    #[test]
    fn publish_updates_value() {
        let pipe = Pipe::default();
        pipe.publish(1);
        pipe.publish(2);
        assert_eq!(pipe.value(), Some(2));
    }

    #[test]
    fn publish_delivers_to_subscriber() {
        let pipe = Pipe::default();
        let (tx, rx) = recorder();
        let tx = parking_lot::Mutex::new(tx);

        let _subscription = pipe.subscribe(move |v: i32| {
            tx.lock().send(v).unwrap();
        });
        pipe.publish(42);

        assert_eq!(rx.recv_timeout(TIMEOUT), Ok(42));
    }

    #[test]
    fn subscribe_with_none_is_rejected() {
        let pipe: Pipe<i32> = Pipe::default();
        let subscription = pipe.subscribe_with(None);

        assert!(!subscription.is_active());
        assert_eq!(pipe.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_removes_eagerly() {
        let pipe: Pipe<i32> = Pipe::default();
        let subscription = pipe.subscribe(|_| {});
        assert_eq!(pipe.subscriber_count(), 1);

        pipe.unsubscribe(&subscription);
        assert!(!subscription.is_active());
        assert_eq!(pipe.subscriber_count(), 0);

        // Second call is a no-op.
        pipe.unsubscribe(&subscription);
        assert_eq!(pipe.subscriber_count(), 0);
    }

    #[test]
    fn handle_unsubscribe_is_pruned_on_publish() {
        let pipe: Pipe<i32> = Pipe::default();
        let subscription = pipe.subscribe(|_| {});

        subscription.unsubscribe();
        assert_eq!(pipe.subscriber_count(), 1);

        pipe.publish(1);
        assert_eq!(pipe.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_ignores_foreign_subscription() {
        let first: Pipe<i32> = Pipe::default();
        let second: Pipe<i32> = Pipe::default();
        let subscription = first.subscribe(|_| {});

        second.unsubscribe(&subscription);

        assert!(subscription.is_active());
        assert_eq!(first.subscriber_count(), 1);
    }

    #[test]
    fn close_terminates_subscriptions_and_keeps_value() {
        let pipe = Pipe::with_value(3);
        let a = pipe.subscribe(|_| {});
        let b = pipe.subscribe(|_| {});

        pipe.close();

        assert!(pipe.is_closed());
        assert!(!a.is_active());
        assert!(!b.is_active());
        assert_eq!(pipe.subscriber_count(), 0);
        assert_eq!(pipe.value(), Some(3));
    }

    #[test]
    fn operations_after_close_are_noops() {
        let pipe = Pipe::with_value(1);
        pipe.close();
        pipe.close();

        pipe.publish(2);
        assert_eq!(pipe.value(), Some(1));

        let subscription = pipe.subscribe(|_| {});
        assert!(!subscription.is_active());
        pipe.unsubscribe(&subscription);
        assert_eq!(pipe.subscriber_count(), 0);
    }

    /// Clones slowly and records that a clone has started.
    struct SlowClone {
        value: u32,
        cloning: Arc<AtomicBool>,
    }

    impl SlowClone {
        fn new(value: u32) -> Self {
            Self {
                value,
                cloning: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Clone for SlowClone {
        fn clone(&self) -> Self {
            self.cloning.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            Self {
                value: self.value,
                cloning: Arc::clone(&self.cloning),
            }
        }
    }

    #[test]
    fn close_waits_for_publish_in_progress() {
        let pipe = Pipe::with_value(SlowClone::new(1));
        let next = SlowClone::new(2);
        let cloning = Arc::clone(&next.cloning);

        let publisher = {
            let pipe = pipe.clone();
            std::thread::spawn(move || pipe.publish(next))
        };
        while !cloning.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        pipe.close();
        let frozen = pipe.value().map(|v| v.value);
        publisher.join().unwrap();

        assert_eq!(frozen, Some(2));
        assert_eq!(pipe.value().map(|v| v.value), frozen);
    }

    #[test]
    fn dropping_last_clone_closes() {
        let pipe: Pipe<i32> = Pipe::default();
        let clone = pipe.clone();
        let subscription = pipe.subscribe(|_| {});

        drop(pipe);
        assert!(subscription.is_active());
        assert!(!clone.is_closed());

        drop(clone);
        assert!(!subscription.is_active());
    }

    #[test]
    fn failure_handler_receives_panics() {
        let (tx, rx) = recorder();
        let tx = parking_lot::Mutex::new(tx);
        let handler: FailureHandler = Arc::new(move |failure: CallbackFailure| {
            tx.lock().send(failure.message().to_string()).unwrap();
        });

        let pipe = Pipe::new(PipeConfig {
            on_callback_failure: Some(handler),
            ..PipeConfig::default()
        });
        let subscription = pipe.subscribe(|v: i32| panic!("bad value {v}"));
        pipe.publish(9);

        assert_eq!(rx.recv_timeout(TIMEOUT).as_deref(), Ok("bad value 9"));
        assert!(subscription.is_active());
    }

    #[test]
    fn callback_count_matches_publishes() {
        let pipe = Pipe::default();
        let calls = Arc::new(AtomicI32::new(0));
        let (tx, rx) = recorder();
        let tx = parking_lot::Mutex::new(tx);

        let calls_clone = calls.clone();
        let _subscription = pipe.subscribe(move |v: i32| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            tx.lock().send(v).unwrap();
        });

        pipe.publish_all([1, 2, 3]);
        for expected in 1..=3 {
            assert_eq!(rx.recv_timeout(TIMEOUT), Ok(expected));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
