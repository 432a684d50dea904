//! Observable Values
//!
//! This module implements the pipe: a single-slot observable value that
//! multicasts every published value to its subscribers.
//!
//! # Concepts
//!
//! ## Pipes
//!
//! A Pipe caches the most recent value (and only that value; it is not a
//! log). Producers publish into it, consumers subscribe to it. Every value
//! published after a consumer subscribes reaches that consumer's callback,
//! in publish order.
//!
//! ## Subscriptions
//!
//! A Subscription is the handle a consumer gets back from `subscribe`. It can
//! be checked with `is_active` and terminated from either side: by the
//! handle itself or by the pipe. Termination is one-way.
//!
//! ## Delivery
//!
//! Callbacks are arbitrary user code, so they never run on the publisher's
//! thread. Each subscription has its own queue and delivery task on a Tokio
//! runtime; a slow or blocked callback only delays its own queue. A panic in
//! a callback is caught and handed to the pipe's failure handler.
//!
//! # Implementation Notes
//!
//! The value cell and the registry have separate locks, and a pipe's closed
//! flag sits behind a third. When more than one is needed, the closed flag is
//! taken first, then the registry, then the value cell. The
//! registry lock is only ever held to mutate or walk the collection.

mod cell;
mod config;
mod dispatch;
mod error;
mod pipe;
mod registry;
mod subscription;

pub use config::PipeConfig;
pub use error::{CallbackFailure, FailureHandler, PipeError};
pub use pipe::Pipe;
pub use subscription::{Callback, Subscription, SubscriptionId};

/// Types that accept subscribers.
pub trait Subscribable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Register a callback. A missing callback yields an inactive subscription.
    fn subscribe_with(&self, callback: Option<Callback<T>>) -> Subscription<T>;

    /// Stop delivering to a subscription.
    fn unsubscribe(&self, subscription: &Subscription<T>);
}

/// Types that accept published values.
pub trait Publishable<T> {
    /// Publish a value to every subscriber.
    fn publish(&self, value: T);
}

/// A publishable, subscribable value holder.
pub trait Observable<T>: Subscribable<T> + Publishable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The currently stored value, if one exists.
    fn value(&self) -> Option<T>;

    /// Unsubscribe everyone and stop accepting values.
    fn close(&self);
}
