//! Conduit Core
//!
//! This crate provides a thread-safe, single-slot observable value: the
//! [`Pipe`](observable::Pipe). A pipe holds the most recently published value
//! and fans every new value out to its subscribers.
//!
//! It implements:
//!
//! - A cached current value, readable from any thread
//! - A subscription registry that tolerates concurrent subscribe and
//!   unsubscribe while values are being published
//! - Asynchronous, per-subscriber ordered delivery on a Tokio runtime
//! - Isolation of panicking subscriber callbacks
//! - Orderly teardown with `close`
//!
//! # Architecture
//!
//! Everything lives in the `observable` module:
//!
//! - `cell`: the value slot
//! - `subscription`: subscription handles and their delivery tasks
//! - `registry`: the set of subscriptions a pipe fans out to
//! - `dispatch`: runtime selection for delivery tasks
//! - `pipe`: the pipe that ties them together
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit_core::{Pipe, PipeConfig};
//!
//! let temperature = Pipe::new(PipeConfig {
//!     initial_value: Some(20.5),
//!     send_on_subscribe: true,
//!     ..PipeConfig::default()
//! });
//!
//! // Receives 20.5 right away, then every published value
//! let subscription = temperature.subscribe(|t| println!("now {t}"));
//!
//! temperature.publish(21.0);
//! assert_eq!(temperature.value(), Some(21.0));
//!
//! subscription.unsubscribe();
//! ```

pub mod observable;

pub use observable::{
    Callback, CallbackFailure, FailureHandler, Observable, Pipe, PipeConfig, PipeError,
    Publishable, Subscribable, Subscription, SubscriptionId,
};
