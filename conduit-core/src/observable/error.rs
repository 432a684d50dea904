//! Error types for pipes and subscriptions.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::subscription::SubscriptionId;

/// Callback invoked with every subscriber failure on a pipe.
pub type FailureHandler = Arc<dyn Fn(CallbackFailure) + Send + Sync>;

/// A subscriber callback panicked while receiving a value.
///
/// The panic is caught at the point of invocation and never reaches the
/// publisher. The raw payload is kept so a failure handler can downcast it.
#[derive(Error)]
#[error("subscription {subscription} panicked: {message}")]
pub struct CallbackFailure {
    subscription: SubscriptionId,
    message: String,
    payload: Box<dyn Any + Send>,
}

impl CallbackFailure {
    pub(crate) fn from_panic(subscription: SubscriptionId, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Self {
            subscription,
            message,
            payload,
        }
    }

    /// The subscription whose callback failed.
    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// Best-effort text of the panic payload.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The raw panic payload.
    pub fn payload(&self) -> &(dyn Any + Send) {
        &*self.payload
    }

    /// Consume the failure and return the raw panic payload.
    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackFailure")
            .field("subscription", &self.subscription)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Errors raised while constructing a pipe or starting a delivery task.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The shared dispatch runtime could not be started.
    #[error("failed to start dispatch runtime: {0}")]
    Runtime(#[from] std::io::Error),

    /// Every runtime available for delivery has shut down.
    #[error("dispatch runtime has shut down")]
    RuntimeShutdown,
}
