//! Delivery Dispatch
//!
//! Every subscription gets one delivery task that drains its queue. The
//! dispatcher decides which Tokio runtime those tasks run on.
//!
//! # Runtime Selection
//!
//! 1. The runtime named in the pipe's configuration, if any.
//! 2. The runtime the pipe is constructed in, if it is multi-threaded. A
//!    current-thread runtime only makes progress while its owner polls it,
//!    so it is never picked implicitly.
//! 3. A process-wide multi-threaded runtime, started on first use and
//!    shared by every pipe that has no other runtime.
//!
//! # Shutdown
//!
//! A runtime can shut down while a pipe still uses it. A spawn it refuses is
//! detected because the subscription's queue is still unclaimed once the
//! task has already finished; the dispatcher then moves to the shared
//! runtime for that spawn and every later one.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};

use super::error::PipeError;
use super::subscription::{self, SubscriptionState};

// Fallback runtime for pipes without a usable runtime of their own.
static SHARED_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn shared_runtime() -> Result<&'static Runtime, PipeError> {
    if let Some(runtime) = SHARED_RUNTIME.get() {
        return Ok(runtime);
    }

    let runtime = Builder::new_multi_thread()
        .thread_name("conduit-dispatch")
        .enable_all()
        .build()?;

    // A concurrent initializer may have won; the spare runtime is dropped.
    let runtime = SHARED_RUNTIME.get_or_init(|| runtime);
    tracing::debug!("started shared dispatch runtime");
    Ok(runtime)
}

/// Spawns delivery tasks onto a runtime.
pub(crate) struct Dispatcher {
    handle: Mutex<Handle>,
}

impl Dispatcher {
    /// Pick the runtime to dispatch on.
    pub(crate) fn resolve(explicit: Option<Handle>) -> Result<Self, PipeError> {
        let handle = match explicit {
            Some(handle) => handle,
            None => match Handle::try_current() {
                Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => handle,
                _ => shared_runtime()?.handle().clone(),
            },
        };

        Ok(Self {
            handle: Mutex::new(handle),
        })
    }

    /// Start the delivery task for a subscription.
    ///
    /// Fails only if the current runtime refused the task and the shared
    /// runtime is unavailable too.
    pub(crate) fn spawn_delivery<T>(&self, state: &Arc<SubscriptionState<T>>) -> Result<(), PipeError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let handle = self.handle.lock().clone();
        if try_spawn(&handle, state) {
            return Ok(());
        }

        tracing::warn!(
            subscription = %state.id(),
            "dispatch runtime has shut down, moving to the shared runtime"
        );
        let fallback = shared_runtime()?.handle().clone();
        *self.handle.lock() = fallback.clone();

        if try_spawn(&fallback, state) {
            Ok(())
        } else {
            Err(PipeError::RuntimeShutdown)
        }
    }
}

/// Spawn a delivery task, returning `false` if the runtime refused it.
fn try_spawn<T>(handle: &Handle, state: &Arc<SubscriptionState<T>>) -> bool
where
    T: Clone + Send + Sync + 'static,
{
    // Dropping the join handle detaches the task; nothing waits on it.
    let task = handle.spawn(subscription::deliver(Arc::clone(state)));
    !(task.is_finished() && state.inbox_unclaimed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    use crate::observable::subscription::Callback;

    fn worker_thread_name(handle: &Handle) -> Option<String> {
        let task = handle.spawn(async { std::thread::current().name().map(str::to_owned) });
        handle.block_on(task).unwrap()
    }

    fn current(dispatcher: &Dispatcher) -> Handle {
        dispatcher.handle.lock().clone()
    }

    fn subscription() -> Arc<SubscriptionState<i32>> {
        let callback: Callback<i32> = Arc::new(|_| {});
        SubscriptionState::new(callback, Weak::new())
    }

    #[test]
    fn resolves_shared_runtime_outside_tokio() {
        let first = Dispatcher::resolve(None).unwrap();
        let second = Dispatcher::resolve(None).unwrap();

        assert_eq!(current(&first).runtime_flavor(), RuntimeFlavor::MultiThread);
        assert_eq!(worker_thread_name(&current(&first)).as_deref(), Some("conduit-dispatch"));
        assert_eq!(worker_thread_name(&current(&second)).as_deref(), Some("conduit-dispatch"));
    }

    #[test]
    fn explicit_handle_wins() {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("explicit-runtime")
            .build()
            .unwrap();
        let dispatcher = Dispatcher::resolve(Some(runtime.handle().clone())).unwrap();

        assert_eq!(worker_thread_name(&current(&dispatcher)).as_deref(), Some("explicit-runtime"));
    }

    #[tokio::test]
    async fn current_thread_ambient_runtime_is_skipped() {
        let dispatcher = Dispatcher::resolve(None).unwrap();
        let name = current(&dispatcher)
            .spawn(async { std::thread::current().name().map(str::to_owned) })
            .await
            .unwrap();

        assert_eq!(name.as_deref(), Some("conduit-dispatch"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn multi_thread_ambient_runtime_is_used() {
        let dispatcher = Dispatcher::resolve(None).unwrap();
        let name = current(&dispatcher)
            .spawn(async { std::thread::current().name().map(str::to_owned) })
            .await
            .unwrap();

        assert_ne!(name.as_deref(), Some("conduit-dispatch"));
    }

    #[test]
    fn spawn_claims_the_inbox() {
        let dispatcher = Dispatcher::resolve(None).unwrap();
        let state = subscription();

        dispatcher.spawn_delivery(&state).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while state.inbox_unclaimed() && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert!(!state.inbox_unclaimed());
        assert!(state.is_active());
    }

    #[test]
    fn refused_spawn_moves_to_shared_runtime() {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("short-lived")
            .build()
            .unwrap();
        let dispatcher = Dispatcher::resolve(Some(runtime.handle().clone())).unwrap();
        drop(runtime);

        let state = subscription();
        dispatcher.spawn_delivery(&state).unwrap();

        assert!(state.is_active());
        assert_eq!(worker_thread_name(&current(&dispatcher)).as_deref(), Some("conduit-dispatch"));
    }

    #[test]
    fn runtime_shutdown_terminates_running_deliveries() {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let dispatcher = Dispatcher::resolve(Some(runtime.handle().clone())).unwrap();
        let state = subscription();
        dispatcher.spawn_delivery(&state).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while state.inbox_unclaimed() && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        drop(runtime);

        assert!(!state.is_active());
    }
}
