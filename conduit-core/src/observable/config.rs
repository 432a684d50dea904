//! Pipe configuration.

use std::fmt;

use tokio::runtime::Handle;

use super::error::FailureHandler;

/// Construction-time settings for a [`Pipe`](super::Pipe).
///
/// The configuration is moved into the pipe and never changes afterwards.
///
/// # Example
///
/// ```rust,ignore
/// let pipe = Pipe::new(PipeConfig {
///     initial_value: Some(0),
///     send_on_subscribe: true,
///     ..PipeConfig::default()
/// });
/// ```
pub struct PipeConfig<T> {
    /// Value the pipe holds before anything is published.
    pub initial_value: Option<T>,

    /// Deliver the current value to every new subscriber, if one is set.
    /// Without it a subscriber sees nothing until the next publish.
    pub send_on_subscribe: bool,

    /// Receives every subscriber callback failure. Failures are dropped
    /// when this is `None`.
    pub on_callback_failure: Option<FailureHandler>,

    /// Runtime that runs deliveries.
    ///
    /// Defaults to the runtime the pipe is created in, or a process-wide
    /// runtime shared by all pipes when created outside of one.
    pub runtime: Option<Handle>,
}

impl<T> Default for PipeConfig<T> {
    fn default() -> Self {
        Self {
            initial_value: None,
            send_on_subscribe: false,
            on_callback_failure: None,
            runtime: None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PipeConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeConfig")
            .field("initial_value", &self.initial_value)
            .field("send_on_subscribe", &self.send_on_subscribe)
            .field("on_callback_failure", &self.on_callback_failure.is_some())
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_empty() {
        let config: PipeConfig<String> = PipeConfig::default();

        assert!(config.initial_value.is_none());
        assert!(!config.send_on_subscribe);
        assert!(config.on_callback_failure.is_none());
        assert!(config.runtime.is_none());
    }
}
