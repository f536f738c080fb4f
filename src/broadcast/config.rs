//! Broadcaster and consumer configuration

use std::sync::Arc;

/// Callback invoked with a broadcast value.
///
/// Used for both the per-consumer `on_backpressure` hook and the
/// broadcaster-level `post_broadcast` hook. Callbacks run on the dispatcher
/// task between deliveries, so they should return quickly and must not block.
pub type ValueCallback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// Broadcaster-level configuration options
pub struct BroadcasterConfig<T> {
    /// If true, the dispatcher accepts values from construction; if false,
    /// producers are held back until the first consumer registers.
    pub(crate) eager_broadcast: bool,

    /// Invoked with each value after it has been offered to every consumer.
    pub(crate) post_broadcast: Option<ValueCallback<T>>,
}

impl<T> Default for BroadcasterConfig<T> {
    fn default() -> Self {
        Self {
            eager_broadcast: true,
            post_broadcast: None,
        }
    }
}

impl<T> BroadcasterConfig<T> {
    /// Create a config with the defaults (eager broadcast, no hooks)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether the broadcaster accepts values before any consumer exists.
    ///
    /// Defaults to `true`. With `false`, producers feel backpressure from an
    /// absent audience: blocking submits park until the first registration
    /// and non-blocking submits are refused.
    pub fn eager_broadcast(mut self, eager: bool) -> Self {
        self.eager_broadcast = eager;
        self
    }

    /// Shorthand for `eager_broadcast(false)`
    pub fn lazy(self) -> Self {
        self.eager_broadcast(false)
    }

    /// Install a hook invoked with each value once it has been offered to
    /// every consumer that was registered when the value entered dispatch.
    pub fn post_broadcast(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.post_broadcast = Some(Arc::new(hook));
        self
    }
}

/// Per-consumer configuration options
pub struct ConsumerConfig<T> {
    /// Invoked with each value the consumer's channel could not accept.
    pub(crate) on_backpressure: Option<ValueCallback<T>>,

    /// If true, the first refused value permanently removes the consumer.
    pub(crate) disconnect_on_backpressure: bool,
}

impl<T> Default for ConsumerConfig<T> {
    fn default() -> Self {
        Self {
            on_backpressure: None,
            disconnect_on_backpressure: false,
        }
    }
}

impl<T> ConsumerConfig<T> {
    /// Create a config with the defaults (drop silently, stay registered)
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a hook invoked with each value this consumer could not accept
    pub fn on_backpressure(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_backpressure = Some(Arc::new(hook));
        self
    }

    /// Remove this consumer on its first refused value instead of dropping
    /// values for it indefinitely
    pub fn disconnect_on_backpressure(mut self) -> Self {
        self.disconnect_on_backpressure = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcaster_defaults() {
        let config = BroadcasterConfig::<u32>::default();

        assert!(config.eager_broadcast);
        assert!(config.post_broadcast.is_none());
    }

    #[test]
    fn test_lazy_shorthand() {
        let config = BroadcasterConfig::<u32>::new().lazy();

        assert!(!config.eager_broadcast);
    }

    #[test]
    fn test_consumer_defaults() {
        let config = ConsumerConfig::<u32>::default();

        assert!(config.on_backpressure.is_none());
        assert!(!config.disconnect_on_backpressure);
    }

    #[test]
    fn test_builder_chaining() {
        let config = ConsumerConfig::<u32>::new()
            .on_backpressure(|_| {})
            .disconnect_on_backpressure();

        assert!(config.on_backpressure.is_some());
        assert!(config.disconnect_on_backpressure);
    }
}
