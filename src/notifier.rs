//! Top-level entry point tying registry, binder and dispatcher together.

use crate::config::{NotifierConfig, SubscriptionOptions};
use crate::dispatch::{
    DispatchStats, Dispatcher, EventReceiver, FlatHandler, HostCallback,
    NotificationHandler,
};
use crate::error::Result;
use crate::native::{ConnectionContext, NativeClient, NotifyCallback, RawHandle};
use crate::subscriptions::{
    RegistrationHandle, SubscriptionInfo, SubscriptionRegistry, SubscriptionState,
};
use crate::types::SubscriptionId;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Change notification service over one native client.
///
/// Cheap to share behind an `Arc`; every method takes `&self` and may be
/// called from any thread.
pub struct ChangeNotifier {
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    config: NotifierConfig,
}

impl ChangeNotifier {
    pub fn new(client: Arc<dyn NativeClient>) -> Self {
        Self::with_config(client, NotifierConfig::default())
    }

    pub fn with_config(client: Arc<dyn NativeClient>, config: NotifierConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(client));
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::clone(&registry)).with_late_warnings(config.warn_on_late),
        );
        Self {
            registry,
            dispatcher,
            config,
        }
    }

    /// Native callback that forwards into the dispatcher.
    ///
    /// Holds the dispatcher weakly so a subscription left registered on the
    /// server does not keep the notifier alive; once it is gone, late
    /// callbacks are dropped.
    fn native_callback(&self) -> NotifyCallback {
        let dispatcher: Weak<Dispatcher> = Arc::downgrade(&self.dispatcher);
        Arc::new(move |context: u64, descriptor: RawHandle| {
            match dispatcher.upgrade() {
                Some(dispatcher) => dispatcher.deliver(context, descriptor),
                None => debug!(context, "notification after notifier shutdown"),
            }
        })
    }

    /// Register a subscription whose events go to `handler`.
    pub fn register_subscription(
        &self,
        ctx: &ConnectionContext,
        id: SubscriptionId,
        options: &SubscriptionOptions,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<RegistrationHandle> {
        self.registry
            .register(ctx, id, options, handler, self.native_callback())
    }

    /// Register a subscription whose events are queued on a bounded channel
    /// sized by [`NotifierConfig::channel_buffer`].
    pub fn register_with_channel(
        &self,
        ctx: &ConnectionContext,
        id: SubscriptionId,
        options: &SubscriptionOptions,
    ) -> Result<(RegistrationHandle, EventReceiver)> {
        let (handler, receiver) = self.dispatcher.channel(self.config.channel_buffer);
        let handle = self.register_subscription(ctx, id, options, Arc::new(handler))?;
        Ok((handle, receiver))
    }

    /// Register a subscription that reports through the flat callback shape.
    pub fn register_host_callback<C: HostCallback>(
        &self,
        ctx: &ConnectionContext,
        id: SubscriptionId,
        options: &SubscriptionOptions,
        callback: C,
    ) -> Result<RegistrationHandle> {
        self.register_subscription(ctx, id, options, Arc::new(FlatHandler(callback)))
    }

    pub fn bind_statement(&self, handle: &RegistrationHandle, statement: RawHandle) -> Result<()> {
        self.registry.bind_statement(handle, statement)
    }

    /// Bind and execute a statement so its objects are watched.
    pub fn register_query(&self, handle: &RegistrationHandle, statement: RawHandle) -> Result<()> {
        self.registry.register_query(handle, statement)
    }

    pub fn unregister_subscription(&self, handle: &RegistrationHandle) -> Result<()> {
        self.registry.unregister(handle)
    }

    /// Drop local state of every subscription on a connection being closed.
    pub fn release_connection(&self, ctx: &ConnectionContext) -> usize {
        self.registry.release_connection(ctx)
    }

    pub fn state(&self, id: SubscriptionId) -> SubscriptionState {
        self.registry.state(id)
    }

    pub fn info(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.registry.info(id)
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
