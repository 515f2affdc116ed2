//! Delivery of native notifications to host handlers.

use super::{ChannelHandler, EventReceiver, NotificationHandler};
use crate::decoder::{DecodeOptions, NotificationDecoder};
use crate::native::{HandleKind, RawHandle, ScopedHandle};
use crate::subscriptions::SubscriptionRegistry;
use crate::types::{EventKind, NotificationEvent, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Delivery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Events handed to a handler.
    pub delivered: u64,
    /// Handler calls that returned an error.
    pub handler_errors: u64,
    /// Handler calls that panicked.
    pub handler_panics: u64,
    /// Notifications for identifiers that are no longer registered.
    pub late: u64,
    /// Descriptors that could not be decoded at all.
    pub decode_failures: u64,
    /// Tables skipped during decoding.
    pub partial_tables: u64,
    /// Events dropped by channel handlers created through the dispatcher.
    pub channel_dropped: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    handler_errors: AtomicU64,
    handler_panics: AtomicU64,
    late: AtomicU64,
    decode_failures: AtomicU64,
    partial_tables: AtomicU64,
    channel_dropped: Arc<AtomicU64>,
}

/// Routes notifications arriving on native threads to the registered
/// handler.
///
/// `deliver` is the body of the native callback. It runs on threads owned by
/// the client library and never unwinds into them: decode failures, handler
/// errors and handler panics are logged and counted.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    counters: Counters,
    warn_on_late: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            counters: Counters::default(),
            warn_on_late: true,
        }
    }

    pub fn with_late_warnings(mut self, enabled: bool) -> Self {
        self.warn_on_late = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// A channel handler whose drops show up in [`Dispatcher::stats`].
    pub fn channel(&self, capacity: usize) -> (ChannelHandler, EventReceiver) {
        ChannelHandler::bounded_counted(capacity, Arc::clone(&self.counters.channel_dropped))
    }

    /// Handle one native notification. `context` is the subscription
    /// identifier attached at registration.
    pub fn deliver(&self, context: u64, descriptor: RawHandle) {
        let id = SubscriptionId(context);
        let route = match self.registry.route(id) {
            Some(route) => route,
            None => {
                self.counters.late.fetch_add(1, Ordering::Relaxed);
                if self.warn_on_late {
                    warn!(subscription = %id, "notification for unknown subscription dropped");
                } else {
                    debug!(subscription = %id, "notification for unknown subscription dropped");
                }
                return;
            }
        };

        let client = self.registry.client().as_ref();
        let err = match ScopedHandle::alloc(client, route.env, HandleKind::Error) {
            Ok(err) => err,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                error!(subscription = %id, error = %e, "cannot allocate error handle for notification");
                return;
            }
        };

        let decoded = NotificationDecoder::new(client, route.env, err.handle()).decode(
            descriptor,
            DecodeOptions {
                rowids_requested: route.rowids,
            },
        );
        drop(err);
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                error!(subscription = %id, error = %e, "failed to decode notification");
                return;
            }
        };

        if decoded.skipped_tables > 0 {
            self.counters
                .partial_tables
                .fetch_add(decoded.skipped_tables as u64, Ordering::Relaxed);
        }
        trace!(
            subscription = %id,
            raw_type = decoded.raw_type,
            events = decoded.events.len(),
            "notification decoded"
        );

        for event in &decoded.events {
            self.invoke(route.handler.as_ref(), id, event);
        }

        if decoded.kind == Some(EventKind::Deregistered) {
            self.registry.mark_expired(id);
        }
    }

    /// Call the handler of `id` directly with an already decoded event.
    ///
    /// Returns false if the subscription is not receiving events or the
    /// handler failed.
    pub fn dispatch(&self, id: SubscriptionId, event: &NotificationEvent) -> bool {
        match self.registry.route(id) {
            Some(route) => self.invoke(route.handler.as_ref(), id, event),
            None => {
                self.counters.late.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn invoke(
        &self,
        handler: &dyn NotificationHandler,
        id: SubscriptionId,
        event: &NotificationEvent,
    ) -> bool {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_notification(id, event)));
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(subscription = %id, kind = %event.kind, error = %e, "notification handler failed");
                false
            }
            Err(panic) => {
                self.counters.handler_panics.fetch_add(1, Ordering::Relaxed);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(subscription = %id, kind = %event.kind, panic = %message, "notification handler panicked");
                false
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            handler_panics: c.handler_panics.load(Ordering::Relaxed),
            late: c.late.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            partial_tables: c.partial_tables.load(Ordering::Relaxed),
            channel_dropped: c.channel_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionOptions;
    use crate::dispatch::{handler_fn, HandlerResult};
    use crate::native::{ConnectionContext, NotifyCallback};
    use crate::sim::{SimulatedClient, TableSpec};
    use crate::subscriptions::{RegistrationHandle, SubscriptionState};
    use crate::types::OperationMask;
    use parking_lot::Mutex;

    struct Fixture {
        sim: Arc<SimulatedClient>,
        ctx: ConnectionContext,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let sim = Arc::new(SimulatedClient::new());
        let ctx = sim.connect();
        let registry = Arc::new(SubscriptionRegistry::new(sim.clone()));
        Fixture {
            sim,
            ctx,
            dispatcher: Dispatcher::new(registry),
        }
    }

    fn register(
        f: &Fixture,
        id: u64,
        rowids: bool,
        handler: Arc<dyn NotificationHandler>,
    ) -> RegistrationHandle {
        let callback: NotifyCallback = Arc::new(|_: u64, _: RawHandle| {});
        f.dispatcher
            .registry()
            .register(
                &f.ctx,
                SubscriptionId(id),
                &SubscriptionOptions::default().with_rowids(rowids),
                handler,
                callback,
            )
            .unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<NotificationEvent>>>, Arc<dyn NotificationHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = handler_fn(move |_: SubscriptionId, e: &NotificationEvent| -> HandlerResult {
            sink.lock().push(e.clone());
            Ok(())
        });
        (seen, Arc::new(handler))
    }

    #[test]
    fn test_deliver_object_change() {
        let f = fixture();
        let (seen, handler) = recorder();
        register(&f, 1, true, handler);
        let desc = f.sim.change_descriptor(
            Some("ORCL"),
            &[TableSpec::rows("HR.EMPLOYEES", OperationMask::UPDATE, &["AAAR3KAAEAAAACrAAA"])],
        );

        f.dispatcher.deliver(1, desc);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].table_name(), "HR.EMPLOYEES");
        assert_eq!(seen[0].row_count(), 1);
        assert_eq!(f.dispatcher.stats().delivered, 1);
        // Per-notification error handle is released.
        assert_eq!(f.sim.allocated(HandleKind::Error), 1);
    }

    #[test]
    fn test_unknown_context_is_late() {
        let f = fixture();
        let desc = f.sim.event_descriptor(EventKind::Shutdown, None);
        f.dispatcher.deliver(404, desc);
        let stats = f.dispatcher.stats();
        assert_eq!(stats.late, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[test]
    fn test_handler_error_and_panic_contained() {
        let f = fixture();
        register(
            &f,
            1,
            false,
            Arc::new(handler_fn(|_: SubscriptionId, _: &NotificationEvent| -> HandlerResult {
                Err("downstream unavailable".into())
            })),
        );
        register(
            &f,
            2,
            false,
            Arc::new(handler_fn(|_: SubscriptionId, _: &NotificationEvent| -> HandlerResult {
                panic!("handler bug")
            })),
        );
        let desc = f.sim.event_descriptor(EventKind::Shutdown, None);

        f.dispatcher.deliver(1, desc);
        f.dispatcher.deliver(2, desc);
        let stats = f.dispatcher.stats();
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.handler_panics, 1);
        assert_eq!(stats.delivered, 2);
    }

    #[test]
    fn test_dereg_marks_expired() {
        let f = fixture();
        let (seen, handler) = recorder();
        register(&f, 5, false, handler);
        let desc = f.sim.event_descriptor(EventKind::Deregistered, None);

        f.dispatcher.deliver(5, desc);
        assert_eq!(seen.lock()[0].kind, EventKind::Deregistered);
        assert_eq!(
            f.dispatcher.registry().state(SubscriptionId(5)),
            SubscriptionState::Expired
        );

        // Nothing is delivered after expiry.
        f.dispatcher.deliver(5, f.sim.event_descriptor(EventKind::Shutdown, None));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(f.dispatcher.stats().late, 1);
    }

    #[test]
    fn test_decode_failure_counted() {
        let f = fixture();
        let (seen, handler) = recorder();
        register(&f, 1, false, handler);
        f.dispatcher.deliver(1, RawHandle(0xdead));
        assert!(seen.lock().is_empty());
        assert_eq!(f.dispatcher.stats().decode_failures, 1);
    }

    #[test]
    fn test_partial_tables_counted() {
        let f = fixture();
        let (seen, handler) = recorder();
        register(&f, 1, true, handler);
        let desc = f.sim.change_descriptor(
            None,
            &[
                TableSpec::broken("HR.DEPARTMENTS", OperationMask::DELETE),
                TableSpec::rollup("HR.JOBS", OperationMask::ALTER),
            ],
        );
        f.dispatcher.deliver(1, desc);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(f.dispatcher.stats().partial_tables, 1);
    }

    #[test]
    fn test_dispatch_direct() {
        let f = fixture();
        let (seen, handler) = recorder();
        register(&f, 3, false, handler);
        let event = NotificationEvent::database_event(EventKind::Startup, None);
        assert!(f.dispatcher.dispatch(SubscriptionId(3), &event));
        assert!(!f.dispatcher.dispatch(SubscriptionId(4), &event));
        assert_eq!(seen.lock().len(), 1);
    }
}
